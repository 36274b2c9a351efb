//! 输入驱动：持有输入环的单任务循环，编排 multishot accept/recv、
//! eventfd 提交信号与每套接字接收消费者。

use core::sync::atomic::Ordering;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::Bytes;
use io_uring::{IoUring, cqueue, opcode, types};

use ember_core::{Executor, TaskExecutorExt, yield_now};

use super::buffer_ring::BufferRing;
use super::network::{ReceiveTask, ServiceCore};
use super::output;
use super::user_data::{
    MODE_ACCEPT, MODE_CLOSE, MODE_POLL, MODE_RECV, MODE_SHUTDOWN, SocketId, UserData,
};
use crate::cord::Cord;
use crate::error::Error;
use crate::page::PageAllocator;

pub(crate) const BUF_GROUP: u16 = 0;

const TARGET: &str = "ember_io::service::input";

/// buffer ring 槽位当前挂载的页面地址表（以 usize 保存以便跨 await）。
pub(crate) struct Buffers(pub(crate) Vec<usize>);

/// 接收页的所有者守卫：片段析构时把页面还给分配器。
struct PageGuard {
    address: usize,
    len: usize,
    allocator: Arc<dyn PageAllocator>,
}

impl AsRef<[u8]> for PageGuard {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: 页面在守卫存续期内独占，长度为内核实际写入的字节数。
        unsafe { core::slice::from_raw_parts(self.address as *const u8, self.len) }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.allocator.deallocate(self.address as *mut u8);
    }
}

/// 输入环驱动循环。
///
/// 待提交操作先进 `submissions` 平铺向量（压平“完成里递归提交”的链），
/// 环满时停在第一个失败处；收割完成后若没有新的用户提交，等待池内任务
/// 排空再进入阻塞收割。
pub(crate) async fn input_loop(
    core: Arc<ServiceCore>,
    mut ring: IoUring,
    mut buffer_ring: BufferRing,
    mut buffers: Buffers,
) {
    let eventfd = core.submission_eventfd;
    let mut submissions: Vec<UserData> =
        vec![UserData::for_socket(MODE_POLL, SocketId::new(eventfd, 0))];
    let mut submitted = 0usize;
    let mut last_events = 0u64;
    let mut completions: Vec<(u64, i32, u32)> = Vec::new();

    while core.running.load(Ordering::Relaxed) {
        if submissions.is_empty() {
            last_events = core.submission_events.load(Ordering::Acquire);
            core.submission_queue.try_pop_n::<false, _>(
                |drain| {
                    for user_data in drain {
                        submissions.push(user_data);
                    }
                },
                core.submission_queue.capacity(),
            );
        }

        while submitted < submissions.len() {
            let user_data = submissions[submitted];
            let prepared = match user_data.mode() {
                MODE_POLL => prepare_poll(&mut ring, user_data),
                MODE_ACCEPT => prepare_accept(&mut ring, user_data),
                MODE_RECV => prepare_receive(&mut ring, user_data),
                MODE_SHUTDOWN => prepare_shutdown(&core, &mut ring, user_data),
                MODE_CLOSE => prepare_close(&core, &mut ring, user_data),
                mode => {
                    tracing::error!(target: TARGET, mode, "未知的提交类型");
                    std::process::abort();
                }
            };
            if !prepared {
                break;
            }
            submitted += 1;
        }

        if let Err(error) = ring.submit() {
            tracing::error!(target: TARGET, %error, "io_uring 提交失败");
            std::process::abort();
        }

        completions.clear();
        for cqe in ring.completion() {
            completions.push((cqe.user_data(), cqe.result(), cqe.flags()));
        }
        for (raw, result, flags) in completions.drain(..) {
            let user_data = UserData::from_raw(raw);
            match user_data.mode() {
                MODE_POLL => on_poll(eventfd, user_data, result, flags, &mut submissions),
                MODE_ACCEPT => on_accept(&core, user_data, result, flags, &mut submissions),
                MODE_RECV => on_receive(
                    &core,
                    &mut buffer_ring,
                    &mut buffers,
                    user_data,
                    result,
                    flags,
                    &mut submissions,
                ),
                MODE_SHUTDOWN => on_shutdown(&core, user_data, result, &mut submissions),
                MODE_CLOSE => on_close(user_data, result),
                mode => {
                    tracing::error!(target: TARGET, mode, result, "未知的完成类型");
                    std::process::abort();
                }
            }
        }

        if submitted != submissions.len() {
            continue;
        }
        submissions.clear();
        submitted = 0;
        if core
            .submission_events
            .compare_exchange(last_events, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }

        // 池内还有排队任务时保持让出，避免驱动独占线程后陷入阻塞收割
        while core.executor.local_task_number() > 0 {
            yield_now().await;
        }
        output::ensure_local_output_ring(&core);
        if let Err(error) = ring.submit_and_wait(1) {
            tracing::error!(target: TARGET, %error, "io_uring 等待完成失败");
            std::process::abort();
        }
    }

    // 退出清理：先解除注册与环，再归还 buffer ring 页面
    let _ = ring.submitter().unregister_buf_ring(BUF_GROUP);
    drop(ring);
    drop(buffer_ring);
    for address in buffers.0.iter() {
        if *address != 0 {
            core.page_allocator.deallocate(*address as *mut u8);
        }
    }
}

fn prepare_poll(ring: &mut IoUring, user_data: UserData) -> bool {
    let entry = opcode::PollAdd::new(
        types::Fd(user_data.socket_id().fd()),
        libc::POLLIN as u32,
    )
    .multi(true)
    .build()
    .user_data(user_data.raw());
    // SAFETY: eventfd 在服务生命周期内保持打开。
    unsafe { ring.submission().push(&entry) }.is_ok()
}

fn prepare_accept(ring: &mut IoUring, user_data: UserData) -> bool {
    let entry = opcode::AcceptMulti::new(types::Fd(user_data.socket_id().fd()))
        .build()
        .user_data(user_data.raw());
    tracing::debug!(target: TARGET, socket_id = %user_data.socket_id(), "提交 multishot accept");
    // SAFETY: 监听 fd 由调用方保证存活。
    unsafe { ring.submission().push(&entry) }.is_ok()
}

fn prepare_receive(ring: &mut IoUring, user_data: UserData) -> bool {
    let entry = opcode::RecvMulti::new(types::Fd(user_data.socket_id().fd()), BUF_GROUP)
        .build()
        .user_data(user_data.raw());
    tracing::debug!(target: TARGET, socket_id = %user_data.socket_id(), "提交 multishot recv");
    // SAFETY: 缓冲由 buffer ring 提供，无用户态指针。
    unsafe { ring.submission().push(&entry) }.is_ok()
}

fn prepare_shutdown(core: &Arc<ServiceCore>, ring: &mut IoUring, user_data: UserData) -> bool {
    let socket_id = user_data.socket_id();
    let Some(socket_data) = core.socket(socket_id.fd()) else {
        return true;
    };
    if socket_data.version.load(Ordering::Acquire) != socket_id.version() {
        tracing::debug!(target: TARGET, %socket_id, "丢弃过期的 shutdown");
        return true;
    }
    let entry = opcode::Shutdown::new(types::Fd(socket_id.fd()), libc::SHUT_RDWR)
        .build()
        .user_data(user_data.raw());
    // SAFETY: fd 在 close 完成前有效。
    if unsafe { ring.submission().push(&entry) }.is_err() {
        return false;
    }
    // 版本推进使在途发送与重复关闭全部失效
    socket_data.version.fetch_add(1, Ordering::AcqRel);
    tracing::debug!(target: TARGET, %socket_id, "提交 shutdown");
    true
}

fn prepare_close(core: &Arc<ServiceCore>, ring: &mut IoUring, user_data: UserData) -> bool {
    let socket_id = user_data.socket_id();
    let Some(socket_data) = core.socket(socket_id.fd()) else {
        return true;
    };
    if socket_data.version.load(Ordering::Acquire) != socket_id.version() {
        tracing::debug!(target: TARGET, %socket_id, "丢弃过期的 close");
        return true;
    }
    let entry = opcode::Close::new(types::Fd(socket_id.fd()))
        .build()
        .user_data(user_data.raw());
    // SAFETY: close 是 fd 的最后一次使用。
    unsafe { ring.submission().push(&entry) }.is_ok()
}

fn on_poll(
    eventfd: RawFd,
    user_data: UserData,
    result: i32,
    flags: u32,
    submissions: &mut Vec<UserData>,
) {
    if !cqueue::more(flags) {
        submissions.push(user_data);
    }
    if result < 0 {
        tracing::error!(target: TARGET, result, "提交 eventfd 的 poll 失败");
        std::process::abort();
    }
    let mut counter: u64 = 0;
    // SAFETY: 非阻塞 eventfd，读取仅清零计数；EAGAIN 被有意忽略。
    unsafe {
        libc::read(
            eventfd,
            &mut counter as *mut u64 as *mut libc::c_void,
            core::mem::size_of::<u64>(),
        );
    }
}

fn on_accept(
    core: &Arc<ServiceCore>,
    user_data: UserData,
    result: i32,
    flags: u32,
    submissions: &mut Vec<UserData>,
) {
    if !cqueue::more(flags) {
        submissions.push(user_data);
    }
    if result >= 0 {
        let socket_data = core.ensure_socket(result);
        let socket_id = SocketId::new(result, socket_data.version.load(Ordering::Acquire));
        submissions.push(UserData::for_socket(MODE_RECV, socket_id));
        (core.on_accept)(socket_id);
        return;
    }
    tracing::error!(
        target: TARGET,
        socket_id = %user_data.socket_id(),
        error = %Error::from_raw(-result),
        "accept 失败"
    );
    std::process::abort();
}

fn on_receive(
    core: &Arc<ServiceCore>,
    buffer_ring: &mut BufferRing,
    buffers: &mut Buffers,
    user_data: UserData,
    result: i32,
    flags: u32,
    submissions: &mut Vec<UserData>,
) {
    let socket_id = user_data.socket_id();
    if result > 0 {
        let Some(buffer_id) = cqueue::buffer_select(flags) else {
            tracing::error!(target: TARGET, %socket_id, "recv 完成缺少缓冲索引");
            std::process::abort();
        };
        let address = buffers.0[buffer_id as usize];
        let guard = PageGuard {
            address,
            len: result as usize,
            allocator: core.page_allocator.clone(),
        };
        add_to_input_queue(core, socket_id, Cord::from(Bytes::from_owner(guard)));
        // 槽位换上新页并重新发布
        let page = core.page_allocator.allocate();
        buffers.0[buffer_id as usize] = page as usize;
        buffer_ring.push(page, core.page_size as u32, buffer_id);
        buffer_ring.commit();
        if !cqueue::more(flags) {
            submissions.push(user_data);
        }
        return;
    }
    if result == 0 {
        add_to_input_queue(core, socket_id, Cord::new());
        return;
    }
    if result == -libc::ECONNRESET {
        (core.on_error)(socket_id, Error::from_raw(-result));
        return;
    }
    if result == -libc::ENOBUFS {
        submissions.push(user_data);
        return;
    }
    tracing::error!(
        target: TARGET,
        %socket_id,
        error = %Error::from_raw(-result),
        "recv 失败"
    );
    std::process::abort();
}

fn on_shutdown(
    core: &Arc<ServiceCore>,
    user_data: UserData,
    result: i32,
    submissions: &mut Vec<UserData>,
) {
    if result != 0 && result != -libc::ENOTCONN {
        tracing::error!(
            target: TARGET,
            socket_id = %user_data.socket_id(),
            error = %Error::from_raw(-result),
            "shutdown 失败"
        );
        std::process::abort();
    }
    let fd = user_data.socket_id().fd();
    let version = core
        .socket(fd)
        .map(|socket_data| socket_data.version.load(Ordering::Acquire))
        .unwrap_or(0);
    // close 携带推进后的版本号以通过过期检查
    submissions.push(UserData::for_socket(MODE_CLOSE, SocketId::new(fd, version)));
    tracing::info!(target: TARGET, socket_id = %user_data.socket_id(), "shutdown 完成，转入 close");
}

fn on_close(user_data: UserData, result: i32) {
    if result < 0 {
        tracing::error!(
            target: TARGET,
            socket_id = %user_data.socket_id(),
            error = %Error::from_raw(-result),
            "close 失败"
        );
        std::process::abort();
    }
    tracing::info!(target: TARGET, socket_id = %user_data.socket_id(), "close 完成");
}

/// 数据进入每套接字接收队列；0→1 跃迁时调度该套接字的消费任务。
fn add_to_input_queue(core: &Arc<ServiceCore>, socket_id: SocketId, data: Cord) {
    if core.on_receive.is_none() {
        return;
    }
    let Some(socket_data) = core.socket(socket_id.fd()) else {
        return;
    };
    socket_data
        .input_queue
        .push::<false, false, false>(ReceiveTask { socket_id, data });
    if socket_data.input_events.fetch_add(1, Ordering::AcqRel) == 0 {
        let consumer_core = core.clone();
        let consumer_socket = socket_data.clone();
        let executor: Arc<dyn Executor> = core.executor.clone();
        if executor
            .submit_task(ember_core::Task::new(consume_input_queue(
                consumer_core,
                consumer_socket,
            )))
            .is_err()
        {
            let mut events = 1usize;
            loop {
                match socket_data.input_events.compare_exchange(
                    events,
                    0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(current) => events = current,
                }
            }
            tracing::warn!(target: TARGET, %socket_id, "接收消费任务被执行器拒绝");
        }
    }
}

/// 每套接字接收消费者：合并片段、按 EOF 边界切轮次并交付用户回调。
async fn consume_input_queue(core: Arc<ServiceCore>, socket_data: Arc<super::network::SocketData>) {
    let Some(on_receive) = core.on_receive.as_ref() else {
        return;
    };
    let mut events = socket_data.input_events.load(Ordering::Acquire);
    loop {
        let mut batch: Vec<ReceiveTask> = Vec::new();
        let popped = socket_data.input_queue.try_pop_n::<false, _>(
            |drain| batch.extend(drain),
            socket_data.input_queue.capacity(),
        );
        if popped != 0 {
            let mut accum = {
                let mut guard = socket_data.accumulation.lock();
                core::mem::take(&mut *guard)
            };
            let mut rounds: Vec<(SocketId, Cord, bool)> = Vec::new();
            for task in batch {
                if accum.socket_id.is_none() {
                    accum.socket_id = Some(task.socket_id);
                }
                if task.data.is_empty() {
                    let socket_id = accum.socket_id.take().expect("EOF 轮次必然已有归属");
                    rounds.push((socket_id, core::mem::take(&mut accum.data), true));
                } else {
                    accum.data.append_cord(task.data);
                }
            }
            for (socket_id, mut data, finished) in rounds {
                on_receive(socket_id, &mut data, finished).await;
            }
            if let Some(socket_id) = accum.socket_id {
                let mut data = core::mem::take(&mut accum.data);
                on_receive(socket_id, &mut data, false).await;
                // 用户未消费的前缀保留到下一轮继续累积
                let mut guard = socket_data.accumulation.lock();
                guard.socket_id = Some(socket_id);
                guard.data = data;
            }
            events = socket_data.input_events.load(Ordering::Acquire);
        } else {
            match socket_data.input_events.compare_exchange(
                events,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => events = current,
            }
        }
    }
}
