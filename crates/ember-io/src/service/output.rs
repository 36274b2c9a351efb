//! 发送路径：全局发送队列的按需消费者把载荷拷入带尾注的发送页，按
//! 套接字合并成批后落到每工作线程的发送环；回收循环统一收割完成、
//! 归还页面并上报错误。

use core::cell::RefCell;
use core::sync::atomic::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use io_uring::{IoUring, cqueue, opcode, types};
use parking_lot::Mutex;

use super::network::ServiceCore;
use super::user_data::{MODE_SEND, SocketId, UserData};
use crate::error::Error;
use crate::page::{PageAllocator, SendBufferFooter};

const TARGET: &str = "ember_io::service::output";

/// 一个工作线程的发送环；提交方与回收循环通过互斥锁分时访问。
pub(crate) struct WorkerRing {
    pub(crate) ring: Mutex<IoUring>,
}

/// 全部发送环的注册表，回收循环据此遍历。
#[derive(Default)]
pub(crate) struct OutputRegistry {
    pub(crate) rings: Mutex<Vec<Arc<WorkerRing>>>,
}

thread_local! {
    static LOCAL_RINGS: RefCell<HashMap<usize, Arc<WorkerRing>>> =
        RefCell::new(HashMap::new());
}

/// 取得（必要时惰性创建）当前线程的发送环。
///
/// 环以 `SINGLE_ISSUER | SUBMIT_ALL` 建立：提交恒发生在本线程。
pub(crate) fn ensure_local_output_ring(core: &Arc<ServiceCore>) -> Arc<WorkerRing> {
    let key = Arc::as_ptr(core) as usize;
    if let Some(worker_ring) = LOCAL_RINGS.with_borrow(|rings| rings.get(&key).cloned()) {
        return worker_ring;
    }
    let mut builder = IoUring::builder();
    builder.setup_submit_all().setup_single_issuer();
    match builder.build(core.options.output_ring_capacity()) {
        Ok(ring) => {
            let worker_ring = Arc::new(WorkerRing {
                ring: Mutex::new(ring),
            });
            core.output_rings.rings.lock().push(worker_ring.clone());
            LOCAL_RINGS.with_borrow_mut(|rings| rings.insert(key, worker_ring.clone()));
            worker_ring
        }
        Err(error) => {
            tracing::error!(target: TARGET, %error, "创建发送环失败");
            std::process::abort();
        }
    }
}

struct MergedTask {
    socket_id: SocketId,
    iovs: Vec<(usize, usize)>,
}

/// 发送队列的按需消费者：排空队列、按套接字合并、落环提交。
pub(crate) fn consume_output_queue(core: Arc<ServiceCore>) {
    let worker_ring = ensure_local_output_ring(&core);
    let mut merged: HashMap<i32, MergedTask> = HashMap::new();
    let mut events = 1usize;
    loop {
        if let Some(task) = core.output_queue.try_pop::<false, false>() {
            let socket_id = task.user_data.socket_id();
            let merged_task = merged.entry(socket_id.fd()).or_insert_with(|| MergedTask {
                socket_id,
                iovs: Vec::new(),
            });
            if socket_id.version() < merged_task.socket_id.version() {
                continue;
            }
            append_to_iovec(&core, &task.entry, &mut merged_task.iovs);
            continue;
        }

        for (_fd, mut merged_task) in merged.drain() {
            flush_socket(&core, &worker_ring, &mut merged_task);
        }

        match core
            .output_events
            .compare_exchange(events, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => break,
            Err(current) => events = current,
        }
    }
}

/// 把载荷按发送页大小切块拷入新分配的发送缓冲。
fn append_to_iovec(core: &ServiceCore, entry: &Bytes, iovs: &mut Vec<(usize, usize)>) {
    for chunk in entry.chunks(core.send_buffer_size) {
        let page = core.send_allocator.allocate();
        // SAFETY: 新页独占，chunk 长度不超过发送页大小。
        unsafe {
            core::ptr::copy_nonoverlapping(chunk.as_ptr(), page, chunk.len());
        }
        iovs.push((page as usize, chunk.len()));
    }
}

/// 相邻小块能装进一页时就地合并，省下多余的 SQE 与页面。
fn merge_small_buffers(core: &ServiceCore, iovs: &mut Vec<(usize, usize)>) {
    if iovs.len() <= 1 {
        return;
    }
    let capacity = core.send_buffer_size;
    let mut compacted: Vec<(usize, usize)> = Vec::with_capacity(iovs.len());
    for (address, len) in iovs.drain(..) {
        if let Some((kept_address, kept_len)) = compacted.last_mut()
            && *kept_len + len <= capacity
        {
            // SAFETY: 目标页剩余空间足够，源页独占且不重叠。
            unsafe {
                core::ptr::copy_nonoverlapping(
                    address as *const u8,
                    (*kept_address as *mut u8).add(*kept_len),
                    len,
                );
            }
            *kept_len += len;
            core.send_allocator.deallocate(address as *mut u8);
            continue;
        }
        compacted.push((address, len));
    }
    *iovs = compacted;
}

fn flush_socket(core: &Arc<ServiceCore>, worker_ring: &WorkerRing, merged_task: &mut MergedTask) {
    if merged_task.iovs.is_empty() {
        return;
    }
    merge_small_buffers(core, &mut merged_task.iovs);

    // 过期发送：套接字版本已被关闭路径推进，整批丢弃并归还页面
    let current_version = core
        .socket(merged_task.socket_id.fd())
        .map(|socket_data| socket_data.version.load(Ordering::Acquire));
    if current_version != Some(merged_task.socket_id.version()) {
        tracing::debug!(
            target: TARGET,
            socket_id = %merged_task.socket_id,
            "丢弃过期发送"
        );
        for (address, _len) in merged_task.iovs.drain(..) {
            core.send_allocator.deallocate(address as *mut u8);
        }
        return;
    }

    let mut ring = worker_ring.ring.lock();
    for (address, len) in merged_task.iovs.drain(..) {
        core.send_allocator.write_footer(
            address as *mut u8,
            SendBufferFooter {
                socket_id: merged_task.socket_id,
            },
        );
        let entry = opcode::Send::new(
            types::Fd(merged_task.socket_id.fd()),
            address as *const u8,
            len as u32,
        )
        .build()
        .user_data(UserData::for_buffer(MODE_SEND, address as *mut u8).raw());
        loop {
            // SAFETY: 发送缓冲在完成回收之前保持有效。
            if unsafe { ring.submission().push(&entry) }.is_ok() {
                break;
            }
            if let Err(error) = ring.submit() {
                tracing::error!(target: TARGET, %error, "发送环提交失败");
                std::process::abort();
            }
        }
    }
    if let Err(error) = ring.submit() {
        tracing::error!(target: TARGET, %error, "发送环提交失败");
        std::process::abort();
    }
}

/// 回收循环：轮询全部发送环的完成队列，归还缓冲并上报失败。
pub(crate) fn reclaim_loop(core: Arc<ServiceCore>) {
    let cq_budget = core.options.output_ring_capacity() as usize;
    while core.running.load(Ordering::Relaxed) {
        let mut overflow = false;
        let rings: Vec<Arc<WorkerRing>> = core.output_rings.rings.lock().clone();
        for worker_ring in rings {
            let completions: Vec<(u64, i32, u32)> = {
                let mut ring = worker_ring.ring.lock();
                ring.completion()
                    .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
                    .collect()
            };
            if completions.len() >= cq_budget {
                overflow = true;
            }
            for (raw, result, flags) in completions {
                reclaim_send_buffer(&core, UserData::from_raw(raw), result, flags);
            }
        }
        if !overflow {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn reclaim_send_buffer(core: &Arc<ServiceCore>, user_data: UserData, result: i32, flags: u32) {
    let buffer = user_data.buffer();
    let socket_id = core.send_allocator.read_footer(buffer).socket_id;
    if result < 0 {
        // 发送失败：推进版本号使后续在途发送失效，并上报一次
        if let Some(socket_data) = core.socket(socket_id.fd()) {
            let _ = socket_data.version.compare_exchange(
                socket_id.version(),
                socket_id.version().wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        (core.on_error)(socket_id, Error::from_raw(-result));
    }
    if !cqueue::more(flags) {
        core.send_allocator.deallocate(buffer);
    }
}
