//! 网络服务主体：配置、生命周期与提交面。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：对外暴露一个进程级服务：`accept` 托管监听套接字、
//!   `send` 异步回写、回调交付接收数据；内部把 io_uring 的环与缓冲编排
//!   收拢在启动时构造的核心状态里。
//! - **逻辑 (How)**：`start` 前通过 setter 注入执行器、页面分配器与三个
//!   用户回调；`start` 建输入环（`SETUP_SUBMIT_ALL`）、注册稀疏文件表、
//!   创建提交 eventfd 与 buffer ring，然后在执行器上派发输入驱动任务与
//!   发送缓冲回收循环。
//! - **契约 (What)**：`start` 之前的 `accept`/`send`/`shutdown` 返回
//!   未启动错误；`stop` 置停机标志、敲醒输入驱动并等待两个服务任务收尾。

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use ember_core::{
    ConcurrentBoundedQueue, Executor, ExecutorExt, Task, TaskExecutorExt, ThreadPoolExecutor,
};

use super::buffer_ring::BufferRing;
use super::user_data::{MODE_ACCEPT, MODE_SEND, MODE_SHUTDOWN, SocketId, UserData};
use super::{NetworkServiceOptions, input, output};
use crate::cord::Cord;
use crate::error::{Error, ServiceError};
use crate::page::{CachedPageAllocator, PageAllocator, SendBufferAllocator, SystemPageAllocator};

pub(crate) type AcceptCallback = Box<dyn Fn(SocketId) + Send + Sync>;
pub(crate) type ReceiveCallback = Box<dyn Fn(SocketId, &mut Cord, bool) -> Task<()> + Send + Sync>;
pub(crate) type ErrorCallback = Box<dyn Fn(SocketId, Error) + Send + Sync>;

/// 每套接字状态：版本号、接收队列与单消费者事件计数。
pub(crate) struct SocketData {
    pub(crate) version: AtomicU8,
    pub(crate) input_queue: ConcurrentBoundedQueue<ReceiveTask>,
    pub(crate) input_events: AtomicUsize,
    pub(crate) accumulation: Mutex<ReceiveAccum>,
}

impl SocketData {
    fn new(input_queue_capacity: usize) -> Self {
        Self {
            version: AtomicU8::new(0),
            input_queue: ConcurrentBoundedQueue::new(input_queue_capacity),
            input_events: AtomicUsize::new(0),
            accumulation: Mutex::new(ReceiveAccum::default()),
        }
    }
}

/// 接收队列里的一个片段；空 Cord 标记 EOF。
pub(crate) struct ReceiveTask {
    pub(crate) socket_id: SocketId,
    pub(crate) data: Cord,
}

/// 跨消费者激活保留的接收累积。
#[derive(Default)]
pub(crate) struct ReceiveAccum {
    pub(crate) socket_id: Option<SocketId>,
    pub(crate) data: Cord,
}

/// 发送队列里的一个条目。
pub(crate) struct OutputTask {
    pub(crate) user_data: UserData,
    pub(crate) entry: Bytes,
}

/// 启动后不再变化的服务核心状态，被输入驱动、发送消费者与回收循环共享。
pub(crate) struct ServiceCore {
    pub(crate) executor: Arc<ThreadPoolExecutor>,
    pub(crate) page_allocator: Arc<dyn PageAllocator>,
    pub(crate) send_allocator: Arc<SendBufferAllocator>,
    pub(crate) on_accept: AcceptCallback,
    pub(crate) on_receive: Option<ReceiveCallback>,
    pub(crate) on_error: ErrorCallback,
    pub(crate) options: NetworkServiceOptions,
    pub(crate) page_size: usize,
    pub(crate) send_buffer_size: usize,
    pub(crate) submission_queue: ConcurrentBoundedQueue<UserData>,
    pub(crate) submission_events: AtomicU64,
    pub(crate) submission_eventfd: RawFd,
    pub(crate) output_queue: ConcurrentBoundedQueue<OutputTask>,
    pub(crate) output_events: AtomicUsize,
    pub(crate) output_rings: output::OutputRegistry,
    pub(crate) sockets: RwLock<Vec<Option<Arc<SocketData>>>>,
    pub(crate) running: AtomicBool,
}

impl ServiceCore {
    /// 取得（必要时补建）fd 对应的套接字槽位。
    pub(crate) fn ensure_socket(&self, fd: i32) -> Arc<SocketData> {
        let index = fd as usize;
        {
            let sockets = self.sockets.read();
            if let Some(Some(socket_data)) = sockets.get(index) {
                return socket_data.clone();
            }
        }
        let mut sockets = self.sockets.write();
        if sockets.len() <= index {
            sockets.resize_with(index + 1, || None);
        }
        sockets[index]
            .get_or_insert_with(|| {
                Arc::new(SocketData::new(self.options.input_queue_capacity()))
            })
            .clone()
    }

    pub(crate) fn socket(&self, fd: i32) -> Option<Arc<SocketData>> {
        self.sockets.read().get(fd as usize)?.clone()
    }

    /// 向提交队列登记一个操作，并在 0→1 跃迁时敲醒输入驱动。
    pub(crate) fn submit_user_data(&self, user_data: UserData) {
        self.submission_queue.push::<true, false, false>(user_data);
        self.signal_submission_events();
    }

    pub(crate) fn signal_submission_events(&self) {
        if self.submission_events.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.wake_input_loop();
    }

    pub(crate) fn wake_input_loop(&self) {
        let event: u64 = 1;
        // SAFETY: eventfd 在服务生命周期内保持打开，写入 8 字节计数。
        let written = unsafe {
            libc::write(
                self.submission_eventfd,
                &event as *const u64 as *const libc::c_void,
                core::mem::size_of::<u64>(),
            )
        };
        if written != core::mem::size_of::<u64>() as isize {
            tracing::error!(
                target: "ember_io::service",
                error = %Error::last_os(),
                "写入提交 eventfd 失败"
            );
            std::process::abort();
        }
    }
}

impl Drop for ServiceCore {
    fn drop(&mut self) {
        if self.submission_eventfd >= 0 {
            // SAFETY: fd 归本服务所有，只关闭一次。
            unsafe {
                libc::close(self.submission_eventfd);
            }
        }
    }
}

struct ServiceConfig {
    executor: Option<Arc<ThreadPoolExecutor>>,
    page_allocator: Option<Arc<dyn PageAllocator>>,
    on_accept: Option<AcceptCallback>,
    on_receive: Option<ReceiveCallback>,
    on_error: Option<ErrorCallback>,
    options: NetworkServiceOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            executor: None,
            page_allocator: None,
            on_accept: None,
            on_receive: None,
            on_error: None,
            options: NetworkServiceOptions::default(),
        }
    }
}

fn default_on_accept(socket_id: SocketId) {
    tracing::info!(target: "ember_io::service", %socket_id, "接受新连接");
}

fn default_on_error(socket_id: SocketId, error: Error) {
    tracing::warn!(target: "ember_io::service", %socket_id, %error, "套接字出错");
}

/// io_uring 网络服务。
///
/// 进程级单例通过 [`NetworkIoService::instance`] 获取；测试可用
/// [`NetworkIoService::new`] 构造独立实例。所有 `set_*` 必须在 `start`
/// 之前完成。
pub struct NetworkIoService {
    config: Mutex<ServiceConfig>,
    core: Mutex<Option<Arc<ServiceCore>>>,
    finished: Mutex<Option<(ember_core::Future<()>, ember_core::Future<()>)>>,
}

impl Default for NetworkIoService {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkIoService {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(ServiceConfig::default()),
            core: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }

    /// 进程级共享实例：首次访问时创建，启动前配置，退出前显式停止。
    pub fn instance() -> &'static NetworkIoService {
        static INSTANCE: OnceLock<NetworkIoService> = OnceLock::new();
        INSTANCE.get_or_init(NetworkIoService::new)
    }

    /// 指定承载两个服务任务与用户回调的线程池。
    pub fn set_executor(&self, executor: Arc<ThreadPoolExecutor>) {
        self.config.lock().executor = Some(executor);
    }

    /// 指定接收缓冲的页面分配器；缺省为缓存层叠加系统分配器。
    pub fn set_page_allocator(&self, page_allocator: Arc<dyn PageAllocator>) {
        self.config.lock().page_allocator = Some(page_allocator);
    }

    pub fn set_on_accept<C>(&self, callback: C)
    where
        C: Fn(SocketId) + Send + Sync + 'static,
    {
        self.config.lock().on_accept = Some(Box::new(callback));
    }

    /// 接收回调：`finished` 为真表示对端已经关闭写端（EOF）。
    ///
    /// 回调在构造返回的任务时同步地读取 `Cord`，未取走的数据保留到下一次
    /// 交付时继续累积。
    pub fn set_on_receive<C>(&self, callback: C)
    where
        C: Fn(SocketId, &mut Cord, bool) -> Task<()> + Send + Sync + 'static,
    {
        self.config.lock().on_receive = Some(Box::new(callback));
    }

    pub fn set_on_error<C>(&self, callback: C)
    where
        C: Fn(SocketId, Error) + Send + Sync + 'static,
    {
        self.config.lock().on_error = Some(Box::new(callback));
    }

    pub fn set_options(&self, options: NetworkServiceOptions) {
        self.config.lock().options = options;
    }

    /// 启动服务：建环、注册缓冲、派发输入驱动与回收循环。
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut core_guard = self.core.lock();
        if core_guard.is_some() {
            return Err(ServiceError::AlreadyStarted);
        }
        let mut config = self.config.lock();
        let executor = config.executor.clone().ok_or(ServiceError::MissingExecutor)?;
        let page_allocator = config.page_allocator.clone().unwrap_or_else(|| {
            let cached: Arc<dyn PageAllocator> =
                CachedPageAllocator::new(SystemPageAllocator::shared().clone(), 1024);
            cached
        });
        let options = config.options.clone();
        let on_accept = config
            .on_accept
            .take()
            .unwrap_or_else(|| Box::new(default_on_accept));
        let on_receive = config.on_receive.take();
        let on_error = config
            .on_error
            .take()
            .unwrap_or_else(|| Box::new(default_on_error));
        drop(config);

        let mut builder = io_uring::IoUring::builder();
        builder.setup_submit_all();
        let ring = builder
            .build(options.ring_capacity())
            .map_err(ServiceError::RingSetup)?;
        ring.submitter()
            .register_files_sparse(10)
            .map_err(ServiceError::RegisterFiles)?;

        // SAFETY: eventfd 无前置条件；非阻塞读配合 multishot poll 使用。
        let submission_eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if submission_eventfd < 0 {
            return Err(ServiceError::EventFd(std::io::Error::last_os_error()));
        }

        let buffer_capacity = options.buffer_ring_capacity();
        let mut buffer_ring = match BufferRing::new(buffer_capacity) {
            Ok(buffer_ring) => buffer_ring,
            Err(error) => {
                // SAFETY: eventfd 刚创建且未被共享。
                unsafe {
                    libc::close(submission_eventfd);
                }
                return Err(ServiceError::RegisterBufferRing(error));
            }
        };
        // SAFETY: 环内存由 buffer_ring 独占持有，生命周期覆盖注册期。
        if let Err(error) = unsafe {
            ring.submitter()
                .register_buf_ring(buffer_ring.address(), buffer_capacity, input::BUF_GROUP)
        } {
            // SAFETY: 同上。
            unsafe {
                libc::close(submission_eventfd);
            }
            return Err(ServiceError::RegisterBufferRing(error));
        }

        let page_size = page_allocator.page_size();
        let mut buffers = input::Buffers(vec![0usize; buffer_capacity as usize]);
        for buffer_id in 0..buffer_capacity {
            let page = page_allocator.allocate();
            buffers.0[buffer_id as usize] = page as usize;
            buffer_ring.push(page, page_size as u32, buffer_id);
        }
        buffer_ring.commit();

        let send_allocator = SendBufferAllocator::new(page_allocator.clone());
        let send_buffer_size = send_allocator.page_size();
        let core = Arc::new(ServiceCore {
            executor: executor.clone(),
            page_allocator,
            send_allocator,
            on_accept,
            on_receive,
            on_error,
            page_size,
            send_buffer_size,
            submission_queue: ConcurrentBoundedQueue::new(
                options.submission_queue_capacity(),
            ),
            submission_events: AtomicU64::new(0),
            submission_eventfd,
            output_queue: ConcurrentBoundedQueue::new(options.output_queue_capacity()),
            output_events: AtomicUsize::new(0),
            output_rings: output::OutputRegistry::default(),
            sockets: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
            options,
        });

        let executor_handle: Arc<dyn Executor> = executor.clone();
        let input_future = executor_handle.execute_task(Task::new(input::input_loop(
            core.clone(),
            ring,
            buffer_ring,
            buffers,
        )));
        if !input_future.valid() {
            return Err(ServiceError::Rejected);
        }
        let reclaim_core = core.clone();
        let reclaim_future = executor.execute(move || output::reclaim_loop(reclaim_core));
        if !reclaim_future.valid() {
            core.running.store(false, Ordering::Release);
            core.wake_input_loop();
            input_future.get();
            return Err(ServiceError::Rejected);
        }

        *core_guard = Some(core);
        *self.finished.lock() = Some((input_future, reclaim_future));
        Ok(())
    }

    /// 托管一个监听套接字：提交 multishot accept。
    pub fn accept(&self, listen_socket: RawFd) -> Result<(), ServiceError> {
        let core = self.running_core()?;
        core.submit_user_data(UserData::for_socket(
            MODE_ACCEPT,
            SocketId::new(listen_socket, 0),
        ));
        Ok(())
    }

    /// 异步发送：数据进入全局发送队列，由按需调度的消费者合并落环。
    /// 携带过期版本号的发送会被静默丢弃。
    pub fn send(&self, socket_id: SocketId, entry: Bytes) -> Result<(), ServiceError> {
        let core = self.running_core()?;
        core.output_queue.push::<true, false, false>(OutputTask {
            user_data: UserData::for_socket(MODE_SEND, socket_id),
            entry,
        });
        if core.output_events.fetch_add(1, Ordering::AcqRel) == 0 {
            let consumer_core = core.clone();
            if core
                .executor
                .submit(move || output::consume_output_queue(consumer_core))
                .is_err()
            {
                let mut events = 1usize;
                loop {
                    match core.output_events.compare_exchange(
                        events,
                        0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(current) => events = current,
                    }
                }
                return Err(ServiceError::Rejected);
            }
        }
        Ok(())
    }

    /// 关闭套接字：推进版本号使在途操作失效，随后 shutdown + close。
    pub fn shutdown(&self, socket_id: SocketId) -> Result<(), ServiceError> {
        let core = self.running_core()?;
        core.submit_user_data(UserData::for_socket(MODE_SHUTDOWN, socket_id));
        Ok(())
    }

    /// 发送缓冲分配器（诊断在途缓冲计数等用途）。
    pub fn send_buffer_allocator(&self) -> Result<Arc<SendBufferAllocator>, ServiceError> {
        Ok(self.running_core()?.send_allocator.clone())
    }

    /// 停机：置停机标志、敲醒输入驱动，并等待两个服务任务退出。
    pub fn stop(&self) -> Result<(), ServiceError> {
        let core = self.core.lock().take().ok_or(ServiceError::NotStarted)?;
        core.running.store(false, Ordering::Release);
        core.wake_input_loop();
        if let Some((input_future, reclaim_future)) = self.finished.lock().take() {
            input_future.get();
            reclaim_future.get();
        }
        Ok(())
    }

    fn running_core(&self) -> Result<Arc<ServiceCore>, ServiceError> {
        self.core.lock().clone().ok_or(ServiceError::NotStarted)
    }
}
