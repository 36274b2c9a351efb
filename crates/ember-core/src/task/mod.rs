//! 协作式任务运行时：把异步任务绑定到执行器，并保证恢复发生在正确的
//! 执行器上。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：执行器只认识一次性闭包；要让异步任务在挂起/恢复之间
//!   始终回到绑定执行器，需要一个驱动器把 `poll` 循环与唤醒重新入队粘合
//!   起来，并以 Future/Promise 把最终结果送回提交方。
//! - **逻辑 (How)**：[`Task`] 是惰性的、只可移动的异步任务包装。
//!   被 await 时，若绑定执行器缺省或就是当前执行器，则原地推进（对应
//!   同执行器的对称转移，不经过任何队列）；否则整体派发到绑定执行器，
//!   通过完成 Future 把控制权送回 awaiter 的执行器。派发由任务驱动器
//!   承担：Idle/Scheduled/Running/Notified 状态机保证任一
//!   时刻至多一次在途执行，唤醒把驱动器重新 `invoke` 回执行器，拒绝时
//!   原地续跑兜底。
//! - **契约 (What)**：任务帧（内部 Future）恰好析构一次——未运行即丢弃、
//!   运行中完成、或派发后由驱动器释放；穿越驱动器的 panic 终止进程，
//!   对应“协程内不允许异常逃逸”的约定。

pub mod cancellable;
pub mod futex;
mod future_await;
mod yield_now;

pub use cancellable::{Cancellable, CancellationToken};
pub use futex::Futex;
pub use future_await::{FutureAwaitable, SharedFutureAwaitable};
pub use yield_now::{YieldAwaitable, yield_now};

use core::pin::Pin;
use core::sync::atomic::{AtomicU8, Ordering};
use core::task::{Context, Poll, Waker};
use std::sync::Arc;
use std::task::Wake;

use parking_lot::Mutex;

use crate::concurrent::sched::OsSched;
use crate::executor::{Executor, ExecutorError, RunnerScope, TaskFunction};
use crate::future::Promise;

type BoxedTaskFuture<T> = Pin<Box<dyn core::future::Future<Output = T> + Send + 'static>>;

enum TaskState<T> {
    Inline(BoxedTaskFuture<T>),
    Dispatched(FutureAwaitable<T, OsSched>),
    Empty,
}

/// 惰性的、只可移动的异步任务，可绑定执行器后提交或直接 await。
///
/// # 契约说明（What）
/// - 构造后不做任何事，首次被驱动（提交或 await）才开始执行；
/// - 析构时若从未被驱动，内部任务帧随之释放，无泄漏；
/// - `set_executor` 决定任务被派发时运行在哪里；未绑定时继承驱动方。
pub struct Task<T = ()> {
    state: TaskState<T>,
    executor: Option<Arc<dyn Executor>>,
    degraded: bool,
}

impl<T> Task<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: core::future::Future<Output = T> + Send + 'static,
    {
        Self {
            state: TaskState::Inline(Box::pin(future)),
            executor: None,
            degraded: false,
        }
    }

    /// 绑定执行器，返回自身以便链式书写。
    pub fn set_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 当前绑定的执行器。
    pub fn executor(&self) -> Option<&Arc<dyn Executor>> {
        self.executor.as_ref()
    }

    fn into_boxed_future(self) -> BoxedTaskFuture<T>
    where
        T: Send + Sync + 'static,
    {
        match self.state {
            TaskState::Inline(future) => future,
            TaskState::Dispatched(awaitable) => Box::pin(awaitable),
            TaskState::Empty => unreachable!("任务状态只在 poll 内部短暂置空"),
        }
    }
}

impl<T: Send + Sync + 'static> core::future::Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                TaskState::Inline(future) => {
                    let inline = this.degraded
                        || match &this.executor {
                            None => true,
                            Some(executor) => executor.is_running_in(),
                        };
                    if inline {
                        // 同执行器（或未绑定）的 awaitee 原地推进，不经过队列。
                        return future.as_mut().poll(cx);
                    }
                    let TaskState::Inline(future) =
                        core::mem::replace(&mut this.state, TaskState::Empty)
                    else {
                        unreachable!()
                    };
                    let executor = this
                        .executor
                        .clone()
                        .expect("跨执行器派发必然已绑定执行器");
                    match spawn_boxed(executor, future, true) {
                        Ok(completion) => {
                            this.state =
                                TaskState::Dispatched(FutureAwaitable::new(completion));
                        }
                        Err(future) => {
                            // 执行器拒绝派发：退化为原地推进，保证不悬挂。
                            this.degraded = true;
                            this.state = TaskState::Inline(future);
                        }
                    }
                }
                TaskState::Dispatched(awaitable) => return Pin::new(awaitable).poll(cx),
                TaskState::Empty => unreachable!("任务状态只在 poll 内部短暂置空"),
            }
        }
    }
}

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

/// 把一个异步任务钉在执行器上的驱动器。
///
/// 状态机约定：
/// - 唤醒时 Idle → Scheduled 并重新入队；Running → Notified 表示“poll 期间
///   又被唤醒”，驱动循环在返回 Pending 前检测到并立即重试；
/// - 入队被拒绝时原地续跑（与恢复路径的兜底一致）；
/// - 完成后释放任务帧并经 Promise 发布结果。
struct TaskDriver<T: Send + Sync + 'static> {
    future: Mutex<Option<BoxedTaskFuture<T>>>,
    promise: Mutex<Option<Promise<T, OsSched>>>,
    executor: Arc<dyn Executor>,
    state: AtomicU8,
}

impl<T: Send + Sync + 'static> TaskDriver<T> {
    fn schedule(self: Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let driver = self.clone();
                        let job: TaskFunction = Box::new(move || driver.run());
                        if let Err(job) = self.executor.invoke(job) {
                            job();
                        }
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn run(self: Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut guard = self.future.lock();
        loop {
            let Some(future) = guard.as_mut() else {
                self.state.store(DONE, Ordering::Release);
                return;
            };
            let poll = {
                let _scope = RunnerScope::enter_with_handle(self.executor.clone());
                future.as_mut().poll(&mut cx)
            };
            match poll {
                Poll::Ready(value) => {
                    *guard = None;
                    drop(guard);
                    self.state.store(DONE, Ordering::Release);
                    if let Some(promise) = self.promise.lock().take() {
                        promise.set_value(value);
                    }
                    return;
                }
                Poll::Pending => {
                    match self.state.compare_exchange(
                        RUNNING,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(_) => {
                            // poll 期间收到唤醒，立即重试一轮。
                            self.state.store(RUNNING, Ordering::Release);
                        }
                    }
                }
            }
        }
    }
}

impl<T: Send + Sync + 'static> Wake for TaskDriver<T> {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().schedule();
    }
}

/// 在 `executor` 上派发一个已装箱的任务。
///
/// 返回 `Ok(完成 Future)`；执行器拒绝初始入队时把任务帧原样退回。
fn spawn_boxed<T: Send + Sync + 'static>(
    executor: Arc<dyn Executor>,
    future: BoxedTaskFuture<T>,
    want_result: bool,
) -> Result<crate::future::Future<T, OsSched>, BoxedTaskFuture<T>> {
    let (promise, result) = if want_result {
        let promise = Promise::<T, OsSched>::new();
        let handle = promise.get_future();
        (Some(promise), handle)
    } else {
        (None, crate::future::Future::default())
    };
    let driver = Arc::new(TaskDriver {
        future: Mutex::new(Some(future)),
        promise: Mutex::new(promise),
        executor: executor.clone(),
        state: AtomicU8::new(SCHEDULED),
    });
    let job: TaskFunction = {
        let driver = driver.clone();
        Box::new(move || driver.run())
    };
    match executor.invoke(job) {
        Ok(()) => Ok(result),
        Err(job) => {
            drop(job);
            drop(result);
            driver.promise.lock().take();
            let future = driver
                .future
                .lock()
                .take()
                .expect("被拒绝的任务从未运行，任务帧必然还在");
            Err(future)
        }
    }
}

/// 面向 `Arc` 形态执行器句柄的任务提交扩展。
pub trait TaskExecutorExt {
    /// 派发任务并取得结果 Future；拒绝时返回无效 Future。
    fn execute_task<T: Send + Sync + 'static>(&self, task: Task<T>)
    -> crate::future::Future<T>;

    /// 即发即忘地派发任务。
    fn submit_task<T: Send + Sync + 'static>(&self, task: Task<T>) -> Result<(), ExecutorError>;
}

fn execute_task_on<T: Send + Sync + 'static>(
    this: &Arc<dyn Executor>,
    task: Task<T>,
) -> crate::future::Future<T> {
    let executor = task.executor.clone().unwrap_or_else(|| this.clone());
    match spawn_boxed(executor, task.into_boxed_future(), true) {
        Ok(future) => future,
        Err(_future) => crate::future::Future::default(),
    }
}

fn submit_task_on<T: Send + Sync + 'static>(
    this: &Arc<dyn Executor>,
    task: Task<T>,
) -> Result<(), ExecutorError> {
    let executor = task.executor.clone().unwrap_or_else(|| this.clone());
    spawn_boxed(executor, task.into_boxed_future(), false)
        .map(|_| ())
        .map_err(|_future| ExecutorError::Rejected)
}

impl TaskExecutorExt for Arc<dyn Executor> {
    fn execute_task<T: Send + Sync + 'static>(
        &self,
        task: Task<T>,
    ) -> crate::future::Future<T> {
        execute_task_on(self, task)
    }

    fn submit_task<T: Send + Sync + 'static>(&self, task: Task<T>) -> Result<(), ExecutorError> {
        submit_task_on(self, task)
    }
}

impl<E: Executor + 'static> TaskExecutorExt for Arc<E> {
    fn execute_task<T: Send + Sync + 'static>(
        &self,
        task: Task<T>,
    ) -> crate::future::Future<T> {
        let this: Arc<dyn Executor> = self.clone();
        execute_task_on(&this, task)
    }

    fn submit_task<T: Send + Sync + 'static>(&self, task: Task<T>) -> Result<(), ExecutorError> {
        let this: Arc<dyn Executor> = self.clone();
        submit_task_on(&this, task)
    }
}
