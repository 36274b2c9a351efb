//! 按需消费队列：队列持续为空时没有消费者在运行，数据到来时按需把
//! 消费任务提交到执行器，消费干净后退出。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：大量偶发活跃的队列（每连接一个接收队列、全局发送
//!   队列）如果各配一个常驻消费者，线程或任务栈的开销不可接受；按需
//!   启动让空闲队列零占用。
//! - **逻辑 (How)**：生产者入队后对事件计数 fetch-add；由 0 变 1 的那个
//!   生产者负责把消费任务提交到执行器。消费者循环批量出队，队列见空时
//!   尝试把事件计数 CAS 回 0，失败说明期间又有入队，继续消费。
//! - **契约 (What)**：任一时刻至多一个消费任务被调度；空闲期无轮询；
//!   提交被执行器拒绝时事件计数被回退，数据滞留队列，可由
//!   `signal_push_event` 手动恢复消费。

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;

use super::bounded_queue::{ConcurrentBoundedQueue, Drain};
use super::sched::{OsSched, SchedInterface};
use crate::executor::{Executor, ExecutorError};

type ConsumeFunction<T, S> = Box<dyn for<'a> Fn(&mut Drain<'a, T, S>) + Send + Sync>;

struct ExecutionQueueInner<T, S: SchedInterface>
where
    T: Send + 'static,
{
    queue: ConcurrentBoundedQueue<T, S>,
    events: AtomicUsize,
    executor: Arc<dyn Executor>,
    consume: ConsumeFunction<T, S>,
}

/// MPSC 按需消费队列的共享句柄；克隆副本共享同一队列与消费者。
///
/// # 契约说明（What）
/// - `execute` 在队列满时阻塞生产者（有界背压）；
/// - 消费回调按到达次序收到元素，回调未取走的元素由迭代器析构兜底消费；
/// - `join` 等待“当前已入队的数据全部消费完成”。
pub struct ConcurrentExecutionQueue<T, S: SchedInterface = OsSched>
where
    T: Send + 'static,
{
    inner: Arc<ExecutionQueueInner<T, S>>,
}

impl<T, S: SchedInterface> Clone for ConcurrentExecutionQueue<T, S>
where
    T: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, S: SchedInterface> ConcurrentExecutionQueue<T, S>
where
    T: Send + 'static,
{
    /// 构造并初始化。
    ///
    /// - `capacity_hint`：队列容量（向上取整到 2 的幂），积压超过容量时
    ///   生产者被阻塞；
    /// - `executor`：消费任务的执行器，用线程池即异步消费，用原地执行器
    ///   则第一个生产者转化为消费者；
    /// - `consume`：消费回调，按批次收到元素迭代器。
    pub fn new<C>(capacity_hint: usize, executor: Arc<dyn Executor>, consume: C) -> Self
    where
        C: for<'a> Fn(&mut Drain<'a, T, S>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ExecutionQueueInner {
                queue: ConcurrentBoundedQueue::new(capacity_hint),
                events: AtomicUsize::new(0),
                executor,
                consume: Box::new(consume),
            }),
        }
    }

    /// 队列实际容量。
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    /// 当前待消费数。
    pub fn size(&self) -> usize {
        self.inner.queue.size()
    }

    /// 入队数据并按需启动消费者；队列满时阻塞等待。
    ///
    /// 返回错误表示需要启动消费者但执行器拒绝了提交：数据已入队但暂时
    /// 无人消费，执行器恢复后的下一次入队（或手动 `signal_push_event`）
    /// 会自动恢复消费。
    pub fn execute(&self, value: T) -> Result<(), ExecutorError> {
        self.inner.queue.push::<true, false, false>(value);
        self.signal_push_event()
    }

    /// 宣告一次入队事件；仅在 `execute` 遇到执行器拒绝后用于手动恢复，
    /// 多线程重复调用是安全的。
    pub fn signal_push_event(&self) -> Result<(), ExecutorError> {
        if self.inner.events.fetch_add(1, Ordering::AcqRel) != 0 {
            return Ok(());
        }
        self.start_consumer()
    }

    /// 等待当前已入队的数据全部消费完成。
    pub fn join(&self) {
        while self.inner.events.load(Ordering::Acquire) != 0 {
            S::usleep(Duration::from_millis(1));
        }
    }

    fn start_consumer(&self) -> Result<(), ExecutorError> {
        let mut events = 1usize;
        loop {
            let inner = self.inner.clone();
            if self
                .inner
                .executor
                .invoke(Box::new(move || inner.consume_until_empty()))
                .is_ok()
            {
                return Ok(());
            }
            match self
                .inner
                .events
                .compare_exchange(events, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Err(ExecutorError::Rejected),
                Err(current) => events = current,
            }
        }
    }
}

impl<T, S: SchedInterface> ExecutionQueueInner<T, S>
where
    T: Send + 'static,
{
    fn consume_until_empty(&self) {
        let mut events = self.events.load(Ordering::Acquire);
        loop {
            let popped = self
                .queue
                .try_pop_n::<false, _>(|drain| (self.consume)(drain), self.queue.capacity());
            if popped != 0 {
                events = self.events.load(Ordering::Acquire);
            } else {
                match self
                    .events
                    .compare_exchange(events, 0, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break,
                    Err(current) => events = current,
                }
            }
        }
    }
}
