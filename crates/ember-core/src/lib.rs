#![doc = "ember-core: 高性能并发原语与协作式任务运行时。"]
#![doc = ""]
#![doc = "分层自下而上："]
#![doc = "1. [`concurrent::sched`] —— futex 式等待/唤醒的调度接口；"]
#![doc = "2. [`concurrent::bounded_queue`] —— 槽位版本号握手的有界 MPMC 队列；"]
#![doc = "3. [`executor`] —— 统一提交面与原地/独立线程/线程池三种执行器；"]
#![doc = "4. [`future`] —— Future/Promise/CountDownLatch 结果通道；"]
#![doc = "5. [`task`] —— 绑定执行器的任务运行时与各类可等待原语。"]
#![doc = ""]
#![doc = "除任务驱动与 io 集成点外，热路径均为无锁或单锁短临界区；"]
#![doc = "内存序以 acquire-release 发布槽位版本、就绪标志与事件计数，"]
#![doc = "统计类计数使用 relaxed，调用方不应假设顺序一致性。"]

pub mod concurrent;
pub mod executor;
pub mod future;
pub mod task;

pub use concurrent::{
    CondvarSched, ConcurrentBoundedQueue, ConcurrentExecutionQueue, DepositBox, OsSched,
    SchedInterface,
};
pub use executor::{
    AlwaysUseNewThreadExecutor, Executor, ExecutorError, ExecutorExt, InplaceExecutor,
    RunnerScope, TaskFunction, ThreadPoolExecutor, ThreadPoolExecutorOptions,
};
pub use future::{CountDownLatch, Future, Promise};
pub use task::{
    Cancellable, CancellationToken, Futex, FutureAwaitable, SharedFutureAwaitable, Task,
    TaskExecutorExt, YieldAwaitable, yield_now,
};
