//! 任务运行时：派发、对称转移、跨执行器恢复、让出与可取消适配。

use ember_core::{
    AlwaysUseNewThreadExecutor, Cancellable, CancellationToken, Executor, Task,
    TaskExecutorExt, TaskFunction, ThreadPoolExecutor, ThreadPoolExecutorOptions, yield_now,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// 统计 invoke 次数的包装执行器，用于验证调度路径。
struct CountingExecutor {
    inner: Arc<ThreadPoolExecutor>,
    invokes: AtomicUsize,
}

impl Executor for CountingExecutor {
    fn invoke(&self, function: TaskFunction) -> Result<(), TaskFunction> {
        self.invokes.fetch_add(1, Ordering::AcqRel);
        self.inner.invoke(function)
    }
}

#[test]
fn execute_task_returns_value() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    let future = pool.execute_task(Task::new(async { 40 + 2 }));
    assert!(future.valid());
    assert_eq!(&42, future.get());
    pool.stop();
}

#[test]
fn submit_task_runs_detached() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));
    let (sender, receiver) = mpsc::channel();
    pool.submit_task(Task::new(async move {
        sender.send(10086).expect("接收端仍然存活");
    }))
    .expect("提交不应被拒绝");
    assert_eq!(
        10086,
        receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("任务必须被执行")
    );
    pool.stop();
}

#[test]
fn task_destroyed_without_running_is_leak_free() {
    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        let task = Task::new(async move {
            observed.fetch_add(1, Ordering::AcqRel);
        });
        drop(task);
    }
    assert_eq!(0, observed.load(Ordering::Acquire), "未驱动的任务不得执行");
}

/// 场景：单工作线程池上 A await B（同执行器）。B 的推进必须原地发生
/// （对称转移），整个过程只有最初那一次 invoke。
#[test]
fn same_executor_await_transfers_symmetrically() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));
    let counting = Arc::new(CountingExecutor {
        inner: pool.clone(),
        invokes: AtomicUsize::new(0),
    });
    let executor: Arc<dyn Executor> = counting.clone();

    let task_b = Task::new(async { 10086 }).set_executor(executor.clone());
    let task_a = Task::new(async move { task_b.await + 1 }).set_executor(executor.clone());
    let future = executor.execute_task(task_a);
    assert_eq!(&10087, future.get());
    assert_eq!(
        1,
        counting.invokes.load(Ordering::Acquire),
        "同执行器 await 不得产生额外的调度往返"
    );
    pool.stop();
}

/// 跨执行器 await：awaitee 在自己的执行器上运行，awaiter 恢复后仍在
/// 自己的执行器上。
#[test]
fn cross_executor_await_resumes_back() {
    let pool_a = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));
    let pool_b = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));

    let probe_a = pool_a.clone();
    let probe_b = pool_b.clone();
    let task_b = Task::new(async move {
        assert!(probe_b.is_running_in(), "awaitee 必须运行在自己的执行器上");
        7
    })
    .set_executor(pool_b.clone());

    let task_a = Task::new(async move {
        assert!(probe_a.is_running_in());
        let value = task_b.await;
        assert!(
            probe_a.is_running_in(),
            "await 返回后必须回到 awaiter 的执行器"
        );
        value * 2
    })
    .set_executor(pool_a.clone());

    let future = pool_a.execute_task(task_a);
    assert_eq!(&14, future.get());
    pool_a.stop();
    pool_b.stop();
}

#[test]
fn await_promise_future_inside_task() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    let promise = ember_core::Promise::<i32>::new();
    let future = promise.get_future();
    let result = pool.execute_task(Task::new(async move { future.await * 3 }));
    thread::sleep(Duration::from_millis(30));
    assert!(!result.ready(), "上游未发布前任务必须保持挂起");
    promise.set_value(5);
    assert_eq!(&15, result.get());
    pool.stop();
}

#[test]
fn shared_awaitable_leaves_value_for_other_consumers() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    let promise = ember_core::Promise::<String>::new();
    let future = promise.get_future();
    let shared = future.shared_awaitable();
    let result = pool.execute_task(Task::new(async move { shared.await.len() }));
    promise.set_value("共享值".to_string());
    assert_eq!(&"共享值".len(), result.get());
    assert_eq!("共享值", future.get(), "共享等待不应移出底层值");
    pool.stop();
}

#[test]
fn yield_now_reschedules_through_executor() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));
    let counting = Arc::new(CountingExecutor {
        inner: pool.clone(),
        invokes: AtomicUsize::new(0),
    });
    let executor: Arc<dyn Executor> = counting.clone();
    let steps = Arc::new(AtomicUsize::new(0));
    let steps_inner = steps.clone();
    let task = Task::new(async move {
        for _ in 0..3 {
            steps_inner.fetch_add(1, Ordering::AcqRel);
            yield_now().await;
        }
    })
    .set_executor(executor.clone());
    let future = executor.execute_task(task);
    future.get();
    assert_eq!(3, steps.load(Ordering::Acquire));
    assert!(
        counting.invokes.load(Ordering::Acquire) >= 1 + 3,
        "每次让出都必须经执行器回投，invoke 次数至少为初始调度加让出次数"
    );
    pool.stop();
}

#[test]
fn yield_without_executor_is_ready_immediately() {
    futures::executor::block_on(async {
        yield_now().await;
    });
}

#[test]
fn cancellable_completes_with_some_when_not_cancelled() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    let result = pool.execute_task(Task::new(async {
        Cancellable::new(async { 10086 }).await
    }));
    assert_eq!(&Some(10086), result.get());
    pool.stop();
}

#[test]
fn cancellable_cancelled_before_completion_returns_none() {
    let executor = AlwaysUseNewThreadExecutor::instance();
    let promise = ember_core::Promise::<i32>::new();
    let upstream = promise.get_future();
    let (token_sender, token_receiver) = mpsc::channel::<CancellationToken>();

    let executor_handle: Arc<dyn Executor> = executor.clone();
    let result = executor_handle.execute_task(Task::new(async move {
        Cancellable::new(async move { upstream.await })
            .on_suspend(move |token| {
                token_sender.send(token).expect("接收端仍然存活");
            })
            .await
    }));

    let token = token_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("挂起钩子必须交付取消令牌");
    assert!(!result.wait_for(Duration::from_millis(50)), "尚未取消不应完成");
    assert!(token.cancel(), "首次取消应当胜出");
    assert!(!token.cancel(), "取消令牌幂等，重复调用返回 false");
    assert_eq!(&None, result.get(), "被取消的等待必须以 None 结束");
    // 上游 Promise 尚未发布，此后发布也不会影响已取消的等待者
    promise.set_value(1);
}

#[test]
fn cancellable_cancel_after_completion_loses() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    let cancellable = Cancellable::new(async { 7 });
    let token = cancellable.token();
    let result = pool.execute_task(Task::new(async move { cancellable.await }));
    assert_eq!(&Some(7), result.get());
    assert!(!token.cancel(), "完成后的取消必须落败");
    pool.stop();
}

#[test]
fn cancellable_cancel_inside_on_suspend_hook() {
    let executor = AlwaysUseNewThreadExecutor::instance();
    let promise = ember_core::Promise::<i32>::new();
    let upstream = promise.get_future();
    let executor_handle: Arc<dyn Executor> = executor.clone();
    let result = executor_handle.execute_task(Task::new(async move {
        Cancellable::new(async move { upstream.await })
            .on_suspend(|token| {
                assert!(token.cancel());
            })
            .await
    }));
    assert_eq!(&None, result.get(), "挂起钩子内取消应立即生效");
    promise.set_value(0);
}
