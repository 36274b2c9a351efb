//! 三种执行器的提交、运行者判定与停机语义。

use ember_core::{
    AlwaysUseNewThreadExecutor, Executor, ExecutorError, ExecutorExt, InplaceExecutor,
    ThreadPoolExecutor, ThreadPoolExecutorOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn inplace_executor_runs_immediately() {
    let executor = InplaceExecutor::new(false);
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = ran.clone();
        executor
            .submit(move || {
                ran.fetch_add(1, Ordering::AcqRel);
            })
            .expect("原地执行不应被拒绝");
    }
    assert_eq!(1, ran.load(Ordering::Acquire), "invoke 返回前任务已执行完毕");
}

#[test]
fn inplace_executor_execute_returns_ready_future() {
    let executor = InplaceExecutor::new(false);
    let future = executor.execute(|| 1 + 1);
    assert!(future.valid());
    assert!(future.ready(), "原地执行完成后 future 应当立即就绪");
    assert_eq!(&2, future.get());
}

/// 压平模式：重入提交不递归，由最外层调用以 LIFO 次序排空。
#[test]
fn inplace_executor_flatten_reentry_execution() {
    let executor = Arc::new(InplaceExecutor::new(true));
    let order = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));
    {
        let order = order.clone();
        let inner_executor = executor.clone();
        executor
            .submit(move || {
                order.lock().push("外层开始");
                for label in ["重入-1", "重入-2"] {
                    let order = order.clone();
                    inner_executor
                        .submit(move || {
                            order.lock().push(label);
                        })
                        .expect("重入提交不应被拒绝");
                }
                order.lock().push("外层结束");
            })
            .expect("外层提交不应被拒绝");
    }
    assert_eq!(
        vec!["外层开始", "外层结束", "重入-2", "重入-1"],
        *order.lock(),
        "重入任务必须在外层返回后按 LIFO 排空"
    );
}

#[test]
fn always_new_thread_runs_in_other_thread() {
    let executor = AlwaysUseNewThreadExecutor::instance();
    let main_thread = thread::current().id();
    let future = executor.execute(move || thread::current().id() != main_thread);
    assert!(future.valid());
    assert!(*future.get(), "任务必须运行在新线程上");
}

#[test]
fn is_running_in_true_only_inside() {
    let executor = AlwaysUseNewThreadExecutor::instance();
    assert!(!executor.is_running_in());
    let inner: Arc<AlwaysUseNewThreadExecutor> = executor.clone();
    let future = executor.execute(move || inner.is_running_in());
    assert!(*future.get(), "任务内部的运行者判定必须为真");
}

#[test]
fn thread_pool_runs_submitted_tasks() {
    let pool = ThreadPoolExecutor::start(
        ThreadPoolExecutorOptions::new()
            .with_worker_number(4)
            .with_global_capacity(128),
    );
    let counter = Arc::new(AtomicUsize::new(0));
    let futures: Vec<_> = (0..64)
        .map(|i| {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::AcqRel);
                i * 2
            })
        })
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(&(i * 2), future.get());
    }
    assert_eq!(64, counter.load(Ordering::Acquire));
    pool.stop();
}

#[test]
fn thread_pool_is_running_in() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    assert!(!pool.is_running_in());
    let probe = pool.clone();
    let future = pool.execute(move || probe.is_running_in());
    assert!(*future.get());
    pool.stop();
}

#[test]
fn thread_pool_keeps_fifo_for_single_producer_without_stealing() {
    let pool = ThreadPoolExecutor::start(
        ThreadPoolExecutorOptions::new()
            .with_worker_number(1)
            .with_work_stealing(false),
    );
    let order = Arc::new(parking_lot::Mutex::new(Vec::<usize>::new()));
    let futures: Vec<_> = (0..100)
        .map(|i| {
            let order = order.clone();
            pool.execute(move || order.lock().push(i))
        })
        .collect();
    for future in futures {
        future.get();
    }
    assert_eq!(
        (0..100).collect::<Vec<_>>(),
        *order.lock(),
        "单工作线程且无窃取时必须严格 FIFO"
    );
    pool.stop();
}

#[test]
fn thread_pool_rejects_after_stop() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));
    pool.stop();
    assert_eq!(Err(ExecutorError::Rejected), pool.submit(|| {}));
    let future = pool.execute(|| 1);
    assert!(!future.valid(), "停机后的 execute 必须返回无效 future");
}

#[test]
fn thread_pool_press_with_stealing_and_balance() {
    let pool = ThreadPoolExecutor::start(
        ThreadPoolExecutorOptions::new()
            .with_worker_number(6)
            .with_global_capacity(1024)
            .with_local_capacity(64)
            .with_work_stealing(true)
            .with_balance_interval(Some(Duration::from_millis(5))),
    );
    let counter = Arc::new(AtomicUsize::new(0));
    let mut futures = Vec::new();
    for _ in 0..2000 {
        let counter = counter.clone();
        let inner_pool = pool.clone();
        futures.push(pool.execute(move || {
            // 工作线程内再提交，覆盖本地队列路径
            let counter2 = counter.clone();
            let _ = inner_pool.submit(move || {
                counter2.fetch_add(1, Ordering::AcqRel);
            });
            counter.fetch_add(1, Ordering::AcqRel);
        }));
    }
    for future in futures {
        future.get();
    }
    // 等待二级提交排空
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::Acquire) < 4000 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(4000, counter.load(Ordering::Acquire));
    pool.stop();
}

#[test]
fn local_task_number_visible_only_on_worker() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(1));
    assert_eq!(0, pool.local_task_number(), "非工作线程上恒为 0");
    pool.stop();
}
