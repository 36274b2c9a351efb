//! 按需消费队列：0→1 触发、消费收敛、join 与多生产者对拍。

use ember_core::{
    ConcurrentExecutionQueue, Executor, InplaceExecutor, TaskFunction, ThreadPoolExecutor,
    ThreadPoolExecutorOptions,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn inplace_executor_turns_producer_into_consumer() {
    let consumed = Arc::new(parking_lot::Mutex::new(Vec::<i32>::new()));
    let sink = consumed.clone();
    let queue = ConcurrentExecutionQueue::<i32>::new(
        16,
        InplaceExecutor::instance().clone(),
        move |drain| {
            sink.lock().extend(drain);
        },
    );
    for value in 0..5 {
        queue.execute(value).expect("原地执行不应被拒绝");
    }
    // 原地执行器让每次 execute 返回前就完成消费
    assert_eq!(vec![0, 1, 2, 3, 4], *consumed.lock());
    assert_eq!(0, queue.size());
}

#[test]
fn consumer_started_on_demand_and_converges() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(2));
    let consumed = Arc::new(AtomicUsize::new(0));
    let sink = consumed.clone();
    let queue = ConcurrentExecutionQueue::<u64>::new(64, pool.clone(), move |drain| {
        for _value in drain {
            sink.fetch_add(1, Ordering::AcqRel);
        }
    });

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..1000u64 {
                    queue.execute(p * 1000 + i).expect("提交不应被拒绝");
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().expect("生产线程不应 panic");
    }
    queue.join();
    assert_eq!(4000, consumed.load(Ordering::Acquire), "join 后必须全部消费");
    assert_eq!(0, queue.size());
    pool.stop();
}

#[test]
fn values_neither_lost_nor_duplicated() {
    let pool = ThreadPoolExecutor::start(ThreadPoolExecutorOptions::new().with_worker_number(4));
    let seen = Arc::new(parking_lot::Mutex::new(BTreeSet::<u64>::new()));
    let sink = seen.clone();
    let queue = ConcurrentExecutionQueue::<u64>::new(128, pool.clone(), move |drain| {
        let mut seen = sink.lock();
        for value in drain {
            assert!(seen.insert(value), "值 {value} 被重复消费");
        }
    });
    let producers: Vec<_> = (0..3)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..2000u64 {
                    queue.execute(p * 2000 + i).expect("提交不应被拒绝");
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().expect("生产线程不应 panic");
    }
    queue.join();
    assert_eq!(6000, seen.lock().len(), "全部值都必须恰好消费一次");
    pool.stop();
}

/// 执行器拒绝时事件计数必须被回退，后续 signal_push_event 可恢复消费。
#[test]
fn rejected_submission_can_be_recovered_by_signal() {
    struct RejectingExecutor {
        reject: std::sync::atomic::AtomicBool,
        inner: Arc<InplaceExecutor>,
    }
    impl Executor for RejectingExecutor {
        fn invoke(&self, function: TaskFunction) -> Result<(), TaskFunction> {
            if self.reject.load(Ordering::Acquire) {
                return Err(function);
            }
            self.inner.invoke(function)
        }
    }

    let executor = Arc::new(RejectingExecutor {
        reject: std::sync::atomic::AtomicBool::new(true),
        inner: InplaceExecutor::instance().clone(),
    });
    let consumed = Arc::new(AtomicUsize::new(0));
    let sink = consumed.clone();
    let queue = ConcurrentExecutionQueue::<i32>::new(16, executor.clone(), move |drain| {
        for _value in drain {
            sink.fetch_add(1, Ordering::AcqRel);
        }
    });

    assert!(queue.execute(1).is_err(), "执行器拒绝时 execute 必须报错");
    assert_eq!(1, queue.size(), "数据仍在队列中等待恢复");
    assert_eq!(0, consumed.load(Ordering::Acquire));

    executor.reject.store(false, Ordering::Release);
    queue
        .signal_push_event()
        .expect("恢复后的手动信号应当成功");
    queue.join();
    assert_eq!(1, consumed.load(Ordering::Acquire), "恢复消费后数据被处理");
    assert_eq!(0, queue.size());
}
