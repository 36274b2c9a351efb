//! 协作式 futex：值匹配、LIFO 唤醒、取消与唤醒的竞争。

use ember_core::task::futex::{Cancellation, WaitStatus};
use ember_core::{
    AlwaysUseNewThreadExecutor, Executor, Futex, Task, TaskExecutorExt,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

fn executor() -> Arc<dyn Executor> {
    AlwaysUseNewThreadExecutor::instance().clone()
}

#[test]
fn do_not_suspend_if_value_not_match() {
    let futex = Futex::new();
    let waiter = futex.clone();
    let future = executor().execute_task(Task::new(async move {
        waiter.wait(10086).await
    }));
    assert_eq!(&WaitStatus::Woken, future.get(), "值不匹配必须立即返回");
}

#[test]
fn empty_futex_wakeup_nothing() {
    let futex = Futex::new();
    assert_eq!(0, futex.wake_one());
    assert_eq!(0, futex.wake_all());
}

#[test]
fn wait_if_value_match_until_wakeup() {
    let futex = Futex::new();
    futex.set_value(10086);
    let waiter = futex.clone();
    let future = executor().execute_task(Task::new(async move {
        waiter.wait(10086).await
    }));
    assert!(!future.wait_for(Duration::from_millis(100)), "唤醒前必须挂起");
    assert_eq!(1, futex.wake_one());
    assert_eq!(&WaitStatus::Woken, future.get());
    assert_eq!(0, futex.wake_one(), "队列已空");
}

#[test]
fn wakeup_in_reverse_order() {
    let futex = Futex::new();
    futex.set_value(10086);
    let sequence = Arc::new(parking_lot::Mutex::new(Vec::<usize>::new()));
    let (ready_sender, ready_receiver) = mpsc::channel::<()>();
    let mut futures = Vec::new();
    for index in 0..3 {
        let waiter = futex.clone();
        let sequence = sequence.clone();
        let ready_sender = ready_sender.clone();
        futures.push(executor().execute_task(Task::new(async move {
            let awaitable = waiter.wait(10086).on_suspend(move |_token| {
                ready_sender.send(()).expect("接收端仍然存活");
            });
            awaitable.await;
            sequence.lock().push(index);
        })));
    }
    for _ in 0..3 {
        ready_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("全部等待者必须完成挂起");
    }
    for expected_len in 1..=3 {
        assert_eq!(1, futex.wake_one());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sequence.lock().len() < expected_len && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }
    assert_eq!(
        vec![2, 1, 0],
        *sequence.lock(),
        "后挂起者必须先被唤醒（LIFO）"
    );
    for future in futures {
        future.get();
    }
}

#[test]
fn wake_all_wakes_everyone() {
    let futex = Futex::new();
    futex.set_value(10086);
    let (ready_sender, ready_receiver) = mpsc::channel::<()>();
    let futures: Vec<_> = (0..3)
        .map(|_| {
            let waiter = futex.clone();
            let ready_sender = ready_sender.clone();
            executor().execute_task(Task::new(async move {
                waiter
                    .wait(10086)
                    .on_suspend(move |_token| {
                        ready_sender.send(()).expect("接收端仍然存活");
                    })
                    .await
            }))
        })
        .collect();
    for _ in 0..3 {
        ready_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("全部等待者必须完成挂起");
    }
    assert_eq!(3, futex.wake_all());
    for future in futures {
        assert_eq!(&WaitStatus::Woken, future.get());
    }
    assert_eq!(0, futex.wake_all());
}

#[test]
fn cancel_before_wakeup() {
    let futex = Futex::new();
    futex.set_value(10086);
    let (token_sender, token_receiver) = mpsc::channel::<Cancellation>();
    let waiter = futex.clone();
    let future = executor().execute_task(Task::new(async move {
        waiter
            .wait(10086)
            .on_suspend(move |token| {
                token_sender.send(token).expect("接收端仍然存活");
            })
            .await
    }));
    let token = token_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("挂起钩子必须交付令牌");
    assert!(!future.wait_for(Duration::from_millis(100)));
    assert!(token.cancel(), "首次取消应当胜出");
    assert!(!token.cancel(), "重复取消必须返回 false");
    assert_eq!(&WaitStatus::Cancelled, future.get());
    assert_eq!(0, futex.wake_one(), "被取消的节点不得残留在等待列表");
    assert_eq!(0, futex.wake_all());
}

#[test]
fn cancel_on_suspend_hook() {
    let futex = Futex::new();
    futex.set_value(10086);
    let waiter = futex.clone();
    let future = executor().execute_task(Task::new(async move {
        waiter
            .wait(10086)
            .on_suspend(|token| {
                assert!(token.cancel());
            })
            .await
    }));
    assert_eq!(&WaitStatus::Cancelled, future.get());
    assert_eq!(0, futex.wake_one());
}

#[test]
fn cancel_after_wakeup_loses() {
    let futex = Futex::new();
    futex.set_value(10086);
    let (token_sender, token_receiver) = mpsc::channel::<Cancellation>();
    let waiter = futex.clone();
    let future = executor().execute_task(Task::new(async move {
        waiter
            .wait(10086)
            .on_suspend(move |token| {
                token_sender.send(token).expect("接收端仍然存活");
            })
            .await
    }));
    let token = token_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("挂起钩子必须交付令牌");
    assert_eq!(1, futex.wake_one());
    assert_eq!(&WaitStatus::Woken, future.get());
    assert!(!token.cancel(), "唤醒后的取消必须落败");
}

#[test]
fn cancel_adjust_waiter_list_correctly() {
    let futex = Futex::new();
    futex.set_value(10086);
    let (token_sender, token_receiver) = mpsc::channel::<Cancellation>();
    let futures: Vec<_> = (0..100)
        .map(|_| {
            let waiter = futex.clone();
            let token_sender = token_sender.clone();
            executor().execute_task(Task::new(async move {
                waiter
                    .wait(10086)
                    .on_suspend(move |token| {
                        token_sender.send(token).expect("接收端仍然存活");
                    })
                    .await
            }))
        })
        .collect();
    let mut tokens: Vec<_> = (0..100)
        .map(|_| {
            token_receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("每个等待者都必须交付令牌")
        })
        .collect();
    // 打乱后取消一半，检验列表摘除不破坏剩余节点
    for i in (1..tokens.len()).rev() {
        let j = (i * 7919 + 13) % (i + 1);
        tokens.swap(i, j);
    }
    let cancelled = tokens.split_off(50);
    for token in &cancelled {
        assert!(token.cancel());
    }
    assert_eq!(50, futex.wake_all(), "剩余等待者必须全部可被唤醒");
    let mut woken = 0;
    let mut cancelled_count = 0;
    for future in futures {
        match future.get() {
            WaitStatus::Woken => woken += 1,
            WaitStatus::Cancelled => cancelled_count += 1,
        }
    }
    assert_eq!(50, woken);
    assert_eq!(50, cancelled_count);
}

/// 场景：100 个等待者，一个线程持续 wake_one，另一个线程并发取消全部
/// 令牌。每个等待者恰好被恢复一次，唤醒数 + 取消成功数 == 100。
#[test]
fn concurrent_wakeup_and_cancel() {
    let futex = Futex::new();
    futex.set_value(10086);
    let (token_sender, token_receiver) = mpsc::channel::<Cancellation>();
    let futures: Vec<_> = (0..100)
        .map(|_| {
            let waiter = futex.clone();
            let token_sender = token_sender.clone();
            executor().execute_task(Task::new(async move {
                waiter
                    .wait(10086)
                    .on_suspend(move |token| {
                        token_sender.send(token).expect("接收端仍然存活");
                    })
                    .await
            }))
        })
        .collect();
    let tokens: Vec<_> = (0..100)
        .map(|_| {
            token_receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("每个等待者都必须交付令牌")
        })
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let woken_total = Arc::new(AtomicUsize::new(0));
    let waker_thread = {
        let futex = futex.clone();
        let stop = stop.clone();
        let woken_total = woken_total.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                woken_total.fetch_add(futex.wake_one(), Ordering::AcqRel);
            }
        })
    };
    let cancel_thread = thread::spawn(move || {
        let mut cancelled = 0usize;
        for token in tokens {
            if token.cancel() {
                cancelled += 1;
            }
        }
        cancelled
    });

    let mut woken_futures = 0usize;
    let mut cancelled_futures = 0usize;
    for future in futures {
        match future.get() {
            WaitStatus::Woken => woken_futures += 1,
            WaitStatus::Cancelled => cancelled_futures += 1,
        }
    }
    let cancelled = cancel_thread.join().expect("取消线程不应 panic");
    stop.store(true, Ordering::Release);
    waker_thread.join().expect("唤醒线程不应 panic");

    assert_eq!(100, woken_futures + cancelled_futures, "每个等待者恰好恢复一次");
    assert_eq!(cancelled, cancelled_futures, "取消胜出数与被取消的等待者一致");
    assert_eq!(
        woken_total.load(Ordering::Acquire),
        woken_futures,
        "唤醒胜出数与被唤醒的等待者一致"
    );
}
