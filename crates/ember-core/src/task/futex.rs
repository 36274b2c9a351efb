//! 协作式 futex：在一个 64 位值上等待/唤醒的任务原语，支持并发安全的
//! 取消。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：任务间的条件等待需要一个“值 + 等待者列表”的原语；
//!   与 OS futex 不同，这里的等待者是挂起的任务，唤醒是把它重新排回
//!   执行器。
//! - **逻辑 (How)**：`wait(expected)` 在互斥锁内比对值——不匹配则不挂起，
//!   匹配则把节点挂入等待者列表后挂起。`wake_one`/`wake_all` 摘除节点并
//!   经节点上的存取保险箱（[`DepositBox`]）竞争认领权，`Cancellation`
//!   令牌与唤醒方竞争同一保险箱：对每个节点，唤醒与取消恰好一方胜出，
//!   胜者写入结局并唤醒等待者。
//! - **契约 (What)**：唤醒次序为 LIFO（后挂起者先被唤醒）；已摘除节点的
//!   取消是幂等空操作（linked 标志是“节点是否仍在列表中”的唯一判据）；
//!   等待结果显式区分被唤醒与被取消。

use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::concurrent::deposit_box::DepositBox;

const ARMED: u8 = 0;
const WOKEN: u8 = 1;
const CANCELLED: u8 = 2;

struct FutexNode {
    /// 唤醒方与取消方竞争的认领权。
    claim: DepositBox<()>,
    /// 胜者在取走认领权后写入的结局（WOKEN / CANCELLED）。
    outcome: AtomicU8,
    linked: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl FutexNode {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            claim: DepositBox::new(()),
            outcome: AtomicU8::new(ARMED),
            linked: AtomicBool::new(true),
            waker: Mutex::new(Some(waker)),
        })
    }
}

struct FutexInner {
    value: AtomicU64,
    waiters: Mutex<Vec<Arc<FutexNode>>>,
}

impl Default for FutexInner {
    fn default() -> Self {
        Self {
            value: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }
}

/// 等待的结局：被唤醒，或被取消。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Woken,
    Cancelled,
}

/// 任务层面的 futex。
#[derive(Clone, Default)]
pub struct Futex {
    inner: Arc<FutexInner>,
}

impl Futex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取当前值。
    pub fn value(&self) -> u64 {
        self.inner.value.load(Ordering::SeqCst)
    }

    /// 更新当前值。修改后通常需要配合 `wake_one`/`wake_all` 通知等待者。
    pub fn set_value(&self, value: u64) {
        self.inner.value.store(value, Ordering::SeqCst);
    }

    /// 等待值变化：若当前值不等于 `expected` 则不挂起；否则挂起直到被
    /// 唤醒或被取消。
    pub fn wait(&self, expected: u64) -> WaitAwaitable {
        WaitAwaitable {
            inner: self.inner.clone(),
            expected,
            node: None,
            on_suspend: None,
        }
    }

    /// 唤醒至多一个等待者（后挂起者优先），返回实际唤醒数（0 或 1）。
    pub fn wake_one(&self) -> usize {
        let woken = {
            let mut waiters = self.inner.waiters.lock();
            let mut woken = None;
            while let Some(node) = waiters.pop() {
                node.linked.store(false, Ordering::Release);
                if node.claim.take().is_some() {
                    node.outcome.store(WOKEN, Ordering::Release);
                    woken = Some(node.waker.lock().take());
                    break;
                }
                // 认领失败说明取消方已接管，节点留给它收尾即可。
            }
            woken
        };
        match woken {
            Some(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                1
            }
            None => 0,
        }
    }

    /// 唤醒全部等待者，返回实际唤醒数。
    pub fn wake_all(&self) -> usize {
        let wakers = {
            let mut waiters = self.inner.waiters.lock();
            let drained = core::mem::take(&mut *waiters);
            let mut wakers = Vec::with_capacity(drained.len());
            for node in drained.iter().rev() {
                node.linked.store(false, Ordering::Release);
                if node.claim.take().is_some() {
                    node.outcome.store(WOKEN, Ordering::Release);
                    wakers.push(node.waker.lock().take());
                }
            }
            wakers
        };
        let woken = wakers.len();
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
        woken
    }
}

/// futex 等待的取消令牌；与唤醒方竞争同一节点的认领权。
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<FutexInner>,
    node: Arc<FutexNode>,
}

impl Cancellation {
    /// 尝试取消对应的等待。返回 `true` 当且仅当本次调用赢得认领；
    /// 已被唤醒或已取消的节点上调用是幂等空操作。
    pub fn cancel(&self) -> bool {
        let waker = {
            let mut waiters = self.inner.waiters.lock();
            if self.node.claim.take().is_none() {
                return false;
            }
            self.node.outcome.store(CANCELLED, Ordering::Release);
            // linked 为 false 表示唤醒方已摘除节点，无须再动列表。
            if self.node.linked.swap(false, Ordering::AcqRel) {
                waiters.retain(|candidate| !Arc::ptr_eq(candidate, &self.node));
            }
            self.node.waker.lock().take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

/// `Futex::wait` 返回的可等待对象。
pub struct WaitAwaitable {
    inner: Arc<FutexInner>,
    expected: u64,
    node: Option<Arc<FutexNode>>,
    on_suspend: Option<Box<dyn FnOnce(Cancellation) + Send>>,
}

impl WaitAwaitable {
    /// 注册挂起钩子：真实挂起发生时内联执行，接收取消令牌。
    /// 值不匹配而未挂起时钩子不会被调用。
    pub fn on_suspend<C>(mut self, hook: C) -> Self
    where
        C: FnOnce(Cancellation) + Send + 'static,
    {
        self.on_suspend = Some(Box::new(hook));
        self
    }
}

impl core::future::Future for WaitAwaitable {
    type Output = WaitStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitStatus> {
        let this = self.get_mut();
        match &this.node {
            None => {
                let node = {
                    let mut waiters = this.inner.waiters.lock();
                    if this.inner.value.load(Ordering::SeqCst) != this.expected {
                        return Poll::Ready(WaitStatus::Woken);
                    }
                    let node = FutexNode::new(cx.waker().clone());
                    waiters.push(node.clone());
                    node
                };
                this.node = Some(node.clone());
                if let Some(hook) = this.on_suspend.take() {
                    hook(Cancellation {
                        inner: this.inner.clone(),
                        node,
                    });
                }
                Poll::Pending
            }
            Some(node) => match node.outcome.load(Ordering::Acquire) {
                WOKEN => Poll::Ready(WaitStatus::Woken),
                CANCELLED => Poll::Ready(WaitStatus::Cancelled),
                _ => {
                    *node.waker.lock() = Some(cx.waker().clone());
                    match node.outcome.load(Ordering::Acquire) {
                        WOKEN => Poll::Ready(WaitStatus::Woken),
                        CANCELLED => Poll::Ready(WaitStatus::Cancelled),
                        // 认领已被取走但结局尚未写入：胜者随后必然再次唤醒
                        _ => Poll::Pending,
                    }
                }
            },
        }
    }
}
