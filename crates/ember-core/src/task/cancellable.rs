//! 可取消适配器：让调用方观察“完成或被取消”二选一的结局。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：任务本身不内建取消；需要取消能力时，把任意可等待
//!   对象包进 [`Cancellable`]，外部持有一次性的 [`CancellationToken`]。
//! - **逻辑 (How)**：完成方与取消方竞争同一个存取保险箱
//!   （[`DepositBox`]）：内层完成时尝试取走认领权，取消方同样尝试取走。
//!   恰好一方成功；取消胜出则唤醒等待者并使结果为空，完成胜出则取消
//!   退化为空操作。
//! - **契约 (What)**：结果为 `Option<T>`——取消先于完成时为 `None`；
//!   令牌幂等，仅胜出的那次调用返回 `true`；`on_suspend` 在首次真实挂起
//!   时内联地把令牌交给调用方注册的钩子。

use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::concurrent::deposit_box::DepositBox;

struct CancelShared {
    /// 完成方与取消方竞争的认领权；被取走即代表裁决完成。
    claim: DepositBox<()>,
    waker: Mutex<Option<Waker>>,
}

/// 一次性取消令牌；可克隆，所有副本共享同一次裁决。
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<CancelShared>,
}

impl CancellationToken {
    /// 尝试取消。返回 `true` 当且仅当本次调用赢得了与完成方的竞争；
    /// 重复调用与败者调用均返回 `false`。
    pub fn cancel(&self) -> bool {
        if self.shared.claim.take().is_none() {
            return false;
        }
        if let Some(waker) = self.shared.waker.lock().take() {
            waker.wake();
        }
        true
    }
}

/// 包装任意 Future，使其可被外部取消；输出变为 `Option`。
pub struct Cancellable<F: core::future::Future> {
    inner: Option<Pin<Box<F>>>,
    shared: Arc<CancelShared>,
    on_suspend: Option<Box<dyn FnOnce(CancellationToken) + Send>>,
}

impl<F: core::future::Future> Cancellable<F> {
    pub fn new(future: F) -> Self {
        Self {
            inner: Some(Box::pin(future)),
            shared: Arc::new(CancelShared {
                claim: DepositBox::new(()),
                waker: Mutex::new(None),
            }),
            on_suspend: None,
        }
    }

    /// 注册挂起钩子：首次真实挂起时在等待者线程内联执行，接收取消令牌。
    /// 内层一次挂起都没有发生（首轮即完成）时钩子不会被调用。
    pub fn on_suspend<C>(mut self, hook: C) -> Self
    where
        C: FnOnce(CancellationToken) + Send + 'static,
    {
        self.on_suspend = Some(Box::new(hook));
        self
    }

    /// 直接取得取消令牌，适合在提交任务之前就要持有令牌的场景。
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: self.shared.clone(),
        }
    }
}

impl<F: core::future::Future> core::future::Future for Cancellable<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // 认领权已被取走而不是被本次 poll 取走，只可能是取消方胜出。
        if this.shared.claim.taken() {
            this.inner = None;
            return Poll::Ready(None);
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll(cx) {
            Poll::Ready(value) => {
                this.inner = None;
                if this.shared.claim.take().is_some() {
                    Poll::Ready(Some(value))
                } else {
                    // 取消方抢先裁决，完成的值被丢弃。
                    Poll::Ready(None)
                }
            }
            Poll::Pending => {
                *this.shared.waker.lock() = Some(cx.waker().clone());
                if this.shared.claim.taken() {
                    this.inner = None;
                    return Poll::Ready(None);
                }
                if let Some(hook) = this.on_suspend.take() {
                    hook(CancellationToken {
                        shared: this.shared.clone(),
                    });
                }
                Poll::Pending
            }
        }
    }
}
