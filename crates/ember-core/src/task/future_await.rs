//! 把 [`crate::future::Future`] 适配为可 await 的对象。
//!
//! 两种形态对应两种取值语义：
//! - [`FutureAwaitable`]（`future.await` 的默认形态）把值整体移出，
//!   对应右值语义，恰好一次；
//! - [`SharedFutureAwaitable`] 以克隆返回，对应共享语义，可多次等待。

use core::pin::Pin;
use core::task::{Context, Poll};

use crate::concurrent::sched::{OsSched, SchedInterface};

/// 移动语义的 Future 适配器：完成时把值从共享状态中移出。
pub struct FutureAwaitable<T, S: SchedInterface = OsSched> {
    future: crate::future::Future<T, S>,
    registered: bool,
}

impl<T, S: SchedInterface> FutureAwaitable<T, S> {
    pub fn new(future: crate::future::Future<T, S>) -> Self {
        Self {
            future,
            registered: false,
        }
    }
}

impl<T, S> core::future::Future for FutureAwaitable<T, S>
where
    T: Send + Sync + 'static,
    S: SchedInterface,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        assert!(this.future.valid(), "await 了一个无效的 Future");
        if this.future.ready() {
            let value = this
                .future
                .context()
                .expect("valid 已检查")
                .take_value();
            return Poll::Ready(value);
        }
        if !this.registered {
            this.registered = true;
            let waker = cx.waker().clone();
            this.future.clone().on_finish_notify(move || waker.wake());
        }
        if this.future.ready() {
            let value = this
                .future
                .context()
                .expect("valid 已检查")
                .take_value();
            Poll::Ready(value)
        } else {
            Poll::Pending
        }
    }
}

/// 共享语义的 Future 适配器：完成时以克隆返回，底层值保持可共享。
pub struct SharedFutureAwaitable<T, S: SchedInterface = OsSched> {
    future: crate::future::Future<T, S>,
    registered: bool,
}

impl<T, S> core::future::Future for SharedFutureAwaitable<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: SchedInterface,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        assert!(this.future.valid(), "await 了一个无效的 Future");
        if this.future.ready() {
            return Poll::Ready(this.future.get().clone());
        }
        if !this.registered {
            this.registered = true;
            let waker = cx.waker().clone();
            this.future.clone().on_finish_notify(move || waker.wake());
        }
        if this.future.ready() {
            Poll::Ready(this.future.get().clone())
        } else {
            Poll::Pending
        }
    }
}

impl<T, S> core::future::IntoFuture for crate::future::Future<T, S>
where
    T: Send + Sync + 'static,
    S: SchedInterface,
{
    type Output = T;
    type IntoFuture = FutureAwaitable<T, S>;

    fn into_future(self) -> FutureAwaitable<T, S> {
        FutureAwaitable::new(self)
    }
}

impl<T, S: SchedInterface> crate::future::Future<T, S> {
    /// 取得共享语义的可等待形态；与其他消费者共存，不移出值。
    pub fn shared_awaitable(&self) -> SharedFutureAwaitable<T, S>
    where
        T: Clone,
    {
        SharedFutureAwaitable {
            future: self.clone(),
            registered: false,
        }
    }
}
