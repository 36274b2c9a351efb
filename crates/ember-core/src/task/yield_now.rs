//! 让出原语：把当前任务重新排回绑定执行器的队尾。

use core::pin::Pin;
use core::task::{Context, Poll};

use crate::executor::{current_handle, has_current};

/// 主动让出一次执行权。
///
/// 未运行在任何执行器内时立即就绪（无处可让）；否则挂起一次，并把唤醒
/// 提交回当前执行器的队列，使同队列中先行排队的任务得以推进。
pub fn yield_now() -> YieldAwaitable {
    YieldAwaitable {
        yielded: false,
        non_inplace: false,
    }
}

/// `yield_now` 返回的可等待对象。
pub struct YieldAwaitable {
    yielded: bool,
    non_inplace: bool,
}

impl YieldAwaitable {
    /// 强制真实挂起一次：即便没有绑定执行器（此时默认路径是不挂起），
    /// 也让任务经历一次完整的挂起-唤醒往返。
    pub fn set_non_inplace(mut self) -> Self {
        self.non_inplace = true;
        self
    }
}

impl core::future::Future for YieldAwaitable {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        if !has_current() && !this.non_inplace {
            return Poll::Ready(());
        }
        this.yielded = true;
        match current_handle() {
            Some(executor) => {
                // 经执行器队列回投唤醒，让出效果对同队列任务可见。
                let waker = cx.waker().clone();
                if let Err(job) = executor.invoke(Box::new(move || waker.wake())) {
                    job();
                }
            }
            None => cx.waker().wake_by_ref(),
        }
        Poll::Pending
    }
}
