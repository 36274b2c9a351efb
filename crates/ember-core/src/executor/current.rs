//! 运行者作用域：线程局部地标记“当前代码正运行在哪个执行器里”。
//!
//! 有了这个标记，`Executor::is_running_in` 与任务的原地续跑判定都无须
//! 逐任务记账；作用域在执行器运行用户代码前进入、返回后恢复，支持嵌套。

use core::cell::{Cell, RefCell};
use core::ptr;
use std::sync::Arc;

use super::Executor;

thread_local! {
    static CURRENT_EXECUTOR: Cell<*const ()> = const { Cell::new(ptr::null()) };
    static CURRENT_HANDLE: RefCell<Option<Arc<dyn Executor>>> = const { RefCell::new(None) };
}

/// 进入/退出执行器上下文的 RAII 守卫。
///
/// # 契约说明（What）
/// - 构造时替换线程局部的当前执行器标记，析构时恢复外层标记；
/// - 守卫绑定当前线程，不可跨线程移动（含裸指针字段，自动 `!Send`）。
pub struct RunnerScope {
    previous_marker: *const (),
    previous_handle: Option<Arc<dyn Executor>>,
}

impl RunnerScope {
    /// 以执行器引用进入作用域；仅记录身份指针，不提供可克隆句柄。
    pub fn enter(executor: &dyn Executor) -> Self {
        let marker = (executor as *const dyn Executor).cast::<()>();
        Self {
            previous_marker: CURRENT_EXECUTOR.replace(marker),
            previous_handle: CURRENT_HANDLE.replace(None),
        }
    }

    /// 以可克隆句柄进入作用域，任务驱动器与工作线程使用这一形态，
    /// 使作用域内的代码（如让出原语）能重新拿到执行器提交新任务。
    pub fn enter_with_handle(executor: Arc<dyn Executor>) -> Self {
        let marker = Arc::as_ptr(&executor).cast::<()>();
        Self {
            previous_marker: CURRENT_EXECUTOR.replace(marker),
            previous_handle: CURRENT_HANDLE.replace(Some(executor)),
        }
    }

    /// 仅以身份指针值进入作用域；供派生线程等拿不到引用的场景使用。
    pub(crate) fn enter_marker(marker: usize) -> Self {
        Self {
            previous_marker: CURRENT_EXECUTOR.replace(marker as *const ()),
            previous_handle: CURRENT_HANDLE.replace(None),
        }
    }
}

impl Drop for RunnerScope {
    fn drop(&mut self) {
        CURRENT_EXECUTOR.set(self.previous_marker);
        CURRENT_HANDLE.replace(self.previous_handle.take());
    }
}

/// 判定 `marker` 是否为当前线程正运行的执行器。
pub(crate) fn is_current(marker: *const ()) -> bool {
    !marker.is_null() && core::ptr::eq(CURRENT_EXECUTOR.get(), marker)
}

/// 当前线程是否处于任一执行器作用域内。
pub(crate) fn has_current() -> bool {
    !CURRENT_EXECUTOR.get().is_null()
}

/// 取得当前执行器的可克隆句柄（若进入作用域时登记过）。
pub(crate) fn current_handle() -> Option<Arc<dyn Executor>> {
    CURRENT_HANDLE.with_borrow(|handle| handle.clone())
}
