//! 执行器抽象：统一的“把可调用对象安排到某处执行”的提交面。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：队列、Future、任务运行时都只依赖一个最小提交契约——
//!   `invoke` 要么接受任务，要么原样退回。三个具体实现（原地、独立线程、
//!   线程池）覆盖从测试到生产的全部场景，调用方无须感知差异。
//! - **逻辑 (How)**：对象安全的 [`Executor`] 只承载 `invoke` 与运行者判定；
//!   泛型便利层 [`ExecutorExt`] 在其上拼出 `execute`（返回 Future）与
//!   `submit`（即发即忘）。提交被拒绝时 `execute` 返回无效 Future，
//!   `submit` 返回错误，均不丢失诊断信息。
//! - **契约 (What)**：`invoke` 的拒绝语义为“执行器此刻无法安排执行”，
//!   典型发生在停机阶段；被拒绝的可调用对象随 `Err` 归还调用方处置。

mod current;
mod inplace;
mod new_thread;
mod thread_pool;

pub use current::RunnerScope;
pub use inplace::InplaceExecutor;
pub use new_thread::AlwaysUseNewThreadExecutor;
pub use thread_pool::{ThreadPoolExecutor, ThreadPoolExecutorOptions};

pub(crate) use current::{current_handle, has_current};

use crate::future::{Future, Promise};

/// 类型擦除后的一次性任务。
pub type TaskFunction = Box<dyn FnOnce() + Send + 'static>;

/// 提交面的错误域。
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// 执行器拒绝了提交，通常因为队列已满或正在停机。
    #[error("执行器拒绝了提交，队列已满或已停止")]
    Rejected,
}

/// 执行器的对象安全核心契约。
///
/// # 契约说明（What）
/// - `invoke`：安排 `function` 的最终执行。返回 `Ok(())` 表示执行器已接管
///   （可能已经原地执行完毕）；返回 `Err(function)` 表示拒绝，任务原样退回。
/// - `is_running_in`：当前线程是否正运行在本执行器之内，依赖
///   [`RunnerScope`] 的线程局部标记，无须逐任务记账。
pub trait Executor: Send + Sync {
    fn invoke(&self, function: TaskFunction) -> Result<(), TaskFunction>;

    fn is_running_in(&self) -> bool {
        let marker: *const Self = self;
        current::is_current(marker.cast::<()>())
    }
}

/// 建立在 [`Executor::invoke`] 之上的泛型便利层。
///
/// # 逻辑解析（How）
/// - `execute` 把调用装进一个设置 [`Promise`] 的闭包后提交；拒绝时返回
///   默认构造的无效 Future，调用方以 `valid()` 区分；
/// - `submit` 与 `execute` 一致但不建立结果通道，拒绝映射为
///   [`ExecutorError::Rejected`]。
pub trait ExecutorExt: Executor {
    fn execute<F, R>(&self, function: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        let promise = Promise::<R>::new();
        let future = promise.get_future();
        let boxed: TaskFunction = Box::new(move || {
            promise.set_value(function());
        });
        match self.invoke(boxed) {
            Ok(()) => future,
            Err(_function) => Future::default(),
        }
    }

    fn submit<F>(&self, function: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.invoke(Box::new(function))
            .map_err(|_function| ExecutorError::Rejected)
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}
