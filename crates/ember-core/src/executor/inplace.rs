//! 原地执行器：`invoke` 即运行，可选的压平模式保证重入时栈深有界。

use core::cell::{Cell, RefCell};
use std::sync::{Arc, OnceLock};

use super::current::RunnerScope;
use super::{Executor, TaskFunction};

thread_local! {
    static PENDING: RefCell<Vec<TaskFunction>> = const { RefCell::new(Vec::new()) };
    static IN_EXECUTION: Cell<bool> = const { Cell::new(false) };
}

/// 在调用线程上立即执行任务的执行器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 测试与轻量场景不需要线程切换；让第一个提交者原地消化任务还能把
///   “生产者转消费者”的模式拼出来。
///
/// ## 逻辑（How）
/// - 非压平模式：`invoke` 直接运行任务；
/// - 压平模式：任务运行期间产生的重入提交先压栈，最外层调用以 LIFO 次序
///   逐个取出执行。重入深度从“递归栈”变成“显式队列”，栈深有界。
///
/// ## 注意事项（Trade-offs）
/// - 压平状态保存在线程局部：重入天然是线程内现象，单个共享实例可被
///   任意多线程并发使用而互不干扰；
/// - LIFO 次序意味着后提交的重入任务先执行，需要次序保证的调用方应自行
///   编排。
pub struct InplaceExecutor {
    flatten: bool,
}

impl InplaceExecutor {
    pub fn new(flatten: bool) -> Self {
        Self { flatten }
    }

    /// 进程级共享实例（非压平模式）。
    pub fn instance() -> &'static Arc<InplaceExecutor> {
        static INSTANCE: OnceLock<Arc<InplaceExecutor>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(InplaceExecutor::new(false)))
    }
}

impl Executor for InplaceExecutor {
    fn invoke(&self, function: TaskFunction) -> Result<(), TaskFunction> {
        if !self.flatten {
            let _scope = RunnerScope::enter(self);
            function();
            return Ok(());
        }

        if IN_EXECUTION.get() {
            PENDING.with_borrow_mut(|pending| pending.push(function));
            return Ok(());
        }

        let mut next = function;
        loop {
            IN_EXECUTION.set(true);
            {
                let _scope = RunnerScope::enter(self);
                next();
            }
            IN_EXECUTION.set(false);
            match PENDING.with_borrow_mut(|pending| pending.pop()) {
                Some(function) => next = function,
                None => break,
            }
        }
        Ok(())
    }
}
