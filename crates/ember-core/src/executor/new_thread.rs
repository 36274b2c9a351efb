//! 每次提交都新建线程的执行器，主要服务测试场景。

use std::sync::{Arc, OnceLock};
use std::thread;

use super::current::RunnerScope;
use super::{Executor, TaskFunction};

/// 为每个任务派生一个独立分离线程的执行器。
///
/// 任务在新线程中带着本执行器的运行者作用域执行，因此任务内部的
/// `is_running_in` 判定与线程池行为一致。线程句柄被有意分离，进程退出时
/// 未完成的任务随进程终止。
pub struct AlwaysUseNewThreadExecutor;

impl AlwaysUseNewThreadExecutor {
    /// 进程级共享实例。
    pub fn instance() -> &'static Arc<AlwaysUseNewThreadExecutor> {
        static INSTANCE: OnceLock<Arc<AlwaysUseNewThreadExecutor>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(AlwaysUseNewThreadExecutor))
    }
}

impl Executor for AlwaysUseNewThreadExecutor {
    fn invoke(&self, function: TaskFunction) -> Result<(), TaskFunction> {
        let marker: *const Self = self;
        let marker = marker as usize;
        thread::Builder::new()
            .name("ember-detached".to_string())
            .spawn(move || {
                let _scope = RunnerScope::enter_marker(marker);
                function();
            })
            .expect("派生分离线程失败");
        Ok(())
    }
}
