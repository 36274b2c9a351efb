//! I/O 错误域：errno 载体与服务生命周期错误。

use core::fmt;

/// 携带 errno 的轻量错误，格式化为 `Error[<errno>:<strerror>]`。
///
/// 对端引发的错误（如 `ECONNRESET`）通过回调携带它上抛；编程性错误则在
/// 日志中引用后终止进程。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: i32,
}

impl Error {
    /// 捕获当前线程的 `errno`。
    pub fn last_os() -> Self {
        Self {
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    /// 从给定 errno 构造（约定传入正值）。
    pub fn from_raw(errno: i32) -> Self {
        Self { errno }
    }

    pub fn code(&self) -> i32 {
        self.errno
    }

    /// errno 的文本描述。
    pub fn text(&self) -> String {
        std::io::Error::from_raw_os_error(self.errno).to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error[{}:{}]", self.errno, self.text())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

/// 网络服务生命周期操作的错误域。
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("网络服务尚未配置执行器")]
    MissingExecutor,
    #[error("网络服务已经启动")]
    AlreadyStarted,
    #[error("网络服务尚未启动")]
    NotStarted,
    #[error("io_uring 初始化失败: {0}")]
    RingSetup(#[source] std::io::Error),
    #[error("稀疏文件表注册失败: {0}")]
    RegisterFiles(#[source] std::io::Error),
    #[error("buffer ring 注册失败: {0}")]
    RegisterBufferRing(#[source] std::io::Error),
    #[error("eventfd 创建失败: {0}")]
    EventFd(#[source] std::io::Error),
    #[error("任务提交被执行器拒绝")]
    Rejected,
}
