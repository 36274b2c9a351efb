#![doc = "ember-io: 基于 io_uring 的网络 I/O 服务。"]
#![doc = ""]
#![doc = "输入环以 `IORING_SETUP_SUBMIT_ALL` 建立，multishot accept/recv 配合"]
#![doc = "buffer ring 把接收数据零拷贝地交付为 [`cord::Cord`] 片段；发送经"]
#![doc = "全局队列合并后落到每工作线程的发送环。服务本体仅在 Linux 上可用，"]
#![doc = "标识、错误、Cord 与页面分配器在全部平台编译。"]

pub mod cord;
pub mod error;
pub mod page;
pub mod service;

pub use cord::Cord;
pub use error::{Error, ServiceError};
pub use page::{CachedPageAllocator, PageAllocator, SendBufferAllocator, SystemPageAllocator};
pub use service::{NetworkServiceOptions, SocketId};

#[cfg(target_os = "linux")]
pub use service::NetworkIoService;
