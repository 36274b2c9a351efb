//! SQE/CQE 往返的 64 位用户数据编码与套接字标识。
//!
//! cookie 布局：最高字节是模式标签，低 48 位是载荷——套接字标识或发送
//! 缓冲页指针（x86-64/aarch64 用户态指针均落在 48 位内）。

use core::fmt;

pub(crate) const MODE_POLL: u8 = 0;
pub(crate) const MODE_ACCEPT: u8 = 1;
pub(crate) const MODE_RECV: u8 = 2;
pub(crate) const MODE_SEND: u8 = 3;
pub(crate) const MODE_SHUTDOWN: u8 = 4;
pub(crate) const MODE_CLOSE: u8 = 5;

/// 套接字标识：fd 加一个 8 位版本号。
///
/// 关闭路径会推进版本号，携带旧版本的标识在所有路径上都是静默空操作，
/// 以此杜绝 fd 复用后的串话。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    fd: i32,
    version: u8,
}

impl SocketId {
    pub fn new(fd: i32, version: u8) -> Self {
        Self { fd, version }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub(crate) fn to_raw(self) -> u64 {
        (self.fd as u32 as u64) | ((self.version as u64) << 32)
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self {
            fd: raw as u32 as i32,
            version: (raw >> 32) as u8,
        }
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId[{}@{}]", self.fd, self.version)
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// SQE 携带的 64 位 cookie。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct UserData(u64);

impl UserData {
    const PAYLOAD_MASK: u64 = (1 << 48) - 1;

    pub(crate) fn for_socket(mode: u8, socket_id: SocketId) -> Self {
        Self(((mode as u64) << 56) | (socket_id.to_raw() & Self::PAYLOAD_MASK))
    }

    pub(crate) fn for_buffer(mode: u8, buffer: *mut u8) -> Self {
        Self(((mode as u64) << 56) | (buffer as u64 & Self::PAYLOAD_MASK))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn mode(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub(crate) fn socket_id(self) -> SocketId {
        SocketId::from_raw(self.0 & Self::PAYLOAD_MASK)
    }

    pub(crate) fn buffer(self) -> *mut u8 {
        (self.0 & Self::PAYLOAD_MASK) as *mut u8
    }
}
