//! buffer ring 的内存管理：自行分配环形条目数组，注册后由内核按索引
//! 选取接收缓冲；尾指针由用户态发布。

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, Ordering};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use io_uring::types;

/// 已分配并可注册给内核的 buffer ring。
///
/// # 契约说明（What）
/// - `entries` 必须是 2 的幂（io_uring 的硬性要求）；
/// - `push` 只写本地影子尾指针，`commit` 才对内核发布；
/// - 析构释放环内存，调用方需先完成 `unregister_buf_ring`。
pub(crate) struct BufferRing {
    base: NonNull<types::BufRingEntry>,
    entries: u16,
    tail: u16,
    layout: Layout,
}

// SAFETY: 环内存的写入只发生在输入驱动单线程内，发布通过原子尾指针。
unsafe impl Send for BufferRing {}

impl BufferRing {
    pub(crate) fn new(entries: u16) -> std::io::Result<Self> {
        assert!(entries.is_power_of_two(), "buffer ring 条目数必须是 2 的幂");
        let layout = Layout::array::<types::BufRingEntry>(entries as usize)
            .and_then(|layout| layout.align_to(4096))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        // SAFETY: 布局非零大小。
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base as *mut types::BufRingEntry) else {
            handle_alloc_error(layout);
        };
        Ok(Self {
            base,
            entries,
            tail: 0,
            layout,
        })
    }

    /// 注册用的环基址。
    pub(crate) fn address(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// 把一个页面挂到 `buffer_id` 槽位（覆盖写本地尾部）。
    pub(crate) fn push(&mut self, page: *mut u8, len: u32, buffer_id: u16) {
        let mask = self.entries - 1;
        let index = (self.tail & mask) as usize;
        // SAFETY: index 在环界内，写入发生在发布（commit）之前。
        unsafe {
            let entry = &mut *self.base.as_ptr().add(index);
            entry.set_addr(page as u64);
            entry.set_len(len);
            entry.set_bid(buffer_id);
        }
        self.tail = self.tail.wrapping_add(1);
    }

    /// 向内核发布新的尾指针。
    pub(crate) fn commit(&self) {
        // SAFETY: 共享尾指针位于首个条目的保留字段中，协议由 io_uring 约定。
        unsafe {
            let tail_ptr = types::BufRingEntry::tail(self.base.as_ptr()) as *const AtomicU16;
            (*tail_ptr).store(self.tail, Ordering::Release);
        }
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        // SAFETY: base 来自同布局的 alloc_zeroed。
        unsafe {
            dealloc(self.base.as_ptr() as *mut u8, self.layout);
        }
    }
}
