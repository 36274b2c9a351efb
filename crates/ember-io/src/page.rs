//! 页面分配器：系统基线、缓存层与带尾注的发送缓冲分配器。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：接收 buffer ring 与发送缓冲都以“页”为单位流转，
//!   分配器必须线程安全；热路径在系统分配器之前叠一层无锁缓存。
//! - **逻辑 (How)**：缓存层把空闲页地址存进有界 MPMC 队列，取不到时落回
//!   上游；统计计数只用 relaxed（诊断用途，不参与同步）。发送缓冲分配器
//!   在页尾保留一个 [`SocketId`] 尾注，回收路径据此识别过期发送。
//! - **契约 (What)**：`allocate` 返回的页面长度为 `page_size()`，对齐到
//!   上游页大小；`deallocate` 只接受本分配器（或其上游）分配的页面。

use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::sync::{Arc, OnceLock};

use ember_core::ConcurrentBoundedQueue;

use crate::service::SocketId;

/// 线程安全的页面提供者。
pub trait PageAllocator: Send + Sync {
    /// 单页字节数。
    fn page_size(&self) -> usize;

    fn allocate(&self) -> *mut u8;

    fn deallocate(&self, page: *mut u8);

    /// 批量分配，默认逐页退化。
    fn allocate_n(&self, pages: &mut Vec<*mut u8>, count: usize) {
        pages.reserve(count);
        for _ in 0..count {
            pages.push(self.allocate());
        }
    }

    /// 批量释放，默认逐页退化。
    fn deallocate_n(&self, pages: &[*mut u8]) {
        for page in pages {
            self.deallocate(*page);
        }
    }
}

fn os_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf 无前置条件。
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

/// 直接走全局分配器的基线实现，页大小与对齐取 OS 页。
pub struct SystemPageAllocator;

impl SystemPageAllocator {
    pub fn shared() -> &'static Arc<SystemPageAllocator> {
        static INSTANCE: OnceLock<Arc<SystemPageAllocator>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(SystemPageAllocator))
    }

    fn layout(&self) -> Layout {
        let size = os_page_size();
        // SAFETY 不变量：os_page_size 恒为 2 的幂且非零。
        Layout::from_size_align(size, size).expect("OS 页大小必然构成合法布局")
    }
}

impl PageAllocator for SystemPageAllocator {
    fn page_size(&self) -> usize {
        os_page_size()
    }

    fn allocate(&self) -> *mut u8 {
        let layout = self.layout();
        // SAFETY: 布局非零大小。
        let page = unsafe { alloc(layout) };
        if page.is_null() {
            handle_alloc_error(layout);
        }
        page
    }

    fn deallocate(&self, page: *mut u8) {
        // SAFETY: 契约要求 page 来自本分配器的 allocate。
        unsafe { dealloc(page, self.layout()) }
    }
}

/// 在上游之前叠一层无锁空闲页缓存。
pub struct CachedPageAllocator {
    upstream: Arc<dyn PageAllocator>,
    cache: ConcurrentBoundedQueue<usize>,
    hit: AtomicUsize,
    miss: AtomicUsize,
}

impl CachedPageAllocator {
    pub fn new(upstream: Arc<dyn PageAllocator>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            cache: ConcurrentBoundedQueue::new(capacity),
            hit: AtomicUsize::new(0),
            miss: AtomicUsize::new(0),
        })
    }

    /// 缓存命中数（relaxed 统计，仅供诊断）。
    pub fn cache_hit(&self) -> usize {
        self.hit.load(Ordering::Relaxed)
    }

    pub fn cache_miss(&self) -> usize {
        self.miss.load(Ordering::Relaxed)
    }
}

impl PageAllocator for CachedPageAllocator {
    fn page_size(&self) -> usize {
        self.upstream.page_size()
    }

    fn allocate(&self) -> *mut u8 {
        match self.cache.try_pop::<true, false>() {
            Some(address) => {
                self.hit.fetch_add(1, Ordering::Relaxed);
                address as *mut u8
            }
            None => {
                self.miss.fetch_add(1, Ordering::Relaxed);
                self.upstream.allocate()
            }
        }
    }

    fn deallocate(&self, page: *mut u8) {
        if self.cache.try_push::<true, false>(page as usize).is_err() {
            self.upstream.deallocate(page);
        }
    }
}

impl Drop for CachedPageAllocator {
    fn drop(&mut self) {
        while let Some(address) = self.cache.try_pop::<true, false>() {
            self.upstream.deallocate(address as *mut u8);
        }
    }
}

/// 发送缓冲页尾注：记录目标套接字，回收路径据此丢弃过期发送。
#[derive(Clone, Copy)]
pub(crate) struct SendBufferFooter {
    pub(crate) socket_id: SocketId,
}

/// 把上游页面裁短一个尾注的发送缓冲分配器，并维护在途页计数。
pub struct SendBufferAllocator {
    upstream: Arc<dyn PageAllocator>,
    outstanding: AtomicIsize,
}

impl SendBufferAllocator {
    pub fn new(upstream: Arc<dyn PageAllocator>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            outstanding: AtomicIsize::new(0),
        })
    }

    /// 当前在途（已分配未归还）的发送缓冲页数。
    pub fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub(crate) fn read_footer(&self, page: *mut u8) -> SendBufferFooter {
        // SAFETY: page 来自本分配器，其上游页面在 page_size() 偏移之后恰好
        // 保留了一个尾注的空间。
        unsafe {
            (page.add(self.page_size()) as *const SendBufferFooter).read_unaligned()
        }
    }

    pub(crate) fn write_footer(&self, page: *mut u8, footer: SendBufferFooter) {
        // SAFETY: 同 read_footer。
        unsafe {
            (page.add(self.page_size()) as *mut SendBufferFooter).write_unaligned(footer);
        }
    }
}

impl PageAllocator for SendBufferAllocator {
    fn page_size(&self) -> usize {
        self.upstream.page_size() - core::mem::size_of::<SendBufferFooter>()
    }

    fn allocate(&self) -> *mut u8 {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.upstream.allocate()
    }

    fn deallocate(&self, page: *mut u8) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.upstream.deallocate(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocator_round_trip() {
        let allocator = SystemPageAllocator::shared();
        assert!(allocator.page_size() >= 4096);
        let page = allocator.allocate();
        assert!(!page.is_null());
        // SAFETY: 页面独占，写满一页在界内。
        unsafe {
            core::ptr::write_bytes(page, 0xab, allocator.page_size());
        }
        allocator.deallocate(page);
    }

    #[test]
    fn cached_allocator_hits_after_recycle() {
        let cached = CachedPageAllocator::new(SystemPageAllocator::shared().clone(), 8);
        let page = cached.allocate();
        assert_eq!(0, cached.cache_hit());
        cached.deallocate(page);
        let recycled = cached.allocate();
        assert_eq!(page, recycled, "回收页应命中缓存");
        assert_eq!(1, cached.cache_hit());
        cached.deallocate(recycled);
    }

    #[test]
    fn send_buffer_footer_round_trip() {
        let allocator = SendBufferAllocator::new(SystemPageAllocator::shared().clone());
        assert_eq!(
            SystemPageAllocator::shared().page_size()
                - core::mem::size_of::<SendBufferFooter>(),
            allocator.page_size()
        );
        let page = allocator.allocate();
        assert_eq!(1, allocator.outstanding());
        let socket_id = SocketId::new(77, 3);
        allocator.write_footer(page, SendBufferFooter { socket_id });
        let footer = allocator.read_footer(page);
        assert_eq!(77, footer.socket_id.fd());
        assert_eq!(3, footer.socket_id.version());
        allocator.deallocate(page);
        assert_eq!(0, allocator.outstanding());
    }
}
