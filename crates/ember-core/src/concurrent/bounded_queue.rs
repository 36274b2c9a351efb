//! 有界 MPMC 队列：固定容量、按票号严格 FIFO、槽位版本号握手。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：执行器的任务分发、网络服务的提交/发送通道都需要一个
//!   可在“单/多生产者 × 单/多消费者 × 阻塞/自旋/非阻塞”之间自由组合的
//!   定容队列。把组合维度放进 const 泛型，热路径保持单态化，冷路径共享实现。
//! - **逻辑 (How)**：`push_index`/`pop_index` 以 fetch-add 发放全局票号；
//!   票号对容量取模定位槽位。槽位携带一个 32 位版本号：第 `r` 轮写者等待
//!   `2r`，发布 `2r + 1`；读者等待 `2r + 1`，消费后发布 `2r + 2`（即下一轮
//!   的 `2(r+1)`）。版本号同时充当 futex 等待字。
//! - **契约 (What)**：同一队列内按票号严格 FIFO；try 变体只报告“无法推进”；
//!   `clear`/`reserve_and_clear` 仅允许在静止期调用（`&mut self` 约束之）。
//! - **风险提示 (Trade-offs)**：版本号取 32 位以匹配 futex 字宽，单槽位需
//!   轮转 2^31 轮才会回绕，工程上不可达；大于容量的批量操作要求对端保持
//!   活跃，否则互相等待。

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use core::time::Duration;
use std::time::Instant;

use super::sched::{OsSched, SchedInterface};

struct Slot<T> {
    version: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            version: AtomicU32::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// 定容 MPMC 队列，三个 const 开关对应三组运行策略：
///
/// - `CONCURRENT`：本侧游标是否存在并发竞争。单生产者/单消费者场景关闭后
///   退化为普通读改写，省去原子 RMW。
/// - `FUTEX_WAIT`：槽位未就绪时是 futex 睡眠（true）还是自旋（false）。
/// - `FUTEX_WAKE`：发布后是否需要唤醒对侧的 futex 等待者；对侧从不睡眠时
///   关闭以省掉唤醒判定。
///
/// # 契约说明（What）
/// - **前置条件**：关闭 `CONCURRENT` 的一侧必须确实只有一个线程操作；
///   `try_pop_n` 系列要求单消费者。
/// - **后置条件**：阻塞变体必定成功；try 变体失败时入参原样归还。
pub struct ConcurrentBoundedQueue<T, S: SchedInterface = OsSched> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    shift: u32,
    push_index: AtomicU64,
    pop_index: AtomicU64,
    push_notify_index: AtomicU64,
    pop_notify_index: AtomicU64,
    _sched: PhantomData<fn() -> S>,
}

// SAFETY: 槽位访问由版本号握手串行化，值仅在发布前由唯一写者、消费时由唯一
// 读者触碰，因此只要 T 可跨线程移动，整个队列即可跨线程共享。
unsafe impl<T: Send, S: SchedInterface> Send for ConcurrentBoundedQueue<T, S> {}
unsafe impl<T: Send, S: SchedInterface> Sync for ConcurrentBoundedQueue<T, S> {}

impl<T, S: SchedInterface> Default for ConcurrentBoundedQueue<T, S> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T, S: SchedInterface> ConcurrentBoundedQueue<T, S> {
    /// 以不小于 `capacity_hint` 的 2 的幂容量构造队列。
    pub fn new(capacity_hint: usize) -> Self {
        let capacity = capacity_hint.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            mask: capacity as u64 - 1,
            shift: capacity.trailing_zeros(),
            push_index: AtomicU64::new(0),
            pop_index: AtomicU64::new(0),
            push_notify_index: AtomicU64::new(0),
            pop_notify_index: AtomicU64::new(0),
            _sched: PhantomData,
        }
    }

    /// 实际容量（入参向上取整到 2 的幂后的值）。
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 当前积压元素数；并发期间是瞬时快照，静止期精确。
    #[inline]
    pub fn size(&self) -> usize {
        let push = self.push_index.load(Ordering::Acquire);
        let pop = self.pop_index.load(Ordering::Acquire);
        (push.saturating_sub(pop) as usize).min(self.capacity())
    }

    /// 入队一个元素。槽位被占用时按 `FUTEX_WAIT` 选择睡眠或自旋等待。
    pub fn push<const CONCURRENT: bool, const FUTEX_WAIT: bool, const FUTEX_WAKE: bool>(
        &self,
        value: T,
    ) {
        let ticket = self.claim::<CONCURRENT>(&self.push_index, 1);
        let slot = self.slot_at(ticket);
        let expected = self.writable_version(ticket);
        self.wait_version(slot, expected, ticket, true, FUTEX_WAIT);
        // SAFETY: 版本握手保证此刻本线程是该槽位唯一写者，且槽位未构造。
        unsafe {
            (*slot.value.get()).write(value);
        }
        self.commit(slot, expected + 1, ticket, true, FUTEX_WAKE);
    }

    /// 尝试入队；队列满（下一槽位尚不可写）时原样返回元素。
    pub fn try_push<const CONCURRENT: bool, const FUTEX_WAKE: bool>(
        &self,
        value: T,
    ) -> Result<(), T> {
        if CONCURRENT {
            let mut ticket = self.push_index.load(Ordering::Acquire);
            loop {
                let slot = self.slot_at(ticket);
                if slot.version.load(Ordering::Acquire) != self.writable_version(ticket) {
                    return Err(value);
                }
                match self.push_index.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let expected = self.writable_version(ticket);
                        // SAFETY: 票号经 CAS 独占，版本检查已确认槽位可写。
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        self.commit(slot, expected + 1, ticket, true, FUTEX_WAKE);
                        return Ok(());
                    }
                    Err(current) => ticket = current,
                }
            }
        } else {
            let ticket = self.push_index.load(Ordering::Relaxed);
            let slot = self.slot_at(ticket);
            let expected = self.writable_version(ticket);
            if slot.version.load(Ordering::Acquire) != expected {
                return Err(value);
            }
            // SAFETY: 单生产者契约下本线程独占该票号。
            unsafe {
                (*slot.value.get()).write(value);
            }
            self.push_index.store(ticket + 1, Ordering::Relaxed);
            self.commit(slot, expected + 1, ticket, true, FUTEX_WAKE);
            Ok(())
        }
    }

    /// 出队一个元素，空时等待。
    pub fn pop<const CONCURRENT: bool, const FUTEX_WAIT: bool, const FUTEX_WAKE: bool>(
        &self,
    ) -> T {
        let ticket = self.claim::<CONCURRENT>(&self.pop_index, 1);
        let slot = self.slot_at(ticket);
        let expected = self.readable_version(ticket);
        self.wait_version(slot, expected, ticket, false, FUTEX_WAIT);
        // SAFETY: 版本握手保证槽位已构造且本线程是唯一读者。
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        self.commit(slot, expected + 1, ticket, false, FUTEX_WAKE);
        value
    }

    /// 尝试出队；队列空（下一槽位尚不可读）时返回 `None`。
    pub fn try_pop<const CONCURRENT: bool, const FUTEX_WAKE: bool>(&self) -> Option<T> {
        if CONCURRENT {
            let mut ticket = self.pop_index.load(Ordering::Acquire);
            loop {
                let slot = self.slot_at(ticket);
                if slot.version.load(Ordering::Acquire) != self.readable_version(ticket) {
                    return None;
                }
                match self.pop_index.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let expected = self.readable_version(ticket);
                        // SAFETY: 票号经 CAS 独占，版本检查已确认槽位可读。
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        self.commit(slot, expected + 1, ticket, false, FUTEX_WAKE);
                        return Some(value);
                    }
                    Err(current) => ticket = current,
                }
            }
        } else {
            let ticket = self.pop_index.load(Ordering::Relaxed);
            let slot = self.slot_at(ticket);
            let expected = self.readable_version(ticket);
            if slot.version.load(Ordering::Acquire) != expected {
                return None;
            }
            // SAFETY: 单消费者契约下本线程独占该票号。
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            self.pop_index.store(ticket + 1, Ordering::Relaxed);
            self.commit(slot, expected + 1, ticket, false, FUTEX_WAKE);
            Some(value)
        }
    }

    /// 批量入队：一次领取 `[first, first + n)` 连续票号，再逐槽按序发布。
    ///
    /// 并发的消费者只需等待各自槽位的版本号，无须感知批量边界。批量大小
    /// 超过容量时要求消费者保持活跃。
    pub fn push_n<
        const CONCURRENT: bool,
        const FUTEX_WAIT: bool,
        const FUTEX_WAKE: bool,
        I,
    >(
        &self,
        values: I,
    ) where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = values.into_iter();
        let count = iter.len() as u64;
        if count == 0 {
            return;
        }
        let first = self.claim::<CONCURRENT>(&self.push_index, count);
        for (offset, value) in iter.enumerate() {
            let ticket = first + offset as u64;
            let slot = self.slot_at(ticket);
            let expected = self.writable_version(ticket);
            self.wait_version(slot, expected, ticket, true, FUTEX_WAIT);
            // SAFETY: 同 push。
            unsafe {
                (*slot.value.get()).write(value);
            }
            self.commit(slot, expected + 1, ticket, true, FUTEX_WAKE);
        }
    }

    /// 批量入队的回调形态：`fill(offset)` 依次产出批内第 `offset` 个元素。
    pub fn push_n_fill<
        const CONCURRENT: bool,
        const FUTEX_WAIT: bool,
        const FUTEX_WAKE: bool,
        F,
    >(
        &self,
        count: usize,
        mut fill: F,
    ) where
        F: FnMut(u64) -> T,
    {
        if count == 0 {
            return;
        }
        let first = self.claim::<CONCURRENT>(&self.push_index, count as u64);
        for offset in 0..count as u64 {
            let ticket = first + offset;
            let value = fill(offset);
            let slot = self.slot_at(ticket);
            let expected = self.writable_version(ticket);
            self.wait_version(slot, expected, ticket, true, FUTEX_WAIT);
            // SAFETY: 同 push。
            unsafe {
                (*slot.value.get()).write(value);
            }
            self.commit(slot, expected + 1, ticket, true, FUTEX_WAKE);
        }
    }

    /// 批量出队 `count` 个元素追加到 `out`，不足时等待。
    pub fn pop_n<const CONCURRENT: bool, const FUTEX_WAIT: bool, const FUTEX_WAKE: bool>(
        &self,
        out: &mut Vec<T>,
        count: usize,
    ) {
        if count == 0 {
            return;
        }
        out.reserve(count);
        let first = self.claim::<CONCURRENT>(&self.pop_index, count as u64);
        for offset in 0..count as u64 {
            let ticket = first + offset;
            let slot = self.slot_at(ticket);
            let expected = self.readable_version(ticket);
            self.wait_version(slot, expected, ticket, false, FUTEX_WAIT);
            // SAFETY: 同 pop。
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            self.commit(slot, expected + 1, ticket, false, FUTEX_WAKE);
            out.push(value);
        }
    }

    /// 单消费者批量尝试出队：把已就绪的前缀（至多 `max_count` 个）交给
    /// `consume` 的迭代器消费，返回实际出队数。
    ///
    /// 就绪区间跨越环形边界时 `consume` 会被调用两次，分别对应断开的两段，
    /// 与连续内存窗口的语义保持一致。回调未取走的元素由迭代器析构时释放。
    pub fn try_pop_n<const FUTEX_WAKE: bool, C>(&self, mut consume: C, max_count: usize) -> usize
    where
        C: FnMut(&mut Drain<'_, T, S>),
    {
        if max_count == 0 {
            return 0;
        }
        let first = self.pop_index.load(Ordering::Acquire);
        let mut ready = 0u64;
        while ready < max_count as u64 {
            let ticket = first + ready;
            let slot = self.slot_at(ticket);
            if slot.version.load(Ordering::Acquire) != self.readable_version(ticket) {
                break;
            }
            ready += 1;
        }
        if ready == 0 {
            return 0;
        }
        self.pop_index.store(first + ready, Ordering::Release);
        self.drain_range(first, ready, FUTEX_WAKE, &mut consume);
        ready as usize
    }

    /// 单消费者限时批量出队：在 `pop_index` 指向的槽位上等待至多 `timeout`，
    /// 随后把已就绪的前缀交给 `consume`；超时且无就绪元素时返回 0。
    pub fn try_pop_n_exclusively_until<const FUTEX_WAKE: bool, C>(
        &self,
        consume: C,
        max_count: usize,
        timeout: Duration,
    ) -> usize
    where
        C: FnMut(&mut Drain<'_, T, S>),
    {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86400 * 365));
        let first = self.pop_index.load(Ordering::Acquire);
        let slot = self.slot_at(first);
        let readable = self.readable_version(first);
        loop {
            if slot.version.load(Ordering::Acquire) == readable {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.pop_notify_index.fetch_max(first, Ordering::SeqCst);
            let current = slot.version.load(Ordering::SeqCst);
            if current == readable {
                break;
            }
            S::futex_wait(&slot.version, current, Some(deadline - now));
        }
        self.try_pop_n::<FUTEX_WAKE, C>(consume, max_count)
    }

    /// 重置队列。仅允许在无并发访问的静止期调用，由 `&mut self` 约束。
    pub fn clear(&mut self) {
        self.drop_pending();
        *self.push_index.get_mut() = 0;
        *self.pop_index.get_mut() = 0;
        *self.push_notify_index.get_mut() = 0;
        *self.pop_notify_index.get_mut() = 0;
        for slot in self.slots.iter_mut() {
            *slot.version.get_mut() = 0;
        }
    }

    /// 重新分配容量（向上取整到 2 的幂）并重置全部状态。
    pub fn reserve_and_clear(&mut self, capacity_hint: usize) {
        self.drop_pending();
        let capacity = capacity_hint.max(1).next_power_of_two();
        if capacity != self.slots.len() {
            self.slots = (0..capacity).map(|_| Slot::new()).collect();
            self.mask = capacity as u64 - 1;
            self.shift = capacity.trailing_zeros();
        } else {
            for slot in self.slots.iter_mut() {
                *slot.version.get_mut() = 0;
            }
        }
        *self.push_index.get_mut() = 0;
        *self.pop_index.get_mut() = 0;
        *self.push_notify_index.get_mut() = 0;
        *self.pop_notify_index.get_mut() = 0;
    }

    fn drop_pending(&mut self) {
        let first = *self.pop_index.get_mut();
        let last = *self.push_index.get_mut();
        for ticket in first..last {
            let index = (ticket & self.mask) as usize;
            // SAFETY: &mut self 独占整个队列，[pop, push) 区间内的槽位均已
            // 构造且未被消费。
            unsafe {
                self.slots[index].value.get_mut().assume_init_drop();
            }
        }
    }

    #[inline]
    fn capacity_u64(&self) -> u64 {
        self.mask + 1
    }

    #[inline]
    fn slot_at(&self, ticket: u64) -> &Slot<T> {
        &self.slots[(ticket & self.mask) as usize]
    }

    #[inline]
    fn writable_version(&self, ticket: u64) -> u32 {
        ((ticket >> self.shift) * 2) as u32
    }

    #[inline]
    fn readable_version(&self, ticket: u64) -> u32 {
        self.writable_version(ticket) + 1
    }

    #[inline]
    fn claim<const CONCURRENT: bool>(&self, cursor: &AtomicU64, count: u64) -> u64 {
        if CONCURRENT {
            cursor.fetch_add(count, Ordering::AcqRel)
        } else {
            let ticket = cursor.load(Ordering::Relaxed);
            cursor.store(ticket + count, Ordering::Relaxed);
            ticket
        }
    }

    /// 等待槽位版本推进到 `expected`。
    ///
    /// futex 路径的纪律：先把本票号登记到对应 notify 游标（SeqCst RMW），
    /// 再重查版本，最后以当前值进入 futex。对侧提交后以 SeqCst fence 配对
    /// 读取 notify 游标，二者构成全序，排除“登记与提交互相不可见”的丢失
    /// 唤醒窗口；即便唤醒被省略，futex 的值匹配检查也会因版本已变而失败。
    fn wait_version(
        &self,
        slot: &Slot<T>,
        expected: u32,
        ticket: u64,
        push_side: bool,
        use_futex: bool,
    ) {
        if slot.version.load(Ordering::Acquire) == expected {
            return;
        }
        if use_futex {
            let notify = if push_side {
                &self.push_notify_index
            } else {
                &self.pop_notify_index
            };
            loop {
                notify.fetch_max(ticket, Ordering::SeqCst);
                let current = slot.version.load(Ordering::SeqCst);
                if current == expected {
                    return;
                }
                S::futex_wait(&slot.version, current, None);
                if slot.version.load(Ordering::Acquire) == expected {
                    return;
                }
            }
        } else {
            let mut spins = 0u32;
            loop {
                if slot.version.load(Ordering::Acquire) == expected {
                    return;
                }
                spins = spins.wrapping_add(1);
                if spins & 0x3f == 0 {
                    std::thread::yield_now();
                } else {
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// 发布新版本并在需要时唤醒对侧等待者。
    #[inline]
    fn commit(&self, slot: &Slot<T>, new_version: u32, ticket: u64, push_side: bool, wake: bool) {
        slot.version.store(new_version, Ordering::Release);
        if !wake {
            return;
        }
        fence(Ordering::SeqCst);
        let (notify, enabled_ticket) = if push_side {
            // 写者提交使同票号的读者可读
            (&self.pop_notify_index, ticket)
        } else {
            // 读者提交使下一轮写者（ticket + capacity）可写
            (&self.push_notify_index, ticket + self.capacity_u64())
        };
        if notify.load(Ordering::Relaxed) >= enabled_ticket {
            S::futex_wake_all(&slot.version);
        }
    }

    fn drain_range<C>(&self, first: u64, count: u64, wake: bool, consume: &mut C)
    where
        C: FnMut(&mut Drain<'_, T, S>),
    {
        let mut ticket = first;
        let mut remaining = count;
        while remaining > 0 {
            let slot_index = ticket & self.mask;
            let segment = remaining.min(self.capacity_u64() - slot_index);
            let mut drain = Drain {
                queue: self,
                ticket,
                end: ticket + segment,
                wake,
            };
            consume(&mut drain);
            drop(drain);
            ticket += segment;
            remaining -= segment;
        }
    }
}

impl<T, S: SchedInterface> Drop for ConcurrentBoundedQueue<T, S> {
    fn drop(&mut self) {
        self.drop_pending();
    }
}

/// `try_pop_n` 交给回调的消费迭代器，覆盖一段连续票号区间。
///
/// 迭代一个元素即完成该槽位的消费提交；回调返回后剩余元素由析构兜底消费，
/// 保证区间内每个槽位恰好推进一次版本。
pub struct Drain<'a, T, S: SchedInterface = OsSched> {
    queue: &'a ConcurrentBoundedQueue<T, S>,
    ticket: u64,
    end: u64,
    wake: bool,
}

impl<T, S: SchedInterface> Iterator for Drain<'_, T, S> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.ticket == self.end {
            return None;
        }
        let ticket = self.ticket;
        let slot = self.queue.slot_at(ticket);
        // SAFETY: try_pop_n 已确认该槽位可读，且单消费者契约保证独占。
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        let consumed = self.queue.readable_version(ticket) + 1;
        self.queue.commit(slot, consumed, ticket, false, self.wake);
        self.ticket += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (self.end - self.ticket) as usize;
        (len, Some(len))
    }
}

impl<T, S: SchedInterface> ExactSizeIterator for Drain<'_, T, S> {}

impl<T, S: SchedInterface> Drop for Drain<'_, T, S> {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_constructed_with_capacity_one() {
        let queue = ConcurrentBoundedQueue::<usize>::default();
        assert_eq!(1, queue.capacity());
        assert_eq!(0, queue.size());
    }

    #[test]
    fn capacity_ceil_to_pow2() {
        let mut queue = ConcurrentBoundedQueue::<usize>::new(5);
        assert_eq!(8, queue.capacity());
        queue.reserve_and_clear(30);
        assert_eq!(32, queue.capacity());
        assert_eq!(0, queue.size());
    }

    #[test]
    fn drain_releases_unconsumed_rest() {
        let queue = ConcurrentBoundedQueue::<String>::new(4);
        for i in 0..4 {
            queue.push::<true, true, true>(format!("值-{i}"));
        }
        let mut taken = Vec::new();
        let popped = queue.try_pop_n::<true, _>(
            |drain| {
                if let Some(first) = drain.next() {
                    taken.push(first);
                }
                // 其余元素留给迭代器析构释放
            },
            4,
        );
        assert_eq!(4, popped, "就绪前缀必须整体出队");
        assert_eq!(vec!["值-0".to_string()], taken);
        assert_eq!(0, queue.size(), "未显式取走的元素也应被消费掉");
    }
}
