//! 存取保险箱：两方竞争场景下恰好一次的所有权转移。
//!
//! 唤醒者与取消者都可能认为自己有权恢复同一个等待者，谁先 `take` 成功谁
//! 获得所有权，输家拿到 `None` 并退化为空操作。回收句柄的失效判定由
//! `Arc` 的身份唯一性承担，无需额外的版本号。

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

const FULL: u8 = 0;
const TAKEN: u8 = 1;

/// 单槽位、恰好一次取出的原子容器。
///
/// # 契约说明（What）
/// - `take` 在所有并发调用中恰好一次返回 `Some`，其余返回 `None`；
/// - 未被取出的值在容器析构时正常释放。
pub struct DepositBox<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: 值的唯一一次移出由 state 的 CAS 串行化。
unsafe impl<T: Send> Send for DepositBox<T> {}
unsafe impl<T: Send> Sync for DepositBox<T> {}

impl<T> DepositBox<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicU8::new(FULL),
            value: UnsafeCell::new(Some(value)),
        }
    }

    /// 竞争取出存放的值；胜者获得 `Some`，其余调用观察到 `None`。
    pub fn take(&self) -> Option<T> {
        if self
            .state
            .compare_exchange(FULL, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        // SAFETY: CAS 胜者独占值的移出权。
        unsafe { (*self.value.get()).take() }
    }

    /// 是否已被取走。
    pub fn taken(&self) -> bool {
        self.state.load(Ordering::Acquire) == TAKEN
    }
}
