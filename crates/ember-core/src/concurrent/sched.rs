//! 调度接口：对“在一个 32 位原子字上等待/唤醒”的能力做最小抽象。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：有界队列的槽位版本号与 Future 的就绪字都需要在值未就绪时
//!   阻塞等待、在发布后精准唤醒。把这层能力抽象为 [`SchedInterface`]，
//!   上层容器即可在 OS futex 与用户态模拟之间自由替换，而热路径保持单态化。
//! - **逻辑 (How)**：接口语义对齐 Linux `futex(2)`——`futex_wait` 仅在
//!   `*word == expected` 时睡眠，且允许虚假唤醒；`futex_wake_*` 唤醒等待者。
//!   调用方必须以“重新检查 + 循环”的方式使用，这是 futex 家族的标准纪律。
//! - **契约 (What)**：实现必须线程安全且无锁序要求之外的副作用；
//!   `futex_wait` 返回并不意味着条件成立。

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::thread;

/// 等待/唤醒原语的抽象接口。
///
/// # 契约说明（What）
/// - `futex_wait`：若 `word` 当前值不等于 `expected` 立即返回；否则睡眠直到
///   被唤醒、超时或虚假唤醒。调用方必须循环重查条件。
/// - `futex_wake_one` / `futex_wake_all`：唤醒至多一个 / 全部等待者；
///   允许实现放大为“全部唤醒”，等待方的重查循环会吸收多余唤醒。
/// - `usleep`：短暂让出 CPU，供自旋退避与 `join` 类轮询使用。
///
/// # 风险提示（Trade-offs）
/// - 接口按“关联函数”而非 `&self` 设计：等待字本身就是状态，实现不持有数据，
///   这样泛型容器无需存储接口实例即可保持零开销。
pub trait SchedInterface: Send + Sync + 'static {
    fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>);

    fn futex_wake_one(word: &AtomicU32);

    fn futex_wake_all(word: &AtomicU32);

    fn usleep(duration: Duration) {
        thread::sleep(duration);
    }
}

/// 默认调度接口：Linux 上直接走 `SYS_futex`，其余平台退化为条件变量模拟。
pub struct OsSched;

#[cfg(target_os = "linux")]
impl SchedInterface for OsSched {
    fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let timespec = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(core::ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: word 指针在整个调用期间有效；FUTEX_WAIT 在值不匹配时立即
        // 返回 EAGAIN，不会访问越界内存。返回值被有意忽略，统一由调用方的
        // 重查循环兜底（EINTR / ETIMEDOUT / EAGAIN 均等价于虚假唤醒）。
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                timespec_ptr,
                0usize,
                0u32,
            );
        }
    }

    fn futex_wake_one(word: &AtomicU32) {
        // SAFETY: 仅传递指针给内核比较地址，无解引用语义。
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                0usize,
                0usize,
                0u32,
            );
        }
    }

    fn futex_wake_all(word: &AtomicU32) {
        // SAFETY: 同 futex_wake_one。
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
                0usize,
                0usize,
                0u32,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl SchedInterface for OsSched {
    fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        CondvarSched::futex_wait(word, expected, timeout);
    }

    fn futex_wake_one(word: &AtomicU32) {
        CondvarSched::futex_wake_one(word);
    }

    fn futex_wake_all(word: &AtomicU32) {
        CondvarSched::futex_wake_all(word);
    }
}

const BUCKET_COUNT: usize = 64;

struct Bucket {
    lock: parking_lot::Mutex<()>,
    condvar: parking_lot::Condvar,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            lock: parking_lot::Mutex::new(()),
            condvar: parking_lot::Condvar::new(),
        }
    }
}

static BUCKETS: [Bucket; BUCKET_COUNT] = [const { Bucket::new() }; BUCKET_COUNT];

fn bucket_of(word: &AtomicU32) -> &'static Bucket {
    let address = word.as_ptr() as usize;
    // 低位抹掉对齐噪声后按桶数取模，与内核 futex 哈希同一思路。
    &BUCKETS[(address >> 4) % BUCKET_COUNT]
}

/// 用户态 futex 模拟：按等待字地址哈希到固定桶，在桶的条件变量上睡眠。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为非 Linux 平台和测试场景提供可替换实现，同时示范绿色线程运行时
///   接入 [`SchedInterface`] 时需要满足的最小语义。
///
/// ## 逻辑（How）
/// - `futex_wait` 先取桶锁，再以 `SeqCst` 重查等待字；唤醒方同样持桶锁后
///   `notify_all`。锁把“检查-睡眠”与“修改-唤醒”序列化，排除丢失唤醒。
///
/// ## 注意事项（Trade-offs）
/// - `futex_wake_one` 同样广播 `notify_all`：桶内可能混居多个等待字，
///   定向唤醒无法实现；等待方的重查循环保证正确性，代价是偶发空转。
pub struct CondvarSched;

impl SchedInterface for CondvarSched {
    fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let bucket = bucket_of(word);
        let mut guard = bucket.lock.lock();
        if word.load(Ordering::SeqCst) != expected {
            return;
        }
        match timeout {
            Some(timeout) => {
                bucket.condvar.wait_for(&mut guard, timeout);
            }
            None => bucket.condvar.wait(&mut guard),
        }
    }

    fn futex_wake_one(word: &AtomicU32) {
        let bucket = bucket_of(word);
        let _guard = bucket.lock.lock();
        bucket.condvar.notify_all();
    }

    fn futex_wake_all(word: &AtomicU32) {
        let bucket = bucket_of(word);
        let _guard = bucket.lock.lock();
        bucket.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn wait_wakes_on_value_change<S: SchedInterface>() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            thread::spawn(move || {
                while word.load(Ordering::SeqCst) == 0 {
                    S::futex_wait(&word, 0, Some(Duration::from_millis(50)));
                }
            })
        };
        thread::sleep(Duration::from_millis(10));
        word.store(1, Ordering::SeqCst);
        S::futex_wake_all(&word);
        waiter.join().expect("等待线程必须被唤醒并退出");
    }

    #[test]
    fn os_sched_wait_wakes_on_value_change() {
        wait_wakes_on_value_change::<OsSched>();
    }

    #[test]
    fn condvar_sched_wait_wakes_on_value_change() {
        wait_wakes_on_value_change::<CondvarSched>();
    }

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(7);
        OsSched::futex_wait(&word, 0, None);
        CondvarSched::futex_wait(&word, 0, None);
    }
}
