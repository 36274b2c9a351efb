//! Future/Promise：单生产者、多消费者的一次性结果通道。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：执行器把任务结果回传给提交方需要一个比通道更轻的
//!   原语：一个 32 位状态字 + 一次性的值存储 + 回调链。状态字直接充当
//!   futex 等待字，阻塞 `get` 不引入额外同步对象。
//! - **逻辑 (How)**：状态字低位是 ready 标志；回调以无锁栈 CAS 头插，
//!   发布值时整链换成密封哨兵并顺序执行。此后注册的回调观察到哨兵，
//!   原地执行。ready 恰好发生一次，由独立的 claim 位裁决。
//! - **契约 (What)**：ready 前注册的回调在发布者线程按 LIFO 执行；
//!   ready 后注册的回调在注册者线程原地执行；重复 `set_value` 仅记录
//!   诊断日志并丢弃新值。
//! - **风险提示 (Trade-offs)**：值一经发布即只读共享，回调与 `get` 都拿
//!   `&T`；移动语义的取值（供 await 使用）以借出/取走标志裁决，混用属于
//!   调用方契约错误，以 panic 暴露。

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use crate::concurrent::sched::{OsSched, SchedInterface};

const READY: u32 = 1;
const CLAIMED: u32 = 2;
const TAKEN: u32 = 4;
const BORROWED: u32 = 8;

/// 超长等待统一钳制到一年，避免换算溢出。
const MAX_WAIT: Duration = Duration::from_secs(86400 * 365);

/// 完成回调的两种形态：引用回调读取值本体；通知回调不触碰值，供
/// await 适配器登记唤醒使用，与值的一次性移出互不别名。
enum Callback<T> {
    Value(Box<dyn FnOnce(&T) + Send>),
    Notify(Box<dyn FnOnce() + Send>),
}

struct CallbackNode<T> {
    next: *mut CallbackNode<T>,
    callback: Callback<T>,
}

/// 密封哨兵：回调链头指向它即表示值已发布，后续注册原地执行。
fn sealed<T>() -> *mut CallbackNode<T> {
    1usize as *mut CallbackNode<T>
}

pub(crate) struct FutureContext<T, S: SchedInterface> {
    state: AtomicU32,
    callbacks: AtomicPtr<CallbackNode<T>>,
    value: UnsafeCell<Option<T>>,
    _sched: PhantomData<fn() -> S>,
}

// SAFETY: 值的写入由 claim 位独占并先于 ready 发布；此后全部访问均为共享
// 读（或由 TAKEN/BORROWED 标志裁决的一次性移出），因此跨线程共享要求
// T: Send + Sync。
unsafe impl<T: Send + Sync, S: SchedInterface> Send for FutureContext<T, S> {}
unsafe impl<T: Send + Sync, S: SchedInterface> Sync for FutureContext<T, S> {}

impl<T, S: SchedInterface> FutureContext<T, S> {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            callbacks: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
            _sched: PhantomData,
        }
    }

    #[inline]
    fn ready(&self) -> bool {
        self.state.load(Ordering::Acquire) & READY != 0
    }

    fn value_ref(&self) -> &T {
        // SAFETY: 仅在观察到 ready（或密封哨兵）之后调用，值已发布且不再被
        // 整体改写。
        unsafe { (*self.value.get()).as_ref().expect("Future 的值已被移出") }
    }

    fn set_value(&self, value: T) {
        if self.state.fetch_or(CLAIMED, Ordering::AcqRel) & CLAIMED != 0 {
            tracing::error!(
                target: "ember_core::future",
                "Promise::set_value 被重复调用，新值被丢弃"
            );
            return;
        }
        // SAFETY: claim 位保证唯一写者，且尚无读者（ready 未发布）。
        unsafe {
            *self.value.get() = Some(value);
        }
        // 先排空 ready 前注册的回调，再发布 ready；取值方在 ready 之后才会
        // 尝试移出值，引用回调因此始终拿到有效引用。
        let mut node = self.callbacks.swap(sealed(), Ordering::AcqRel);
        while !node.is_null() && node != sealed() {
            // SAFETY: 头插链表的节点都来自 Box::into_raw，密封后归本线程独占。
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            match boxed.callback {
                Callback::Value(callback) => callback(self.value_ref()),
                Callback::Notify(callback) => callback(),
            }
        }
        self.state.fetch_or(READY, Ordering::AcqRel);
        S::futex_wake_all(&self.state);
    }

    fn on_finish(&self, callback: Callback<T>) {
        let node = Box::into_raw(Box::new(CallbackNode {
            next: ptr::null_mut(),
            callback,
        }));
        let mut head = self.callbacks.load(Ordering::Acquire);
        loop {
            if head == sealed() {
                // SAFETY: node 尚未共享，收回执行即可。
                let boxed = unsafe { Box::from_raw(node) };
                match boxed.callback {
                    Callback::Value(callback) => {
                        // 引用回调与一次性移出走同一借出裁决，排除别名。
                        let previous = self.state.fetch_or(BORROWED, Ordering::AcqRel);
                        if previous & TAKEN != 0 {
                            panic!("Future 的值已被移出，无法再注册引用回调");
                        }
                        callback(self.value_ref());
                    }
                    Callback::Notify(callback) => callback(),
                }
                return;
            }
            // SAFETY: node 仍为本线程独占，链接头指针。
            unsafe {
                (*node).next = head;
            }
            match self
                .callbacks
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn get(&self) -> &T {
        for _ in 0..64 {
            if self.ready() {
                break;
            }
            core::hint::spin_loop();
        }
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & READY != 0 {
                break;
            }
            S::futex_wait(&self.state, state, None);
        }
        let previous = self.state.fetch_or(BORROWED, Ordering::AcqRel);
        if previous & TAKEN != 0 {
            panic!("Future 的值已被移出，无法再以引用方式读取");
        }
        self.value_ref()
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        if self.ready() {
            return true;
        }
        let timeout = timeout.min(MAX_WAIT);
        let start = Instant::now();
        let deadline = start
            .checked_add(timeout)
            .unwrap_or_else(|| start + MAX_WAIT);
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & READY != 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            S::futex_wait(&self.state, state, Some(deadline - now));
        }
    }

    /// 恰好一次地把值整体移出，供移动语义的 await 使用。
    pub(crate) fn take_value(&self) -> T {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & READY == 0 {
                panic!("Future 尚未就绪，无法移出值");
            }
            if state & (TAKEN | BORROWED) != 0 {
                panic!("Future 的值已被移出或已被共享借出");
            }
            match self.state.compare_exchange_weak(
                state,
                state | TAKEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => state = current,
            }
        }
        // SAFETY: TAKEN 位 CAS 保证唯一移出者，且无共享借用在途。
        unsafe { (*self.value.get()).take().expect("Future 的值已被移出") }
    }
}

impl<T, S: SchedInterface> Drop for FutureContext<T, S> {
    fn drop(&mut self) {
        // 未发布即析构时仅释放回调，不执行（与“清空后不再回调”的契约一致）。
        let mut node = self.callbacks.swap(sealed(), Ordering::AcqRel);
        while !node.is_null() && node != sealed() {
            // SAFETY: 析构期独占，节点来自 Box::into_raw。
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            drop(boxed);
        }
    }
}

/// 结果的消费端句柄；可克隆，多个副本共享同一发布。
///
/// 默认构造的 Future 不关联任何 Promise，大部分操作要求 `valid()`。
pub struct Future<T, S: SchedInterface = OsSched> {
    context: Option<Arc<FutureContext<T, S>>>,
}

impl<T, S: SchedInterface> Default for Future<T, S> {
    fn default() -> Self {
        Self { context: None }
    }
}

impl<T, S: SchedInterface> Clone for Future<T, S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<T, S: SchedInterface> Future<T, S> {
    /// 是否关联了 Promise。
    #[inline]
    pub fn valid(&self) -> bool {
        self.context.is_some()
    }

    /// 关联的 Promise 是否已完成发布。
    #[inline]
    pub fn ready(&self) -> bool {
        self.context.as_ref().is_some_and(|context| context.ready())
    }

    /// 阻塞等待发布完成并返回值的引用。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`valid()` 为真，否则 panic；
    /// - 等待路径为先自旋后 futex，由调度接口 `S` 决定睡眠方式。
    pub fn get(&self) -> &T {
        self.context
            .as_ref()
            .expect("对无效 Future 调用 get")
            .get()
    }

    /// 限时等待发布完成；超时返回 `false`。超长时长钳制到安全范围。
    pub fn wait_for(&self, timeout: Duration) -> bool {
        match &self.context {
            Some(context) => context.wait_for(timeout),
            None => false,
        }
    }

    /// 注册完成回调并解除本句柄与 Promise 的关联。
    ///
    /// 未就绪时回调将在发布者线程执行；已就绪时在当前线程原地执行。
    pub fn on_finish<C>(mut self, callback: C)
    where
        C: FnOnce(&T) + Send + 'static,
    {
        if let Some(context) = self.context.take() {
            context.on_finish(Callback::Value(Box::new(callback)));
        }
    }

    /// 注册不触碰值的完成通知，供 await 适配器登记唤醒。
    pub(crate) fn on_finish_notify<C>(mut self, callback: C)
    where
        C: FnOnce() + Send + 'static,
    {
        if let Some(context) = self.context.take() {
            context.on_finish(Callback::Notify(Box::new(callback)));
        }
    }

    /// 级联：把回调的返回值包装成新的 Future。
    pub fn then<C, R>(self, callback: C) -> Future<R, S>
    where
        C: FnOnce(&T) -> R + Send + 'static,
        R: Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let promise = Promise::<R, S>::new();
        let future = promise.get_future();
        self.on_finish(move |value| {
            promise.set_value(callback(value));
        });
        future
    }

    pub(crate) fn context(&self) -> Option<&Arc<FutureContext<T, S>>> {
        self.context.as_ref()
    }
}

/// 结果的生产端句柄；只可移动，不可克隆。
pub struct Promise<T, S: SchedInterface = OsSched> {
    context: Arc<FutureContext<T, S>>,
}

impl<T, S: SchedInterface> Default for Promise<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: SchedInterface> Promise<T, S> {
    pub fn new() -> Self {
        Self {
            context: Arc::new(FutureContext::new()),
        }
    }

    /// 取得关联到自身的 Future 实例。
    pub fn get_future(&self) -> Future<T, S> {
        Future {
            context: Some(self.context.clone()),
        }
    }

    /// 发布值并进入就绪态；重复调用仅记录诊断并丢弃新值。
    pub fn set_value(&self, value: T) {
        self.context.set_value(value);
    }

    /// 等效于 `get_future().ready()`，省去一对引用计数操作。
    pub fn ready(&self) -> bool {
        self.context.ready()
    }

    /// 等效于 `get_future().on_finish(...)`，不解除自身关联。
    pub fn on_finish<C>(&self, callback: C)
    where
        C: FnOnce(&T) + Send + 'static,
    {
        self.context.on_finish(Callback::Value(Box::new(callback)));
    }

    /// 重置为全新一轮：换入新的共享状态。
    ///
    /// 旧轮次已经取得的 Future 继续观察旧状态；`clear` 之后重新调用
    /// `get_future` 的消费者加入新轮次。
    pub fn clear(&mut self) {
        self.context = Arc::new(FutureContext::new());
    }
}

impl<T, S: SchedInterface> Drop for Promise<T, S> {
    fn drop(&mut self) {
        if !self.context.ready() && Arc::strong_count(&self.context) > 1 {
            tracing::warn!(
                target: "ember_core::future",
                "Promise 在 set_value 之前析构，关联的等待者将永远无法唤醒"
            );
        }
    }
}

/// 倒计数门闩：计数归零时向关联 Future 发布 0。
///
/// 初始计数为 0 时立即就绪；归零后的继续递减是空操作。
pub struct CountDownLatch<S: SchedInterface = OsSched> {
    promise: Promise<usize, S>,
    count: AtomicUsize,
}

impl<S: SchedInterface> CountDownLatch<S> {
    pub fn new(count: usize) -> Self {
        let promise = Promise::new();
        if count == 0 {
            promise.set_value(0);
        }
        Self {
            promise,
            count: AtomicUsize::new(count),
        }
    }

    /// 取得感知归零事件的 Future。
    pub fn get_future(&self) -> Future<usize, S> {
        self.promise.get_future()
    }

    /// 递减计数 `down`；穿过零的那次递减触发发布。
    pub fn count_down(&self, down: usize) {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            let next = current.saturating_sub(down);
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == 0 {
                        self.promise.set_value(0);
                    }
                    return;
                }
                Err(changed) => current = changed,
            }
        }
    }
}
