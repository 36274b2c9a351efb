//! 线程池执行器：全局队列 + 工作线程本地队列，可选窃取与周期均衡。
//!
//! # 教案级导览
//!
//! - **意图 (Why)**：生产环境的提交热路径应当尽量落在无竞争的本地队列上；
//!   全局队列承接外部提交与停机哨兵；窃取与均衡在负载倾斜时搬运任务。
//! - **逻辑 (How)**：工作线程循环按“本地（非阻塞）→ 全局（非阻塞）→ 窃取
//!   → 全局（阻塞）”的次序取任务。所有队列都是
//!   [`ConcurrentBoundedQueue`]，停机时向全局队列投放每工作线程一个空哨兵。
//! - **契约 (What)**：单个本地队列内严格 FIFO；跨队列次序不做承诺，开启
//!   窃取或均衡后可能重排。池要求显式 `stop()`：工作线程持有池的共享
//!   引用，析构不会自动发生在停机之前。

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use super::current::RunnerScope;
use super::{Executor, TaskFunction};
use crate::concurrent::bounded_queue::ConcurrentBoundedQueue;

/// 空哨兵表示停机信号。
type PoolTask = Option<TaskFunction>;

thread_local! {
    /// (所属池的身份指针, 工作线程下标)；(0, _) 表示当前线程不是工作线程。
    static CURRENT_WORKER: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
    static STEAL_SEED: Cell<u64> = const { Cell::new(0) };
}

/// 线程池的启动参数。
#[derive(Clone, Debug)]
pub struct ThreadPoolExecutorOptions {
    worker_number: usize,
    global_capacity: usize,
    local_capacity: usize,
    enable_work_stealing: bool,
    balance_interval: Option<Duration>,
}

impl Default for ThreadPoolExecutorOptions {
    fn default() -> Self {
        Self {
            worker_number: 4,
            global_capacity: 1024,
            local_capacity: 128,
            enable_work_stealing: false,
            balance_interval: None,
        }
    }
}

impl ThreadPoolExecutorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_number(mut self, worker_number: usize) -> Self {
        self.worker_number = worker_number.max(1);
        self
    }

    pub fn with_global_capacity(mut self, capacity: usize) -> Self {
        self.global_capacity = capacity;
        self
    }

    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity;
        self
    }

    pub fn with_work_stealing(mut self, enable: bool) -> Self {
        self.enable_work_stealing = enable;
        self
    }

    pub fn with_balance_interval(mut self, interval: Option<Duration>) -> Self {
        self.balance_interval = interval;
        self
    }
}

/// 工作线程池执行器。
pub struct ThreadPoolExecutor {
    global: ConcurrentBoundedQueue<PoolTask>,
    locals: Box<[ConcurrentBoundedQueue<PoolTask>]>,
    enable_work_stealing: bool,
    running: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    balance_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    /// 按配置启动线程池：派生全部工作线程与可选的均衡线程。
    pub fn start(options: ThreadPoolExecutorOptions) -> Arc<Self> {
        let locals = (0..options.worker_number)
            .map(|_| ConcurrentBoundedQueue::new(options.local_capacity))
            .collect();
        let pool = Arc::new(Self {
            global: ConcurrentBoundedQueue::new(options.global_capacity),
            locals,
            enable_work_stealing: options.enable_work_stealing,
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            balance_thread: Mutex::new(None),
        });

        let mut threads = Vec::with_capacity(options.worker_number);
        for index in 0..options.worker_number {
            let worker = pool.clone();
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{index}"))
                .spawn(move || worker.worker_main(index))
                .expect("派生工作线程失败");
            threads.push(handle);
        }
        *pool.threads.lock() = threads;

        if let Some(interval) = options.balance_interval
            && options.worker_number > 1
        {
            let balancer = pool.clone();
            let handle = thread::Builder::new()
                .name("ember-balance".to_string())
                .spawn(move || balancer.balance_main(interval))
                .expect("派生均衡线程失败");
            *pool.balance_thread.lock() = Some(handle);
        }
        pool
    }

    /// 停机：向全局队列投放每工作线程一个空哨兵并等待全部线程退出。
    /// 已入队但未执行的任务被静默丢弃。
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.locals.len() {
            self.global.push::<true, false, true>(None);
        }
        if let Some(handle) = self.balance_thread.lock().take() {
            let _ = handle.join();
        }
        let threads = core::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// 工作线程数。
    pub fn worker_number(&self) -> usize {
        self.locals.len()
    }

    /// 当前工作线程本地队列的积压任务数；在非工作线程上恒为 0。
    /// I/O 服务以此判断池内是否尚有待处理工作。
    pub fn local_task_number(&self) -> usize {
        let (marker, index) = CURRENT_WORKER.get();
        if marker == self.marker() {
            self.locals[index].size()
        } else {
            0
        }
    }

    fn marker(&self) -> usize {
        let marker: *const Self = self;
        marker as usize
    }

    fn worker_main(self: Arc<Self>, index: usize) {
        CURRENT_WORKER.set((self.marker(), index));
        let handle: Arc<dyn Executor> = self.clone();
        let _scope = RunnerScope::enter_with_handle(handle);
        loop {
            if let Some(cell) = self.locals[index].try_pop::<true, false>() {
                match cell {
                    Some(function) => {
                        function();
                        continue;
                    }
                    None => break,
                }
            }
            if let Some(cell) = self.global.try_pop::<true, false>() {
                match cell {
                    Some(function) => {
                        function();
                        continue;
                    }
                    None => break,
                }
            }
            if self.enable_work_stealing && self.try_steal(index) {
                continue;
            }
            match self.global.pop::<true, true, false>() {
                Some(function) => function(),
                None => break,
            }
        }
        CURRENT_WORKER.set((0, 0));
    }

    /// 从随机同伴的本地队列窃取约一半积压，搬进自己的本地队列。
    fn try_steal(&self, thief: usize) -> bool {
        let worker_number = self.locals.len();
        if worker_number <= 1 {
            return false;
        }
        let mut victim = (next_random() as usize) % (worker_number - 1);
        if victim >= thief {
            victim += 1;
        }
        let target = (self.locals[victim].size() / 2).max(1);
        let mut stolen = Vec::new();
        while stolen.len() < target {
            match self.locals[victim].try_pop::<true, false>() {
                Some(cell) => stolen.push(cell),
                None => break,
            }
        }
        if stolen.is_empty() {
            return false;
        }
        for cell in stolen {
            if let Err(cell) = self.locals[thief].try_push::<true, false>(cell) {
                self.global.push::<true, false, true>(cell);
            }
        }
        true
    }

    fn balance_main(self: Arc<Self>, interval: Duration) {
        while self.running.load(Ordering::Acquire) {
            let mut slept = Duration::ZERO;
            while slept < interval && self.running.load(Ordering::Acquire) {
                let step = (interval - slept).min(Duration::from_millis(10));
                thread::sleep(step);
                slept += step;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.balance_once();
        }
    }

    /// 单轮均衡：从最长的本地队列向最短的搬运，直到两者持平。
    fn balance_once(&self) {
        let sizes: Vec<usize> = self.locals.iter().map(|local| local.size()).collect();
        let Some((richest, _)) = sizes.iter().enumerate().max_by_key(|(_, s)| **s) else {
            return;
        };
        let Some((poorest, _)) = sizes.iter().enumerate().min_by_key(|(_, s)| **s) else {
            return;
        };
        if richest == poorest {
            return;
        }
        let mut budget = (sizes[richest].saturating_sub(sizes[poorest])) / 2;
        while budget > 0 {
            match self.locals[richest].try_pop::<true, false>() {
                Some(cell) => {
                    if let Err(cell) = self.locals[poorest].try_push::<true, false>(cell) {
                        self.global.push::<true, false, true>(cell);
                    }
                }
                None => break,
            }
            budget -= 1;
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn invoke(&self, function: TaskFunction) -> Result<(), TaskFunction> {
        if !self.running.load(Ordering::Acquire) {
            return Err(function);
        }
        let (marker, index) = CURRENT_WORKER.get();
        let mut cell = Some(function);
        if marker == self.marker() {
            match self.locals[index].try_push::<true, false>(cell) {
                Ok(()) => return Ok(()),
                Err(full) => cell = full,
            }
        }
        self.global.push::<true, false, true>(cell);
        Ok(())
    }
}

fn next_random() -> u64 {
    let mut seed = STEAL_SEED.get();
    if seed == 0 {
        let state = std::collections::hash_map::RandomState::new();
        seed = state.build_hasher().finish() | 1;
    }
    seed ^= seed << 13;
    seed ^= seed >> 7;
    seed ^= seed << 17;
    STEAL_SEED.set(seed);
    seed
}
