//! 并发原语：调度接口、有界 MPMC 队列、存取保险箱与按需消费队列。

pub mod bounded_queue;
pub mod deposit_box;
pub mod execution_queue;
pub mod sched;

pub use bounded_queue::{ConcurrentBoundedQueue, Drain};
pub use deposit_box::DepositBox;
pub use execution_queue::ConcurrentExecutionQueue;
pub use sched::{CondvarSched, OsSched, SchedInterface};
