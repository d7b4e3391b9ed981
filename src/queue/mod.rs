//! Reliable work queue and worker pool used by the batch pipeline.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (start_batch)│
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │
//!                      │ (Redis/mem)  │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! - **Atomic dequeue**: BRPOPLPUSH moves a task into the processing list
//! - **Crash recovery**: stranded tasks are requeued when the pool starts
//! - **Dead letter queue**: tasks that exhaust their retries are kept for inspection

pub mod backend;
pub mod memory;
pub mod redis_queue;
pub mod task;
pub mod worker_pool;

pub use backend::{DeadLetter, QueueError, QueueStats, TaskQueue};
pub use memory::MemoryTaskQueue;
pub use redis_queue::RedisTaskQueue;
pub use task::{Task, TaskError, TaskResult, TaskStatus, DEFAULT_MAX_RETRY};
pub use worker_pool::{PoolError, PoolStats, TaskHandler, WorkerPool, WorkerPoolConfig};
