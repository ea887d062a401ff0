pub use worker_pool::{PoolHandler, TaskQueue, WorkerPool, WorkerPoolConfig};

mod worker_pool;
