//! Controllers: per-task worker/supervisor loops and the pool that owns them.

pub mod pool;
pub mod supervisor;
pub mod worker;

pub use pool::{PoolConfig, PoolManager};
pub use supervisor::SupervisorController;
pub use worker::{ControlSignal, WorkerController};
