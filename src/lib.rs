//! Overseer — background task orchestration with paired worker and
//! supervisor sessions.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod watchdog;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
