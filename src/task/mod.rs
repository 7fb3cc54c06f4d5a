//! Task domain: entity, mailbox protocol and the coordinator-side manager.

pub mod manager;
pub mod message;
pub mod model;

pub use manager::{ReportOutcome, TaskManager, TaskSpec};
pub use message::{InboundKind, MessageKind, OutboundKind, TaskMessage, Tier};
pub use model::{Task, TaskStatus, TimelineEntry, WatchdogState};
