//!
//! Conflux Engine - Command dispatch, behaviors, correlation and jobs
//!
//! This crate drives running process instances: commands flow through the
//! dispatcher into per-activity-type behaviors, signals are routed by the
//! correlation services, and background jobs sweep timeouts and compact
//! finished history.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Activity lifecycle command handlers
pub mod activity;

/// Per-activity-type behaviors
pub mod behavior;

/// Engine configuration defaults
pub mod config;

/// Scope and correlation resolution
pub mod correlation;

/// Command dispatch core
pub mod dispatch;

/// Background compaction and timeout sweep
pub mod jobs;

/// Process lifecycle command handlers
pub mod process;

/// Produced API facades and engine wiring
pub mod service;

/// Scoped variable reads and writes
pub mod variables;

pub use behavior::{ActivityBehavior, BehaviorRegistry};
pub use config::EngineConfig;
pub use dispatch::{Command, CommandHandler, CommandKind, CommandOutput, Dispatcher};
pub use jobs::{CompactionJob, TimeoutSweep};
pub use service::{ActivityService, Engine, RuntimeService};
pub use variables::VariableService;
