//! Persistent, status-partitioned job orchestration.
//!
//! Jobs are drafted with one or more argument steps, submitted to a queue,
//! and run one at a time through a pluggable [`runner::StepExecutor`]. Every
//! transition is written to disk before it is acknowledged, so the queue
//! survives restarts.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod process;
pub mod runner;
pub mod state;

pub use config::JobsConfig;
pub use error::{Error, Result};
