//! sysjobs library exports for the CLI, integration tests and fuzzing.
//!
//! The [`manager`] module drives the systemd service manager over D-Bus and
//! delivers each job's result to the caller that issued it.

pub mod config;
pub mod escape;
pub mod manager;

// Re-export commonly used types for convenience
pub use config::Config;
pub use manager::{
    job_channel, CallContext, JobMode, JobResult, ManagerClient, ManagerError, ZbusTransport,
};
