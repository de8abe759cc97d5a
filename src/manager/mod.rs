//! Job-correlating client for the systemd service manager.
//!
//! Lifecycle operations (start, stop, restart, ...) return as soon as the
//! manager has *accepted* a job. The job's outcome arrives later as a
//! `JobRemoved` broadcast keyed by the job's object path. This module pairs
//! the two so each caller gets exactly its own result.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ start_unit(.., Some(tx)) ┌───────────────┐  StartUnit   ┌─────────┐
//! │  caller  │─────────────────────────>│ ManagerClient │─────────────>│ systemd │
//! │          │<── job id ───────────────│               │<── job path ─│         │
//! │          │                          │  JobListener  │              │         │
//! │   rx ◄───┼──── JobResult ───────────│  (job table)  │<─JobRemoved──│         │
//! └──────────┘                          └───────────────┘              └─────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let transport = ZbusTransport::system().await?;
//! let client = ManagerClient::connect(transport).await?;
//! let ctx = CallContext::background();
//!
//! let (tx, rx) = job_channel();
//! let job_id = client.start_unit(&ctx, "app.service", JobMode::Replace, Some(tx)).await?;
//! let result = rx.await?;
//! println!("job {} finished: {}", job_id, result);
//! ```

mod bus;
mod client;
mod context;
mod listener;
mod properties;
mod transport;
mod types;

pub use bus::{BusScope, ZbusTransport};
pub use client::{job_channel, ManagerClient};
pub use context::CallContext;
pub use listener::{JobListener, JobReceiver, JobSender};
pub use properties::{Property, PropertyValue, UnitProperty};
pub use transport::{methods, CompletionStream, Method, Transport, MANAGER_PATH, SYSTEMD_SERVICE};
pub use types::{
    JobMode, JobRemoved, JobResult, JobStatus, UnitFile, UnitFileChange, UnitStatus, Who,
};

use crate::escape::IdentifierError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by manager operations.
///
/// A job that is accepted and later fails is *not* an error: its result is
/// delivered on the job channel.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("D-Bus call {method} failed: {source}")]
    Transport {
        method: String,
        #[source]
        source: zbus::Error,
    },

    #[error("Invalid unit identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("Unexpected reply to {method}: {reason}")]
    Decoding { method: String, reason: String },

    #[error("D-Bus call {method} cancelled")]
    Cancelled { method: String },

    #[error("D-Bus call {method} timed out after {after:?}")]
    TimedOut { method: String, after: Duration },
}

impl ManagerError {
    pub(crate) fn transport(method: impl ToString, source: zbus::Error) -> Self {
        ManagerError::Transport {
            method: method.to_string(),
            source,
        }
    }

    pub(crate) fn decoding(method: impl ToString, reason: impl ToString) -> Self {
        ManagerError::Decoding {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
