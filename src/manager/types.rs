//! Wire vocabulary shared with the service manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zvariant::{OwnedObjectPath, Type};

/// How the manager should queue a job relative to jobs already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    #[default]
    Replace,
    Fail,
    Isolate,
    IgnoreDependencies,
    IgnoreRequirements,
    ReplaceIrreversibly,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Replace => "replace",
            JobMode::Fail => "fail",
            JobMode::Isolate => "isolate",
            JobMode::IgnoreDependencies => "ignore-dependencies",
            JobMode::IgnoreRequirements => "ignore-requirements",
            JobMode::ReplaceIrreversibly => "replace-irreversibly",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(JobMode::Replace),
            "fail" => Ok(JobMode::Fail),
            "isolate" => Ok(JobMode::Isolate),
            "ignore-dependencies" => Ok(JobMode::IgnoreDependencies),
            "ignore-requirements" => Ok(JobMode::IgnoreRequirements),
            "replace-irreversibly" => Ok(JobMode::ReplaceIrreversibly),
            other => Err(format!("Unknown job mode: {}", other)),
        }
    }
}

/// Which processes of a unit receive a signal from `KillUnit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Who {
    /// Every process in the unit
    #[default]
    All,
    /// Only the main process
    Main,
    /// Only the control process
    Control,
}

impl Who {
    pub fn as_str(&self) -> &'static str {
        match self {
            Who::All => "all",
            Who::Main => "main",
            Who::Control => "control",
        }
    }
}

impl FromStr for Who {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Who::All),
            "main" => Ok(Who::Main),
            "control" => Ok(Who::Control),
            other => Err(format!("Unknown kill target: {}", other)),
        }
    }
}

/// Terminal outcome of a job, as announced by the `JobRemoved` signal.
///
/// This is the authoritative result: a successful job-creating call only
/// means the manager accepted the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
    /// A result string outside the documented vocabulary.
    Other(String),
}

impl JobResult {
    pub fn as_str(&self) -> &str {
        match self {
            JobResult::Done => "done",
            JobResult::Canceled => "canceled",
            JobResult::Timeout => "timeout",
            JobResult::Failed => "failed",
            JobResult::Dependency => "dependency",
            JobResult::Skipped => "skipped",
            JobResult::Other(s) => s,
        }
    }

    /// Whether the job finished successfully.
    pub fn is_done(&self) -> bool {
        matches!(self, JobResult::Done)
    }

    /// Parse a wire string. Unknown strings map to [`JobResult::Other`].
    pub fn parse(s: &str) -> Self {
        match s {
            "done" => JobResult::Done,
            "canceled" => JobResult::Canceled,
            "timeout" => JobResult::Timeout,
            "failed" => JobResult::Failed,
            "dependency" => JobResult::Dependency,
            "skipped" => JobResult::Skipped,
            other => {
                tracing::warn!("Unknown job result from manager: {}", other);
                JobResult::Other(other.to_string())
            }
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobResult {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobResult::parse(s))
    }
}

impl Serialize for JobResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Payload of the manager's `JobRemoved` broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRemoved {
    /// Numeric job id
    pub id: u32,
    /// Job object path, the correlation key
    pub job: OwnedObjectPath,
    /// Primary unit name of the job
    pub unit: String,
    /// Terminal result
    pub result: JobResult,
}

/// One row of `ListUnits` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct UnitStatus {
    /// The primary unit name
    pub name: String,
    /// The human readable description
    pub description: String,
    /// Whether the unit file has been loaded successfully
    pub load_state: String,
    /// Whether the unit is currently started or not
    pub active_state: String,
    /// Unit-type specific refinement of the active state
    pub sub_state: String,
    /// Unit this one follows in state, or empty
    pub followed: String,
    /// The unit object path
    pub path: OwnedObjectPath,
    /// Id of the queued job for this unit, 0 if none
    pub job_id: u32,
    /// The queued job type
    pub job_type: String,
    /// The queued job object path
    pub job_path: OwnedObjectPath,
}

/// One row of `ListUnitFiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct UnitFile {
    pub path: String,
    /// Enablement state, e.g. `enabled` or `static`
    #[serde(rename = "type")]
    pub state: String,
}

/// One row of `ListJobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct JobStatus {
    pub id: u32,
    pub unit: String,
    pub job_type: String,
    /// `waiting` or `running`
    pub state: String,
    pub job_path: OwnedObjectPath,
    pub unit_path: OwnedObjectPath,
}

/// A symlink change reported by the unit-file operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct UnitFileChange {
    /// `symlink` or `unlink`
    #[serde(rename = "type")]
    pub change: String,
    pub filename: String,
    pub destination: String,
}
