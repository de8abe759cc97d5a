//! Boundary between the client and the message bus.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use zvariant::{DynamicType, ObjectPath, Type};

use super::types::JobRemoved;
use super::Result;

/// Well-known bus name of the service manager.
pub const SYSTEMD_SERVICE: &str = "org.freedesktop.systemd1";

/// Object path of the manager object.
pub const MANAGER_PATH: &str = "/org/freedesktop/systemd1";

/// Stream of job completion broadcasts.
pub type CompletionStream = BoxStream<'static, JobRemoved>;

/// A D-Bus method, split the way the wire header carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub interface: &'static str,
    pub member: &'static str,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.member)
    }
}

/// Method names understood by the manager.
pub mod methods {
    use super::Method;

    pub const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
    pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

    const fn manager(member: &'static str) -> Method {
        Method {
            interface: MANAGER_INTERFACE,
            member,
        }
    }

    pub const START_UNIT: Method = manager("StartUnit");
    pub const STOP_UNIT: Method = manager("StopUnit");
    pub const RELOAD_UNIT: Method = manager("ReloadUnit");
    pub const RESTART_UNIT: Method = manager("RestartUnit");
    pub const TRY_RESTART_UNIT: Method = manager("TryRestartUnit");
    pub const RELOAD_OR_RESTART_UNIT: Method = manager("ReloadOrRestartUnit");
    pub const RELOAD_OR_TRY_RESTART_UNIT: Method = manager("ReloadOrTryRestartUnit");
    pub const START_TRANSIENT_UNIT: Method = manager("StartTransientUnit");
    pub const KILL_UNIT: Method = manager("KillUnit");
    pub const RESET_FAILED_UNIT: Method = manager("ResetFailedUnit");
    pub const SET_UNIT_PROPERTIES: Method = manager("SetUnitProperties");
    pub const LIST_UNITS: Method = manager("ListUnits");
    pub const LIST_UNITS_FILTERED: Method = manager("ListUnitsFiltered");
    pub const LIST_UNITS_BY_PATTERNS: Method = manager("ListUnitsByPatterns");
    pub const LIST_UNITS_BY_NAMES: Method = manager("ListUnitsByNames");
    pub const LIST_UNIT_FILES: Method = manager("ListUnitFiles");
    pub const LIST_UNIT_FILES_BY_PATTERNS: Method = manager("ListUnitFilesByPatterns");
    pub const LIST_JOBS: Method = manager("ListJobs");
    pub const LINK_UNIT_FILES: Method = manager("LinkUnitFiles");
    pub const ENABLE_UNIT_FILES: Method = manager("EnableUnitFiles");
    pub const DISABLE_UNIT_FILES: Method = manager("DisableUnitFiles");
    pub const MASK_UNIT_FILES: Method = manager("MaskUnitFiles");
    pub const UNMASK_UNIT_FILES: Method = manager("UnmaskUnitFiles");
    pub const RELOAD: Method = manager("Reload");
    pub const SUBSCRIBE: Method = manager("Subscribe");

    pub const GET_PROPERTY: Method = Method {
        interface: PROPERTIES_INTERFACE,
        member: "Get",
    };
    pub const GET_ALL_PROPERTIES: Method = Method {
        interface: PROPERTIES_INTERFACE,
        member: "GetAll",
    };
}

/// The two capabilities the client needs from the bus: a method call and a
/// subscription to the manager's `JobRemoved` signal.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Call `method` on the manager object at `path`.
    ///
    /// Fails with [`ManagerError::Transport`](super::ManagerError::Transport)
    /// when the bus or the manager rejects the call, and with
    /// [`ManagerError::Decoding`](super::ManagerError::Decoding) when the
    /// reply does not have the shape of `R`.
    async fn call<B, R>(&self, path: &ObjectPath<'_>, method: Method, body: &B) -> Result<R>
    where
        B: Serialize + DynamicType + fmt::Debug + Sync,
        R: DeserializeOwned + Type + Send + 'static;

    /// Subscribe to job completion broadcasts.
    async fn job_removed(&self) -> Result<CompletionStream>;
}
