//! The zbus-backed transport.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};
use zbus::Connection;
use zvariant::{DynamicType, ObjectPath, OwnedObjectPath, Type};

use super::transport::{CompletionStream, Method, Transport, SYSTEMD_SERVICE};
use super::types::{self, JobResult};
use super::{ManagerError, Result};

/// Which manager instance to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusScope {
    /// PID 1 on the system bus
    #[default]
    System,
    /// The per-user manager on the session bus
    User,
}

impl fmt::Display for BusScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusScope::System => f.write_str("system"),
            BusScope::User => f.write_str("user"),
        }
    }
}

/// Manager proxy, used only for the signal subscription.
#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Manager {
    /// Ask the manager to emit job and unit signals to this connection.
    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(&self, id: u32, job: ObjectPath<'_>, unit: &str, result: &str)
        -> zbus::Result<()>;
}

/// [`Transport`] over a zbus connection.
#[derive(Debug, Clone)]
pub struct ZbusTransport {
    connection: Connection,
}

impl ZbusTransport {
    /// Connect to the system manager.
    pub async fn system() -> Result<Self> {
        Self::connect(BusScope::System).await
    }

    /// Connect to the calling user's manager.
    pub async fn session() -> Result<Self> {
        Self::connect(BusScope::User).await
    }

    pub async fn connect(scope: BusScope) -> Result<Self> {
        let connection = match scope {
            BusScope::System => Connection::system().await,
            BusScope::User => Connection::session().await,
        }
        .map_err(|e| ManagerError::transport(format!("connect to {} bus", scope), e))?;

        info!("Connected to the {} bus", scope);
        Ok(Self::from_connection(connection))
    }

    /// Reuse an existing connection.
    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl Transport for ZbusTransport {
    async fn call<B, R>(&self, path: &ObjectPath<'_>, method: Method, body: &B) -> Result<R>
    where
        B: Serialize + DynamicType + fmt::Debug + Sync,
        R: DeserializeOwned + Type + Send + 'static,
    {
        let reply = self
            .connection
            .call_method(
                Some(SYSTEMD_SERVICE),
                path.as_str(),
                Some(method.interface),
                method.member,
                body,
            )
            .await
            .map_err(|e| ManagerError::transport(method, e))?;

        let body = reply.body();
        body.deserialize::<R>()
            .map_err(|e| ManagerError::decoding(method, e))
    }

    async fn job_removed(&self) -> Result<CompletionStream> {
        let proxy = ManagerProxy::new(&self.connection)
            .await
            .map_err(|e| ManagerError::transport("create manager proxy", e))?;

        // Without a subscription the manager keeps its signals to itself. An
        // already subscribed connection is reported as an error, so carry on.
        if let Err(e) = proxy.subscribe().await {
            warn!("Subscribe to manager signals failed: {}", e);
        }

        let signals = proxy
            .receive_job_removed()
            .await
            .map_err(|e| ManagerError::transport("subscribe JobRemoved", e))?;
        debug!("Receiving JobRemoved signals");

        let completions = signals.filter_map(|signal| async move {
            match signal.args() {
                Ok(args) => Some(types::JobRemoved {
                    id: *args.id(),
                    job: OwnedObjectPath::from(args.job().clone()),
                    unit: args.unit().to_string(),
                    result: JobResult::parse(args.result()),
                }),
                Err(e) => {
                    warn!("Malformed JobRemoved signal: {}", e);
                    None
                }
            }
        });

        Ok(completions.boxed())
    }
}
