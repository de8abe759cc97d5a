//! The job-issuing client.
//!
//! Every operation that makes the manager create a job funnels through
//! [`ManagerClient::issue_job`], which is where a caller's notification channel
//! gets tied to the job path the manager hands back.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use zvariant::{DynamicType, ObjectPath, OwnedObjectPath, Type};

use super::context::CallContext;
use super::listener::{JobListener, JobReceiver, JobSender};
use super::properties::UnitProperty;
use super::transport::{methods, Method, Transport, MANAGER_PATH};
use super::types::{JobMode, JobStatus, UnitFile, UnitFileChange, UnitStatus, Who};
use super::Result;
use crate::escape::validate_unit_name;

/// Create a channel for one job's result.
pub fn job_channel() -> (JobSender, JobReceiver) {
    oneshot::channel()
}

/// Numeric job id from the last segment of a job path, 0 if it is not a number.
fn job_id_from_path(job: &ObjectPath<'_>) -> u32 {
    job.as_str()
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
        .unwrap_or(0)
}

/// Client for the manager object.
///
/// Owns the pending job table and the task that drains completion
/// broadcasts into it. [`close`](Self::close) (or dropping the client) stops
/// that task; callers still waiting on a job see their channel close.
pub struct ManagerClient<T: Transport> {
    transport: T,
    listener: Arc<JobListener>,
    drain: Option<JoinHandle<()>>,
    manager_path: ObjectPath<'static>,
}

impl<T: Transport> ManagerClient<T> {
    /// Subscribe to completion broadcasts and start correlating jobs.
    pub async fn connect(transport: T) -> Result<Self> {
        let completions = transport.job_removed().await?;
        let listener = Arc::new(JobListener::new());
        let drain = tokio::spawn(Arc::clone(&listener).drain(completions));

        Ok(Self {
            transport,
            listener,
            drain: Some(drain),
            manager_path: ObjectPath::from_static_str_unchecked(MANAGER_PATH),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The pending job table.
    pub fn listener(&self) -> &Arc<JobListener> {
        &self.listener
    }

    pub(crate) fn manager_path(&self) -> &ObjectPath<'static> {
        &self.manager_path
    }

    /// Stop correlating jobs and release every pending channel.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
            info!("Manager client closed");
        }
        self.listener.clear();
    }

    pub(crate) async fn call<B, R>(
        &self,
        ctx: &CallContext,
        path: &ObjectPath<'_>,
        method: Method,
        body: &B,
    ) -> Result<R>
    where
        B: Serialize + DynamicType + fmt::Debug + Sync,
        R: DeserializeOwned + Type + Send + 'static,
    {
        trace!("Calling {} on {} with {:?}", method, path.as_str(), body);
        ctx.run(method.member, self.transport.call(path, method, body))
            .await
    }

    /// Issue a job-creating `method` and return the job id.
    ///
    /// When `notify` is given, the job's terminal result is sent on it once
    /// the manager broadcasts the completion. A rejected call registers
    /// nothing and drops `notify`.
    ///
    /// A returned id only means the job was accepted. The id is informational
    /// (0 if the job path does not end in a number); correlation uses the job
    /// path.
    pub async fn issue_job<B>(
        &self,
        ctx: &CallContext,
        method: Method,
        notify: Option<JobSender>,
        body: &B,
    ) -> Result<u32>
    where
        B: Serialize + DynamicType + fmt::Debug + Sync,
    {
        let reservation = notify.as_ref().map(|_| self.listener.reserve());

        let job: OwnedObjectPath = self.call(ctx, &self.manager_path, method, body).await?;

        if let (Some(reservation), Some(tx)) = (reservation, notify) {
            reservation.register(job.clone(), tx);
        }

        let job_id = job_id_from_path(&job);
        info!("{} accepted as job {} ({})", method.member, job_id, job.as_str());
        Ok(job_id)
    }

    async fn unit_job(
        &self,
        ctx: &CallContext,
        method: Method,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        validate_unit_name(name)?;
        self.issue_job(ctx, method, notify, &(name, mode.as_str()))
            .await
    }

    /// Start a unit and its dependencies.
    pub async fn start_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::START_UNIT, name, mode, notify)
            .await
    }

    /// Stop a unit.
    pub async fn stop_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::STOP_UNIT, name, mode, notify)
            .await
    }

    /// Reload a unit's configuration. Fails for units that cannot reload.
    pub async fn reload_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::RELOAD_UNIT, name, mode, notify)
            .await
    }

    /// Restart a unit, starting it if it is not running.
    pub async fn restart_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::RESTART_UNIT, name, mode, notify)
            .await
    }

    /// Restart a unit only if it is running.
    pub async fn try_restart_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::TRY_RESTART_UNIT, name, mode, notify)
            .await
    }

    /// Reload a unit if it supports it, restart it otherwise.
    pub async fn reload_or_restart_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::RELOAD_OR_RESTART_UNIT, name, mode, notify)
            .await
    }

    /// Like [`reload_or_restart_unit`](Self::reload_or_restart_unit), but
    /// leaves stopped units alone.
    pub async fn reload_or_try_restart_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        notify: Option<JobSender>,
    ) -> Result<u32> {
        self.unit_job(ctx, methods::RELOAD_OR_TRY_RESTART_UNIT, name, mode, notify)
            .await
    }

    /// Create and start a transient unit.
    ///
    /// The unit is released once it stops and nothing references it. `name`
    /// must be unique and include the type suffix.
    pub async fn start_transient_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: JobMode,
        properties: &[UnitProperty],
        notify: Option<JobSender>,
    ) -> Result<u32> {
        validate_unit_name(name)?;
        // Auxiliary units are not supported; the manager still expects the argument.
        let aux: Vec<(String, Vec<UnitProperty>)> = Vec::new();
        self.issue_job(
            ctx,
            methods::START_TRANSIENT_UNIT,
            notify,
            &(name, mode.as_str(), properties, aux),
        )
        .await
    }

    /// Send `signal` to the processes of a unit selected by `who`.
    pub async fn kill_unit(
        &self,
        ctx: &CallContext,
        name: &str,
        who: Who,
        signal: i32,
    ) -> Result<()> {
        validate_unit_name(name)?;
        debug!("Killing {} ({}) with signal {}", name, who.as_str(), signal);
        self.call(
            ctx,
            &self.manager_path,
            methods::KILL_UNIT,
            &(name, who.as_str(), signal),
        )
        .await
    }

    /// Reset the failed state of a unit.
    pub async fn reset_failed_unit(&self, ctx: &CallContext, name: &str) -> Result<()> {
        validate_unit_name(name)?;
        self.call(ctx, &self.manager_path, methods::RESET_FAILED_UNIT, &(name,))
            .await
    }

    /// Reload the manager's own configuration (`daemon-reload`).
    pub async fn reload(&self, ctx: &CallContext) -> Result<()> {
        self.call(ctx, &self.manager_path, methods::RELOAD, &())
            .await
    }

    /// All units currently loaded.
    pub async fn list_units(&self, ctx: &CallContext) -> Result<Vec<UnitStatus>> {
        self.call(ctx, &self.manager_path, methods::LIST_UNITS, &())
            .await
    }

    /// Loaded units whose active state is one of `states`.
    pub async fn list_units_filtered(
        &self,
        ctx: &CallContext,
        states: &[String],
    ) -> Result<Vec<UnitStatus>> {
        self.call(ctx, &self.manager_path, methods::LIST_UNITS_FILTERED, &(states,))
            .await
    }

    /// Units matching both `states` and any of the glob `patterns`.
    ///
    /// Unlike [`list_units`](Self::list_units) this also returns units that
    /// are not loaded but match a pattern.
    pub async fn list_units_by_patterns(
        &self,
        ctx: &CallContext,
        states: &[String],
        patterns: &[String],
    ) -> Result<Vec<UnitStatus>> {
        self.call(
            ctx,
            &self.manager_path,
            methods::LIST_UNITS_BY_PATTERNS,
            &(states, patterns),
        )
        .await
    }

    /// Status of exactly the named units, loaded or not.
    pub async fn list_units_by_names(
        &self,
        ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<UnitStatus>> {
        self.call(ctx, &self.manager_path, methods::LIST_UNITS_BY_NAMES, &(names,))
            .await
    }

    /// All unit files on disk.
    pub async fn list_unit_files(&self, ctx: &CallContext) -> Result<Vec<UnitFile>> {
        self.call(ctx, &self.manager_path, methods::LIST_UNIT_FILES, &())
            .await
    }

    pub async fn list_unit_files_by_patterns(
        &self,
        ctx: &CallContext,
        states: &[String],
        patterns: &[String],
    ) -> Result<Vec<UnitFile>> {
        self.call(
            ctx,
            &self.manager_path,
            methods::LIST_UNIT_FILES_BY_PATTERNS,
            &(states, patterns),
        )
        .await
    }

    /// Jobs currently queued in the manager.
    pub async fn list_jobs(&self, ctx: &CallContext) -> Result<Vec<JobStatus>> {
        self.call(ctx, &self.manager_path, methods::LIST_JOBS, &())
            .await
    }

    /// Link unit files from outside the search path into it.
    pub async fn link_unit_files(
        &self,
        ctx: &CallContext,
        files: &[String],
        runtime: bool,
        force: bool,
    ) -> Result<Vec<UnitFileChange>> {
        self.call(
            ctx,
            &self.manager_path,
            methods::LINK_UNIT_FILES,
            &(files, runtime, force),
        )
        .await
    }

    /// Enable unit files. The flag is whether they carry `[Install]` info.
    pub async fn enable_unit_files(
        &self,
        ctx: &CallContext,
        files: &[String],
        runtime: bool,
        force: bool,
    ) -> Result<(bool, Vec<UnitFileChange>)> {
        self.call(
            ctx,
            &self.manager_path,
            methods::ENABLE_UNIT_FILES,
            &(files, runtime, force),
        )
        .await
    }

    pub async fn disable_unit_files(
        &self,
        ctx: &CallContext,
        files: &[String],
        runtime: bool,
    ) -> Result<Vec<UnitFileChange>> {
        self.call(
            ctx,
            &self.manager_path,
            methods::DISABLE_UNIT_FILES,
            &(files, runtime),
        )
        .await
    }

    pub async fn mask_unit_files(
        &self,
        ctx: &CallContext,
        files: &[String],
        runtime: bool,
        force: bool,
    ) -> Result<Vec<UnitFileChange>> {
        self.call(
            ctx,
            &self.manager_path,
            methods::MASK_UNIT_FILES,
            &(files, runtime, force),
        )
        .await
    }

    pub async fn unmask_unit_files(
        &self,
        ctx: &CallContext,
        files: &[String],
        runtime: bool,
    ) -> Result<Vec<UnitFileChange>> {
        self.call(
            ctx,
            &self.manager_path,
            methods::UNMASK_UNIT_FILES,
            &(files, runtime),
        )
        .await
    }
}

impl<T: Transport> Drop for ManagerClient<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
