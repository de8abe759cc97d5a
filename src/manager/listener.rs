//! Correlates `JobRemoved` broadcasts with callers waiting on a job.
//!
//! The table maps a job's object path to the caller's one-shot channel. An
//! entry exists only while the job is in flight: it is removed the moment the
//! matching completion is delivered.
//!
//! A job-creating call learns its job path only when the call returns, yet the
//! manager may broadcast the completion before that reply is processed. Such
//! early completions are parked while a [`Reservation`] is outstanding and
//! handed over when the caller registers.
//!
//! Reservations and parked completions carry sequence numbers. A completion
//! parked after reservation `n` was taken can only belong to a call holding a
//! reservation numbered `n` or lower, so it is dropped as soon as every such
//! reservation has been released.

use futures_util::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zvariant::OwnedObjectPath;

use super::transport::CompletionStream;
use super::types::{JobRemoved, JobResult};

/// Sending half of a job notification channel.
pub type JobSender = oneshot::Sender<JobResult>;

/// Receiving half of a job notification channel.
pub type JobReceiver = oneshot::Receiver<JobResult>;

#[derive(Debug, Default)]
struct JobTable {
    /// Jobs in flight, keyed by job path
    pending: HashMap<OwnedObjectPath, JobSender>,
    /// Sequence numbers of outstanding reservations
    live: BTreeSet<u64>,
    /// Sequence number for the next reservation
    next_seq: u64,
    /// Completions that arrived before their caller registered, stamped with
    /// `next_seq` at the time they were parked
    early: HashMap<OwnedObjectPath, (u64, JobResult)>,
}

/// Pending job table plus the logic that resolves it.
#[derive(Debug, Default)]
pub struct JobListener {
    table: Mutex<JobTable>,
}

impl JobListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        // Every critical section leaves the table consistent, so poisoning is ignored.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce that a job-creating call with a channel is about to be issued.
    ///
    /// Must be taken before the call is sent and kept until the caller has
    /// registered (or given up).
    pub(crate) fn reserve(self: &Arc<Self>) -> Reservation {
        let mut table = self.table();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.live.insert(seq);
        Reservation {
            listener: Arc::clone(self),
            seq,
        }
    }

    fn release(&self, seq: u64) {
        let mut table = self.table();
        table.live.remove(&seq);

        // Entries stamped at or below the oldest live reservation were parked
        // after every call that could claim them had already finished.
        let before = table.early.len();
        match table.live.first().copied() {
            Some(oldest) => table.early.retain(|_, (stamp, _)| *stamp > oldest),
            None => table.early.clear(),
        }
        let dropped = before - table.early.len();
        if dropped > 0 {
            debug!("Discarding {} unclaimed early completion(s)", dropped);
        }
    }

    /// Route the completion of `job` to `tx`.
    ///
    /// Job paths are minted fresh by the manager, so `job` is not expected to
    /// be registered already. If it is, the newer channel wins.
    pub fn register(&self, job: OwnedObjectPath, tx: JobSender) {
        let mut table = self.table();

        let early = table.early.remove(&job);
        if let Some((_, result)) = early {
            drop(table);
            debug!("Job {} completed before registration: {}", job.as_str(), result);
            deliver(&job, tx, result);
            return;
        }

        if table.pending.insert(job.clone(), tx).is_some() {
            warn!("Job {} was already registered, replacing channel", job.as_str());
        }
        debug!(
            "Registered job {} ({} pending)",
            job.as_str(),
            table.pending.len()
        );
    }

    /// Handle one `JobRemoved` broadcast.
    ///
    /// Completions nobody waits for are discarded. That is the normal case for
    /// jobs issued without a channel.
    pub fn on_completion(&self, completion: JobRemoved) {
        let JobRemoved {
            id,
            job,
            unit,
            result,
        } = completion;

        let mut table = self.table();
        let waiting = table.pending.remove(&job);
        if let Some(tx) = waiting {
            drop(table);
            debug!("Job {} ({}) finished: {}", id, unit, result);
            deliver(&job, tx, result);
        } else if !table.live.is_empty() {
            debug!("Parking completion of job {} ({}): {}", id, unit, result);
            let stamp = table.next_seq;
            table.early.insert(job, (stamp, result));
        } else {
            debug!("No caller waiting for job {} ({}): {}", id, unit, result);
        }
    }

    /// Number of jobs with a registered channel.
    pub fn pending_count(&self) -> usize {
        self.table().pending.len()
    }

    /// Whether a channel is registered for `job`.
    pub fn is_pending(&self, job: &OwnedObjectPath) -> bool {
        self.table().pending.contains_key(job)
    }

    /// Drop every registered channel. Waiting callers see a closed channel.
    pub fn clear(&self) {
        let mut table = self.table();
        if !table.pending.is_empty() {
            warn!("Dropping {} pending job channel(s)", table.pending.len());
        }
        table.pending.clear();
        table.early.clear();
    }

    /// Consume completion broadcasts until the stream ends.
    pub async fn drain(self: Arc<Self>, mut completions: CompletionStream) {
        info!("Job listener started");

        while let Some(completion) = completions.next().await {
            self.on_completion(completion);
        }

        warn!(
            "Completion stream ended with {} job(s) pending",
            self.pending_count()
        );
        self.clear();
    }
}

fn deliver(job: &OwnedObjectPath, tx: JobSender, result: JobResult) {
    if tx.send(result).is_err() {
        debug!("Caller stopped waiting for job {}", job.as_str());
    }
}

/// Keeps early completions parked until the owning call registers.
///
/// Dropping the last outstanding reservation discards anything still parked.
#[derive(Debug)]
pub(crate) struct Reservation {
    listener: Arc<JobListener>,
    seq: u64,
}

impl Reservation {
    /// Register the channel for the job this reservation was taken for.
    pub(crate) fn register(self, job: OwnedObjectPath, tx: JobSender) {
        self.listener.register(job, tx);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.listener.release(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn job_path(id: u32) -> OwnedObjectPath {
        crate::escape::parse_object_path(&format!("/org/freedesktop/systemd1/job/{}", id))
            .unwrap()
    }

    fn removed(id: u32, unit: &str, result: &str) -> JobRemoved {
        JobRemoved {
            id,
            job: job_path(id),
            unit: unit.to_string(),
            result: JobResult::parse(result),
        }
    }

    #[test]
    fn test_completion_reaches_registered_channel() {
        let listener = JobListener::new();
        let (tx, mut rx) = oneshot::channel();

        listener.register(job_path(42), tx);
        assert!(listener.is_pending(&job_path(42)));

        listener.on_completion(removed(42, "app.service", "done"));
        assert_eq!(rx.try_recv().unwrap(), JobResult::Done);
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_unregistered_completion_is_discarded() {
        let listener = JobListener::new();
        listener.on_completion(removed(7, "app.service", "failed"));
        assert_eq!(listener.pending_count(), 0);
        assert!(listener.table().early.is_empty());
    }

    #[test]
    fn test_repeated_completion_is_noop() {
        let listener = JobListener::new();
        let (tx, mut rx) = oneshot::channel();
        listener.register(job_path(3), tx);

        listener.on_completion(removed(3, "a.service", "done"));
        listener.on_completion(removed(3, "a.service", "failed"));

        assert_eq!(rx.try_recv().unwrap(), JobResult::Done);
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_completions_do_not_cross() {
        let listener = JobListener::new();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        listener.register(job_path(1), tx_a);
        listener.register(job_path(2), tx_b);

        listener.on_completion(removed(2, "b.service", "timeout"));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), JobResult::Timeout);

        listener.on_completion(removed(1, "a.service", "dependency"));
        assert_eq!(rx_a.try_recv().unwrap(), JobResult::Dependency);
    }

    #[test]
    fn test_dropped_receiver_does_not_panic() {
        let listener = JobListener::new();
        let (tx, rx) = oneshot::channel();
        listener.register(job_path(9), tx);
        drop(rx);

        listener.on_completion(removed(9, "a.service", "done"));
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_early_completion_is_handed_over() {
        let listener = Arc::new(JobListener::new());
        let reservation = listener.reserve();

        // Broadcast overtakes the call's reply.
        listener.on_completion(removed(5, "fast.service", "done"));
        assert_eq!(listener.pending_count(), 0);

        let (tx, mut rx) = oneshot::channel();
        reservation.register(job_path(5), tx);

        assert_eq!(rx.try_recv().unwrap(), JobResult::Done);
        assert_eq!(listener.pending_count(), 0);
        assert!(listener.table().early.is_empty());
    }

    #[test]
    fn test_last_reservation_discards_parked_completions() {
        let listener = Arc::new(JobListener::new());
        let first = listener.reserve();
        let second = listener.reserve();

        listener.on_completion(removed(11, "other.service", "done"));
        drop(first);
        assert_eq!(listener.table().early.len(), 1);

        drop(second);
        assert!(listener.table().early.is_empty());
        assert!(listener.table().live.is_empty());
    }

    #[test]
    fn test_overlapping_reservations_keep_parked_map_bounded() {
        let listener = Arc::new(JobListener::new());
        let mut held = listener.reserve();

        for id in 0..10_000 {
            let next = listener.reserve();
            listener.on_completion(removed(id, "unrelated.service", "done"));
            drop(std::mem::replace(&mut held, next));
            assert!(
                listener.table().early.len() <= 1,
                "parked map grew to {}",
                listener.table().early.len()
            );
        }

        drop(held);
        assert!(listener.table().early.is_empty());
    }

    #[test]
    fn test_parked_completion_survives_while_its_caller_is_live() {
        let listener = Arc::new(JobListener::new());
        let slow = listener.reserve();

        listener.on_completion(removed(21, "slow.service", "done"));

        // Later calls come and go; the older reservation still pins the entry.
        for _ in 0..3 {
            drop(listener.reserve());
        }
        assert_eq!(listener.table().early.len(), 1);

        let (tx, mut rx) = oneshot::channel();
        slow.register(job_path(21), tx);
        assert_eq!(rx.try_recv().unwrap(), JobResult::Done);
    }

    #[test]
    fn test_completion_after_newer_reservation_is_kept_for_it() {
        let listener = Arc::new(JobListener::new());
        let old = listener.reserve();
        let new = listener.reserve();

        listener.on_completion(removed(30, "b.service", "failed"));
        drop(old);
        assert_eq!(listener.table().early.len(), 1);

        let (tx, mut rx) = oneshot::channel();
        new.register(job_path(30), tx);
        assert_eq!(rx.try_recv().unwrap(), JobResult::Failed);
    }

    #[test]
    fn test_clear_closes_waiting_channels() {
        let listener = JobListener::new();
        let (tx, mut rx) = oneshot::channel();
        listener.register(job_path(1), tx);

        listener.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_drain_resolves_from_stream() {
        let listener = Arc::new(JobListener::new());
        let (tx, rx) = oneshot::channel();
        listener.register(job_path(8), tx);

        let completions = stream::iter(vec![
            removed(99, "unrelated.service", "done"),
            removed(8, "app.service", "skipped"),
        ])
        .boxed();
        listener.clone().drain(completions).await;

        assert_eq!(rx.await.unwrap(), JobResult::Skipped);
    }

    #[tokio::test]
    async fn test_drain_end_closes_pending_channels() {
        let listener = Arc::new(JobListener::new());
        let (tx, rx) = oneshot::channel();
        listener.register(job_path(4), tx);

        listener.clone().drain(stream::empty().boxed()).await;
        assert!(rx.await.is_err());
    }
}
