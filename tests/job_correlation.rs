//! End-to-end job correlation through `ManagerClient` against an in-process
//! manager that replies to calls and broadcasts completions.

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysjobs::escape::parse_object_path;
use sysjobs::manager::{
    job_channel, CallContext, CompletionStream, JobMode, JobRemoved, JobResult, ManagerClient,
    ManagerError, Method, Transport,
};
use tokio::sync::mpsc;
use zvariant::{DynamicType, ObjectPath, Type};

type Reply = Box<dyn Any + Send>;

struct FakeTransport {
    calls: Mutex<Vec<String>>,
    replies: Mutex<HashMap<&'static str, Reply>>,
    failure: Mutex<Option<String>>,
    next_job: AtomicU32,
    /// Broadcast each job's completion before replying to the call
    complete_early: AtomicBool,
    /// Broadcast each job's completion right as the reply goes out
    race_completion: AtomicBool,
    completions_tx: mpsc::UnboundedSender<JobRemoved>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<JobRemoved>>>,
}

impl FakeTransport {
    fn new() -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            next_job: AtomicU32::new(42),
            complete_early: AtomicBool::new(false),
            race_completion: AtomicBool::new(false),
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn complete(&self, job: &str, unit: &str, result: &str) {
        let id = job.rsplit('/').next().unwrap().parse().unwrap_or(0);
        self.completions_tx
            .send(JobRemoved {
                id,
                job: parse_object_path(job).unwrap(),
                unit: unit.to_string(),
                result: JobResult::parse(result),
            })
            .unwrap();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn call<B, R>(
        &self,
        _path: &ObjectPath<'_>,
        method: Method,
        body: &B,
    ) -> Result<R, ManagerError>
    where
        B: Serialize + DynamicType + fmt::Debug + Sync,
        R: DeserializeOwned + Type + Send + 'static,
    {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {:?}", method.member, body));

        if let Some(message) = self.failure.lock().unwrap().take() {
            return Err(ManagerError::Transport {
                method: method.to_string(),
                source: zbus::Error::Failure(message),
            });
        }

        let scripted = self.replies.lock().unwrap().remove(method.member);
        let reply: Reply = match scripted {
            Some(reply) => reply,
            None => {
                let id = self.next_job.fetch_add(1, Ordering::SeqCst);
                let job = format!("/org/freedesktop/systemd1/job/{}", id);
                if self.complete_early.load(Ordering::SeqCst) {
                    self.complete(&job, "fast.service", result_for(id));
                    // Let the drain task park the completion before the reply lands.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                } else if self.race_completion.load(Ordering::SeqCst) {
                    self.complete(&job, "fast.service", result_for(id));
                }
                Box::new(parse_object_path(&job).unwrap())
            }
        };

        reply
            .downcast::<R>()
            .map(|r| *r)
            .map_err(|_| ManagerError::Decoding {
                method: method.to_string(),
                reason: "unexpected reply shape".into(),
            })
    }

    async fn job_removed(&self) -> Result<CompletionStream, ManagerError> {
        let rx = self.completions_rx.lock().unwrap().take().unwrap();
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|completion| (completion, rx))
        })
        .boxed())
    }
}

/// Result the fake manager reports for job `id`; job 42 is `done`.
fn result_for(id: u32) -> &'static str {
    const RESULTS: [&str; 6] = ["done", "failed", "timeout", "skipped", "dependency", "canceled"];
    RESULTS[id as usize % RESULTS.len()]
}

async fn connect() -> ManagerClient<FakeTransport> {
    ManagerClient::connect(FakeTransport::new()).await.unwrap()
}

async fn recv(rx: sysjobs::manager::JobReceiver) -> JobResult {
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("no result within 2s")
        .expect("channel closed")
}

#[tokio::test]
async fn test_start_then_done() {
    let client = connect().await;
    let ctx = CallContext::background();
    let (tx, rx) = job_channel();

    let id = client
        .start_unit(&ctx, "app.service", JobMode::Replace, Some(tx))
        .await
        .unwrap();
    assert_eq!(id, 42);
    assert_eq!(client.listener().pending_count(), 1);

    client
        .transport()
        .complete("/org/freedesktop/systemd1/job/42", "app.service", "done");
    assert_eq!(recv(rx).await, JobResult::Done);
    assert_eq!(client.listener().pending_count(), 0);
}

#[tokio::test]
async fn test_failed_result_is_delivered_not_raised() {
    let client = connect().await;
    let ctx = CallContext::background();
    let (tx, rx) = job_channel();

    client
        .stop_unit(&ctx, "db.service", JobMode::Fail, Some(tx))
        .await
        .unwrap();
    client
        .transport()
        .complete("/org/freedesktop/systemd1/job/42", "db.service", "failed");
    assert_eq!(recv(rx).await, JobResult::Failed);
}

#[tokio::test]
async fn test_unknown_result_string_is_carried() {
    let client = connect().await;
    let ctx = CallContext::background();
    let (tx, rx) = job_channel();

    client
        .restart_unit(&ctx, "app.service", JobMode::Replace, Some(tx))
        .await
        .unwrap();
    client
        .transport()
        .complete("/org/freedesktop/systemd1/job/42", "app.service", "frobnicated");
    assert_eq!(recv(rx).await, JobResult::Other("frobnicated".into()));
}

#[tokio::test]
async fn test_non_numeric_job_path() {
    let client = connect().await;
    let ctx = CallContext::background();
    client.transport().replies.lock().unwrap().insert(
        "StartUnit",
        Box::new(parse_object_path("/org/freedesktop/systemd1/job/abc").unwrap()),
    );

    let (tx, rx) = job_channel();
    let id = client
        .start_unit(&ctx, "app.service", JobMode::Replace, Some(tx))
        .await
        .unwrap();
    assert_eq!(id, 0);

    client
        .transport()
        .complete("/org/freedesktop/systemd1/job/abc", "app.service", "done");
    assert_eq!(recv(rx).await, JobResult::Done);
}

#[tokio::test]
async fn test_concurrent_jobs_do_not_cross() {
    let client = connect().await;
    let ctx = CallContext::background();
    let units = ["a.service", "b.service", "c.service", "d.service"];

    let mut receivers = Vec::new();
    let mut issued = Vec::new();
    for unit in units {
        let (tx, rx) = job_channel();
        receivers.push(rx);
        issued.push(client.start_unit(&ctx, unit, JobMode::Replace, Some(tx)));
    }
    let ids: Vec<u32> = join_all(issued)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(client.listener().pending_count(), units.len());

    // Complete in reverse order, each with a result naming its own job.
    let results = ["done", "failed", "timeout", "skipped"];
    for (i, id) in ids.iter().enumerate().rev() {
        let job = format!("/org/freedesktop/systemd1/job/{}", id);
        client.transport().complete(&job, units[i], results[i]);
    }

    for (i, rx) in receivers.into_iter().enumerate() {
        assert_eq!(recv(rx).await, JobResult::parse(results[i]));
    }
    assert_eq!(client.listener().pending_count(), 0);
}

#[tokio::test]
async fn test_no_channel_no_entry() {
    let client = connect().await;
    let ctx = CallContext::background();

    let id = client
        .start_unit(&ctx, "app.service", JobMode::Replace, None)
        .await
        .unwrap();
    assert_eq!(id, 42);
    assert_eq!(client.listener().pending_count(), 0);

    client
        .transport()
        .complete("/org/freedesktop/systemd1/job/42", "app.service", "done");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.listener().pending_count(), 0);
}

#[tokio::test]
async fn test_completion_before_reply_is_not_lost() {
    let client = connect().await;
    client.transport().complete_early.store(true, Ordering::SeqCst);
    let ctx = CallContext::background();
    let (tx, rx) = job_channel();

    client
        .start_unit(&ctx, "fast.service", JobMode::Replace, Some(tx))
        .await
        .unwrap();

    assert_eq!(recv(rx).await, JobResult::Done);
    assert_eq!(client.listener().pending_count(), 0);
}

#[tokio::test]
async fn test_transport_error_registers_nothing() {
    let client = connect().await;
    let ctx = CallContext::background();
    *client.transport().failure.lock().unwrap() =
        Some("Unit missing.service not found.".into());

    let (tx, rx) = job_channel();
    let err = client
        .start_unit(&ctx, "missing.service", JobMode::Replace, Some(tx))
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Transport { .. }));
    assert!(err.to_string().contains("not found"));
    assert_eq!(client.listener().pending_count(), 0);
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_wrong_reply_shape_is_decoding_error() {
    let client = connect().await;
    let ctx = CallContext::background();
    client
        .transport()
        .replies
        .lock()
        .unwrap()
        .insert("StartUnit", Box::new("not a path".to_string()));

    let (tx, _rx) = job_channel();
    let err = client
        .start_unit(&ctx, "app.service", JobMode::Replace, Some(tx))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Decoding { .. }));
    assert_eq!(client.listener().pending_count(), 0);
}

#[tokio::test]
async fn test_invalid_unit_name_makes_no_call() {
    let client = connect().await;
    let ctx = CallContext::background();

    let err = client
        .get_unit_property(&ctx, "bad unit name!", "ActiveState")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::InvalidIdentifier(_)));
    assert!(client.transport().calls().is_empty());
}

#[tokio::test]
async fn test_call_timeout_registers_nothing() {
    let client = connect().await;
    client.transport().complete_early.store(true, Ordering::SeqCst);
    let ctx = CallContext::with_timeout(Duration::from_millis(1));

    let (tx, rx) = job_channel();
    let err = client
        .start_unit(&ctx, "fast.service", JobMode::Replace, Some(tx))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::TimedOut { .. }));
    assert_eq!(client.listener().pending_count(), 0);
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_close_releases_waiters() {
    let client = connect().await;
    let ctx = CallContext::background();
    let (tx, rx) = job_channel();
    client
        .start_unit(&ctx, "app.service", JobMode::Replace, Some(tx))
        .await
        .unwrap();

    client.close();
    assert!(rx.await.is_err());
}

/// Start `count` jobs from separate tasks and check every caller gets the
/// result of its own job.
async fn start_from_many_tasks(client: Arc<ManagerClient<FakeTransport>>, count: usize) {
    let tasks: Vec<_> = (0..count)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let ctx = CallContext::background();
                let (tx, rx) = job_channel();
                let unit = format!("worker-{}.service", i);
                let id = client
                    .start_unit(&ctx, &unit, JobMode::Replace, Some(tx))
                    .await
                    .unwrap();
                (id, recv(rx).await)
            })
        })
        .collect();

    // Completions for jobs nobody issued interleave with the real ones.
    for id in 9000..9000 + count as u32 {
        let job = format!("/org/freedesktop/systemd1/job/{}", id);
        client.transport().complete(&job, "noise.service", "done");
        tokio::task::yield_now().await;
    }

    let mut seen = HashSet::new();
    for task in join_all(tasks).await {
        let (id, result) = task.unwrap();
        assert!(seen.insert(id), "job id {} issued twice", id);
        assert_eq!(result, JobResult::parse(result_for(id)), "job {}", id);
    }
    assert_eq!(seen.len(), count);
    assert_eq!(client.listener().pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completion_racing_reply_across_threads() {
    let client = connect().await;
    client.transport().race_completion.store(true, Ordering::SeqCst);
    start_from_many_tasks(Arc::new(client), 64).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_early_completions_across_threads() {
    let client = connect().await;
    client.transport().complete_early.store(true, Ordering::SeqCst);
    start_from_many_tasks(Arc::new(client), 64).await;
}
