//! Worker Handle (C2): owns one VM's control socket, status, and heartbeat
//! clock.
//!
//! A `WorkerHandle` is plain data owned exclusively by the Pool Scheduler's
//! single dispatch task (see `scheduler.rs`) — there is no worker-table mutex
//! because there's only ever one writer. Everything that happens off that
//! task (dialing the VM socket, reading frames off it) reports back over the
//! `WorkerEvent` channel instead of reaching into the handle directly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::PoolConfig;
use crate::error::OrcaError;
use crate::frame::{Frame, FrameCodec, FrameType};
use crate::router::Router;

/// Identifies a worker. Ids are monotonically assigned by the scheduler and
/// gaps are reused (§3 "Worker").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> String {
        id.0.to_string()
    }
}

impl TryFrom<String> for WorkerId {
    type Error = std::num::ParseIntError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse().map(WorkerId)
    }
}

/// Worker state machine (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Connected,
    Ready,
    Busy,
    Stale,
    Disconnected,
    Failed,
}

impl WorkerStatus {
    /// Whether a worker in this status may be picked for a non-targeted
    /// dispatch (§4.4 step 2).
    pub fn schedulable(self) -> bool {
        matches!(self, WorkerStatus::Ready)
    }

    /// Whether a worker in this status may still accept a targeted `exec`
    /// (§4.4 step 1 — targeted dispatch may attach to an already-busy
    /// worker).
    pub fn targetable(self) -> bool {
        matches!(
            self,
            WorkerStatus::Connected | WorkerStatus::Ready | WorkerStatus::Busy
        )
    }
}

/// One completed job, retained in a worker's bounded history (§3 "Worker").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub job_id: String,
    pub label: String,
    pub exit_code: Option<i32>,
    pub finished_at_unix_ms: i64,
}

/// Provides the socket path a worker's agent will be (or already is)
/// listening on. Standing in for low-level hypervisor launch, which §1 scopes
/// out of the core: "assumed to provide a socket path per worker".
pub trait VmLauncher: Send + Sync {
    /// Begin launching the VM for `id` and return the control socket path it
    /// will listen on. Must return promptly — the agent-connect loop does
    /// the waiting.
    fn launch(&self, id: WorkerId) -> std::io::Result<PathBuf>;

    /// Best-effort termination of the VM process for `id`, called from
    /// `WorkerHandle::close`.
    fn terminate(&self, _id: WorkerId) {}
}

/// Events the connect loop / reader task report back to the scheduler. The
/// scheduler is the sole owner of `WorkerHandle` state and applies these
/// serially from within its `tokio::select!` loop.
#[derive(Debug)]
pub enum WorkerEvent {
    Connected {
        worker_id: WorkerId,
        write_tx: mpsc::Sender<Frame>,
    },
    ConnectFailed {
        worker_id: WorkerId,
    },
    /// A frame (of any type) arrived on the worker's socket — bumps
    /// `last_health` per §4.2 ("updates `last_health` on every frame
    /// received from the worker, not only heartbeats").
    FrameSeen {
        worker_id: WorkerId,
    },
    Heartbeat {
        worker_id: WorkerId,
        free_mem_mb: u64,
        load_avg: f64,
    },
    Disconnected {
        worker_id: WorkerId,
    },
}

/// A detached sender for one worker's control socket, held by the job
/// executor task dispatched onto that worker.
#[derive(Clone)]
pub struct WorkerSender(pub mpsc::Sender<Frame>);

impl WorkerSender {
    pub async fn send(&self, frame: Frame) -> Result<(), OrcaError> {
        self.0
            .send(frame)
            .await
            .map_err(|_| OrcaError::ClientInput("worker socket closed".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatPayload {
    free_mem_mb: u64,
    load_avg: f64,
}

/// One managed VM (§3 "Worker").
pub struct WorkerHandle {
    pub id: WorkerId,
    pub status: WorkerStatus,
    write_tx: Option<mpsc::Sender<Frame>>,
    pub last_heartbeat: Option<Instant>,
    pub active_jobs: u32,
    pub last_job: Option<String>,
    pub job_history: VecDeque<JobHistoryEntry>,
    pub free_mem_mb: Option<u64>,
    pub load_avg: Option<f64>,
    pub idle_since: Option<Instant>,
    pub stale_since: Option<Instant>,
    connect_task: Option<JoinHandle<()>>,
    launcher: Arc<dyn VmLauncher>,
}

impl WorkerHandle {
    pub const MAX_JOB_HISTORY: usize = 20;

    /// Worker.Start(id): launch the VM and begin the agent-connect loop.
    /// Returns immediately; status transitions starting -> connected -> ready
    /// are driven by `WorkerEvent`s consumed by the scheduler.
    pub fn start(
        id: WorkerId,
        launcher: Arc<dyn VmLauncher>,
        router: Arc<Router>,
        internal_tx: mpsc::UnboundedSender<WorkerEvent>,
        cfg: &PoolConfig,
    ) -> Self {
        let connect_task = tokio::spawn(connect_loop(
            id,
            launcher.clone(),
            router,
            internal_tx,
            cfg.agent_connect_timeout,
            cfg.agent_dial_interval,
        ));

        Self {
            id,
            status: WorkerStatus::Starting,
            write_tx: None,
            last_heartbeat: None,
            active_jobs: 0,
            last_job: None,
            job_history: VecDeque::new(),
            free_mem_mb: None,
            load_avg: None,
            idle_since: None,
            stale_since: None,
            connect_task: Some(connect_task),
            launcher,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active_jobs == 0
    }

    pub fn is_busy(&self) -> bool {
        self.active_jobs >= 1
    }

    pub fn mark_connected(&mut self, write_tx: mpsc::Sender<Frame>) {
        self.write_tx = Some(write_tx);
        self.status = WorkerStatus::Connected;
        self.last_heartbeat = Some(Instant::now());
    }

    pub fn mark_ready(&mut self) {
        if matches!(self.status, WorkerStatus::Connected) {
            self.status = WorkerStatus::Ready;
            self.idle_since = Some(Instant::now());
        }
    }

    pub fn mark_heartbeat(&mut self, free_mem_mb: u64, load_avg: f64) {
        self.last_heartbeat = Some(Instant::now());
        self.free_mem_mb = Some(free_mem_mb);
        self.load_avg = Some(load_avg);
        if matches!(self.status, WorkerStatus::Connected) {
            self.mark_ready();
        } else if matches!(self.status, WorkerStatus::Stale) {
            self.status = if self.is_idle() { WorkerStatus::Ready } else { WorkerStatus::Busy };
            self.stale_since = None;
        }
    }

    pub fn bump_health(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }

    pub fn mark_stale(&mut self) {
        if matches!(self.status, WorkerStatus::Ready | WorkerStatus::Busy) {
            self.status = WorkerStatus::Stale;
            self.stale_since = Some(Instant::now());
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.status = WorkerStatus::Disconnected;
        self.write_tx = None;
    }

    pub fn claim(&mut self) {
        self.active_jobs += 1;
        self.status = WorkerStatus::Busy;
        self.idle_since = None;
    }

    pub fn release(&mut self, entry: JobHistoryEntry) {
        self.active_jobs = self.active_jobs.saturating_sub(1);
        self.last_job = Some(entry.label.clone());
        self.job_history.push_back(entry);
        while self.job_history.len() > Self::MAX_JOB_HISTORY {
            self.job_history.pop_front();
        }
        if self.active_jobs == 0 {
            self.status = WorkerStatus::Ready;
            self.idle_since = Some(Instant::now());
        }
    }

    /// Worker.Send(frame): fails if the worker isn't in a connected-ish
    /// state.
    pub async fn send(&self, frame: Frame) -> Result<(), OrcaError> {
        match (&self.write_tx, self.status) {
            (Some(tx), WorkerStatus::Connected | WorkerStatus::Ready | WorkerStatus::Busy) => tx
                .send(frame)
                .await
                .map_err(|_| OrcaError::ClientInput(format!("worker {} socket closed", self.id))),
            _ => Err(OrcaError::ClientInput(format!(
                "worker {} is not accepting frames (status {:?})",
                self.id, self.status
            ))),
        }
    }

    /// A cloneable handle to this worker's write side, detached from the
    /// status check in `send` — used to hand a job executor task something
    /// it can hold onto for the lifetime of the job without borrowing the
    /// scheduler's worker table.
    pub fn sender(&self) -> Option<WorkerSender> {
        self.write_tx.clone().map(WorkerSender)
    }

    /// Worker.Close(): terminate the VM and free the socket path.
    pub fn close(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.write_tx = None;
        self.status = WorkerStatus::Disconnected;
        self.launcher.terminate(self.id);
    }
}

async fn connect_loop(
    id: WorkerId,
    launcher: Arc<dyn VmLauncher>,
    router: Arc<Router>,
    internal_tx: mpsc::UnboundedSender<WorkerEvent>,
    timeout: Duration,
    dial_interval: Duration,
) {
    let path = match launcher.launch(id) {
        Ok(path) => path,
        Err(err) => {
            tracing::warn!(worker_id = %id, error = %err, "vm launch failed");
            let _ = internal_tx.send(WorkerEvent::ConnectFailed { worker_id: id });
            return;
        }
    };

    let deadline = Instant::now() + timeout;
    let stream = loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => break stream,
            Err(err) => {
                if Instant::now() >= deadline {
                    let err = OrcaError::WorkerDial { worker_id: id, source: err };
                    tracing::warn!(worker_id = %id, error = %err, "agent connect timed out");
                    let _ = internal_tx.send(WorkerEvent::ConnectFailed { worker_id: id });
                    return;
                }
                tokio::time::sleep(dial_interval).await;
            }
        }
    };

    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::channel(64);
    tokio::spawn(writer_task(write_half, write_rx));
    tokio::spawn(reader_task(id, read_half, router, internal_tx.clone()));

    tracing::info!(worker_id = %id, "worker agent connected");
    let _ = internal_tx.send(WorkerEvent::Connected { worker_id: id, write_tx });
}

async fn writer_task<W>(write_half: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(write_half, FrameCodec::default());
    while let Some(frame) = rx.recv().await {
        if let Err(err) = sink.send(frame).await {
            tracing::warn!(error = %err, "worker write failed, closing writer");
            break;
        }
    }
}

async fn reader_task<R>(
    id: WorkerId,
    read_half: R,
    router: Arc<Router>,
    internal_tx: mpsc::UnboundedSender<WorkerEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut stream = FramedRead::new(read_half, FrameCodec::default());
    loop {
        match stream.next().await {
            Some(Ok(mut frame)) => {
                let _ = internal_tx.send(WorkerEvent::FrameSeen { worker_id: id });
                if frame.kind == FrameType::Heartbeat {
                    match frame
                        .payload
                        .clone()
                        .map(serde_json::from_value::<HeartbeatPayload>)
                    {
                        Some(Ok(hb)) => {
                            let _ = internal_tx.send(WorkerEvent::Heartbeat {
                                worker_id: id,
                                free_mem_mb: hb.free_mem_mb,
                                load_avg: hb.load_avg,
                            });
                        }
                        _ => tracing::warn!(worker_id = %id, "malformed heartbeat payload"),
                    }
                    continue;
                }
                frame.worker_id = Some(id);
                router.deliver(frame).await;
            }
            Some(Err(err)) => {
                tracing::warn!(worker_id = %id, error = %err, "worker frame decode error, closing connection");
                break;
            }
            None => break,
        }
    }
    let _ = internal_tx.send(WorkerEvent::Disconnected { worker_id: id });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_round_trips_through_string() {
        let id = WorkerId(42);
        let s: String = id.into();
        assert_eq!(s, "42");
        assert_eq!(WorkerId::try_from(s).unwrap(), WorkerId(42));
    }

    #[test]
    fn busy_iff_active_jobs_nonzero() {
        let launcher: Arc<dyn VmLauncher> = Arc::new(NullLauncher);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = WorkerHandle::start(
            WorkerId(1),
            launcher,
            Arc::new(Router::new()),
            tx,
            &PoolConfig::default(),
        );
        assert!(handle.is_idle());
        handle.claim();
        assert!(handle.is_busy());
        assert_eq!(handle.active_jobs, 1);
        handle.release(JobHistoryEntry {
            job_id: "j1".into(),
            label: "echo".into(),
            exit_code: Some(0),
            finished_at_unix_ms: 0,
        });
        assert!(handle.is_idle());
        handle.close();
    }

    struct NullLauncher;
    impl VmLauncher for NullLauncher {
        fn launch(&self, _id: WorkerId) -> std::io::Result<PathBuf> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no vm"))
        }
    }
}
