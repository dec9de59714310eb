//! Public facade: the shape an embedder (the `orca-server` binary, or a
//! future TUI) sees. Mirrors the config/event/handle split used elsewhere in
//! this codebase for other long-lived subsystems — a handle that only talks
//! to its owning task over channels, never touching shared state directly.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::PoolConfig;
use crate::error::{OrcaError, Result};
use crate::frame::Frame;
use crate::health::PoolStatus;
use crate::job::{Job, JobId};
use crate::router::Router;
use crate::scheduler::{Scheduler, SchedulerCommand};
use crate::tap::{TapEvent, TapReport};
use crate::worker::{VmLauncher, WorkerId};

/// Everything needed to start one pool.
pub struct ControllerConfig {
    pub pool: PoolConfig,
    pub launcher: Arc<dyn VmLauncher>,
}

/// Observable events a subscriber can fold into a UI, a log, or a test
/// assertion. These are derived/internal — never confused with the wire
/// protocol's closed `FrameType` set (§9).
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    WorkerStarted { id: WorkerId },
    WorkerConnected { id: WorkerId },
    WorkerFailed { id: WorkerId },
    WorkerDisconnected { id: WorkerId },
    WorkerClosed { id: WorkerId },
    JobQueued { job_id: JobId },
    JobDispatched { job_id: JobId, worker_id: WorkerId },
    JobFinished {
        job_id: JobId,
        worker_id: WorkerId,
        exit_code: Option<i32>,
        report: Option<TapReport>,
    },
    TapProgress { job_id: JobId, event: TapEvent },
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Front door to a running pool. Cheap to clone; every method is a channel
/// send to the single scheduler task.
#[derive(Clone)]
pub struct ControllerHandle {
    cmd_tx: mpsc::Sender<SchedulerCommand>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn submit_job(&self, job: Job, client_tx: mpsc::Sender<Frame>) -> Result<()> {
        self.cmd_tx
            .send(SchedulerCommand::SubmitJob { job, client_tx })
            .await
            .map_err(|_| OrcaError::Invariant("scheduler task is gone".to_string()))
    }

    pub async fn stdin(&self, job_id: JobId, data: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(SchedulerCommand::Stdin { job_id, data })
            .await
            .map_err(|_| OrcaError::Invariant("scheduler task is gone".to_string()))
    }

    pub async fn resize(&self, job_id: JobId, rows: u16, cols: u16) -> Result<()> {
        self.cmd_tx
            .send(SchedulerCommand::Resize { job_id, rows, cols })
            .await
            .map_err(|_| OrcaError::Invariant("scheduler task is gone".to_string()))
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.cmd_tx
            .send(SchedulerCommand::CancelJob { job_id })
            .await
            .map_err(|_| OrcaError::Invariant("scheduler task is gone".to_string()))
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SchedulerCommand::Status { reply: reply_tx })
            .await
            .map_err(|_| OrcaError::Invariant("scheduler task is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| OrcaError::Invariant("scheduler dropped status reply".to_string()))
    }

    /// A scheduler that already shut down has dropped `cmd_rx`, so a second
    /// call's send fails — that's the well-defined no-op case, not an error.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SchedulerCommand::Shutdown { reply: reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }
}

/// Start a pool's scheduler task and return a handle to it. The caller (the
/// control server) owns accepting connections; this only owns dispatch.
pub fn start_controller(config: ControllerConfig) -> ControllerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (events_tx, _events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let router = Arc::new(Router::new());

    let scheduler = Scheduler::new(config.pool, config.launcher, router, cmd_rx, events_tx.clone());
    tokio::spawn(scheduler.run());

    ControllerHandle { cmd_tx, events: events_tx }
}
