//! Pool Scheduler (C4, §4.4): the single task that owns the worker table and
//! the job queue, dispatches work, scales the pool, and shrinks it back down
//! when idle. Mirrors the worker-table/routes-table split of §5: this task
//! is the sole writer of the worker table, so no lock is needed around it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::api::ControllerEvent;
use crate::config::PoolConfig;
use crate::executor::{self, JobDone, QueuedJob};
use crate::frame::Frame;
use crate::health::PoolStatus;
use crate::job::{Job, JobId};
use crate::router::Router;
use crate::worker::{VmLauncher, WorkerEvent, WorkerHandle, WorkerId, WorkerStatus};

/// Requests the scheduler accepts from the control server and from clients
/// relayed through it.
pub(crate) enum SchedulerCommand {
    SubmitJob {
        job: Job,
        client_tx: mpsc::Sender<Frame>,
    },
    Stdin {
        job_id: JobId,
        data: Vec<u8>,
    },
    Resize {
        job_id: JobId,
        rows: u16,
        cols: u16,
    },
    CancelJob {
        job_id: JobId,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct Scheduler {
    config: PoolConfig,
    launcher: Arc<dyn VmLauncher>,
    router: Arc<Router>,
    queue: VecDeque<QueuedJob>,
    workers: HashMap<WorkerId, WorkerHandle>,
    cancel_signals: HashMap<JobId, oneshot::Sender<()>>,
    cmd_rx: mpsc::Receiver<SchedulerCommand>,
    internal_tx: mpsc::UnboundedSender<WorkerEvent>,
    internal_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    done_tx: mpsc::UnboundedSender<JobDoneWithJob>,
    done_rx: mpsc::UnboundedReceiver<JobDoneWithJob>,
    events_tx: broadcast::Sender<ControllerEvent>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    last_wait_log: Instant,
}

/// `executor::JobDone` plus the job id, so release-time bookkeeping here
/// doesn't need a second lookup.
pub(crate) struct JobDoneWithJob {
    pub(crate) job_id: JobId,
    pub(crate) inner: JobDone,
}

#[allow(clippy::too_many_arguments)]
impl Scheduler {
    pub(crate) fn new(
        config: PoolConfig,
        launcher: Arc<dyn VmLauncher>,
        router: Arc<Router>,
        cmd_rx: mpsc::Receiver<SchedulerCommand>,
        events_tx: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            config,
            launcher,
            router,
            queue: VecDeque::new(),
            workers: HashMap::new(),
            cancel_signals: HashMap::new(),
            cmd_rx,
            internal_tx,
            internal_rx,
            done_tx,
            done_rx,
            events_tx,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
            last_wait_log: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut dispatch_interval = tokio::time::interval(self.config.dispatch_poll_interval);
        let mut health_interval = tokio::time::interval(Duration::from_secs(10));
        let mut status_log_interval = tokio::time::interval(self.config.status_log_interval);

        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some(event) = self.internal_rx.recv() => self.handle_worker_event(event).await,
                Some(done) = self.done_rx.recv() => self.handle_job_done(done),
                _ = dispatch_interval.tick() => {
                    self.try_dispatch();
                    self.maybe_shrink();
                }
                _ = health_interval.tick() => self.tick_health(),
                _ = status_log_interval.tick() => self.log_status(),
                else => break,
            }

            if self.shutting_down && self.workers.is_empty() {
                break;
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::SubmitJob { job, client_tx } => {
                if self.shutting_down {
                    let _ = client_tx
                        .send(Frame::error_reply(job.id.to_string(), "controller shutting down"))
                        .await;
                    return;
                }
                if self.config.max_size == 0 {
                    let _ = client_tx
                        .send(Frame::error_reply(job.id.to_string(), "pool MaxSize is 0"))
                        .await;
                    return;
                }
                let job_id = job.id.clone();
                self.queue.push_back(QueuedJob { job, client_tx });
                let _ = self.events_tx.send(ControllerEvent::JobQueued { job_id });
            }
            SchedulerCommand::Stdin { job_id, data } => {
                let frame = Frame::new(crate::frame::FrameType::Stdin, job_id.clone())
                    .with_ref(job_id.clone())
                    .with_data(data);
                self.forward_to_worker(job_id, frame).await;
            }
            SchedulerCommand::Resize { job_id, rows, cols } => {
                let frame = Frame::new(crate::frame::FrameType::Resize, job_id.clone())
                    .with_ref(job_id.clone())
                    .with_payload(serde_json::json!({ "rows": rows, "cols": cols }));
                self.forward_to_worker(job_id, frame).await;
            }
            SchedulerCommand::CancelJob { job_id } => {
                if let Some(tx) = self.cancel_signals.remove(&job_id) {
                    let _ = tx.send(());
                }
            }
            SchedulerCommand::Status { reply } => {
                let _ = reply.send(self.snapshot_status());
            }
            SchedulerCommand::Shutdown { reply } => {
                self.begin_shutdown().await;
                self.shutdown_waiters.push(reply);
            }
        }
    }

    async fn forward_to_worker(&self, job_id: JobId, frame: Frame) {
        let Some(worker_id) = self.router.worker_for(job_id.clone()).await else {
            return;
        };
        if let Some(worker) = self.workers.get(&worker_id) {
            if let Err(err) = worker.send(frame).await {
                tracing::warn!(%job_id, %worker_id, %err, "failed to forward frame to worker");
            }
        }
    }

    async fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        while let Some(queued) = self.queue.pop_front() {
            let _ = queued
                .client_tx
                .send(Frame::error_reply(queued.job.id.to_string(), "controller shutting down"))
                .await;
        }
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            if let Some(mut worker) = self.workers.remove(&id) {
                worker.close();
            }
        }
    }

    fn try_dispatch(&mut self) {
        loop {
            let Some(front) = self.queue.front() else { break };

            if let Some(target) = front.job.target_vm {
                match self.workers.get(&target).map(|w| w.status) {
                    Some(status) if status.targetable() => {
                        let queued = self.queue.pop_front().unwrap();
                        self.claim_and_spawn(target, queued);
                    }
                    Some(_) => break,
                    None => {
                        let queued = self.queue.pop_front().unwrap();
                        let _ = queued.client_tx.try_send(Frame::error_reply(
                            queued.job.id.to_string(),
                            format!("VM {target} not found"),
                        ));
                    }
                }
                continue;
            }

            let idle = self
                .workers
                .iter()
                .find(|(_, w)| w.status.schedulable() && w.is_idle())
                .map(|(id, _)| *id);

            if let Some(id) = idle {
                let queued = self.queue.pop_front().unwrap();
                self.claim_and_spawn(id, queued);
                continue;
            }

            if self.workers.len() < self.config.max_size as usize {
                let id = self.next_free_id();
                let handle = WorkerHandle::start(
                    id,
                    self.launcher.clone(),
                    self.router.clone(),
                    self.internal_tx.clone(),
                    &self.config,
                );
                self.workers.insert(id, handle);
                let _ = self.events_tx.send(ControllerEvent::WorkerStarted { id });
            }

            if self.last_wait_log.elapsed() >= Duration::from_secs(10) {
                tracing::info!(queued = self.queue.len(), workers = self.workers.len(), "waiting for an idle worker");
                self.last_wait_log = Instant::now();
            }
            break;
        }
    }

    fn next_free_id(&self) -> WorkerId {
        let mut candidate = 1u64;
        while self.workers.contains_key(&WorkerId(candidate)) {
            candidate += 1;
        }
        WorkerId(candidate)
    }

    fn claim_and_spawn(&mut self, worker_id: WorkerId, queued: QueuedJob) {
        let job_id = queued.job.id.clone();
        let Some(handle) = self.workers.get_mut(&worker_id) else { return };
        handle.claim();
        let Some(sender) = handle.sender() else {
            handle.release(crate::worker::JobHistoryEntry {
                job_id: job_id.to_string(),
                label: queued.job.kind.label().to_string(),
                exit_code: None,
                finished_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            });
            let client_tx = queued.client_tx.clone();
            let _ = client_tx.try_send(Frame::error_reply(job_id.to_string(), "worker socket not ready"));
            return;
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel_signals.insert(job_id, cancel_tx);

        let router = self.router.clone();
        let events = self.events_tx.clone();
        let done_tx = self.done_tx.clone();
        let artifact_dir = self.config.artifact_dir.clone();
        tokio::spawn(async move {
            let done = executor::run_and_report(queued, worker_id, sender, router, events, cancel_rx, artifact_dir).await;
            let _ = done_tx.send(JobDoneWithJob { job_id, inner: done });
        });
    }

    fn handle_job_done(&mut self, done: JobDoneWithJob) {
        self.cancel_signals.remove(&done.job_id);
        if let Some(worker) = self.workers.get_mut(&done.inner.worker_id) {
            worker.release(done.inner.entry);
        }
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Connected { worker_id, write_tx } => {
                if let Some(w) = self.workers.get_mut(&worker_id) {
                    w.mark_connected(write_tx);
                }
                let _ = self.events_tx.send(ControllerEvent::WorkerConnected { id: worker_id });
            }
            WorkerEvent::ConnectFailed { worker_id } => {
                self.workers.remove(&worker_id);
                let _ = self.events_tx.send(ControllerEvent::WorkerFailed { id: worker_id });
            }
            WorkerEvent::FrameSeen { worker_id } => {
                if let Some(w) = self.workers.get_mut(&worker_id) {
                    w.bump_health();
                }
            }
            WorkerEvent::Heartbeat { worker_id, free_mem_mb, load_avg } => {
                if let Some(w) = self.workers.get_mut(&worker_id) {
                    w.mark_heartbeat(free_mem_mb, load_avg);
                }
            }
            WorkerEvent::Disconnected { worker_id } => {
                let jobs = self.router.jobs_on_worker(worker_id).await;
                for job_id in jobs {
                    let err = crate::error::OrcaError::WorkerDied { worker_id, job_id: job_id.clone() };
                    tracing::warn!(%err, "worker died mid-job");
                    let frame = Frame::new(crate::frame::FrameType::Error, uuid::Uuid::new_v4().to_string())
                        .with_ref(job_id.to_string())
                        .with_error("worker disconnected")
                        .with_exit_code(-1);
                    self.router.deliver(frame).await;
                }
                self.workers.remove(&worker_id);
                let _ = self.events_tx.send(ControllerEvent::WorkerDisconnected { id: worker_id });
            }
        }
    }

    fn maybe_shrink(&mut self) {
        let now = Instant::now();
        let warm = self.config.warm_size as usize;
        let idle_count = self
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Ready && w.is_idle())
            .count();
        let excess = idle_count.saturating_sub(warm);
        if excess == 0 {
            return;
        }

        let mut candidates: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| {
                w.status == WorkerStatus::Ready
                    && w.is_idle()
                    && w.idle_since
                        .map(|t| now.duration_since(t) >= self.config.shrink_grace_period)
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));

        for id in candidates.into_iter().take(excess) {
            if let Some(mut w) = self.workers.remove(&id) {
                w.close();
                let _ = self.events_tx.send(ControllerEvent::WorkerClosed { id });
            }
        }
    }

    fn tick_health(&mut self) {
        let now = Instant::now();
        let mut to_close = Vec::new();
        for (id, w) in self.workers.iter_mut() {
            match w.status {
                WorkerStatus::Ready | WorkerStatus::Busy => {
                    if w.last_heartbeat
                        .map(|t| now.duration_since(t) >= self.config.heartbeat_timeout)
                        .unwrap_or(false)
                    {
                        w.mark_stale();
                        tracing::warn!(worker_id = %id, "worker heartbeat stale");
                    }
                }
                WorkerStatus::Stale => {
                    if w.stale_since
                        .map(|t| now.duration_since(t) >= self.config.stale_grace_period)
                        .unwrap_or(false)
                    {
                        to_close.push(*id);
                    }
                }
                _ => {}
            }
        }
        for id in to_close {
            if let Some(mut w) = self.workers.remove(&id) {
                w.close();
                let _ = self.events_tx.send(ControllerEvent::WorkerClosed { id });
            }
        }
    }

    fn log_status(&self) {
        tracing::info!(
            workers = self.workers.len(),
            queued = self.queue.len(),
            warm_size = self.config.warm_size,
            max_size = self.config.max_size,
            "pool status"
        );
    }

    fn snapshot_status(&self) -> PoolStatus {
        PoolStatus {
            vms: self.workers.values().map(crate::health::WorkerStatusView::from).collect(),
            warm_size: self.config.warm_size,
            max_size: self.config.max_size,
            queued_jobs: self.queue.len(),
        }
    }
}
