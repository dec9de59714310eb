//! Control Server (C7, §4.7): accepts client connections on the control
//! socket, writes the sibling PID file, and dispatches each connection's
//! framed requests to the scheduler via a `ControllerHandle`.
//!
//! One task per accepted connection (§5 `client_handler`), split into a
//! reader half that decodes requests and a writer half fed by an
//! `mpsc::Sender<Frame>` — this is the `client_tx` the scheduler forwards a
//! job's frames into, mirroring the per-connection write mutex discipline of
//! §5 ("readers are single-threaded by construction").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::api::ControllerHandle;
use crate::error::{OrcaError, Result};
use crate::frame::{Frame, FrameCodec, FrameType};
use crate::job::{Job, JobKind};
use crate::worker::WorkerId;

/// Capacity of a client connection's outbound frame channel. Bounded so a
/// stalled client applies backpressure to its own job's executor rather than
/// growing memory without limit.
const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Owns the listening socket and the PID file alongside it; both are
/// removed on clean shutdown (§6).
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    controller: ControllerHandle,
    max_frame_bytes: usize,
    shutdown: Arc<Notify>,
}

impl ControlServer {
    /// Bind the control socket at `socket_path`, writing `<socket_path
    /// without extension>.pid` (sibling PID file, §6) next to it. Fails if
    /// the socket path is already in use by a live listener.
    pub async fn bind(
        socket_path: PathBuf,
        controller: ControllerHandle,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        if socket_path.exists() {
            // A stale socket from an unclean prior shutdown; a live listener
            // would have made the connect below fail instead.
            if UnixStream::connect(&socket_path).await.is_err() {
                let _ = std::fs::remove_file(&socket_path);
            }
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| OrcaError::ControlSocket {
                path: socket_path.clone(),
                source,
            })?;
        }
        let listener = UnixListener::bind(&socket_path).map_err(|source| OrcaError::ControlSocket {
            path: socket_path.clone(),
            source,
        })?;

        let pid_path = pid_file_path(&socket_path);
        std::fs::write(&pid_path, std::process::id().to_string()).map_err(|source| {
            OrcaError::ControlSocket { path: pid_path.clone(), source }
        })?;

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            controller,
            max_frame_bytes,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// A handle to trigger shutdown of the accept loop from outside (e.g. a
    /// Ctrl-C handler in `orca-server`'s `main`).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the accept loop until shutdown is signaled. Mirrors §5
    /// `accept_loop`: returns once the shutdown notification fires, letting
    /// in-flight connection handlers drain on their own.
    pub async fn run(self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    tracing::info!("control server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let controller = self.controller.clone();
                            let max_frame_bytes = self.max_frame_bytes;
                            tokio::spawn(async move {
                                let (read_half, write_half) = stream.into_split();
                                handle_connection(read_half, write_half, controller, max_frame_bytes).await;
                            });
                        }
                        Err(err) => tracing::error!(%err, "control socket accept error"),
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

fn pid_file_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// Drive one client connection: decode requests from `reader`, dispatch each
/// to the scheduler, and drain an outbound channel into `writer` for as long
/// as the connection or any job it started is alive.
async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    controller: ControllerHandle,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client_tx, client_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
    let writer_task = tokio::spawn(writer_task(writer, client_rx, max_frame_bytes));

    let mut framed = FramedRead::new(reader, FrameCodec::new(max_frame_bytes));
    let mut submitted_jobs: Vec<String> = Vec::new();

    loop {
        match framed.next().await {
            Some(Ok(frame)) => {
                if let Some(job_id) = dispatch_request(frame, &controller, &client_tx).await {
                    submitted_jobs.push(job_id);
                }
            }
            Some(Err(err)) => {
                tracing::warn!(%err, "frame decode error on client connection, closing");
                break;
            }
            None => break,
        }
    }

    for job_id in submitted_jobs {
        let _ = controller.cancel(job_id).await;
    }
    drop(client_tx);
    let _ = writer_task.await;
}

async fn writer_task<W>(writer: W, mut rx: mpsc::Receiver<Frame>, max_frame_bytes: usize)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = FramedWrite::new(writer, FrameCodec::new(max_frame_bytes));
    while let Some(frame) = rx.recv().await {
        if let Err(err) = framed.send(frame).await {
            tracing::debug!(%err, "client write failed, closing connection");
            break;
        }
    }
}

/// Translate one decoded client frame into a scheduler action. Returns the
/// job id if this request started a job this connection now owns (so it can
/// be cancelled if the connection drops before `exit`/`error`).
async fn dispatch_request(
    frame: Frame,
    controller: &ControllerHandle,
    client_tx: &mpsc::Sender<Frame>,
) -> Option<String> {
    match frame.kind {
        FrameType::SubmitJob => {
            let job = match job_from_submit_payload(&frame) {
                Ok(job) => job,
                Err(err) => {
                    let _ = client_tx.send(Frame::error_reply(frame.id, err.to_string())).await;
                    return None;
                }
            };
            let job_id = job.id.clone();
            submit(controller, job, client_tx, &job_id).await
        }
        FrameType::Exec => {
            let job = match exec_job_from_payload(&frame, frame.id.clone(), false) {
                Ok(job) => job,
                Err(err) => {
                    let _ = client_tx.send(Frame::error_reply(frame.id, err.to_string())).await;
                    return None;
                }
            };
            let job_id = job.id.clone();
            submit(controller, job, client_tx, &job_id).await
        }
        FrameType::Shell => {
            let target_vm = frame
                .payload
                .as_ref()
                .and_then(|p| p.get("target_vm"))
                .and_then(|v| v.as_u64())
                .map(WorkerId);
            let mut job = Job::new(frame.id.clone(), JobKind::Shell);
            job.tty = true;
            job.target_vm = target_vm;
            let job_id = job.id.clone();
            submit(controller, job, client_tx, &job_id).await
        }
        FrameType::Stdin => {
            if let (Some(job_id), Some(data)) = (frame.ref_, frame.data) {
                let _ = controller.stdin(job_id, data).await;
            }
            None
        }
        FrameType::Resize => {
            if let Some(job_id) = frame.ref_ {
                let (rows, cols) = frame
                    .payload
                    .as_ref()
                    .map(|p| {
                        (
                            p.get("rows").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
                            p.get("cols").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
                        )
                    })
                    .unwrap_or((0, 0));
                let _ = controller.resize(job_id, rows, cols).await;
            }
            None
        }
        FrameType::Status => {
            match controller.status().await {
                Ok(status) => {
                    let payload = serde_json::to_value(&status).unwrap_or(serde_json::Value::Null);
                    let reply = Frame::new(FrameType::Status, uuid::Uuid::new_v4().to_string())
                        .with_ref(frame.id)
                        .with_payload(payload);
                    let _ = client_tx.send(reply).await;
                }
                Err(err) => {
                    let _ = client_tx.send(Frame::error_reply(frame.id, err.to_string())).await;
                }
            }
            None
        }
        FrameType::Shutdown => {
            let _ = controller.shutdown().await;
            let reply = Frame::exit_reply(frame.id, 0);
            let _ = client_tx.send(reply).await;
            None
        }
        other => {
            let _ = client_tx
                .send(Frame::error_reply(frame.id, format!("unexpected frame type from client: {other:?}")))
                .await;
            None
        }
    }
}

async fn submit(
    controller: &ControllerHandle,
    job: Job,
    client_tx: &mpsc::Sender<Frame>,
    job_id: &str,
) -> Option<String> {
    match controller.submit_job(job, client_tx.clone()).await {
        Ok(()) => Some(job_id.to_string()),
        Err(err) => {
            let _ = client_tx.send(Frame::error_reply(job_id.to_string(), err.to_string())).await;
            None
        }
    }
}

/// Parse a `submit_job` frame's payload: `{id, script_path?, scripts?[],
/// command?[], env{}, tty, timeout_ns}` (§6).
fn job_from_submit_payload(frame: &Frame) -> std::result::Result<Job, String> {
    exec_job_from_payload(frame, frame.id.clone(), true)
}

fn exec_job_from_payload(
    frame: &Frame,
    job_id: String,
    allow_script_fields: bool,
) -> std::result::Result<Job, String> {
    let payload = frame
        .payload
        .as_ref()
        .ok_or_else(|| "missing payload".to_string())?;

    let kind = if allow_script_fields {
        if let Some(scripts) = payload.get("scripts").and_then(|v| v.as_array()) {
            JobKind::BatchRun {
                scripts: scripts
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            }
        } else if let Some(path) = payload.get("script_path").and_then(|v| v.as_str()) {
            JobKind::ScriptRun { script_path: path.to_string() }
        } else if let Some(command) = payload.get("command").and_then(|v| v.as_array()) {
            JobKind::Exec {
                command: command.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            }
        } else {
            return Err("submit_job payload must set one of script_path, scripts, command".to_string());
        }
    } else {
        let command = payload
            .get("command")
            .and_then(|v| v.as_array())
            .ok_or_else(|| "exec payload missing command".to_string())?;
        JobKind::Exec {
            command: command.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        }
    };

    let mut job = Job::new(job_id, kind);
    if let Some(env) = payload.get("env").and_then(|v| v.as_object()) {
        for (k, v) in env {
            if let Some(s) = v.as_str() {
                job.env.insert(k.clone(), s.to_string());
            }
        }
    }
    job.tty = payload.get("tty").and_then(|v| v.as_bool()).unwrap_or(false);
    if let Some(ns) = payload.get("timeout_ns").and_then(|v| v.as_u64()) {
        job.timeout = Some(std::time::Duration::from_nanos(ns));
    }
    if let Some(target) = payload.get("target_vm").and_then(|v| v.as_u64()) {
        job.target_vm = Some(WorkerId(target));
    }
    Ok(job)
}
