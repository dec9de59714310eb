//! Shared end-to-end test harness: a fake in-guest agent that actually runs
//! the commands it's told to `exec` on the host (no hypervisor involved —
//! §1 scopes VM launch out of the core, and the wire contract is all the
//! agent side of these tests needs to honor).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use orca_core::{Frame, FrameCodec, FrameType, PoolConfig, WorkerId};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, FramedWrite};

/// A `VmLauncher` that spawns a `FakeAgent` listening at a fresh socket path
/// under `dir` for every worker id the scheduler asks for.
pub struct FakeVmLauncher {
    dir: PathBuf,
}

impl FakeVmLauncher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl orca_core::VmLauncher for FakeVmLauncher {
    fn launch(&self, id: WorkerId) -> std::io::Result<PathBuf> {
        let socket_path = self.dir.join(format!("{id}.sock"));
        let path_for_task = socket_path.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_one_worker(&path_for_task).await {
                tracing::debug!(%err, "fake agent exited");
            }
        });
        Ok(socket_path)
    }
}

/// Binds `socket_path` and serves exactly one connection — one worker's
/// lifetime — acting as the in-guest agent: runs whatever `exec` sends it,
/// emits heartbeats, streams stdout/stderr/exit back.
async fn serve_one_worker(socket_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(socket_path).await;
    let listener = UnixListener::bind(socket_path)?;
    let (stream, _addr) = listener.accept().await?;
    handle_worker_connection(stream).await;
    Ok(())
}

async fn handle_worker_connection(stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, FrameCodec::default());
        while let Some(frame) = frame_rx.recv().await {
            if framed.send(frame).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = frame_tx.clone();
    let heartbeats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(30));
        loop {
            interval.tick().await;
            let frame = Frame::new(FrameType::Heartbeat, "hb")
                .with_payload(serde_json::json!({"free_mem_mb": 4096, "load_avg": 0.1}));
            if heartbeat_tx.send(frame).is_err() {
                break;
            }
        }
    });

    let mut framed = FramedRead::new(read_half, FrameCodec::default());
    while let Some(Ok(frame)) = framed.next().await {
        if frame.kind == FrameType::Exec {
            let job_ref = frame.id.clone();
            let tx = frame_tx.clone();
            tokio::spawn(run_exec(frame, job_ref, tx));
        } else if frame.kind == FrameType::Error {
            // The executor's cancellation-path terminate request; nothing to
            // clean up for a real subprocess we no longer track here.
        }
    }

    heartbeats.abort();
    drop(frame_tx);
    let _ = writer.await;
}

async fn run_exec(frame: Frame, job_ref: String, tx: tokio::sync::mpsc::UnboundedSender<Frame>) {
    let Some(payload) = frame.payload else { return };
    let command: Vec<String> = payload
        .get("command")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if command.is_empty() {
        return;
    }
    let timeout_secs = payload.get("timeout_secs").and_then(|v| v.as_u64());

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let _ = tx.send(
                Frame::new(FrameType::Error, uuid::Uuid::new_v4().to_string())
                    .with_ref(job_ref)
                    .with_error(err.to_string())
                    .with_exit_code(-1),
            );
            return;
        }
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let stdout_tx = tx.clone();
    let stdout_ref = job_ref.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(mut out) = stdout.take() {
            pump(&mut out, &stdout_tx, &stdout_ref, FrameType::Stdout).await;
        }
    });
    let stderr_tx = tx.clone();
    let stderr_ref = job_ref.clone();
    let stderr_task = tokio::spawn(async move {
        if let Some(mut err) = stderr.take() {
            pump(&mut err, &stderr_tx, &stderr_ref, FrameType::Stderr).await;
        }
    });

    let wait = child.wait();
    let exit_code = match timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), wait).await {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            Ok(Err(_)) => -1,
            Err(_) => {
                let _ = child.kill().await;
                124
            }
        },
        None => match wait.await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        },
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let _ = tx.send(Frame::exit_reply(job_ref, exit_code));
}

async fn pump<R>(reader: &mut R, tx: &tokio::sync::mpsc::UnboundedSender<Frame>, job_ref: &str, kind: FrameType)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::new(kind, uuid::Uuid::new_v4().to_string())
                    .with_ref(job_ref.to_string())
                    .with_data(buf[..n].to_vec());
                if tx.send(frame).is_err() {
                    break;
                }
            }
        }
    }
}

/// A `PoolConfig` with every timing scaled down so tests finish in tens of
/// milliseconds instead of the production 60s/30s/10s defaults — real wall
/// time, just a lot less of it (`tokio::time::pause()` doesn't mix with
/// real child processes and real socket I/O, so this repo doesn't use it).
pub fn test_pool_config(dir: &Path, warm_size: u32, max_size: u32) -> PoolConfig {
    let mut cfg = PoolConfig::new(
        dir.join("pool"),
        dir.join("control.sock"),
        warm_size,
        max_size,
    );
    cfg.heartbeat_timeout = Duration::from_millis(300);
    cfg.stale_grace_period = Duration::from_millis(150);
    cfg.dispatch_poll_interval = Duration::from_millis(20);
    cfg.status_log_interval = Duration::from_secs(60);
    cfg.shrink_grace_period = Duration::from_millis(150);
    cfg.agent_connect_timeout = Duration::from_secs(5);
    cfg.agent_dial_interval = Duration::from_millis(10);
    cfg.artifact_dir = None;
    cfg
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// A short unique-enough job id for tests that don't care about a specific
/// id string.
pub fn next_job_id(prefix: &str) -> String {
    format!("{prefix}-{}", JOB_SEQ.fetch_add(1, Ordering::Relaxed))
}

pub fn launcher(dir: &Path) -> Arc<FakeVmLauncher> {
    Arc::new(FakeVmLauncher::new(dir.join("workers")))
}

/// Drain `rx` until a frame of type `exit` or `error` arrives, returning
/// every frame seen including the terminal one.
pub async fn collect_until_terminal(rx: &mut tokio::sync::mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Some(frame) = rx.recv().await {
        let terminal = matches!(frame.kind, FrameType::Exit | FrameType::Error);
        out.push(frame);
        if terminal {
            break;
        }
    }
    out
}

pub fn stdout_text(frames: &[Frame]) -> String {
    let mut s = String::new();
    for f in frames {
        if f.kind == FrameType::Stdout {
            if let Some(data) = &f.data {
                s.push_str(&String::from_utf8_lossy(data));
            }
        }
    }
    s
}
