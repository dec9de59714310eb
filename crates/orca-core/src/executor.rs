//! Job Executor (C5, §4.5): translates a dispatched job into the worker wire
//! protocol, drives it to completion, and derives TAP progress along the
//! way. One task per active job.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::api::ControllerEvent;
use crate::frame::{Frame, FrameType};
use crate::job::{Job, JobKind};
use crate::router::Router;
use crate::tap::TapParser;
use crate::worker::{JobHistoryEntry, WorkerId, WorkerSender};

/// A job waiting to be (or having been) handed a worker, paired with the
/// client connection that must receive its frames.
pub(crate) struct QueuedJob {
    pub(crate) job: Job,
    pub(crate) client_tx: mpsc::Sender<Frame>,
}

/// Reported back to the scheduler when a job's executor task ends, so the
/// worker can be released (§4.4 "Release").
pub(crate) struct JobDone {
    pub(crate) worker_id: WorkerId,
    pub(crate) entry: JobHistoryEntry,
}

fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Build the shell command a BatchRun job synthesizes: a TAP 14 envelope
/// around each child script, run in sequence inside one worker (§4.5).
pub(crate) fn synthesize_batch_script(scripts: &[String]) -> String {
    let mut out = String::new();
    out.push_str("set -u\n");
    out.push_str("failed=0\n");
    out.push_str("echo 'TAP version 14'\n");
    out.push_str(&format!("echo '1..{}'\n", scripts.len()));
    for (i, path) in scripts.iter().enumerate() {
        let n = i + 1;
        let quoted = shell_single_quote(path);
        out.push_str(&format!("echo '# Subtest: {path}'\n"));
        out.push_str(&format!("/bin/sh {quoted}\n"));
        out.push_str("rc=$?\n");
        out.push_str(&format!(
            "if [ \"$rc\" -eq 0 ]; then echo 'ok {n} - {path}'; else echo 'not ok {n} - {path}'; failed=$((failed+1)); fi\n"
        ));
    }
    out.push_str("if [ \"$failed\" -eq 0 ]; then exit 0; else exit 1; fi\n");
    out
}

/// The outgoing `exec` payload plus the expected-children list the TAP
/// parser needs for subtest matching (empty outside BatchRun).
fn build_exec_payload(job: &Job) -> (serde_json::Value, Vec<String>, Option<Duration>) {
    match &job.kind {
        JobKind::ScriptRun { script_path } => (
            json!({
                "command": ["/bin/sh", script_path],
                "env": job.env,
                "tty": job.tty,
            }),
            Vec::new(),
            job.timeout,
        ),
        JobKind::Exec { command } => (
            json!({
                "command": command,
                "env": job.env,
                "tty": job.tty,
            }),
            Vec::new(),
            job.timeout,
        ),
        JobKind::Shell => (
            json!({
                "command": ["/bin/sh"],
                "env": job.env,
                "tty": true,
            }),
            Vec::new(),
            None,
        ),
        JobKind::BatchRun { scripts } => {
            let script = synthesize_batch_script(scripts);
            let envelope = job.timeout.map(|per_child| {
                per_child
                    .saturating_mul(scripts.len() as u32)
                    .saturating_add(Job::BATCH_TIMEOUT_ENVELOPE)
            });
            (
                json!({
                    "command": ["/bin/sh", "-c", script],
                    "env": job.env,
                    "tty": job.tty,
                }),
                scripts.clone(),
                envelope,
            )
        }
    }
}

/// Drive one dispatched job to completion, returning what the scheduler
/// needs to release the worker. Spawned by the scheduler immediately after a
/// worker is claimed for `queued.job`.
pub(crate) async fn run_and_report(
    queued: QueuedJob,
    worker_id: WorkerId,
    worker_sender: WorkerSender,
    router: std::sync::Arc<Router>,
    events: broadcast::Sender<ControllerEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
    artifact_dir: Option<String>,
) -> JobDone {
    let QueuedJob { mut job, client_tx } = queued;
    job.env = env_with_artifact_dir(job.env, artifact_dir.as_deref());
    let job_id = job.id.clone();
    let label = job.kind.label().to_string();
    let (mut payload, expected_children, timeout) = build_exec_payload(&job);
    if let Some(timeout) = timeout {
        payload["timeout_secs"] = json!(timeout.as_secs());
    }

    let (tap_tx, mut tap_rx) = mpsc::unbounded_channel::<Frame>();
    if let Err(err) = router.register(job_id.clone(), client_tx.clone(), tap_tx).await {
        tracing::error!(%job_id, %err, "failed to register route");
        return JobDone { worker_id, entry: finished_entry(&job_id, &label, None) };
    }
    router.attach_worker(job_id.clone(), worker_id).await;
    let _ = events.send(ControllerEvent::JobDispatched { job_id: job_id.clone(), worker_id });

    let exec_frame = Frame::new(FrameType::Exec, job_id.clone()).with_payload(payload);
    if let Err(err) = worker_sender.send(exec_frame).await {
        tracing::warn!(%job_id, %worker_id, %err, "failed to dispatch exec to worker");
        let _ = client_tx
            .send(Frame::error_reply(job_id.clone(), err.to_string()))
            .await;
        router.remove(job_id.clone()).await;
        return JobDone { worker_id, entry: finished_entry(&job_id, &label, None) };
    }

    // §5's safety net on top of the agent's own timeout enforcement: if the
    // agent never answers at all, the route would otherwise sit open forever.
    let safety_deadline = timeout.map(|t| tokio::time::Instant::now() + t + Duration::from_secs(30));

    let mut tap = TapParser::new(expected_children);
    let exit_code;
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                tracing::info!(%job_id, %worker_id, "client disconnected, terminating job");
                let _ = worker_sender
                    .send(Frame::error_reply(job_id.clone(), "client disconnected"))
                    .await;
                router.remove(job_id.clone()).await;
                exit_code = None;
                break;
            }
            _ = wait_for_deadline(safety_deadline) => {
                tracing::warn!(%job_id, %worker_id, "job exceeded timeout safety net, force-closing route");
                let _ = client_tx.send(Frame::exit_reply(job_id.clone(), 124)).await;
                let _ = worker_sender
                    .send(Frame::error_reply(job_id.clone(), "timeout safety net expired"))
                    .await;
                router.remove(job_id.clone()).await;
                exit_code = Some(124);
                break;
            }
            frame = tap_rx.recv() => {
                let Some(frame) = frame else {
                    exit_code = None;
                    break;
                };
                match frame.kind {
                    FrameType::Stdout | FrameType::Stderr => {
                        if let Some(data) = &frame.data {
                            let tap_events = tap.feed(data);
                            for event in tap_events {
                                let _ = events.send(ControllerEvent::TapProgress {
                                    job_id: job_id.clone(),
                                    event,
                                });
                            }
                        }
                    }
                    FrameType::Exit => {
                        exit_code = frame.exit_code;
                        break;
                    }
                    FrameType::Error => {
                        exit_code = Some(-1);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let report = exit_code.map(|code| tap.finalize(code));
    let _ = events.send(ControllerEvent::JobFinished {
        job_id: job_id.clone(),
        worker_id,
        exit_code,
        report: report.clone(),
    });

    JobDone {
        worker_id,
        entry: finished_entry(&job_id, &label, exit_code),
    }
}

/// Resolves at `deadline`, or never if there is none — lets the safety-net
/// branch sit in a `select!` alongside branches that are always armed.
async fn wait_for_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn finished_entry(job_id: &str, label: &str, exit_code: Option<i32>) -> JobHistoryEntry {
    JobHistoryEntry {
        job_id: job_id.to_string(),
        label: label.to_string(),
        exit_code,
        finished_at_unix_ms: chrono::Utc::now().timestamp_millis(),
    }
}

/// Merge `ORCA_ARTIFACT_DIR` into a job's environment if the pool was
/// configured with one and the job didn't already set its own (§6).
fn env_with_artifact_dir(mut env: HashMap<String, String>, artifact_dir: Option<&str>) -> HashMap<String, String> {
    if let Some(dir) = artifact_dir {
        env.entry("ORCA_ARTIFACT_DIR".to_string()).or_insert_with(|| dir.to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_script_wraps_each_child_in_tap_envelope() {
        let script = synthesize_batch_script(&["a.sh".to_string(), "b.sh".to_string()]);
        assert!(script.contains("echo '1..2'"));
        assert!(script.contains("# Subtest: a.sh"));
        assert!(script.contains("# Subtest: b.sh"));
        assert!(script.contains("if [ \"$failed\" -eq 0 ]; then exit 0; else exit 1; fi"));
    }

    #[test]
    fn shell_single_quote_escapes_embedded_quotes() {
        assert_eq!(shell_single_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn script_run_payload_wraps_in_sh() {
        let job = Job::new(JobKind::ScriptRun { script_path: "t/a.sh".to_string() });
        let (payload, children, _timeout) = build_exec_payload(&job);
        assert_eq!(payload["command"][0], "/bin/sh");
        assert_eq!(payload["command"][1], "t/a.sh");
        assert!(children.is_empty());
    }

    #[test]
    fn artifact_dir_is_merged_without_overriding_an_explicit_value() {
        let env = env_with_artifact_dir(HashMap::new(), Some("/tmp/artifacts"));
        assert_eq!(env.get("ORCA_ARTIFACT_DIR"), Some(&"/tmp/artifacts".to_string()));

        let mut preset = HashMap::new();
        preset.insert("ORCA_ARTIFACT_DIR".to_string(), "/custom".to_string());
        let env = env_with_artifact_dir(preset, Some("/tmp/artifacts"));
        assert_eq!(env.get("ORCA_ARTIFACT_DIR"), Some(&"/custom".to_string()));

        let env = env_with_artifact_dir(HashMap::new(), None);
        assert!(env.get("ORCA_ARTIFACT_DIR").is_none());
    }

    #[test]
    fn batch_run_envelope_sums_per_child_timeout_plus_grace() {
        let mut job = Job::new(JobKind::BatchRun {
            scripts: vec!["a.sh".into(), "b.sh".into(), "c.sh".into()],
        });
        job.timeout = Some(Duration::from_secs(5));
        let (_payload, _children, timeout) = build_exec_payload(&job);
        assert_eq!(timeout, Some(Duration::from_secs(5 * 3 + 30)));
    }
}
