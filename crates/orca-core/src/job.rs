use std::collections::HashMap;
use std::time::Duration;

use crate::worker::WorkerId;

/// Job identifier. Client-supplied on `submit_job`/`exec`/`shell` (the
/// frame's own `id`) and used verbatim as the `ref` on every frame that
/// follows — see the Route invariant in §3: a given job id has at most one
/// route at a time, so callers are responsible for uniqueness.
pub type JobId = String;

/// What kind of work a job represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Run a single script: `["/bin/sh", script_path]`.
    ScriptRun { script_path: String },
    /// Run an ordered list of scripts inside one worker, sequentially, with a
    /// synthesized TAP 14 envelope wrapping the batch.
    BatchRun { scripts: Vec<String> },
    /// Run a verbatim command.
    Exec { command: Vec<String> },
    /// Equivalent to `Exec(["/bin/sh"], tty=true)`.
    Shell,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::ScriptRun { .. } => "script_run",
            JobKind::BatchRun { .. } => "batch_run",
            JobKind::Exec { .. } => "exec",
            JobKind::Shell => "shell",
        }
    }
}

/// A unit of work submitted by a client.
///
/// Created by a client request; mutated only by the executor (attaches
/// worker id, start time, exit code); destroyed after its final message has
/// been forwarded.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub tty: bool,
    /// If set, this job must run on (or attach to) this specific worker,
    /// bypassing the normal idle-worker search (see Pool Scheduler §4.4.1).
    pub target_vm: Option<WorkerId>,
}

impl Job {
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
            env: HashMap::new(),
            timeout: None,
            tty: false,
            target_vm: None,
        }
    }

    /// The BatchRun timeout envelope: sum of per-child timeouts plus 30s, per
    /// §4.5. Callers are expected to have already summed child timeouts into
    /// `self.timeout` before calling `start`; this helper exists for the
    /// executor to apply the envelope exactly once.
    pub const BATCH_TIMEOUT_ENVELOPE: Duration = Duration::from_secs(30);
}
