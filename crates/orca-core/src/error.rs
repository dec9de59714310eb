use std::path::PathBuf;

use crate::job::JobId;
use crate::worker::WorkerId;

/// Errors surfaced by the control plane.
///
/// Each variant maps to one of the error categories in the orchestrator's
/// error-handling design: client-input errors are reported back on the
/// originating job's channel, transient infrastructure errors are logged and
/// retried by the caller, worker death is synthesized into a frame on every
/// route the worker owned, and invariant violations are fatal.
#[derive(Debug, thiserror::Error)]
pub enum OrcaError {
    /// A client sent a malformed frame, an unknown message type, or referenced
    /// a VM that doesn't exist.
    #[error("{0}")]
    ClientInput(String),

    /// Dialing a worker's control socket failed or timed out.
    #[error("worker {worker_id} dial failed: {source}")]
    WorkerDial {
        worker_id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    /// A frame on a worker or client connection failed to decode; the
    /// connection it arrived on is unrecoverable and must be closed.
    #[error("frame decode error on {context}: {source}")]
    FrameDecode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// A frame exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds the {limit} byte cap")]
    FrameTooLarge { size: usize, limit: usize },

    /// The worker executing a job died before the job finished.
    #[error("worker {worker_id} disconnected while running job {job_id}")]
    WorkerDied { worker_id: WorkerId, job_id: JobId },

    /// A controller invariant was violated — a route was double-registered,
    /// the worker table exceeded MaxSize, or similar. These are treated as
    /// fatal: better to fail fast than let the table silently corrupt.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Failure to bind or remove the control socket / PID file.
    #[error("control socket error at {path}: {source}")]
    ControlSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O failure not covered by a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrcaError>;
