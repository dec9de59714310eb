#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Control-plane library for Orca: the VM pool scheduler, the framed
//! multiplexing protocol, the TAP 14 parser, and the control server that
//! exposes them over a local socket. `orca-server` is a thin binary wrapper
//! around this crate; anything else (a TUI, a test harness) can embed it the
//! same way.

pub mod api;
pub mod config;
pub mod error;
pub mod frame;
pub mod health;
pub mod job;
pub mod server;
pub mod tap;
pub mod worker;

mod executor;
mod router;
mod scheduler;

pub use api::{start_controller, ControllerConfig, ControllerEvent, ControllerHandle};
pub use config::PoolConfig;
pub use error::{OrcaError, Result};
pub use frame::{Frame, FrameCodec, FrameType};
pub use health::{PoolStatus, WorkerStatusView};
pub use job::{Job, JobId, JobKind};
pub use server::ControlServer;
pub use tap::{TapEvent, TapReport};
pub use worker::{VmLauncher, WorkerId, WorkerStatus};
