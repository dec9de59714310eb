//! Pool configuration and the advisory default-sizing formula (§0.3, §4.4).

use std::path::PathBuf;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;

/// Tunables for one pool. Everything here has a spec-mandated default;
/// `orca-server`'s CLI only exposes the handful explicitly called out in
/// §0.5.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory under which per-worker control sockets and VM state live.
    pub pool_dir: PathBuf,
    /// Path of the control socket clients connect to.
    pub control_socket_path: PathBuf,
    /// Workers kept running even when idle.
    pub warm_size: u32,
    /// Hard ceiling on concurrently running workers.
    pub max_size: u32,
    /// Upper bound on a single JSON frame, in bytes.
    pub max_frame_bytes: usize,
    /// How long the scheduler waits for a heartbeat before marking a worker
    /// `stale` (§4.8).
    pub heartbeat_timeout: Duration,
    /// How long a `stale` worker may remain without a heartbeat before it is
    /// closed and replaced (§4.8).
    pub stale_grace_period: Duration,
    /// How often the scheduler polls the job queue against idle workers.
    pub dispatch_poll_interval: Duration,
    /// Cadence of the periodic pool-state log line.
    pub status_log_interval: Duration,
    /// How long a worker may sit idle above `warm_size` before being shrunk
    /// away (§4.4, §9 Open Question — adopted as-is).
    pub shrink_grace_period: Duration,
    /// Ceiling on how long the agent-connect loop will keep dialing a
    /// freshly launched VM's socket before giving up.
    pub agent_connect_timeout: Duration,
    /// Interval between dial attempts within `agent_connect_timeout`.
    pub agent_dial_interval: Duration,
    /// Opaque directory forwarded into every job's environment as
    /// `ORCA_ARTIFACT_DIR` (§6 "Environment observed"), sourced from this
    /// process's own environment at startup.
    pub artifact_dir: Option<String>,
}

impl PoolConfig {
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_STALE_GRACE_PERIOD: Duration = Duration::from_secs(30);
    pub const DEFAULT_DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
    pub const DEFAULT_STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_SHRINK_GRACE_PERIOD: Duration = Duration::from_secs(30);
    pub const DEFAULT_AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_AGENT_DIAL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(pool_dir: PathBuf, control_socket_path: PathBuf, warm_size: u32, max_size: u32) -> Self {
        Self {
            pool_dir,
            control_socket_path,
            warm_size,
            max_size: max_size.max(warm_size),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            heartbeat_timeout: Self::DEFAULT_HEARTBEAT_TIMEOUT,
            stale_grace_period: Self::DEFAULT_STALE_GRACE_PERIOD,
            dispatch_poll_interval: Self::DEFAULT_DISPATCH_POLL_INTERVAL,
            status_log_interval: Self::DEFAULT_STATUS_LOG_INTERVAL,
            shrink_grace_period: Self::DEFAULT_SHRINK_GRACE_PERIOD,
            agent_connect_timeout: Self::DEFAULT_AGENT_CONNECT_TIMEOUT,
            agent_dial_interval: Self::DEFAULT_AGENT_DIAL_INTERVAL,
            artifact_dir: std::env::var("ORCA_ARTIFACT_DIR").ok(),
        }
    }

    /// The worker socket path for a given id, e.g.
    /// `<pool_dir>/workers/7.sock`.
    pub fn worker_socket_path(&self, id: crate::worker::WorkerId) -> PathBuf {
        self.pool_dir.join("workers").join(format!("{id}.sock"))
    }

    /// Advisory WarmSize/MaxSize derived from host CPU count and free
    /// memory, per §4.4: `MaxSize = min(N, floor((M - 2048) / 350), 16)`,
    /// `WarmSize = max(2, MaxSize / 2)`, where N is logical CPUs and M is
    /// free memory in MiB. Used only as a default when the caller did not
    /// supply explicit values.
    pub fn advisory_sizing() -> (u32, u32) {
        use sysinfo::System;

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let mut sys = System::new();
        sys.refresh_memory();
        let free_mem_mb = (sys.available_memory() / (1024 * 1024)) as i64;

        let mem_capped = ((free_mem_mb - 2048) / 350).max(0) as u32;
        let max_size = cpus.min(mem_capped).min(16).max(1);
        let warm_size = (max_size / 2).max(2.min(max_size));
        (warm_size, max_size)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let (warm_size, max_size) = Self::advisory_sizing();
        Self::new(
            PathBuf::from("/tmp/orca-pool"),
            PathBuf::from("/tmp/orca-pool/control.sock"),
            warm_size,
            max_size,
        )
    }
}
