//! Health & Stats (C8, §4.8): read-only snapshots consumed by the `status`
//! request. Per-worker counters are derived from the worker table; the
//! global counters (pool size, queued jobs) are owned by the scheduler.

use serde::Serialize;

use crate::worker::{JobHistoryEntry, WorkerHandle, WorkerId, WorkerStatus};

/// One worker's row in a `status` response (§6 "status response").
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusView {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub busy: bool,
    pub active_jobs: u32,
    pub free_mem_mb: Option<u64>,
    pub load_avg: Option<f64>,
    pub last_health_age_secs: Option<u64>,
    pub last_job: Option<String>,
    pub job_history: Vec<JobHistoryEntry>,
}

impl From<&WorkerHandle> for WorkerStatusView {
    fn from(handle: &WorkerHandle) -> Self {
        Self {
            id: handle.id,
            status: handle.status,
            busy: handle.is_busy(),
            active_jobs: handle.active_jobs,
            free_mem_mb: handle.free_mem_mb,
            load_avg: handle.load_avg,
            last_health_age_secs: handle.last_heartbeat.map(|t| t.elapsed().as_secs()),
            last_job: handle.last_job.clone(),
            job_history: handle.job_history.iter().cloned().collect(),
        }
    }
}

/// Full pool snapshot (§6 "status response").
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub vms: Vec<WorkerStatusView>,
    pub warm_size: u32,
    pub max_size: u32,
    pub queued_jobs: usize,
}
