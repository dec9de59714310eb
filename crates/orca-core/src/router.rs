//! Router (C3): maps in-flight job ids to where their frames should go next.
//!
//! A route is registered when a job starts and removed when it finishes (exit
//! or error forwarded). The table is behind a single `tokio::sync::Mutex`;
//! critical sections are lookup-only — the actual socket write happens after
//! the lock is dropped, so one slow client can never block routing for
//! everyone else.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

use crate::frame::{Frame, FrameType};
use crate::job::JobId;
use crate::worker::WorkerId;

/// Where a job's frames currently flow.
#[derive(Clone)]
pub(crate) struct Route {
    /// The client connection that submitted the job; `Frame`s bound for the
    /// client are pushed here, forwarded verbatim (§9 "Heterogeneous message
    /// bodies carried uniformly").
    pub(crate) client_tx: mpsc::Sender<Frame>,
    /// The job's executor tees the same frames here to derive TAP progress
    /// and to learn when the job is done — the router's `done_signal`.
    pub(crate) tap_tx: mpsc::UnboundedSender<Frame>,
    /// The worker currently executing the job, if dispatched.
    pub(crate) worker_id: Option<WorkerId>,
}

/// Job-id -> Route table (§3 "Route", §4.3).
#[derive(Default)]
pub(crate) struct Router {
    routes: Mutex<HashMap<JobId, Route>>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new route. Returns an invariant violation if `job_id`
    /// already has one — a job has at most one route at a time.
    pub(crate) async fn register(
        &self,
        job_id: JobId,
        client_tx: mpsc::Sender<Frame>,
        tap_tx: mpsc::UnboundedSender<Frame>,
    ) -> Result<(), crate::error::OrcaError> {
        let mut routes = self.routes.lock().await;
        if routes.contains_key(&job_id) {
            return Err(crate::error::OrcaError::Invariant(format!(
                "job {job_id} already has a route"
            )));
        }
        routes.insert(
            job_id,
            Route { client_tx, tap_tx, worker_id: None },
        );
        Ok(())
    }

    pub(crate) async fn attach_worker(&self, job_id: JobId, worker_id: WorkerId) {
        if let Some(route) = self.routes.lock().await.get_mut(&job_id) {
            route.worker_id = Some(worker_id);
        }
    }

    pub(crate) async fn worker_for(&self, job_id: JobId) -> Option<WorkerId> {
        self.routes.lock().await.get(&job_id).and_then(|r| r.worker_id)
    }

    /// Drop a route once a job's final frame (exit or error) has been
    /// forwarded.
    pub(crate) async fn remove(&self, job_id: JobId) {
        self.routes.lock().await.remove(&job_id);
    }

    /// Deliver a frame from a worker to the client that owns its `ref` job
    /// id, and tee it to the owning executor. Frames with no matching route
    /// (e.g. the client already disconnected and the route was torn down)
    /// are dropped with a warning — there is nowhere for them to go.
    pub(crate) async fn deliver(&self, frame: Frame) {
        let Some(job_id) = frame.ref_.clone() else {
            tracing::debug!(kind = ?frame.kind, "dropping frame with no job ref");
            return;
        };
        let route = {
            let routes = self.routes.lock().await;
            routes.get(&job_id).cloned()
        };
        let Some(route) = route else {
            tracing::warn!(%job_id, kind = ?frame.kind, "dropping frame for unknown route");
            return;
        };

        let terminal = matches!(frame.kind, FrameType::Exit | FrameType::Error);
        let _ = route.tap_tx.send(frame.clone());
        if route.client_tx.send(frame).await.is_err() {
            tracing::debug!(%job_id, "client gone while delivering frame");
        }
        if terminal {
            self.remove(job_id).await;
        }
    }

    /// Forward a client-originated frame (stdin, resize) for `job_id` to its
    /// worker. Caller is responsible for looking up the worker handle and
    /// calling `WorkerHandle::send`; this just resolves which worker owns the
    /// job.
    pub(crate) async fn route_for(&self, job_id: JobId) -> Option<Route> {
        self.routes.lock().await.get(&job_id).cloned()
    }

    /// All job ids currently routed to `worker_id`. Used when a worker dies
    /// to find every job that needs a synthesized error frame.
    pub(crate) async fn jobs_on_worker(&self, worker_id: WorkerId) -> Vec<JobId> {
        self.routes
            .lock()
            .await
            .iter()
            .filter(|(_, route)| route.worker_id == Some(worker_id))
            .map(|(job_id, _)| job_id.clone())
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.routes.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_channels() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>, mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>) {
        let (ctx, crx) = mpsc::channel(4);
        let (ttx, trx) = mpsc::unbounded_channel();
        (ctx, crx, ttx, trx)
    }

    #[tokio::test]
    async fn double_register_is_an_invariant_violation() {
        let router = Router::new();
        let (ctx, _crx, ttx, _trx) = route_channels();
        let job_id = "job-1".to_string();
        router.register(job_id.clone(), ctx.clone(), ttx.clone()).await.unwrap();
        assert!(router.register(job_id, ctx, ttx).await.is_err());
    }

    #[tokio::test]
    async fn deliver_routes_to_the_owning_client_and_tees_to_executor() {
        let router = Router::new();
        let (ctx, mut crx, ttx, mut trx) = route_channels();
        let job_id = "job-2".to_string();
        router.register(job_id.clone(), ctx, ttx).await.unwrap();

        let frame = Frame::new(FrameType::Stdout, "f1").with_ref(job_id);
        router.deliver(frame).await;

        assert_eq!(crx.recv().await.unwrap().kind, FrameType::Stdout);
        assert_eq!(trx.recv().await.unwrap().kind, FrameType::Stdout);
        assert_eq!(router.len().await, 1);
    }

    #[tokio::test]
    async fn exit_frame_removes_the_route() {
        let router = Router::new();
        let (ctx, mut crx, ttx, _trx) = route_channels();
        let job_id = "job-3".to_string();
        router.register(job_id.clone(), ctx, ttx).await.unwrap();

        let frame = Frame::exit_reply(job_id, 0);
        router.deliver(frame).await;
        crx.recv().await.unwrap();
        assert_eq!(router.len().await, 0);
    }

    #[tokio::test]
    async fn jobs_on_worker_finds_only_attached_routes() {
        let router = Router::new();
        let (ctx, _crx, ttx, _trx) = route_channels();
        let job_id = "job-4".to_string();
        router.register(job_id.clone(), ctx, ttx).await.unwrap();
        router.attach_worker(job_id.clone(), WorkerId(7)).await;

        let jobs = router.jobs_on_worker(WorkerId(7)).await;
        assert_eq!(jobs, vec![job_id]);
        assert!(router.jobs_on_worker(WorkerId(8)).await.is_empty());
    }
}
