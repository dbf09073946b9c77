//! Session/Job Registry: job id to live supervisor.
//!
//! Every started job gets a supervisor task plus a watcher task that awaits
//! the supervisor's final snapshot and moves the job from the live table to
//! a bounded history of finished jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collab::StoreError;
use crate::error::{FarmError, Result};
use crate::supervisor::{JobContext, JobSnapshot, JobStatus, Supervisor, SupervisorHandle};

#[derive(Debug)]
struct JobEntry {
    handle: SupervisorHandle,
}

#[derive(Debug, Default)]
struct RegistryState {
    live: HashMap<Uuid, JobEntry>,
    finished: HashMap<Uuid, JobSnapshot>,
    /// Finish order, oldest first.
    finished_order: VecDeque<Uuid>,
}

#[derive(Clone)]
pub struct JobRegistry {
    ctx: JobContext,
    shutdown: CancellationToken,
    state: Arc<RwLock<RegistryState>>,
}

impl JobRegistry {
    /// Supervisors are cancelled along with `shutdown`.
    pub fn new(ctx: JobContext, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            shutdown,
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// Create the job record, spawn its supervisor and return the new id.
    pub async fn start_job(&self, customer_id: &str, object_id: &str) -> Result<Uuid> {
        if customer_id.trim().is_empty() {
            return Err(FarmError::InvalidJob("customer_id is empty".to_string()));
        }
        if object_id.trim().is_empty() {
            return Err(FarmError::InvalidJob("object_id is empty".to_string()));
        }

        let job_id = Uuid::new_v4();
        self.ctx
            .documents
            .create_job_record(job_id, customer_id, object_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(what) => FarmError::InvalidJob(format!("unknown {what}")),
                other => FarmError::Store(other),
            })?;

        let (supervisor, handle) =
            Supervisor::new(job_id, customer_id, object_id, self.ctx.clone()).await?;

        self.state
            .write()
            .await
            .live
            .insert(job_id, JobEntry {
                handle: handle.clone(),
            });

        let task = tokio::spawn(supervisor.run(self.shutdown.child_token()));
        let registry = self.clone();
        tokio::spawn(async move {
            let final_snapshot = match task.await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Supervisor task aborted");
                    let mut snapshot = handle.snapshot();
                    snapshot.status = JobStatus::Failed;
                    snapshot.error = Some(format!("supervisor aborted: {e}"));
                    snapshot
                }
            };
            registry.retire(job_id, final_snapshot).await;
        });

        tracing::info!(job_id = %job_id, customer_id, object_id, "Job started");
        Ok(job_id)
    }

    /// Move a job from the live table into history. A job already removed
    /// by [`JobRegistry::stop_and_delete`] is not recorded.
    async fn retire(&self, job_id: Uuid, snapshot: JobSnapshot) {
        let mut state = self.state.write().await;
        if state.live.remove(&job_id).is_none() {
            return;
        }
        tracing::info!(job_id = %job_id, status = %snapshot.status, "Job retired");

        let limit = self.ctx.scheduling.finished_history;
        if limit == 0 {
            return;
        }
        state.finished.insert(job_id, snapshot);
        state.finished_order.push_back(job_id);
        while state.finished_order.len() > limit {
            if let Some(oldest) = state.finished_order.pop_front() {
                state.finished.remove(&oldest);
            }
        }
    }

    /// Latest snapshot of a live job, or the retained final snapshot of a
    /// finished one.
    pub async fn status(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let state = self.state.read().await;
        if let Some(entry) = state.live.get(&job_id) {
            return Ok(entry.handle.snapshot());
        }
        state
            .finished
            .get(&job_id)
            .cloned()
            .ok_or(FarmError::JobNotFound(job_id))
    }

    /// Stop a live job, wait for its final snapshot and forget it. A finished
    /// job is simply dropped from history.
    pub async fn stop_and_delete(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let handle = {
            let mut state = self.state.write().await;
            match state.live.remove(&job_id) {
                Some(entry) => entry.handle,
                None => {
                    state.finished_order.retain(|id| *id != job_id);
                    return state
                        .finished
                        .remove(&job_id)
                        .ok_or(FarmError::JobNotFound(job_id));
                }
            }
        };

        let snapshot = match handle.stop().await {
            Ok(snapshot) => snapshot,
            // Finished on its own between the lookup and the stop.
            Err(FarmError::ActorGone(_)) => handle.snapshot(),
            Err(e) => return Err(e),
        };
        tracing::info!(job_id = %job_id, status = %snapshot.status, "Job stopped and deleted");
        Ok(snapshot)
    }

    pub async fn set_desired_workers(&self, job_id: Uuid, count: usize) -> Result<JobSnapshot> {
        if count == 0 {
            return Err(FarmError::InvalidWorkerCount(count));
        }
        let handle = {
            let state = self.state.read().await;
            match state.live.get(&job_id) {
                Some(entry) => entry.handle.clone(),
                None if state.finished.contains_key(&job_id) => {
                    return Err(FarmError::InvalidJob(format!("job {job_id} has finished")));
                }
                None => return Err(FarmError::JobNotFound(job_id)),
            }
        };
        handle.set_desired_workers(count).await
    }

    /// Live jobs first, newest finished jobs after.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let state = self.state.read().await;
        let mut live: Vec<JobSnapshot> = state
            .live
            .values()
            .map(|entry| entry.handle.snapshot())
            .collect();
        live.sort_by_key(|s| s.created_at);

        let finished = state
            .finished_order
            .iter()
            .rev()
            .filter_map(|id| state.finished.get(id).cloned());
        live.extend(finished);
        live
    }

    pub async fn jobs_for_customer(&self, customer_id: &str) -> Vec<JobSnapshot> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.customer_id == customer_id)
            .collect()
    }

    pub async fn is_live(&self, job_id: Uuid) -> bool {
        self.state.read().await.live.contains_key(&job_id)
    }

    pub async fn live_count(&self) -> usize {
        self.state.read().await.live.len()
    }

    /// Stop every live job and wait for each to report back.
    pub async fn shutdown(&self) {
        let handles: Vec<SupervisorHandle> = self
            .state
            .read()
            .await
            .live
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        tracing::info!(jobs = handles.len(), "Stopping all jobs");
        for handle in handles {
            if let Err(e) = handle.stop().await {
                tracing::debug!(job_id = %handle.job_id(), error = %e, "Job already finished");
            }
        }
    }
}
