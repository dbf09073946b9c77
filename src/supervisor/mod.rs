//! Job Supervisor.
//!
//! One supervisor actor runs per live job. It loads the job record, asks the
//! broker for workers, splits the remaining frames across whatever workers it
//! holds and re-splits whenever a worker joins, leaves or runs dry. When the
//! last frame arrives it releases its workers and returns its final
//! [`JobSnapshot`] from [`Supervisor::run`], which is what the registry
//! awaits.
//!
//! State transitions:
//!
//! ```text
//! initializing ──workers-assigned──▶ running ──last frame──▶ completed
//!      ▲                                │
//!      └──────── all workers lost ──────┘
//!
//! any ──stop / shutdown──▶ stopped      initializing ──bad record / no workers──▶ failed
//! ```

pub mod backoff;
pub mod job;
pub mod partition;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{
    Envelope, Headers, JobAddress, MessageBus, Subscription, BROKER_EXCHANGE, BROKER_ROUTING_KEY,
    HEADER_JOB_ID, WORKER_EXCHANGE,
};
use crate::collab::{DocumentStore, JobRecord, ObjectStore};
use crate::config::{SchedulingConfig, StorageConfig};
use crate::error::{FarmError, Result};
use crate::protocol::{BrokerMessage, SupervisorMessage, WorkerCommand, WorkerEvent, WorkerId};

pub use job::{JobSnapshot, JobStatus, Rebalance, RenderJob, SliceUpdate};

/// Everything a supervisor needs from the outside world.
#[derive(Clone)]
pub struct JobContext {
    pub bus: MessageBus,
    pub objects: Arc<dyn ObjectStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub scheduling: SchedulingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug)]
pub enum SupervisorCommand {
    Stop {
        response_tx: oneshot::Sender<JobSnapshot>,
    },
    SetDesiredWorkers {
        count: usize,
        response_tx: oneshot::Sender<JobSnapshot>,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    job_id: Uuid,
    command_tx: mpsc::Sender<SupervisorCommand>,
    snapshot_rx: watch::Receiver<JobSnapshot>,
}

impl SupervisorHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Latest published state. Never blocks and keeps working after the
    /// supervisor has exited.
    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Stop the job and wait for its final snapshot.
    pub async fn stop(&self) -> Result<JobSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::Stop { response_tx: tx })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn set_desired_workers(&self, count: usize) -> Result<JobSnapshot> {
        if count == 0 {
            return Err(FarmError::InvalidWorkerCount(count));
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::SetDesiredWorkers {
                count,
                response_tx: tx,
            })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> FarmError {
        FarmError::ActorGone(format!("job {}", self.job_id))
    }
}

enum Flow {
    Continue,
    Finish(Exit),
}

struct Exit {
    status: JobStatus,
    error: Option<String>,
    reply: Option<oneshot::Sender<JobSnapshot>>,
}

impl Exit {
    fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            error: None,
            reply: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(reason.into()),
            reply: None,
        }
    }

    fn stopped(reply: Option<oneshot::Sender<JobSnapshot>>) -> Self {
        Self {
            status: JobStatus::Stopped,
            error: None,
            reply,
        }
    }
}

/// Result of moving one rendered frame out of the upload bucket.
struct ArtifactMove {
    frame: u32,
    key: String,
    result: std::result::Result<(), String>,
}

pub struct Supervisor {
    job_id: Uuid,
    address: JobAddress,
    ctx: JobContext,
    inbox: Subscription,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    snapshot_tx: watch::Sender<JobSnapshot>,
    snapshot: JobSnapshot,
    registered: bool,
    demand_attempts: u32,
    next_demand: Option<Instant>,
    /// In-flight artifact moves. The job completes only once this drains.
    moves: JoinSet<ArtifactMove>,
}

impl Supervisor {
    /// Bind the job's queue and build its handle. Nothing is loaded or
    /// published until [`Supervisor::run`].
    pub async fn new(
        job_id: Uuid,
        customer_id: &str,
        object_id: &str,
        ctx: JobContext,
    ) -> Result<(Self, SupervisorHandle)> {
        let address = JobAddress::for_job(job_id);
        let inbox = ctx
            .bus
            .subscribe(&address.exchange, &address.routing_key)
            .await?;
        let (command_tx, command_rx) = mpsc::channel(16);

        let snapshot = JobSnapshot::new(
            job_id,
            customer_id,
            object_id,
            ctx.scheduling.default_desired_workers.max(1),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());

        let supervisor = Self {
            job_id,
            address,
            ctx,
            inbox,
            command_rx,
            snapshot_tx,
            snapshot,
            registered: false,
            demand_attempts: 0,
            next_demand: None,
            moves: JoinSet::new(),
        };
        let handle = SupervisorHandle {
            job_id,
            command_tx,
            snapshot_rx,
        };
        Ok((supervisor, handle))
    }

    /// Drive the job to a terminal state and return its final snapshot.
    pub async fn run(mut self, shutdown: CancellationToken) -> JobSnapshot {
        tracing::info!(job_id = %self.job_id, "Supervisor started");

        let mut job = match self.initialize(&shutdown).await {
            Ok(job) => job,
            Err(exit) => {
                if let Some(reason) = &exit.error {
                    tracing::error!(job_id = %self.job_id, reason = %reason, "Job initialization failed");
                }
                return self.finish(Vec::new(), exit).await;
            }
        };

        let exit = self.supervise(&mut job, &shutdown).await;
        let workers = job.workers().to_vec();
        self.finish(workers, exit).await
    }

    /// Load and validate the job record, then register with the broker.
    /// Stop and shutdown are honoured while the record is loading.
    async fn initialize(
        &mut self,
        shutdown: &CancellationToken,
    ) -> std::result::Result<RenderJob, Exit> {
        let load = load_record(
            self.ctx.documents.clone(),
            self.job_id,
            self.ctx.storage.request_timeout(),
        );
        tokio::pin!(load);

        let record = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Exit::stopped(None)),
                Some(command) = self.command_rx.recv() => match command {
                    SupervisorCommand::Stop { response_tx } => {
                        tracing::info!(job_id = %self.job_id, "Stop requested while loading");
                        return Err(Exit::stopped(Some(response_tx)));
                    }
                    SupervisorCommand::SetDesiredWorkers { count, response_tx } => {
                        if count > 0 {
                            self.snapshot.desired_workers = count;
                            self.snapshot_tx.send_replace(self.snapshot.clone());
                        }
                        let _ = response_tx.send(self.snapshot.clone());
                    }
                },
                loaded = &mut load => break loaded.map_err(|reason| Exit::failed(reason))?,
            }
        };

        let job = RenderJob::from_record(&record, self.ctx.scheduling.max_frames_per_job)
            .map_err(|reason| Exit::failed(reason))?;

        self.snapshot.first_frame = Some(job.first_frame());
        self.snapshot.last_frame = Some(job.last_frame());

        self.to_broker(&BrokerMessage::RegisterJob {
            job_id: self.job_id,
            address: self.address.clone(),
        })
        .await
        .map_err(|e| Exit::failed(format!("could not register with broker: {e}")))?;
        self.registered = true;

        tracing::info!(
            job_id = %self.job_id,
            first_frame = job.first_frame(),
            last_frame = job.last_frame(),
            "Job loaded"
        );
        self.next_demand = Some(Instant::now());
        self.refresh(&job);
        Ok(job)
    }

    async fn supervise(&mut self, job: &mut RenderJob, shutdown: &CancellationToken) -> Exit {
        loop {
            let demand_at = self.next_demand;
            let flow = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(job_id = %self.job_id, "Supervisor shutting down");
                    Flow::Finish(Exit::stopped(None))
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(job, command).await
                }
                envelope = self.inbox.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(job, envelope).await,
                        None => Flow::Finish(Exit::failed("message bus closed")),
                    }
                }
                _ = tokio::time::sleep_until(demand_at.unwrap_or_else(Instant::now)), if demand_at.is_some() => {
                    self.demand_tick(job).await
                }
                Some(joined) = self.moves.join_next(), if !self.moves.is_empty() => {
                    self.on_artifact_moved(job, joined)
                }
            };

            match flow {
                Flow::Continue => self.refresh(job),
                Flow::Finish(exit) => return exit,
            }
        }
    }

    async fn handle_command(&mut self, job: &mut RenderJob, command: SupervisorCommand) -> Flow {
        match command {
            SupervisorCommand::Stop { response_tx } => {
                tracing::info!(job_id = %self.job_id, "Stop requested");
                Flow::Finish(Exit::stopped(Some(response_tx)))
            }
            SupervisorCommand::SetDesiredWorkers { count, response_tx } => {
                if count == 0 {
                    tracing::warn!(job_id = %self.job_id, "Ignoring desired worker count of zero");
                } else {
                    self.set_desired_workers(job, count).await;
                }
                self.refresh(job);
                let _ = response_tx.send(self.snapshot.clone());
                Flow::Continue
            }
        }
    }

    async fn set_desired_workers(&mut self, job: &mut RenderJob, count: usize) {
        let attached = job.workers().len();
        tracing::info!(job_id = %self.job_id, desired = count, attached, "Desired workers changed");
        self.snapshot.desired_workers = count;

        if count > attached {
            self.request_workers(job).await;
        } else if count < attached {
            let dropped = job.detach_newest(attached - count);
            self.release(&dropped).await;
            if let Err(e) = self
                .to_broker(&BrokerMessage::DemandWithdrawn {
                    job_id: self.job_id,
                })
                .await
            {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to withdraw demand");
            }
            self.next_demand = None;
            let rebalance = job.rebalance(false);
            self.apply(job, rebalance).await;
        }
    }

    async fn handle_envelope(&mut self, job: &mut RenderJob, envelope: Envelope) -> Flow {
        let message = match envelope.decode::<SupervisorMessage>() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    topic = ?envelope.message_topic(),
                    error = %e,
                    "Supervisor received undecodable message"
                );
                return Flow::Continue;
            }
        };

        match message {
            SupervisorMessage::WorkersAssigned { workers } => {
                self.on_workers_assigned(job, &workers).await
            }
            SupervisorMessage::WorkerLost { worker_id } => self.on_worker_lost(job, &worker_id).await,
            SupervisorMessage::WorkerEvent { worker_id, event } => match event {
                WorkerEvent::FrameRendered {
                    frame,
                    artifact_locator,
                } => self.on_frame_rendered(job, &worker_id, frame, &artifact_locator).await,
                WorkerEvent::RenderingCompleted {} => {
                    self.on_rendering_completed(job, &worker_id).await
                }
                WorkerEvent::Disconnected {} => {
                    tracing::debug!(job_id = %self.job_id, worker_id = %worker_id, "Disconnect is handled by the broker");
                    Flow::Continue
                }
            },
        }
    }

    async fn on_workers_assigned(&mut self, job: &mut RenderJob, workers: &[WorkerId]) -> Flow {
        let added = job.attach(workers);
        tracing::info!(
            job_id = %self.job_id,
            assigned = workers.len(),
            added,
            attached = job.workers().len(),
            "Workers assigned"
        );
        if added == 0 {
            return Flow::Continue;
        }

        self.demand_attempts = 0;
        self.snapshot.status = JobStatus::Running;

        let desired = self.snapshot.desired_workers;
        if job.workers().len() > desired {
            let extra = job.detach_newest(job.workers().len() - desired);
            self.release(&extra).await;
        }

        let rebalance = job.rebalance(true);
        self.apply(job, rebalance).await;
        self.schedule_top_up(job);
        Flow::Continue
    }

    async fn on_worker_lost(&mut self, job: &mut RenderJob, worker_id: &WorkerId) -> Flow {
        if !job.detach(worker_id) {
            tracing::debug!(job_id = %self.job_id, worker_id = %worker_id, "Lost worker was not attached");
            return Flow::Continue;
        }
        tracing::warn!(
            job_id = %self.job_id,
            worker_id = %worker_id,
            survivors = job.workers().len(),
            "Worker lost"
        );
        if job.is_finished() {
            return self.completion(job);
        }

        if job.workers().is_empty() {
            self.snapshot.status = JobStatus::Initializing;
            self.demand_attempts = 0;
            self.next_demand = Some(Instant::now());
            return Flow::Continue;
        }

        let rebalance = job.rebalance(false);
        self.apply(job, rebalance).await;
        self.schedule_top_up(job);
        Flow::Continue
    }

    async fn on_frame_rendered(
        &mut self,
        job: &mut RenderJob,
        worker_id: &WorkerId,
        frame: u32,
        artifact_locator: &str,
    ) -> Flow {
        if !job.frame_rendered(frame) {
            tracing::debug!(job_id = %self.job_id, worker_id = %worker_id, frame, "Duplicate or unknown frame ignored");
            return Flow::Continue;
        }
        tracing::debug!(
            job_id = %self.job_id,
            worker_id = %worker_id,
            frame,
            remaining = job.remaining_frames(),
            "Frame rendered"
        );
        self.spawn_artifact_move(frame, artifact_locator);
        self.completion(job)
    }

    fn on_artifact_moved(
        &mut self,
        job: &RenderJob,
        joined: std::result::Result<ArtifactMove, JoinError>,
    ) -> Flow {
        match joined {
            Ok(ArtifactMove {
                frame,
                key,
                result: Ok(()),
            }) => {
                tracing::debug!(job_id = %self.job_id, frame, key = %key, "Rendered frame stored");
            }
            Ok(ArtifactMove {
                frame,
                key,
                result: Err(e),
            }) => {
                tracing::error!(job_id = %self.job_id, frame, key = %key, error = %e, "Failed to store rendered frame");
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Artifact move task failed");
            }
        }
        self.completion(job)
    }

    /// Completed once every frame is in and every move has settled.
    fn completion(&self, job: &RenderJob) -> Flow {
        if job.is_finished() && self.moves.is_empty() {
            Flow::Finish(Exit::completed())
        } else {
            Flow::Continue
        }
    }

    async fn on_rendering_completed(&mut self, job: &mut RenderJob, worker_id: &WorkerId) -> Flow {
        if job.is_finished() {
            return self.completion(job);
        }
        if !job.is_attached(worker_id) {
            return Flow::Continue;
        }

        let slice = job.slice_of(worker_id).to_vec();
        if !slice.is_empty() {
            tracing::info!(
                job_id = %self.job_id,
                worker_id = %worker_id,
                frames = slice.len(),
                "Worker finished with frames still owed, resending"
            );
            self.send_slice(job, worker_id, slice).await;
            return Flow::Continue;
        }

        tracing::info!(job_id = %self.job_id, worker_id = %worker_id, "Worker ran dry, redistributing");
        let rebalance = job.rebalance(false);
        self.apply(job, rebalance).await;
        Flow::Continue
    }

    async fn demand_tick(&mut self, job: &RenderJob) -> Flow {
        if job.workers().is_empty() {
            let max = self.ctx.scheduling.max_demand_attempts;
            if self.demand_attempts >= max {
                tracing::error!(job_id = %self.job_id, attempts = self.demand_attempts, "Giving up on acquiring workers");
                return Flow::Finish(Exit::failed(
                    FarmError::NoWorkersAcquired(self.demand_attempts).to_string(),
                ));
            }
            self.demand_attempts += 1;
        }
        self.request_workers(job).await;
        Flow::Continue
    }

    /// Workers this job can use right now: the desired count, capped by the
    /// frames left to hand out.
    fn wanted_workers(&self, job: &RenderJob) -> usize {
        self.snapshot.desired_workers.min(job.remaining_frames())
    }

    /// Publish a demand for the shortfall and arm the next retry.
    async fn request_workers(&mut self, job: &RenderJob) {
        let shortfall = self.wanted_workers(job).saturating_sub(job.workers().len());
        if shortfall == 0 {
            self.next_demand = None;
            return;
        }

        tracing::info!(
            job_id = %self.job_id,
            count = shortfall,
            attempt = self.demand_attempts,
            "Requesting workers"
        );
        if let Err(e) = self
            .to_broker(&BrokerMessage::Demand {
                job_id: self.job_id,
                count: shortfall,
            })
            .await
        {
            tracing::error!(job_id = %self.job_id, error = %e, "Failed to publish demand");
        }
        self.next_demand = Some(Instant::now() + self.retry_delay());
    }

    /// Arm a retry if the job is still short and none is pending.
    fn schedule_top_up(&mut self, job: &RenderJob) {
        if job.workers().len() >= self.wanted_workers(job) {
            self.next_demand = None;
        } else if self.next_demand.is_none() {
            self.next_demand = Some(Instant::now() + self.retry_delay());
        }
    }

    fn retry_delay(&self) -> std::time::Duration {
        backoff::jittered_delay(
            self.ctx.scheduling.demand_retry_interval_ms,
            self.ctx.scheduling.demand_retry_jitter_ms,
        )
    }

    async fn apply(&mut self, job: &RenderJob, rebalance: Rebalance) {
        for update in rebalance.updates {
            self.send_slice(job, &update.worker_id, update.frames).await;
        }
        if !rebalance.surplus.is_empty() {
            tracing::info!(job_id = %self.job_id, surplus = rebalance.surplus.len(), "Releasing workers with no frames");
            self.release(&rebalance.surplus).await;
        }
    }

    async fn send_slice(&self, job: &RenderJob, worker_id: &WorkerId, frames: Vec<u32>) {
        let command = WorkerCommand::StartRendering {
            scene_locator: job.scene_locator().to_string(),
            frames,
        };
        self.to_worker(worker_id, &command).await;
    }

    /// Stop the given workers and hand them back to the broker.
    async fn release(&self, workers: &[WorkerId]) {
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            self.to_worker(worker, &WorkerCommand::StopWork {}).await;
        }
        if let Err(e) = self
            .to_broker(&BrokerMessage::WorkersReleased {
                job_id: self.job_id,
                workers: workers.to_vec(),
            })
            .await
        {
            tracing::error!(job_id = %self.job_id, error = %e, "Failed to release workers");
        }
    }

    /// Move a rendered frame from the upload bucket to its final key in the
    /// background. The outcome comes back through `moves`.
    fn spawn_artifact_move(&mut self, frame: u32, artifact_locator: &str) {
        let storage = &self.ctx.storage;
        let extension = Path::new(artifact_locator)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("png");
        let key = format!(
            "{}/{}/{:05}.{}",
            self.snapshot.customer_id, self.job_id, frame, extension
        );

        let objects = self.ctx.objects.clone();
        let upload_bucket = storage.upload_bucket.clone();
        let output_bucket = storage.output_bucket.clone();
        let locator = artifact_locator.to_string();
        let limit = storage.request_timeout();
        let job_id = self.job_id;

        self.moves.spawn(async move {
            let result = match tokio::time::timeout(
                limit,
                move_artifact(objects.as_ref(), &upload_bucket, &locator, &output_bucket, &key),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
            };
            if result.is_err() {
                tracing::debug!(job_id = %job_id, frame, artifact = %locator, "Uploaded frame left in place");
            }
            ArtifactMove { frame, key, result }
        });
    }

    /// Release everything, record the terminal state and publish the final
    /// snapshot.
    async fn finish(&mut self, workers: Vec<WorkerId>, exit: Exit) -> JobSnapshot {
        if !self.moves.is_empty() {
            tracing::debug!(job_id = %self.job_id, pending = self.moves.len(), "Leaving artifact moves to finish");
            self.moves.detach_all();
        }
        self.release(&workers).await;
        if self.registered {
            if let Err(e) = self
                .to_broker(&BrokerMessage::UnregisterJob {
                    job_id: self.job_id,
                })
                .await
            {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to unregister job");
            }
        }
        if let Err(e) = self
            .ctx
            .documents
            .set_job_state(self.job_id, exit.status)
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to record job state");
        }

        self.snapshot.status = exit.status;
        self.snapshot.error = exit.error;
        self.snapshot.workers = Vec::new();
        self.snapshot.finished_at = Some(Utc::now());
        self.snapshot_tx.send_replace(self.snapshot.clone());

        tracing::info!(
            job_id = %self.job_id,
            status = %exit.status,
            released = workers.len(),
            "Job finished"
        );
        if let Some(reply) = exit.reply {
            let _ = reply.send(self.snapshot.clone());
        }
        self.snapshot.clone()
    }

    fn refresh(&mut self, job: &RenderJob) {
        self.snapshot.total_frames = job.total_frames();
        self.snapshot.rendered_frames = job.rendered_frames();
        self.snapshot.remaining_frames = job.remaining_frames();
        self.snapshot.workers = job.workers().to_vec();
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    async fn to_broker(&self, message: &BrokerMessage) -> Result<()> {
        self.ctx
            .bus
            .publish(
                BROKER_EXCHANGE,
                BROKER_ROUTING_KEY,
                message,
                Headers::new().with(HEADER_JOB_ID, self.job_id),
            )
            .await?;
        Ok(())
    }

    async fn to_worker(&self, worker_id: &WorkerId, command: &WorkerCommand) {
        let delivered = self
            .ctx
            .bus
            .publish(
                WORKER_EXCHANGE,
                worker_id.as_str(),
                command,
                Headers::new().with(HEADER_JOB_ID, self.job_id),
            )
            .await;
        match delivered {
            Ok(0) => {
                tracing::debug!(job_id = %self.job_id, worker_id = %worker_id, "Worker not listening");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %self.job_id, worker_id = %worker_id, error = %e, "Failed to reach worker");
            }
        }
    }
}

async fn load_record(
    documents: Arc<dyn DocumentStore>,
    job_id: Uuid,
    limit: Duration,
) -> std::result::Result<JobRecord, String> {
    match tokio::time::timeout(limit, documents.get_job_record(job_id)).await {
        Ok(Ok(record)) => Ok(record),
        Ok(Err(e)) => Err(format!("could not load job record: {e}")),
        Err(_) => Err(format!(
            "job record load timed out after {}ms",
            limit.as_millis()
        )),
    }
}

/// Copy, then delete the upload. A failed delete only leaves a stray upload
/// behind and is not an error.
async fn move_artifact(
    objects: &dyn ObjectStore,
    upload_bucket: &str,
    locator: &str,
    output_bucket: &str,
    key: &str,
) -> std::result::Result<(), String> {
    let bytes = objects
        .retrieve(upload_bucket, locator)
        .await
        .map_err(|e| format!("fetch {locator}: {e}"))?;
    objects
        .store(output_bucket, key, bytes)
        .await
        .map_err(|e| format!("store {key}: {e}"))?;
    if let Err(e) = objects.delete(upload_bucket, locator).await {
        tracing::warn!(artifact = locator, error = %e, "Failed to delete uploaded frame");
    }
    Ok(())
}
