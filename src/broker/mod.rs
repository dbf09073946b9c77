//! Worker Pool Broker.
//!
//! One broker per farm. It owns the set of idle workers, the FIFO queue of
//! job demands and the map of which worker belongs to which job, and it is
//! the only component that sees workers connect and disconnect.
//!
//! # Message flow
//!
//! ```text
//!  gateway ──worker-connected/disconnected/worker-event──┐
//!                                                        ▼
//!  supervisors ──register/demand/release──▶ [broker exchange] ──▶ Broker
//!                                                        │
//!      workers-assigned / worker-lost / relayed events ◀─┘ (per-job address)
//! ```
//!
//! Every input, whether from the bus or from a [`BrokerHandle`], is consumed
//! by one loop, so a distribution pass can never interleave with another
//! one or with any other mutation.

pub mod pool;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bus::{
    Envelope, Headers, MessageBus, Subscription, BROKER_EXCHANGE, BROKER_ROUTING_KEY,
    HEADER_JOB_ID, HEADER_WORKER_ID,
};
use crate::error::{FarmError, Result};
use crate::protocol::{BrokerMessage, SupervisorMessage, WorkerEvent};

pub use pool::{Assignment, Demand, Notice, PoolSnapshot, WorkerPool};

/// Direct (non-bus) requests to the broker.
#[derive(Debug)]
pub enum BrokerCommand {
    Snapshot {
        response_tx: oneshot::Sender<PoolSnapshot>,
    },
}

#[derive(Debug, Clone)]
pub struct BrokerHandle {
    command_tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BrokerCommand::Snapshot { response_tx: tx })
            .await
            .map_err(|_| FarmError::ActorGone("broker".to_string()))?;
        rx.await
            .map_err(|_| FarmError::ActorGone("broker".to_string()))
    }
}

pub struct Broker {
    pool: WorkerPool,
    bus: MessageBus,
    inbox: Subscription,
    command_rx: mpsc::Receiver<BrokerCommand>,
}

impl Broker {
    /// Bind the broker's queue and build its handle. The queue is bound
    /// before this returns, so nothing published afterwards is missed even
    /// if [`Broker::run`] is spawned later.
    pub async fn new(bus: MessageBus) -> Result<(Self, BrokerHandle)> {
        let inbox = bus.subscribe(BROKER_EXCHANGE, BROKER_ROUTING_KEY).await?;
        let (command_tx, command_rx) = mpsc::channel(32);
        let broker = Self {
            pool: WorkerPool::new(),
            bus,
            inbox,
            command_rx,
        };
        Ok((broker, BrokerHandle { command_tx }))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Broker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Broker shutting down");
                    break;
                }
                Some(command) = self.command_rx.recv() => {
                    match command {
                        BrokerCommand::Snapshot { response_tx } => {
                            let _ = response_tx.send(self.pool.snapshot());
                        }
                    }
                }
                envelope = self.inbox.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => {
                            tracing::warn!("Broker queue closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.decode::<BrokerMessage>() {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                tracing::warn!(
                    topic = ?envelope.message_topic(),
                    error = %e,
                    "Broker received undecodable message"
                );
            }
        }
    }

    async fn handle_message(&mut self, message: BrokerMessage) {
        match message {
            BrokerMessage::RegisterJob { job_id, address } => {
                self.pool.register_job(job_id, address);
            }
            BrokerMessage::UnregisterJob { job_id } => {
                if self.pool.unregister_job(job_id) > 0 {
                    self.distribute().await;
                }
            }
            BrokerMessage::Demand { job_id, count } => {
                if self.pool.demand(job_id, count) {
                    self.distribute().await;
                }
            }
            BrokerMessage::DemandWithdrawn { job_id } => {
                self.pool.withdraw_demand(job_id);
            }
            BrokerMessage::WorkersReleased { job_id, workers } => {
                if self.pool.release(job_id, &workers) > 0 {
                    self.distribute().await;
                }
            }
            BrokerMessage::WorkerConnected { worker_id } => {
                if self.pool.worker_available(worker_id) {
                    self.distribute().await;
                }
            }
            BrokerMessage::WorkerDisconnected { worker_id } => {
                if let Some(notice) = self.pool.worker_gone(&worker_id) {
                    self.deliver(notice).await;
                }
            }
            BrokerMessage::WorkerEvent { worker_id, event } => {
                if matches!(event, WorkerEvent::Disconnected {}) {
                    if let Some(notice) = self.pool.worker_gone(&worker_id) {
                        self.deliver(notice).await;
                    }
                    return;
                }
                match self.pool.relay(&worker_id, event) {
                    Some(notice) => self.deliver(notice).await,
                    None => {
                        tracing::warn!(worker_id = %worker_id, "Event from unassigned worker dropped");
                    }
                }
            }
        }
    }

    /// Run distribution passes until every assignment has been delivered.
    ///
    /// An assignment nobody receives means the job's supervisor is gone; its
    /// workers are taken back and the job forgotten, then the pass repeats.
    async fn distribute(&mut self) {
        loop {
            let assignments = self.pool.distribute();
            if assignments.is_empty() {
                return;
            }

            let mut reclaimed = false;
            for assignment in assignments {
                let message = SupervisorMessage::WorkersAssigned {
                    workers: assignment.workers.clone(),
                };
                let headers = Headers::new().with(HEADER_JOB_ID, assignment.job_id);
                let delivered = self
                    .bus
                    .publish(
                        &assignment.address.exchange,
                        &assignment.address.routing_key,
                        &message,
                        headers,
                    )
                    .await;

                match delivered {
                    Ok(n) if n > 0 => {}
                    Ok(_) => {
                        tracing::warn!(job_id = %assignment.job_id, "Assigned job is not listening, reclaiming workers");
                        self.pool.release(assignment.job_id, &assignment.workers);
                        self.pool.unregister_job(assignment.job_id);
                        reclaimed = true;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %assignment.job_id, error = %e, "Failed to publish assignment");
                        self.pool.release(assignment.job_id, &assignment.workers);
                        reclaimed = true;
                    }
                }
            }

            if !reclaimed {
                return;
            }
        }
    }

    async fn deliver(&self, notice: Notice) {
        let (job_id, address, worker_id, message) = match notice {
            Notice::WorkerLost {
                job_id,
                address,
                worker_id,
            } => {
                let message = SupervisorMessage::WorkerLost {
                    worker_id: worker_id.clone(),
                };
                (job_id, address, worker_id, message)
            }
            Notice::Relay {
                job_id,
                address,
                worker_id,
                event,
            } => {
                let message = SupervisorMessage::WorkerEvent {
                    worker_id: worker_id.clone(),
                    event,
                };
                (job_id, address, worker_id, message)
            }
        };

        let headers = Headers::new()
            .with(HEADER_JOB_ID, job_id)
            .with(HEADER_WORKER_ID, &worker_id);
        if let Err(e) = self
            .bus
            .publish(&address.exchange, &address.routing_key, &message, headers)
            .await
        {
            tracing::error!(job_id = %job_id, worker_id = %worker_id, error = %e, "Failed to notify job");
        }
    }
}
