//! Messages exchanged over the bus.
//!
//! Every message serializes as `{"topic": "<kebab-name>", "data": {...}}`.
//! The enums are grouped by recipient: [`BrokerMessage`] goes to the broker
//! exchange, [`SupervisorMessage`] to one job's address and [`WorkerCommand`]
//! to one worker. [`WorkerEvent`] is what a worker reports about its own
//! progress; the gateway wraps it for the broker, which relays it to the
//! owning job.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::JobAddress;

/// Opaque identity of a connected rendering client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a newly connected socket.
    pub fn generate() -> Self {
        Self(format!("w-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "kebab-case")]
pub enum BrokerMessage {
    RegisterJob {
        job_id: Uuid,
        address: JobAddress,
    },
    UnregisterJob {
        job_id: Uuid,
    },
    /// Upsert: replaces any outstanding count for the job.
    Demand {
        job_id: Uuid,
        count: usize,
    },
    DemandWithdrawn {
        job_id: Uuid,
    },
    WorkersReleased {
        job_id: Uuid,
        workers: Vec<WorkerId>,
    },
    WorkerConnected {
        worker_id: WorkerId,
    },
    WorkerDisconnected {
        worker_id: WorkerId,
    },
    /// A worker's own report, relayed to whichever job owns the worker.
    WorkerEvent {
        worker_id: WorkerId,
        event: WorkerEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "kebab-case")]
pub enum SupervisorMessage {
    WorkersAssigned {
        workers: Vec<WorkerId>,
    },
    WorkerLost {
        worker_id: WorkerId,
    },
    WorkerEvent {
        worker_id: WorkerId,
        event: WorkerEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "kebab-case")]
pub enum WorkerEvent {
    FrameRendered {
        frame: u32,
        /// Key of the uploaded image in the upload bucket.
        artifact_locator: String,
    },
    RenderingCompleted {},
    Disconnected {},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "kebab-case")]
pub enum WorkerCommand {
    /// Replaces whatever the worker was rendering before.
    StartRendering {
        scene_locator: String,
        frames: Vec<u32>,
    },
    StopWork {},
}
