use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exchange every job supervisor (and the worker gateway) uses to reach the broker.
pub const BROKER_EXCHANGE: &str = "broker";
/// The broker listens on a single routing key.
pub const BROKER_ROUTING_KEY: &str = "broker";
/// Exchange addressing individual job supervisors.
pub const SUPERVISOR_EXCHANGE: &str = "supervisor";
/// Exchange addressing individual connected workers, keyed by worker id.
pub const WORKER_EXCHANGE: &str = "worker";

/// Bus address of one job supervisor.
///
/// Built once when the job is created and carried around explicitly, so
/// nobody re-derives a routing key from a raw id string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobAddress {
    pub exchange: String,
    pub routing_key: String,
}

impl JobAddress {
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            exchange: SUPERVISOR_EXCHANGE.to_string(),
            routing_key: format!("job.{job_id}"),
        }
    }
}

impl fmt::Display for JobAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}
