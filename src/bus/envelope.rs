use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::BusError;

/// Header naming the job a message concerns, readable without decoding the body.
pub const HEADER_JOB_ID: &str = "x-job-id";
/// Header naming the worker a message came from or is meant for.
pub const HEADER_WORKER_ID: &str = "x-worker-id";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// A message in flight: where it was routed and its `{topic, data}` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub routing_key: String,
    pub headers: Headers,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The payload's own topic field, used for logging undecodable messages.
    pub fn message_topic(&self) -> Option<&str> {
        self.payload.get("topic").and_then(|t| t.as_str())
    }
}
