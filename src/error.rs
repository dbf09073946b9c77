use thiserror::Error;
use uuid::Uuid;

use crate::bus::BusError;
use crate::collab::StoreError;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Could not acquire workers after {0} attempts")]
    NoWorkersAcquired(u32),

    #[error("Invalid worker count: {0}")]
    InvalidWorkerCount(usize),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Actor for {0} is no longer running")]
    ActorGone(String),
}

pub type Result<T> = std::result::Result<T, FarmError>;
