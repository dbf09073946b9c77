//! Narrow contracts to the services the scheduler depends on but does not own.
//!
//! - [`ObjectStore`]: blobs (scene files, rendered frames)
//! - [`DocumentStore`]: job records and their externally visible state
//!
//! Each has an in-memory implementation for local runs and tests and an HTTP
//! client for the real services.

pub mod documents;
pub mod storage;

use thiserror::Error;

pub use documents::{DocumentStore, HttpDocumentStore, JobRecord, MemoryDocumentStore};
pub use storage::{HttpObjectStore, MemoryObjectStore, ObjectStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
