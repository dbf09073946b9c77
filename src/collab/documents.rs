use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StoreError;
use crate::supervisor::JobStatus;

/// What the document store knows about one render job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(rename = "sessionId")]
    pub job_id: Uuid,
    pub customer_id: String,
    #[serde(rename = "blenderObjectId")]
    pub object_id: String,
    /// Blob key of the `.blend` file workers fetch.
    #[serde(rename = "blendFilePath")]
    pub scene_locator: String,
    pub first_frame: u32,
    pub last_frame: u32,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Record a new job for `object_id` and return its full record.
    async fn create_job_record(
        &self,
        job_id: Uuid,
        customer_id: &str,
        object_id: &str,
    ) -> Result<JobRecord, StoreError>;

    async fn get_job_record(&self, job_id: Uuid) -> Result<JobRecord, StoreError>;

    async fn set_job_state(&self, job_id: Uuid, state: JobStatus) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct SceneEntry {
    scene_locator: String,
    first_frame: u32,
    last_frame: u32,
}

#[derive(Debug, Default)]
struct Documents {
    scenes: HashMap<(String, String), SceneEntry>,
    jobs: HashMap<Uuid, (JobRecord, JobStatus)>,
}

/// In-memory document store. Scenes are registered up front with
/// [`MemoryDocumentStore::add_scene`]; jobs can only be created for known
/// scenes.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<Documents>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_scene(
        &self,
        customer_id: &str,
        object_id: &str,
        scene_locator: &str,
        first_frame: u32,
        last_frame: u32,
    ) {
        self.inner.write().await.scenes.insert(
            (customer_id.to_string(), object_id.to_string()),
            SceneEntry {
                scene_locator: scene_locator.to_string(),
                first_frame,
                last_frame,
            },
        );
    }

    pub async fn job_state(&self, job_id: Uuid) -> Option<JobStatus> {
        self.inner
            .read()
            .await
            .jobs
            .get(&job_id)
            .map(|(_, state)| *state)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_job_record(
        &self,
        job_id: Uuid,
        customer_id: &str,
        object_id: &str,
    ) -> Result<JobRecord, StoreError> {
        let mut docs = self.inner.write().await;
        if docs.jobs.contains_key(&job_id) {
            return Err(StoreError::Conflict(format!("job {job_id} already exists")));
        }
        let scene = docs
            .scenes
            .get(&(customer_id.to_string(), object_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("object {object_id}")))?;

        let record = JobRecord {
            job_id,
            customer_id: customer_id.to_string(),
            object_id: object_id.to_string(),
            scene_locator: scene.scene_locator,
            first_frame: scene.first_frame,
            last_frame: scene.last_frame,
        };
        docs.jobs
            .insert(job_id, (record.clone(), JobStatus::Initializing));
        Ok(record)
    }

    async fn get_job_record(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        self.inner
            .read()
            .await
            .jobs
            .get(&job_id)
            .map(|(record, _)| record.clone())
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn set_job_state(&self, job_id: Uuid, state: JobStatus) -> Result<(), StoreError> {
        let mut docs = self.inner.write().await;
        let entry = docs
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        entry.1 = state;
        Ok(())
    }
}

/// Client for the document service's session routes.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddSessionRequest<'a> {
    session_id: Uuid,
    customer_id: &'a str,
    blender_object_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatusRequest {
    session_id: Uuid,
    status: JobStatus,
}

impl HttpDocumentStore {
    /// Every request, body included, must finish within `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/mongodb-service/sessions/{}", self.base_url, path)
    }
}

async fn check(response: reqwest::Response, what: String) -> Result<reqwest::Response, StoreError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound(what)),
        StatusCode::CONFLICT => Err(StoreError::Conflict(what)),
        status => Err(StoreError::Service {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn create_job_record(
        &self,
        job_id: Uuid,
        customer_id: &str,
        object_id: &str,
    ) -> Result<JobRecord, StoreError> {
        let response = self
            .client
            .post(self.url("add"))
            .json(&AddSessionRequest {
                session_id: job_id,
                customer_id,
                blender_object_id: object_id,
            })
            .send()
            .await?;
        check(response, format!("object {object_id}")).await?;
        self.get_job_record(job_id).await
    }

    async fn get_job_record(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        let response = self
            .client
            .get(self.url(&job_id.to_string()))
            .send()
            .await?;
        let response = check(response, format!("job {job_id}")).await?;
        Ok(response.json::<JobRecord>().await?)
    }

    async fn set_job_state(&self, job_id: Uuid, state: JobStatus) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url("update-status"))
            .json(&UpdateStatusRequest {
                session_id: job_id,
                status: state,
            })
            .send()
            .await?;
        check(response, format!("job {job_id}")).await?;
        Ok(())
    }
}
