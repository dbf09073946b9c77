//! Internal HTTP/JSON control API.
//!
//! Wraps the registry's lifecycle operations and the broker snapshot. It is
//! meant to sit behind whatever outer layer does authentication; it performs
//! none itself.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::broker::BrokerHandle;
use crate::error::FarmError;
use crate::registry::JobRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: JobRegistry,
    pub broker: BrokerHandle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub customer_id: String,
    pub object_id: String,
    #[serde(default)]
    pub desired_workers: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetWorkersRequest {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    customer_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// [`FarmError`] rendered as a JSON error with a matching status code.
pub struct ApiError(FarmError);

impl From<FarmError> for ApiError {
    fn from(e: FarmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FarmError::JobNotFound(_) => StatusCode::NOT_FOUND,
            FarmError::InvalidJob(_) | FarmError::InvalidWorkerCount(_) => StatusCode::BAD_REQUEST,
            FarmError::ActorGone(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Control request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(start_job_handler))
        .route(
            "/api/jobs/:id",
            get(job_status_handler).delete(stop_job_handler),
        )
        .route("/api/jobs/:id/workers", put(set_workers_handler))
        .route("/api/workers", get(workers_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve `app` on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, app: Router, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting control API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind control API");
            shutdown.cancel();
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Control API failed");
    }
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "live_jobs": state.registry.live_count().await,
    }))
}

async fn start_job_handler(
    State(state): State<ApiState>,
    Json(request): Json<StartJobRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.desired_workers == Some(0) {
        return Err(FarmError::InvalidWorkerCount(0).into());
    }
    let job_id = state
        .registry
        .start_job(&request.customer_id, &request.object_id)
        .await?;
    if let Some(count) = request.desired_workers {
        if let Err(e) = state.registry.set_desired_workers(job_id, count).await {
            tracing::warn!(job_id = %job_id, error = %e, "Could not apply requested worker count");
        }
    }
    Ok((StatusCode::CREATED, Json(StartJobResponse { job_id })))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let jobs = match query.customer_id {
        Some(customer_id) => state.registry.jobs_for_customer(&customer_id).await,
        None => state.registry.list().await,
    };
    Json(jobs)
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.status(job_id).await?))
}

async fn stop_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.stop_and_delete(job_id).await?))
}

async fn set_workers_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<SetWorkersRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .registry
            .set_desired_workers(job_id, request.count)
            .await?,
    ))
}

async fn workers_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.broker.snapshot().await?))
}
