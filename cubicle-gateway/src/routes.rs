//! Axum route handlers for the Cubicle gateway API.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequestParts, Path, State,
    },
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use cubicle_core::{OwnerId, VmId, VmStatus};
use cubicle_runtime::{OrchestratorError, RuntimeDriver, VmOrchestrator, VmStore};

use crate::error::GatewayError;

/// Header carrying the authenticated owner id, set by the upstream auth layer.
pub const OWNER_HEADER: &str = "x-owner-id";

// ── Shared state ─────────────────────────────────────────────────────────────

type Shared<S, D> = Arc<VmOrchestrator<S, D>>;

// ── Extractors ────────────────────────────────────────────────────────────────

/// The requesting owner, taken from [`OWNER_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub OwnerId);

impl<St: Send + Sync> FromRequestParts<St> for Owner {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|id| Owner(OwnerId::new(id)))
            .ok_or(GatewayError::Unauthenticated)
    }
}

// ── Request types ─────────────────────────────────────────────────────────────

/// Body of `POST /v1/vms` and `PATCH /v1/vms/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct NameBody {
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of `PUT /v1/vms/{id}/status`.
#[derive(Debug, Default, Deserialize)]
pub struct StatusBody {
    #[serde(default)]
    pub status: Option<String>,
}

impl NameBody {
    fn require(self) -> Result<String, GatewayError> {
        self.name
            .ok_or_else(|| GatewayError::InvalidRequest("missing field `name`".to_owned()))
    }
}

impl StatusBody {
    fn require(self) -> Result<VmStatus, GatewayError> {
        let raw = self
            .status
            .ok_or_else(|| GatewayError::InvalidRequest("missing field `status`".to_owned()))?;
        raw.parse::<VmStatus>()
            .map_err(|e| GatewayError::Orchestrator(OrchestratorError::Validation(e)))
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router over `orchestrator`.
pub fn create_router<S, D>(orchestrator: Shared<S, D>) -> Router
where
    S: VmStore + 'static,
    D: RuntimeDriver + 'static,
{
    Router::new()
        .route("/v1/vms", get(list_vms::<S, D>).post(create_vm::<S, D>))
        .route(
            "/v1/vms/{id}",
            get(get_vm::<S, D>).patch(rename_vm::<S, D>).delete(delete_vm::<S, D>),
        )
        .route("/v1/vms/{id}/status", put(set_vm_status::<S, D>))
        .route("/health", get(health))
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness check.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `GET /v1/vms`: the caller's VMs, ordered by id.
///
/// # Errors
/// Returns [`GatewayError`] if the owner header is missing or the store fails.
pub async fn list_vms<S: VmStore, D: RuntimeDriver>(
    State(orch): State<Shared<S, D>>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(orch.list(owner).await?))
}

/// `POST /v1/vms`: create a stopped VM.
///
/// # Errors
/// Validation, quota, capacity and runtime failures, see [`GatewayError::status`].
pub async fn create_vm<S: VmStore, D: RuntimeDriver>(
    State(orch): State<Shared<S, D>>,
    Owner(owner): Owner,
    body: Result<Json<NameBody>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(body) = body?;
    let name = body.require()?;
    let view = orch.create(owner, &name).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// `GET /v1/vms/{id}`
///
/// # Errors
/// [`OrchestratorError::NotFoundOrUnauthorized`] for absent or foreign VMs.
pub async fn get_vm<S: VmStore, D: RuntimeDriver>(
    State(orch): State<Shared<S, D>>,
    Owner(owner): Owner,
    id: Result<Path<u32>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Path(id) = id?;
    Ok(Json(orch.get(VmId::new(id), owner).await?))
}

/// `PATCH /v1/vms/{id}`: rename.
///
/// # Errors
/// Validation failures and [`OrchestratorError::NotFoundOrUnauthorized`].
pub async fn rename_vm<S: VmStore, D: RuntimeDriver>(
    State(orch): State<Shared<S, D>>,
    Owner(owner): Owner,
    id: Result<Path<u32>, PathRejection>,
    body: Result<Json<NameBody>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Path(id) = id?;
    let Json(body) = body?;
    let name = body.require()?;
    Ok(Json(orch.rename(VmId::new(id), owner, &name).await?))
}

/// `PUT /v1/vms/{id}/status`: start or stop.
///
/// # Errors
/// Validation failures, [`OrchestratorError::NotFoundOrUnauthorized`] and
/// runtime failures; on a runtime failure the VM keeps its previous status.
pub async fn set_vm_status<S: VmStore, D: RuntimeDriver>(
    State(orch): State<Shared<S, D>>,
    Owner(owner): Owner,
    id: Result<Path<u32>, PathRejection>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Path(id) = id?;
    let Json(body) = body?;
    let target = body.require()?;
    Ok(Json(orch.set_status(VmId::new(id), owner, target).await?))
}

/// `DELETE /v1/vms/{id}`
///
/// # Errors
/// [`OrchestratorError::NotFoundOrUnauthorized`] for absent or foreign VMs.
pub async fn delete_vm<S: VmStore, D: RuntimeDriver>(
    State(orch): State<Shared<S, D>>,
    Owner(owner): Owner,
    id: Result<Path<u32>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Path(id) = id?;
    orch.delete(VmId::new(id), owner).await?;
    Ok(StatusCode::NO_CONTENT)
}
