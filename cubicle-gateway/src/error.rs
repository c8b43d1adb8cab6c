//! Error types for the gateway crate.

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use cubicle_runtime::{DescriptorError, OrchestratorError, RuntimeError, StoreError};

use crate::config::ConfigError;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the lifecycle orchestrator.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The upstream authentication layer did not identify the caller.
    #[error("missing or invalid x-owner-id header")]
    Unauthenticated,

    /// The request body is malformed or incomplete.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Machine-readable kind, sent as the `error` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            GatewayError::Orchestrator(e) => e.kind(),
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::InvalidRequest(_) => "validation_error",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Orchestrator(e) => match e {
                OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::QuotaExceeded { .. } => StatusCode::CONFLICT,
                OrchestratorError::NotFoundOrUnauthorized { .. } => StatusCode::NOT_FOUND,
                OrchestratorError::CapacityExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                OrchestratorError::Runtime { source, .. } => match source {
                    RuntimeError::RuntimeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    RuntimeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                },
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        GatewayError::InvalidRequest(rejection.body_text())
    }
}

impl From<PathRejection> for GatewayError {
    fn from(rejection: PathRejection) -> Self {
        GatewayError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({"error": self.kind(), "message": self.to_string()});
        if let GatewayError::Orchestrator(OrchestratorError::Runtime { op, source }) = &self {
            body["op"] = json!(op.as_str());
            body["runtime_error"] = json!(source.kind());
        }
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

/// Failures that stop the gateway from starting or serving.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The descriptor directory could not be prepared.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The record store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cubicle_core::{CoreError, OwnerId, VmId};
    use cubicle_runtime::RuntimeOp;

    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = match axum::body::to_bytes(resp.into_body(), 4096).await {
            Ok(b) => b,
            Err(e) => panic!("failed to read body: {e}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => panic!("invalid JSON: {e}"),
        }
    }

    #[test]
    fn status_codes_map_per_kind() {
        let cases = [
            (GatewayError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (
                OrchestratorError::Validation(CoreError::InvalidStatus { value: "paused".to_owned() }).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::QuotaExceeded { owner_id: OwnerId::new(1), limit: 3 }.into(),
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::NotFoundOrUnauthorized { vm_id: VmId::new(4) }.into(),
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::InconsistentState { vm_id: VmId::new(4), reason: "gone".to_owned() }.into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "{err}");
        }
    }

    #[test]
    fn runtime_failures_distinguish_unavailable_and_timeout() {
        let unavailable: GatewayError = OrchestratorError::Runtime {
            op: RuntimeOp::Start,
            source: RuntimeError::RuntimeUnavailable { reason: "daemon down".to_owned() },
        }
        .into();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout: GatewayError = OrchestratorError::Runtime {
            op: RuntimeOp::Stop,
            source: RuntimeError::Timeout { vm_id: VmId::new(1), op: RuntimeOp::Stop, after: Duration::from_secs(60) },
        }
        .into();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn runtime_error_body_names_operation() {
        let err: GatewayError = OrchestratorError::Runtime {
            op: RuntimeOp::Create,
            source: RuntimeError::BuildFailed { vm_id: VmId::new(2), stderr: "no space left".to_owned() },
        }
        .into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "runtime_error");
        assert_eq!(body["op"], "create");
        assert_eq!(body["runtime_error"], "build_failed");
        assert!(body["message"].as_str().is_some_and(|m| m.contains("no space left")));
    }

    #[tokio::test]
    async fn unauthenticated_body_has_kind_and_message() {
        let body = body_json(GatewayError::Unauthenticated.into_response()).await;
        assert_eq!(body["error"], "unauthenticated");
        assert_eq!(body["message"], "missing or invalid x-owner-id header");
    }
}
