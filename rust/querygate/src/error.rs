use crate::{
    cache::CacheSyncError,
    query::{ExecutionError, ValidationError},
    templates::StoreError,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use thiserror::Error;
use tracing::{error, warn};

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Ad-hoc statement rejected or failed in the backend; reported as bad input.
    #[error(transparent)]
    QueryFailed(ExecutionError),

    /// Stored template failed in the backend.
    #[error(transparent)]
    Execution(ExecutionError),

    #[error("template '{0}' not found or not active")]
    TemplateNotFound(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    CacheSync(#[from] CacheSyncError),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_)
            | ServiceError::Validation(_)
            | ServiceError::QueryFailed(_) => StatusCode::BAD_REQUEST,
            ServiceError::TemplateNotFound(_) | ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Execution(_)
            | ServiceError::CacheSync(_)
            | ServiceError::Persistence(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "ConfigurationError",
            ServiceError::Auth => "Unauthorized",
            ServiceError::InvalidRequest(_) => "InvalidRequest",
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::QueryFailed(_) | ServiceError::Execution(_) => "QueryExecutionError",
            ServiceError::TemplateNotFound(_) | ServiceError::NotFound(_) => "NotFound",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::CacheSync(_) => "CacheSyncError",
            ServiceError::Persistence(_) => "PersistenceError",
            ServiceError::Internal(_) => "InternalError",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            ServiceError::QueryFailed(err) | ServiceError::Execution(err) => Some(err.detail()),
            ServiceError::Internal(err) => Some(format!("{err:#}")),
            _ => None,
        }
    }

    fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Auth
                | ServiceError::InvalidRequest(_)
                | ServiceError::Validation(_)
                | ServiceError::TemplateNotFound(_)
                | ServiceError::NotFound(_)
                | ServiceError::Conflict(_)
        )
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if self.is_client_error() {
            warn!(error = %self, status = status.as_u16(), "request rejected");
        } else {
            error!(error = ?self, status = status.as_u16(), "request failed");
        }

        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            details: self.details(),
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::BackendError;

    #[test]
    fn status_mapping() {
        let failed = || ExecutionError(BackendError::Other("syntax error".into()));
        assert_eq!(
            ServiceError::Validation(ValidationError::EmptyQuery).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ServiceError::QueryFailed(failed()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::Execution(failed()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::TemplateNotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ServiceError::Conflict("stale".into()).status(), StatusCode::CONFLICT);
        assert_eq!(ServiceError::Auth.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn body_omits_missing_details() {
        let body = ErrorBody {
            error: ServiceError::Auth.kind(),
            message: ServiceError::Auth.to_string(),
            details: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "Unauthorized");
        assert!(json.get("details").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn execution_failures_carry_backend_detail() {
        let err = ServiceError::Execution(ExecutionError(BackendError::Other(
            "column \"x\" does not exist".into(),
        )));
        assert_eq!(err.details().as_deref(), Some("column \"x\" does not exist"));
        assert_eq!(
            err.to_string(),
            "query execution failed: column \"x\" does not exist"
        );
    }
}
