//! Standardized error handling for the SalonFlow API
//!
//! Every endpoint renders failures with the same JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::workflows::WorkflowError;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND", "CONFLICT")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            path: None,
        }
    }

    /// Create a 404 Not Found error
    pub fn not_found(message: impl Into<String>) -> AppError {
        AppError::NotFound(message.into())
    }

    /// Create a validation error with a single field error
    pub fn validation_single(field: impl Into<String>, message: impl Into<String>) -> AppError {
        let mut details = HashMap::new();
        details.insert(field.into(), vec![message.into()]);
        AppError::ValidationError { details }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    // Authorization errors
    Forbidden(String),

    // Resource errors
    NotFound(String),
    Conflict(String),

    // Validation errors
    ValidationError { details: HashMap<String, Vec<String>> },

    // Server errors
    InternalError(String),
    DatabaseError(String),
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "ACCESS_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Forbidden(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::Conflict(msg) => msg.clone(),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details } = &self {
            error.details = Some(details.clone());
        }

        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Validation { details } => Self::ValidationError { details },
            WorkflowError::NotFound { resource, .. } => Self::NotFound(resource.to_string()),
            WorkflowError::Forbidden(msg) => Self::Forbidden(msg),
            WorkflowError::Conflict(msg) => Self::Conflict(msg),
            WorkflowError::Dispatch(e) => Self::ExternalServiceError {
                service: "action-dispatcher".to_string(),
                message: e.to_string(),
            },
            WorkflowError::Store(e) => e.into(),
            other @ (WorkflowError::Concurrency { .. } | WorkflowError::Corrupt(_)) => {
                Self::InternalError(other.to_string())
            }
        }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Collects field-level validation messages.
pub struct ValidationBuilder {
    details: HashMap<String, Vec<String>>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self {
            details: HashMap::new(),
        }
    }

    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.push(field, message);
        self
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn build(self) -> Option<AppError> {
        self.into_details()
            .map(|details| AppError::ValidationError { details })
    }

    pub fn into_details(self) -> Option<HashMap<String, Vec<String>>> {
        if self.details.is_empty() {
            None
        } else {
            Some(self.details)
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.details.is_empty()
    }
}

impl Default for ValidationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
