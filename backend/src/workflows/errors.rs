// Workflow error types

use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use super::actions::DispatchError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow definition is invalid")]
    Validation { details: HashMap<String, Vec<String>> },

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("action dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("gave up after {attempts} attempts on a conflicting update")]
    Concurrency { attempts: u32 },

    #[error("workflow store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("stored workflow data is malformed: {0}")]
    Corrupt(String),
}

impl WorkflowError {
    pub fn workflow_not_found(id: Uuid) -> Self {
        Self::NotFound {
            resource: "Workflow",
            id: id.to_string(),
        }
    }

    pub fn execution_not_found(id: Uuid) -> Self {
        Self::NotFound {
            resource: "Execution",
            id: id.to_string(),
        }
    }

    pub fn validation_single(field: &str, message: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert(field.to_string(), vec![message.into()]);
        Self::Validation { details }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
