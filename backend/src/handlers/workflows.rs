//! Workflow Handlers
//!
//! Shop-scoped endpoints for defining workflows, raising trigger events and
//! retrying failed executions.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use salonflow_shared::{TriggerType, Workflow, WorkflowExecutionRecord, WorkflowStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::pagination::{PageQuery, WorkflowListParams};
use crate::workflows::{CustomerFacts, EventSource, TriggerEvent, WorkflowDefinition};
use crate::{ApiError, ApiResult, AppState, PaginatedResponse};

// ==================== Structs ====================

#[derive(Debug, Deserialize)]
pub struct DeleteWorkflowQuery {
    pub staff_id: i64,
}

/// Event raised by the customer system or an operator
#[derive(Debug, Deserialize)]
pub struct RaiseEventRequest {
    pub trigger_type: String,
    pub subject_id: i64,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: CustomerFacts,
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub event_id: Uuid,
    pub trigger_type: TriggerType,
    pub executions: Vec<WorkflowExecutionRecord>,
}

// ==================== Routes ====================

/// Routes nested under `/api/v1/shops/:shop_id`
pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/stats", get(workflow_stats))
        .route(
            "/workflows/:id",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/workflows/:id/activate", post(activate_workflow))
        .route("/workflows/:id/deactivate", post(deactivate_workflow))
        .route("/workflows/:id/executions", get(list_executions))
        .route("/events", post(raise_event))
        .route("/executions/:id/requeue", post(requeue_execution))
}

// ==================== Handlers ====================

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Path(shop_id): Path<i64>,
    Query(params): Query<WorkflowListParams>,
) -> ApiResult<Json<PaginatedResponse<Workflow>>> {
    let page = state.service.search(shop_id, &params).await?;
    Ok(Json(page))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Path(shop_id): Path<i64>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let workflow = state.service.create(shop_id, &definition).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn workflow_stats(
    State(state): State<Arc<AppState>>,
    Path(shop_id): Path<i64>,
) -> ApiResult<Json<WorkflowStats>> {
    Ok(Json(state.service.stats(shop_id).await?))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.service.get(shop_id, id).await?))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.service.update(shop_id, id, &definition).await?))
}

async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
    Query(query): Query<DeleteWorkflowQuery>,
) -> ApiResult<StatusCode> {
    state.service.delete(shop_id, id, query.staff_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_workflow(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.service.set_active(shop_id, id, true).await?))
}

async fn deactivate_workflow(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.service.set_active(shop_id, id, false).await?))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<PaginatedResponse<WorkflowExecutionRecord>>> {
    let records = state
        .service
        .executions(shop_id, id, &page.pagination())
        .await?;
    Ok(Json(records))
}

async fn raise_event(
    State(state): State<Arc<AppState>>,
    Path(shop_id): Path<i64>,
    Json(request): Json<RaiseEventRequest>,
) -> ApiResult<Json<EventResponse>> {
    // Inactivity alias days only mean something on a workflow definition
    let (trigger_type, _) = TriggerType::parse_with_alias(&request.trigger_type)
        .map_err(|e| ApiError::validation_single("trigger_type", e.to_string()))?;

    let mut event = TriggerEvent::new(
        shop_id,
        request.subject_id,
        trigger_type,
        request.payload,
        EventSource::Api,
    );
    if let Some(timestamp) = request.timestamp {
        event = event.with_timestamp(timestamp);
    }
    if let Some(correlation_id) = request.correlation_id {
        event = event.with_correlation_id(correlation_id);
    }

    tracing::debug!(shop_id, event_id = %event.event_id, "Evaluating {} event", trigger_type);
    let executions = state.engine.evaluate(&event).await?;

    Ok(Json(EventResponse {
        event_id: event.event_id,
        trigger_type,
        executions,
    }))
}

async fn requeue_execution(
    State(state): State<Arc<AppState>>,
    Path((shop_id, id)): Path<(i64, Uuid)>,
) -> ApiResult<Json<WorkflowExecutionRecord>> {
    Ok(Json(state.engine.requeue(shop_id, id).await?))
}
