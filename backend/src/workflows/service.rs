// Workflow Service - Command and query layer over the workflow store

use chrono::Utc;
use salonflow_shared::{
    ActionConfig, ActionType, ScheduleRule, TargetAudience, TriggerCategory, TriggerConfig, TriggerType, Workflow,
    WorkflowExecutionRecord, WorkflowStats,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::errors::{WorkflowError, WorkflowResult};
use super::schedule::ScheduleClock;
use super::store::{ExecutionLog, SlotUpdate, StatusFilter, WorkflowQuery, WorkflowSort, WorkflowStore};
use crate::pagination::{PaginatedResponse, PaginationParams, WorkflowListParams, WORKFLOW_SORT_FIELDS};
use crate::validation::{validate_definition, ResolvedDefinition, Validated, Validator};

fn default_true() -> bool {
    true
}

/// Create/update request body. Codes are kept as strings so unknown values
/// come back as field errors instead of a body rejection.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    /// Staff member making the request
    pub staff_id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub trigger_category: Option<String>,
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    pub action_type: Option<String>,
    #[serde(default)]
    pub action_config: ActionConfig,
    #[serde(default)]
    pub target: TargetAudience,
}

pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    log: Arc<dyn ExecutionLog>,
    clock: ScheduleClock,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn WorkflowStore>, log: Arc<dyn ExecutionLog>, clock: ScheduleClock) -> Self {
        Self { store, log, clock }
    }

    pub async fn create(&self, shop_id: i64, definition: &WorkflowDefinition) -> WorkflowResult<Workflow> {
        let resolved = validate_definition(definition)?.into_inner();
        self.ensure_title_free(shop_id, &resolved.title, None).await?;

        let now = Utc::now();
        let mut workflow = Workflow {
            id: Uuid::new_v4(),
            shop_id,
            staff_id: resolved.staff_id,
            title: String::new(),
            description: None,
            is_active: false,
            trigger_category: resolved.trigger_category,
            trigger_type: resolved.trigger_type,
            trigger_config: TriggerConfig::default(),
            action_type: resolved.action_type,
            action_config: ActionConfig::default(),
            target: TargetAudience::default(),
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_executed_at: None,
            next_scheduled_at: None,
            created_at: now,
            modified_at: now,
            deleted_at: None,
        };
        apply(&mut workflow, resolved);
        workflow.next_scheduled_at = self.clock.initial_slot(&workflow, now);

        self.store.insert(&workflow).await?;
        info!(workflow_id = %workflow.id, shop_id, trigger_type = %workflow.trigger_type, "Workflow created");
        Ok(workflow)
    }

    /// Non-deleted workflow by id
    pub async fn get(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Workflow> {
        self.store
            .find_by_id(shop_id, id)
            .await?
            .filter(|w| !w.is_deleted())
            .ok_or_else(|| WorkflowError::workflow_not_found(id))
    }

    pub async fn update(&self, shop_id: i64, id: Uuid, definition: &WorkflowDefinition) -> WorkflowResult<Workflow> {
        let mut workflow = self.get(shop_id, id).await?;
        ensure_owner(&workflow, definition.staff_id)?;

        let resolved = validate_definition(definition)?.into_inner();
        if resolved.title != workflow.title {
            self.ensure_title_free(shop_id, &resolved.title, Some(id)).await?;
        }

        let before = schedule_key(&workflow);
        // Ownership stays with the creator
        let staff_id = workflow.staff_id;
        apply(&mut workflow, resolved);
        workflow.staff_id = staff_id;

        let now = Utc::now();
        let slot = if schedule_key(&workflow) != before {
            workflow.next_scheduled_at = self.clock.initial_slot(&workflow, now);
            SlotUpdate::Replace
        } else {
            SlotUpdate::Keep
        };
        workflow.modified_at = now;

        self.store.save_definition(&workflow, slot).await?;
        info!(workflow_id = %id, shop_id, "Workflow updated");
        Ok(workflow)
    }

    /// Deactivation clears the pending slot; reactivation schedules the next
    /// future one, so nothing missed while disabled is fired.
    pub async fn set_active(&self, shop_id: i64, id: Uuid, active: bool) -> WorkflowResult<Workflow> {
        let mut workflow = self.get(shop_id, id).await?;
        if workflow.is_active == active {
            return Ok(workflow);
        }

        let now = Utc::now();
        workflow.is_active = active;
        workflow.next_scheduled_at = self.clock.initial_slot(&workflow, now);
        workflow.modified_at = now;

        self.store.save_definition(&workflow, SlotUpdate::Replace).await?;
        info!(workflow_id = %id, shop_id, active, "Workflow activation changed");
        Ok(workflow)
    }

    pub async fn delete(&self, shop_id: i64, id: Uuid, staff_id: i64) -> WorkflowResult<()> {
        let workflow = self.get(shop_id, id).await?;
        ensure_owner(&workflow, staff_id)?;

        if !self.store.soft_delete(shop_id, id, Utc::now()).await? {
            return Err(WorkflowError::workflow_not_found(id));
        }
        info!(workflow_id = %id, shop_id, "Workflow deleted");
        Ok(())
    }

    pub async fn search(&self, shop_id: i64, params: &WorkflowListParams) -> WorkflowResult<PaginatedResponse<Workflow>> {
        let pagination = params.pagination();
        let query = parse_query(params, &pagination)?.into_inner();
        let (workflows, total) = self.store.search(shop_id, &query).await?;
        Ok(PaginatedResponse::new(workflows, &pagination, total))
    }

    pub async fn stats(&self, shop_id: i64) -> WorkflowResult<WorkflowStats> {
        self.store.stats(shop_id).await
    }

    pub async fn executions(
        &self,
        shop_id: i64,
        workflow_id: Uuid,
        pagination: &PaginationParams,
    ) -> WorkflowResult<PaginatedResponse<WorkflowExecutionRecord>> {
        self.get(shop_id, workflow_id).await?;
        let (records, total) = self
            .log
            .list_for_workflow(shop_id, workflow_id, pagination.offset(), pagination.limit())
            .await?;
        Ok(PaginatedResponse::new(records, pagination, total))
    }

    async fn ensure_title_free(&self, shop_id: i64, title: &str, exclude: Option<Uuid>) -> WorkflowResult<()> {
        if self.store.title_exists(shop_id, title, exclude).await? {
            return Err(WorkflowError::Conflict(format!(
                "A workflow titled '{}' already exists",
                title
            )));
        }
        Ok(())
    }
}

fn ensure_owner(workflow: &Workflow, staff_id: i64) -> WorkflowResult<()> {
    if workflow.is_owned_by(staff_id) {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(
            "Only the staff member who created this workflow can change it".to_string(),
        ))
    }
}

fn apply(workflow: &mut Workflow, resolved: ResolvedDefinition) {
    workflow.staff_id = resolved.staff_id;
    workflow.title = resolved.title;
    workflow.description = resolved.description;
    workflow.is_active = resolved.is_active;
    workflow.trigger_category = resolved.trigger_category;
    workflow.trigger_type = resolved.trigger_type;
    workflow.trigger_config = resolved.trigger_config;
    workflow.action_type = resolved.action_type;
    workflow.action_config = resolved.action_config;
    workflow.target = resolved.target;
}

/// Fields that decide when a workflow is next due
fn schedule_key(workflow: &Workflow) -> (bool, TriggerType, Option<ScheduleRule>) {
    (
        workflow.is_active,
        workflow.trigger_type,
        workflow.trigger_config.schedule.clone(),
    )
}

fn parse_filter<T, E: std::fmt::Display>(
    v: Validator,
    field: &str,
    raw: &Option<String>,
    parse: impl Fn(&str) -> Result<T, E>,
) -> (Validator, Option<T>) {
    match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => (v, None),
        Some(raw) => match parse(raw) {
            Ok(value) => (v, Some(value)),
            Err(e) => (v.error(field, &e.to_string()), None),
        },
    }
}

fn parse_query(params: &WorkflowListParams, pagination: &PaginationParams) -> WorkflowResult<Validated<WorkflowQuery>> {
    let (v, status) = parse_filter(Validator::new(), "status", &params.status, |raw| {
        match raw.to_lowercase().as_str() {
            "all" => Ok(StatusFilter::All),
            "active" => Ok(StatusFilter::Active),
            "inactive" => Ok(StatusFilter::Inactive),
            _ => Err("status must be one of: active, inactive, all"),
        }
    });
    let (v, trigger_category) =
        parse_filter(v, "trigger_category", &params.trigger_category, str::parse::<TriggerCategory>);
    let (v, trigger_type) = parse_filter(v, "trigger_type", &params.trigger_type, |raw| {
        TriggerType::parse_with_alias(raw).map(|(t, _)| t)
    });
    let (v, action_type) = parse_filter(v, "action_type", &params.action_type, str::parse::<ActionType>);

    let sort_field = pagination.validated_sort_field(WORKFLOW_SORT_FIELDS, "created_at");
    let query = WorkflowQuery {
        search: params.search_term(),
        status: status.unwrap_or_default(),
        trigger_category,
        trigger_type,
        action_type,
        sort: WorkflowSort::from_field(&sort_field),
        ascending: pagination.is_ascending(),
        offset: pagination.offset(),
        limit: pagination.limit(),
    };
    v.finish_with(query)
}
