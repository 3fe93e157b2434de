// Workflow Store - Persistence ports and the in-memory implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salonflow_shared::{
    ActionType, ExecutionOutcome, TriggerCategory, TriggerType, Workflow, WorkflowExecutionRecord, WorkflowStats,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::errors::{WorkflowError, WorkflowResult};
use super::triggers::CustomerFacts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowSort {
    Title,
    #[default]
    CreatedAt,
    ModifiedAt,
    ExecutionCount,
}

impl WorkflowSort {
    pub fn from_field(field: &str) -> Self {
        match field {
            "title" => Self::Title,
            "modified_at" => Self::ModifiedAt,
            "execution_count" => Self::ExecutionCount,
            _ => Self::CreatedAt,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::CreatedAt => "created_at",
            Self::ModifiedAt => "modified_at",
            Self::ExecutionCount => "execution_count",
        }
    }
}

/// Filters for listing a shop's workflows. Deleted workflows never match.
#[derive(Debug, Clone)]
pub struct WorkflowQuery {
    pub search: Option<String>,
    pub status: StatusFilter,
    pub trigger_category: Option<TriggerCategory>,
    pub trigger_type: Option<TriggerType>,
    pub action_type: Option<ActionType>,
    pub sort: WorkflowSort,
    pub ascending: bool,
    pub offset: i64,
    pub limit: i64,
}

impl Default for WorkflowQuery {
    fn default() -> Self {
        Self {
            search: None,
            status: StatusFilter::All,
            trigger_category: None,
            trigger_type: None,
            action_type: None,
            sort: WorkflowSort::CreatedAt,
            ascending: false,
            offset: 0,
            limit: 25,
        }
    }
}

/// Which counter accompanies the execution count increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    Success,
    Failure,
}

/// Whether a definition save also writes `next_scheduled_at`.
///
/// `Keep` leaves the stored slot alone so a save never undoes a slot a
/// concurrent tick has just claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotUpdate {
    Keep,
    Replace,
}

/// Executions that can hold a subject inside a workflow's cooldown window.
///
/// The workflow's own success or failure counts, and so does a success of
/// any other workflow with the same trigger type in the shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownKey {
    pub shop_id: i64,
    pub workflow_id: Uuid,
    pub trigger_type: TriggerType,
    pub subject_id: i64,
}

impl CooldownKey {
    pub fn new(workflow: &Workflow, subject_id: i64) -> Self {
        Self {
            shop_id: workflow.shop_id,
            workflow_id: workflow.id,
            trigger_type: workflow.trigger_type,
            subject_id,
        }
    }

    fn covers(&self, record: &WorkflowExecutionRecord) -> bool {
        if record.shop_id != self.shop_id || record.subject_id != self.subject_id {
            return false;
        }
        if record.workflow_id == self.workflow_id {
            record.outcome.was_executed()
        } else {
            record.trigger_type == self.trigger_type && record.outcome == ExecutionOutcome::Success
        }
    }
}

/// Customer considered by a scheduled pass
#[derive(Debug, Clone, PartialEq)]
pub struct AudienceCandidate {
    pub subject_id: i64,
    pub facts: CustomerFacts,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert(&self, workflow: &Workflow) -> WorkflowResult<()>;

    /// Includes soft-deleted workflows; callers decide what deleted means.
    async fn find_by_id(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Option<Workflow>>;

    /// Whether a non-deleted workflow in the shop already uses `title`
    async fn title_exists(&self, shop_id: i64, title: &str, exclude: Option<Uuid>) -> WorkflowResult<bool>;

    /// Persists definition fields and activation, plus the schedule slot when
    /// `slot` is `Replace`. Counters are left untouched.
    async fn save_definition(&self, workflow: &Workflow, slot: SlotUpdate) -> WorkflowResult<()>;

    async fn soft_delete(&self, shop_id: i64, id: Uuid, at: DateTime<Utc>) -> WorkflowResult<bool>;

    async fn search(&self, shop_id: i64, query: &WorkflowQuery) -> WorkflowResult<(Vec<Workflow>, i64)>;

    async fn stats(&self, shop_id: i64) -> WorkflowResult<WorkflowStats>;

    /// Active, non-deleted workflows of a shop with the given trigger type
    async fn list_eligible(&self, shop_id: i64, trigger_type: TriggerType) -> WorkflowResult<Vec<Workflow>>;

    /// Eligible scheduled workflows whose slot is at or before `now`, oldest first
    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Workflow>>;

    /// Moves `next_scheduled_at` from `expected` to `next` if nobody else has.
    /// Returns false when the slot was already claimed or the workflow is no
    /// longer eligible.
    async fn claim_slot(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> WorkflowResult<bool>;

    /// Single atomic increment of `execution_count` plus one outcome counter.
    async fn record_outcome(&self, id: Uuid, update: CounterUpdate, at: DateTime<Utc>) -> WorkflowResult<()>;
}

#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn append(&self, record: &WorkflowExecutionRecord) -> WorkflowResult<()>;

    async fn find(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Option<WorkflowExecutionRecord>>;

    /// Latest execution covered by `key`. Cooldown skips are ignored.
    async fn last_executed_at(&self, key: &CooldownKey) -> WorkflowResult<Option<DateTime<Utc>>>;

    /// Whether the workflow ever succeeded for the subject
    async fn has_succeeded(&self, workflow_id: Uuid, subject_id: i64) -> WorkflowResult<bool>;

    async fn list_for_workflow(
        &self,
        shop_id: i64,
        workflow_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> WorkflowResult<(Vec<WorkflowExecutionRecord>, i64)>;
}

/// Source of customers for scheduled passes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudienceResolver: Send + Sync {
    async fn candidates(&self, shop_id: i64, trigger_type: TriggerType) -> WorkflowResult<Vec<AudienceCandidate>>;
}

#[cfg(test)]
fn injected_failure(id: Uuid) -> WorkflowError {
    WorkflowError::Store(sqlx::Error::Protocol(format!("injected failure for workflow {}", id)))
}

/// Store kept entirely in memory; used by tests and local runs without Postgres.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    executions: RwLock<Vec<WorkflowExecutionRecord>>,
    #[cfg(test)]
    failing: std::sync::Mutex<std::collections::HashSet<Uuid>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every counter update for `id` fail
    #[cfg(test)]
    pub fn fail_writes_for(&self, id: Uuid) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(id);
        }
    }

    #[cfg(test)]
    fn should_fail(&self, id: Uuid) -> bool {
        self.failing.lock().map(|f| f.contains(&id)).unwrap_or(false)
    }

    pub async fn executions(&self) -> Vec<WorkflowExecutionRecord> {
        self.executions.read().await.clone()
    }
}

fn compare(a: &Workflow, b: &Workflow, sort: WorkflowSort) -> Ordering {
    match sort {
        WorkflowSort::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        WorkflowSort::CreatedAt => a.created_at.cmp(&b.created_at),
        WorkflowSort::ModifiedAt => a.modified_at.cmp(&b.modified_at),
        WorkflowSort::ExecutionCount => a.execution_count.cmp(&b.execution_count),
    }
}

fn query_matches(workflow: &Workflow, query: &WorkflowQuery) -> bool {
    if workflow.is_deleted() {
        return false;
    }
    let status_ok = match query.status {
        StatusFilter::All => true,
        StatusFilter::Active => workflow.is_active,
        StatusFilter::Inactive => !workflow.is_active,
    };
    let text_ok = query.search.as_deref().is_none_or(|needle| {
        let needle = needle.to_lowercase();
        workflow.title.to_lowercase().contains(&needle)
            || workflow
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle))
    });

    status_ok
        && text_ok
        && query.trigger_category.is_none_or(|c| workflow.trigger_category == c)
        && query.trigger_type.is_none_or(|t| workflow.trigger_type == t)
        && query.action_type.is_none_or(|a| workflow.action_type == a)
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.values().any(|w| {
            w.shop_id == workflow.shop_id && !w.is_deleted() && w.title == workflow.title
        }) {
            return Err(WorkflowError::Conflict(format!(
                "A workflow titled '{}' already exists",
                workflow.title
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn find_by_id(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Option<Workflow>> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id).filter(|w| w.shop_id == shop_id).cloned())
    }

    async fn title_exists(&self, shop_id: i64, title: &str, exclude: Option<Uuid>) -> WorkflowResult<bool> {
        let workflows = self.workflows.read().await;
        Ok(workflows.values().any(|w| {
            w.shop_id == shop_id && !w.is_deleted() && w.title == title && Some(w.id) != exclude
        }))
    }

    async fn save_definition(&self, workflow: &Workflow, slot: SlotUpdate) -> WorkflowResult<()> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows
            .get_mut(&workflow.id)
            .filter(|w| w.shop_id == workflow.shop_id && !w.is_deleted())
            .ok_or_else(|| WorkflowError::workflow_not_found(workflow.id))?;

        stored.title = workflow.title.clone();
        stored.description = workflow.description.clone();
        stored.is_active = workflow.is_active;
        stored.trigger_category = workflow.trigger_category;
        stored.trigger_type = workflow.trigger_type;
        stored.trigger_config = workflow.trigger_config.clone();
        stored.action_type = workflow.action_type;
        stored.action_config = workflow.action_config.clone();
        stored.target = workflow.target.clone();
        if slot == SlotUpdate::Replace {
            stored.next_scheduled_at = workflow.next_scheduled_at;
        }
        stored.modified_at = workflow.modified_at;
        Ok(())
    }

    async fn soft_delete(&self, shop_id: i64, id: Uuid, at: DateTime<Utc>) -> WorkflowResult<bool> {
        let mut workflows = self.workflows.write().await;
        match workflows
            .get_mut(&id)
            .filter(|w| w.shop_id == shop_id && !w.is_deleted())
        {
            Some(w) => {
                w.deleted_at = Some(at);
                w.is_active = false;
                w.next_scheduled_at = None;
                w.modified_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search(&self, shop_id: i64, query: &WorkflowQuery) -> WorkflowResult<(Vec<Workflow>, i64)> {
        let workflows = self.workflows.read().await;
        let mut matched: Vec<Workflow> = workflows
            .values()
            .filter(|w| w.shop_id == shop_id && query_matches(w, query))
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            let ord = compare(a, b, query.sort).then_with(|| a.id.cmp(&b.id));
            if query.ascending { ord } else { ord.reverse() }
        });

        let total = matched.len() as i64;
        let page = matched
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn stats(&self, shop_id: i64) -> WorkflowResult<WorkflowStats> {
        let workflows = self.workflows.read().await;
        let stats = workflows
            .values()
            .filter(|w| w.shop_id == shop_id && !w.is_deleted())
            .fold(WorkflowStats::default(), |mut s, w| {
                s.total_workflows += 1;
                if w.is_active {
                    s.active_workflows += 1;
                } else {
                    s.inactive_workflows += 1;
                }
                s.total_executions += w.execution_count;
                s.total_successes += w.success_count;
                s.total_failures += w.failure_count;
                s
            });
        Ok(stats.with_success_rate())
    }

    async fn list_eligible(&self, shop_id: i64, trigger_type: TriggerType) -> WorkflowResult<Vec<Workflow>> {
        let workflows = self.workflows.read().await;
        let mut eligible: Vec<Workflow> = workflows
            .values()
            .filter(|w| w.shop_id == shop_id && w.trigger_type == trigger_type && w.can_execute())
            .cloned()
            .collect();
        eligible.sort_by_key(|w| w.created_at);
        Ok(eligible)
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Workflow>> {
        let workflows = self.workflows.read().await;
        let mut due: Vec<Workflow> = workflows
            .values()
            .filter(|w| w.trigger_category.is_scheduled() && w.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|w| w.next_scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_slot(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> WorkflowResult<bool> {
        let mut workflows = self.workflows.write().await;
        match workflows.get_mut(&id) {
            Some(w) if w.can_execute() && w.next_scheduled_at == Some(expected) => {
                w.next_scheduled_at = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(&self, id: Uuid, update: CounterUpdate, at: DateTime<Utc>) -> WorkflowResult<()> {
        #[cfg(test)]
        if self.should_fail(id) {
            return Err(injected_failure(id));
        }
        let mut workflows = self.workflows.write().await;
        let w = workflows
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::workflow_not_found(id))?;

        w.execution_count += 1;
        match update {
            CounterUpdate::Success => w.success_count += 1,
            CounterUpdate::Failure => w.failure_count += 1,
        }
        w.last_executed_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl ExecutionLog for InMemoryWorkflowStore {
    async fn append(&self, record: &WorkflowExecutionRecord) -> WorkflowResult<()> {
        self.executions.write().await.push(record.clone());
        Ok(())
    }

    async fn find(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Option<WorkflowExecutionRecord>> {
        let executions = self.executions.read().await;
        Ok(executions
            .iter()
            .find(|r| r.id == id && r.shop_id == shop_id)
            .cloned())
    }

    async fn last_executed_at(&self, key: &CooldownKey) -> WorkflowResult<Option<DateTime<Utc>>> {
        let executions = self.executions.read().await;
        Ok(executions
            .iter()
            .filter(|r| key.covers(r))
            .map(|r| r.fired_at)
            .max())
    }

    async fn has_succeeded(&self, workflow_id: Uuid, subject_id: i64) -> WorkflowResult<bool> {
        let executions = self.executions.read().await;
        Ok(executions.iter().any(|r| {
            r.workflow_id == workflow_id
                && r.subject_id == subject_id
                && r.outcome == ExecutionOutcome::Success
        }))
    }

    async fn list_for_workflow(
        &self,
        shop_id: i64,
        workflow_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> WorkflowResult<(Vec<WorkflowExecutionRecord>, i64)> {
        let executions = self.executions.read().await;
        let mut matched: Vec<WorkflowExecutionRecord> = executions
            .iter()
            .filter(|r| r.shop_id == shop_id && r.workflow_id == workflow_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));

        let total = matched.len() as i64;
        let page = matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }
}

/// Audience seeded up front, keyed by shop
#[derive(Default)]
pub struct InMemoryAudience {
    candidates: RwLock<HashMap<i64, Vec<AudienceCandidate>>>,
}

impl InMemoryAudience {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, shop_id: i64, subject_id: i64, facts: CustomerFacts) {
        self.candidates
            .write()
            .await
            .entry(shop_id)
            .or_default()
            .push(AudienceCandidate { subject_id, facts });
    }
}

#[async_trait]
impl AudienceResolver for InMemoryAudience {
    async fn candidates(&self, shop_id: i64, _trigger_type: TriggerType) -> WorkflowResult<Vec<AudienceCandidate>> {
        Ok(self
            .candidates
            .read()
            .await
            .get(&shop_id)
            .cloned()
            .unwrap_or_default())
    }
}
