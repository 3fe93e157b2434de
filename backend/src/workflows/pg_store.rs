// Postgres-backed workflow store, execution log and audience resolver

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use salonflow_shared::{
    ActionConfig, TargetAudience, TriggerConfig, TriggerType, Workflow, WorkflowExecutionRecord,
    WorkflowStats,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::errors::{WorkflowError, WorkflowResult};
use super::store::{
    AudienceCandidate, AudienceResolver, CooldownKey, CounterUpdate, ExecutionLog, SlotUpdate,
    StatusFilter, WorkflowQuery, WorkflowStore,
};
use super::triggers::{CustomerFacts, CustomerSegment};
use crate::database::{with_retry, RetryError};

const WORKFLOW_COLUMNS: &str = "id, shop_id, staff_id, title, description, is_active, \
    trigger_category, trigger_type, trigger_config, action_type, action_config, target, \
    execution_count, success_count, failure_count, last_executed_at, next_scheduled_at, \
    created_at, modified_at, deleted_at";

const EXECUTION_COLUMNS: &str = "id, shop_id, workflow_id, subject_id, trigger_type, action_type, \
    outcome, error_message, scheduled, requeued_from, fired_at";

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    shop_id: i64,
    staff_id: i64,
    title: String,
    description: Option<String>,
    is_active: bool,
    trigger_category: String,
    trigger_type: String,
    trigger_config: Json<TriggerConfig>,
    action_type: String,
    action_config: Json<ActionConfig>,
    target: Json<TargetAudience>,
    execution_count: i64,
    success_count: i64,
    failure_count: i64,
    last_executed_at: Option<DateTime<Utc>>,
    next_scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = WorkflowError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let corrupt = |e: salonflow_shared::ParseCodeError| {
            WorkflowError::Corrupt(format!("workflow {}: {}", row.id, e))
        };
        Ok(Workflow {
            id: row.id,
            shop_id: row.shop_id,
            staff_id: row.staff_id,
            trigger_category: row.trigger_category.parse().map_err(corrupt)?,
            trigger_type: row.trigger_type.parse().map_err(corrupt)?,
            action_type: row.action_type.parse().map_err(corrupt)?,
            title: row.title,
            description: row.description,
            is_active: row.is_active,
            trigger_config: row.trigger_config.0,
            action_config: row.action_config.0,
            target: row.target.0,
            execution_count: row.execution_count,
            success_count: row.success_count,
            failure_count: row.failure_count,
            last_executed_at: row.last_executed_at,
            next_scheduled_at: row.next_scheduled_at,
            created_at: row.created_at,
            modified_at: row.modified_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    shop_id: i64,
    workflow_id: Uuid,
    subject_id: i64,
    trigger_type: String,
    action_type: String,
    outcome: String,
    error_message: Option<String>,
    scheduled: bool,
    requeued_from: Option<Uuid>,
    fired_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for WorkflowExecutionRecord {
    type Error = WorkflowError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let corrupt = |e: salonflow_shared::ParseCodeError| {
            WorkflowError::Corrupt(format!("execution {}: {}", row.id, e))
        };
        Ok(WorkflowExecutionRecord {
            id: row.id,
            shop_id: row.shop_id,
            workflow_id: row.workflow_id,
            subject_id: row.subject_id,
            trigger_type: row.trigger_type.parse().map_err(corrupt)?,
            action_type: row.action_type.parse().map_err(corrupt)?,
            outcome: row.outcome.parse().map_err(corrupt)?,
            error_message: row.error_message,
            scheduled: row.scheduled,
            requeued_from: row.requeued_from,
            fired_at: row.fired_at,
        })
    }
}

fn into_workflows(rows: Vec<WorkflowRow>) -> WorkflowResult<Vec<Workflow>> {
    rows.into_iter().map(Workflow::try_from).collect()
}

fn from_retry(err: RetryError) -> WorkflowError {
    match err {
        RetryError::Exhausted { attempts } => WorkflowError::Concurrency { attempts },
        RetryError::Fatal(e) => WorkflowError::Store(e),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, shop_id: i64, query: &WorkflowQuery) {
    qb.push(" WHERE shop_id = ")
        .push_bind(shop_id)
        .push(" AND deleted_at IS NULL");

    match query.status {
        StatusFilter::All => {}
        StatusFilter::Active => {
            qb.push(" AND is_active");
        }
        StatusFilter::Inactive => {
            qb.push(" AND NOT is_active");
        }
    }

    if let Some(search) = &query.search {
        let term = format!("%{}%", search);
        qb.push(" AND (title ILIKE ")
            .push_bind(term.clone())
            .push(" OR description ILIKE ")
            .push_bind(term)
            .push(")");
    }
    if let Some(category) = query.trigger_category {
        qb.push(" AND trigger_category = ").push_bind(category.as_str());
    }
    if let Some(trigger_type) = query.trigger_type {
        qb.push(" AND trigger_type = ").push_bind(trigger_type.code());
    }
    if let Some(action_type) = query.action_type {
        qb.push(" AND action_type = ").push_bind(action_type.code());
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn insert(&self, w: &Workflow) -> WorkflowResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflows (
                id, shop_id, staff_id, title, description, is_active,
                trigger_category, trigger_type, trigger_config,
                action_type, action_config, target,
                next_scheduled_at, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(w.id)
        .bind(w.shop_id)
        .bind(w.staff_id)
        .bind(&w.title)
        .bind(&w.description)
        .bind(w.is_active)
        .bind(w.trigger_category.as_str())
        .bind(w.trigger_type.code())
        .bind(Json(&w.trigger_config))
        .bind(w.action_type.code())
        .bind(Json(&w.action_config))
        .bind(Json(&w.target))
        .bind(w.next_scheduled_at)
        .bind(w.created_at)
        .bind(w.modified_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(WorkflowError::Conflict(format!(
                "A workflow titled '{}' already exists",
                w.title
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {} FROM workflows WHERE id = $1 AND shop_id = $2",
            WORKFLOW_COLUMNS
        ))
        .bind(id)
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Workflow::try_from).transpose()
    }

    async fn title_exists(&self, shop_id: i64, title: &str, exclude: Option<Uuid>) -> WorkflowResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM workflows
                WHERE shop_id = $1 AND title = $2 AND deleted_at IS NULL
                  AND ($3::uuid IS NULL OR id <> $3)
            )
            "#,
        )
        .bind(shop_id)
        .bind(title)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn save_definition(&self, w: &Workflow, slot: SlotUpdate) -> WorkflowResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflows SET
                title = $3, description = $4, is_active = $5,
                trigger_category = $6, trigger_type = $7, trigger_config = $8,
                action_type = $9, action_config = $10, target = $11,
                next_scheduled_at = CASE WHEN $14 THEN $12 ELSE next_scheduled_at END,
                modified_at = $13
            WHERE id = $1 AND shop_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(w.id)
        .bind(w.shop_id)
        .bind(&w.title)
        .bind(&w.description)
        .bind(w.is_active)
        .bind(w.trigger_category.as_str())
        .bind(w.trigger_type.code())
        .bind(Json(&w.trigger_config))
        .bind(w.action_type.code())
        .bind(Json(&w.action_config))
        .bind(Json(&w.target))
        .bind(w.next_scheduled_at)
        .bind(w.modified_at)
        .bind(slot == SlotUpdate::Replace)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(WorkflowError::workflow_not_found(w.id)),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(WorkflowError::Conflict(format!(
                "A workflow titled '{}' already exists",
                w.title
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn soft_delete(&self, shop_id: i64, id: Uuid, at: DateTime<Utc>) -> WorkflowResult<bool> {
        let done = sqlx::query(
            r#"
            UPDATE workflows
            SET deleted_at = $3, is_active = FALSE, next_scheduled_at = NULL, modified_at = $3
            WHERE id = $1 AND shop_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(shop_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn search(&self, shop_id: i64, query: &WorkflowQuery) -> WorkflowResult<(Vec<Workflow>, i64)> {
        let mut count_builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM workflows");
        push_filters(&mut count_builder, shop_id, query);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut list_builder = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM workflows", WORKFLOW_COLUMNS));
        push_filters(&mut list_builder, shop_id, query);
        list_builder
            .push(" ORDER BY ")
            .push(query.sort.column())
            .push(if query.ascending { " ASC" } else { " DESC" })
            .push(", id LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let rows: Vec<WorkflowRow> = list_builder.build_query_as().fetch_all(&self.pool).await?;
        Ok((into_workflows(rows)?, total))
    }

    async fn stats(&self, shop_id: i64) -> WorkflowResult<WorkflowStats> {
        let (total, active, executions, successes, failures): (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE is_active),
                COALESCE(SUM(execution_count), 0)::BIGINT,
                COALESCE(SUM(success_count), 0)::BIGINT,
                COALESCE(SUM(failure_count), 0)::BIGINT
            FROM workflows
            WHERE shop_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(WorkflowStats {
            total_workflows: total,
            active_workflows: active,
            inactive_workflows: total - active,
            total_executions: executions,
            total_successes: successes,
            total_failures: failures,
            success_rate: 0.0,
        }
        .with_success_rate())
    }

    async fn list_eligible(&self, shop_id: i64, trigger_type: TriggerType) -> WorkflowResult<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM workflows
            WHERE shop_id = $1 AND trigger_type = $2 AND is_active AND deleted_at IS NULL
            ORDER BY created_at
            "#,
            WORKFLOW_COLUMNS
        ))
        .bind(shop_id)
        .bind(trigger_type.code())
        .fetch_all(&self.pool)
        .await?;
        into_workflows(rows)
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> WorkflowResult<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM workflows
            WHERE next_scheduled_at <= $1
              AND is_active AND deleted_at IS NULL
              AND trigger_category IN ('periodic', 'special')
            ORDER BY next_scheduled_at
            LIMIT $2
            "#,
            WORKFLOW_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_workflows(rows)
    }

    async fn claim_slot(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> WorkflowResult<bool> {
        let done = with_retry(|| {
            sqlx::query(
                r#"
                UPDATE workflows SET next_scheduled_at = $3
                WHERE id = $1 AND next_scheduled_at = $2
                  AND is_active AND deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(expected)
            .bind(next)
            .execute(&self.pool)
        })
        .await
        .map_err(from_retry)?;
        Ok(done.rows_affected() == 1)
    }

    async fn record_outcome(&self, id: Uuid, update: CounterUpdate, at: DateTime<Utc>) -> WorkflowResult<()> {
        let (success, failure) = match update {
            CounterUpdate::Success => (1_i64, 0_i64),
            CounterUpdate::Failure => (0, 1),
        };
        let done = with_retry(|| {
            sqlx::query(
                r#"
                UPDATE workflows SET
                    execution_count = execution_count + 1,
                    success_count = success_count + $2,
                    failure_count = failure_count + $3,
                    last_executed_at = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(success)
            .bind(failure)
            .bind(at)
            .execute(&self.pool)
        })
        .await
        .map_err(from_retry)?;

        if done.rows_affected() == 0 {
            return Err(WorkflowError::workflow_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionLog for PgWorkflowStore {
    async fn append(&self, r: &WorkflowExecutionRecord) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, shop_id, workflow_id, subject_id, trigger_type, action_type,
                outcome, error_message, scheduled, requeued_from, fired_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(r.id)
        .bind(r.shop_id)
        .bind(r.workflow_id)
        .bind(r.subject_id)
        .bind(r.trigger_type.code())
        .bind(r.action_type.code())
        .bind(r.outcome.as_str())
        .bind(&r.error_message)
        .bind(r.scheduled)
        .bind(r.requeued_from)
        .bind(r.fired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, shop_id: i64, id: Uuid) -> WorkflowResult<Option<WorkflowExecutionRecord>> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM workflow_executions WHERE id = $1 AND shop_id = $2",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkflowExecutionRecord::try_from).transpose()
    }

    async fn last_executed_at(&self, key: &CooldownKey) -> WorkflowResult<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(fired_at) FROM workflow_executions
            WHERE shop_id = $1 AND subject_id = $2
              AND (
                (workflow_id = $3 AND outcome <> 'skipped-cooldown')
                OR (trigger_type = $4 AND outcome = 'success')
              )
            "#,
        )
        .bind(key.shop_id)
        .bind(key.subject_id)
        .bind(key.workflow_id)
        .bind(key.trigger_type.code())
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn has_succeeded(&self, workflow_id: Uuid, subject_id: i64) -> WorkflowResult<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM workflow_executions
                WHERE workflow_id = $1 AND subject_id = $2 AND outcome = 'success'
            )
            "#,
        )
        .bind(workflow_id)
        .bind(subject_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn list_for_workflow(
        &self,
        shop_id: i64,
        workflow_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> WorkflowResult<(Vec<WorkflowExecutionRecord>, i64)> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_executions WHERE shop_id = $1 AND workflow_id = $2",
        )
        .bind(shop_id)
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM workflow_executions
            WHERE shop_id = $1 AND workflow_id = $2
            ORDER BY fired_at DESC
            LIMIT $3 OFFSET $4
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(shop_id)
        .bind(workflow_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(WorkflowExecutionRecord::try_from)
            .collect::<WorkflowResult<Vec<_>>>()?;
        Ok((records, total))
    }
}

#[derive(Debug, FromRow)]
struct CustomerFactsRow {
    customer_id: i64,
    grade_id: Option<i64>,
    tag_ids: Vec<i64>,
    segment: Option<String>,
    registered_on: Option<NaiveDate>,
    birthday: Option<NaiveDate>,
    first_visit_on: Option<NaiveDate>,
    last_visit_on: Option<NaiveDate>,
    visit_count: i32,
    total_revenue: Decimal,
    treatment_id: Option<String>,
    treatment_on: Option<NaiveDate>,
    churn_risk_score: Option<i32>,
    last_message_at: Option<DateTime<Utc>>,
}

fn parse_segment(raw: &str) -> Option<CustomerSegment> {
    match raw {
        "new" => Some(CustomerSegment::New),
        "growing" => Some(CustomerSegment::Growing),
        "loyal" => Some(CustomerSegment::Loyal),
        "vip" => Some(CustomerSegment::Vip),
        "dormant" => Some(CustomerSegment::Dormant),
        _ => None,
    }
}

impl From<CustomerFactsRow> for AudienceCandidate {
    fn from(row: CustomerFactsRow) -> Self {
        AudienceCandidate {
            subject_id: row.customer_id,
            facts: CustomerFacts {
                grade_id: row.grade_id,
                tag_ids: row.tag_ids,
                segment: row.segment.as_deref().and_then(parse_segment),
                registered_on: row.registered_on,
                birthday: row.birthday,
                first_visit_on: row.first_visit_on,
                last_visit_on: row.last_visit_on,
                visit_count: row.visit_count,
                total_revenue: row.total_revenue,
                treatment_id: row.treatment_id,
                treatment_on: row.treatment_on,
                churn_risk_score: row.churn_risk_score,
                last_message_at: row.last_message_at,
            },
        }
    }
}

/// Reads candidates from the `customer_facts` table the customer system maintains.
#[derive(Clone)]
pub struct PgAudienceResolver {
    pool: PgPool,
}

impl PgAudienceResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AudienceResolver for PgAudienceResolver {
    async fn candidates(&self, shop_id: i64, trigger_type: TriggerType) -> WorkflowResult<Vec<AudienceCandidate>> {
        // Cheap prefilters; the trigger predicate still decides
        let prefilter = match trigger_type {
            TriggerType::Birthday => " AND birthday IS NOT NULL",
            TriggerType::FirstVisitAnniversary | TriggerType::FirstVisitDaysAfter => {
                " AND first_visit_on IS NOT NULL"
            }
            TriggerType::VisitCycle | TriggerType::SpecificTreatment => " AND last_visit_on IS NOT NULL",
            _ => "",
        };

        let rows: Vec<CustomerFactsRow> = sqlx::query_as(&format!(
            r#"
            SELECT customer_id, grade_id, tag_ids, segment, registered_on, birthday,
                   first_visit_on, last_visit_on, visit_count, total_revenue,
                   treatment_id, treatment_on, churn_risk_score, last_message_at
            FROM customer_facts
            WHERE shop_id = $1{}
            ORDER BY customer_id
            "#,
            prefilter
        ))
        .bind(shop_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AudienceCandidate::from).collect())
    }
}
