// Workflow Engine - Event evaluation, scheduled ticks and operator requeues

use chrono::{DateTime, Utc};
use futures::future::join_all;
use salonflow_shared::{ExecutionOutcome, Workflow, WorkflowExecutionRecord};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::ActionDispatcher;
use super::conditions::{audience_admits, TriggerRegistry};
use super::errors::{WorkflowError, WorkflowResult};
use super::executor::{ExecutionContext, WorkflowExecutor};
use super::schedule::ScheduleClock;
use super::store::{AudienceResolver, ExecutionLog, WorkflowStore};
use super::triggers::{CustomerFacts, EventSource, TriggerEvent};
use crate::config::WorkflowConfig;

/// Summary of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Slots claimed and processed
    pub slots_fired: usize,
    /// Due slots another tick claimed first
    pub slots_lost: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Workflows abandoned because of store errors
    pub errors: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.slots_fired += other.slots_fired;
        self.slots_lost += other.slots_lost;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    fn count(&mut self, record: &WorkflowExecutionRecord) {
        match record.outcome {
            ExecutionOutcome::Success => self.succeeded += 1,
            ExecutionOutcome::Failure => self.failed += 1,
            ExecutionOutcome::SkippedCooldown => self.skipped += 1,
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    log: Arc<dyn ExecutionLog>,
    audience: Arc<dyn AudienceResolver>,
    triggers: TriggerRegistry,
    clock: ScheduleClock,
    executor: WorkflowExecutor,
    tick_batch: i64,
    shop_locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        log: Arc<dyn ExecutionLog>,
        audience: Arc<dyn AudienceResolver>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: &WorkflowConfig,
    ) -> Self {
        let executor = WorkflowExecutor::new(store.clone(), log.clone(), dispatcher, config);

        Self {
            store,
            log,
            audience,
            triggers: TriggerRegistry::standard(config.timezone),
            clock: ScheduleClock::new(config.timezone, config.default_run_time),
            executor,
            tick_batch: config.tick_batch,
            shop_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Slot calculator shared with the service layer
    pub fn clock(&self) -> ScheduleClock {
        self.clock
    }

    /// Evaluations for one shop run one at a time
    fn shop_lock(&self, shop_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self
            .shop_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(shop_id).or_default().clone()
    }

    /// Match an inbound event against the shop's eligible workflows and run
    /// every match. One workflow failing never stops the others.
    pub async fn evaluate(&self, event: &TriggerEvent) -> WorkflowResult<Vec<WorkflowExecutionRecord>> {
        let lock = self.shop_lock(event.shop_id);
        let _guard = lock.lock().await;

        let workflows = self
            .store
            .list_eligible(event.shop_id, event.trigger_type)
            .await?;

        debug!(
            event_id = %event.event_id,
            shop_id = event.shop_id,
            trigger_type = %event.trigger_type,
            candidates = workflows.len(),
            "Evaluating event"
        );

        let ctx = ExecutionContext::at(Utc::now());
        let mut records = Vec::new();
        for workflow in &workflows {
            if let Some(record) = self.run_if_matched(workflow, event, ctx).await {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn run_if_matched(
        &self,
        workflow: &Workflow,
        event: &TriggerEvent,
        ctx: ExecutionContext,
    ) -> Option<WorkflowExecutionRecord> {
        if !self.triggers.matches(workflow, event) {
            return None;
        }
        let today = self.triggers.today(event.timestamp);
        if !audience_admits(&workflow.target, &event.payload, event.timestamp, today) {
            debug!(workflow_id = %workflow.id, subject_id = event.subject_id, "Subject outside target audience");
            return None;
        }
        if workflow.trigger_type.fires_once_per_subject() {
            match self.log.has_succeeded(workflow.id, event.subject_id).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!(workflow_id = %workflow.id, subject_id = event.subject_id, "Milestone already rewarded");
                    return None;
                }
                Err(e) => {
                    error!(workflow_id = %workflow.id, "Failed to check milestone history: {}", e);
                    return None;
                }
            }
        }

        match self.executor.execute(workflow, event, ctx).await {
            Ok(record) => Some(record),
            Err(e) => {
                error!(
                    workflow_id = %workflow.id,
                    subject_id = event.subject_id,
                    "Error executing workflow: {}",
                    e
                );
                None
            }
        }
    }

    /// Fire every scheduled workflow whose slot has come up. Shops run
    /// concurrently; within a shop workflows run in slot order.
    pub async fn tick(&self, now: DateTime<Utc>) -> WorkflowResult<TickReport> {
        let due = self.store.list_due(now, self.tick_batch).await?;
        if due.is_empty() {
            return Ok(TickReport::default());
        }

        let mut by_shop: HashMap<i64, Vec<Workflow>> = HashMap::new();
        for workflow in due {
            by_shop.entry(workflow.shop_id).or_default().push(workflow);
        }

        let reports = join_all(
            by_shop
                .into_iter()
                .map(|(shop_id, workflows)| self.tick_shop(shop_id, workflows, now)),
        )
        .await;

        let mut report = TickReport::default();
        for shop_report in reports {
            report.absorb(shop_report);
        }

        info!(
            slots_fired = report.slots_fired,
            slots_lost = report.slots_lost,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            "Workflow tick completed"
        );
        Ok(report)
    }

    async fn tick_shop(&self, shop_id: i64, workflows: Vec<Workflow>, now: DateTime<Utc>) -> TickReport {
        let lock = self.shop_lock(shop_id);
        let _guard = lock.lock().await;

        let ctx = ExecutionContext::at(now);
        let mut report = TickReport::default();

        for workflow in workflows {
            let Some(expected) = workflow.next_scheduled_at else {
                continue;
            };
            let next = self.clock.next_after(&self.clock.rule_for(&workflow), now);

            match self.store.claim_slot(workflow.id, expected, next).await {
                Ok(true) => report.slots_fired += 1,
                Ok(false) => {
                    debug!(workflow_id = %workflow.id, "Slot already claimed or workflow disabled");
                    report.slots_lost += 1;
                    continue;
                }
                Err(e) => {
                    error!(workflow_id = %workflow.id, "Failed to claim schedule slot: {}", e);
                    report.errors += 1;
                    continue;
                }
            }

            let candidates = match self.audience.candidates(shop_id, workflow.trigger_type).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!(workflow_id = %workflow.id, "Failed to resolve audience: {}", e);
                    report.errors += 1;
                    continue;
                }
            };

            for candidate in candidates {
                let event = TriggerEvent::scheduled(
                    shop_id,
                    candidate.subject_id,
                    workflow.trigger_type,
                    candidate.facts,
                    now,
                );
                if let Some(record) = self.run_if_matched(&workflow, &event, ctx).await {
                    report.count(&record);
                }
            }
        }

        report
    }

    /// Re-run a failed execution for the same customer, ignoring cooldown.
    pub async fn requeue(&self, shop_id: i64, execution_id: Uuid) -> WorkflowResult<WorkflowExecutionRecord> {
        let lock = self.shop_lock(shop_id);
        let _guard = lock.lock().await;

        let original = self
            .log
            .find(shop_id, execution_id)
            .await?
            .ok_or_else(|| WorkflowError::execution_not_found(execution_id))?;

        if original.outcome != ExecutionOutcome::Failure {
            return Err(WorkflowError::Conflict(format!(
                "Only failed executions can be requeued; execution {} is {}",
                execution_id, original.outcome
            )));
        }

        let workflow = self
            .store
            .find_by_id(shop_id, original.workflow_id)
            .await?
            .filter(|w| !w.is_deleted())
            .ok_or_else(|| WorkflowError::workflow_not_found(original.workflow_id))?;

        if !workflow.is_active {
            return Err(WorkflowError::Conflict(format!(
                "Workflow {} is inactive",
                workflow.id
            )));
        }

        warn!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            subject_id = original.subject_id,
            "Requeueing failed execution"
        );

        let event = TriggerEvent::new(
            shop_id,
            original.subject_id,
            workflow.trigger_type,
            CustomerFacts::default(),
            EventSource::Requeue(execution_id),
        );
        self.executor
            .execute(&workflow, &event, ExecutionContext::requeue(Utc::now(), execution_id))
            .await
    }
}
