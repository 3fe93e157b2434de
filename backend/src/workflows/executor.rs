// Workflow Executor - Runs one workflow for one customer

use chrono::{DateTime, Utc};
use salonflow_shared::{ExecutionOutcome, TriggerCategory, Workflow, WorkflowExecutionRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::actions::{ActionDispatcher, DispatchError};
use super::errors::WorkflowResult;
use super::store::{CooldownKey, CounterUpdate, ExecutionLog, WorkflowStore};
use super::triggers::TriggerEvent;
use crate::config::WorkflowConfig;

/// Per-call execution settings
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    /// Instant recorded as `fired_at` and `last_executed_at`
    pub now: DateTime<Utc>,
    pub bypass_cooldown: bool,
    pub requeued_from: Option<Uuid>,
}

impl ExecutionContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            bypass_cooldown: false,
            requeued_from: None,
        }
    }

    pub fn requeue(now: DateTime<Utc>, from: Uuid) -> Self {
        Self {
            now,
            bypass_cooldown: true,
            requeued_from: Some(from),
        }
    }
}

pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    log: Arc<dyn ExecutionLog>,
    dispatcher: Arc<dyn ActionDispatcher>,
    cooldown: chrono::Duration,
    cooldown_categories: Vec<TriggerCategory>,
    dispatch_timeout: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        log: Arc<dyn ExecutionLog>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: &WorkflowConfig,
    ) -> Self {
        Self {
            store,
            log,
            dispatcher,
            cooldown: config.cooldown,
            cooldown_categories: config.cooldown_categories.clone(),
            dispatch_timeout: config.dispatch_timeout,
        }
    }

    /// Cooldown check, dispatch, audit record and counter update.
    ///
    /// A dispatch failure is an `Ok` record with outcome `failure`; `Err` is
    /// reserved for store problems. Once the action has been dispatched the
    /// record is appended before counters are touched, so a failed counter
    /// write still leaves the send visible to later cooldown checks.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        event: &TriggerEvent,
        ctx: ExecutionContext,
    ) -> WorkflowResult<WorkflowExecutionRecord> {
        if !ctx.bypass_cooldown && self.in_cooldown(workflow, event.subject_id, ctx.now).await? {
            info!(
                workflow_id = %workflow.id,
                subject_id = event.subject_id,
                "Skipping workflow inside cooldown window"
            );
            let record = self.record(workflow, event, ctx, ExecutionOutcome::SkippedCooldown, None);
            self.log.append(&record).await?;
            return Ok(record);
        }

        let dispatched = match tokio::time::timeout(
            self.dispatch_timeout,
            self.dispatcher.dispatch(
                workflow.action_type,
                &workflow.action_config,
                workflow.shop_id,
                event.subject_id,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout),
        };

        let (outcome, update, error_message) = match dispatched {
            Ok(()) => (ExecutionOutcome::Success, CounterUpdate::Success, None),
            Err(e) => {
                warn!(
                    workflow_id = %workflow.id,
                    subject_id = event.subject_id,
                    action_type = %workflow.action_type,
                    "Action dispatch failed: {}",
                    e
                );
                (ExecutionOutcome::Failure, CounterUpdate::Failure, Some(e.to_string()))
            }
        };

        let record = self.record(workflow, event, ctx, outcome, error_message);
        let appended = self.log.append(&record).await;
        if let Err(e) = &appended {
            error!(workflow_id = %workflow.id, execution_id = %record.id, "Failed to append execution record: {}", e);
        }
        let counted = self.store.record_outcome(workflow.id, update, ctx.now).await;
        if let Err(e) = &counted {
            error!(workflow_id = %workflow.id, "Failed to update execution counters: {}", e);
        }
        appended?;
        counted?;

        info!(
            workflow_id = %workflow.id,
            subject_id = event.subject_id,
            outcome = %outcome,
            "Workflow executed"
        );
        Ok(record)
    }

    async fn in_cooldown(&self, workflow: &Workflow, subject_id: i64, now: DateTime<Utc>) -> WorkflowResult<bool> {
        if self.cooldown <= chrono::Duration::zero()
            || !self.cooldown_categories.contains(&workflow.trigger_category)
        {
            return Ok(false);
        }
        let last = self
            .log
            .last_executed_at(&CooldownKey::new(workflow, subject_id))
            .await?;
        Ok(last.is_some_and(|at| now - at < self.cooldown))
    }

    fn record(
        &self,
        workflow: &Workflow,
        event: &TriggerEvent,
        ctx: ExecutionContext,
        outcome: ExecutionOutcome,
        error_message: Option<String>,
    ) -> WorkflowExecutionRecord {
        WorkflowExecutionRecord {
            id: Uuid::new_v4(),
            shop_id: workflow.shop_id,
            workflow_id: workflow.id,
            subject_id: event.subject_id,
            trigger_type: workflow.trigger_type,
            action_type: workflow.action_type,
            outcome,
            error_message,
            scheduled: event.is_scheduled(),
            requeued_from: ctx.requeued_from,
            fired_at: ctx.now,
        }
    }
}
