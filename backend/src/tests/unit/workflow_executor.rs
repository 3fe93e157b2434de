use chrono::{Duration, Utc};
use salonflow_shared::{ExecutionOutcome, TriggerType};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::tests::fixtures::*;
use crate::tests::helpers::*;
use crate::workflows::{
    CustomerFacts, ExecutionContext, InMemoryWorkflowStore, WorkflowError, WorkflowExecutor, WorkflowStore,
};

struct Setup {
    store: Arc<InMemoryWorkflowStore>,
    dispatcher: Arc<ScriptedDispatcher>,
    executor: WorkflowExecutor,
}

fn setup(config: WorkflowConfig, dispatcher: ScriptedDispatcher) -> Setup {
    init_test_logging();
    let store = Arc::new(InMemoryWorkflowStore::new());
    let dispatcher = Arc::new(dispatcher);
    let executor = WorkflowExecutor::new(store.clone(), store.clone(), dispatcher.clone(), &config);
    Setup {
        store,
        dispatcher,
        executor,
    }
}

fn lifecycle_workflow() -> salonflow_shared::Workflow {
    WorkflowFixture::new(TriggerType::NewCustomerFollowup)
        .trigger_config(salonflow_shared::TriggerConfig {
            followup_days: Some(3),
            ..Default::default()
        })
        .build()
}

#[tokio::test]
async fn test_successful_dispatch_updates_counters_and_log() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();

    let now = Utc::now();
    let ev = event(workflow.trigger_type, 42, CustomerFacts::default());
    let record = s.executor.execute(&workflow, &ev, ExecutionContext::at(now)).await.unwrap();

    assert_eq!(record.outcome, ExecutionOutcome::Success);
    assert_eq!(record.subject_id, 42);
    assert_eq!(record.fired_at, now);
    assert!(!record.scheduled);
    assert!(record.error_message.is_none());

    let stored = s.store.find_by_id(SHOP_ID, workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.execution_count, 1);
    assert_eq!(stored.success_count, 1);
    assert_eq!(stored.failure_count, 0);
    assert_eq!(stored.last_executed_at, Some(now));
    assert_eq!(s.store.executions().await, vec![record]);
}

#[tokio::test]
async fn test_rejected_dispatch_is_recorded_as_failure() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    s.dispatcher.fail_template("tmpl-broken");
    let workflow = WorkflowFixture::inactive_for(30).template("tmpl-broken").build();
    s.store.insert(&workflow).await.unwrap();

    let ev = event(workflow.trigger_type, 7, CustomerFacts::default());
    let record = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(Utc::now()))
        .await
        .unwrap();

    assert_eq!(record.outcome, ExecutionOutcome::Failure);
    assert!(record.error_message.unwrap().contains("template rejected"));

    let stored = s.store.find_by_id(SHOP_ID, workflow.id).await.unwrap().unwrap();
    assert_eq!((stored.execution_count, stored.success_count, stored.failure_count), (1, 0, 1));
}

#[tokio::test]
async fn test_dispatch_timeout_counts_as_failure() {
    let config = WorkflowConfig {
        dispatch_timeout: std::time::Duration::from_millis(50),
        ..WorkflowConfig::default()
    };
    let s = setup(config, ScriptedDispatcher::slow(std::time::Duration::from_secs(5)));
    let workflow = WorkflowFixture::inactive_for(30).build();
    s.store.insert(&workflow).await.unwrap();

    let ev = event(workflow.trigger_type, 7, CustomerFacts::default());
    let record = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(Utc::now()))
        .await
        .unwrap();

    assert_eq!(record.outcome, ExecutionOutcome::Failure);
    assert_eq!(record.error_message.as_deref(), Some("dispatch timed out"));
    let stored = s.store.find_by_id(SHOP_ID, workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.execution_count, 1);
}

#[tokio::test]
async fn test_second_run_inside_cooldown_is_skipped() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();

    let first_at = Utc::now();
    let ev = event(workflow.trigger_type, 9, CustomerFacts::default());
    s.executor.execute(&workflow, &ev, ExecutionContext::at(first_at)).await.unwrap();
    let second = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(first_at + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(second.outcome, ExecutionOutcome::SkippedCooldown);
    assert_eq!(s.dispatcher.call_count(), 1);

    let stored = s.store.find_by_id(SHOP_ID, workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.execution_count, 1);
    assert_eq!(stored.last_executed_at, Some(first_at));
    assert_eq!(s.store.executions().await.len(), 2);
}

#[tokio::test]
async fn test_cooldown_is_per_subject() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();

    let now = Utc::now();
    for subject in [1, 2] {
        let ev = event(workflow.trigger_type, subject, CustomerFacts::default());
        let record = s.executor.execute(&workflow, &ev, ExecutionContext::at(now)).await.unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Success);
    }
    assert_eq!(s.dispatcher.call_count(), 2);
}

#[tokio::test]
async fn test_skips_do_not_extend_the_cooldown_window() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();
    let ev = event(workflow.trigger_type, 5, CustomerFacts::default());

    let t0 = Utc::now();
    s.executor.execute(&workflow, &ev, ExecutionContext::at(t0)).await.unwrap();
    let skipped = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(t0 + Duration::hours(20)))
        .await
        .unwrap();
    let later = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(t0 + Duration::hours(25)))
        .await
        .unwrap();

    assert_eq!(skipped.outcome, ExecutionOutcome::SkippedCooldown);
    assert_eq!(later.outcome, ExecutionOutcome::Success);
    assert_eq!(s.dispatcher.call_count(), 2);
}

#[tokio::test]
async fn test_cooldown_only_applies_to_configured_categories() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = WorkflowFixture::inactive_for(30).build();
    s.store.insert(&workflow).await.unwrap();
    let ev = event(workflow.trigger_type, 5, CustomerFacts::default());

    let now = Utc::now();
    s.executor.execute(&workflow, &ev, ExecutionContext::at(now)).await.unwrap();
    let second = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(now + Duration::minutes(5)))
        .await
        .unwrap();

    assert_eq!(second.outcome, ExecutionOutcome::Success);
    assert_eq!(s.dispatcher.call_count(), 2);
}

#[tokio::test]
async fn test_empty_category_list_disables_cooldown() {
    let config = WorkflowConfig {
        cooldown_categories: vec![],
        ..test_config()
    };
    let s = setup(config, ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();
    let ev = event(workflow.trigger_type, 5, CustomerFacts::default());

    let now = Utc::now();
    s.executor.execute(&workflow, &ev, ExecutionContext::at(now)).await.unwrap();
    s.executor.execute(&workflow, &ev, ExecutionContext::at(now)).await.unwrap();
    assert_eq!(s.dispatcher.call_count(), 2);
}

#[tokio::test]
async fn test_requeue_context_bypasses_cooldown() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();
    let ev = event(workflow.trigger_type, 5, CustomerFacts::default());

    let now = Utc::now();
    s.executor.execute(&workflow, &ev, ExecutionContext::at(now)).await.unwrap();
    let original = Uuid::new_v4();
    let retried = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::requeue(now, original))
        .await
        .unwrap();

    assert_eq!(retried.outcome, ExecutionOutcome::Success);
    assert_eq!(retried.requeued_from, Some(original));
    assert_eq!(s.dispatcher.call_count(), 2);
}

#[tokio::test]
async fn test_counter_failure_keeps_the_audit_record_of_a_send() {
    let s = setup(test_config(), ScriptedDispatcher::new());
    let workflow = lifecycle_workflow();
    s.store.insert(&workflow).await.unwrap();
    s.store.fail_writes_for(workflow.id);

    let ev = event(workflow.trigger_type, 5, CustomerFacts::default());
    let result = s.executor.execute(&workflow, &ev, ExecutionContext::at(Utc::now())).await;

    assert!(matches!(result, Err(WorkflowError::Store(_))));
    let records = s.store.executions().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Success);

    let repeat = s
        .executor
        .execute(&workflow, &ev, ExecutionContext::at(Utc::now()))
        .await
        .unwrap();
    assert_eq!(repeat.outcome, ExecutionOutcome::SkippedCooldown);
    assert_eq!(s.dispatcher.call_count(), 1);
}
