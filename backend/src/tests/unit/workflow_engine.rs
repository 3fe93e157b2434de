use chrono::{Datelike, Duration, Utc};
use rust_decimal::Decimal;
use salonflow_shared::{ExecutionOutcome, ScheduleRule, TargetAudience, TriggerType};

use crate::tests::fixtures::*;
use crate::tests::helpers::*;
use crate::workflows::store::SlotUpdate;
use crate::workflows::{CustomerFacts, WorkflowDefinition, WorkflowError};

fn definition(value: serde_json::Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

// Evaluate

#[tokio::test]
async fn test_inactivity_alias_fires_once_for_lapsed_customer() {
    let h = TestHarness::new();
    let workflow = h
        .service
        .create(SHOP_ID, &definition(definition_json("Come back soon", "customer-inactive-30d")))
        .await
        .unwrap();
    assert_eq!(workflow.trigger_type, TriggerType::ReactivationNeeded);
    assert_eq!(workflow.trigger_config.risk_threshold_days, Some(30));

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 501, lapsed_customer(31, today)))
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].workflow_id, workflow.id);
    assert_eq!(records[0].outcome, ExecutionOutcome::Success);
    assert_eq!(h.reload(&workflow).await.success_count, 1);
}

#[tokio::test]
async fn test_inactivity_alias_outcome_follows_dispatcher() {
    let h = TestHarness::new();
    h.dispatcher.fail_template("tmpl-comeback");
    let workflow = h
        .service
        .create(SHOP_ID, &definition(definition_json("Come back soon", "customer-inactive-30d")))
        .await
        .unwrap();

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 501, lapsed_customer(31, today)))
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Failure);
    let stored = h.reload(&workflow).await;
    assert_eq!((stored.execution_count, stored.failure_count), (1, 1));
}

#[tokio::test]
async fn test_recent_visitor_does_not_match_inactivity_trigger() {
    let h = TestHarness::new();
    h.seed(WorkflowFixture::inactive_for(30).build()).await;

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 8, lapsed_customer(29, today)))
        .await
        .unwrap();

    assert!(records.is_empty());
    assert_eq!(h.dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_disabled_workflow_is_never_evaluated() {
    let h = TestHarness::new();
    let workflow = h.seed(WorkflowFixture::inactive_for(30).build()).await;
    h.service.set_active(SHOP_ID, workflow.id, false).await.unwrap();

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 3, lapsed_customer(90, today)))
        .await
        .unwrap();

    assert!(records.is_empty());
    assert_eq!(h.reload(&workflow).await.execution_count, 0);
}

#[tokio::test]
async fn test_identical_events_inside_cooldown_count_once() {
    let h = TestHarness::new();
    let workflow = h
        .seed(
            WorkflowFixture::new(TriggerType::NewCustomerFollowup)
                .trigger_config(salonflow_shared::TriggerConfig {
                    followup_days: Some(3),
                    ..Default::default()
                })
                .build(),
        )
        .await;

    let today = Utc::now().date_naive();
    let ev = event(TriggerType::NewCustomerFollowup, 12, new_customer(today));
    let first = h.engine.evaluate(&ev).await.unwrap();
    let second = h.engine.evaluate(&ev).await.unwrap();

    assert_eq!(first[0].outcome, ExecutionOutcome::Success);
    assert_eq!(second[0].outcome, ExecutionOutcome::SkippedCooldown);
    let stored = h.reload(&workflow).await;
    assert_eq!(stored.execution_count, 1);
    assert_eq!(h.dispatcher.call_count(), 1);
}

#[tokio::test]
async fn test_same_trigger_lifecycle_workflows_send_once_per_customer() {
    let h = TestHarness::new();
    let first = h.seed(WorkflowFixture::followup(7).build()).await;
    let second = h.seed(WorkflowFixture::followup(7).build()).await;

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::NewCustomerFollowup, 42, new_customer(today)))
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    let sent = records.iter().filter(|r| r.outcome == ExecutionOutcome::Success).count();
    let skipped = records
        .iter()
        .filter(|r| r.outcome == ExecutionOutcome::SkippedCooldown)
        .count();
    assert_eq!((sent, skipped), (1, 1));
    assert_eq!(h.dispatcher.call_count(), 1);

    let executed = h.reload(&first).await.execution_count + h.reload(&second).await.execution_count;
    assert_eq!(executed, 1);

    // A different customer is not held back
    let other = h
        .engine
        .evaluate(&event(TriggerType::NewCustomerFollowup, 43, new_customer(today)))
        .await
        .unwrap();
    assert_eq!(other.iter().filter(|r| r.outcome == ExecutionOutcome::Success).count(), 1);
}

#[tokio::test]
async fn test_failed_lifecycle_send_leaves_room_for_a_sibling() {
    let h = TestHarness::new();
    h.dispatcher.fail_template("tmpl-broken");
    h.seed(WorkflowFixture::followup(7).template("tmpl-broken").build()).await;
    let healthy = h.seed(WorkflowFixture::followup(7).build()).await;

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::NewCustomerFollowup, 42, new_customer(today)))
        .await
        .unwrap();

    let outcome_of = |id| records.iter().find(|r| r.workflow_id == id).map(|r| r.outcome);
    assert_eq!(outcome_of(healthy.id), Some(ExecutionOutcome::Success));
    assert_eq!(
        records.iter().filter(|r| r.outcome == ExecutionOutcome::Success).count(),
        1
    );
}

#[tokio::test]
async fn test_store_failure_after_send_still_blocks_a_repeat_inside_cooldown() {
    let h = TestHarness::new();
    let workflow = h.seed(WorkflowFixture::followup(7).build()).await;
    h.store.fail_writes_for(workflow.id);

    let today = Utc::now().date_naive();
    let ev = event(TriggerType::NewCustomerFollowup, 42, new_customer(today));
    let first = h.engine.evaluate(&ev).await.unwrap();
    let second = h.engine.evaluate(&ev).await.unwrap();

    assert!(first.is_empty());
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].outcome, ExecutionOutcome::SkippedCooldown);
    assert_eq!(h.dispatcher.call_count(), 1);
}

#[tokio::test]
async fn test_failing_workflow_does_not_block_the_others() {
    let h = TestHarness::new();
    h.dispatcher.fail_template("tmpl-broken");
    let broken = h.seed(WorkflowFixture::inactive_for(30).template("tmpl-broken").build()).await;
    let healthy = h.seed(WorkflowFixture::inactive_for(14).build()).await;

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 44, lapsed_customer(45, today)))
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    let outcome_of = |id| records.iter().find(|r| r.workflow_id == id).map(|r| r.outcome);
    assert_eq!(outcome_of(broken.id), Some(ExecutionOutcome::Failure));
    assert_eq!(outcome_of(healthy.id), Some(ExecutionOutcome::Success));
}

#[tokio::test]
async fn test_store_error_on_one_workflow_does_not_block_the_others() {
    let h = TestHarness::new();
    let failing = h.seed(WorkflowFixture::inactive_for(30).build()).await;
    let healthy = h.seed(WorkflowFixture::inactive_for(30).build()).await;
    h.store.fail_writes_for(failing.id);

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 44, lapsed_customer(45, today)))
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].workflow_id, healthy.id);
}

#[tokio::test]
async fn test_target_audience_filters_subjects() {
    let h = TestHarness::new();
    h.seed(
        WorkflowFixture::inactive_for(30)
            .target(TargetAudience {
                customer_grade_ids: vec![3],
                ..TargetAudience::default()
            })
            .build(),
    )
    .await;

    let today = Utc::now().date_naive();
    let outsider = lapsed_customer(45, today);
    let member = CustomerFacts {
        grade_id: Some(3),
        ..lapsed_customer(45, today)
    };

    let none = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 1, outsider))
        .await
        .unwrap();
    let one = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 2, member))
        .await
        .unwrap();

    assert!(none.is_empty());
    assert_eq!(one.len(), 1);
}

#[tokio::test]
async fn test_events_stay_inside_their_shop() {
    let h = TestHarness::new();
    h.seed(WorkflowFixture::inactive_for(30).shop(OTHER_SHOP_ID).build()).await;

    let today = Utc::now().date_naive();
    let records = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 1, lapsed_customer(60, today)))
        .await
        .unwrap();

    assert!(records.is_empty());
}

#[tokio::test]
async fn test_counters_stay_balanced_across_mixed_outcomes() {
    let h = TestHarness::new();
    h.dispatcher.fail_template("tmpl-flaky");
    let flaky = h.seed(WorkflowFixture::inactive_for(30).template("tmpl-flaky").build()).await;
    let steady = h.seed(WorkflowFixture::inactive_for(30).build()).await;

    let today = Utc::now().date_naive();
    for subject in 0..10 {
        h.engine
            .evaluate(&event(TriggerType::ReactivationNeeded, subject, lapsed_customer(40, today)))
            .await
            .unwrap();
    }

    for workflow in [h.reload(&flaky).await, h.reload(&steady).await] {
        assert_counters_consistent(&workflow);
        assert_eq!(workflow.execution_count, 10);
    }
}

// Tick

#[tokio::test]
async fn test_missed_slot_fires_once_and_realigns_after_now() {
    let h = TestHarness::new();
    let now = Utc::now();
    let workflow = h.seed(WorkflowFixture::birthday().due_at(now - Duration::days(1)).build()).await;
    h.audience.add(SHOP_ID, 900, birthday_customer(now.date_naive())).await;

    let report = h.engine.tick(now).await.unwrap();

    assert_eq!(report.slots_fired, 1);
    assert_eq!(report.succeeded, 1);
    let next = h.next_slot(&workflow).await.unwrap();
    assert!(next > now);

    let records = h.executions_for(workflow.id).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].scheduled);
    assert_eq!(records[0].fired_at, now);
}

#[tokio::test]
async fn test_repeated_tick_without_time_advance_does_not_double_fire() {
    let h = TestHarness::new();
    let now = Utc::now();
    let workflow = h
        .seed(
            WorkflowFixture::birthday()
                .schedule(ScheduleRule::Every { minutes: 60 })
                .due_at(now - Duration::minutes(1))
                .build(),
        )
        .await;
    h.audience.add(SHOP_ID, 900, birthday_customer(now.date_naive())).await;

    let first = h.engine.tick(now).await.unwrap();
    let slot_after_first = h.next_slot(&workflow).await.unwrap();
    let second = h.engine.tick(now).await.unwrap();

    assert_eq!(first.slots_fired, 1);
    assert_eq!(second.slots_fired, 0);
    assert!(slot_after_first > now);
    assert_eq!(h.next_slot(&workflow).await, Some(slot_after_first));
    assert_eq!(h.dispatcher.call_count(), 1);
}

#[tokio::test]
async fn test_milestone_rewards_a_customer_once_across_slots() {
    let h = TestHarness::new();
    let start = Utc::now();
    let workflow = h
        .seed(
            WorkflowFixture::amount_milestone(Decimal::new(100_000, 0))
                .due_at(start - Duration::minutes(1))
                .build(),
        )
        .await;
    h.audience
        .add(
            SHOP_ID,
            900,
            CustomerFacts {
                total_revenue: Decimal::new(150_000, 0),
                visit_count: 12,
                ..CustomerFacts::default()
            },
        )
        .await;

    let mut now = start;
    let mut slots = 0;
    for _ in 0..4 {
        slots += h.engine.tick(now).await.unwrap().slots_fired;
        now = h.next_slot(&workflow).await.unwrap();
    }

    assert_eq!(slots, 4);
    assert_eq!(h.dispatcher.call_count(), 1);
    assert_eq!(h.executions_for(workflow.id).await.len(), 1);
    assert_eq!(h.reload(&workflow).await.success_count, 1);
}

#[tokio::test]
async fn test_milestone_events_fire_once_per_customer() {
    let h = TestHarness::new();
    h.seed(WorkflowFixture::amount_milestone(Decimal::new(100_000, 0)).build()).await;

    let facts = CustomerFacts {
        total_revenue: Decimal::new(120_000, 0),
        ..CustomerFacts::default()
    };
    let first = h
        .engine
        .evaluate(&event(TriggerType::AmountMilestone, 7, facts.clone()))
        .await
        .unwrap();
    let later_payment = CustomerFacts {
        total_revenue: Decimal::new(180_000, 0),
        ..facts
    };
    let second = h
        .engine
        .evaluate(&event(TriggerType::AmountMilestone, 7, later_payment))
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(h.dispatcher.call_count(), 1);
}

#[tokio::test]
async fn test_definition_save_does_not_rearm_a_claimed_slot() {
    let h = TestHarness::new();
    let now = Utc::now();
    let workflow = h.seed(WorkflowFixture::birthday().due_at(now - Duration::minutes(5)).build()).await;
    h.audience.add(SHOP_ID, 900, birthday_customer(now.date_naive())).await;
    let mut stale = h.service.get(SHOP_ID, workflow.id).await.unwrap();

    h.engine.tick(now).await.unwrap();
    stale.title = "Birthday treat".to_string();
    crate::workflows::WorkflowStore::save_definition(h.store.as_ref(), &stale, SlotUpdate::Keep)
        .await
        .unwrap();
    let again = h.engine.tick(now).await.unwrap();

    assert_eq!(again.slots_fired, 0);
    assert_eq!(h.dispatcher.call_count(), 1);
    assert!(h.next_slot(&workflow).await.unwrap() > now);
    assert_eq!(h.reload(&workflow).await.title, "Birthday treat");
}

#[tokio::test]
async fn test_concurrent_ticks_claim_a_slot_once() {
    let h = TestHarness::new();
    let now = Utc::now();
    h.seed(WorkflowFixture::birthday().due_at(now - Duration::hours(2)).build()).await;
    h.audience.add(SHOP_ID, 900, birthday_customer(now.date_naive())).await;

    let (a, b) = tokio::join!(h.engine.tick(now), h.engine.tick(now));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.slots_fired + b.slots_fired, 1);
    assert_eq!(h.dispatcher.call_count(), 1);
}

#[tokio::test]
async fn test_tick_ignores_disabled_workflow_with_past_slot() {
    let h = TestHarness::new();
    let now = Utc::now();
    h.seed(
        WorkflowFixture::birthday()
            .inactive()
            .due_at(now - Duration::days(3))
            .build(),
    )
    .await;
    h.audience.add(SHOP_ID, 900, birthday_customer(now.date_naive())).await;

    let report = h.engine.tick(now).await.unwrap();

    assert_eq!(report.slots_fired, 0);
    assert_eq!(h.dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_tick_only_dispatches_matching_candidates() {
    let h = TestHarness::new();
    let now = Utc::now();
    let today = now.date_naive();
    let workflow = h.seed(WorkflowFixture::birthday().due_at(now - Duration::minutes(5)).build()).await;
    h.audience.add(SHOP_ID, 1, birthday_customer(today)).await;
    h.audience
        .add(
            SHOP_ID,
            2,
            CustomerFacts {
                birthday: (today + Duration::days(40)).with_year(1992),
                ..CustomerFacts::default()
            },
        )
        .await;

    let report = h.engine.tick(now).await.unwrap();

    assert_eq!(report.slots_fired, 1);
    assert_eq!(report.succeeded, 1);
    let calls = h.dispatcher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].subject_id, 1);
    assert_eq!(h.executions_for(workflow.id).await.len(), 1);
}

// Requeue

#[tokio::test]
async fn test_requeue_retries_a_failed_execution() {
    let h = TestHarness::new();
    h.dispatcher.fail_template("tmpl-retry");
    let workflow = h.seed(WorkflowFixture::inactive_for(30).template("tmpl-retry").build()).await;

    let today = Utc::now().date_naive();
    let failed = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 61, lapsed_customer(45, today)))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(failed.outcome, ExecutionOutcome::Failure);

    let mut fixed = workflow.clone();
    fixed.action_config.message_template_id = Some("tmpl-fixed".to_string());
    crate::workflows::WorkflowStore::save_definition(h.store.as_ref(), &fixed, SlotUpdate::Keep)
        .await
        .unwrap();

    let retried = h.engine.requeue(SHOP_ID, failed.id).await.unwrap();

    assert_eq!(retried.outcome, ExecutionOutcome::Success);
    assert_eq!(retried.requeued_from, Some(failed.id));
    assert_eq!(retried.subject_id, 61);
    let stored = h.reload(&workflow).await;
    assert_eq!((stored.execution_count, stored.success_count, stored.failure_count), (2, 1, 1));
}

#[tokio::test]
async fn test_requeue_rejects_successful_execution() {
    let h = TestHarness::new();
    h.seed(WorkflowFixture::inactive_for(30).build()).await;

    let today = Utc::now().date_naive();
    let ok = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 61, lapsed_customer(45, today)))
        .await
        .unwrap()
        .remove(0);

    let result = h.engine.requeue(SHOP_ID, ok.id).await;
    assert!(matches!(result, Err(WorkflowError::Conflict(_))));
}

#[tokio::test]
async fn test_requeue_of_unknown_execution_is_not_found() {
    let h = TestHarness::new();
    let result = h.engine.requeue(SHOP_ID, uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(WorkflowError::NotFound { .. })));
}

#[tokio::test]
async fn test_requeue_respects_workflow_lifecycle() {
    let h = TestHarness::new();
    h.dispatcher.fail_template("tmpl-retry");
    let workflow = h.seed(WorkflowFixture::inactive_for(30).template("tmpl-retry").build()).await;

    let today = Utc::now().date_naive();
    let failed = h
        .engine
        .evaluate(&event(TriggerType::ReactivationNeeded, 61, lapsed_customer(45, today)))
        .await
        .unwrap()
        .remove(0);

    h.service.set_active(SHOP_ID, workflow.id, false).await.unwrap();
    assert!(matches!(
        h.engine.requeue(SHOP_ID, failed.id).await,
        Err(WorkflowError::Conflict(_))
    ));

    h.service.delete(SHOP_ID, workflow.id, STAFF_ID).await.unwrap();
    assert!(matches!(
        h.engine.requeue(SHOP_ID, failed.id).await,
        Err(WorkflowError::NotFound { .. })
    ));

    // Another shop cannot see the execution at all
    assert!(matches!(
        h.engine.requeue(OTHER_SHOP_ID, failed.id).await,
        Err(WorkflowError::NotFound { .. })
    ));
}
