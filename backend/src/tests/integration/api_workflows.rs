use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use serial_test::serial;
use tower::ServiceExt;

use crate::handlers::api_router;
use crate::tests::fixtures::*;
use crate::tests::helpers::*;

fn create_test_app(harness: &TestHarness) -> Router {
    api_router(harness.app_state())
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn workflows_uri() -> String {
    format!("/api/v1/shops/{}/workflows", SHOP_ID)
}

#[tokio::test]
#[serial]
async fn test_create_and_fetch_workflow_endpoint() {
    let harness = TestHarness::new();

    let (status, created) = send(
        create_test_app(&harness),
        "POST",
        &workflows_uri(),
        Some(definition_json("Come back", "customer-inactive-45d")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["trigger_type"], "reactivation-needed");
    assert_eq!(created["trigger_category"], "prevention");
    assert_eq!(created["action_type"], "message-only");
    assert_eq!(created["trigger_config"]["risk_threshold_days"], 45);

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = send(
        create_test_app(&harness),
        "GET",
        &format!("{}/{}", workflows_uri(), id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);
}

#[tokio::test]
#[serial]
async fn test_create_workflow_validation_errors() {
    let harness = TestHarness::new();

    let (status, body) = send(
        create_test_app(&harness),
        "POST",
        &workflows_uri(),
        Some(json!({
            "staff_id": STAFF_ID,
            "title": "Missing pieces",
            "trigger_type": "visit-cycle",
            "action_type": "message-only"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["trigger_config"].is_array());
    assert!(body["details"]["action_config"].is_array());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
#[serial]
async fn test_duplicate_title_is_a_conflict() {
    let harness = TestHarness::new();
    let body = definition_json("Win back", "reactivation-needed");

    let (first, _) = send(create_test_app(&harness), "POST", &workflows_uri(), Some(body.clone())).await;
    let (second, err) = send(create_test_app(&harness), "POST", &workflows_uri(), Some(body)).await;

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(second, StatusCode::CONFLICT);
    assert_eq!(err["code"], "CONFLICT");
}

#[tokio::test]
#[serial]
async fn test_list_stats_and_lifecycle_endpoints() {
    let harness = TestHarness::new();
    let workflow = harness.seed(WorkflowFixture::birthday().build()).await;
    harness.seed(WorkflowFixture::inactive_for(30).build()).await;

    let (status, page) = send(
        create_test_app(&harness),
        "GET",
        &format!("{}?per_page=1&page=2&sort_by=title&sort_order=asc", workflows_uri()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["meta"]["total"], 2);
    assert_eq!(page["data"].as_array().unwrap().len(), 1);

    let (status, off) = send(
        create_test_app(&harness),
        "POST",
        &format!("{}/{}/deactivate", workflows_uri(), workflow.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(off["is_active"], false);

    let (status, stats) = send(
        create_test_app(&harness),
        "GET",
        &format!("{}/stats", workflows_uri()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_workflows"], 2);
    assert_eq!(stats["active_workflows"], 1);

    let (status, on) = send(
        create_test_app(&harness),
        "POST",
        &format!("{}/{}/activate", workflows_uri(), workflow.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(on["is_active"], true);
    assert!(on["next_scheduled_at"].is_string());
}

#[tokio::test]
#[serial]
async fn test_delete_requires_owner_and_hides_workflow() {
    let harness = TestHarness::new();
    let workflow = harness.seed(WorkflowFixture::inactive_for(30).build()).await;
    let uri = format!("{}/{}", workflows_uri(), workflow.id);

    let (status, body) = send(
        create_test_app(&harness),
        "DELETE",
        &format!("{}?staff_id={}", uri, STAFF_ID + 1),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ACCESS_DENIED");

    let (status, _) = send(
        create_test_app(&harness),
        "DELETE",
        &format!("{}?staff_id={}", uri, STAFF_ID),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(create_test_app(&harness), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
#[serial]
async fn test_event_endpoint_runs_matching_workflows() {
    let harness = TestHarness::new();
    let workflow = harness.seed(WorkflowFixture::inactive_for(30).build()).await;
    let last_visit = (Utc::now() - Duration::days(31)).date_naive();

    let (status, body) = send(
        create_test_app(&harness),
        "POST",
        &format!("/api/v1/shops/{}/events", SHOP_ID),
        Some(json!({
            "trigger_type": "customer-inactive-30d",
            "subject_id": 314,
            "payload": { "last_visit_on": last_visit, "visit_count": 6 }
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trigger_type"], "reactivation-needed");
    let executions = body["executions"].as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["workflow_id"], workflow.id.to_string());
    assert_eq!(executions[0]["outcome"], "success");
    assert_eq!(harness.dispatcher.calls()[0].subject_id, 314);
}

#[tokio::test]
#[serial]
async fn test_event_endpoint_rejects_unknown_trigger() {
    let harness = TestHarness::new();

    let (status, body) = send(
        create_test_app(&harness),
        "POST",
        &format!("/api/v1/shops/{}/events", SHOP_ID),
        Some(json!({ "trigger_type": "full-moon", "subject_id": 1 })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["trigger_type"].is_array());
}

#[tokio::test]
#[serial]
async fn test_requeue_endpoint() {
    let harness = TestHarness::new();
    harness.dispatcher.fail_template("tmpl-down");
    let workflow = harness
        .seed(WorkflowFixture::inactive_for(30).template("tmpl-down").build())
        .await;

    let today = Utc::now().date_naive();
    let failed = harness
        .engine
        .evaluate(&event(workflow.trigger_type, 77, lapsed_customer(40, today)))
        .await
        .unwrap()
        .remove(0);

    let uri = format!("/api/v1/shops/{}/executions/{}/requeue", SHOP_ID, failed.id);
    let (status, retried) = send(create_test_app(&harness), "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["requeued_from"], failed.id.to_string());
    assert_eq!(retried["outcome"], "failure");

    let (status, history) = send(
        create_test_app(&harness),
        "GET",
        &format!("{}/{}/executions?per_page=10", workflows_uri(), workflow.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["meta"]["total"], 2);

    let unknown = format!("/api/v1/shops/{}/executions/{}/requeue", SHOP_ID, uuid::Uuid::new_v4());
    let (status, _) = send(create_test_app(&harness), "POST", &unknown, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
