// Workflow Triggers - Inbound events and the customer facts they carry

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use salonflow_shared::TriggerType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Customer segment as classified by the customer system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerSegment {
    New,
    Growing,
    Loyal,
    Vip,
    Dormant,
}

/// Snapshot of a customer at the moment an event was raised.
///
/// Predicates only read from this; nothing here is looked up lazily.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerFacts {
    #[serde(default)]
    pub grade_id: Option<i64>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    #[serde(default)]
    pub segment: Option<CustomerSegment>,
    #[serde(default)]
    pub registered_on: Option<NaiveDate>,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    #[serde(default)]
    pub first_visit_on: Option<NaiveDate>,
    #[serde(default)]
    pub last_visit_on: Option<NaiveDate>,
    #[serde(default)]
    pub visit_count: i32,
    #[serde(default)]
    pub total_revenue: Decimal,
    /// Treatment performed on the visit that raised the event
    #[serde(default)]
    pub treatment_id: Option<String>,
    #[serde(default)]
    pub treatment_on: Option<NaiveDate>,
    /// Opaque churn score (0-100) computed by the analytics system
    #[serde(default)]
    pub churn_risk_score: Option<i32>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Payload for trigger events
pub type EventPayload = CustomerFacts;

/// A trigger event that can initiate workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub shop_id: i64,
    /// Customer the event is about
    pub subject_id: i64,
    pub trigger_type: TriggerType,
    pub payload: EventPayload,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
}

/// Source of the trigger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    CustomerSystem,
    Scheduler,
    /// Manual retry of a failed execution
    Requeue(Uuid),
}

impl TriggerEvent {
    pub fn new(
        shop_id: i64,
        subject_id: i64,
        trigger_type: TriggerType,
        payload: EventPayload,
        source: EventSource,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            shop_id,
            subject_id,
            trigger_type,
            payload,
            source,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Event synthesized by a scheduler tick for one audience candidate
    pub fn scheduled(
        shop_id: i64,
        customer_id: i64,
        trigger_type: TriggerType,
        facts: CustomerFacts,
        tick_at: DateTime<Utc>,
    ) -> Self {
        Self::new(shop_id, customer_id, trigger_type, facts, EventSource::Scheduler)
            .with_timestamp(tick_at)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set correlation ID for tracking related events
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn is_scheduled(&self) -> bool {
        self.source == EventSource::Scheduler
    }
}
