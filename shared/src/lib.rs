use chrono::{DateTime, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Raised when a kebab-case code from an API payload or a database row does
/// not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} code: {code}")]
pub struct ParseCodeError {
    pub kind: &'static str,
    pub code: String,
}

impl ParseCodeError {
    fn new(kind: &'static str, code: &str) -> Self {
        Self {
            kind,
            code: code.to_string(),
        }
    }
}

/// Coarse grouping of why a workflow fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCategory {
    Lifecycle,
    Periodic,
    Special,
    Prevention,
}

impl TriggerCategory {
    pub const ALL: [TriggerCategory; 4] = [
        TriggerCategory::Lifecycle,
        TriggerCategory::Periodic,
        TriggerCategory::Special,
        TriggerCategory::Prevention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Periodic => "periodic",
            Self::Special => "special",
            Self::Prevention => "prevention",
        }
    }

    /// Periodic and special workflows are driven by `next_scheduled_at`.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Periodic | Self::Special)
    }
}

impl fmt::Display for TriggerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerCategory {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == code)
            .ok_or_else(|| ParseCodeError::new("trigger category", s))
    }
}

/// Condition kind a workflow reacts to. Each type belongs to exactly one
/// category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    // Customer lifecycle
    NewCustomerFollowup,
    VipAttentionNeeded,

    // Periodic retention
    VisitCycle,
    SpecificTreatment,

    // Special dates and milestones
    Birthday,
    FirstVisitAnniversary,
    VisitMilestone,
    AmountMilestone,
    FirstVisitDaysAfter,

    // Churn prevention
    NewCustomerAtRisk,
    ReactivationNeeded,
    GrowingDelayed,
    LoyalDelayed,
    ChurnRiskHigh,
}

impl TriggerType {
    pub const ALL: [TriggerType; 14] = [
        TriggerType::NewCustomerFollowup,
        TriggerType::VipAttentionNeeded,
        TriggerType::VisitCycle,
        TriggerType::SpecificTreatment,
        TriggerType::Birthday,
        TriggerType::FirstVisitAnniversary,
        TriggerType::VisitMilestone,
        TriggerType::AmountMilestone,
        TriggerType::FirstVisitDaysAfter,
        TriggerType::NewCustomerAtRisk,
        TriggerType::ReactivationNeeded,
        TriggerType::GrowingDelayed,
        TriggerType::LoyalDelayed,
        TriggerType::ChurnRiskHigh,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Self::NewCustomerFollowup => "new-customer-followup",
            Self::VipAttentionNeeded => "vip-attention-needed",
            Self::VisitCycle => "visit-cycle",
            Self::SpecificTreatment => "specific-treatment",
            Self::Birthday => "birthday",
            Self::FirstVisitAnniversary => "first-visit-anniversary",
            Self::VisitMilestone => "visit-milestone",
            Self::AmountMilestone => "amount-milestone",
            Self::FirstVisitDaysAfter => "first-visit-days-after",
            Self::NewCustomerAtRisk => "new-customer-at-risk",
            Self::ReactivationNeeded => "reactivation-needed",
            Self::GrowingDelayed => "growing-delayed",
            Self::LoyalDelayed => "loyal-delayed",
            Self::ChurnRiskHigh => "churn-risk-high",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::NewCustomerFollowup => "New customer follow-up",
            Self::VipAttentionNeeded => "VIP attention needed",
            Self::VisitCycle => "Visit cycle",
            Self::SpecificTreatment => "After specific treatment",
            Self::Birthday => "Birthday",
            Self::FirstVisitAnniversary => "First visit anniversary",
            Self::VisitMilestone => "Visit count milestone",
            Self::AmountMilestone => "Spend milestone",
            Self::FirstVisitDaysAfter => "Days after first visit",
            Self::NewCustomerAtRisk => "New customer at risk",
            Self::ReactivationNeeded => "Reactivation needed",
            Self::GrowingDelayed => "Growing customer delayed",
            Self::LoyalDelayed => "Loyal customer delayed",
            Self::ChurnRiskHigh => "High churn risk",
        }
    }

    pub fn category(&self) -> TriggerCategory {
        match self {
            Self::NewCustomerFollowup | Self::VipAttentionNeeded => TriggerCategory::Lifecycle,
            Self::VisitCycle | Self::SpecificTreatment => TriggerCategory::Periodic,
            Self::Birthday
            | Self::FirstVisitAnniversary
            | Self::VisitMilestone
            | Self::AmountMilestone
            | Self::FirstVisitDaysAfter => TriggerCategory::Special,
            Self::NewCustomerAtRisk
            | Self::ReactivationNeeded
            | Self::GrowingDelayed
            | Self::LoyalDelayed
            | Self::ChurnRiskHigh => TriggerCategory::Prevention,
        }
    }

    /// Milestones stay true once reached, so they fire at most once per
    /// workflow and customer.
    pub fn fires_once_per_subject(&self) -> bool {
        matches!(self, Self::VisitMilestone | Self::AmountMilestone)
    }

    /// Parses a trigger code, also accepting the `customer-inactive-<N>d`
    /// shorthand which means "reactivation needed after N days".
    ///
    /// Returns the implied inactivity threshold alongside the type when the
    /// shorthand is used.
    pub fn parse_with_alias(code: &str) -> Result<(TriggerType, Option<i32>), ParseCodeError> {
        let trimmed = code.trim().to_lowercase();
        if let Some(days) = trimmed
            .strip_prefix("customer-inactive-")
            .and_then(|rest| rest.strip_suffix('d'))
        {
            return days
                .parse::<i32>()
                .ok()
                .filter(|d| *d > 0)
                .map(|d| (TriggerType::ReactivationNeeded, Some(d)))
                .ok_or_else(|| ParseCodeError::new("trigger type", code));
        }
        trimmed.parse().map(|t| (t, None))
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TriggerType {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| ParseCodeError::new("trigger type", s))
    }
}

/// Effect a workflow produces when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    MessageOnly,
    CouponMessage,
    SystemNotification,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [
        ActionType::MessageOnly,
        ActionType::CouponMessage,
        ActionType::SystemNotification,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Self::MessageOnly => "message-only",
            Self::CouponMessage => "coupon-message",
            Self::SystemNotification => "system-notification",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ActionType {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "message-only" | "send-message" => Ok(Self::MessageOnly),
            "coupon-message" | "apply-coupon" => Ok(Self::CouponMessage),
            "system-notification" | "create-notification" => Ok(Self::SystemNotification),
            _ => Err(ParseCodeError::new("action type", s)),
        }
    }
}

/// When a scheduled workflow's next slot falls. Times are wall-clock times in
/// the engine's configured timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleRule {
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    Every { minutes: i64 },
}

/// Typed trigger parameters. Which fields matter depends on the trigger type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_cycle_days: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_after_treatment: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_after_registration: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthday_days_before: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_milestone: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_milestone: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_after_first_visit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_threshold_days: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_days: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_value: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleRule>,
}

impl TriggerConfig {
    pub fn is_valid(&self, trigger_type: TriggerType) -> bool {
        match trigger_type {
            TriggerType::VisitCycle => self.visit_cycle_days.is_some_and(|d| d > 0),
            TriggerType::SpecificTreatment => self
                .treatment_id
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty()),
            TriggerType::Birthday => self.birthday_days_before.is_some_and(|d| d >= 0),
            TriggerType::VisitMilestone => self.visit_milestone.is_some_and(|m| m > 0),
            TriggerType::AmountMilestone => {
                self.amount_milestone.is_some_and(|m| m > Decimal::ZERO)
            }
            TriggerType::FirstVisitDaysAfter => self.days_after_first_visit.is_some_and(|d| d > 0),
            TriggerType::NewCustomerFollowup => self.followup_days.is_some_and(|d| d > 0),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// Action parameters: template, coupon and notification references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_level: Option<NotificationLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_personalization: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl ActionConfig {
    pub fn is_valid(&self, action_type: ActionType) -> bool {
        match action_type {
            ActionType::MessageOnly => present(&self.message_template_id) && self.send_time.is_some(),
            ActionType::CouponMessage => {
                present(&self.message_template_id)
                    && present(&self.coupon_id)
                    && self.send_time.is_some()
            }
            ActionType::SystemNotification => {
                present(&self.notification_title) && present(&self.notification_content)
            }
        }
    }
}

fn default_dormant_period_months() -> i32 {
    6
}

fn default_recent_message_period_days() -> i32 {
    30
}

/// Which customers a workflow may address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAudience {
    #[serde(default)]
    pub customer_grade_ids: Vec<i64>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    #[serde(default)]
    pub exclude_dormant_customers: bool,
    #[serde(default = "default_dormant_period_months")]
    pub dormant_period_months: i32,
    #[serde(default)]
    pub exclude_recent_message_receivers: bool,
    #[serde(default = "default_recent_message_period_days")]
    pub recent_message_period_days: i32,
}

impl Default for TargetAudience {
    fn default() -> Self {
        Self {
            customer_grade_ids: Vec::new(),
            tag_ids: Vec::new(),
            exclude_dormant_customers: false,
            dormant_period_months: default_dormant_period_months(),
            exclude_recent_message_receivers: false,
            recent_message_period_days: default_recent_message_period_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub shop_id: i64,
    pub staff_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub trigger_category: TriggerCategory,
    pub trigger_type: TriggerType,
    pub trigger_config: TriggerConfig,
    pub action_type: ActionType,
    pub action_config: ActionConfig,
    pub target: TargetAudience,
    pub execution_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Only active, non-deleted workflows are ever matched or scheduled.
    pub fn can_execute(&self) -> bool {
        self.is_active && !self.is_deleted()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.can_execute() && self.next_scheduled_at.is_some_and(|at| at <= now)
    }

    pub fn is_owned_by(&self, staff_id: i64) -> bool {
        self.staff_id == staff_id
    }

    /// Percentage of executions that succeeded, 0 when never executed.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    SkippedCooldown,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::SkippedCooldown => "skipped-cooldown",
        }
    }

    /// Whether the attempt reached the action dispatcher.
    pub fn was_executed(&self) -> bool {
        !matches!(self, Self::SkippedCooldown)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionOutcome {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "skipped-cooldown" => Ok(Self::SkippedCooldown),
            _ => Err(ParseCodeError::new("execution outcome", s)),
        }
    }
}

/// Audit entry for one attempt to fire a workflow for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub id: Uuid,
    pub shop_id: i64,
    pub workflow_id: Uuid,
    pub subject_id: i64,
    pub trigger_type: TriggerType,
    pub action_type: ActionType,
    pub outcome: ExecutionOutcome,
    pub error_message: Option<String>,
    pub scheduled: bool,
    pub requeued_from: Option<Uuid>,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total_workflows: i64,
    pub active_workflows: i64,
    pub inactive_workflows: i64,
    pub total_executions: i64,
    pub total_successes: i64,
    pub total_failures: i64,
    pub success_rate: f64,
}

impl WorkflowStats {
    pub fn with_success_rate(mut self) -> Self {
        self.success_rate = if self.total_executions == 0 {
            0.0
        } else {
            self.total_successes as f64 / self.total_executions as f64 * 100.0
        };
        self
    }
}
