//! Definition-time validation for workflow requests
//!
//! Everything that can be rejected synchronously is rejected here, before a
//! workflow reaches the store or the engine.

use salonflow_shared::{
    ActionConfig, ActionType, ScheduleRule, TargetAudience, TriggerCategory, TriggerConfig,
    TriggerType,
};

use crate::error::ValidationBuilder;
use crate::workflows::schedule::MAX_EVERY_MINUTES;
use crate::workflows::service::WorkflowDefinition;
use crate::workflows::WorkflowError;

pub const TITLE_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

/// Validation result type
pub type ValidationResult<T> = Result<T, WorkflowError>;

/// Validated wrapper type - indicates the value has been validated
#[derive(Debug, Clone)]
pub struct Validated<T>(pub T);

impl<T> Validated<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Validated<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Validator builder for complex validations
pub struct Validator {
    builder: ValidationBuilder,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            builder: ValidationBuilder::new(),
        }
    }

    /// Add error for a field
    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.builder = self.builder.error(field, message);
        self
    }

    /// Add error if condition is true
    pub fn error_if(self, condition: bool, field: &str, message: &str) -> Self {
        if condition {
            self.error(field, message)
        } else {
            self
        }
    }

    /// Validate required string
    pub fn required_string(self, value: &Option<String>, field: &str) -> Self {
        match value {
            Some(s) if !s.trim().is_empty() => self,
            Some(_) => self.error(field, &format!("{} cannot be empty", field)),
            None => self.error(field, &format!("{} is required", field)),
        }
    }

    /// Validate max length in characters
    pub fn max_chars(self, value: &Option<String>, field: &str, max: usize) -> Self {
        match value {
            Some(s) if s.trim().chars().count() > max => {
                self.error(field, &format!("{} must be {} characters or less", field, max))
            }
            _ => self,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.builder.has_errors()
    }

    /// Finish validation, returning error if any
    pub fn finish(self) -> ValidationResult<()> {
        match self.builder.into_details() {
            Some(details) => Err(WorkflowError::Validation { details }),
            None => Ok(()),
        }
    }

    /// Finish with a value if valid
    pub fn finish_with<T>(self, value: T) -> ValidationResult<Validated<T>> {
        self.finish()?;
        Ok(Validated(value))
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// A definition with codes parsed and aliases expanded
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDefinition {
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
}

fn trigger_config_message(trigger_type: TriggerType) -> &'static str {
    match trigger_type {
        TriggerType::VisitCycle => "visit_cycle_days must be greater than 0",
        TriggerType::SpecificTreatment => "treatment_id is required",
        TriggerType::Birthday => "birthday_days_before must be 0 or greater",
        TriggerType::VisitMilestone => "visit_milestone must be greater than 0",
        TriggerType::AmountMilestone => "amount_milestone must be greater than 0",
        TriggerType::FirstVisitDaysAfter => "days_after_first_visit must be greater than 0",
        TriggerType::NewCustomerFollowup => "followup_days must be greater than 0",
        _ => "trigger configuration is invalid",
    }
}

fn action_config_message(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::MessageOnly => "message_template_id and send_time are required",
        ActionType::CouponMessage => "message_template_id, coupon_id and send_time are required",
        ActionType::SystemNotification => "notification_title and notification_content are required",
    }
}

/// Parse codes, expand aliases and check every field of a request.
pub fn validate_definition(def: &WorkflowDefinition) -> ValidationResult<Validated<ResolvedDefinition>> {
    let mut v = Validator::new()
        .required_string(&def.title, "title")
        .max_chars(&def.title, "title", TITLE_MAX_CHARS)
        .max_chars(&def.description, "description", DESCRIPTION_MAX_CHARS);

    let mut trigger_config = def.trigger_config.clone();

    let trigger_type = match def.trigger_type.as_deref().map(TriggerType::parse_with_alias) {
        Some(Ok((trigger_type, alias_days))) => {
            if let Some(days) = alias_days {
                trigger_config.risk_threshold_days = Some(days);
            }
            Some(trigger_type)
        }
        Some(Err(e)) => {
            v = v.error("trigger_type", &e.to_string());
            None
        }
        None => {
            v = v.error("trigger_type", "trigger_type is required");
            None
        }
    };

    let action_type = match def.action_type.as_deref().map(str::parse::<ActionType>) {
        Some(Ok(action_type)) => Some(action_type),
        Some(Err(e)) => {
            v = v.error("action_type", &e.to_string());
            None
        }
        None => {
            v = v.error("action_type", "action_type is required");
            None
        }
    };

    if let Some(trigger_type) = trigger_type {
        let category = trigger_type.category();

        if let Some(raw) = def.trigger_category.as_deref() {
            match raw.parse::<TriggerCategory>() {
                Ok(given) => {
                    v = v.error_if(
                        given != category,
                        "trigger_category",
                        &format!("{} belongs to the {} category", trigger_type, category),
                    )
                }
                Err(e) => v = v.error("trigger_category", &e.to_string()),
            }
        }

        v = v.error_if(
            !trigger_config.is_valid(trigger_type),
            "trigger_config",
            trigger_config_message(trigger_type),
        );

        match &trigger_config.schedule {
            Some(_) if !category.is_scheduled() => {
                v = v.error("trigger_config.schedule", "only periodic and special workflows take a schedule");
            }
            Some(ScheduleRule::Every { minutes }) if *minutes <= 0 => {
                v = v.error("trigger_config.schedule", "minutes must be greater than 0");
            }
            Some(ScheduleRule::Every { minutes }) if *minutes > MAX_EVERY_MINUTES => {
                v = v.error(
                    "trigger_config.schedule",
                    &format!("minutes must be at most {}", MAX_EVERY_MINUTES),
                );
            }
            _ => {}
        }
    }

    v = v
        .error_if(
            trigger_config.risk_threshold_days.is_some_and(|d| d <= 0),
            "trigger_config",
            "risk_threshold_days must be greater than 0",
        )
        .error_if(
            def.target.exclude_dormant_customers && def.target.dormant_period_months <= 0,
            "target.dormant_period_months",
            "dormant_period_months must be greater than 0",
        )
        .error_if(
            def.target.exclude_recent_message_receivers && def.target.recent_message_period_days <= 0,
            "target.recent_message_period_days",
            "recent_message_period_days must be greater than 0",
        );

    if let Some(action_type) = action_type {
        v = v.error_if(
            !def.action_config.is_valid(action_type),
            "action_config",
            action_config_message(action_type),
        );
    }

    v.finish()?;
    let (Some(trigger_type), Some(action_type)) = (trigger_type, action_type) else {
        return Err(WorkflowError::validation_single("trigger_type", "trigger_type is required"));
    };

    let resolved = ResolvedDefinition {
        staff_id: def.staff_id,
        title: def.title.as_deref().unwrap_or_default().trim().to_string(),
        description: def
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        is_active: def.is_active,
        trigger_category: trigger_type.category(),
        trigger_type,
        trigger_config,
        action_type,
        action_config: def.action_config.clone(),
        target: def.target.clone(),
    };
    Ok(Validated(resolved))
}
