// Workflow Conditions - Trigger predicates and target audience filters

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use salonflow_shared::{TargetAudience, TriggerConfig, TriggerType, Workflow};
use std::collections::HashMap;
use tracing::warn;

use super::triggers::{CustomerFacts, CustomerSegment, TriggerEvent};

/// Inactivity threshold used when a prevention trigger has no `risk_threshold_days`
pub const DEFAULT_RISK_THRESHOLD_DAYS: i32 = 30;
/// Churn score (0-100) at or above which `churn-risk-high` fires
pub const DEFAULT_CHURN_SCORE_THRESHOLD: i32 = 70;
/// Tolerance in days either side of a configured visit cycle
pub const VISIT_CYCLE_TOLERANCE_DAYS: i64 = 1;

/// Pure check of one trigger type. `today` is the event's local date.
pub type TriggerPredicate = fn(&TriggerConfig, &CustomerFacts, NaiveDate) -> bool;

/// Maps every trigger type to its predicate.
#[derive(Clone)]
pub struct TriggerRegistry {
    predicates: HashMap<TriggerType, TriggerPredicate>,
    timezone: Tz,
}

impl TriggerRegistry {
    pub fn standard(timezone: Tz) -> Self {
        let mut predicates: HashMap<TriggerType, TriggerPredicate> = HashMap::new();
        predicates.insert(TriggerType::NewCustomerFollowup, new_customer_followup);
        predicates.insert(TriggerType::VipAttentionNeeded, vip_attention_needed);
        predicates.insert(TriggerType::VisitCycle, visit_cycle);
        predicates.insert(TriggerType::SpecificTreatment, specific_treatment);
        predicates.insert(TriggerType::Birthday, birthday);
        predicates.insert(TriggerType::FirstVisitAnniversary, first_visit_anniversary);
        predicates.insert(TriggerType::VisitMilestone, visit_milestone);
        predicates.insert(TriggerType::AmountMilestone, amount_milestone);
        predicates.insert(TriggerType::FirstVisitDaysAfter, first_visit_days_after);
        predicates.insert(TriggerType::NewCustomerAtRisk, new_customer_at_risk);
        predicates.insert(TriggerType::ReactivationNeeded, reactivation_needed);
        predicates.insert(TriggerType::GrowingDelayed, growing_delayed);
        predicates.insert(TriggerType::LoyalDelayed, loyal_delayed);
        predicates.insert(TriggerType::ChurnRiskHigh, churn_risk_high);

        Self {
            predicates,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Local calendar date of an instant
    pub fn today(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// Whether `event` satisfies `workflow`'s trigger. Never touches the wall clock.
    pub fn matches(&self, workflow: &Workflow, event: &TriggerEvent) -> bool {
        if workflow.trigger_type != event.trigger_type {
            return false;
        }
        match self.predicates.get(&workflow.trigger_type) {
            Some(predicate) => predicate(
                &workflow.trigger_config,
                &event.payload,
                self.today(event.timestamp),
            ),
            None => {
                warn!(trigger_type = %workflow.trigger_type, "No predicate registered");
                false
            }
        }
    }
}

/// Whether a customer belongs to a workflow's target audience.
pub fn audience_admits(
    target: &TargetAudience,
    facts: &CustomerFacts,
    now: DateTime<Utc>,
    today: NaiveDate,
) -> bool {
    if !target.customer_grade_ids.is_empty()
        && !facts
            .grade_id
            .is_some_and(|g| target.customer_grade_ids.contains(&g))
    {
        return false;
    }

    if !target.tag_ids.is_empty() && !facts.tag_ids.iter().any(|t| target.tag_ids.contains(t)) {
        return false;
    }

    if target.exclude_dormant_customers && target.dormant_period_months > 0 {
        let cutoff = today.checked_sub_months(Months::new(target.dormant_period_months as u32));
        if let (Some(last), Some(cutoff)) = (facts.last_visit_on, cutoff) {
            if last < cutoff {
                return false;
            }
        }
    }

    if target.exclude_recent_message_receivers && target.recent_message_period_days > 0 {
        let since = now - chrono::Duration::days(i64::from(target.recent_message_period_days));
        if facts.last_message_at.is_some_and(|at| at > since) {
            return false;
        }
    }

    true
}

fn days_since(date: Option<NaiveDate>, today: NaiveDate) -> Option<i64> {
    date.map(|d| (today - d).num_days())
}

fn risk_threshold(config: &TriggerConfig) -> i64 {
    i64::from(config.risk_threshold_days.unwrap_or(DEFAULT_RISK_THRESHOLD_DAYS))
}

fn inactive_for_threshold(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    days_since(facts.last_visit_on, today).is_some_and(|d| d >= risk_threshold(config))
}

/// Same month and day in `year`; Feb 29 falls back to Feb 28.
fn anniversary_in(date: NaiveDate, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, date.month(), date.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), date.day() - 1))
}

pub fn days_until_birthday(birthday: NaiveDate, today: NaiveDate) -> Option<i64> {
    let this_year = anniversary_in(birthday, today.year())?;
    let next = if this_year >= today {
        this_year
    } else {
        anniversary_in(birthday, today.year() + 1)?
    };
    Some((next - today).num_days())
}

// Lifecycle

fn new_customer_followup(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    let window = i64::from(config.followup_days.unwrap_or(0));
    facts.visit_count <= 1
        && days_since(facts.registered_on, today).is_some_and(|d| (0..=window).contains(&d))
}

fn vip_attention_needed(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    facts.segment == Some(CustomerSegment::Vip) && inactive_for_threshold(config, facts, today)
}

// Periodic

fn visit_cycle(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    let Some(cycle) = config.visit_cycle_days else {
        return false;
    };
    days_since(facts.last_visit_on, today)
        .is_some_and(|d| (d - i64::from(cycle)).abs() <= VISIT_CYCLE_TOLERANCE_DAYS)
}

fn specific_treatment(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    let same_treatment = matches!(
        (config.treatment_id.as_deref(), facts.treatment_id.as_deref()),
        (Some(wanted), Some(got)) if wanted == got
    );
    if !same_treatment {
        return false;
    }
    match config.days_after_treatment {
        Some(days) => days_since(facts.treatment_on, today) == Some(i64::from(days)),
        None => true,
    }
}

// Special dates and milestones

fn birthday(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    let Some(days_before) = config.birthday_days_before else {
        return false;
    };
    facts
        .birthday
        .and_then(|b| days_until_birthday(b, today))
        .is_some_and(|d| d == i64::from(days_before))
}

fn first_visit_anniversary(_config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    facts.first_visit_on.is_some_and(|first| {
        first.year() < today.year() && anniversary_in(first, today.year()) == Some(today)
    })
}

fn visit_milestone(config: &TriggerConfig, facts: &CustomerFacts, _today: NaiveDate) -> bool {
    config.visit_milestone.is_some_and(|m| facts.visit_count == m)
}

fn amount_milestone(config: &TriggerConfig, facts: &CustomerFacts, _today: NaiveDate) -> bool {
    config
        .amount_milestone
        .is_some_and(|m| facts.total_revenue >= m)
}

fn first_visit_days_after(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    match (config.days_after_first_visit, days_since(facts.first_visit_on, today)) {
        (Some(wanted), Some(actual)) => actual == i64::from(wanted),
        _ => false,
    }
}

// Churn prevention

fn new_customer_at_risk(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    facts.segment == Some(CustomerSegment::New) && inactive_for_threshold(config, facts, today)
}

fn reactivation_needed(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    inactive_for_threshold(config, facts, today)
}

fn growing_delayed(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    facts.segment == Some(CustomerSegment::Growing) && inactive_for_threshold(config, facts, today)
}

fn loyal_delayed(config: &TriggerConfig, facts: &CustomerFacts, today: NaiveDate) -> bool {
    facts.segment == Some(CustomerSegment::Loyal) && inactive_for_threshold(config, facts, today)
}

fn churn_risk_high(config: &TriggerConfig, facts: &CustomerFacts, _today: NaiveDate) -> bool {
    let threshold = config.threshold_value.unwrap_or(DEFAULT_CHURN_SCORE_THRESHOLD);
    facts.churn_risk_score.is_some_and(|score| score >= threshold)
}
