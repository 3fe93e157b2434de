// Workflow Schedule - Next-slot computation for periodic and special workflows

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use salonflow_shared::{ScheduleRule, Workflow};

/// Longest accepted `every N minutes` period: one leap year.
pub const MAX_EVERY_MINUTES: i64 = 366 * 24 * 60;

/// Resolves schedule rules against a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleClock {
    timezone: Tz,
    default_run_time: NaiveTime,
}

impl ScheduleClock {
    pub fn new(timezone: Tz, default_run_time: NaiveTime) -> Self {
        Self {
            timezone,
            default_run_time,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Explicit rule, or daily at the default run time.
    pub fn rule_for(&self, workflow: &Workflow) -> ScheduleRule {
        workflow
            .trigger_config
            .schedule
            .clone()
            .unwrap_or(ScheduleRule::Daily {
                at: self.default_run_time,
            })
    }

    /// Slot a workflow should carry in `next_scheduled_at` right now, or
    /// `None` when it is not driven by the scheduler.
    pub fn initial_slot(&self, workflow: &Workflow, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !workflow.can_execute() || !workflow.trigger_category.is_scheduled() {
            return None;
        }
        self.next_after(&self.rule_for(workflow), now)
    }

    /// First slot strictly after `after`. Missed slots in between are never
    /// returned, so a late tick fires at most once and realigns.
    pub fn next_after(&self, rule: &ScheduleRule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match rule {
            ScheduleRule::Daily { at } => self.next_matching_day(after, *at, |_| true),
            ScheduleRule::Weekly { weekday, at } => {
                self.next_matching_day(after, *at, |d| d.weekday() == *weekday)
            }
            ScheduleRule::Every { minutes } => {
                let step = minutes.checked_mul(60).filter(|s| *s > 0)?;
                let next = (after.timestamp().div_euclid(step) + 1).checked_mul(step)?;
                DateTime::from_timestamp(next, 0)
            }
        }
    }

    fn next_matching_day(
        &self,
        after: DateTime<Utc>,
        at: NaiveTime,
        day_matches: impl Fn(NaiveDate) -> bool,
    ) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&self.timezone).date_naive();
        (0..=8)
            .filter_map(|offset| start.checked_add_signed(Duration::days(offset)))
            .filter(|day| day_matches(*day))
            .filter_map(|day| self.localize(day, at))
            .find(|slot| *slot > after)
    }

    /// Wall-clock time on `day` as an instant. Ambiguous times take the
    /// earliest instant; times inside a DST gap move forward by the gap.
    fn localize(&self, day: NaiveDate, at: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = day.and_time(at);
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
    }
}
