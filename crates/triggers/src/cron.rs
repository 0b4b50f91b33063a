//! Five-field POSIX cron expressions and the dispatcher that polls them.
//!
//! No cron-parsing crate is pulled in here — none of the reference pack's
//! dependency trees carry one, and the grammar in the spec (wildcard,
//! range, step, list) is small enough to hand-roll the same way the
//! engine's scheduler hand-rolls its topological sort instead of reaching
//! for `petgraph`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sink::{FireContext, FireSink, TriggerType};
use crate::TriggerError;

/// A single field's allowed values, expanded to a bitmask over `[min, max]`.
fn parse_field(spec: &str, min: u32, max: u32) -> Result<Vec<bool>, TriggerError> {
    let mut mask = vec![false; (max - min + 1) as usize];
    for item in spec.split(',') {
        for value in expand_item(item, min, max, spec)? {
            if value < min || value > max {
                return Err(TriggerError::InvalidCronExpression(
                    spec.to_owned(),
                    format!("value {value} out of range [{min}, {max}]"),
                ));
            }
            mask[(value - min) as usize] = true;
        }
    }
    Ok(mask)
}

/// Day-of-week field: standard crontab accepts both `0` and `7` for
/// Sunday. Parsed over `0..=7` so `7` is in range, then folded onto index
/// `0` and truncated back to the `0..=6` mask `CronSchedule::matches`
/// indexes with (`chrono`'s `num_days_from_sunday` never returns 7).
fn parse_dow_field(spec: &str) -> Result<Vec<bool>, TriggerError> {
    let mut mask = parse_field(spec, 0, 7)?;
    if mask[7] {
        mask[0] = true;
    }
    mask.truncate(7);
    Ok(mask)
}

fn expand_item(item: &str, min: u32, max: u32, whole: &str) -> Result<Vec<u32>, TriggerError> {
    let bad = |msg: &str| TriggerError::InvalidCronExpression(whole.to_owned(), msg.to_owned());

    let (range_part, step) = match item.split_once('/') {
        Some((r, s)) => (
            r,
            Some(s.parse::<u32>().map_err(|_| bad("invalid step"))?),
        ),
        None => (item, None),
    };

    let (lo, hi) = if range_part == "*" {
        (min, max)
    } else if let Some((a, b)) = range_part.split_once('-') {
        (
            a.parse::<u32>().map_err(|_| bad("invalid range start"))?,
            b.parse::<u32>().map_err(|_| bad("invalid range end"))?,
        )
    } else {
        let v = range_part.parse::<u32>().map_err(|_| bad("invalid value"))?;
        (v, v)
    };

    if lo > hi {
        return Err(bad("range start after end"));
    }

    let step = step.unwrap_or(1).max(1);
    Ok((lo..=hi).step_by(step as usize).collect())
}

/// A parsed, matchable cron schedule. Always evaluated in UTC.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: Vec<bool>,
    hour: Vec<bool>,
    day_of_month: Vec<bool>,
    month: Vec<bool>,
    day_of_week: Vec<bool>,
    source: String,
}

impl CronSchedule {
    /// Parse a standard five-field crontab expression
    /// (`minute hour day-of-month month day-of-week`).
    pub fn parse(expression: &str) -> Result<Self, TriggerError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(TriggerError::InvalidCronExpression(
                expression.to_owned(),
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_dow_field(fields[4])?,
            source: expression.to_owned(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether `dt` (truncated to the minute) satisfies this schedule.
    pub fn matches(&self, dt: DateTime<Utc>) -> bool {
        self.minute[dt.minute() as usize]
            && self.hour[dt.hour() as usize]
            && self.day_of_month[(dt.day() - 1) as usize]
            && self.month[(dt.month() - 1) as usize]
            && self.day_of_week[dt.weekday().num_days_from_sunday() as usize]
    }

    /// The next minute-aligned instant strictly after `after` that matches.
    /// Bounded to a four-year scan so a never-matching expression
    /// (e.g. `31 feb`) terminates rather than looping forever.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + ChronoDuration::minutes(1))
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))?;
        let limit = 4 * 366 * 24 * 60;
        let mut candidate = start;
        for _ in 0..limit {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }
}

/// Outcome of one poll tick for one registered cron trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronPollOutcome {
    Fired { trigger_id: Uuid, run_id: Uuid },
    Skipped { trigger_id: Uuid },
    FireFailed { trigger_id: Uuid, reason: String },
}

struct CronEntry {
    id: Uuid,
    workflow_name: String,
    schedule: CronSchedule,
    tags: Vec<String>,
    enabled: AtomicBool,
    max_concurrent: u32,
    in_flight: AtomicU32,
    run_count: AtomicU64,
    last_fired_at: Mutex<Option<DateTime<Utc>>>,
    next_fire_at: Mutex<Option<DateTime<Utc>>>,
}

/// Registry + poll loop for cron triggers. Cloneable handle (internals are
/// `Arc`-shared), so it can be polled from a background task while the
/// registering side holds its own handle.
#[derive(Clone)]
pub struct CronDispatcher {
    entries: Arc<DashMap<Uuid, CronEntry>>,
}

impl Default for CronDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CronDispatcher {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn register(
        &self,
        workflow_name: impl Into<String>,
        expression: &str,
        max_concurrent: u32,
        tags: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, TriggerError> {
        let schedule = CronSchedule::parse(expression)?;
        let next_fire_at = schedule.next_after(now);
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            CronEntry {
                id,
                workflow_name: workflow_name.into(),
                schedule,
                tags,
                enabled: AtomicBool::new(true),
                max_concurrent: max_concurrent.max(1),
                in_flight: AtomicU32::new(0),
                run_count: AtomicU64::new(0),
                last_fired_at: Mutex::new(None),
                next_fire_at: Mutex::new(next_fire_at),
            },
        );
        Ok(id)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), TriggerError> {
        let entry = self.entries.get(&id).ok_or(TriggerError::NotFound(id))?;
        entry.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    pub fn run_count(&self, id: Uuid) -> Option<u64> {
        self.entries.get(&id).map(|e| e.run_count.load(Ordering::Acquire))
    }

    /// `(total, enabled)` across every registered cron trigger, for
    /// `TriggerDispatcher::stats`.
    pub fn counts(&self) -> (usize, usize) {
        let total = self.entries.len();
        let enabled = self.entries.iter().filter(|e| e.enabled.load(Ordering::Acquire)).count();
        (total, enabled)
    }

    /// Fire every due, enabled trigger exactly once. A trigger already at
    /// its `max_concurrent` in-flight count is skipped, not queued.
    pub async fn poll_once(
        &self,
        now: DateTime<Utc>,
        sink: &dyn FireSink,
    ) -> Vec<CronPollOutcome> {
        let due_ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| {
                e.enabled.load(Ordering::Acquire)
                    && matches!(*e.next_fire_at.lock(), Some(t) if t <= now)
            })
            .map(|e| *e.key())
            .collect();

        let mut outcomes = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            let Some(entry) = self.entries.get(&id) else { continue };

            let prior_in_flight = entry.in_flight.fetch_add(1, Ordering::AcqRel);
            if prior_in_flight >= entry.max_concurrent {
                entry.in_flight.fetch_sub(1, Ordering::AcqRel);
                debug!(trigger_id = %id, "cron tick skipped — max_concurrent in flight");
                outcomes.push(CronPollOutcome::Skipped { trigger_id: id });
                // Still advance next_fire_at so a permanently-busy trigger
                // doesn't fire every tick once it frees up.
                let next = entry.schedule.next_after(now);
                *entry.next_fire_at.lock() = next;
                continue;
            }

            let ctx = FireContext {
                trigger_id: id,
                trigger_type: TriggerType::Cron,
                payload: serde_json::json!({}),
                tags: entry.tags.clone(),
                next_fire_at: entry.schedule.next_after(now),
            };
            let result = sink.fire(&entry.workflow_name, ctx).await;
            entry.in_flight.fetch_sub(1, Ordering::AcqRel);

            match result {
                Ok(run_id) => {
                    entry.run_count.fetch_add(1, Ordering::AcqRel);
                    *entry.last_fired_at.lock() = Some(now);
                    outcomes.push(CronPollOutcome::Fired { trigger_id: id, run_id });
                }
                Err(e) => {
                    warn!(trigger_id = %id, error = %e, "cron fire failed");
                    outcomes.push(CronPollOutcome::FireFailed {
                        trigger_id: id,
                        reason: e.to_string(),
                    });
                }
            }

            let next = entry.schedule.next_after(now);
            *entry.next_fire_at.lock() = next;
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use test_case::test_case;

    struct RecordingSink {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl FireSink for RecordingSink {
        async fn fire(&self, _workflow_name: &str, _ctx: FireContext) -> Result<Uuid, TriggerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            Ok(Uuid::new_v4())
        }
    }

    #[test]
    fn wildcard_every_minute_matches_anything() {
        let sched = CronSchedule::parse("* * * * *").unwrap();
        assert!(sched.matches(Utc::now()));
    }

    #[test]
    fn step_expression_matches_only_multiples() {
        let sched = CronSchedule::parse("*/15 * * * *").unwrap();
        let dt = Utc::now().with_minute(30).unwrap().with_second(0).unwrap();
        assert!(sched.matches(dt));
        let dt2 = Utc::now().with_minute(31).unwrap().with_second(0).unwrap();
        assert!(!sched.matches(dt2));
    }

    #[test]
    fn invalid_field_count_is_rejected() {
        assert!(CronSchedule::parse("* * * *").is_err());
    }

    #[test_case(0, true; "0 means sunday")]
    #[test_case(7, true; "7 folds onto sunday per standard crontab")]
    #[test_case(1, false; "1 is monday, not sunday")]
    #[test_case(3, false; "3 is wednesday, not sunday")]
    #[test_case(6, false; "6 is saturday, not sunday")]
    fn day_of_week_field_boundary(value: u32, expect_match: bool) {
        let sched = CronSchedule::parse(&format!("0 0 * * {value}")).unwrap();
        // 2024-01-07 is a Sunday.
        let sunday = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        assert_eq!(sched.matches(sunday), expect_match);
    }

    #[test_case("60 * * * *"; "minute 60 is out of range")]
    #[test_case("* 24 * * *"; "hour 24 is out of range")]
    #[test_case("* * 0 * *"; "day-of-month 0 is out of range")]
    #[test_case("* * 32 * *"; "day-of-month 32 is out of range")]
    #[test_case("* * * 0 *"; "month 0 is out of range")]
    #[test_case("* * * 13 *"; "month 13 is out of range")]
    #[test_case("* * * * 8"; "day-of-week 8 is out of range even with the 0/7 fold")]
    fn out_of_range_field_is_rejected(expr: &str) {
        assert!(CronSchedule::parse(expr).is_err());
    }

    #[test]
    fn next_after_advances_to_the_next_matching_minute() {
        let sched = CronSchedule::parse("0 * * * *").unwrap();
        let start = Utc::now().with_minute(10).unwrap().with_second(0).unwrap();
        let next = sched.next_after(start).unwrap();
        assert_eq!(next.minute(), 0);
        assert!(next > start);
    }

    #[tokio::test]
    async fn max_concurrent_one_skips_overlapping_tick() {
        let dispatcher = CronDispatcher::new();
        let now = Utc::now().with_second(0).unwrap();
        let sink = RecordingSink {
            calls: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(50)),
        };
        let id = dispatcher
            .register("slow-wf", "* * * * *", 1, vec![], now)
            .unwrap();
        // Force immediate eligibility.
        {
            let entry = dispatcher.entries.get(&id).unwrap();
            *entry.next_fire_at.lock() = Some(now);
        }

        // Two concurrent polls at the same instant: one should fire, the
        // in-flight one observed by the second call should be skipped.
        let d2 = dispatcher.clone();
        let fut1 = dispatcher.poll_once(now, &sink);
        let fut2 = d2.poll_once(now, &sink);
        let (o1, o2) = tokio::join!(fut1, fut2);
        let fired = o1
            .iter()
            .chain(o2.iter())
            .filter(|o| matches!(o, CronPollOutcome::Fired { .. }))
            .count();
        let skipped = o1
            .iter()
            .chain(o2.iter())
            .filter(|o| matches!(o, CronPollOutcome::Skipped { .. }))
            .count();
        assert_eq!(fired, 1, "exactly one concurrent tick should fire");
        assert_eq!(skipped, 1, "the overlapping tick must be skipped, not queued");
    }
}
