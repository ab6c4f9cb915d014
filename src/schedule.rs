/*!
 # Schedule evaluation

 Decides whether the configured window is active at the current wall time.
 A day whose weekday flag is off is never active.

 The weekday comes from the UTC date unless [`DayBoundary::Local`] is
 selected; the time of day is always local.
*/

use chrono::{DateTime, Datelike};
use tracing::trace;

use crate::clock::{local_seconds, to_local_time_string, ClockState};
use crate::config::{ScheduleConfig, TimeOfDay};

/// Weekday names as used in the configuration record, Monday first
pub const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// How the current time is tested against `[start, end)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Plain `HH:MM` string comparison. A window crossing midnight
    /// (start after end) never matches.
    #[default]
    Lexicographic,
    /// Minutes-since-midnight comparison; start after end wraps midnight
    WrapAware,
}

/// Which calendar date selects the weekday flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DayBoundary {
    /// Weekday of the UTC date
    #[default]
    Utc,
    /// Weekday of the local date, so days turn over at local midnight
    Local,
}

/// Weekday of the UTC date holding `epoch_seconds`, Monday = 0
pub fn weekday_index(epoch_seconds: i64) -> usize {
    match DateTime::from_timestamp(epoch_seconds, 0) {
        Some(dt) => dt.weekday().num_days_from_monday() as usize,
        // 1970-01-01 was a Thursday
        None => (epoch_seconds.div_euclid(86_400) + 3).rem_euclid(7) as usize,
    }
}

/// Result of one schedule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub weekday: usize,
    pub day_active: bool,
    pub local_time: String,
    pub window_active: bool,
    /// Red-light window state; false when the schedule has none
    pub red_window_active: bool,
}

impl Evaluation {
    pub fn day_name(&self) -> &'static str {
        WEEKDAY_NAMES[self.weekday % 7]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleEvaluator {
    policy: WindowPolicy,
    day_boundary: DayBoundary,
}

impl ScheduleEvaluator {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            day_boundary: DayBoundary::Utc,
        }
    }

    pub fn with_day_boundary(mut self, day_boundary: DayBoundary) -> Self {
        self.day_boundary = day_boundary;
        self
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    pub fn day_boundary(&self) -> DayBoundary {
        self.day_boundary
    }

    /// Whether the light should be on right now
    pub fn is_active_now(&self, config: &ScheduleConfig, clock: &ClockState) -> bool {
        self.evaluate(config, clock).window_active
    }

    pub fn evaluate(&self, config: &ScheduleConfig, clock: &ClockState) -> Evaluation {
        let offset = config.timezone_offset_hours;
        let weekday = match self.day_boundary {
            DayBoundary::Utc => weekday_index(clock.epoch_seconds),
            DayBoundary::Local => weekday_index(local_seconds(clock.epoch_seconds, offset)),
        };
        let day_active = config.weekday_active[weekday];
        let local_time = to_local_time_string(clock.epoch_seconds, offset);
        let window_active =
            day_active && self.in_window(&config.window_start, &config.window_end, &local_time);
        let red_window_active = day_active
            && config.red_light.as_ref().is_some_and(|red| {
                self.in_window(&red.window_start, &red.window_end, &local_time)
            });
        trace!(
            "{} {} day_active={} window_active={} red_window_active={}",
            WEEKDAY_NAMES[weekday],
            local_time,
            day_active,
            window_active,
            red_window_active
        );
        Evaluation {
            weekday,
            day_active,
            local_time,
            window_active,
            red_window_active,
        }
    }

    fn in_window(&self, start: &TimeOfDay, end: &TimeOfDay, now: &str) -> bool {
        match self.policy {
            WindowPolicy::Lexicographic => now >= start.as_str() && now < end.as_str(),
            WindowPolicy::WrapAware => {
                let Some(now) = TimeOfDay::parse(now) else {
                    return false;
                };
                let (now, start, end) = (
                    now.minutes_since_midnight(),
                    start.minutes_since_midnight(),
                    end.minutes_since_midnight(),
                );
                if start < end {
                    now >= start && now < end
                } else {
                    now >= start || now < end
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedLightWindow;

    // Thursday 2025-04-17 12:32:30 UTC
    const THURSDAY_NOON: i64 = 1_744_893_150;

    fn config(start: &str, end: &str, days: [bool; 7]) -> ScheduleConfig {
        ScheduleConfig {
            light_intensity: 50,
            window_start: TimeOfDay::parse(start).expect("valid start"),
            window_end: TimeOfDay::parse(end).expect("valid end"),
            timezone_offset_hours: 0,
            daylight_saving: false,
            weekday_active: days,
            red_light: None,
        }
    }

    fn at(epoch_seconds: i64) -> ClockState {
        ClockState {
            epoch_seconds,
            residual_micros: 0,
        }
    }

    #[test]
    fn epoch_start_is_thursday() {
        assert_eq!(WEEKDAY_NAMES[weekday_index(0)], "Thursday");
        assert_eq!(WEEKDAY_NAMES[weekday_index(THURSDAY_NOON)], "Thursday");
        assert_eq!(WEEKDAY_NAMES[weekday_index(THURSDAY_NOON + 86_400 * 3)], "Sunday");
        assert_eq!(WEEKDAY_NAMES[weekday_index(-1)], "Wednesday");
    }

    #[test]
    fn inactive_day_is_never_active() {
        let mut days = [true; 7];
        days[3] = false;
        let evaluator = ScheduleEvaluator::default();
        let all_day = config("00:00", "23:59", days);

        for minute in (0..24 * 60).step_by(7) {
            let clock = at(THURSDAY_NOON - 45_150 + minute * 60);
            assert!(!evaluator.is_active_now(&all_day, &clock));
        }
    }

    #[test]
    fn window_is_half_open() {
        let evaluator = ScheduleEvaluator::default();
        let cfg = config("12:00", "13:00", [true; 7]);
        let midnight = THURSDAY_NOON - 45_150;

        assert!(!evaluator.is_active_now(&cfg, &at(midnight + 11 * 3600 + 59 * 60)));
        assert!(evaluator.is_active_now(&cfg, &at(midnight + 12 * 3600)));
        assert!(evaluator.is_active_now(&cfg, &at(midnight + 12 * 3600 + 59 * 60 + 59)));
        assert!(!evaluator.is_active_now(&cfg, &at(midnight + 13 * 3600)));
    }

    #[test]
    fn timezone_shifts_the_window() {
        let evaluator = ScheduleEvaluator::default();
        let mut cfg = config("13:00", "14:00", [true; 7]);
        assert!(!evaluator.is_active_now(&cfg, &at(THURSDAY_NOON)));
        cfg.timezone_offset_hours = 1;
        assert!(evaluator.is_active_now(&cfg, &at(THURSDAY_NOON)));
    }

    #[test]
    fn midnight_crossing_window_depends_on_policy() {
        let cfg = config("22:00", "02:00", [true; 7]);
        let late = at(THURSDAY_NOON - 45_150 + 23 * 3600);
        let early = at(THURSDAY_NOON - 45_150 + 3600);

        let lexicographic = ScheduleEvaluator::new(WindowPolicy::Lexicographic);
        assert!(!lexicographic.is_active_now(&cfg, &late));
        assert!(!lexicographic.is_active_now(&cfg, &early));

        let wrap = ScheduleEvaluator::new(WindowPolicy::WrapAware);
        assert!(wrap.is_active_now(&cfg, &late));
        assert!(wrap.is_active_now(&cfg, &early));
        assert!(!wrap.is_active_now(&cfg, &at(THURSDAY_NOON)));
    }

    #[test]
    fn evaluation_reports_day_and_time() {
        let evaluator = ScheduleEvaluator::default();
        let cfg = config("12:00", "13:00", [true; 7]);
        let eval = evaluator.evaluate(&cfg, &at(THURSDAY_NOON));
        assert_eq!(eval.day_name(), "Thursday");
        assert_eq!(eval.local_time, "12:32");
        assert!(eval.day_active && eval.window_active);
    }

    #[test]
    fn weekday_follows_utc_date_by_default() {
        // Thursday 23:30 UTC is Friday 00:30 at UTC+1
        let late_thursday = THURSDAY_NOON - 45_150 + 23 * 3600 + 30 * 60;
        let mut thursday_only = [false; 7];
        thursday_only[3] = true;
        let mut cfg = config("00:00", "01:00", thursday_only);
        cfg.timezone_offset_hours = 1;

        let utc_days = ScheduleEvaluator::default();
        assert_eq!(utc_days.day_boundary(), DayBoundary::Utc);
        let eval = utc_days.evaluate(&cfg, &at(late_thursday));
        assert_eq!(eval.day_name(), "Thursday");
        assert_eq!(eval.local_time, "00:30");
        assert!(eval.window_active);

        let local_days =
            ScheduleEvaluator::new(WindowPolicy::Lexicographic).with_day_boundary(DayBoundary::Local);
        let eval = local_days.evaluate(&cfg, &at(late_thursday));
        assert_eq!(eval.day_name(), "Friday");
        assert!(!eval.window_active);

        cfg.weekday_active = [false, false, false, false, true, false, false];
        assert!(local_days.is_active_now(&cfg, &at(late_thursday)));
        assert!(!utc_days.is_active_now(&cfg, &at(late_thursday)));
    }

    #[test]
    fn extreme_clock_values_do_not_overflow() {
        let mut cfg = config("00:00", "23:59", [true; 7]);
        cfg.timezone_offset_hours = 14;
        for boundary in [DayBoundary::Utc, DayBoundary::Local] {
            let evaluator = ScheduleEvaluator::default().with_day_boundary(boundary);
            let eval = evaluator.evaluate(&cfg, &at(i64::MAX));
            assert!(eval.weekday < 7);
            assert_eq!(eval.local_time.len(), 5);
        }
        cfg.timezone_offset_hours = -12;
        let eval = ScheduleEvaluator::default()
            .with_day_boundary(DayBoundary::Local)
            .evaluate(&cfg, &at(i64::MIN));
        assert!(eval.weekday < 7);
    }

    #[test]
    fn red_window_is_evaluated_separately() {
        let mut cfg = config("12:00", "13:00", [true; 7]);
        let evaluator = ScheduleEvaluator::default();
        assert!(!evaluator.evaluate(&cfg, &at(THURSDAY_NOON)).red_window_active);

        cfg.red_light = Some(RedLightWindow {
            light_intensity: 10,
            window_start: TimeOfDay::parse("12:30").expect("valid"),
            window_end: TimeOfDay::parse("12:45").expect("valid"),
        });
        let eval = evaluator.evaluate(&cfg, &at(THURSDAY_NOON));
        assert!(eval.window_active && eval.red_window_active);
        let eval = evaluator.evaluate(&cfg, &at(THURSDAY_NOON + 15 * 60));
        assert!(eval.window_active && !eval.red_window_active);

        cfg.weekday_active = [false; 7];
        assert!(!evaluator.evaluate(&cfg, &at(THURSDAY_NOON)).red_window_active);
    }
}
