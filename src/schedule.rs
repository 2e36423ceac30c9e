//! Schedule windows.
//!
//! A schedule is a per-weekday list of minute ranges (0–1439, endpoints
//! inclusive). Note the inverted reading at the policy layer: a schedule
//! that is IN window SUPPRESSES the policy it is bound to, so schedules
//! describe when a rule group is paused, not when it applies.

use std::collections::HashMap;

use time::{OffsetDateTime, Weekday};

use crate::config::Config;

/// A `[start, end]` pair in minutes from midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MinuteRange {
    start: u16,
    end: u16,
}

/// Per-schedule weekday window maps, built once from the configuration.
#[derive(Debug)]
pub struct ScheduleMatcher {
    schedules: HashMap<String, HashMap<Weekday, Vec<MinuteRange>>>,
}

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Sunday,
    Weekday::Monday,
    Weekday::Tuesday,
    Weekday::Wednesday,
    Weekday::Thursday,
    Weekday::Friday,
    Weekday::Saturday,
];

impl ScheduleMatcher {
    /// Build the matcher. Malformed days or ranges are fatal.
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut schedules = HashMap::new();

        for sched in &cfg.schedules {
            let mut week: HashMap<Weekday, Vec<MinuteRange>> = HashMap::new();

            for item in &sched.items {
                let mut ranges = Vec::with_capacity(item.ranges.len());
                for raw in &item.ranges {
                    let r = parse_time_range(raw).ok_or_else(|| {
                        anyhow::anyhow!("invalid range '{}' in schedule '{}'", raw, sched.name)
                    })?;
                    ranges.push(r);
                }

                if item.days.is_empty() {
                    for day in ALL_DAYS {
                        week.entry(day).or_default().extend(&ranges);
                    }
                } else {
                    for day_str in &item.days {
                        let day = parse_weekday(day_str).ok_or_else(|| {
                            anyhow::anyhow!("invalid day '{}' in schedule '{}'", day_str, sched.name)
                        })?;
                        week.entry(day).or_default().extend(&ranges);
                    }
                }
            }

            schedules.insert(sched.name.clone(), week);
        }

        Ok(Self { schedules })
    }

    /// Whether `name` is in-window at `now`.
    ///
    /// The empty name means "no schedule" and is never in-window; so is
    /// a name that was not configured.
    pub fn is_active(&self, name: &str, now: OffsetDateTime) -> bool {
        if name.is_empty() {
            return false;
        }
        let Some(week) = self.schedules.get(name) else {
            return false;
        };
        let Some(ranges) = week.get(&now.weekday()) else {
            return false;
        };

        let minutes = now.hour() as u16 * 60 + now.minute() as u16;
        ranges.iter().any(|r| r.start <= minutes && minutes <= r.end)
    }
}

/// The instant used for schedule checks: local wall clock when the
/// platform exposes the offset, UTC otherwise.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_ascii_lowercase().as_str() {
        "sun" | "sunday" => Some(Weekday::Sunday),
        "mon" | "monday" => Some(Weekday::Monday),
        "tue" | "tuesday" => Some(Weekday::Tuesday),
        "wed" | "wednesday" => Some(Weekday::Wednesday),
        "thu" | "thursday" => Some(Weekday::Thursday),
        "fri" | "friday" => Some(Weekday::Friday),
        "sat" | "saturday" => Some(Weekday::Saturday),
        _ => None,
    }
}

fn parse_time_range(s: &str) -> Option<MinuteRange> {
    let (start, end) = s.split_once('-')?;
    Some(MinuteRange {
        start: parse_minutes(start)?,
        end: parse_minutes(end)?,
    })
}

fn parse_minutes(hhmm: &str) -> Option<u16> {
    let (h, m) = hhmm.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}
