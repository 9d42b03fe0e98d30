//! Recurring export triggers and due detection.

use audience_core::{AudienceError, AudienceResult};
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const TIME_FORMAT: &str = "%H:%M";

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIME_FORMAT;

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(TIME_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `hours` hours after the previous run.
    Interval { hours: u32 },
    /// Once a day at a wall-clock time in the scheduler's UTC offset.
    DailyAt {
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
}

impl Trigger {
    /// Builds a trigger from the two mutually exclusive request fields.
    pub fn from_request(interval_hours: Option<u32>, run_time: Option<&str>) -> AudienceResult<Self> {
        let trigger = match (interval_hours, run_time.map(str::trim)) {
            (Some(_), Some(_)) => {
                return Err(AudienceError::config(
                    "specify either interval_hours or run_time, not both",
                ))
            }
            (None, None) => {
                return Err(AudienceError::config(
                    "one of interval_hours or run_time is required",
                ))
            }
            (Some(hours), None) => Trigger::Interval { hours },
            (None, Some(raw)) => Trigger::DailyAt {
                time: NaiveTime::parse_from_str(raw, TIME_FORMAT).map_err(|_| {
                    AudienceError::config(format!("run_time '{raw}' is not a valid HH:MM time"))
                })?,
            },
        };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn validate(&self) -> AudienceResult<()> {
        match self {
            Trigger::Interval { hours: 0 } => {
                Err(AudienceError::config("interval_hours must be at least 1"))
            }
            _ => Ok(()),
        }
    }

    /// Most recent occurrence of a daily time at or before `now`, in UTC.
    fn last_fire(time: NaiveTime, now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        let local_now = now.with_timezone(&offset).naive_local();
        let mut fire = local_now.date().and_time(time);
        if fire > local_now {
            fire -= Duration::days(1);
        }
        // A fixed offset maps every local time to exactly one instant.
        offset
            .from_local_datetime(&fire)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&(fire - offset)))
    }

    /// Interval: due when never run or at least `hours` since the last run.
    /// DailyAt: due when the latest occurrence of the time is after the last
    /// run, or after creation for a schedule that has never run.
    pub fn is_due(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        offset: FixedOffset,
    ) -> bool {
        match *self {
            Trigger::Interval { hours } => match last_run {
                None => true,
                Some(last) => now - last >= Duration::hours(i64::from(hours)),
            },
            Trigger::DailyAt { time } => {
                let reference = last_run.unwrap_or(created_at);
                Self::last_fire(time, now, offset) > reference
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, h, m, 0).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn noon() -> Trigger {
        Trigger::DailyAt {
            time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_from_request_requires_exactly_one() {
        assert_eq!(
            Trigger::from_request(Some(6), None).unwrap(),
            Trigger::Interval { hours: 6 }
        );
        assert_eq!(Trigger::from_request(None, Some("12:00")).unwrap(), noon());
        assert!(Trigger::from_request(Some(6), Some("12:00")).is_err());
        assert!(Trigger::from_request(None, None).is_err());
        assert!(Trigger::from_request(Some(0), None).is_err());
        assert!(Trigger::from_request(None, Some("25:00")).is_err());
        assert!(Trigger::from_request(None, Some("noon")).is_err());
    }

    #[test]
    fn test_interval_due_immediately_then_after_period() {
        let hourly = Trigger::Interval { hours: 1 };
        let created = at(9, 0);
        assert!(hourly.is_due(at(9, 0), None, created, utc()));

        let last = at(9, 1);
        assert!(!hourly.is_due(at(9, 30), Some(last), created, utc()));
        assert!(!hourly.is_due(at(10, 0), Some(last), created, utc()));
        assert!(hourly.is_due(at(10, 1), Some(last), created, utc()));
    }

    #[test]
    fn test_daily_fires_once_per_day() {
        let created = at(8, 0);
        assert!(!noon().is_due(at(11, 59), None, created, utc()));
        assert!(noon().is_due(at(12, 0), None, created, utc()));

        let ran = at(12, 1);
        assert!(!noon().is_due(at(12, 30), Some(ran), created, utc()));
        assert!(!noon().is_due(at(23, 59), Some(ran), created, utc()));

        let tomorrow_noon = ran + Duration::hours(24) - Duration::minutes(1);
        assert!(!noon().is_due(tomorrow_noon - Duration::minutes(1), Some(ran), created, utc()));
        assert!(noon().is_due(tomorrow_noon, Some(ran), created, utc()));
    }

    #[test]
    fn test_daily_created_after_time_waits_for_next_day() {
        let created = at(13, 0);
        assert!(!noon().is_due(at(18, 0), None, created, utc()));
        assert!(noon().is_due(at(12, 0) + Duration::days(1), None, created, utc()));
    }

    #[test]
    fn test_daily_honours_offset() {
        // 12:00 at UTC-05:00 is 17:00 UTC.
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let created = at(8, 0);
        assert!(!noon().is_due(at(16, 59), None, created, offset));
        assert!(noon().is_due(at(17, 0), None, created, offset));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(noon()).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "daily_at", "time": "12:00"}));
        let back: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(back, noon());
    }
}
