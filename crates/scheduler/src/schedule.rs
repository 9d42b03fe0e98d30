use audience_core::types::{Destination, ExportFormat};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

/// A recurring export of one segment to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSchedule {
    pub id: Uuid,
    pub segment_name: String,
    pub format: ExportFormat,
    pub destination: Destination,
    pub trigger: Trigger,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ExportSchedule {
    pub fn is_due(&self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        self.trigger
            .is_due(now, self.last_run, self.created_at, offset)
    }

    /// Folds a finished run back into the schedule.
    pub fn record_run(&mut self, at: DateTime<Utc>, error: Option<String>) {
        self.last_run = Some(at);
        self.last_status = Some(if error.is_none() {
            RunStatus::Success
        } else {
            RunStatus::Failure
        });
        self.last_error = error;
    }
}

/// Input for creating a schedule. Exactly one of `interval_hours` and
/// `run_time` (HH:MM) must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub segment_name: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub interval_hours: Option<u32>,
    #[serde(default)]
    pub run_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_run_sets_status_and_error() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut schedule = ExportSchedule {
            id: Uuid::new_v4(),
            segment_name: "vip".into(),
            format: ExportFormat::Csv,
            destination: Destination::None,
            trigger: Trigger::Interval { hours: 1 },
            created_at: created,
            last_run: None,
            last_status: None,
            last_error: None,
        };

        schedule.record_run(created, Some("boom".into()));
        assert_eq!(schedule.last_status, Some(RunStatus::Failure));
        assert_eq!(schedule.last_error.as_deref(), Some("boom"));

        schedule.record_run(created, None);
        assert_eq!(schedule.last_status, Some(RunStatus::Success));
        assert!(schedule.last_error.is_none());
    }

    #[test]
    fn test_request_defaults_to_local_destination() {
        let request: ScheduleRequest = serde_json::from_str(
            r#"{"segment_name": "vip", "format": "parquet", "run_time": "06:30"}"#,
        )
        .unwrap();
        assert_eq!(request.destination, Destination::None);
        assert_eq!(request.format, ExportFormat::Parquet);
        assert!(request.interval_hours.is_none());
    }
}
