use chrono::{DateTime, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Half-open time range `[start, end)` selecting a cohort of sessions by `first_visit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CohortWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::Validation(
                "window end must be after window start".into(),
            ));
        }
        Ok(Self { start, end })
    }

    /// The trailing `days` days ending at `now`.
    pub fn trailing_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: now - Duration::days(days.max(1)),
            end: now,
        }
    }

    /// Calendar dates `start_date..=end_date` interpreted in the IANA timezone `tz`.
    ///
    /// Boundaries are local midnights converted to UTC; an ambiguous midnight
    /// (DST fall-back) resolves to the earlier instant.
    pub fn from_local_dates(
        start_date: NaiveDate,
        end_date: NaiveDate,
        tz: &str,
    ) -> Result<Self, EngineError> {
        if end_date < start_date {
            return Err(EngineError::Validation(
                "end_date must be on or after start_date".into(),
            ));
        }
        let tz: Tz = tz
            .trim()
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid timezone: {tz}")))?;
        let start = local_midnight_utc(tz, start_date)?;
        let end = local_midnight_utc(tz, end_date + Duration::days(1))?;
        Self::new(start, end)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn local_midnight_utc(tz: Tz, date: NaiveDate) -> Result<DateTime<Utc>, EngineError> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| EngineError::Validation("invalid date boundary".into()))?;
    let zoned = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(a, b) => a.min(b),
        LocalResult::None => {
            return Err(EngineError::Validation(
                "date boundary falls in a timezone transition".into(),
            ))
        }
    };
    Ok(zoned.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_dates_convert_to_utc_bounds() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 15).expect("date");
        let window = CohortWindow::from_local_dates(day, day, "Europe/Warsaw").expect("window");
        assert_eq!(window.start.to_rfc3339(), "2026-01-14T23:00:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2026-01-15T23:00:00+00:00");
    }

    #[test]
    fn unknown_timezone_is_a_validation_error() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 15).expect("date");
        let err = CohortWindow::from_local_dates(day, day, "Mars/Olympus").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let window = CohortWindow::new(start, start + Duration::hours(1)).expect("window");
        assert!(window.contains(start));
        assert!(!window.contains(start + Duration::hours(1)));
        assert!(CohortWindow::new(start, start).is_err());
    }
}
