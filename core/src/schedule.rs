use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A validated recurrence expression.
///
/// `@every <duration>` gives a fixed interval; anything else is handed to the
/// cron parser. Five-field expressions get a leading `0` seconds field.
#[derive(Clone, Debug)]
pub enum Schedule {
    /// Fire every fixed interval.
    Every(Duration),
    /// Fire on a cron expression.
    Cron(Box<cron::Schedule>),
}

/// Why an expression was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Nothing to parse.
    #[error("empty schedule expression")]
    Empty,
    /// `@every` with a bad or zero duration.
    #[error("invalid interval {0:?} (expected e.g. 30s, 5m, 1h30m)")]
    Interval(String),
    /// Cron parser rejected the expression.
    #[error("invalid cron expression {expr:?}: {reason}")]
    Cron {
        /// The offending expression.
        expr: String,
        /// Parser message.
        reason: String,
    },
}

impl Schedule {
    /// Parse an expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if let Some(rest) = expr.strip_prefix("@every") {
            return parse_duration(rest.trim())
                .map(Schedule::Every)
                .ok_or_else(|| ScheduleError::Interval(rest.trim().to_string()));
        }

        let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        cron::Schedule::from_str(&normalized)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| ScheduleError::Cron { expr: expr.to_string(), reason: e.to_string() })
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(d) => chrono::Duration::from_std(*d).ok().map(|d| after + d),
            Schedule::Cron(s) => s.after(&after).next(),
        }
    }

    /// The next `n` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(n);
        let mut cursor = after;
        while out.len() < n {
            match self.next_after(cursor) {
                Some(t) => {
                    out.push(t);
                    cursor = t;
                }
                None => break,
            }
        }
        out
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

/// `1h30m`, `45s`, `500ms`. Zero is rejected.
fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let n: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.checked_mul(60)?),
            "h" => Duration::from_secs(n.checked_mul(3600)?),
            "d" => Duration::from_secs(n.checked_mul(86_400)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    (!total.is_zero()).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn every_interval() {
        let s = Schedule::parse("@every 1h30m").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(s.next_after(t0).unwrap(), Utc.with_ymd_and_hms(2026, 3, 1, 11, 30, 0).unwrap());
        assert!(matches!(Schedule::parse("@every 250ms").unwrap(), Schedule::Every(d) if d == Duration::from_millis(250)));
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let s = Schedule::parse("*/15 * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 10).unwrap();
        let next = s.next_after(t0).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 15, 0));
    }

    #[test]
    fn descriptors_and_seconds_fields() {
        assert!(Schedule::parse("@hourly").is_ok());
        assert!(Schedule::parse("*/5 * * * * *").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Schedule::parse("   "), Err(ScheduleError::Empty)));
        assert!(matches!(Schedule::parse("@every"), Err(ScheduleError::Interval(_))));
        assert!(matches!(Schedule::parse("@every 0s"), Err(ScheduleError::Interval(_))));
        assert!(matches!(Schedule::parse("@every 5x"), Err(ScheduleError::Interval(_))));
        assert!(matches!(Schedule::parse("not a cron"), Err(ScheduleError::Cron { .. })));
        assert!(Schedule::parse("61 * * * *").is_err());
    }

    #[test]
    fn upcoming_is_increasing() {
        let s = Schedule::parse("0 * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap();
        let times = s.upcoming(t0, 3);
        assert_eq!(times.len(), 3);
        assert_eq!(times[0].hour(), 11);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }
}
