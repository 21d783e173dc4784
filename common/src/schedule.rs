// Cron expression parsing and fire-time calculation
//
// Accepts standard five-field expressions (minute hour day-of-month month
// day-of-week) as well as the seconds-first six/seven-field form understood by
// the `cron` crate.

use crate::errors::ConfigurationError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// A parsed cron schedule evaluated in a fixed timezone
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: CronSchedule,
    timezone: Tz,
}

impl CronTrigger {
    pub fn new(expression: &str, timezone: Tz) -> Result<Self, ConfigurationError> {
        let schedule = parse_cron_expression(expression)?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            timezone,
        })
    }

    /// Parse with the timezone given by name (e.g. "UTC", "Asia/Ho_Chi_Minh")
    pub fn with_timezone_name(expression: &str, timezone: &str) -> Result<Self, ConfigurationError> {
        let tz = parse_timezone(timezone)?;
        Self::new(expression, tz)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `reference`
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let reference_in_tz = reference.with_timezone(&self.timezone);
        self.schedule
            .after(&reference_in_tz)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    /// Number of fire times in the half-open window (`from`, `until`]
    pub fn fires_between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> usize {
        let from_in_tz = from.with_timezone(&self.timezone);
        self.schedule
            .after(&from_in_tz)
            .take_while(|fire| fire.with_timezone(&Utc) <= until)
            .count()
    }
}

/// Normalize a five-field expression to the seconds-first form
pub fn normalize_cron_expression(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ConfigurationError> {
    let field_count = expression.split_whitespace().count();
    if !(5..=7).contains(&field_count) {
        return Err(ConfigurationError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 to 7 fields, got {}", field_count),
        });
    }

    let normalized = normalize_cron_expression(expression);
    CronSchedule::from_str(&normalized).map_err(|e| ConfigurationError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigurationError> {
    Tz::from_str(name).map_err(|_| ConfigurationError::InvalidTimezone(name.to_string()))
}
