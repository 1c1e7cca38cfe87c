//! Expiration arithmetic and display

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

/// Unit of an expiration value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ExpiryUnit {
    fn seconds(&self) -> i64 {
        match self {
            ExpiryUnit::Seconds => 1,
            ExpiryUnit::Minutes => 60,
            ExpiryUnit::Hours => 60 * 60,
            ExpiryUnit::Days => 24 * 60 * 60,
        }
    }

    /// `value` of this unit as a duration, if it fits
    pub fn duration(&self, value: i64) -> Option<Duration> {
        value
            .checked_mul(self.seconds())
            .and_then(Duration::try_seconds)
    }
}

impl FromStr for ExpiryUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(ExpiryUnit::Seconds),
            "m" | "min" | "minute" | "minutes" => Ok(ExpiryUnit::Minutes),
            "h" | "hr" | "hour" | "hours" => Ok(ExpiryUnit::Hours),
            "d" | "day" | "days" => Ok(ExpiryUnit::Days),
            other => Err(Error::InvalidArgument(format!(
                "unknown expiry unit: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ExpiryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExpiryUnit::Seconds => "seconds",
            ExpiryUnit::Minutes => "minutes",
            ExpiryUnit::Hours => "hours",
            ExpiryUnit::Days => "days",
        })
    }
}

/// Expiration instant for `value` units after `now`
///
/// A non-positive value means "never expires" and yields `None`.
pub fn expiration_from(
    now: DateTime<Utc>,
    value: i64,
    unit: ExpiryUnit,
) -> Result<Option<DateTime<Utc>>> {
    if value <= 0 {
        return Ok(None);
    }
    unit.duration(value)
        .and_then(|d| now.checked_add_signed(d))
        .map(Some)
        .ok_or_else(|| Error::InvalidArgument(format!("expiration {} {} is out of range", value, unit)))
}

/// Human-readable time left until `expires_at`
pub fn format_remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = expires_at.signed_duration_since(now);
    if remaining <= Duration::zero() {
        return "Expired".to_string();
    }

    let total = remaining.num_seconds();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
