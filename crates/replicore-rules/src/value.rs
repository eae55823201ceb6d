//! Typed values produced by variables and literals on the right-hand side of
//! rule predicates.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use replicore_error::{ReplicoreError, Result};

/// Declared kind of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Number,
    Text,
    /// Unix seconds.
    Time,
}

impl ValueKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "boolean",
            Self::Number => "numeric",
            Self::Text => "text",
            Self::Time => "time",
        }
    }

    /// Whether values of this kind have a total order usable for sorting.
    #[must_use]
    pub const fn is_orderable(self) -> bool {
        matches!(self, Self::Number | Self::Time)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    Time(i64),
}

impl Value {
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
            Self::Time(_) => ValueKind::Time,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view used for ordering; times order by their seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Time(t) => Some(*t as f64),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Order two values of the same kind. Mixed kinds are unordered.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Time(t) => match DateTime::<Utc>::from_timestamp(*t, 0) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
                None => write!(f, "{t}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Literal parsing
// ---------------------------------------------------------------------------

const SIZE_SUFFIXES: [(&str, f64); 5] = [
    ("kB", 1e3),
    ("MB", 1e6),
    ("GB", 1e9),
    ("TB", 1e12),
    ("PB", 1e15),
];

/// Parse a numeric literal with an optional decimal size suffix.
pub fn parse_number(text: &str) -> Result<f64> {
    let (digits, scale) = SIZE_SUFFIXES
        .iter()
        .find_map(|(suffix, scale)| text.strip_suffix(suffix).map(|digits| (digits, *scale)))
        .unwrap_or((text, 1.0));
    digits
        .trim()
        .parse::<f64>()
        .map(|n| n * scale)
        .map_err(|_| ReplicoreError::config(format!("invalid numeric literal {text:?}")))
}

pub fn parse_bool(text: &str) -> Result<bool> {
    match text {
        "true" | "True" | "TRUE" => Ok(true),
        "false" | "False" | "FALSE" => Ok(false),
        _ => Err(ReplicoreError::config(format!(
            "invalid boolean literal {text:?}"
        ))),
    }
}

/// A time on the right-hand side of a predicate or in a time gate.
///
/// Relative literals are resolved against the evaluation clock, so a
/// compiled condition does not drift when reused across cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLiteral {
    Absolute(i64),
    /// Seconds before the evaluation instant; `now` is `Ago(0)`.
    Ago(i64),
}

impl TimeLiteral {
    #[must_use]
    pub const fn resolve(self, now: i64) -> i64 {
        match self {
            Self::Absolute(t) => t,
            Self::Ago(offset) => now.saturating_sub(offset),
        }
    }

    /// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` (UTC), unix seconds, `now`
    /// or `N <unit> ago`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text == "now" {
            return Ok(Self::Ago(0));
        }
        if let Some(relative) = text.strip_suffix(" ago") {
            return parse_relative(relative.trim()).map(Self::Ago);
        }
        if let Ok(seconds) = text.parse::<i64>() {
            return Ok(Self::Absolute(seconds));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
            return Ok(Self::Absolute(dt.and_utc().timestamp()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self::Absolute(midnight.and_utc().timestamp()));
            }
        }
        Err(ReplicoreError::config(format!("invalid time literal {text:?}")))
    }
}

fn parse_relative(text: &str) -> Result<i64> {
    let invalid = || ReplicoreError::config(format!("invalid relative time {text:?}"));
    let (count, unit) = text.split_once(char::is_whitespace).ok_or_else(invalid)?;
    let count: i64 = count.parse().map_err(|_| invalid())?;
    let unit_secs = match unit.trim().trim_end_matches('s') {
        "second" => 1,
        "minute" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 604_800,
        _ => return Err(invalid()),
    };
    count.checked_mul(unit_secs).ok_or_else(invalid)
}
