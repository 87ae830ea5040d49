use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Longest finite hold honoured. Larger requests are clamped, never wrapped.
pub const MAX_HOLD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const FOREVER_WORDS: &[&str] = &["forever", "permanent", "perm", "infinite", "indefinite"];
const CLEAR_WORDS: &[&str] = &["clear", "cancel", "off", "remove", "none"];

/// How long a backend should be kept running regardless of occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "seconds", rename_all = "snake_case")]
pub enum HoldDuration {
    Seconds(u64),
    Forever,
}

/// Stored form of a hold: an absolute expiry or no expiry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldEntry {
    Until(Instant),
    Forever,
}

impl HoldEntry {
    pub fn from_duration(now: Instant, duration: HoldDuration) -> Option<Self> {
        match duration {
            HoldDuration::Forever => Some(HoldEntry::Forever),
            HoldDuration::Seconds(0) => None,
            HoldDuration::Seconds(secs) => {
                let mut span = Duration::from_secs(secs).min(MAX_HOLD);
                // Shrinks to zero at worst, and `now + 0` always fits.
                let until = loop {
                    match now.checked_add(span) {
                        Some(until) => break until,
                        None => span /= 2,
                    }
                };
                Some(HoldEntry::Until(until))
            }
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        match self {
            HoldEntry::Forever => true,
            HoldEntry::Until(until) => *until > now,
        }
    }

    /// Remaining time rounded up to whole seconds, `None` once expired.
    pub fn remaining(&self, now: Instant) -> Option<HoldDuration> {
        match self {
            HoldEntry::Forever => Some(HoldDuration::Forever),
            HoldEntry::Until(until) => {
                let left = until.checked_duration_since(now)?;
                if left.is_zero() {
                    return None;
                }
                Some(HoldDuration::Seconds(ceil_secs(left)))
            }
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Operator request parsed from free text such as `2h30m` or `forever`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldRequest {
    Set(HoldDuration),
    Clear,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum HoldParseError {
    #[error("empty hold duration")]
    Empty,
    #[error("invalid hold duration `{0}`, try 30m, 2h, 1d2h or forever")]
    Invalid(String),
    #[error("hold duration must be greater than zero")]
    Zero,
}

/// Parse a hold argument.
///
/// Accepts `d`, `h`, `m`, `s` suffixed numbers in any combination (`1d2h`,
/// `90m 30s`); a bare number means minutes. Totals saturate instead of
/// overflowing.
pub fn parse_hold(input: &str) -> Result<HoldRequest, HoldParseError> {
    let text = input.trim().to_lowercase();
    if text.is_empty() {
        return Err(HoldParseError::Empty);
    }
    if FOREVER_WORDS.contains(&text.as_str()) {
        return Ok(HoldRequest::Set(HoldDuration::Forever));
    }
    if CLEAR_WORDS.contains(&text.as_str()) {
        return Ok(HoldRequest::Clear);
    }

    let invalid = || HoldParseError::Invalid(input.trim().to_string());
    let mut total: u64 = 0;
    let mut chars = text.chars().filter(|c| !c.is_whitespace()).peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        if digits.is_empty() {
            return Err(invalid());
        }
        let value: u64 = digits.parse().unwrap_or(u64::MAX);
        let unit = match chars.peek().copied() {
            Some('d') => 86_400,
            Some('h') => 3_600,
            Some('m') | None => 60,
            Some('s') => 1,
            Some(_) => return Err(invalid()),
        };
        if chars.peek().is_some() {
            chars.next();
        }
        total = total.saturating_add(value.saturating_mul(unit));
    }

    if total == 0 {
        return Err(HoldParseError::Zero);
    }
    Ok(HoldRequest::Set(HoldDuration::Seconds(total)))
}

/// Render seconds as `1d 2h 3m 4s`, omitting zero components.
pub fn format_duration(total: u64) -> String {
    if total == 0 {
        return "0s".to_string();
    }
    let parts = [
        (total / 86_400, "d"),
        ((total % 86_400) / 3_600, "h"),
        ((total % 3_600) / 60, "m"),
        (total % 60, "s"),
    ];
    parts
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for HoldDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldDuration::Forever => write!(f, "forever"),
            HoldDuration::Seconds(secs) => write!(f, "{}", format_duration(*secs)),
        }
    }
}
