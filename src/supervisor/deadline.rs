//! Gate-close deadline handling.
//!
//! A start request may carry a wall-clock "gate close" time of day, rolled
//! to the next day if already past. The deadline travels back to the control
//! surface as an opaque RFC 3339 token (cookie-shaped, bounded client-side to
//! 24 hours) and is re-presented on status checks; a malformed token is
//! treated as no deadline, never an error.

use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;

/// Errors from gate-close parsing.
#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("invalid gate close time: {0}")]
    Invalid(String),
}

/// Wall-clock deadline after which the engine must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDeadline {
    at: DateTime<Local>,
}

impl GateDeadline {
    /// Deadline at an explicit instant.
    pub fn new(at: DateTime<Local>) -> Self {
        Self { at }
    }

    /// Parse an operator-entered `HH:MM` time of day against `now`, rolling
    /// to tomorrow if the time has already passed today.
    pub fn parse_gate_close(hhmm: &str, now: DateTime<Local>) -> Result<Self, DeadlineError> {
        let time = chrono::NaiveTime::parse_from_str(hhmm, "%H:%M")
            .map_err(|_| DeadlineError::Invalid(hhmm.to_string()))?;

        let naive = now.date_naive().and_time(time);
        let mut at = naive
            .and_local_timezone(Local)
            .earliest()
            .ok_or_else(|| DeadlineError::Invalid(hhmm.to_string()))?;

        if at <= now {
            at = at + chrono::Duration::days(1);
        }

        Ok(Self { at })
    }

    /// Opaque token handed back to the control surface.
    pub fn to_token(&self) -> String {
        self.at.to_rfc3339()
    }

    /// Parse a re-presented token. Malformed tokens resolve to `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(token)
            .ok()
            .map(|at| Self {
                at: at.with_timezone(&Local),
            })
    }

    /// Whether the deadline has passed.
    pub fn is_past(&self, now: DateTime<Local>) -> bool {
        now > self.at
    }

    /// Time left until the deadline, `None` once past.
    pub fn remaining(&self, now: DateTime<Local>) -> Option<Duration> {
        (self.at - now).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[rstest]
    // Later today stays today
    #[case("18:30", at(2026, 3, 10, 9, 0), at(2026, 3, 10, 18, 30))]
    // Already past rolls to tomorrow
    #[case("08:00", at(2026, 3, 10, 9, 0), at(2026, 3, 11, 8, 0))]
    // Exactly now rolls to tomorrow
    #[case("09:00", at(2026, 3, 10, 9, 0), at(2026, 3, 11, 9, 0))]
    fn test_parse_gate_close_rolls_forward(
        #[case] hhmm: &str,
        #[case] now: DateTime<Local>,
        #[case] expected: DateTime<Local>,
    ) {
        let deadline = GateDeadline::parse_gate_close(hhmm, now).unwrap();
        assert_eq!(deadline, GateDeadline::new(expected));
    }

    #[rstest]
    #[case("25:00")]
    #[case("9am")]
    #[case("")]
    fn test_parse_gate_close_rejects_garbage(#[case] hhmm: &str) {
        assert!(GateDeadline::parse_gate_close(hhmm, Local::now()).is_err());
    }

    #[test]
    fn test_token_roundtrip() {
        let deadline = GateDeadline::new(at(2026, 3, 10, 18, 30));
        let token = deadline.to_token();
        assert_eq!(GateDeadline::from_token(&token), Some(deadline));
    }

    #[test]
    fn test_malformed_token_is_none() {
        assert_eq!(GateDeadline::from_token("yesterday-ish"), None);
        assert_eq!(GateDeadline::from_token(""), None);
    }

    #[test]
    fn test_past_and_remaining() {
        let now = at(2026, 3, 10, 9, 0);
        let deadline = GateDeadline::new(at(2026, 3, 10, 10, 0));

        assert!(!deadline.is_past(now));
        assert_eq!(
            deadline.remaining(now),
            Some(Duration::from_secs(60 * 60))
        );

        let later = at(2026, 3, 10, 10, 1);
        assert!(deadline.is_past(later));
        assert_eq!(deadline.remaining(later), None);
    }
}
