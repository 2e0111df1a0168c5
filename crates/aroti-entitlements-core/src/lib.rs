//! Entitlement and progression engine.
//!
//! Decides whether a user may use a gated feature today, meters a
//! spendable/lifetime points economy, records permanent content unlocks, and
//! derives levels and streaks from an activity log.
//!
//! Reads and decisions are side-effect free; every mutation goes through an
//! explicit commit on [`UserHandle`], executed under a per-user lock.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

pub mod access;
pub mod activity;
pub mod catalog;
pub mod content;
pub mod engine;
pub mod ledger;
pub mod policy;
pub mod progression;
pub mod quota;
pub mod store;
pub mod unlock;

pub use access::{evaluate_access, AccessContext, AccessDecision, AccessOutcome, AccessSnapshot};
pub use activity::{
    last_7_days, retention_cutoff, streak_days, today_progress, ActivityEntry, DailyPoints,
    NewActivity, TodayProgress, ACTIVITY_PRACTICE, ACTIVITY_QUIZ, ACTIVITY_SPREAD,
};
pub use catalog::{FeatureCatalog, FeatureKey, FeatureRule, PolicyClass, ResolvedFeature};
pub use content::{ContentRef, ContentType};
pub use engine::{
    CompletionResult, EntitlementEngine, JourneySummary, MeteredEarnResult, OverflowSpendResult,
    OverflowSpendStatus, UnlockSpendResult, UnlockSpendStatus, UserHandle, UserLocks,
};
pub use ledger::{
    check_spend, EarnResult, NewTransaction, PointsBalance, SpendCheck, SpendResult, Transaction,
};
pub use policy::{CompiledPolicy, EntitlementPolicy};
pub use progression::{LevelInfo, LevelTable, LevelThreshold, Milestone};
pub use quota::{QuotaKey, QuotaNamespace, QuotaRecord, QuotaUsage, QuotaWindow};
pub use store::{EntitlementStore, InMemoryStore};
pub use unlock::{UnlockRecord, UnlockResult};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EntitlementError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("write conflict: {0}")]
    Conflict(String),
}

impl EntitlementError {
    /// True for faults where the decision could not be computed at all, as
    /// opposed to rejected input.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Conflict(_))
    }
}

/// Identity that partitions all per-user state.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parses a user identifier.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank identifiers or
    /// identifiers containing whitespace.
    pub fn parse(raw: &str) -> Result<Self, EntitlementError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EntitlementError::Validation(
                "user_id MUST be provided".to_string(),
            ));
        }

        if trimmed.chars().any(char::is_whitespace) {
            return Err(EntitlementError::Validation(format!(
                "user_id MUST NOT contain whitespace: {trimmed:?}"
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = EntitlementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps instants onto calendar days in the fixed reference offset used for
/// every daily reset.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DayBoundary {
    offset: UtcOffset,
}

impl DayBoundary {
    #[must_use]
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    #[must_use]
    pub fn utc() -> Self {
        Self::new(UtcOffset::UTC)
    }

    #[must_use]
    pub fn offset(self) -> UtcOffset {
        self.offset
    }

    #[must_use]
    pub fn date_of(self, instant: OffsetDateTime) -> Date {
        instant.to_offset(self.offset).date()
    }
}

impl Default for DayBoundary {
    fn default() -> Self {
        Self::utc()
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EntitlementError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EntitlementError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EntitlementError::Validation(format!("invalid RFC3339 timestamp: {err}"))
        })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EntitlementError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EntitlementError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EntitlementError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EntitlementError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_seconds(OffsetDateTime::now_utc())
}

/// Drops sub-second precision and normalizes to UTC so stored timestamps
/// compare correctly as fixed-width text.
#[must_use]
pub fn truncate_to_seconds(value: OffsetDateTime) -> OffsetDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    utc - Duration::nanoseconds(i64::from(utc.nanosecond()))
}

#[must_use]
pub fn format_date(value: Date) -> String {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| value.to_string())
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`EntitlementError::Validation`] for malformed or impossible dates.
pub fn parse_date(value: &str) -> Result<Date, EntitlementError> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).map_err(|err| {
        EntitlementError::Validation(format!("invalid calendar date {value:?}: {err}"))
    })
}

/// Serde adapter for `YYYY-MM-DD` dates.
pub mod serde_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*value))
    }

    /// # Errors
    /// Fails for strings that are not valid `YYYY-MM-DD` dates.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn user_id_rejects_blank_and_whitespace() {
        assert!(UserId::parse("   ").is_err());
        assert!(UserId::parse("a b").is_err());
        assert_eq!(must_ok(UserId::parse(" user-1 ")).as_str(), "user-1");
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn truncation_drops_subsecond_precision() {
        let value = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00.987654Z"));
        let truncated = truncate_to_seconds(value);
        assert_eq!(
            must_ok(format_rfc3339(truncated)),
            "2026-02-07T12:00:00Z".to_string()
        );
    }

    #[test]
    fn date_text_round_trips_and_rejects_garbage() {
        let date = must_ok(parse_date("2026-03-09"));
        assert_eq!(format_date(date), "2026-03-09");
        assert!(parse_date("2026-02-30").is_err());
        assert!(parse_date("2026-02").is_err());
        assert!(parse_date("2026-02-01-01").is_err());
        assert!(parse_date("2026-2-01").is_err());
        assert_eq!(format_date(must_ok(parse_date("0999-01-05"))), "0999-01-05");
    }

    #[test]
    fn day_boundary_uses_reference_offset() {
        let instant = must_ok(parse_rfc3339_utc("2026-02-07T23:30:00Z"));
        let utc = DayBoundary::utc();
        let plus_two = DayBoundary::new(must_ok(UtcOffset::from_hms(2, 0, 0)));

        assert_eq!(format_date(utc.date_of(instant)), "2026-02-07");
        assert_eq!(format_date(plus_two.date_of(instant)), "2026-02-08");
    }

    #[test]
    fn store_faults_are_distinct_from_validation() {
        assert!(EntitlementError::Store("disk".to_string()).is_fault());
        assert!(EntitlementError::Conflict("race".to_string()).is_fault());
        assert!(!EntitlementError::Validation("bad".to_string()).is_fault());
    }
}
