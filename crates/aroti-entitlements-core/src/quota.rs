//! Daily usage counters with lazy calendar-day rollover.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::catalog::FeatureKey;
use crate::{DayBoundary, EntitlementError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaNamespace {
    Use,
    Earn,
}

impl QuotaNamespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Use => "use",
            Self::Earn => "earn",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "use" => Some(Self::Use),
            "earn" => Some(Self::Earn),
            _ => None,
        }
    }
}

/// Stable identity of one counter, rendered as `use:ai-chat` or `earn:spread.one-card`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QuotaKey {
    pub namespace: QuotaNamespace,
    pub feature: FeatureKey,
}

impl QuotaKey {
    #[must_use]
    pub fn usage(feature: &FeatureKey) -> Self {
        Self {
            namespace: QuotaNamespace::Use,
            feature: feature.clone(),
        }
    }

    #[must_use]
    pub fn earning(feature: &FeatureKey) -> Self {
        Self {
            namespace: QuotaNamespace::Earn,
            feature: feature.clone(),
        }
    }

    /// Parses `<namespace>:<feature>`.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown namespaces or
    /// non-canonical feature keys.
    pub fn parse(raw: &str) -> Result<Self, EntitlementError> {
        let Some((namespace_raw, feature_raw)) = raw.split_once(':') else {
            return Err(EntitlementError::Validation(format!(
                "quota key must be <namespace>:<feature>: {raw}"
            )));
        };

        let namespace = QuotaNamespace::parse(namespace_raw).ok_or_else(|| {
            EntitlementError::Validation(format!("unknown quota namespace: {namespace_raw}"))
        })?;

        Ok(Self {
            namespace,
            feature: FeatureKey::parse(feature_raw)?,
        })
    }
}

impl Display for QuotaKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace.as_str(), self.feature)
    }
}

/// Persisted counter. `used_count` only counts for `window_date`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuotaRecord {
    pub key: QuotaKey,
    pub used_count: u32,
    #[serde(with = "crate::serde_date")]
    pub window_date: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Effective usage as seen from a given day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuotaUsage {
    pub used: u32,
    #[serde(with = "crate::serde_date")]
    pub window_date: Date,
}

/// The single place where a stored window is compared against today.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QuotaWindow {
    today: Date,
}

impl QuotaWindow {
    #[must_use]
    pub fn new(today: Date) -> Self {
        Self { today }
    }

    #[must_use]
    pub fn for_instant(as_of: OffsetDateTime, boundary: DayBoundary) -> Self {
        Self::new(boundary.date_of(as_of))
    }

    #[must_use]
    pub fn today(self) -> Date {
        self.today
    }

    #[must_use]
    pub fn is_current(self, window_date: Date) -> bool {
        window_date == self.today
    }

    /// Reads a stored record without mutating it; stale windows read as zero.
    #[must_use]
    pub fn usage(self, record: Option<&QuotaRecord>) -> QuotaUsage {
        match record {
            Some(record) if self.is_current(record.window_date) => QuotaUsage {
                used: record.used_count,
                window_date: record.window_date,
            },
            _ => QuotaUsage {
                used: 0,
                window_date: self.today,
            },
        }
    }

    /// Computes the record after one more use today.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] if the counter would overflow.
    pub fn advance(
        self,
        key: &QuotaKey,
        record: Option<&QuotaRecord>,
        at: OffsetDateTime,
    ) -> Result<QuotaRecord, EntitlementError> {
        let used_count = self
            .usage(record)
            .used
            .checked_add(1)
            .ok_or_else(|| EntitlementError::Validation(format!("quota counter overflow: {key}")))?;

        Ok(QuotaRecord {
            key: key.clone(),
            used_count,
            window_date: self.today,
            updated_at: at,
        })
    }

    #[must_use]
    pub fn remaining(self, record: Option<&QuotaRecord>, limit: u32) -> u32 {
        limit.saturating_sub(self.usage(record).used)
    }
}
