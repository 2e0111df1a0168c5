//! Aggregations over the per-user activity log.
//!
//! All functions take the already-loaded entries plus the calendar day to
//! evaluate from, so they stay pure and testable without a store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};

use crate::{DayBoundary, EntitlementError};

pub const ACTIVITY_PRACTICE: &str = "practice";
pub const ACTIVITY_SPREAD: &str = "spread";
pub const ACTIVITY_QUIZ: &str = "quiz";

const TRAILING_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActivityEntry {
    pub seq: i64,
    pub activity_type: String,
    pub points: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewActivity {
    pub activity_type: String,
    pub points: u32,
    pub occurred_at: OffsetDateTime,
}

impl NewActivity {
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank activity types.
    pub fn new(
        activity_type: &str,
        points: u32,
        occurred_at: OffsetDateTime,
    ) -> Result<Self, EntitlementError> {
        let activity_type = activity_type.trim();
        if activity_type.is_empty() {
            return Err(EntitlementError::Validation(
                "activity_type MUST be provided".to_string(),
            ));
        }

        Ok(Self {
            activity_type: activity_type.to_string(),
            points,
            occurred_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DailyPoints {
    #[serde(with = "crate::serde_date")]
    pub date: Date,
    pub total_points: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TodayProgress {
    pub points: u64,
    pub completed_practices: u32,
    pub completed_spreads: u32,
    pub completed_quizzes: u32,
    pub streak_days: u32,
}

/// Oldest instant still inside the retention window.
#[must_use]
pub fn retention_cutoff(as_of: OffsetDateTime, retention_days: u32) -> OffsetDateTime {
    as_of
        .checked_sub(Duration::days(i64::from(retention_days)))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Point totals for today and the six days before it, newest first. Days
/// without activity are present with zero.
#[must_use]
pub fn last_7_days(
    entries: &[ActivityEntry],
    boundary: DayBoundary,
    today: Date,
) -> Vec<DailyPoints> {
    let mut totals: BTreeMap<Date, u64> = BTreeMap::new();
    for entry in entries {
        let day = totals.entry(boundary.date_of(entry.occurred_at)).or_default();
        *day = day.saturating_add(u64::from(entry.points));
    }

    (0..TRAILING_DAYS)
        .filter_map(|offset| today.checked_sub(Duration::days(offset)))
        .map(|date| DailyPoints {
            date,
            total_points: totals.get(&date).copied().unwrap_or(0),
        })
        .collect()
}

/// Consecutive days ending today that have at least one point-earning entry.
#[must_use]
pub fn streak_days(
    entries: &[ActivityEntry],
    boundary: DayBoundary,
    today: Date,
    cap: u32,
) -> u32 {
    let active: BTreeSet<Date> = entries
        .iter()
        .filter(|entry| entry.points > 0)
        .map(|entry| boundary.date_of(entry.occurred_at))
        .collect();

    let mut streak = 0;
    let mut cursor = Some(today);
    while streak < cap {
        match cursor {
            Some(day) if active.contains(&day) => {
                streak += 1;
                cursor = day.previous_day();
            }
            _ => break,
        }
    }
    streak
}

#[must_use]
pub fn today_progress(
    entries: &[ActivityEntry],
    boundary: DayBoundary,
    today: Date,
    streak_cap: u32,
) -> TodayProgress {
    let mut progress = TodayProgress {
        streak_days: streak_days(entries, boundary, today, streak_cap),
        ..TodayProgress::default()
    };

    for entry in entries
        .iter()
        .filter(|entry| boundary.date_of(entry.occurred_at) == today)
    {
        progress.points = progress.points.saturating_add(u64::from(entry.points));
        match entry.activity_type.as_str() {
            ACTIVITY_PRACTICE => progress.completed_practices += 1,
            ACTIVITY_SPREAD => progress.completed_spreads += 1,
            ACTIVITY_QUIZ => progress.completed_quizzes += 1,
            _ => {}
        }
    }

    progress
}
