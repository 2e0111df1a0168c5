//! Level progression from lifetime points.

use serde::{Deserialize, Serialize};

use crate::EntitlementError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LevelThreshold {
    pub required_lifetime_points: u64,
    pub level_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_label: Option<String>,
}

impl LevelThreshold {
    #[must_use]
    pub fn new(
        required_lifetime_points: u64,
        level_name: &str,
        reward_label: Option<&str>,
    ) -> Self {
        Self {
            required_lifetime_points,
            level_name: level_name.to_string(),
            reward_label: reward_label.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LevelInfo {
    pub level: u32,
    pub level_name: String,
    pub next_level: u32,
    pub next_threshold: u64,
    pub points_to_next: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Milestone {
    pub id: String,
    pub level: u32,
    pub required_points: u64,
    pub label: String,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<String>,
}

/// Validated, ascending threshold table. Levels are 1-based positions in it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LevelTable {
    thresholds: Vec<LevelThreshold>,
}

impl LevelTable {
    /// # Errors
    /// Returns [`EntitlementError::Configuration`] when the table is empty,
    /// does not start at zero, is not strictly ascending, or has blank names.
    pub fn new(thresholds: Vec<LevelThreshold>) -> Result<Self, EntitlementError> {
        let Some(first) = thresholds.first() else {
            return Err(EntitlementError::Configuration(
                "level table MUST contain at least one threshold".to_string(),
            ));
        };

        if first.required_lifetime_points != 0 {
            return Err(EntitlementError::Configuration(
                "first level threshold MUST require 0 points".to_string(),
            ));
        }

        if thresholds
            .windows(2)
            .any(|pair| pair[0].required_lifetime_points >= pair[1].required_lifetime_points)
        {
            return Err(EntitlementError::Configuration(
                "level thresholds MUST be strictly ascending".to_string(),
            ));
        }

        if let Some(blank) = thresholds.iter().find(|t| t.level_name.trim().is_empty()) {
            return Err(EntitlementError::Configuration(format!(
                "level at {} points has a blank name",
                blank.required_lifetime_points
            )));
        }

        if u32::try_from(thresholds.len()).is_err() {
            return Err(EntitlementError::Configuration(
                "level table is too large".to_string(),
            ));
        }

        Ok(Self { thresholds })
    }

    #[must_use]
    pub fn v1_thresholds() -> Vec<LevelThreshold> {
        vec![
            LevelThreshold::new(0, "Welcome", None),
            LevelThreshold::new(100, "Seeker", Some("Unlock 1 spread")),
            LevelThreshold::new(300, "Explorer", Some("Unlock theme")),
            LevelThreshold::new(600, "Oracle", Some("Unlock weekly insight")),
            LevelThreshold::new(1000, "Master", Some("Unlock advanced routine")),
            LevelThreshold::new(2000, "Sage", Some("Unlock special spread")),
            LevelThreshold::new(3000, "Enlightened", Some("Unlock rare theme")),
        ]
    }

    #[must_use]
    pub fn thresholds(&self) -> &[LevelThreshold] {
        &self.thresholds
    }

    #[must_use]
    pub fn level_info(&self, lifetime: u64) -> LevelInfo {
        // `new` guarantees a first threshold at 0, so index 0 always qualifies.
        let index = self
            .thresholds
            .iter()
            .rposition(|t| t.required_lifetime_points <= lifetime)
            .unwrap_or(0);
        let current = &self.thresholds[index];
        let level = position_to_level(index);

        match self.thresholds.get(index + 1) {
            Some(next) => LevelInfo {
                level,
                level_name: current.level_name.clone(),
                next_level: position_to_level(index + 1),
                next_threshold: next.required_lifetime_points,
                points_to_next: next.required_lifetime_points.saturating_sub(lifetime),
            },
            None => LevelInfo {
                level,
                level_name: current.level_name.clone(),
                next_level: level,
                next_threshold: current.required_lifetime_points,
                points_to_next: 0,
            },
        }
    }

    #[must_use]
    pub fn milestones(&self, lifetime: u64) -> Vec<Milestone> {
        self.thresholds
            .iter()
            .enumerate()
            .map(|(index, threshold)| {
                let level = position_to_level(index);
                Milestone {
                    id: format!("milestone-{level}"),
                    level,
                    required_points: threshold.required_lifetime_points,
                    label: threshold
                        .reward_label
                        .clone()
                        .unwrap_or_else(|| format!("Level {level}")),
                    completed: lifetime >= threshold.required_lifetime_points,
                    reward: threshold.reward_label.clone(),
                }
            })
            .collect()
    }
}

fn position_to_level(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
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

    fn three_level_table() -> LevelTable {
        must_ok(LevelTable::new(vec![
            LevelThreshold::new(0, "Welcome", None),
            LevelThreshold::new(100, "Seeker", None),
            LevelThreshold::new(300, "Explorer", None),
        ]))
    }

    #[test]
    fn level_boundaries_follow_thresholds() {
        let table = three_level_table();

        let below = table.level_info(99);
        assert_eq!(below.level, 1);
        assert_eq!(below.level_name, "Welcome");
        assert_eq!(below.points_to_next, 1);

        let at = table.level_info(100);
        assert_eq!(at.level, 2);
        assert_eq!(at.level_name, "Seeker");
        assert_eq!(at.next_level, 3);
        assert_eq!(at.next_threshold, 300);
        assert_eq!(at.points_to_next, 200);
    }

    #[test]
    fn top_tier_points_at_itself() {
        let info = three_level_table().level_info(10_000);
        assert_eq!(info.level, 3);
        assert_eq!(info.next_level, 3);
        assert_eq!(info.next_threshold, 300);
        assert_eq!(info.points_to_next, 0);
    }

    #[test]
    fn malformed_tables_are_rejected() {
        assert!(LevelTable::new(Vec::new()).is_err());
        assert!(LevelTable::new(vec![LevelThreshold::new(5, "Late", None)]).is_err());
        assert!(LevelTable::new(vec![
            LevelThreshold::new(0, "Welcome", None),
            LevelThreshold::new(100, "Seeker", None),
            LevelThreshold::new(100, "Twin", None),
        ])
        .is_err());
    }

    #[test]
    fn milestones_label_falls_back_to_level_number() {
        let table = must_ok(LevelTable::new(LevelTable::v1_thresholds()));
        let milestones = table.milestones(350);

        assert_eq!(milestones.len(), 7);
        assert_eq!(milestones[0].id, "milestone-1");
        assert_eq!(milestones[0].label, "Level 1");
        assert_eq!(milestones[1].label, "Unlock 1 spread");
        assert!(milestones[2].completed);
        assert!(!milestones[3].completed);
    }
}
