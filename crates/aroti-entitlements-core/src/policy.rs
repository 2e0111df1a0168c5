//! Versioned policy document: feature rules, aliases, levels and the
//! calendar parameters every daily reset depends on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::UtcOffset;

use crate::catalog::{FeatureCatalog, FeatureRule, PolicyClass};
use crate::content::ContentType;
use crate::progression::{LevelTable, LevelThreshold};
use crate::{DayBoundary, EntitlementError};

const MAX_OFFSET_MINUTES: i16 = 18 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntitlementPolicy {
    pub policy_version: u32,
    #[serde(default)]
    pub reset_utc_offset_minutes: i16,
    pub activity_retention_days: u32,
    pub streak_cap_days: u32,
    pub levels: Vec<LevelThreshold>,
    pub features: Vec<FeatureRule>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl EntitlementPolicy {
    #[must_use]
    pub fn v1() -> Self {
        let daily_free = |daily_free, overflow_price| PolicyClass::DailyFreeWithPointsOverflow {
            daily_free,
            overflow_price,
        };
        let unlock = |unlock_price| PolicyClass::OneTimePremiumUnlock { unlock_price };
        let metered_spread = PolicyClass::AlwaysFreeMeteredEarning {
            points_per_use: 10,
            daily_earn_cap: 3,
            activity_type: "spread".to_string(),
        };

        let features = vec![
            FeatureRule::new("ai-chat", ContentType::AiChat, daily_free(3, 20)),
            FeatureRule::new("daily-practice", ContentType::DailyPractice, daily_free(1, 10)),
            FeatureRule::new("quiz", ContentType::Quiz, daily_free(1, 10)),
            FeatureRule::new("compatibility", ContentType::Compatibility, daily_free(1, 50)),
            FeatureRule::new("spread.three-card", ContentType::TarotSpread, metered_spread.clone()),
            FeatureRule::new("spread.one-card", ContentType::TarotSpread, metered_spread.clone()),
            FeatureRule::new(
                "spread.past-present-future",
                ContentType::TarotSpread,
                metered_spread,
            ),
            FeatureRule::new(
                "spread.shadow-work",
                ContentType::TarotSpread,
                PolicyClass::PremiumOnlyVisible,
            ),
            FeatureRule::new(
                "spread.deep-relationship",
                ContentType::TarotSpread,
                PolicyClass::PremiumOnlyVisible,
            ),
            FeatureRule::new("spread.*", ContentType::TarotSpread, unlock(150)),
            FeatureRule::new("article.*", ContentType::Article, unlock(20)),
            FeatureRule::new("numerology.*", ContentType::NumerologyLayer, unlock(30)),
            FeatureRule::new("theme.*", ContentType::Theme, unlock(30)),
            FeatureRule::new(
                "forecast.*",
                ContentType::PremiumForecast,
                PolicyClass::PremiumOnlyVisible,
            ),
        ];

        let aliases = [
            ("aiChat", "ai-chat"),
            ("chat", "ai-chat"),
            ("dailyPractice", "daily-practice"),
            ("practice", "daily-practice"),
            ("celtic", "spread.celtic-cross"),
            ("celtic-cross", "spread.celtic-cross"),
            ("three-card", "spread.three-card"),
            ("one-card", "spread.one-card"),
            ("quick-draw", "spread.one-card"),
            ("past-present-future", "spread.past-present-future"),
        ]
        .into_iter()
        .map(|(alias, target)| (alias.to_string(), target.to_string()))
        .collect();

        Self {
            policy_version: 1,
            reset_utc_offset_minutes: 0,
            activity_retention_days: 30,
            streak_cap_days: 365,
            levels: LevelTable::v1_thresholds(),
            features,
            aliases,
        }
    }

    /// Validates calendar parameters, the level table and the feature catalog.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Configuration`] when any part of the policy
    /// is inconsistent.
    pub fn validate(&self) -> Result<(), EntitlementError> {
        self.compile().map(|_| ())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Configuration`] when JSON decoding fails
    /// or decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self, EntitlementError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            EntitlementError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Builds the lookup structures used at evaluation time.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Configuration`] for invalid policies.
    pub fn compile(&self) -> Result<CompiledPolicy, EntitlementError> {
        if self.policy_version == 0 {
            return Err(EntitlementError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        if self.activity_retention_days == 0 {
            return Err(EntitlementError::Configuration(
                "activity_retention_days MUST be >= 1".to_string(),
            ));
        }

        if self.streak_cap_days == 0 {
            return Err(EntitlementError::Configuration(
                "streak_cap_days MUST be >= 1".to_string(),
            ));
        }

        if self.reset_utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(EntitlementError::Configuration(format!(
                "reset_utc_offset_minutes MUST be within +/-{MAX_OFFSET_MINUTES}"
            )));
        }

        let offset = UtcOffset::from_whole_seconds(i32::from(self.reset_utc_offset_minutes) * 60)
            .map_err(|err| {
                EntitlementError::Configuration(format!("invalid reset offset: {err}"))
            })?;

        Ok(CompiledPolicy {
            policy: self.clone(),
            boundary: DayBoundary::new(offset),
            levels: LevelTable::new(self.levels.clone())?,
            catalog: FeatureCatalog::new(&self.features, &self.aliases)?,
        })
    }
}

impl Default for EntitlementPolicy {
    fn default() -> Self {
        Self::v1()
    }
}

/// A validated policy with its derived lookup tables.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: EntitlementPolicy,
    pub boundary: DayBoundary,
    pub levels: LevelTable,
    pub catalog: FeatureCatalog,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn v1_policy_is_valid() {
        assert!(EntitlementPolicy::v1().validate().is_ok());
    }

    #[test]
    fn v1_catalog_covers_original_features() {
        let compiled = must_ok(EntitlementPolicy::v1().compile());
        let catalog = &compiled.catalog;

        assert_eq!(
            must_ok(catalog.resolve("celtic")).policy,
            PolicyClass::OneTimePremiumUnlock { unlock_price: 150 }
        );
        assert_eq!(
            must_ok(catalog.resolve("spread.shadow-work")).policy,
            PolicyClass::PremiumOnlyVisible
        );
        assert!(matches!(
            must_ok(catalog.resolve("quick-draw")).policy,
            PolicyClass::AlwaysFreeMeteredEarning { .. }
        ));
        assert_eq!(
            must_ok(catalog.resolve("theme.midnight")).policy,
            PolicyClass::OneTimePremiumUnlock { unlock_price: 30 }
        );
        assert_eq!(
            must_ok(catalog.resolve("aiChat")).policy,
            PolicyClass::DailyFreeWithPointsOverflow {
                daily_free: 3,
                overflow_price: 20
            }
        );
    }

    #[test]
    fn json_round_trip_preserves_policy() {
        let policy = EntitlementPolicy::v1();
        let encoded = must_ok(serde_json::to_value(&policy));
        assert_eq!(must_ok(EntitlementPolicy::from_json(&encoded)), policy);
    }

    #[test]
    fn invalid_policies_are_configuration_errors() {
        let mut policy = EntitlementPolicy::v1();
        policy.policy_version = 0;
        assert!(matches!(
            policy.validate(),
            Err(EntitlementError::Configuration(_))
        ));

        let mut policy = EntitlementPolicy::v1();
        policy.reset_utc_offset_minutes = 24 * 60;
        assert!(policy.validate().is_err());

        let mut policy = EntitlementPolicy::v1();
        policy.levels.clear();
        assert!(policy.validate().is_err());

        assert!(EntitlementPolicy::from_json(&serde_json::json!({"policy_version": 2})).is_err());
    }

    #[test]
    fn metered_rules_without_points_do_not_compile() {
        let mut policy = EntitlementPolicy::v1();
        for rule in &mut policy.features {
            if let PolicyClass::AlwaysFreeMeteredEarning { points_per_use, .. } = &mut rule.policy {
                *points_per_use = 0;
            }
        }

        assert!(matches!(
            policy.compile(),
            Err(EntitlementError::Configuration(_))
        ));
    }

    #[test]
    fn reset_offset_shifts_day_boundary() {
        let mut policy = EntitlementPolicy::v1();
        policy.reset_utc_offset_minutes = -300;
        let compiled = must_ok(policy.compile());
        let instant = must_ok(parse_rfc3339_utc("2026-02-08T03:00:00Z"));
        assert_eq!(crate::format_date(compiled.boundary.date_of(instant)), "2026-02-07");
    }
}
