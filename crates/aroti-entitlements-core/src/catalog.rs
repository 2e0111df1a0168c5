//! Canonical feature identifiers and the declarative rule table.
//!
//! Callers may refer to a feature by any configured alias; resolution happens
//! once here so the evaluator only ever sees canonical keys.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::content::{ContentRef, ContentType};
use crate::EntitlementError;

const FAMILY_SUFFIX: &str = ".*";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureKey(String);

impl FeatureKey {
    /// Parses a canonical key: lowercase ASCII letters, digits, `-` and `.`
    /// separators, without empty segments.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for non-canonical keys.
    pub fn parse(raw: &str) -> Result<Self, EntitlementError> {
        if raw.is_empty() {
            return Err(EntitlementError::Validation(
                "feature key MUST be provided".to_string(),
            ));
        }

        let valid_chars = raw
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '.');
        if !valid_chars || raw.split('.').any(str::is_empty) {
            return Err(EntitlementError::Validation(format!(
                "feature key is not canonical: {raw:?}"
            )));
        }

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final dot-separated segment, used as the default content id.
    #[must_use]
    pub fn leaf(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl TryFrom<String> for FeatureKey {
    type Error = EntitlementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FeatureKey> for String {
    fn from(value: FeatureKey) -> Self {
        value.0
    }
}

impl Display for FeatureKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of access policies a feature can be configured with.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "class", rename_all = "camelCase")]
pub enum PolicyClass {
    DailyFreeWithPointsOverflow {
        daily_free: u32,
        overflow_price: u32,
    },
    OneTimePremiumUnlock {
        unlock_price: u32,
    },
    AlwaysFreeMeteredEarning {
        points_per_use: u32,
        daily_earn_cap: u32,
        activity_type: String,
    },
    PremiumOnlyVisible,
}

impl PolicyClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyFreeWithPointsOverflow { .. } => "dailyFreeWithPointsOverflow",
            Self::OneTimePremiumUnlock { .. } => "oneTimePremiumUnlock",
            Self::AlwaysFreeMeteredEarning { .. } => "alwaysFreeMeteredEarning",
            Self::PremiumOnlyVisible => "premiumOnlyVisible",
        }
    }

    fn validate(&self, key: &str) -> Result<(), EntitlementError> {
        match self {
            Self::DailyFreeWithPointsOverflow { overflow_price, .. } if *overflow_price == 0 => {
                Err(EntitlementError::Configuration(format!(
                    "{key}: overflow_price MUST be >= 1"
                )))
            }
            Self::OneTimePremiumUnlock { unlock_price } if *unlock_price == 0 => Err(
                EntitlementError::Configuration(format!("{key}: unlock_price MUST be >= 1")),
            ),
            Self::AlwaysFreeMeteredEarning { points_per_use, .. } if *points_per_use == 0 => Err(
                EntitlementError::Configuration(format!("{key}: points_per_use MUST be >= 1")),
            ),
            Self::AlwaysFreeMeteredEarning { activity_type, .. }
                if activity_type.trim().is_empty() =>
            {
                Err(EntitlementError::Configuration(format!(
                    "{key}: activity_type MUST be provided"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// One row of the feature table. `key` is either canonical (`spread.celtic-cross`)
/// or a family pattern (`article.*`) whose suffix becomes the content id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeatureRule {
    pub key: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub policy: PolicyClass,
}

impl FeatureRule {
    #[must_use]
    pub fn new(key: &str, content_type: ContentType, policy: PolicyClass) -> Self {
        Self {
            key: key.to_string(),
            content_type,
            content_id: None,
            policy,
        }
    }

    #[must_use]
    pub fn family_prefix(&self) -> Option<&str> {
        self.key
            .strip_suffix(FAMILY_SUFFIX)
            .map(|prefix| &self.key[..=prefix.len()])
    }
}

/// A feature request after alias resolution, carrying its rule.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedFeature {
    pub key: FeatureKey,
    pub content: ContentRef,
    pub policy: PolicyClass,
}

#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    exact: BTreeMap<FeatureKey, FeatureRule>,
    families: Vec<(String, FeatureRule)>,
    aliases: BTreeMap<String, FeatureKey>,
}

impl FeatureCatalog {
    /// Compiles rules and aliases into a lookup table.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Configuration`] for malformed or duplicate
    /// keys, invalid policy parameters, or aliases pointing at nothing.
    pub fn new(
        rules: &[FeatureRule],
        aliases: &BTreeMap<String, String>,
    ) -> Result<Self, EntitlementError> {
        let mut exact = BTreeMap::new();
        let mut families: Vec<(String, FeatureRule)> = Vec::new();

        for rule in rules {
            rule.policy.validate(&rule.key)?;

            if let Some(prefix) = rule.family_prefix() {
                FeatureKey::parse(prefix.trim_end_matches('.')).map_err(|err| {
                    EntitlementError::Configuration(format!("invalid family {}: {err}", rule.key))
                })?;
                if rule.content_id.is_some() {
                    return Err(EntitlementError::Configuration(format!(
                        "family rule {} cannot pin a content_id",
                        rule.key
                    )));
                }
                if families.iter().any(|(existing, _)| existing == prefix) {
                    return Err(EntitlementError::Configuration(format!(
                        "duplicate feature family {}",
                        rule.key
                    )));
                }
                families.push((prefix.to_string(), rule.clone()));
                continue;
            }

            let key = FeatureKey::parse(&rule.key).map_err(|err| {
                EntitlementError::Configuration(format!("invalid feature rule key: {err}"))
            })?;
            if let Some(content_id) = &rule.content_id {
                ContentRef::new(rule.content_type, content_id).map_err(|err| {
                    EntitlementError::Configuration(format!("{}: {err}", rule.key))
                })?;
            }
            if exact.insert(key, rule.clone()).is_some() {
                return Err(EntitlementError::Configuration(format!(
                    "duplicate feature rule {}",
                    rule.key
                )));
            }
        }

        // Longest prefix wins when families nest.
        families.sort_by(|lhs, rhs| rhs.0.len().cmp(&lhs.0.len()).then(lhs.0.cmp(&rhs.0)));

        let mut catalog = Self {
            exact,
            families,
            aliases: BTreeMap::new(),
        };

        for (alias, target) in aliases {
            if alias.trim().is_empty() {
                return Err(EntitlementError::Configuration(
                    "alias names MUST be non-empty".to_string(),
                ));
            }
            let target_key = FeatureKey::parse(target).map_err(|err| {
                EntitlementError::Configuration(format!("alias {alias}: {err}"))
            })?;
            if catalog.lookup(&target_key).is_none() {
                return Err(EntitlementError::Configuration(format!(
                    "alias {alias} points at unknown feature {target}"
                )));
            }
            let normalized = alias.trim().to_ascii_lowercase();
            if let Some(existing) = catalog.aliases.get(&normalized) {
                if *existing != target_key {
                    return Err(EntitlementError::Configuration(format!(
                        "alias {alias} collides with another alias for {existing}"
                    )));
                }
            }
            catalog.aliases.insert(normalized, target_key);
        }

        Ok(catalog)
    }

    /// Resolves a raw identifier, consulting aliases first.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] when the identifier matches no
    /// alias, rule, or family.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedFeature, EntitlementError> {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();

        let key = match self.aliases.get(&lowered) {
            Some(target) => target.clone(),
            None => FeatureKey::parse(&lowered)?,
        };

        self.lookup(&key)
            .ok_or_else(|| EntitlementError::Validation(format!("unknown feature: {trimmed}")))
    }

    #[must_use]
    pub fn lookup(&self, key: &FeatureKey) -> Option<ResolvedFeature> {
        if let Some(rule) = self.exact.get(key) {
            let content_id = rule.content_id.as_deref().unwrap_or_else(|| key.leaf());
            return Some(ResolvedFeature {
                key: key.clone(),
                content: ContentRef {
                    content_type: rule.content_type,
                    content_id: content_id.to_string(),
                },
                policy: rule.policy.clone(),
            });
        }

        self.families.iter().find_map(|(prefix, rule)| {
            let suffix = key.as_str().strip_prefix(prefix.as_str())?;
            if suffix.is_empty() {
                return None;
            }
            Some(ResolvedFeature {
                key: key.clone(),
                content: ContentRef {
                    content_type: rule.content_type,
                    content_id: suffix.to_string(),
                },
                policy: rule.policy.clone(),
            })
        })
    }

    pub fn rule_keys(&self) -> impl Iterator<Item = &str> {
        self.exact
            .keys()
            .map(FeatureKey::as_str)
            .chain(self.families.iter().map(|(_, rule)| rule.key.as_str()))
    }
}
