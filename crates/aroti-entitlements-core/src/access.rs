//! Read-only access evaluation.
//!
//! [`evaluate_access`] never touches storage: the engine loads an
//! [`AccessSnapshot`] for the feature and passes it in, so the same decision
//! can be reproduced from the same inputs.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::catalog::{FeatureKey, PolicyClass, ResolvedFeature};
use crate::content::ContentRef;
use crate::ledger::PointsBalance;
use crate::quota::QuotaUsage;

/// Per-request inputs. The premium flag is supplied fresh on every call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AccessContext {
    pub premium: bool,
    pub as_of: OffsetDateTime,
}

impl AccessContext {
    #[must_use]
    pub fn new(premium: bool, as_of: OffsetDateTime) -> Self {
        Self {
            premium,
            as_of: crate::truncate_to_seconds(as_of),
        }
    }

    #[must_use]
    pub fn free_at(as_of: OffsetDateTime) -> Self {
        Self::new(false, as_of)
    }

    #[must_use]
    pub fn premium_at(as_of: OffsetDateTime) -> Self {
        Self::new(true, as_of)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AccessOutcome {
    Free,
    Premium,
    Unlocked,
    UnlockableWithPoints,
    PremiumOnly,
}

impl AccessOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Unlocked => "unlocked",
            Self::UnlockableWithPoints => "unlockableWithPoints",
            Self::PremiumOnly => "premiumOnly",
        }
    }
}

/// State the evaluator may consult. Fields irrelevant to a feature's policy
/// class are left at their defaults.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct AccessSnapshot {
    pub usage: Option<QuotaUsage>,
    pub earn_usage: Option<QuotaUsage>,
    pub unlocked: bool,
    pub balance: Option<PointsBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessDecision {
    pub feature: FeatureKey,
    pub content: ContentRef,
    pub policy_class: String,
    pub allowed: bool,
    pub outcome: AccessOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<u32>,
    pub is_premium_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affordable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_free: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earnings_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub reason_codes: Vec<String>,
}

struct DecisionBuilder<'a> {
    resolved: &'a ResolvedFeature,
    reason_codes: Vec<String>,
}

impl<'a> DecisionBuilder<'a> {
    fn new(resolved: &'a ResolvedFeature) -> Self {
        Self {
            resolved,
            reason_codes: Vec::new(),
        }
    }

    fn code(&mut self, code: &str) {
        self.reason_codes.push(code.to_string());
    }

    fn allow(self, outcome: AccessOutcome) -> AccessDecision {
        self.finish(true, outcome, None, None)
    }

    fn deny(
        self,
        outcome: AccessOutcome,
        cost: Option<u32>,
        reason: String,
    ) -> AccessDecision {
        self.finish(false, outcome, cost, Some(reason))
    }

    fn finish(
        self,
        allowed: bool,
        outcome: AccessOutcome,
        cost: Option<u32>,
        reason: Option<String>,
    ) -> AccessDecision {
        AccessDecision {
            feature: self.resolved.key.clone(),
            content: self.resolved.content.clone(),
            policy_class: self.resolved.policy.as_str().to_string(),
            allowed,
            outcome,
            cost,
            is_premium_only: matches!(self.resolved.policy, PolicyClass::PremiumOnlyVisible),
            affordable: None,
            remaining_free: None,
            earnings_remaining: None,
            reason,
            reason_codes: self.reason_codes,
        }
    }
}

/// Decides access to one resolved feature without mutating anything.
#[must_use]
pub fn evaluate_access(
    resolved: &ResolvedFeature,
    ctx: &AccessContext,
    snapshot: &AccessSnapshot,
) -> AccessDecision {
    let mut builder = DecisionBuilder::new(resolved);

    match &resolved.policy {
        PolicyClass::DailyFreeWithPointsOverflow {
            daily_free,
            overflow_price,
        } => {
            if ctx.premium {
                builder.code("allowed.premium");
                return builder.allow(AccessOutcome::Premium);
            }

            let used = snapshot.usage.map_or(0, |usage| usage.used);
            let remaining = daily_free.saturating_sub(used);
            if remaining > 0 {
                builder.code("allowed.daily_free");
                let mut decision = builder.allow(AccessOutcome::Free);
                decision.remaining_free = Some(remaining);
                return decision;
            }

            builder.code("denied.daily_free_exhausted");
            let affordable = push_cost_code(&mut builder, snapshot.balance, *overflow_price);
            let mut decision = builder.deny(
                AccessOutcome::UnlockableWithPoints,
                Some(*overflow_price),
                format!(
                    "You've used your free {} today. Unlock another for {overflow_price} points?",
                    resolved.key
                ),
            );
            decision.remaining_free = Some(0);
            decision.affordable = affordable;
            decision
        }
        PolicyClass::OneTimePremiumUnlock { unlock_price } => {
            if ctx.premium {
                builder.code("allowed.premium");
                return builder.allow(AccessOutcome::Premium);
            }

            if snapshot.unlocked {
                builder.code("allowed.unlocked");
                return builder.allow(AccessOutcome::Unlocked);
            }

            builder.code("denied.unlock_required");
            let affordable = push_cost_code(&mut builder, snapshot.balance, *unlock_price);
            let mut decision = builder.deny(
                AccessOutcome::UnlockableWithPoints,
                Some(*unlock_price),
                format!("Unlock {} permanently for {unlock_price} points.", resolved.key),
            );
            decision.affordable = affordable;
            decision
        }
        PolicyClass::AlwaysFreeMeteredEarning { daily_earn_cap, .. } => {
            builder.code("allowed.metered");
            let earned_today = snapshot.earn_usage.map_or(0, |usage| usage.used);
            let earnings_remaining = daily_earn_cap.saturating_sub(earned_today);
            builder.code(if earnings_remaining > 0 {
                "earn.available"
            } else {
                "earn.daily_cap_reached"
            });
            let mut decision = builder.allow(AccessOutcome::Free);
            decision.earnings_remaining = Some(earnings_remaining);
            decision
        }
        PolicyClass::PremiumOnlyVisible => {
            if ctx.premium {
                builder.code("allowed.premium");
                return builder.allow(AccessOutcome::Premium);
            }

            builder.code("denied.premium_only");
            builder.deny(
                AccessOutcome::PremiumOnly,
                None,
                format!("{} is available with premium.", resolved.key),
            )
        }
    }
}

fn push_cost_code(
    builder: &mut DecisionBuilder<'_>,
    balance: Option<PointsBalance>,
    cost: u32,
) -> Option<bool> {
    let balance = balance?;
    let affordable = balance.balance >= u64::from(cost);
    builder.code(if affordable {
        "cost.affordable"
    } else {
        "cost.insufficient_balance"
    });
    Some(affordable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentType;
    use crate::{parse_date, parse_rfc3339_utc};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn resolved(key: &str, content_type: ContentType, policy: PolicyClass) -> ResolvedFeature {
        let key = must_ok(FeatureKey::parse(key));
        ResolvedFeature {
            content: must_ok(ContentRef::new(content_type, key.leaf())),
            key,
            policy,
        }
    }

    fn ctx(premium: bool) -> AccessContext {
        AccessContext::new(premium, must_ok(parse_rfc3339_utc("2026-02-07T10:00:00Z")))
    }

    fn usage(used: u32) -> Option<QuotaUsage> {
        Some(QuotaUsage {
            used,
            window_date: must_ok(parse_date("2026-02-07")),
        })
    }

    fn ai_chat() -> ResolvedFeature {
        resolved(
            "ai-chat",
            ContentType::AiChat,
            PolicyClass::DailyFreeWithPointsOverflow {
                daily_free: 3,
                overflow_price: 20,
            },
        )
    }

    #[test]
    fn daily_free_allows_until_quota_used() {
        let feature = ai_chat();
        let decision = evaluate_access(
            &feature,
            &ctx(false),
            &AccessSnapshot {
                usage: usage(2),
                ..AccessSnapshot::default()
            },
        );
        assert!(decision.allowed);
        assert_eq!(decision.outcome, AccessOutcome::Free);
        assert_eq!(decision.remaining_free, Some(1));

        let exhausted = evaluate_access(
            &feature,
            &ctx(false),
            &AccessSnapshot {
                usage: usage(3),
                balance: Some(PointsBalance {
                    balance: 5,
                    lifetime: 5,
                }),
                ..AccessSnapshot::default()
            },
        );
        assert!(!exhausted.allowed);
        assert_eq!(exhausted.cost, Some(20));
        assert!(!exhausted.is_premium_only);
        assert_eq!(exhausted.affordable, Some(false));
        assert_eq!(
            exhausted.reason_codes,
            vec![
                "denied.daily_free_exhausted".to_string(),
                "cost.insufficient_balance".to_string()
            ]
        );
    }

    #[test]
    fn premium_bypasses_quota_and_unlocks() {
        let decision = evaluate_access(
            &ai_chat(),
            &ctx(true),
            &AccessSnapshot {
                usage: usage(30),
                ..AccessSnapshot::default()
            },
        );
        assert!(decision.allowed);
        assert_eq!(decision.outcome, AccessOutcome::Premium);

        let spread = resolved(
            "spread.celtic-cross",
            ContentType::TarotSpread,
            PolicyClass::OneTimePremiumUnlock { unlock_price: 150 },
        );
        assert!(evaluate_access(&spread, &ctx(true), &AccessSnapshot::default()).allowed);
    }

    #[test]
    fn unlock_policy_reports_price_until_unlocked() {
        let spread = resolved(
            "spread.celtic-cross",
            ContentType::TarotSpread,
            PolicyClass::OneTimePremiumUnlock { unlock_price: 150 },
        );

        let locked = evaluate_access(&spread, &ctx(false), &AccessSnapshot::default());
        assert!(!locked.allowed);
        assert_eq!(locked.cost, Some(150));
        assert!(!locked.is_premium_only);
        assert_eq!(locked.affordable, None);
        assert_eq!(locked.outcome, AccessOutcome::UnlockableWithPoints);

        let unlocked = evaluate_access(
            &spread,
            &ctx(false),
            &AccessSnapshot {
                unlocked: true,
                ..AccessSnapshot::default()
            },
        );
        assert!(unlocked.allowed);
        assert_eq!(unlocked.outcome, AccessOutcome::Unlocked);
        assert_eq!(unlocked.cost, None);
    }

    #[test]
    fn premium_only_is_visible_but_flagged() {
        let shadow = resolved(
            "spread.shadow-work",
            ContentType::TarotSpread,
            PolicyClass::PremiumOnlyVisible,
        );
        let denied = evaluate_access(&shadow, &ctx(false), &AccessSnapshot::default());
        assert!(!denied.allowed);
        assert!(denied.is_premium_only);
        assert_eq!(denied.cost, None);
        assert_eq!(denied.outcome, AccessOutcome::PremiumOnly);

        assert!(evaluate_access(&shadow, &ctx(true), &AccessSnapshot::default()).allowed);
    }

    #[test]
    fn metered_features_are_always_allowed() {
        let one_card = resolved(
            "spread.one-card",
            ContentType::TarotSpread,
            PolicyClass::AlwaysFreeMeteredEarning {
                points_per_use: 10,
                daily_earn_cap: 3,
                activity_type: "spread".to_string(),
            },
        );
        let decision = evaluate_access(
            &one_card,
            &ctx(false),
            &AccessSnapshot {
                earn_usage: usage(3),
                ..AccessSnapshot::default()
            },
        );
        assert!(decision.allowed);
        assert_eq!(decision.earnings_remaining, Some(0));
        assert!(decision
            .reason_codes
            .contains(&"earn.daily_cap_reached".to_string()));
    }
}
