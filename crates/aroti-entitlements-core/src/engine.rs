//! Engine facade tying the policy, the store and per-user serialization
//! together.
//!
//! Reads go straight to the store. Every commit takes the user's lock first
//! and then performs read, decide, compare-and-swap write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::access::{evaluate_access, AccessContext, AccessDecision, AccessSnapshot};
use crate::activity::{self, ActivityEntry, DailyPoints, NewActivity, TodayProgress};
use crate::catalog::{FeatureKey, PolicyClass, ResolvedFeature};
use crate::content::ContentRef;
use crate::ledger::{
    check_spend, EarnResult, NewTransaction, PointsBalance, SpendCheck, SpendResult, Transaction,
};
use crate::policy::{CompiledPolicy, EntitlementPolicy};
use crate::progression::{LevelInfo, Milestone};
use crate::quota::{QuotaKey, QuotaUsage, QuotaWindow};
use crate::store::EntitlementStore;
use crate::unlock::{UnlockRecord, UnlockResult};
use crate::{truncate_to_seconds, EntitlementError, UserId};

const JOURNEY_RECENT_UNLOCKS: usize = 5;

/// One mutex per user, created on first use.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding `user`'s lock.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] if a lock was poisoned, otherwise
    /// whatever `f` returns.
    pub fn with_user<T>(
        &self,
        user: &UserId,
        f: impl FnOnce() -> Result<T, EntitlementError>,
    ) -> Result<T, EntitlementError> {
        let user_lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| EntitlementError::Store("user lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(user.clone()).or_default())
        };

        let _guard = user_lock
            .lock()
            .map_err(|_| EntitlementError::Store(format!("lock for user {user} poisoned")))?;
        f()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnlockSpendStatus {
    NotRequired,
    AlreadyUnlocked,
    InsufficientPoints,
    Unlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnlockSpendResult {
    pub feature: FeatureKey,
    pub content: ContentRef,
    pub status: UnlockSpendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend: Option<SpendResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock: Option<UnlockRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowSpendStatus {
    NotRequired,
    FreeQuotaAvailable,
    InsufficientPoints,
    Charged,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OverflowSpendResult {
    pub feature: FeatureKey,
    pub status: OverflowSpendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend: Option<SpendResult>,
    pub usage: QuotaUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MeteredEarnResult {
    pub feature: FeatureKey,
    pub awarded: bool,
    pub points_awarded: u32,
    pub earnings_remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earn: Option<EarnResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CompletionResult {
    pub earn: EarnResult,
    pub activity: ActivityEntry,
    pub level: LevelInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JourneySummary {
    pub total_points: u64,
    pub lifetime_points: u64,
    pub level: LevelInfo,
    pub today: TodayProgress,
    pub last_7_days: Vec<DailyPoints>,
    pub milestones: Vec<Milestone>,
    pub recent_unlocks: Vec<UnlockRecord>,
}

pub struct EntitlementEngine<S> {
    store: S,
    policy: CompiledPolicy,
    locks: UserLocks,
}

impl<S: EntitlementStore> EntitlementEngine<S> {
    /// # Errors
    /// Returns [`EntitlementError::Configuration`] when `policy` is invalid.
    pub fn new(store: S, policy: &EntitlementPolicy) -> Result<Self, EntitlementError> {
        Ok(Self {
            store,
            policy: policy.compile()?,
            locks: UserLocks::new(),
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn policy(&self) -> &CompiledPolicy {
        &self.policy
    }

    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown features.
    pub fn resolve(&self, feature: &str) -> Result<ResolvedFeature, EntitlementError> {
        self.policy.catalog.resolve(feature)
    }

    #[must_use]
    pub fn user(&self, user: UserId) -> UserHandle<'_, S> {
        UserHandle { engine: self, user }
    }
}

/// All operations for one user.
pub struct UserHandle<'a, S> {
    engine: &'a EntitlementEngine<S>,
    user: UserId,
}

impl<S: EntitlementStore> UserHandle<'_, S> {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user
    }

    fn store(&self) -> &S {
        &self.engine.store
    }

    fn policy(&self) -> &CompiledPolicy {
        &self.engine.policy
    }

    fn window(&self, as_of: OffsetDateTime) -> QuotaWindow {
        QuotaWindow::for_instant(as_of, self.policy().boundary)
    }

    fn locked<T>(
        &self,
        f: impl FnOnce() -> Result<T, EntitlementError>,
    ) -> Result<T, EntitlementError> {
        self.engine.locks.with_user(&self.user, f)
    }

    /// Read-only access decision for `feature`.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown features and
    /// [`EntitlementError::Store`] when state cannot be read.
    pub fn check_access(
        &self,
        feature: &str,
        ctx: &AccessContext,
    ) -> Result<AccessDecision, EntitlementError> {
        let resolved = self.engine.resolve(feature)?;
        let snapshot = self.snapshot(&resolved, ctx)?;
        let decision = evaluate_access(&resolved, ctx, &snapshot);
        debug!(
            user_id = %self.user,
            feature = %decision.feature,
            allowed = decision.allowed,
            outcome = decision.outcome.as_str(),
            "evaluated access"
        );
        Ok(decision)
    }

    fn snapshot(
        &self,
        resolved: &ResolvedFeature,
        ctx: &AccessContext,
    ) -> Result<AccessSnapshot, EntitlementError> {
        let window = self.window(ctx.as_of);
        let mut snapshot = AccessSnapshot::default();

        match &resolved.policy {
            PolicyClass::DailyFreeWithPointsOverflow { .. } if !ctx.premium => {
                let record = self.store().quota(&self.user, &QuotaKey::usage(&resolved.key))?;
                snapshot.usage = Some(window.usage(record.as_ref()));
                snapshot.balance = Some(self.store().balance(&self.user)?);
            }
            PolicyClass::OneTimePremiumUnlock { .. } if !ctx.premium => {
                snapshot.unlocked = self.is_unlocked(&resolved.content)?;
                if !snapshot.unlocked {
                    snapshot.balance = Some(self.store().balance(&self.user)?);
                }
            }
            PolicyClass::AlwaysFreeMeteredEarning { .. } => {
                let record = self
                    .store()
                    .quota(&self.user, &QuotaKey::earning(&resolved.key))?;
                snapshot.earn_usage = Some(window.usage(record.as_ref()));
            }
            _ => {}
        }

        Ok(snapshot)
    }

    /// Today's usage of `feature`; a stale window reads as zero.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown features and
    /// [`EntitlementError::Store`] when state cannot be read.
    pub fn get_usage(
        &self,
        feature: &str,
        as_of: OffsetDateTime,
    ) -> Result<QuotaUsage, EntitlementError> {
        let resolved = self.engine.resolve(feature)?;
        let record = self
            .store()
            .quota(&self.user, &QuotaKey::usage(&resolved.key))?;
        Ok(self.window(truncate_to_seconds(as_of)).usage(record.as_ref()))
    }

    /// Counts one use of `feature` today. Premium contexts are not metered
    /// and get the current usage back unchanged.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown features,
    /// [`EntitlementError::Conflict`] when another writer raced this one, and
    /// [`EntitlementError::Store`] on store failure.
    pub fn record_usage(
        &self,
        feature: &str,
        ctx: &AccessContext,
    ) -> Result<QuotaUsage, EntitlementError> {
        let resolved = self.engine.resolve(feature)?;
        if ctx.premium {
            return self.get_usage(resolved.key.as_str(), ctx.as_of);
        }

        self.locked(|| self.bump_quota(&QuotaKey::usage(&resolved.key), ctx.as_of))
    }

    fn bump_quota(
        &self,
        key: &QuotaKey,
        as_of: OffsetDateTime,
    ) -> Result<QuotaUsage, EntitlementError> {
        let window = self.window(as_of);
        let current = self.store().quota(&self.user, key)?;
        let next = window.advance(key, current.as_ref(), as_of)?;
        self.store().put_quota(&self.user, current.as_ref(), &next)?;
        info!(
            user_id = %self.user,
            quota = %key,
            used = next.used_count,
            "recorded quota use"
        );
        Ok(window.usage(Some(&next)))
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the ledger cannot be read.
    pub fn balance(&self) -> Result<PointsBalance, EntitlementError> {
        self.store().balance(&self.user)
    }

    /// Credits `amount` to balance and lifetime and logs the transaction.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank events or zero
    /// amounts, [`EntitlementError::Conflict`] or [`EntitlementError::Store`]
    /// when the commit fails.
    pub fn earn_points(
        &self,
        event: &str,
        amount: u32,
        at: OffsetDateTime,
    ) -> Result<EarnResult, EntitlementError> {
        let at = truncate_to_seconds(at);
        self.locked(|| self.earn_unlocked(event, amount, at))
    }

    fn earn_unlocked(
        &self,
        event: &str,
        amount: u32,
        at: OffsetDateTime,
    ) -> Result<EarnResult, EntitlementError> {
        if amount == 0 {
            return Err(EntitlementError::Validation(
                "earn amount MUST be >= 1".to_string(),
            ));
        }

        let tx = NewTransaction::earn(event, amount, at)?;
        let current = self.store().balance(&self.user)?;
        let next = current.credit(amount)?;
        self.store().commit_ledger(&self.user, current, next, &tx)?;
        info!(
            user_id = %self.user,
            event = %tx.event,
            amount,
            balance = next.balance,
            lifetime = next.lifetime,
            "earned points"
        );
        Ok(EarnResult::earned(amount, next))
    }

    /// Spends `cost` points if the balance covers it. Insufficient funds is a
    /// normal unsuccessful result, not an error.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank events or zero
    /// costs, [`EntitlementError::Conflict`] or [`EntitlementError::Store`]
    /// when the commit fails.
    pub fn spend_points(
        &self,
        event: &str,
        cost: u32,
        at: OffsetDateTime,
    ) -> Result<SpendResult, EntitlementError> {
        let at = truncate_to_seconds(at);
        self.locked(|| self.spend_unlocked(event, cost, at))
    }

    fn spend_unlocked(
        &self,
        event: &str,
        cost: u32,
        at: OffsetDateTime,
    ) -> Result<SpendResult, EntitlementError> {
        if cost == 0 {
            return Err(EntitlementError::Validation(
                "spend cost MUST be >= 1".to_string(),
            ));
        }

        let tx = NewTransaction::spend(event, cost, at)?;
        let current = self.store().balance(&self.user)?;
        match check_spend(current, cost) {
            SpendCheck::Approved(next) => {
                self.store().commit_ledger(&self.user, current, next, &tx)?;
                info!(
                    user_id = %self.user,
                    event = %tx.event,
                    cost,
                    balance = next.balance,
                    "spent points"
                );
                Ok(SpendResult::spent(cost, next))
            }
            SpendCheck::Insufficient { shortfall } => {
                warn!(
                    user_id = %self.user,
                    event = %tx.event,
                    cost,
                    balance = current.balance,
                    shortfall,
                    "rejected spend"
                );
                Ok(SpendResult::insufficient(current, shortfall))
            }
        }
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the log cannot be read.
    pub fn transactions(&self, limit: usize) -> Result<Vec<Transaction>, EntitlementError> {
        self.store().transactions(&self.user, limit)
    }

    /// Records a permanent unlock; repeated calls keep the first timestamp.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the unlock cannot be written.
    pub fn unlock(
        &self,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult, EntitlementError> {
        let at = truncate_to_seconds(at);
        self.locked(|| self.unlock_unlocked(content, at))
    }

    fn unlock_unlocked(
        &self,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult, EntitlementError> {
        let result = self.store().unlock(&self.user, content, at)?;
        if result.newly_unlocked {
            info!(user_id = %self.user, content = %content, "unlocked content");
        }
        Ok(result)
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when state cannot be read.
    pub fn is_unlocked(&self, content: &ContentRef) -> Result<bool, EntitlementError> {
        Ok(self
            .store()
            .unlock_record(&self.user, content)?
            .is_some_and(|record| record.permanent))
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when state cannot be read.
    pub fn recent_unlocks(&self, limit: usize) -> Result<Vec<UnlockRecord>, EntitlementError> {
        self.store().recent_unlocks(&self.user, limit)
    }

    /// Pays the unlock price of a one-time-unlock feature and records the
    /// permanent unlock.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown features,
    /// [`EntitlementError::Conflict`] or [`EntitlementError::Store`] when a
    /// commit fails.
    pub fn spend_for_unlock(
        &self,
        feature: &str,
        ctx: &AccessContext,
    ) -> Result<UnlockSpendResult, EntitlementError> {
        let resolved = self.engine.resolve(feature)?;
        let outcome = |status, spend, unlock| UnlockSpendResult {
            feature: resolved.key.clone(),
            content: resolved.content.clone(),
            status,
            spend,
            unlock,
        };

        let PolicyClass::OneTimePremiumUnlock { unlock_price } = resolved.policy else {
            return Ok(outcome(UnlockSpendStatus::NotRequired, None, None));
        };
        if ctx.premium {
            return Ok(outcome(UnlockSpendStatus::NotRequired, None, None));
        }

        self.locked(|| {
            if let Some(existing) = self.store().unlock_record(&self.user, &resolved.content)? {
                if existing.permanent {
                    return Ok(outcome(
                        UnlockSpendStatus::AlreadyUnlocked,
                        None,
                        Some(existing),
                    ));
                }
            }

            let event = format!("unlock:{}", resolved.key);
            let spend = self.spend_unlocked(&event, unlock_price, ctx.as_of)?;
            if !spend.success {
                return Ok(outcome(
                    UnlockSpendStatus::InsufficientPoints,
                    Some(spend),
                    None,
                ));
            }

            let unlocked = self.unlock_unlocked(&resolved.content, ctx.as_of)?;
            Ok(outcome(
                UnlockSpendStatus::Unlocked,
                Some(spend),
                Some(unlocked.record),
            ))
        })
    }

    /// Pays the overflow price for one more use of a daily-free feature once
    /// today's free quota is used up, and counts the use.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown features,
    /// [`EntitlementError::Conflict`] or [`EntitlementError::Store`] when a
    /// commit fails.
    pub fn spend_for_overflow(
        &self,
        feature: &str,
        ctx: &AccessContext,
    ) -> Result<OverflowSpendResult, EntitlementError> {
        let resolved = self.engine.resolve(feature)?;
        let key = QuotaKey::usage(&resolved.key);
        let window = self.window(ctx.as_of);
        let outcome = |status, spend, usage| OverflowSpendResult {
            feature: resolved.key.clone(),
            status,
            spend,
            usage,
        };

        let PolicyClass::DailyFreeWithPointsOverflow {
            daily_free,
            overflow_price,
        } = resolved.policy
        else {
            let usage = window.usage(self.store().quota(&self.user, &key)?.as_ref());
            return Ok(outcome(OverflowSpendStatus::NotRequired, None, usage));
        };

        self.locked(|| {
            let usage = window.usage(self.store().quota(&self.user, &key)?.as_ref());
            if ctx.premium {
                return Ok(outcome(OverflowSpendStatus::NotRequired, None, usage));
            }
            if usage.used < daily_free {
                return Ok(outcome(OverflowSpendStatus::FreeQuotaAvailable, None, usage));
            }

            let event = format!("overflow:{}", resolved.key);
            let spend = self.spend_unlocked(&event, overflow_price, ctx.as_of)?;
            if !spend.success {
                return Ok(outcome(
                    OverflowSpendStatus::InsufficientPoints,
                    Some(spend),
                    usage,
                ));
            }

            let usage = self.bump_quota(&key, ctx.as_of)?;
            Ok(outcome(OverflowSpendStatus::Charged, Some(spend), usage))
        })
    }

    /// Appends an activity entry and prunes entries outside the retention
    /// window.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank activity types and
    /// [`EntitlementError::Store`] when the log cannot be written.
    pub fn record_activity(
        &self,
        activity_type: &str,
        points: u32,
        at: OffsetDateTime,
    ) -> Result<ActivityEntry, EntitlementError> {
        let at = truncate_to_seconds(at);
        self.locked(|| self.record_activity_unlocked(activity_type, points, at))
    }

    fn record_activity_unlocked(
        &self,
        activity_type: &str,
        points: u32,
        at: OffsetDateTime,
    ) -> Result<ActivityEntry, EntitlementError> {
        let new_entry = NewActivity::new(activity_type, points, at)?;
        let entry = self.store().append_activity(&self.user, &new_entry)?;
        let cutoff =
            activity::retention_cutoff(at, self.policy().policy.activity_retention_days);
        let pruned = self.store().prune_activity(&self.user, cutoff)?;
        debug!(
            user_id = %self.user,
            activity_type = %entry.activity_type,
            points = entry.points,
            pruned,
            "recorded activity"
        );
        Ok(entry)
    }

    /// Earns points and records the matching activity entry together.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for invalid input,
    /// [`EntitlementError::Conflict`] or [`EntitlementError::Store`] when a
    /// commit fails.
    pub fn complete_activity(
        &self,
        activity_type: &str,
        event: &str,
        points: u32,
        at: OffsetDateTime,
    ) -> Result<CompletionResult, EntitlementError> {
        let at = truncate_to_seconds(at);
        self.locked(|| {
            let earn = self.earn_unlocked(event, points, at)?;
            let activity = self.record_activity_unlocked(activity_type, points, at)?;
            Ok(CompletionResult {
                level: self.policy().levels.level_info(earn.new_lifetime),
                earn,
                activity,
            })
        })
    }

    /// Awards the configured points for one use of a metered feature while
    /// today's earn cap allows; the use itself is never blocked.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for unknown or non-metered
    /// features, [`EntitlementError::Conflict`] or
    /// [`EntitlementError::Store`] when a commit fails.
    pub fn record_metered_earning(
        &self,
        feature: &str,
        ctx: &AccessContext,
    ) -> Result<MeteredEarnResult, EntitlementError> {
        let resolved = self.engine.resolve(feature)?;
        let PolicyClass::AlwaysFreeMeteredEarning {
            points_per_use,
            daily_earn_cap,
            activity_type,
        } = &resolved.policy
        else {
            return Err(EntitlementError::Validation(format!(
                "{} is not a metered earning feature",
                resolved.key
            )));
        };

        let key = QuotaKey::earning(&resolved.key);
        let window = self.window(ctx.as_of);

        self.locked(|| {
            let usage = window.usage(self.store().quota(&self.user, &key)?.as_ref());
            if usage.used >= *daily_earn_cap {
                debug!(
                    user_id = %self.user,
                    feature = %resolved.key,
                    "metered earn cap reached"
                );
                return Ok(MeteredEarnResult {
                    feature: resolved.key.clone(),
                    awarded: false,
                    points_awarded: 0,
                    earnings_remaining: 0,
                    earn: None,
                    activity: None,
                });
            }

            // Claim the cap slot first: a failed earn may waste a slot but
            // can never award points past the cap.
            let usage = self.bump_quota(&key, ctx.as_of)?;
            let event = format!("complete_{}", resolved.key);
            let earn = self.earn_unlocked(&event, *points_per_use, ctx.as_of)?;
            let activity =
                self.record_activity_unlocked(activity_type, *points_per_use, ctx.as_of)?;

            Ok(MeteredEarnResult {
                feature: resolved.key.clone(),
                awarded: true,
                points_awarded: *points_per_use,
                earnings_remaining: daily_earn_cap.saturating_sub(usage.used),
                earn: Some(earn),
                activity: Some(activity),
            })
        })
    }

    fn retained_activity(
        &self,
        as_of: OffsetDateTime,
    ) -> Result<Vec<ActivityEntry>, EntitlementError> {
        let cutoff =
            activity::retention_cutoff(as_of, self.policy().policy.activity_retention_days);
        self.store().activity_since(&self.user, cutoff)
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the log cannot be read.
    pub fn streak_days(&self, as_of: OffsetDateTime) -> Result<u32, EntitlementError> {
        let entries = self.retained_activity(as_of)?;
        let boundary = self.policy().boundary;
        Ok(activity::streak_days(
            &entries,
            boundary,
            boundary.date_of(as_of),
            self.policy().policy.streak_cap_days,
        ))
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the log cannot be read.
    pub fn last_7_days(
        &self,
        as_of: OffsetDateTime,
    ) -> Result<Vec<DailyPoints>, EntitlementError> {
        let entries = self.retained_activity(as_of)?;
        let boundary = self.policy().boundary;
        Ok(activity::last_7_days(
            &entries,
            boundary,
            boundary.date_of(as_of),
        ))
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the log cannot be read.
    pub fn today_progress(
        &self,
        as_of: OffsetDateTime,
    ) -> Result<TodayProgress, EntitlementError> {
        let entries = self.retained_activity(as_of)?;
        let boundary = self.policy().boundary;
        Ok(activity::today_progress(
            &entries,
            boundary,
            boundary.date_of(as_of),
            self.policy().policy.streak_cap_days,
        ))
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the ledger cannot be read.
    pub fn level_info(&self) -> Result<LevelInfo, EntitlementError> {
        let balance = self.balance()?;
        Ok(self.policy().levels.level_info(balance.lifetime))
    }

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the ledger cannot be read.
    pub fn milestones(&self) -> Result<Vec<Milestone>, EntitlementError> {
        let balance = self.balance()?;
        Ok(self.policy().levels.milestones(balance.lifetime))
    }

    /// Everything the journey screen shows, read at `as_of`.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when state cannot be read.
    pub fn journey_summary(
        &self,
        as_of: OffsetDateTime,
    ) -> Result<JourneySummary, EntitlementError> {
        let balance = self.balance()?;
        let entries = self.retained_activity(as_of)?;
        let boundary = self.policy().boundary;
        let today = boundary.date_of(as_of);
        let levels = &self.policy().levels;

        Ok(JourneySummary {
            total_points: balance.balance,
            lifetime_points: balance.lifetime,
            level: levels.level_info(balance.lifetime),
            today: activity::today_progress(
                &entries,
                boundary,
                today,
                self.policy().policy.streak_cap_days,
            ),
            last_7_days: activity::last_7_days(&entries, boundary, today),
            milestones: levels.milestones(balance.lifetime),
            recent_unlocks: self.recent_unlocks(JOURNEY_RECENT_UNLOCKS)?,
        })
    }
}
