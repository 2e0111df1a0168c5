//! Persistence seam.
//!
//! Writes are compare-and-swap: callers pass the state they read and the
//! state they want, and a store must reject the write with
//! [`EntitlementError::Conflict`] if the stored state moved in between.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use time::OffsetDateTime;

use crate::activity::{ActivityEntry, NewActivity};
use crate::content::ContentRef;
use crate::ledger::{NewTransaction, PointsBalance, Transaction};
use crate::quota::{QuotaKey, QuotaRecord};
use crate::unlock::{UnlockRecord, UnlockResult};
use crate::{EntitlementError, UserId};

pub trait EntitlementStore: Send + Sync {
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn quota(
        &self,
        user: &UserId,
        key: &QuotaKey,
    ) -> Result<Option<QuotaRecord>, EntitlementError>;

    /// Replaces the quota row if it still matches `expected` (`None` = absent).
    ///
    /// # Errors
    /// Returns [`EntitlementError::Conflict`] when the stored row no longer
    /// matches, or [`EntitlementError::Store`] on backend failure.
    fn put_quota(
        &self,
        user: &UserId,
        expected: Option<&QuotaRecord>,
        next: &QuotaRecord,
    ) -> Result<(), EntitlementError>;

    /// Balance of a user; users without a ledger row read as zero.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn balance(&self, user: &UserId) -> Result<PointsBalance, EntitlementError>;

    /// Atomically moves the ledger from `expected` to `next` and appends `tx`.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Conflict`] when the stored balance is not
    /// `expected`, or [`EntitlementError::Store`] on backend failure.
    fn commit_ledger(
        &self,
        user: &UserId,
        expected: PointsBalance,
        next: PointsBalance,
        tx: &NewTransaction,
    ) -> Result<Transaction, EntitlementError>;

    /// Most recent first.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, EntitlementError>;

    /// Inserts a permanent unlock unless one exists; the first record is kept.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn unlock(
        &self,
        user: &UserId,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult, EntitlementError>;

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn unlock_record(
        &self,
        user: &UserId,
        content: &ContentRef,
    ) -> Result<Option<UnlockRecord>, EntitlementError>;

    /// Newest first.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn recent_unlocks(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<UnlockRecord>, EntitlementError>;

    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn append_activity(
        &self,
        user: &UserId,
        activity: &NewActivity,
    ) -> Result<ActivityEntry, EntitlementError>;

    /// Entries with `occurred_at >= since`, oldest first.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn activity_since(
        &self,
        user: &UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<ActivityEntry>, EntitlementError>;

    /// Deletes entries with `occurred_at < before` and returns how many went.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Store`] when the backend fails.
    fn prune_activity(
        &self,
        user: &UserId,
        before: OffsetDateTime,
    ) -> Result<usize, EntitlementError>;
}

impl<T: EntitlementStore + ?Sized> EntitlementStore for &T {
    fn quota(
        &self,
        user: &UserId,
        key: &QuotaKey,
    ) -> Result<Option<QuotaRecord>, EntitlementError> {
        (**self).quota(user, key)
    }

    fn put_quota(
        &self,
        user: &UserId,
        expected: Option<&QuotaRecord>,
        next: &QuotaRecord,
    ) -> Result<(), EntitlementError> {
        (**self).put_quota(user, expected, next)
    }

    fn balance(&self, user: &UserId) -> Result<PointsBalance, EntitlementError> {
        (**self).balance(user)
    }

    fn commit_ledger(
        &self,
        user: &UserId,
        expected: PointsBalance,
        next: PointsBalance,
        tx: &NewTransaction,
    ) -> Result<Transaction, EntitlementError> {
        (**self).commit_ledger(user, expected, next, tx)
    }

    fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, EntitlementError> {
        (**self).transactions(user, limit)
    }

    fn unlock(
        &self,
        user: &UserId,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult, EntitlementError> {
        (**self).unlock(user, content, at)
    }

    fn unlock_record(
        &self,
        user: &UserId,
        content: &ContentRef,
    ) -> Result<Option<UnlockRecord>, EntitlementError> {
        (**self).unlock_record(user, content)
    }

    fn recent_unlocks(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<UnlockRecord>, EntitlementError> {
        (**self).recent_unlocks(user, limit)
    }

    fn append_activity(
        &self,
        user: &UserId,
        activity: &NewActivity,
    ) -> Result<ActivityEntry, EntitlementError> {
        (**self).append_activity(user, activity)
    }

    fn activity_since(
        &self,
        user: &UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<ActivityEntry>, EntitlementError> {
        (**self).activity_since(user, since)
    }

    fn prune_activity(
        &self,
        user: &UserId,
        before: OffsetDateTime,
    ) -> Result<usize, EntitlementError> {
        (**self).prune_activity(user, before)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    quotas: HashMap<(UserId, QuotaKey), QuotaRecord>,
    ledgers: HashMap<UserId, PointsBalance>,
    transactions: HashMap<UserId, Vec<Transaction>>,
    unlocks: HashMap<(UserId, ContentRef), UnlockRecord>,
    activity: HashMap<UserId, Vec<ActivityEntry>>,
    next_seq: i64,
}

impl MemoryState {
    fn next_seq(&mut self) -> i64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Process-local store used by tests and embedders that bring their own
/// persistence.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, EntitlementError> {
        self.state
            .lock()
            .map_err(|_| EntitlementError::Store("in-memory store lock poisoned".to_string()))
    }
}

fn same_window(lhs: &QuotaRecord, rhs: &QuotaRecord) -> bool {
    lhs.used_count == rhs.used_count && lhs.window_date == rhs.window_date
}

impl EntitlementStore for InMemoryStore {
    fn quota(
        &self,
        user: &UserId,
        key: &QuotaKey,
    ) -> Result<Option<QuotaRecord>, EntitlementError> {
        Ok(self.state()?.quotas.get(&(user.clone(), key.clone())).cloned())
    }

    fn put_quota(
        &self,
        user: &UserId,
        expected: Option<&QuotaRecord>,
        next: &QuotaRecord,
    ) -> Result<(), EntitlementError> {
        let mut state = self.state()?;
        let slot = (user.clone(), next.key.clone());
        let matches = match (state.quotas.get(&slot), expected) {
            (None, None) => true,
            (Some(stored), Some(expected)) => same_window(stored, expected),
            _ => false,
        };
        if !matches {
            return Err(EntitlementError::Conflict(format!(
                "quota {} changed for user {user}",
                next.key
            )));
        }
        state.quotas.insert(slot, next.clone());
        Ok(())
    }

    fn balance(&self, user: &UserId) -> Result<PointsBalance, EntitlementError> {
        Ok(self.state()?.ledgers.get(user).copied().unwrap_or_default())
    }

    fn commit_ledger(
        &self,
        user: &UserId,
        expected: PointsBalance,
        next: PointsBalance,
        tx: &NewTransaction,
    ) -> Result<Transaction, EntitlementError> {
        let mut state = self.state()?;
        let stored = state.ledgers.get(user).copied().unwrap_or_default();
        if stored != expected {
            return Err(EntitlementError::Conflict(format!(
                "points ledger changed for user {user}"
            )));
        }

        let transaction = Transaction {
            seq: state.next_seq(),
            transaction_id: tx.transaction_id,
            event: tx.event.clone(),
            delta: tx.delta,
            occurred_at: tx.occurred_at,
        };
        state.ledgers.insert(user.clone(), next);
        state
            .transactions
            .entry(user.clone())
            .or_default()
            .push(transaction.clone());
        Ok(transaction)
    }

    fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, EntitlementError> {
        let state = self.state()?;
        Ok(state
            .transactions
            .get(user)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn unlock(
        &self,
        user: &UserId,
        content: &ContentRef,
        at: OffsetDateTime,
    ) -> Result<UnlockResult, EntitlementError> {
        let mut state = self.state()?;
        let slot = (user.clone(), content.clone());
        let result = UnlockRecord::merge(state.unlocks.get(&slot), content.clone(), at);
        if result.newly_unlocked {
            state.unlocks.insert(slot, result.record.clone());
        }
        Ok(result)
    }

    fn unlock_record(
        &self,
        user: &UserId,
        content: &ContentRef,
    ) -> Result<Option<UnlockRecord>, EntitlementError> {
        Ok(self
            .state()?
            .unlocks
            .get(&(user.clone(), content.clone()))
            .cloned())
    }

    fn recent_unlocks(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<UnlockRecord>, EntitlementError> {
        let state = self.state()?;
        let mut records: Vec<UnlockRecord> = state
            .unlocks
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|lhs, rhs| {
            rhs.unlocked_at
                .cmp(&lhs.unlocked_at)
                .then_with(|| lhs.content.cmp(&rhs.content))
        });
        records.truncate(limit);
        Ok(records)
    }

    fn append_activity(
        &self,
        user: &UserId,
        activity: &NewActivity,
    ) -> Result<ActivityEntry, EntitlementError> {
        let mut state = self.state()?;
        let entry = ActivityEntry {
            seq: state.next_seq(),
            activity_type: activity.activity_type.clone(),
            points: activity.points,
            occurred_at: activity.occurred_at,
        };
        state
            .activity
            .entry(user.clone())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    fn activity_since(
        &self,
        user: &UserId,
        since: OffsetDateTime,
    ) -> Result<Vec<ActivityEntry>, EntitlementError> {
        let state = self.state()?;
        let mut entries: Vec<ActivityEntry> = state
            .activity
            .get(user)
            .map(|rows| {
                rows.iter()
                    .filter(|entry| entry.occurred_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|lhs, rhs| {
            lhs.occurred_at
                .cmp(&rhs.occurred_at)
                .then(lhs.seq.cmp(&rhs.seq))
        });
        Ok(entries)
    }

    fn prune_activity(
        &self,
        user: &UserId,
        before: OffsetDateTime,
    ) -> Result<usize, EntitlementError> {
        let mut state = self.state()?;
        let Some(rows) = state.activity.get_mut(user) else {
            return Ok(0);
        };
        let original = rows.len();
        rows.retain(|entry| entry.occurred_at >= before);
        Ok(original - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FeatureKey;
    use crate::content::ContentType;
    use crate::quota::QuotaWindow;
    use crate::{parse_rfc3339_utc, DayBoundary};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn user() -> UserId {
        must_ok(UserId::parse("user-1"))
    }

    #[test]
    fn stale_quota_write_is_a_conflict() {
        let store = InMemoryStore::new();
        let at = must_ok(parse_rfc3339_utc("2026-02-07T10:00:00Z"));
        let window = QuotaWindow::for_instant(at, DayBoundary::utc());
        let key = QuotaKey::usage(&must_ok(FeatureKey::parse("quiz")));

        let first = must_ok(window.advance(&key, None, at));
        must_ok(store.put_quota(&user(), None, &first));

        let raced = must_ok(window.advance(&key, None, at));
        assert!(matches!(
            store.put_quota(&user(), None, &raced),
            Err(EntitlementError::Conflict(_))
        ));

        let second = must_ok(window.advance(&key, Some(&first), at));
        must_ok(store.put_quota(&user(), Some(&first), &second));
        assert_eq!(
            must_ok(store.quota(&user(), &key)).map(|record| record.used_count),
            Some(2)
        );
    }

    #[test]
    fn ledger_commit_checks_expected_balance() {
        let store = InMemoryStore::new();
        let at = must_ok(parse_rfc3339_utc("2026-02-07T10:00:00Z"));
        let earned = PointsBalance {
            balance: 10,
            lifetime: 10,
        };
        let tx = must_ok(NewTransaction::earn("complete_quiz", 10, at));
        must_ok(store.commit_ledger(&user(), PointsBalance::default(), earned, &tx));

        assert!(matches!(
            store.commit_ledger(&user(), PointsBalance::default(), earned, &tx),
            Err(EntitlementError::Conflict(_))
        ));
        assert_eq!(must_ok(store.balance(&user())), earned);
        assert_eq!(must_ok(store.transactions(&user(), 10)).len(), 1);
    }

    #[test]
    fn unlocks_are_idempotent_and_listed_newest_first() {
        let store = InMemoryStore::new();
        let early = must_ok(parse_rfc3339_utc("2026-02-07T10:00:00Z"));
        let late = must_ok(parse_rfc3339_utc("2026-02-08T10:00:00Z"));
        let celtic = must_ok(ContentRef::new(ContentType::TarotSpread, "celtic-cross"));
        let article = must_ok(ContentRef::new(ContentType::Article, "moon"));

        assert!(must_ok(store.unlock(&user(), &celtic, early)).newly_unlocked);
        assert!(!must_ok(store.unlock(&user(), &celtic, late)).newly_unlocked);
        must_ok(store.unlock(&user(), &article, late));

        let recent = must_ok(store.recent_unlocks(&user(), 5));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, article);
        assert_eq!(recent[1].unlocked_at, early);
    }

    #[test]
    fn pruning_only_removes_entries_before_cutoff() {
        let store = InMemoryStore::new();
        let old = must_ok(parse_rfc3339_utc("2026-01-01T10:00:00Z"));
        let recent = must_ok(parse_rfc3339_utc("2026-02-07T10:00:00Z"));
        must_ok(store.append_activity(&user(), &must_ok(NewActivity::new("spread", 10, old))));
        must_ok(store.append_activity(&user(), &must_ok(NewActivity::new("quiz", 10, recent))));

        let cutoff = must_ok(parse_rfc3339_utc("2026-01-15T00:00:00Z"));
        assert_eq!(must_ok(store.prune_activity(&user(), cutoff)), 1);
        let remaining = must_ok(store.activity_since(&user(), OffsetDateTime::UNIX_EPOCH));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].activity_type, "quiz");
    }
}
