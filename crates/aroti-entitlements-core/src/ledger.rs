//! Points economy arithmetic. Storage lives behind [`crate::EntitlementStore`];
//! this module only decides what the next ledger state is.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::EntitlementError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PointsBalance {
    pub balance: u64,
    pub lifetime: u64,
}

impl PointsBalance {
    /// Adds an earn to both the spendable balance and the lifetime total.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] on arithmetic overflow.
    pub fn credit(self, amount: u32) -> Result<Self, EntitlementError> {
        let amount = u64::from(amount);
        let overflow = || EntitlementError::Validation("points balance overflow".to_string());
        Ok(Self {
            balance: self.balance.checked_add(amount).ok_or_else(overflow)?,
            lifetime: self.lifetime.checked_add(amount).ok_or_else(overflow)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SpendCheck {
    Approved(PointsBalance),
    Insufficient { shortfall: u64 },
}

/// Decides a spend in full: either the whole cost fits or nothing changes.
#[must_use]
pub fn check_spend(current: PointsBalance, cost: u32) -> SpendCheck {
    let cost = u64::from(cost);
    match current.balance.checked_sub(cost) {
        Some(balance) => SpendCheck::Approved(PointsBalance {
            balance,
            lifetime: current.lifetime,
        }),
        None => SpendCheck::Insufficient {
            shortfall: cost - current.balance,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Transaction {
    pub seq: i64,
    pub transaction_id: Ulid,
    pub event: String,
    pub delta: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Transaction row before the store assigns a sequence number.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewTransaction {
    pub transaction_id: Ulid,
    pub event: String,
    pub delta: i64,
    pub occurred_at: OffsetDateTime,
}

impl NewTransaction {
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank events.
    pub fn earn(event: &str, amount: u32, at: OffsetDateTime) -> Result<Self, EntitlementError> {
        Self::build(event, i64::from(amount), at)
    }

    /// # Errors
    /// Returns [`EntitlementError::Validation`] for blank events.
    pub fn spend(event: &str, cost: u32, at: OffsetDateTime) -> Result<Self, EntitlementError> {
        Self::build(event, -i64::from(cost), at)
    }

    fn build(event: &str, delta: i64, at: OffsetDateTime) -> Result<Self, EntitlementError> {
        let event = event.trim();
        if event.is_empty() {
            return Err(EntitlementError::Validation(
                "transaction event MUST be provided".to_string(),
            ));
        }

        Ok(Self {
            transaction_id: Ulid::new(),
            event: event.to_string(),
            delta,
            occurred_at: at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EarnResult {
    pub success: bool,
    pub new_balance: u64,
    pub new_lifetime: u64,
    pub message: String,
}

impl EarnResult {
    #[must_use]
    pub fn earned(amount: u32, balance: PointsBalance) -> Self {
        Self {
            success: true,
            new_balance: balance.balance,
            new_lifetime: balance.lifetime,
            message: format!("Earned {amount} points!"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SpendResult {
    pub success: bool,
    pub new_balance: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<u64>,
    pub message: String,
}

impl SpendResult {
    #[must_use]
    pub fn spent(cost: u32, balance: PointsBalance) -> Self {
        Self {
            success: true,
            new_balance: balance.balance,
            shortfall: None,
            message: format!("Spent {cost} points"),
        }
    }

    #[must_use]
    pub fn insufficient(balance: PointsBalance, shortfall: u64) -> Self {
        Self {
            success: false,
            new_balance: balance.balance,
            shortfall: Some(shortfall),
            message: format!("Not enough points. You need {shortfall} more points."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn spend_that_exceeds_balance_is_rejected_in_full() {
        let current = PointsBalance {
            balance: 40,
            lifetime: 90,
        };
        assert_eq!(
            check_spend(current, 60),
            SpendCheck::Insufficient { shortfall: 20 }
        );

        let result = SpendResult::insufficient(current, 20);
        assert!(!result.success);
        assert_eq!(result.new_balance, 40);
        assert_eq!(result.message, "Not enough points. You need 20 more points.");
    }

    #[test]
    fn exact_spend_reaches_zero_without_touching_lifetime() {
        let current = PointsBalance {
            balance: 60,
            lifetime: 60,
        };
        assert_eq!(
            check_spend(current, 60),
            SpendCheck::Approved(PointsBalance {
                balance: 0,
                lifetime: 60
            })
        );
    }

    #[test]
    fn blank_transaction_events_are_rejected() {
        let at = OffsetDateTime::UNIX_EPOCH;
        assert!(NewTransaction::earn("  ", 10, at).is_err());
        match NewTransaction::spend("unlock:spread.celtic-cross", 150, at) {
            Ok(tx) => assert_eq!(tx.delta, -150),
            Err(err) => panic!("expected spend transaction: {err}"),
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Earn(u32),
        Spend(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u32..500).prop_map(Op::Earn),
            (0_u32..500).prop_map(Op::Spend),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn balance_never_negative_and_lifetime_tracks_earns(
            ops in prop::collection::vec(op_strategy(), 0..40)
        ) {
            let mut state = PointsBalance::default();
            let mut earned: u64 = 0;

            for op in ops {
                let before = state;
                match op {
                    Op::Earn(amount) => {
                        state = match state.credit(amount) {
                            Ok(next) => next,
                            Err(err) => panic!("unexpected overflow: {err}"),
                        };
                        earned += u64::from(amount);
                    }
                    Op::Spend(cost) => match check_spend(state, cost) {
                        SpendCheck::Approved(next) => {
                            prop_assert_eq!(next.balance + u64::from(cost), before.balance);
                            state = next;
                        }
                        SpendCheck::Insufficient { shortfall } => {
                            prop_assert!(before.balance < u64::from(cost));
                            prop_assert_eq!(shortfall, u64::from(cost) - before.balance);
                        }
                    },
                }
                prop_assert!(state.lifetime >= before.lifetime);
                prop_assert!(state.balance <= state.lifetime);
            }

            prop_assert_eq!(state.lifetime, earned);
        }
    }
}
