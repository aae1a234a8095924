//! Per-user rate-limited allowance.
//!
//! Each user has `(remaining, last_update)`. Reads top the allowance up by
//! the time elapsed since `last_update` times the payout rate, capped at the
//! maximum. Charges may drive it negative; later top-ups pay the debt back.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::pricing::Factor;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget exceeded: {remaining} remaining, {cost} requested")]
    BudgetExceeded { remaining: i64, cost: i64 },

    #[error("budget store: {0}")]
    Store(String),
}

/// A stored allowance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetRow {
    pub remaining: i64,
    /// Milliseconds since the unix epoch.
    pub last_update: i64,
}

/// One read-modify-write against a user's row.
///
/// Stores apply it as a single atomic statement: insert `(max, now)` if the
/// row is missing, then top up, subtract `cost` and clamp at `max`. When
/// `floor` is set and the result would fall below it, nothing is written.
#[derive(Debug, Clone, Copy)]
pub struct Adjustment {
    pub now: i64,
    /// Units paid out per second.
    pub payout: Factor,
    pub max: i64,
    pub cost: i64,
    pub floor: Option<i64>,
}

/// Result of applying an [`Adjustment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated(i64),
    /// The floor would have been crossed; carries the topped-up balance.
    Rejected(i64),
}

impl Adjustment {
    /// Compute the row an atomic store must write, or `None` when rejected.
    pub fn evaluate(&self, row: Option<BudgetRow>) -> (Applied, Option<BudgetRow>) {
        let row = row.unwrap_or(BudgetRow {
            remaining: self.max,
            last_update: self.now,
        });
        let elapsed = (self.now - row.last_update).max(0) as i128;
        let top_up = elapsed * self.payout.num as i128 / (self.payout.den as i128 * 1000);
        let topped = (row.remaining as i128 + top_up).min(self.max as i128);
        let next = (topped - self.cost as i128).min(self.max as i128);
        let next = next.clamp(i64::MIN as i128, i64::MAX as i128) as i64;

        if let Some(floor) = self.floor {
            if next < floor {
                return (Applied::Rejected(topped as i64), None);
            }
        }
        (
            Applied::Updated(next),
            Some(BudgetRow {
                remaining: next,
                last_update: self.now,
            }),
        )
    }
}

/// Persistence for allowance rows.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn apply(&self, user: &str, adjustment: &Adjustment) -> Result<Applied, BudgetError>;
}

/// In-process store; the mutex makes each adjustment atomic.
#[derive(Default)]
pub struct MemoryBudgetStore {
    rows: Mutex<HashMap<String, BudgetRow>>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: &str, row: BudgetRow) {
        self.rows.lock().await.insert(user.to_string(), row);
    }

    pub async fn get(&self, user: &str) -> Option<BudgetRow> {
        self.rows.lock().await.get(user).copied()
    }
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn apply(&self, user: &str, adjustment: &Adjustment) -> Result<Applied, BudgetError> {
        let mut rows = self.rows.lock().await;
        let (applied, next) = adjustment.evaluate(rows.get(user).copied());
        if let Some(next) = next {
            rows.insert(user.to_string(), next);
        }
        Ok(applied)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BudgetConfig {
    pub max: i64,
    /// Units per second.
    pub payout: Factor,
}

pub struct Budgeter {
    store: Box<dyn BudgetStore>,
    config: BudgetConfig,
}

impl Budgeter {
    pub fn new(store: Box<dyn BudgetStore>, config: BudgetConfig) -> Self {
        Self { store, config }
    }

    /// Top up and return the current allowance.
    pub async fn remaining(&self, user: &str) -> Result<i64, BudgetError> {
        match self.apply(user, 0, None).await? {
            Applied::Updated(remaining) | Applied::Rejected(remaining) => Ok(remaining),
        }
    }

    /// Top up, then subtract `cost`. The result may be negative.
    pub async fn charge(&self, user: &str, cost: i64) -> Result<i64, BudgetError> {
        match self.apply(user, cost, None).await? {
            Applied::Updated(remaining) | Applied::Rejected(remaining) => Ok(remaining),
        }
    }

    /// Like [`Budgeter::charge`], but refuses to go below zero.
    pub async fn checked_charge(&self, user: &str, cost: i64) -> Result<i64, BudgetError> {
        match self.apply(user, cost, Some(0)).await? {
            Applied::Updated(remaining) => Ok(remaining),
            Applied::Rejected(remaining) => Err(BudgetError::BudgetExceeded { remaining, cost }),
        }
    }

    async fn apply(&self, user: &str, cost: i64, floor: Option<i64>) -> Result<Applied, BudgetError> {
        let adjustment = Adjustment {
            now: now_millis(),
            payout: self.config.payout,
            max: self.config.max,
            cost,
            floor,
        };
        let applied = self.store.apply(user, &adjustment).await?;
        debug!(user, cost, ?applied, "budget adjusted");
        Ok(applied)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const CONFIG: BudgetConfig = BudgetConfig {
        max: 10_000,
        payout: Factor { num: 1, den: 1 },
    };

    fn budgeter() -> (Budgeter, Arc<MemoryBudgetStore>) {
        let store = Arc::new(MemoryBudgetStore::new());
        (Budgeter::new(Box::new(SharedStore(store.clone())), CONFIG), store)
    }

    struct SharedStore(Arc<MemoryBudgetStore>);

    #[async_trait]
    impl BudgetStore for SharedStore {
        async fn apply(&self, user: &str, adjustment: &Adjustment) -> Result<Applied, BudgetError> {
            self.0.apply(user, adjustment).await
        }
    }

    #[tokio::test]
    async fn new_user_starts_full() {
        let (budgeter, _) = budgeter();
        assert_eq!(budgeter.remaining("alice").await.unwrap(), CONFIG.max);
    }

    #[tokio::test]
    async fn charge_then_remaining_reflects_cost() {
        let (budgeter, _) = budgeter();
        budgeter.charge("alice", 2_500).await.unwrap();
        let remaining = budgeter.remaining("alice").await.unwrap();
        // At most a few units of top-up between the two calls.
        assert!(remaining <= CONFIG.max - 2_500 + 5, "got {remaining}");
        assert!(remaining >= CONFIG.max - 2_500);
    }

    #[tokio::test]
    async fn charge_can_go_into_debt() {
        let (budgeter, _) = budgeter();
        let remaining = budgeter.charge("bob", 25_000).await.unwrap();
        assert!(remaining < 0);
    }

    #[tokio::test]
    async fn checked_charge_leaves_row_untouched_on_rejection() {
        let (budgeter, store) = budgeter();
        let now = now_millis();
        store
            .insert("carol", BudgetRow { remaining: 100, last_update: now })
            .await;
        let err = budgeter.checked_charge("carol", 5_000).await.unwrap_err();
        assert!(matches!(err, BudgetError::BudgetExceeded { cost: 5_000, .. }));
        let row = store.get("carol").await.unwrap();
        assert_eq!(row.last_update, now);
        assert_eq!(row.remaining, 100);
    }

    #[test]
    fn top_up_is_capped() {
        let adjustment = Adjustment {
            now: 60_000,
            payout: Factor::new(10, 1),
            max: 500,
            cost: 0,
            floor: None,
        };
        let row = BudgetRow { remaining: -100, last_update: 0 };
        let (applied, next) = adjustment.evaluate(Some(row));
        assert_eq!(applied, Applied::Updated(500));
        assert_eq!(next.unwrap().last_update, 60_000);
    }

    #[test]
    fn debt_is_repaid_by_elapsed_time() {
        let adjustment = Adjustment {
            now: 3_000,
            payout: Factor::new(100, 1),
            max: 1_000,
            cost: 0,
            floor: None,
        };
        let row = BudgetRow { remaining: -200, last_update: 0 };
        let (applied, _) = adjustment.evaluate(Some(row));
        assert_eq!(applied, Applied::Updated(100));
    }

    #[tokio::test]
    async fn concurrent_charges_do_not_lose_updates() {
        let store = Arc::new(MemoryBudgetStore::new());
        let budgeter = Arc::new(Budgeter::new(
            Box::new(SharedStore(store.clone())),
            BudgetConfig {
                max: 1_000_000,
                payout: Factor::new(1, 1_000_000),
            },
        ));
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let budgeter = budgeter.clone();
            tasks.push(tokio::spawn(async move { budgeter.charge("dave", 10).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let row = store.get("dave").await.unwrap();
        assert_eq!(row.remaining, 1_000_000 - 500);
    }
}
