//! Credit consumption.
//!
//! The single entry point every credit-consuming feature goes through. Two
//! independent layers serialize concurrent spends for the same user: an
//! advisory Redis lock (skippable) and the transactional row lock plus
//! conditional decrement (never skippable).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use reelkit_shared::PlanTier;

use crate::allowance::{allowance_for, PlanAllowance, UNLIMITED};
use crate::error::{LedgerError, LedgerResult};
use crate::lock::CoordinationLock;
use crate::notify::UsageNotifier;
use crate::store::{self, CreditBalance};

/// The two independent credit pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditKind {
    /// Ordinary credits: slideshow posts, avatar generations.
    Slide,
    /// AI credits: outline and caption generation.
    Ai,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Slide => "slide",
            CreditKind::Ai => "ai",
        }
    }
}

impl std::fmt::Display for CreditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-only view of a user's remaining allowance. `None` = unlimited.
#[derive(Debug, Clone, Serialize)]
pub struct UsageLimits {
    pub plan: Option<PlanTier>,
    pub unlimited: bool,
    pub slides_left: Option<i32>,
    pub ai_left: Option<i32>,
}

/// Corrected remaining value for one pool given the plan's current quota.
///
/// Reconciles allowance changes made out of band (admin override, config
/// edit) without a full reset: a pool that should be unlimited snaps to the
/// sentinel, a pool that should be finite but still stores the sentinel
/// becomes `quota - used`, floored at zero. A pool already in the right
/// shape is returned untouched, so the sentinel is never drifted away from
/// while the plan stays unlimited.
fn corrected_remaining(quota: i32, stored_remaining: i32, stored_used: i32) -> i32 {
    if quota == UNLIMITED {
        return UNLIMITED;
    }
    if stored_remaining == UNLIMITED {
        return (quota - stored_used).max(0);
    }
    stored_remaining
}

struct UserPlanRow {
    plan: Option<PlanTier>,
    plan_renews_at: Option<OffsetDateTime>,
}

/// Atomic "try to spend N credits of kind K" coordinator.
///
/// Mutates `credit_balances` only; never touches `users` or `subscriptions`.
#[derive(Clone)]
pub struct ConsumptionCoordinator {
    pool: PgPool,
    lock: Arc<dyn CoordinationLock>,
    notifier: UsageNotifier,
}

impl ConsumptionCoordinator {
    pub fn new(pool: PgPool, lock: Arc<dyn CoordinationLock>, notifier: UsageNotifier) -> Self {
        Self {
            pool,
            lock,
            notifier,
        }
    }

    /// Spend `cost` credits of `kind`, atomically.
    ///
    /// Either the balance is decremented by exactly `cost` and the used
    /// counter incremented by exactly `cost`, or nothing changes and
    /// `InsufficientCredits` is returned. The caller must treat that error
    /// as terminal (prompt to upgrade), not retry it.
    pub async fn consume(&self, user_id: Uuid, kind: CreditKind, cost: i32) -> LedgerResult<()> {
        if cost < 1 {
            return Err(LedgerError::Internal(format!(
                "consume cost must be >= 1, got {}",
                cost
            )));
        }

        // Advisory lock first. Failure to get it degrades latency under
        // contention, not correctness, so proceed either way.
        let lock_key = format!("credits:lock:{}", user_id);
        let guard = self.lock.acquire(&lock_key).await;
        if guard.is_none() {
            tracing::warn!(
                user_id = %user_id,
                "Coordination lock unavailable; relying on row lock alone"
            );
        }

        let result = self.consume_locked(user_id, kind, cost).await;

        if let Some(token) = guard {
            self.lock.release(token).await;
        }

        if result.is_ok() {
            // Outside the transaction: a failed notification must not roll
            // back a spend that already committed.
            self.notifier.usage_changed(user_id).await;
        }

        result
    }

    async fn consume_locked(&self, user_id: Uuid, kind: CreditKind, cost: i32) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let user = self.load_user(&mut tx, user_id).await?;
        let allowance = allowance_for(user.plan);
        let row = self.normalized_row(&mut tx, user_id, &user, allowance).await?;

        let pool_quota = match kind {
            CreditKind::Slide => allowance.credits,
            CreditKind::Ai => allowance.ai_credits,
        };

        if pool_quota == UNLIMITED {
            // Nothing to decrement; the used counter still tracks volume.
            store::increment_used(&mut tx, row.id, kind, cost).await?;
            tx.commit().await?;

            tracing::info!(
                user_id = %user_id,
                kind = %kind,
                cost = cost,
                "Consumed credits (unlimited pool)"
            );
            return Ok(());
        }

        if store::try_decrement(&mut tx, row.id, kind, cost).await? {
            tx.commit().await?;

            tracing::info!(
                user_id = %user_id,
                kind = %kind,
                cost = cost,
                remaining = row.remaining(kind) - cost,
                "Consumed credits"
            );
            Ok(())
        } else {
            tx.rollback().await?;

            tracing::info!(
                user_id = %user_id,
                kind = %kind,
                cost = cost,
                remaining = row.remaining(kind),
                "Consumption rejected: insufficient credits"
            );
            Err(LedgerError::InsufficientCredits(kind))
        }
    }

    /// Read-only usage snapshot for dashboards.
    ///
    /// Runs the same duplicate collapse and sentinel correction as
    /// consumption but writes nothing else; safe to call frequently.
    pub async fn get_usage_limits(&self, user_id: Uuid) -> LedgerResult<UsageLimits> {
        let mut tx = self.pool.begin().await?;

        let user = self.load_user(&mut tx, user_id).await?;
        let allowance = allowance_for(user.plan);

        let (slides, ai) = match store::load_locked(&mut tx, user_id).await? {
            Some(row) => {
                let slides = corrected_remaining(allowance.credits, row.credits, row.used_credits);
                let ai = corrected_remaining(allowance.ai_credits, row.ai_credits, row.used_ai_credits);
                if slides != row.credits || ai != row.ai_credits {
                    store::set_pools(&mut tx, row.id, slides, ai).await?;
                }
                (slides, ai)
            }
            // No row yet: report the untouched allowance without creating
            // one; first consumption will.
            None => (allowance.credits, allowance.ai_credits),
        };

        tx.commit().await?;

        Ok(UsageLimits {
            plan: user.plan,
            unlimited: allowance.credits == UNLIMITED && allowance.ai_credits == UNLIMITED,
            slides_left: (slides != UNLIMITED).then_some(slides),
            ai_left: (ai != UNLIMITED).then_some(ai),
        })
    }

    async fn load_user(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> LedgerResult<UserPlanRow> {
        let row: Option<(Option<String>, Option<OffsetDateTime>)> =
            sqlx::query_as("SELECT plan, plan_renews_at FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;

        let (plan_slug, plan_renews_at) = row.ok_or(LedgerError::UserNotFound)?;

        let plan = match plan_slug.as_deref() {
            None => None,
            Some(slug) => match PlanTier::parse(slug) {
                Some(tier) => Some(tier),
                None => {
                    // Unknown slug from a historical migration: fall back to
                    // free-tier quota rather than failing every consumption.
                    tracing::warn!(user_id = %user_id, plan = slug, "Unknown plan slug on user");
                    None
                }
            },
        };

        Ok(UserPlanRow {
            plan,
            plan_renews_at,
        })
    }

    /// Load the balance row, lazily creating it from the allowance table and
    /// correcting sentinel drift in place.
    async fn normalized_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        user: &UserPlanRow,
        allowance: PlanAllowance,
    ) -> LedgerResult<CreditBalance> {
        let row = match store::load_locked(tx, user_id).await? {
            Some(row) => row,
            None => {
                tracing::info!(
                    user_id = %user_id,
                    plan = ?user.plan.map(|p| p.as_str()),
                    "Creating ledger row on first consumption"
                );
                return store::insert_fresh(
                    tx,
                    user_id,
                    allowance.credits,
                    allowance.ai_credits,
                    0,
                    0,
                    user.plan_renews_at,
                )
                .await;
            }
        };

        let slides = corrected_remaining(allowance.credits, row.credits, row.used_credits);
        let ai = corrected_remaining(allowance.ai_credits, row.ai_credits, row.used_ai_credits);

        if slides == row.credits && ai == row.ai_credits {
            return Ok(row);
        }

        tracing::warn!(
            user_id = %user_id,
            stored_credits = row.credits,
            stored_ai = row.ai_credits,
            corrected_credits = slides,
            corrected_ai = ai,
            "Correcting drifted credit sentinels in place"
        );
        store::set_pools(tx, row.id, slides, ai).await?;

        Ok(CreditBalance {
            credits: slides,
            ai_credits: ai,
            ..row
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_never_drifts_while_unlimited() {
        // However the stored value got mangled, an unlimited quota pins it
        // back to the sentinel.
        assert_eq!(corrected_remaining(UNLIMITED, UNLIMITED, 0), UNLIMITED);
        assert_eq!(corrected_remaining(UNLIMITED, 42, 7), UNLIMITED);
        assert_eq!(corrected_remaining(UNLIMITED, 0, 100), UNLIMITED);
    }

    #[test]
    fn test_stale_sentinel_becomes_quota_minus_used() {
        // Plan moved from unlimited to pro out of band.
        assert_eq!(corrected_remaining(100, UNLIMITED, 30), 70);
        assert_eq!(corrected_remaining(100, UNLIMITED, 0), 100);
    }

    #[test]
    fn test_stale_sentinel_floors_at_zero() {
        // Used more under unlimited than the finite quota holds.
        assert_eq!(corrected_remaining(25, UNLIMITED, 90), 0);
    }

    #[test]
    fn test_well_formed_pool_untouched() {
        assert_eq!(corrected_remaining(25, 17, 8), 17);
        assert_eq!(corrected_remaining(25, 0, 25), 0);
    }

    #[test]
    fn test_kind_slugs() {
        assert_eq!(CreditKind::Slide.as_str(), "slide");
        assert_eq!(CreditKind::Ai.as_str(), "ai");
    }

    #[test]
    fn test_kind_deserializes_from_api_payloads() {
        let slide: CreditKind = serde_json::from_str("\"slide\"").unwrap();
        let ai: CreditKind = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(slide, CreditKind::Slide);
        assert_eq!(ai, CreditKind::Ai);
        assert!(serde_json::from_str::<CreditKind>("\"video\"").is_err());
    }
}
