//! Plan transition reconciliation.
//!
//! Rewrites a user's ledger row when their subscription tier changes. Usage
//! already incurred this period is preserved on upgrade and discarded on
//! downgrade, per credit pool independently. The row is always replaced
//! wholesale (delete then insert) inside the caller's transaction so no
//! stale field survives a transition.

use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use reelkit_shared::PlanTier;

use crate::allowance::{allowance_for, UNLIMITED};
use crate::error::LedgerResult;
use crate::store::{self, CreditBalance};

/// Outcome of reconciling a single credit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOutcome {
    pub remaining: i32,
    pub used: i32,
}

/// Usage incurred this period for one pool.
///
/// The explicit used counter is authoritative when non-zero. When it is zero
/// the old `quota - remaining` arithmetic is kept as a legacy fallback for
/// rows written before counters existed; it can miscount if a balance was
/// ever hand-edited, so it is best-effort only.
fn inferred_used(old_quota: i32, old_remaining: i32, old_used: i32) -> i32 {
    if old_used > 0 {
        return old_used;
    }
    if old_quota == UNLIMITED {
        // No finite quota to subtract from.
        return 0;
    }
    (old_quota - old_remaining).max(0)
}

/// A transition is a downgrade when the new pool quota is finite and
/// strictly below the old one. Unlimited to finite counts; anything landing
/// on unlimited never does.
fn is_downgrade(old_quota: i32, new_quota: i32) -> bool {
    if new_quota == UNLIMITED {
        return false;
    }
    if old_quota == UNLIMITED {
        return true;
    }
    new_quota < old_quota
}

/// Reconcile one credit pool across a plan change.
///
/// Downgrade: usage resets, full new quota. Upgrade or lateral move: usage
/// carries over, clamped so the user can never have "used" more than the new
/// quota allows.
pub fn carry_pool(old_quota: i32, old_remaining: i32, old_used: i32, new_quota: i32) -> PoolOutcome {
    if is_downgrade(old_quota, new_quota) {
        return PoolOutcome {
            remaining: new_quota,
            used: 0,
        };
    }

    let carried = inferred_used(old_quota, old_remaining, old_used);

    if new_quota == UNLIMITED {
        return PoolOutcome {
            remaining: UNLIMITED,
            used: carried,
        };
    }

    let used = carried.min(new_quota);
    PoolOutcome {
        remaining: new_quota - used,
        used,
    }
}

/// Rewrites ledger rows across plan transitions and renewals.
///
/// Invoked inside an already-open transaction by the webhook synchronizer;
/// never called directly by user-facing code.
pub struct PlanTransitionReconciler;

impl PlanTransitionReconciler {
    /// Recompute the ledger for a move from `old_plan` to `new_plan`.
    ///
    /// Reads the most recent existing row (discarding any duplicates),
    /// carries or resets each pool independently, then replaces the row with
    /// `resets_at` set to the new period boundary.
    pub async fn reconcile(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        old_plan: Option<PlanTier>,
        new_plan: Option<PlanTier>,
        new_period_end: Option<OffsetDateTime>,
    ) -> LedgerResult<CreditBalance> {
        let old_allowance = allowance_for(old_plan);
        let new_allowance = allowance_for(new_plan);

        // Absent row = untouched period: full old quota, nothing used.
        let (old_credits, old_ai, old_used, old_used_ai) = match store::load_locked(tx, user_id)
            .await?
        {
            Some(row) => (
                row.credits,
                row.ai_credits,
                row.used_credits,
                row.used_ai_credits,
            ),
            None => (old_allowance.credits, old_allowance.ai_credits, 0, 0),
        };

        let slides = carry_pool(
            old_allowance.credits,
            old_credits,
            old_used,
            new_allowance.credits,
        );
        let ai = carry_pool(
            old_allowance.ai_credits,
            old_ai,
            old_used_ai,
            new_allowance.ai_credits,
        );

        tracing::info!(
            user_id = %user_id,
            old_plan = ?old_plan.map(|p| p.as_str()),
            new_plan = ?new_plan.map(|p| p.as_str()),
            credits = slides.remaining,
            used_credits = slides.used,
            ai_credits = ai.remaining,
            used_ai_credits = ai.used,
            "Reconciled ledger across plan transition"
        );

        store::replace(
            tx,
            user_id,
            slides.remaining,
            ai.remaining,
            slides.used,
            ai.used,
            new_period_end,
        )
        .await
    }

    /// Full reset to a plan's allowance, discarding all usage.
    ///
    /// Used for first grants after checkout and for paid renewals, which
    /// always produce a clean full quota regardless of leftover balance.
    pub async fn reset_to_plan(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        plan: Option<PlanTier>,
        period_end: Option<OffsetDateTime>,
    ) -> LedgerResult<CreditBalance> {
        let allowance = allowance_for(plan);

        tracing::info!(
            user_id = %user_id,
            plan = ?plan.map(|p| p.as_str()),
            credits = allowance.credits,
            ai_credits = allowance.ai_credits,
            "Resetting ledger to full plan allowance"
        );

        store::replace(
            tx,
            user_id,
            allowance.credits,
            allowance.ai_credits,
            0,
            0,
            period_end,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_carries_usage() {
        // Plan A (quota 25, used 10) -> plan B (quota 100).
        let outcome = carry_pool(25, 15, 10, 100);
        assert_eq!(outcome.used, 10);
        assert_eq!(outcome.remaining, 90);
    }

    #[test]
    fn test_downgrade_resets_usage() {
        // Plan B (quota 100, used 40) -> plan A (quota 25).
        let outcome = carry_pool(100, 60, 40, 25);
        assert_eq!(outcome.used, 0);
        assert_eq!(outcome.remaining, 25);
    }

    #[test]
    fn test_lateral_move_carries_usage() {
        let outcome = carry_pool(25, 20, 5, 25);
        assert_eq!(outcome.used, 5);
        assert_eq!(outcome.remaining, 20);
    }

    #[test]
    fn test_upgrade_to_unlimited_keeps_sentinel_and_usage() {
        let outcome = carry_pool(100, 60, 40, UNLIMITED);
        assert_eq!(outcome.remaining, UNLIMITED);
        assert_eq!(outcome.used, 40);
    }

    #[test]
    fn test_unlimited_to_finite_is_a_downgrade() {
        let outcome = carry_pool(UNLIMITED, UNLIMITED, 500, 25);
        assert_eq!(outcome.used, 0);
        assert_eq!(outcome.remaining, 25);
    }

    #[test]
    fn test_unlimited_to_unlimited_is_untouched() {
        let outcome = carry_pool(UNLIMITED, UNLIMITED, 12, UNLIMITED);
        assert_eq!(outcome.remaining, UNLIMITED);
        assert_eq!(outcome.used, 12);
    }

    #[test]
    fn test_carried_usage_clamps_to_new_quota() {
        // Used 90 on the old plan, new quota only holds 50.
        let outcome = carry_pool(100, 10, 90, 50);
        assert_eq!(outcome.used, 50);
        assert_eq!(outcome.remaining, 0);
    }

    #[test]
    fn test_explicit_counter_preferred_over_inference() {
        // remaining says 5 used, counter says 8: counter wins.
        let outcome = carry_pool(25, 20, 8, 100);
        assert_eq!(outcome.used, 8);
        assert_eq!(outcome.remaining, 92);
    }

    #[test]
    fn test_zero_counter_falls_back_to_arithmetic() {
        // Legacy row with no counter: infer 25 - 15 = 10 used.
        let outcome = carry_pool(25, 15, 0, 100);
        assert_eq!(outcome.used, 10);
        assert_eq!(outcome.remaining, 90);
    }

    #[test]
    fn test_inference_never_goes_negative() {
        // Hand-edited balance above quota must not produce negative usage.
        let outcome = carry_pool(25, 40, 0, 100);
        assert_eq!(outcome.used, 0);
        assert_eq!(outcome.remaining, 100);
    }
}
