//! Per-plan credit allowances.
//!
//! Pure data: what each tier grants per billing period. `-1` means the pool
//! is unlimited and is never decremented anywhere in the ledger.

use reelkit_shared::PlanTier;

/// Stored value meaning "unlimited" for a credit pool.
pub const UNLIMITED: i32 = -1;

/// What a plan grants per billing period, one field per credit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanAllowance {
    pub credits: i32,
    pub ai_credits: i32,
}

impl PlanAllowance {
    pub const fn new(credits: i32, ai_credits: i32) -> Self {
        Self {
            credits,
            ai_credits,
        }
    }
}

/// Quota granted to users with no subscription at all.
pub const FREE_ALLOWANCE: PlanAllowance = PlanAllowance::new(3, 3);

const STARTER_ALLOWANCE: PlanAllowance = PlanAllowance::new(25, 10);
const PRO_ALLOWANCE: PlanAllowance = PlanAllowance::new(100, 50);
const UNLIMITED_ALLOWANCE: PlanAllowance = PlanAllowance::new(UNLIMITED, UNLIMITED);

/// Allowance for a user's current plan (`None` = free tier).
pub fn allowance_for(plan: Option<PlanTier>) -> PlanAllowance {
    match plan {
        None => FREE_ALLOWANCE,
        Some(PlanTier::Starter) => STARTER_ALLOWANCE,
        Some(PlanTier::Pro) => PRO_ALLOWANCE,
        Some(PlanTier::Unlimited) => UNLIMITED_ALLOWANCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tier_gets_trial_quota() {
        let a = allowance_for(None);
        assert_eq!(a.credits, 3);
        assert_eq!(a.ai_credits, 3);
    }

    #[test]
    fn test_paid_tiers_increase_monotonically() {
        let starter = allowance_for(Some(PlanTier::Starter));
        let pro = allowance_for(Some(PlanTier::Pro));
        assert!(starter.credits < pro.credits);
        assert!(starter.ai_credits < pro.ai_credits);
        assert_eq!(starter.credits, 25);
        assert_eq!(pro.credits, 100);
    }

    #[test]
    fn test_unlimited_tier_uses_sentinel() {
        let a = allowance_for(Some(PlanTier::Unlimited));
        assert_eq!(a.credits, UNLIMITED);
        assert_eq!(a.ai_credits, UNLIMITED);
    }
}
