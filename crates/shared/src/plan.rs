//! Subscription plan tiers.
//!
//! The closed set of paid tiers a user can be on. A user with no tier at all
//! (`users.plan IS NULL`) is on the free tier, which is deliberately not a
//! variant here: "no plan" and "a plan" flow through the code as
//! `Option<PlanTier>`.

use serde::{Deserialize, Serialize};

/// Paid subscription tiers, ordered from smallest to largest allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Pro,
    Unlimited,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Unlimited => "unlimited",
        }
    }

    /// Parse a tier slug as stored in `users.plan`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starter" => Some(PlanTier::Starter),
            "pro" => Some(PlanTier::Pro),
            "unlimited" => Some(PlanTier::Unlimited),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_round_trip() {
        for tier in [PlanTier::Starter, PlanTier::Pro, PlanTier::Unlimited] {
            assert_eq!(PlanTier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn test_unknown_slug_rejected() {
        assert_eq!(PlanTier::parse("enterprise"), None);
        assert_eq!(PlanTier::parse(""), None);
        assert_eq!(PlanTier::parse("PRO"), None);
    }
}
