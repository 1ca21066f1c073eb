//! Stripe client wrapper and price-to-plan mapping.

use reelkit_shared::PlanTier;

use crate::error::{LedgerError, LedgerResult};

/// Stripe price ids for each paid tier, as configured in the Stripe
/// dashboard for this deployment.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub starter_monthly: String,
    pub pro_monthly: String,
    pub unlimited_monthly: String,
}

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> LedgerResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;
        let price_ids = PriceIds {
            starter_monthly: require_env("STRIPE_PRICE_STARTER_MONTHLY")?,
            pro_monthly: require_env("STRIPE_PRICE_PRO_MONTHLY")?,
            unlimited_monthly: require_env("STRIPE_PRICE_UNLIMITED_MONTHLY")?,
        };
        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
        })
    }

    /// Map a Stripe price id to an internal plan tier.
    ///
    /// Returns `None` for prices this deployment doesn't know about, e.g. a
    /// price created in the dashboard but not yet wired into config. Callers
    /// must treat that as "skip", never as a guess.
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<PlanTier> {
        if price_id == self.price_ids.starter_monthly {
            Some(PlanTier::Starter)
        } else if price_id == self.price_ids.pro_monthly {
            Some(PlanTier::Pro)
        } else if price_id == self.price_ids.unlimited_monthly {
            Some(PlanTier::Unlimited)
        } else {
            None
        }
    }
}

fn require_env(name: &str) -> LedgerResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LedgerError::Internal(format!("{} not set", name)))
}

/// Thin wrapper owning the Stripe API client plus deployment config.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> LedgerResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    /// Fetch a subscription's current state from Stripe.
    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> LedgerResult<stripe::Subscription> {
        let id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| {
                LedgerError::Internal(format!(
                    "invalid subscription id {}: {}",
                    subscription_id, e
                ))
            })?;
        Ok(stripe::Subscription::retrieve(&self.client, &id, &[]).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                starter_monthly: "price_starter_m".to_string(),
                pro_monthly: "price_pro_m".to_string(),
                unlimited_monthly: "price_unlimited_m".to_string(),
            },
        }
    }

    #[test]
    fn test_known_prices_map_to_tiers() {
        let config = test_config();
        assert_eq!(
            config.tier_for_price_id("price_starter_m"),
            Some(PlanTier::Starter)
        );
        assert_eq!(config.tier_for_price_id("price_pro_m"), Some(PlanTier::Pro));
        assert_eq!(
            config.tier_for_price_id("price_unlimited_m"),
            Some(PlanTier::Unlimited)
        );
    }

    #[test]
    fn test_unknown_price_is_unmappable() {
        let config = test_config();
        assert_eq!(config.tier_for_price_id("price_legacy_2019"), None);
        assert_eq!(config.tier_for_price_id(""), None);
    }
}
