//! Application state.

use std::sync::Arc;

use sqlx::PgPool;

use reelkit_ledger::{
    ConsumptionCoordinator, CoordinationLock, InMemoryCoordinationLock, RedisCoordinationLock,
    StripeClient, UsageNotifier, WebhookHandler,
};

use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub consumption: ConsumptionCoordinator,
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub async fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let stripe = StripeClient::from_env()
            .map_err(|e| anyhow::anyhow!("Stripe configuration error: {}", e))?;
        tracing::info!("Stripe client initialized");

        // Redis is optional: without it consumption falls back to the row
        // lock alone and dashboards poll instead of subscribing.
        let (lock, notifier): (Arc<dyn CoordinationLock>, UsageNotifier) = match &config.redis_url {
            Some(url) => match RedisCoordinationLock::connect(url).await {
                Ok(redis_lock) => {
                    tracing::info!("Redis coordination lock enabled");
                    (Arc::new(redis_lock), UsageNotifier::connect(url).await)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unreachable; using in-process lock");
                    (
                        Arc::new(InMemoryCoordinationLock::new()),
                        UsageNotifier::disabled(),
                    )
                }
            },
            None => {
                tracing::info!("REDIS_URL not set; using in-process lock");
                (
                    Arc::new(InMemoryCoordinationLock::new()),
                    UsageNotifier::disabled(),
                )
            }
        };

        let consumption = ConsumptionCoordinator::new(pool.clone(), lock, notifier.clone());
        let webhooks = Arc::new(WebhookHandler::new(stripe, pool.clone(), notifier));

        Ok(Self {
            pool,
            config,
            consumption,
            webhooks,
        })
    }
}
