//! Usage-changed notifications.
//!
//! Fire-and-forget pub/sub so dashboards can refresh a user's remaining
//! credits without polling. Delivery failure is logged and otherwise ignored;
//! it must never affect the consumption that triggered it.

use uuid::Uuid;

const USAGE_CHANGED_CHANNEL: &str = "usage:changed";

/// Best-effort publisher for usage-changed events.
#[derive(Clone)]
pub struct UsageNotifier {
    conn: Option<redis::aio::ConnectionManager>,
}

impl UsageNotifier {
    /// Notifier that drops every event. Used when Redis is not configured.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// Connect to Redis, falling back to a disabled notifier on failure.
    pub async fn connect(redis_url: &str) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid Redis URL; usage notifications disabled");
                return Self::disabled();
            }
        };

        match client.get_connection_manager().await {
            Ok(conn) => Self { conn: Some(conn) },
            Err(e) => {
                tracing::warn!(error = %e, "Redis unreachable; usage notifications disabled");
                Self::disabled()
            }
        }
    }

    /// Announce that a user's usage changed.
    pub async fn usage_changed(&self, user_id: Uuid) {
        let Some(conn) = &self.conn else {
            return;
        };

        let mut conn = conn.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(USAGE_CHANGED_CHANNEL)
            .arg(user_id.to_string())
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            tracing::warn!(
                user_id = %user_id,
                error = %e,
                "Failed to publish usage-changed notification"
            );
        }
    }
}
