//! Billing event audit log.
//!
//! Append-only record of every ledger-affecting event, written best-effort:
//! a failed audit insert is logged and swallowed so it never rolls back the
//! state change it describes.

use sqlx::PgPool;
use uuid::Uuid;

/// Kinds of events recorded in `billing_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    PlanGranted,
    PlanChanged,
    PlanCanceled,
    PlanRenewed,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::PlanGranted => "plan_granted",
            BillingEventType::PlanChanged => "plan_changed",
            BillingEventType::PlanCanceled => "plan_canceled",
            BillingEventType::PlanRenewed => "plan_renewed",
        }
    }
}

/// Builder for one audit entry.
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: &str) -> Self {
        self.stripe_event_id = Some(event_id.to_string());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }
}

/// Writes audit entries to `billing_events`.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one entry. Failures are logged at warn and dropped.
    pub async fn log_event(&self, event: BillingEventBuilder) {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, event_type, data, stripe_event_id, stripe_subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(&event.stripe_event_id)
        .bind(&event.stripe_subscription_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                user_id = %event.user_id,
                event_type = event.event_type.as_str(),
                error = %e,
                "Failed to write billing audit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_slugs() {
        assert_eq!(BillingEventType::PlanGranted.as_str(), "plan_granted");
        assert_eq!(BillingEventType::PlanChanged.as_str(), "plan_changed");
        assert_eq!(BillingEventType::PlanCanceled.as_str(), "plan_canceled");
        assert_eq!(BillingEventType::PlanRenewed.as_str(), "plan_renewed");
    }

    #[test]
    fn test_builder_accumulates_fields() {
        let user_id = Uuid::new_v4();
        let event = BillingEventBuilder::new(user_id, BillingEventType::PlanChanged)
            .data(serde_json::json!({"old": "starter", "new": "pro"}))
            .stripe_event("evt_123")
            .stripe_subscription("sub_456");

        assert_eq!(event.user_id, user_id);
        assert_eq!(event.stripe_event_id.as_deref(), Some("evt_123"));
        assert_eq!(event.stripe_subscription_id.as_deref(), Some("sub_456"));
        assert_eq!(event.data["new"], "pro");
    }
}
