//! Stripe webhook handling.
//!
//! Drives User, Subscription, and CreditBalance records from Stripe events.
//! Delivery order is not trusted: every handler is idempotent, keyed by the
//! external subscription id, and reads period/status from the payload itself
//! rather than assuming monotonicity. Replays are additionally deduplicated
//! by an atomic claim on the event id.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{PgPool, Postgres, Transaction};
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use reelkit_shared::PlanTier;

use crate::client::StripeClient;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::notify::UsageNotifier;
use crate::reconcile::PlanTransitionReconciler;

type HmacSha256 = Hmac<Sha256>;

/// Signed payloads older than this are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this can be reclaimed.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Webhook handler for Stripe events.
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    notifier: UsageNotifier,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, notifier: UsageNotifier) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            notifier,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verification first, then falls back to manual
    /// signature verification, which keeps working when Stripe ships an API
    /// version newer than the library's parser expects.
    pub fn verify_event(&self, payload: &str, signature: &str) -> LedgerResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Library webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            LedgerError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// An INSERT...ON CONFLICT...RETURNING claim on the event id gives
    /// exactly one concurrent delivery processing rights; duplicates are
    /// acknowledged without running handlers. Events stuck in `processing`
    /// past a timeout, or previously failed, can be reclaimed so a retry
    /// delivery gets another chance against the idempotent handlers.
    pub async fn handle_event(&self, event: Event) -> LedgerResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook delivery; already processed or in flight"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = processing_result,
                error = %e,
                "Failed to record webhook processing result; event may appear stuck"
            );
        }

        result
    }

    async fn process_event_internal(&self, event: &Event) -> LedgerResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_upserted(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::InvoicePaymentSucceeded => {
                self.handle_invoice_payment_succeeded(event_owned).await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring Stripe event type with no handler"
                );
            }
        }

        Ok(())
    }

    /// Checkout completed: link the user to their Stripe customer and grant
    /// the purchased plan's full allowance as a first grant.
    async fn handle_checkout_completed(&self, event: Event) -> LedgerResult<()> {
        let event_id = event.id.to_string();
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(LedgerError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let Some(customer_id) = session.customer.as_ref().map(expandable_customer_id) else {
            tracing::warn!(event_id = %event_id, "Checkout session has no customer; skipping");
            return Ok(());
        };

        let Some(user_id) = self.resolve_checkout_user(&session, &customer_id).await? else {
            tracing::warn!(
                event_id = %event_id,
                customer_id = %customer_id,
                "Cannot resolve user for completed checkout; skipping"
            );
            return Ok(());
        };

        sqlx::query("UPDATE users SET stripe_customer_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(&customer_id)
            .execute(&self.pool)
            .await?;

        let Some(subscription_ref) = session.subscription.as_ref() else {
            // One-time payment checkout: nothing for the ledger to grant.
            tracing::info!(
                event_id = %event_id,
                user_id = %user_id,
                "Checkout completed without a subscription"
            );
            return Ok(());
        };

        // Fetch the subscription's current tier and period from Stripe; the
        // session payload does not embed them.
        let subscription_id = expandable_subscription_id(subscription_ref);
        let subscription = self.stripe.retrieve_subscription(&subscription_id).await?;

        let Some(price_id) = subscription_price_id(&subscription) else {
            tracing::warn!(
                event_id = %event_id,
                subscription_id = %subscription_id,
                "Subscription from checkout has no price; skipping grant"
            );
            return Ok(());
        };

        let Some(tier) = self.stripe.config().tier_for_price_id(&price_id) else {
            tracing::warn!(
                event_id = %event_id,
                price_id = %price_id,
                error = %LedgerError::UnmappablePlan(price_id.clone()),
                "Skipping checkout event"
            );
            return Ok(());
        };

        let period_end = unix_to_datetime(subscription.current_period_end);
        let status = map_subscription_status(subscription.status);

        let mut tx = self.pool.begin().await?;

        upsert_subscription(
            &mut tx,
            user_id,
            &subscription_id,
            Some(price_id.as_str()),
            status,
            Some(period_end),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE users
            SET plan = $2, plan_renews_at = $3, plan_since = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        PlanTransitionReconciler::reset_to_plan(&mut tx, user_id, Some(tier), Some(period_end))
            .await?;

        tx.commit().await?;

        self.event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PlanGranted)
                    .data(serde_json::json!({ "plan": tier.as_str() }))
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription_id.clone()),
            )
            .await;
        self.notifier.usage_changed(user_id).await;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            plan = tier.as_str(),
            "Checkout completed; plan granted"
        );

        Ok(())
    }

    /// Subscription created or updated: sync the row and, when the tier
    /// actually changed, reconcile the ledger before overwriting the plan.
    async fn handle_subscription_upserted(&self, event: Event) -> LedgerResult<()> {
        let event_id = event.id.to_string();
        let subscription = extract_subscription(event)?;
        let subscription_id = subscription.id.to_string();
        let customer_id = expandable_customer_id(&subscription.customer);

        let Some(user_id) = self.user_by_customer(&customer_id).await? else {
            // Subscription webhooks can race the checkout handler that
            // creates the customer link; the retry or a later event settles.
            tracing::warn!(
                event_id = %event_id,
                customer_id = %customer_id,
                "No user for Stripe customer yet; skipping subscription event"
            );
            return Ok(());
        };

        let Some(price_id) = subscription_price_id(&subscription) else {
            tracing::warn!(
                event_id = %event_id,
                subscription_id = %subscription_id,
                "Subscription has no price; skipping"
            );
            return Ok(());
        };

        let Some(new_tier) = self.stripe.config().tier_for_price_id(&price_id) else {
            tracing::warn!(
                event_id = %event_id,
                price_id = %price_id,
                error = %LedgerError::UnmappablePlan(price_id.clone()),
                "Skipping subscription event"
            );
            return Ok(());
        };

        // Trust the payload's own period and status; events arrive out of
        // order and a retransmit may be older than what we already stored.
        let period_end = unix_to_datetime(subscription.current_period_end);
        let status = map_subscription_status(subscription.status);

        let mut tx = self.pool.begin().await?;

        let old_plan = load_user_plan(&mut tx, user_id).await?;
        let plan_changed = old_plan != Some(new_tier);

        if plan_changed {
            PlanTransitionReconciler::reconcile(
                &mut tx,
                user_id,
                old_plan,
                Some(new_tier),
                Some(period_end),
            )
            .await?;

            sqlx::query(
                r#"
                UPDATE users
                SET plan = $2,
                    plan_renews_at = $3,
                    plan_since = CASE WHEN plan IS NULL THEN NOW() ELSE plan_since END,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(new_tier.as_str())
            .bind(period_end)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE users SET plan_renews_at = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(user_id)
            .bind(period_end)
            .execute(&mut *tx)
            .await?;
        }

        upsert_subscription(
            &mut tx,
            user_id,
            &subscription_id,
            Some(price_id.as_str()),
            status,
            Some(period_end),
        )
        .await?;

        tx.commit().await?;

        if plan_changed {
            self.event_logger
                .log_event(
                    BillingEventBuilder::new(user_id, BillingEventType::PlanChanged)
                        .data(serde_json::json!({
                            "old_plan": old_plan.map(|p| p.as_str()),
                            "new_plan": new_tier.as_str(),
                            "status": status,
                        }))
                        .stripe_event(&event_id)
                        .stripe_subscription(subscription_id.clone()),
                )
                .await;
            self.notifier.usage_changed(user_id).await;
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            plan = new_tier.as_str(),
            status = status,
            plan_changed = plan_changed,
            "Subscription synced"
        );

        Ok(())
    }

    /// Subscription deleted: cancel the row and drop the user to the free
    /// tier. The ledger is left untouched; the next consumption or reset
    /// reconciles against the free allowance.
    async fn handle_subscription_deleted(&self, event: Event) -> LedgerResult<()> {
        let event_id = event.id.to_string();
        let subscription = extract_subscription(event)?;
        let subscription_id = subscription.id.to_string();
        let customer_id = expandable_customer_id(&subscription.customer);

        let Some(user_id) = self.user_by_customer(&customer_id).await? else {
            tracing::warn!(
                event_id = %event_id,
                customer_id = %customer_id,
                "No user for Stripe customer; skipping subscription deletion"
            );
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&subscription_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE users
            SET plan = NULL, plan_renews_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PlanCanceled)
                    .data(serde_json::json!({
                        "period_end": subscription.current_period_end,
                    }))
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription_id.clone()),
            )
            .await;
        self.notifier.usage_changed(user_id).await;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Subscription canceled; user back on free tier"
        );

        Ok(())
    }

    /// Invoice payment succeeded: a paid renewal always grants a clean full
    /// quota for the user's current plan, regardless of leftover balance.
    async fn handle_invoice_payment_succeeded(&self, event: Event) -> LedgerResult<()> {
        let event_id = event.id.to_string();
        let invoice = extract_invoice(event)?;
        let invoice_id = invoice.id.to_string();

        let Some(subscription_ref) = invoice.subscription.as_ref() else {
            tracing::info!(
                event_id = %event_id,
                invoice_id = %invoice_id,
                "Invoice is not tied to a subscription; nothing to reset"
            );
            return Ok(());
        };

        let subscription_id = expandable_subscription_id(subscription_ref);

        let user_id = match self.user_by_subscription(&subscription_id).await? {
            Some(id) => id,
            None => {
                // Renewal can arrive before the subscription row exists;
                // fall back to the customer link.
                match invoice.customer.as_ref().map(expandable_customer_id) {
                    Some(customer_id) => match self.user_by_customer(&customer_id).await? {
                        Some(id) => id,
                        None => {
                            tracing::warn!(
                                event_id = %event_id,
                                subscription_id = %subscription_id,
                                "No user for renewed subscription; skipping"
                            );
                            return Ok(());
                        }
                    },
                    None => {
                        return Err(LedgerError::SubscriptionNotFound(subscription_id));
                    }
                }
            }
        };

        // The new period boundary lives on the subscription, not the
        // invoice; take the embedded object if expanded, otherwise fetch.
        let period_end = match subscription_ref {
            stripe::Expandable::Object(sub) => unix_to_datetime(sub.current_period_end),
            stripe::Expandable::Id(_) => {
                let sub = self.stripe.retrieve_subscription(&subscription_id).await?;
                unix_to_datetime(sub.current_period_end)
            }
        };

        let mut tx = self.pool.begin().await?;

        let Some(plan) = load_user_plan(&mut tx, user_id).await? else {
            tracing::info!(
                event_id = %event_id,
                user_id = %user_id,
                "Renewal for user with no plan; leaving ledger alone"
            );
            return Ok(());
        };

        PlanTransitionReconciler::reset_to_plan(&mut tx, user_id, Some(plan), Some(period_end))
            .await?;

        sqlx::query("UPDATE users SET plan_renews_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(period_end)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_end = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&subscription_id)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PlanRenewed)
                    .data(serde_json::json!({
                        "plan": plan.as_str(),
                        "period_end": period_end.unix_timestamp(),
                    }))
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription_id.clone()),
            )
            .await;
        self.notifier.usage_changed(user_id).await;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            plan = plan.as_str(),
            "Renewal processed; full quota granted"
        );

        Ok(())
    }

    async fn resolve_checkout_user(
        &self,
        session: &stripe::CheckoutSession,
        customer_id: &str,
    ) -> LedgerResult<Option<Uuid>> {
        // Checkout sessions are created with the internal user id attached;
        // the customer link is the fallback for dashboard-created sessions.
        let from_metadata = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(|id| Uuid::parse_str(id).ok());
        if let Some(user_id) = from_metadata {
            return Ok(Some(user_id));
        }

        let from_reference = session
            .client_reference_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok());
        if let Some(user_id) = from_reference {
            return Ok(Some(user_id));
        }

        self.user_by_customer(customer_id).await
    }

    async fn user_by_customer(&self, customer_id: &str) -> LedgerResult<Option<Uuid>> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.map(|(id,)| id))
    }

    async fn user_by_subscription(&self, subscription_id: &str) -> LedgerResult<Option<Uuid>> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM subscriptions WHERE stripe_subscription_id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.map(|(id,)| id))
    }
}

/// Check a `Stripe-Signature` header against the shared secret.
///
/// Header format: `t=<unix>,v1=<hex hmac>,...`. The signed payload is
/// `"{t}.{body}"`.
fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> LedgerResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        LedgerError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        LedgerError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(LedgerError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| LedgerError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(LedgerError::WebhookSignatureInvalid);
    }

    Ok(())
}

fn extract_subscription(event: Event) -> LedgerResult<stripe::Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(LedgerError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> LedgerResult<stripe::Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(LedgerError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}

fn expandable_subscription_id(subscription: &stripe::Expandable<stripe::Subscription>) -> String {
    match subscription {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(s) => s.id.to_string(),
    }
}

fn subscription_price_id(subscription: &stripe::Subscription) -> Option<String> {
    subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|p| p.id.to_string())
}

fn unix_to_datetime(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn map_subscription_status(status: stripe::SubscriptionStatus) -> &'static str {
    match status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        // Collection paused still means "not in good standing" for us.
        stripe::SubscriptionStatus::Paused => "past_due",
    }
}

async fn load_user_plan(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> LedgerResult<Option<PlanTier>> {
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT plan FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

    let (plan_slug,) = row.ok_or(LedgerError::UserNotFound)?;
    Ok(plan_slug.as_deref().and_then(PlanTier::parse))
}

async fn upsert_subscription(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    subscription_id: &str,
    price_id: Option<&str>,
    status: &str,
    current_period_end: Option<OffsetDateTime>,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (id, user_id, stripe_subscription_id, stripe_price_id, status,
             current_period_end, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
        ON CONFLICT (stripe_subscription_id) DO UPDATE SET
            user_id = EXCLUDED.user_id,
            stripe_price_id = EXCLUDED.stripe_price_id,
            status = EXCLUDED.status,
            current_period_end = EXCLUDED.current_period_end,
            updated_at = NOW()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(subscription_id)
    .bind(price_id)
    .bind(status)
    .bind(current_period_end)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = sign(r#"{"id":"evt_1"}"#, now);
        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, now);
        assert!(matches!(result, Err(LedgerError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign(payload, signed_at);
        let result = verify_signature(
            payload,
            &header,
            SECRET,
            signed_at + SIGNATURE_TOLERANCE_SECS + 1,
        );
        assert!(matches!(result, Err(LedgerError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_header_without_v1_rejected() {
        let now = 1_700_000_000;
        let header = format!("t={}", now);
        let result = verify_signature("{}", &header, SECRET, now);
        assert!(matches!(result, Err(LedgerError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let result = verify_signature("{}", "not-a-header", SECRET, 1_700_000_000);
        assert!(matches!(result, Err(LedgerError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_status_mapping_covers_provider_enum() {
        use stripe::SubscriptionStatus as S;
        assert_eq!(map_subscription_status(S::Active), "active");
        assert_eq!(map_subscription_status(S::Trialing), "trialing");
        assert_eq!(map_subscription_status(S::PastDue), "past_due");
        assert_eq!(map_subscription_status(S::Incomplete), "incomplete");
        assert_eq!(
            map_subscription_status(S::IncompleteExpired),
            "incomplete_expired"
        );
        assert_eq!(map_subscription_status(S::Canceled), "canceled");
        assert_eq!(map_subscription_status(S::Unpaid), "unpaid");
        assert_eq!(map_subscription_status(S::Paused), "past_due");
    }
}
