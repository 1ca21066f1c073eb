//! Ledger error types.

use thiserror::Error;

use crate::consume::CreditKind;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors produced by the credit ledger.
///
/// `InsufficientCredits` is a normal business outcome and travels to the user
/// as a typed result; everything else is infrastructure.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The user does not have enough credits of the given kind. Terminal for
    /// the triggering operation; callers surface an upgrade prompt and must
    /// not retry.
    #[error("insufficient {0} credits")]
    InsufficientCredits(CreditKind),

    /// The optional coordination lock could not be acquired. Recovered
    /// locally (the transactional row lock still serializes), surfaced only
    /// for observability.
    #[error("coordination lock unavailable")]
    LockUnavailable,

    /// A Stripe price id has no known plan mapping. The triggering event is
    /// skipped rather than guessing a tier.
    #[error("no plan mapping for Stripe price {0}")]
    UnmappablePlan(String),

    /// Webhook signature verification failed. Rejected before any read or
    /// write.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Webhook event carried an unexpected payload object.
    #[error("webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("user not found")]
    UserNotFound,

    #[error("no user for Stripe customer {0}")]
    CustomerNotFound(String),

    #[error("no record of Stripe subscription {0}")]
    SubscriptionNotFound(String),

    /// Transient; the enclosing transaction rolled back, so the whole
    /// operation is safe to retry.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_names_the_pool() {
        let slide = LedgerError::InsufficientCredits(CreditKind::Slide);
        let ai = LedgerError::InsufficientCredits(CreditKind::Ai);
        assert_eq!(slide.to_string(), "insufficient slide credits");
        assert_eq!(ai.to_string(), "insufficient ai credits");
    }

    #[test]
    fn test_unmappable_plan_includes_price_id() {
        let err = LedgerError::UnmappablePlan("price_abc123".to_string());
        assert!(err.to_string().contains("price_abc123"));
    }
}
