// Ledger crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // LedgerError carries Stripe error payloads
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Reelkit Credit Ledger
//!
//! Tracks how many billable operations (credits and AI credits) each user may
//! still perform, debits them atomically as features are used, and keeps the
//! balance consistent with Stripe subscription state.
//!
//! ## Features
//!
//! - **Consumption**: atomic "spend N credits" with row-level serialization
//! - **Plan transitions**: upgrade carries usage, downgrade resets it
//! - **Renewals**: invoice payment grants a clean full quota
//! - **Webhooks**: idempotent Stripe event sync (checkout, subscription,
//!   invoice), replay-safe by external id
//! - **Coordination**: optional Redis lock in front of the mandatory
//!   transactional row lock
//! - **Notifications**: best-effort usage-changed pub/sub for dashboards

pub mod allowance;
pub mod client;
pub mod consume;
pub mod error;
pub mod events;
pub mod lock;
pub mod notify;
pub mod reconcile;
pub mod store;
pub mod webhooks;

// Allowance
pub use allowance::{allowance_for, PlanAllowance, FREE_ALLOWANCE, UNLIMITED};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Consumption
pub use consume::{ConsumptionCoordinator, CreditKind, UsageLimits};

// Errors
pub use error::{LedgerError, LedgerResult};

// Coordination lock
pub use lock::{CoordinationLock, InMemoryCoordinationLock, RedisCoordinationLock};

// Notifications
pub use notify::UsageNotifier;

// Reconciliation
pub use reconcile::PlanTransitionReconciler;

// Webhooks
pub use webhooks::WebhookHandler;
