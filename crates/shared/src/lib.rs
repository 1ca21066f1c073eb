//! Shared types and database plumbing for Reelkit services.
//!
//! Everything in this crate is usable by both the API server and the
//! ledger crate without pulling in Stripe or Redis.

pub mod db;
pub mod plan;

pub use db::{create_pool, run_migrations};
pub use plan::PlanTier;
