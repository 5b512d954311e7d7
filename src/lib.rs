//! Bulk outbound email dispatch engine.
//!
//! This crate takes a campaign (content, recipients, and an explicit
//! selection of sending accounts), distributes the recipients across the
//! accounts in contiguous blocks, and drains the resulting queue through a
//! bounded worker pool. Sending is paced by per-provider rate ceilings and a
//! warmup ramp for fresh accounts, and gated by a bounce/complaint reputation
//! policy. Every delivery attempt lands in an append-only ledger.
//!
//! Storage (sqlite via sqlx) and the SMTP transport (lettre) are both behind
//! traits, so the engine runs end to end in tests against an in-memory pool
//! and a mock mailer.

pub mod account;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod limiter;
pub mod mailer;
pub mod planner;
pub mod policy;
pub mod storage;
pub mod warmup;

// Re-export commonly used types
pub use account::{AccountId, Provider, RateCeilings, SendingAccount, SmtpCredentials};
pub use engine::{
    AccountStatus, CampaignContent, DispatchConfig, Dispatcher, EngineState, EngineStatus,
};
pub use envelope::*;
pub use error::{BroadsideError, Result};
pub use limiter::{RateDecision, RateLimiter, RateWindow};
pub use mailer::{DeliveryReceipt, Mailer, MockMailer, OutboundMessage, SmtpMailer};
pub use planner::{DistributionPlan, DistributionSummary, PlanRequest, Recipient};
pub use policy::{Observation, PolicyEnforcer, PolicyThresholds, ReputationState};
pub use storage::{DeliveryOutcome, DeliveryRecord, EngagementKind, SqliteStore, Storage};
pub use warmup::{StageBudget, StageChange, WarmupScheduler};

/// Get the broadside database migrator.
///
/// Returns a migrator that can be run against a connection pool.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
