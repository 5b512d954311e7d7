//! Storage abstraction for the dispatch engine.
//!
//! The engine only ever talks to the [`Storage`] trait: one repository
//! covering the queue, sending accounts, the append-only delivery ledger, and
//! externally-fed engagement events. The sqlite implementation lives in
//! [`sqlite`]; swapping backends means implementing this trait, nothing else.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::{AccountId, SendingAccount};
use crate::envelope::{
    AnyEnvelope, CampaignId, Claimed, Envelope, EnvelopeData, EnvelopeId, EnvelopeState,
    EnvelopeStatus, WorkerId,
};
use crate::error::Result;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Final word on one delivery attempt, written to the append-only ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Bounced,
    /// Terminal failure that was not a bounce (exhausted retries, cancelled).
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Bounced => "bounced",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

/// One row of the delivery ledger.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub envelope_id: EnvelopeId,
    pub campaign_id: CampaignId,
    pub account_id: AccountId,
    pub recipient_email: String,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(
        data: &EnvelopeData,
        outcome: DeliveryOutcome,
        detail: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        DeliveryRecord {
            id: Uuid::new_v4(),
            envelope_id: data.id,
            campaign_id: data.campaign_id,
            account_id: data.account_id,
            recipient_email: data.recipient_email.clone(),
            outcome,
            detail,
            recorded_at,
        }
    }
}

/// Recipient-side engagement signal, fed in from outside (tracking pixel,
/// inbox polling). Only the counts matter to the warmup scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementKind {
    Open,
    Reply,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::Open => "open",
            EngagementKind::Reply => "reply",
        }
    }
}

/// Storage trait for the queue, accounts, delivery ledger, and engagement.
#[async_trait]
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Insert planned envelopes as pending. Returns the number inserted.
    async fn enqueue(&self, envelopes: &[EnvelopeData]) -> Result<usize>;

    /// Atomically claim the next sendable envelope for `worker_id`.
    ///
    /// Only envelopes assigned to `eligible_accounts` are considered, in that
    /// slice's order (the caller rotates it between claims); envelopes for
    /// `excluded_domains` are skipped; `not_before` in the future defers a
    /// retry. The claim is a single conditional update, so two workers can
    /// never hold the same envelope.
    async fn claim_next(
        &self,
        worker_id: WorkerId,
        eligible_accounts: &[AccountId],
        excluded_domains: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Envelope<Claimed>>>;

    /// Update an existing envelope's state in storage.
    ///
    /// Returns `false` when the row was already terminal and the write was
    /// skipped; terminal states are write-once.
    async fn persist<T: EnvelopeState + Clone>(&self, envelope: &Envelope<T>) -> Result<bool>
    where
        AnyEnvelope: From<Envelope<T>>;

    async fn get_envelope(&self, id: EnvelopeId) -> Result<AnyEnvelope>;

    /// Fail every still-pending envelope (engine stop). Returns how many rows
    /// were cancelled.
    async fn cancel_pending(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Pending envelopes currently in the queue.
    async fn queue_depth(&self) -> Result<u64>;

    /// Pending-envelope counts per account, across all campaigns.
    async fn pending_by_account(&self) -> Result<BTreeMap<AccountId, u64>>;

    /// Envelope counts by status for one campaign.
    async fn campaign_counts(&self, campaign_id: CampaignId) -> Result<BTreeMap<EnvelopeStatus, u64>>;

    /// Sent-envelope counts per account for one campaign.
    async fn sent_by_account(&self, campaign_id: CampaignId) -> Result<BTreeMap<AccountId, u64>>;

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Insert or fully replace a sending account.
    async fn upsert_account(&self, account: &SendingAccount) -> Result<()>;

    async fn get_account(&self, id: AccountId) -> Result<SendingAccount>;

    async fn list_accounts(&self) -> Result<Vec<SendingAccount>>;

    // ------------------------------------------------------------------
    // Delivery ledger and engagement
    // ------------------------------------------------------------------

    /// Append one row to the delivery ledger.
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    /// Ledger rows for an account in `[from, to)`, optionally filtered by
    /// outcome.
    async fn delivery_count(
        &self,
        account_id: AccountId,
        outcome: Option<DeliveryOutcome>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;

    /// Record an externally-observed engagement event.
    async fn record_engagement(
        &self,
        account_id: AccountId,
        kind: EngagementKind,
        occurred_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Engagement events for an account in `[from, to)`.
    async fn engagement_count(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;
}
