//! Queue-item lifecycle using the typestate pattern.
//!
//! Each envelope — one (campaign, recipient, assigned account) tuple — moves
//! through distinct states enforced at compile time:
//!
//! ```text
//! Envelope<Pending> ──claim_next()──> Envelope<Claimed> ──succeed()──> Envelope<Sent>
//!        ▲                                  │
//!        │                                  ├──fail()───────> Envelope<Failed>
//!        └────────────requeue()─────────────┘
//! ```
//!
//! Claims happen only through [`crate::storage::Storage::claim_next`], which is
//! an atomic conditional update; exactly one worker holds a claimed envelope,
//! and exactly one transition reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::AccountId;

pub mod transitions;

pub use transitions::{RequeueOutcome, RetryPolicy};

/// Unique identifier for an envelope in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub Uuid);

/// Unique identifier for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub Uuid);

/// Unique identifier for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub Uuid);

/// Unique identifier for a worker in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

macro_rules! id_impls {
    ($name:ident) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Display only first 8 characters for readability in logs
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                $name(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

id_impls!(EnvelopeId);
id_impls!(CampaignId);
id_impls!(RecipientId);
id_impls!(WorkerId);

/// Database status values for filtering envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
}

/// Marker trait for valid envelope states.
pub trait EnvelopeState: Send + Sync {}

/// An envelope to be delivered by the dispatch engine.
///
/// The generic parameter `T` is the current state; operations are only
/// available in the states where they are valid.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: EnvelopeState> {
    /// The current state of the envelope.
    pub state: T,
    /// The immutable routing data.
    pub data: EnvelopeData,
}

/// Routing data for one queued delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub id: EnvelopeId,

    /// The campaign this delivery belongs to
    pub campaign_id: CampaignId,

    pub recipient_id: RecipientId,
    pub recipient_email: String,

    /// Recipient domain, materialized at enqueue time so the claim query can
    /// exclude throttled domains without string parsing.
    pub recipient_domain: String,

    /// The sending account this delivery was assigned to by the planner.
    pub account_id: AccountId,

    pub priority: i32,
}

impl EnvelopeData {
    /// Lowercased domain part of an address; empty when malformed.
    pub fn domain_of(address: &str) -> String {
        address
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .unwrap_or_default()
    }
}

// ============================================================================
// Envelope states
// ============================================================================

/// Waiting to be claimed.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {
    /// Number of attempts so far (0 = never tried)
    pub attempt: u32,

    /// Earliest time this envelope can be claimed (for retry backoff).
    /// None means it can be claimed immediately.
    pub not_before: Option<DateTime<Utc>>,
}

impl EnvelopeState for Pending {}

/// Exclusively held by one worker.
#[derive(Debug, Clone, Serialize)]
pub struct Claimed {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    /// Carried over from Pending
    pub attempt: u32,
}

impl EnvelopeState for Claimed {}

/// Delivered successfully.
#[derive(Debug, Clone, Serialize)]
pub struct Sent {
    pub sent_at: DateTime<Utc>,
    pub attempt: u32,
}

impl EnvelopeState for Sent {}

/// Failed terminally (after exhausting retries, or permanently).
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub reason: FailureKind,
    pub failed_at: DateTime<Utc>,
    pub attempt: u32,
}

impl EnvelopeState for Failed {}

/// Classification of a send failure.
///
/// Distinguishes transient conditions (worth a retry) from permanent ones
/// (recorded once, fed to the policy enforcer, never retried).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureKind {
    /// Temporary SMTP rejection (4xx) — greylisting, throttling, mailbox busy.
    TransientSmtp { code: u16, detail: String },

    /// Permanent SMTP rejection (5xx) — counts as a bounce.
    PermanentSmtp { code: u16, detail: String },

    /// The recipient address was rejected as invalid — counts as a bounce.
    InvalidRecipient { detail: String },

    /// Connection-level failure (DNS, TCP, TLS).
    Connection { detail: String },

    /// The send did not complete within the configured timeout.
    Timeout,

    /// A transient failure that ran out of retry budget.
    RetriesExhausted { attempts: u32, detail: String },

    /// The run was stopped while this envelope was still pending.
    Cancelled,
}

impl FailureKind {
    /// Returns true if this failure should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientSmtp { .. } | FailureKind::Connection { .. } | FailureKind::Timeout
        )
    }

    /// Returns true if this failure counts as a bounce for reputation purposes.
    pub fn is_bounce(&self) -> bool {
        matches!(
            self,
            FailureKind::PermanentSmtp { .. } | FailureKind::InvalidRecipient { .. }
        )
    }

    /// Human-readable message, also persisted in `last_error`.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureKind::TransientSmtp { code, detail } => {
                format!("Transient SMTP failure ({code}): {detail}")
            }
            FailureKind::PermanentSmtp { code, detail } => {
                format!("Permanent SMTP failure ({code}): {detail}")
            }
            FailureKind::InvalidRecipient { detail } => {
                format!("Invalid recipient: {detail}")
            }
            FailureKind::Connection { detail } => format!("Connection error: {detail}"),
            FailureKind::Timeout => "Send timed out".to_string(),
            FailureKind::RetriesExhausted { attempts, detail } => {
                format!("Retries exhausted after {attempts} attempts: {detail}")
            }
            FailureKind::Cancelled => "Cancelled before sending".to_string(),
        }
    }
}

// ============================================================================
// Unified envelope representation
// ============================================================================

/// Enum that can hold an envelope in any state, for storage and status APIs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "envelope")]
pub enum AnyEnvelope {
    Pending(Envelope<Pending>),
    Claimed(Envelope<Claimed>),
    Sent(Envelope<Sent>),
    Failed(Envelope<Failed>),
}

impl AnyEnvelope {
    pub fn data(&self) -> &EnvelopeData {
        match self {
            AnyEnvelope::Pending(e) => &e.data,
            AnyEnvelope::Claimed(e) => &e.data,
            AnyEnvelope::Sent(e) => &e.data,
            AnyEnvelope::Failed(e) => &e.data,
        }
    }

    pub fn status(&self) -> EnvelopeStatus {
        match self {
            AnyEnvelope::Pending(_) => EnvelopeStatus::Pending,
            AnyEnvelope::Claimed(_) => EnvelopeStatus::Claimed,
            AnyEnvelope::Sent(_) => EnvelopeStatus::Sent,
            AnyEnvelope::Failed(_) => EnvelopeStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyEnvelope::Sent(_) | AnyEnvelope::Failed(_))
    }
}

impl From<Envelope<Pending>> for AnyEnvelope {
    fn from(e: Envelope<Pending>) -> Self {
        AnyEnvelope::Pending(e)
    }
}

impl From<Envelope<Claimed>> for AnyEnvelope {
    fn from(e: Envelope<Claimed>) -> Self {
        AnyEnvelope::Claimed(e)
    }
}

impl From<Envelope<Sent>> for AnyEnvelope {
    fn from(e: Envelope<Sent>) -> Self {
        AnyEnvelope::Sent(e)
    }
}

impl From<Envelope<Failed>> for AnyEnvelope {
    fn from(e: Envelope<Failed>) -> Self {
        AnyEnvelope::Failed(e)
    }
}
