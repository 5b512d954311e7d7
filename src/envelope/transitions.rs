//! State transitions for envelopes.
//!
//! Terminal transitions (`succeed`, `fail`) are conditional at the storage
//! layer: if the row is already terminal the persist is a no-op and the
//! transition returns `None`, so a duplicate acknowledgment never double-counts
//! rate or warmup counters.

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::error::Result;
use crate::storage::Storage;

use super::{Claimed, Envelope, Failed, FailureKind, Pending, Sent};

/// Retry behavior for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt: `backoff_ms * factor^attempt`,
    /// capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> chrono::Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        chrono::Duration::milliseconds(exponential as i64)
    }
}

/// Outcome of requeueing a transiently-failed claimed envelope.
#[derive(Debug)]
pub enum RequeueOutcome {
    /// Back in the queue with a backoff delay.
    Requeued(Envelope<Pending>),
    /// Retry budget exhausted; now terminally failed.
    Exhausted(Envelope<Failed>),
}

impl Envelope<Claimed> {
    /// Release the claim without an attempt (e.g. account became ineligible
    /// between claim and send).
    pub async fn unclaim<S: Storage + ?Sized>(self, storage: &S) -> Result<Envelope<Pending>> {
        let envelope = Envelope {
            data: self.data,
            state: Pending {
                attempt: self.state.attempt,
                not_before: None,
            },
        };
        storage.persist(&envelope).await?;
        Ok(envelope)
    }

    /// Mark the envelope sent.
    ///
    /// Returns `None` when the row was already terminal (duplicate
    /// acknowledgment); the caller must not update counters in that case.
    pub async fn succeed<S: Storage + ?Sized>(
        self,
        storage: &S,
        now: DateTime<Utc>,
    ) -> Result<Option<Envelope<Sent>>> {
        let envelope = Envelope {
            data: self.data,
            state: Sent {
                sent_at: now,
                attempt: self.state.attempt + 1,
            },
        };

        if !storage.persist(&envelope).await? {
            tracing::debug!(
                envelope_id = %envelope.data.id,
                "Duplicate completion ignored (already terminal)"
            );
            return Ok(None);
        }

        counter!("broadside_sent_total", "account" => envelope.data.account_id.to_string())
            .increment(1);
        Ok(Some(envelope))
    }

    /// Mark the envelope terminally failed.
    ///
    /// Returns `None` when the row was already terminal.
    pub async fn fail<S: Storage + ?Sized>(
        self,
        reason: FailureKind,
        storage: &S,
        now: DateTime<Utc>,
    ) -> Result<Option<Envelope<Failed>>> {
        let envelope = Envelope {
            data: self.data,
            state: Failed {
                reason,
                failed_at: now,
                attempt: self.state.attempt + 1,
            },
        };

        if !storage.persist(&envelope).await? {
            tracing::debug!(
                envelope_id = %envelope.data.id,
                "Duplicate completion ignored (already terminal)"
            );
            return Ok(None);
        }

        counter!("broadside_failed_total", "account" => envelope.data.account_id.to_string())
            .increment(1);
        Ok(Some(envelope))
    }

    /// Requeue after a transient failure, or fail terminally when the retry
    /// budget is exhausted.
    pub async fn requeue<S: Storage + ?Sized>(
        self,
        reason: FailureKind,
        policy: &RetryPolicy,
        storage: &S,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome> {
        debug_assert!(reason.is_transient());

        let attempt = self.state.attempt + 1;

        if attempt > policy.max_retries {
            counter!(
                "broadside_retry_denied_total",
                "account" => self.data.account_id.to_string()
            )
            .increment(1);
            tracing::warn!(
                envelope_id = %self.data.id,
                attempt,
                max_retries = policy.max_retries,
                "No retries remaining, envelope failed"
            );

            let detail = reason.to_error_message();
            let failed = Envelope {
                data: self.data,
                state: Failed {
                    reason: FailureKind::RetriesExhausted { attempts: attempt, detail },
                    failed_at: now,
                    attempt,
                },
            };
            storage.persist(&failed).await?;
            return Ok(RequeueOutcome::Exhausted(failed));
        }

        let not_before = now + policy.backoff_for(self.state.attempt);
        tracing::info!(
            envelope_id = %self.data.id,
            attempt,
            not_before = %not_before,
            error = %reason.to_error_message(),
            "Requeueing envelope with backoff"
        );

        let pending = Envelope {
            data: self.data,
            state: Pending {
                attempt,
                not_before: Some(not_before),
            },
        };
        storage.persist(&pending).await?;
        counter!("broadside_requeued_total").increment(1);
        Ok(RequeueOutcome::Requeued(pending))
    }
}
