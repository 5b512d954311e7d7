//! Distribution planner: assigns campaign recipients to sending accounts in
//! contiguous blocks before anything touches the queue.
//!
//! The plan is deterministic: recipients keep their input order, and account
//! `k` receives recipients `[k*C, (k+1)*C)` where `C` is the per-account
//! block size. Anything beyond the total capacity `C * accounts` is reported
//! as overflow rather than silently assigned.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::account::SendingAccount;
use crate::envelope::{CampaignId, EnvelopeData, EnvelopeId, RecipientId};
use crate::error::{BroadsideError, Result};

/// One recipient of a campaign, prior to planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub id: RecipientId,
    pub email: String,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Recipient {
            id: RecipientId(Uuid::new_v4()),
            email: email.into(),
        }
    }
}

/// Parameters for planning one campaign.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub campaign_id: CampaignId,
    /// Contiguous block size: how many recipients each account receives.
    pub emails_per_account: usize,
    pub priority: i32,
}

/// Outcome of planning: the envelopes to enqueue plus an accounting summary.
#[derive(Debug)]
pub struct DistributionPlan {
    pub envelopes: Vec<EnvelopeData>,
    pub summary: DistributionSummary,
}

/// Accounting for one planned campaign.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DistributionSummary {
    pub total_recipients: usize,
    pub planned: usize,
    /// Recipients beyond `emails_per_account * accounts` that were NOT
    /// assigned. The caller decides whether to re-plan them later.
    pub overflow: usize,
    /// Planned envelope count per account, keyed by account id.
    pub per_account: BTreeMap<String, usize>,
}

/// Assign recipients to accounts in blocks of `emails_per_account`.
///
/// Inactive accounts in the selection are dropped from the rotation with a
/// warning and capacity is recomputed over the active subset; the plan only
/// fails when no active account remains.
pub fn plan_distribution(
    request: &PlanRequest,
    recipients: &[Recipient],
    accounts: &[SendingAccount],
) -> Result<DistributionPlan> {
    if accounts.is_empty() {
        return Err(BroadsideError::Configuration(
            "cannot plan a campaign with no sending accounts selected".to_string(),
        ));
    }
    if request.emails_per_account == 0 {
        return Err(BroadsideError::Configuration(
            "emails_per_account must be at least 1".to_string(),
        ));
    }

    for inactive in accounts.iter().filter(|a| !a.is_active) {
        tracing::warn!(
            campaign_id = %request.campaign_id,
            account_id = %inactive.id,
            label = %inactive.label,
            "Skipping inactive account in campaign selection"
        );
    }
    let active: Vec<&SendingAccount> = accounts.iter().filter(|a| a.is_active).collect();
    if active.is_empty() {
        return Err(BroadsideError::Configuration(
            "no active sending account in the campaign selection".to_string(),
        ));
    }

    let capacity = request.emails_per_account * active.len();
    let planned = recipients.len().min(capacity);

    let mut per_account: BTreeMap<String, usize> = BTreeMap::new();
    let mut envelopes = Vec::with_capacity(planned);

    for (i, recipient) in recipients.iter().take(planned).enumerate() {
        let account = active[i / request.emails_per_account];
        *per_account.entry(account.id.0.to_string()).or_default() += 1;

        envelopes.push(EnvelopeData {
            id: EnvelopeId(Uuid::new_v4()),
            campaign_id: request.campaign_id,
            recipient_id: recipient.id,
            recipient_email: recipient.email.clone(),
            recipient_domain: EnvelopeData::domain_of(&recipient.email),
            account_id: account.id,
            priority: request.priority,
        });
    }

    let summary = DistributionSummary {
        total_recipients: recipients.len(),
        planned,
        overflow: recipients.len() - planned,
        per_account,
    };

    if summary.overflow > 0 {
        tracing::warn!(
            campaign_id = %request.campaign_id,
            overflow = summary.overflow,
            capacity,
            "Campaign exceeds account capacity, overflow recipients not planned"
        );
    }
    tracing::info!(
        campaign_id = %request.campaign_id,
        planned = summary.planned,
        accounts = active.len(),
        "Planned campaign distribution"
    );

    Ok(DistributionPlan { envelopes, summary })
}
