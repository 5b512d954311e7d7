//! Dispatch engine: a bounded worker pool draining the envelope queue.
//!
//! Each worker claims one envelope at a time, sends it through the mailer,
//! and settles the outcome (success, retry with backoff, or terminal
//! failure). Between claims the eligible-account list is recomputed from the
//! rate limiter, warmup scheduler, and reputation policy, and rotated so no
//! single account monopolizes the pool.
//!
//! The control surface is `pause`/`resume` (an atomic flag workers poll
//! between claims, never mid-send), `stop` (cancellation token; in-flight
//! sends finish, remaining pending envelopes are cancelled), and `status`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::account::AccountId;
use crate::envelope::{
    CampaignId, Claimed, Envelope, FailureKind, RequeueOutcome, RetryPolicy, WorkerId,
};
use crate::error::{BroadsideError, Result};
use crate::limiter::RateLimiter;
use crate::mailer::{Mailer, OutboundMessage};
use crate::planner::{DistributionSummary, PlanRequest, Recipient, plan_distribution};
use crate::policy::{Observation, PolicyEnforcer, PolicyThresholds, ReputationSnapshot};
use crate::storage::{DeliveryOutcome, DeliveryRecord, EngagementKind, Storage};
use crate::warmup::WarmupScheduler;

/// Configuration for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent workers draining the queue.
    pub workers: usize,

    /// How long a worker sleeps when the queue has nothing claimable.
    pub claim_interval_ms: u64,

    /// Maximum retry attempts for transient failures before giving up.
    pub max_retries: u32,

    /// Base backoff duration in milliseconds (exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// Timeout for one SMTP conversation in milliseconds.
    pub send_timeout_ms: u64,

    /// Interval for logging engine status in milliseconds.
    /// Set to None to disable periodic status logging.
    pub status_log_interval_ms: Option<u64>,

    /// Enforce the warmup scheduler's jittered gap between sends on warming
    /// accounts. Graduated accounts are never gap-paced.
    pub pace_warming_accounts: bool,

    pub policy: PolicyThresholds,
    pub warmup: WarmupScheduler,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            claim_interval_ms: 500,
            max_retries: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
            send_timeout_ms: 30_000,
            status_log_interval_ms: Some(2000),
            pace_warming_accounts: true,
            policy: PolicyThresholds::default(),
            warmup: WarmupScheduler::default(),
        }
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// Rendered content shared by every envelope of one campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignContent {
    pub subject: String,
    pub body: String,
}

/// Where the engine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Sending,
    Paused,
    Stopped,
}

/// Status query result.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub queue_depth: u64,
    pub in_flight: usize,
    pub sent: u64,
    pub failed: u64,
    pub accounts: Vec<AccountStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub id: AccountId,
    pub label: String,
    pub is_active: bool,
    pub warmup_stage: u32,
    pub sent_today: u32,
    /// Envelopes still queued for this account, across all campaigns.
    pub pending: u64,
    pub reputation: ReputationSnapshot,
}

/// The dispatch engine.
///
/// Storage and mailer are injected, so the same engine runs against sqlite +
/// real SMTP in production and an in-memory pool + [`crate::mailer::MockMailer`]
/// in tests.
pub struct Dispatcher<S, M>
where
    S: Storage,
    M: Mailer,
{
    storage: Arc<S>,
    mailer: Arc<M>,
    config: DispatchConfig,
    limiter: RateLimiter,
    policy: PolicyEnforcer,
    campaigns: DashMap<CampaignId, CampaignContent>,
    /// Warmup pacing: earliest next send per warming account.
    next_allowed: DashMap<AccountId, DateTime<Utc>>,
    /// Rotation cursor over the eligible-account list.
    rotation: AtomicUsize,
    paused: AtomicBool,
    stop_token: CancellationToken,
    in_flight: AtomicUsize,
    sent: AtomicU64,
    failed: AtomicU64,
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

impl<S, M> Dispatcher<S, M>
where
    S: Storage + 'static,
    M: Mailer + 'static,
{
    pub fn new(
        storage: Arc<S>,
        mailer: Arc<M>,
        config: DispatchConfig,
        stop_token: CancellationToken,
    ) -> Self {
        let policy = PolicyEnforcer::new(config.policy.clone());
        Self {
            storage,
            mailer,
            config,
            limiter: RateLimiter::new(),
            policy,
            campaigns: DashMap::new(),
            next_allowed: DashMap::new(),
            rotation: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            stop_token,
            in_flight: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Campaign intake
    // ------------------------------------------------------------------

    /// Plan a campaign over an explicit account selection and enqueue it.
    ///
    /// Accounts are never picked implicitly; the caller names exactly which
    /// ones participate.
    pub async fn launch_campaign(
        &self,
        content: CampaignContent,
        recipients: &[Recipient],
        account_ids: &[AccountId],
        emails_per_account: usize,
        priority: i32,
    ) -> Result<(CampaignId, DistributionSummary)> {
        if account_ids.is_empty() {
            return Err(BroadsideError::Configuration(
                "a campaign needs an explicit, non-empty account selection".to_string(),
            ));
        }

        let mut accounts = Vec::with_capacity(account_ids.len());
        for id in account_ids {
            accounts.push(self.storage.get_account(*id).await?);
        }

        let request = PlanRequest {
            campaign_id: CampaignId(Uuid::new_v4()),
            emails_per_account,
            priority,
        };
        let plan = plan_distribution(&request, recipients, &accounts)?;
        self.storage.enqueue(&plan.envelopes).await?;
        self.campaigns.insert(request.campaign_id, content);

        metrics::counter!("broadside_campaigns_launched_total").increment(1);
        Ok((request.campaign_id, plan.summary))
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Stop claiming new envelopes. In-flight sends finish normally.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Dispatch paused");
    }

    /// Resume claiming after a pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("Dispatch resumed");
    }

    /// Stop the run: workers exit after their current send and every
    /// still-pending envelope is cancelled.
    pub fn stop(&self) {
        self.stop_token.cancel();
        tracing::info!("Dispatch stop requested");
    }

    pub fn state(&self) -> EngineState {
        if self.stop_token.is_cancelled() {
            EngineState::Stopped
        } else if self.paused.load(Ordering::SeqCst) {
            EngineState::Paused
        } else {
            EngineState::Sending
        }
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let now = Utc::now();
        let pending = self.storage.pending_by_account().await?;
        let accounts = self
            .storage
            .list_accounts()
            .await?
            .into_iter()
            .map(|account| AccountStatus {
                sent_today: self.limiter.sent_today(account.id, now).max(account.daily_sent_count),
                pending: pending.get(&account.id).copied().unwrap_or(0),
                reputation: self.policy.account_snapshot(account.id, now),
                id: account.id,
                label: account.label,
                is_active: account.is_active,
                warmup_stage: account.warmup_stage,
            })
            .collect();

        Ok(EngineStatus {
            state: self.state(),
            queue_depth: self.storage.queue_depth().await?,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            accounts,
        })
    }

    // ------------------------------------------------------------------
    // External feedback
    // ------------------------------------------------------------------

    /// Feed a spam complaint in from the outside (feedback loop, webhook).
    pub fn report_complaint(&self, account_id: AccountId, recipient_domain: &str) {
        self.policy
            .record(account_id, recipient_domain, Observation::Complained, Utc::now());
    }

    /// Record recipient engagement (open or reply) for warmup evaluation.
    pub async fn note_engagement(&self, account_id: AccountId, kind: EngagementKind) -> Result<()> {
        self.storage
            .record_engagement(account_id, kind, Utc::now())
            .await
    }

    /// Lift an account's reputation pause or block.
    pub fn clear_account(&self, account_id: AccountId) {
        self.policy.clear(account_id);
    }

    /// Lift a recipient domain's reputation pause or block.
    pub fn clear_domain(&self, domain: &str) {
        self.policy.clear_domain(domain);
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run the worker pool until [`Dispatcher::stop`] is called.
    ///
    /// On stop, every envelope still pending is failed as cancelled so the
    /// queue never holds stale work across runs.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(workers = self.config.workers, "Dispatch engine starting");

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            tracing::debug!(
                                in_flight = engine.in_flight.load(Ordering::Relaxed),
                                sent = engine.sent.load(Ordering::Relaxed),
                                failed = engine.failed.load(Ordering::Relaxed),
                                "Engine status"
                            );
                        }
                        _ = engine.stop_token.cancelled() => break,
                    }
                }
            });
        }

        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..self.config.workers {
            let engine = self.clone();
            let worker_id = WorkerId(Uuid::new_v4());
            join_set.spawn(async move { engine.worker_loop(worker_id).await });
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker exited with error"),
                Err(join_error) => tracing::error!(error = %join_error, "Worker panicked"),
            }
        }

        if self.stop_token.is_cancelled() {
            let cancelled = self.storage.cancel_pending(Utc::now()).await?;
            if cancelled > 0 {
                tracing::info!(cancelled, "Cancelled pending envelopes on stop");
            }
        }

        tracing::info!("Dispatch engine stopped");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(worker_id = %worker_id))]
    async fn worker_loop(&self, worker_id: WorkerId) -> Result<()> {
        loop {
            if self.stop_token.is_cancelled() {
                tracing::debug!("Worker shutting down");
                return Ok(());
            }
            if self.paused.load(Ordering::SeqCst) {
                self.idle().await;
                continue;
            }

            let now = Utc::now();
            // Storage hiccups here must not kill the worker; log, back off
            // one claim interval, and try again.
            let (eligible, excluded) = match self.eligibility(now).await {
                Ok(sets) => sets,
                Err(e) => {
                    tracing::error!(error = %e, "Eligibility pass failed, backing off");
                    self.idle().await;
                    continue;
                }
            };

            let claimed = match self
                .storage
                .claim_next(worker_id, &eligible, &excluded, now)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(error = %e, "Claim failed, backing off");
                    self.idle().await;
                    continue;
                }
            };

            match claimed {
                Some(envelope) => {
                    self.in_flight.fetch_add(1, Ordering::Relaxed);
                    let _guard = scopeguard::guard((), |_| {
                        self.in_flight.fetch_sub(1, Ordering::Relaxed);
                    });
                    if let Err(e) = self.process(envelope).await {
                        tracing::error!(error = %e, "Failed to settle envelope outcome");
                    }
                }
                None => self.idle().await,
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.config.claim_interval_ms)) => {}
            _ = self.stop_token.cancelled() => {}
        }
    }

    /// Accounts allowed to send right now, rotated, plus domains to skip.
    ///
    /// Day rollover for warming accounts happens here: the first eligibility
    /// pass of a new day resets daily counters and moves warmup stages.
    async fn eligibility(&self, now: DateTime<Utc>) -> Result<(Vec<AccountId>, Vec<String>)> {
        let mut accounts = self.storage.list_accounts().await?;
        let today = now.date_naive();
        let mut eligible = Vec::new();

        for account in &mut accounts {
            if !account.is_active {
                continue;
            }

            if account.is_warming_up() && account.last_sent_date != Some(today) {
                let window_end = day_start(today);
                let window_start = window_end - chrono::Duration::days(1);
                let volume = self
                    .storage
                    .delivery_count(account.id, Some(DeliveryOutcome::Sent), window_start, window_end)
                    .await?;
                let engagement = self
                    .storage
                    .engagement_count(account.id, window_start, window_end)
                    .await?;
                let ratio = if volume == 0 {
                    0.0
                } else {
                    engagement as f64 / volume as f64
                };
                self.config
                    .warmup
                    .rollover(account, today, volume as u32, ratio);
                self.storage.upsert_account(account).await?;
            }

            if !self.policy.account_state(account.id, now).is_sendable(now) {
                continue;
            }
            if self.config.pace_warming_accounts {
                if let Some(gate) = self.next_allowed.get(&account.id) {
                    if *gate > now {
                        continue;
                    }
                }
            }
            let warmup_cap = self.config.warmup.daily_allowance(account);
            if !self.limiter.check(account, warmup_cap, now).is_allowed() {
                continue;
            }
            eligible.push(account.id);
        }

        if !eligible.is_empty() {
            let shift = self.rotation.fetch_add(1, Ordering::Relaxed) % eligible.len();
            eligible.rotate_left(shift);
        }

        Ok((eligible, self.policy.unsendable_domains(now)))
    }

    /// Send one claimed envelope and settle its outcome.
    async fn process(&self, claimed: Envelope<Claimed>) -> Result<()> {
        let data = claimed.data.clone();
        tracing::info!(envelope_id = %data.id, to = %data.recipient_email, "Processing envelope");

        let account = match self.storage.get_account(data.account_id).await {
            Ok(account) => account,
            Err(e) => {
                tracing::error!(
                    envelope_id = %data.id,
                    account_id = %data.account_id,
                    error = %e,
                    "Assigned account unavailable, releasing claim"
                );
                claimed.unclaim(self.storage.as_ref()).await?;
                return Ok(());
            }
        };

        let Some(content) = self.campaigns.get(&data.campaign_id).map(|c| c.value().clone()) else {
            // Content only lives for the launching process; an orphaned
            // envelope from a previous run cannot be sent.
            tracing::error!(
                envelope_id = %data.id,
                campaign_id = %data.campaign_id,
                "No content registered for campaign, cancelling envelope"
            );
            let failed = claimed
                .fail(FailureKind::Cancelled, self.storage.as_ref(), Utc::now())
                .await?;
            if let Some(failed) = failed {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.storage
                    .record_delivery(&DeliveryRecord::new(
                        &failed.data,
                        DeliveryOutcome::Failed,
                        Some("campaign content unavailable".to_string()),
                        Utc::now(),
                    ))
                    .await?;
            }
            return Ok(());
        };

        // Hold a rate slot for the whole send. Eligibility checked the
        // budget before the claim, but another worker may have taken the
        // last unit since; if so, release the claim instead of overshooting.
        let warmup_cap = self.config.warmup.daily_allowance(&account);
        if !self.limiter.reserve(&account, warmup_cap, Utc::now()).is_allowed() {
            tracing::debug!(
                envelope_id = %data.id,
                account_id = %account.id,
                "Rate budget filled between claim and send, releasing claim"
            );
            claimed.unclaim(self.storage.as_ref()).await?;
            return Ok(());
        }

        let message = OutboundMessage {
            to: data.recipient_email.clone(),
            subject: content.subject,
            body: content.body,
        };

        let outcome = match tokio::time::timeout(
            Duration::from_millis(self.config.send_timeout_ms),
            self.mailer.send(&account, &message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FailureKind::Timeout),
        };

        let now = Utc::now();
        match outcome {
            Ok(receipt) => {
                // The wire send happened, so the provider saw it: commit the
                // reservation even if the row turns out to be settled already.
                self.limiter.record_send(account.id, now);
                let Some(sent) = claimed.succeed(self.storage.as_ref(), now).await? else {
                    return Ok(());
                };
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.policy
                    .record(account.id, &data.recipient_domain, Observation::Delivered, now);
                self.storage
                    .record_delivery(&DeliveryRecord::new(
                        &sent.data,
                        DeliveryOutcome::Sent,
                        Some(receipt.message),
                        now,
                    ))
                    .await?;

                let mut account = account;
                let today = now.date_naive();
                if account.last_sent_date == Some(today) {
                    account.daily_sent_count += 1;
                } else {
                    account.last_sent_date = Some(today);
                    account.daily_sent_count = 1;
                }
                self.storage.upsert_account(&account).await?;

                if self.config.pace_warming_accounts {
                    if let Some(gap) = self.config.warmup.send_gap(&account) {
                        let gap = chrono::Duration::from_std(gap)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        self.next_allowed.insert(account.id, now + gap);
                    }
                }
            }
            Err(kind) if kind.is_transient() => {
                self.limiter.release(account.id);
                let policy = RetryPolicy::from(&self.config);
                match claimed.requeue(kind, &policy, self.storage.as_ref(), now).await? {
                    RequeueOutcome::Requeued(_) => {}
                    RequeueOutcome::Exhausted(failed) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        self.storage
                            .record_delivery(&DeliveryRecord::new(
                                &failed.data,
                                DeliveryOutcome::Failed,
                                Some(failed.state.reason.to_error_message()),
                                now,
                            ))
                            .await?;
                    }
                }
            }
            Err(kind) => {
                self.limiter.release(account.id);
                let is_bounce = kind.is_bounce();
                let detail = kind.to_error_message();
                let Some(failed) = claimed.fail(kind, self.storage.as_ref(), now).await? else {
                    return Ok(());
                };
                self.failed.fetch_add(1, Ordering::Relaxed);
                // Bounces hit the reputation windows before any further claim
                // can route to this account or domain.
                if is_bounce {
                    self.policy
                        .record(account.id, &failed.data.recipient_domain, Observation::Bounced, now);
                }
                let outcome = if is_bounce {
                    DeliveryOutcome::Bounced
                } else {
                    DeliveryOutcome::Failed
                };
                self.storage
                    .record_delivery(&DeliveryRecord::new(&failed.data, outcome, Some(detail), now))
                    .await?;
            }
        }

        Ok(())
    }
}
