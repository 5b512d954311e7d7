//! Reputation policy: trailing-24h bounce and complaint rates per sending
//! account and per recipient domain, with a warn / pause / block ladder.
//!
//! Rates only bind once a track record has a minimum sample of attempts, so a
//! single early bounce cannot pause a fresh account. Pauses expire on their
//! own; blocks never do and require an operator [`PolicyEnforcer::clear`].

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;

use crate::account::AccountId;

/// One observed delivery attempt, as the policy sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Delivered,
    Bounced,
    Complained,
}

/// Where a subject (account or domain) stands with the policy.
///
/// `reason` names the rate that tripped and its value at the time, so a
/// paused account is explicable from status output alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ReputationState {
    Active,
    Warned,
    Paused { until: DateTime<Utc>, reason: String },
    /// Manual clear only.
    Blocked { reason: String },
}

impl ReputationState {
    /// Whether the subject may be routed to right now.
    pub fn is_sendable(&self, now: DateTime<Utc>) -> bool {
        match self {
            ReputationState::Active | ReputationState::Warned => true,
            ReputationState::Paused { until, .. } => now >= *until,
            ReputationState::Blocked { .. } => false,
        }
    }
}

/// Rate thresholds and window configuration.
#[derive(Debug, Clone)]
pub struct PolicyThresholds {
    pub warn_rate: f64,
    pub pause_rate: f64,
    pub block_rate: f64,
    /// Attempts required in the window before rates bind.
    pub min_sample: usize,
    pub pause_duration: Duration,
    pub window: Duration,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        PolicyThresholds {
            warn_rate: 0.02,
            pause_rate: 0.05,
            block_rate: 0.20,
            min_sample: 10,
            pause_duration: Duration::hours(24),
            window: Duration::hours(24),
        }
    }
}

#[derive(Debug)]
struct TrackRecord {
    events: VecDeque<(DateTime<Utc>, Observation)>,
    state: ReputationState,
}

impl TrackRecord {
    fn new() -> Self {
        TrackRecord {
            events: VecDeque::new(),
            state: ReputationState::Active,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.events.front().is_some_and(|(t, _)| *t < cutoff) {
            self.events.pop_front();
        }
    }

    fn rates(&self) -> (usize, f64, f64) {
        let total = self.events.len();
        if total == 0 {
            return (0, 0.0, 0.0);
        }
        let bounces = self
            .events
            .iter()
            .filter(|(_, o)| matches!(o, Observation::Bounced))
            .count();
        let complaints = self
            .events
            .iter()
            .filter(|(_, o)| matches!(o, Observation::Complained))
            .count();
        (
            total,
            bounces as f64 / total as f64,
            complaints as f64 / total as f64,
        )
    }
}

/// Snapshot of one subject's standing, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ReputationSnapshot {
    pub state: ReputationState,
    pub attempts: usize,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
}

/// Enforces bounce/complaint policy over sliding windows.
#[derive(Debug)]
pub struct PolicyEnforcer {
    thresholds: PolicyThresholds,
    accounts: DashMap<AccountId, TrackRecord>,
    domains: DashMap<String, TrackRecord>,
}

impl PolicyEnforcer {
    pub fn new(thresholds: PolicyThresholds) -> Self {
        PolicyEnforcer {
            thresholds,
            accounts: DashMap::new(),
            domains: DashMap::new(),
        }
    }

    /// Record one delivery attempt against both the account and the recipient
    /// domain, re-evaluating each track record immediately.
    pub fn record(
        &self,
        account_id: AccountId,
        domain: &str,
        observation: Observation,
        now: DateTime<Utc>,
    ) {
        {
            let mut record = self
                .accounts
                .entry(account_id)
                .or_insert_with(TrackRecord::new);
            record.events.push_back((now, observation));
            self.evaluate(&mut record, now, &format!("account {account_id}"));
        }
        if !domain.is_empty() {
            let mut record = self
                .domains
                .entry(domain.to_string())
                .or_insert_with(TrackRecord::new);
            record.events.push_back((now, observation));
            self.evaluate(&mut record, now, &format!("domain {domain}"));
        }
    }

    fn evaluate(&self, record: &mut TrackRecord, now: DateTime<Utc>, subject: &str) {
        record.prune(now, self.thresholds.window);

        // Expire a lapsed pause before re-evaluating.
        if let ReputationState::Paused { until, .. } = &record.state {
            if now >= *until {
                record.state = ReputationState::Active;
            }
        }
        if matches!(record.state, ReputationState::Blocked { .. }) {
            return;
        }

        let (total, bounce_rate, complaint_rate) = record.rates();
        if total < self.thresholds.min_sample {
            return;
        }
        let worst = bounce_rate.max(complaint_rate);
        let reason = if bounce_rate >= complaint_rate {
            format!("bounce rate {:.1}% over {total} attempts", bounce_rate * 100.0)
        } else {
            format!(
                "complaint rate {:.1}% over {total} attempts",
                complaint_rate * 100.0
            )
        };

        if worst >= self.thresholds.block_rate {
            record.state = ReputationState::Blocked { reason };
            counter!("broadside_policy_blocked_total").increment(1);
            tracing::error!(subject, bounce_rate, complaint_rate, "Reputation block imposed");
        } else if worst >= self.thresholds.pause_rate {
            if !matches!(record.state, ReputationState::Paused { .. }) {
                record.state = ReputationState::Paused {
                    until: now + self.thresholds.pause_duration,
                    reason,
                };
                counter!("broadside_policy_paused_total").increment(1);
                tracing::warn!(subject, bounce_rate, complaint_rate, "Reputation pause imposed");
            }
        } else if worst >= self.thresholds.warn_rate {
            if record.state == ReputationState::Active {
                record.state = ReputationState::Warned;
                tracing::warn!(subject, bounce_rate, complaint_rate, "Reputation warning");
            }
        } else if record.state == ReputationState::Warned {
            record.state = ReputationState::Active;
        }
    }

    /// Current standing of an account. Lapsed pauses read as `Active`.
    pub fn account_state(&self, account_id: AccountId, now: DateTime<Utc>) -> ReputationState {
        self.state_of(self.accounts.get(&account_id).map(|r| r.state.clone()), now)
    }

    /// Current standing of a recipient domain.
    pub fn domain_state(&self, domain: &str, now: DateTime<Utc>) -> ReputationState {
        self.state_of(self.domains.get(domain).map(|r| r.state.clone()), now)
    }

    fn state_of(&self, state: Option<ReputationState>, now: DateTime<Utc>) -> ReputationState {
        match state {
            Some(ReputationState::Paused { until, .. }) if now >= until => ReputationState::Active,
            Some(state) => state,
            None => ReputationState::Active,
        }
    }

    /// Domains that must be excluded from claiming right now.
    pub fn unsendable_domains(&self, now: DateTime<Utc>) -> Vec<String> {
        self.domains
            .iter()
            .filter(|entry| !entry.value().state.is_sendable(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Operator override: lift an account's pause or block and drop its
    /// window, giving it a fresh track record.
    pub fn clear(&self, account_id: AccountId) {
        if let Some(mut record) = self.accounts.get_mut(&account_id) {
            record.state = ReputationState::Active;
            record.events.clear();
            tracing::info!(account_id = %account_id, "Reputation state cleared by operator");
        }
    }

    /// Operator override for a domain.
    pub fn clear_domain(&self, domain: &str) {
        if let Some(mut record) = self.domains.get_mut(domain) {
            record.state = ReputationState::Active;
            record.events.clear();
            tracing::info!(domain, "Domain reputation cleared by operator");
        }
    }

    pub fn account_snapshot(&self, account_id: AccountId, now: DateTime<Utc>) -> ReputationSnapshot {
        match self.accounts.get_mut(&account_id) {
            Some(mut record) => {
                record.prune(now, self.thresholds.window);
                let (attempts, bounce_rate, complaint_rate) = record.rates();
                ReputationSnapshot {
                    state: self.state_of(Some(record.state.clone()), now),
                    attempts,
                    bounce_rate,
                    complaint_rate,
                }
            }
            None => ReputationSnapshot {
                state: ReputationState::Active,
                attempts: 0,
                bounce_rate: 0.0,
                complaint_rate: 0.0,
            },
        }
    }
}

impl Default for PolicyEnforcer {
    fn default() -> Self {
        Self::new(PolicyThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::default()
    }

    fn account() -> AccountId {
        AccountId(Uuid::new_v4())
    }

    #[test]
    fn small_samples_never_bind() {
        let policy = enforcer();
        let id = account();
        let now = Utc::now();

        // 5 bounces out of 5 is 100%, but below the minimum sample.
        for _ in 0..5 {
            policy.record(id, "dest.example", Observation::Bounced, now);
        }
        assert_eq!(policy.account_state(id, now), ReputationState::Active);
    }

    #[test]
    fn warn_then_pause_then_block() {
        let policy = enforcer();
        let id = account();
        let now = Utc::now();

        // 97 deliveries + 3 bounces = 3% -> warned.
        for _ in 0..97 {
            policy.record(id, "a.example", Observation::Delivered, now);
        }
        for _ in 0..3 {
            policy.record(id, "a.example", Observation::Bounced, now);
        }
        assert_eq!(policy.account_state(id, now), ReputationState::Warned);

        // Up to 6% -> paused.
        for _ in 0..3 {
            policy.record(id, "a.example", Observation::Bounced, now);
        }
        assert!(matches!(
            policy.account_state(id, now),
            ReputationState::Paused { .. }
        ));

        // Keep bouncing past 20% -> blocked, and it stays blocked.
        for _ in 0..20 {
            policy.record(id, "a.example", Observation::Bounced, now);
        }
        assert!(matches!(
            policy.account_state(id, now),
            ReputationState::Blocked { .. }
        ));
        policy.record(id, "a.example", Observation::Delivered, now);
        assert!(matches!(
            policy.account_state(id, now),
            ReputationState::Blocked { .. }
        ));
    }

    #[test]
    fn sidelined_states_name_the_tripped_rate() {
        let policy = enforcer();
        let id = account();
        let now = Utc::now();

        // 9 deliveries + 1 complaint = 10% complaints -> paused, and the
        // state says which rate did it.
        for _ in 0..9 {
            policy.record(id, "e.example", Observation::Delivered, now);
        }
        policy.record(id, "e.example", Observation::Complained, now);
        match policy.account_state(id, now) {
            ReputationState::Paused { reason, .. } => {
                assert!(reason.contains("complaint rate"), "got: {reason}");
                assert!(reason.contains("10 attempts"), "got: {reason}");
            }
            other => panic!("expected a pause, got {other:?}"),
        }

        // Pile on bounces until the block trips; the reason switches to the
        // bounce rate, which is now the worse of the two.
        for _ in 0..5 {
            policy.record(id, "e.example", Observation::Bounced, now);
        }
        match policy.account_state(id, now) {
            ReputationState::Blocked { reason } => {
                assert!(reason.contains("bounce rate"), "got: {reason}");
            }
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[test]
    fn pause_expires_on_its_own() {
        let policy = enforcer();
        let id = account();
        let now = Utc::now();

        for _ in 0..9 {
            policy.record(id, "b.example", Observation::Delivered, now);
        }
        policy.record(id, "b.example", Observation::Complained, now);
        // 10% complaints -> paused for 24h.
        assert!(!policy.account_state(id, now).is_sendable(now));

        let later = now + Duration::hours(25);
        assert_eq!(policy.account_state(id, later), ReputationState::Active);
    }

    #[test]
    fn domain_tracked_independently_of_account() {
        let policy = enforcer();
        let a = account();
        let b = account();
        let now = Utc::now();

        // Two healthy accounts both hammer one bad domain.
        for _ in 0..50 {
            policy.record(a, "sketchy.example", Observation::Delivered, now);
            policy.record(b, "sketchy.example", Observation::Delivered, now);
        }
        for _ in 0..7 {
            policy.record(a, "sketchy.example", Observation::Bounced, now);
        }

        // The domain sits at ~6.5% bounces and account a at ~12% -> both
        // paused. Account b saw no bounces and stays active.
        assert!(matches!(
            policy.account_state(a, now),
            ReputationState::Paused { .. }
        ));
        assert_eq!(policy.account_state(b, now), ReputationState::Active);
        assert!(matches!(
            policy.domain_state("sketchy.example", now),
            ReputationState::Paused { .. }
        ));
        assert_eq!(policy.unsendable_domains(now), vec!["sketchy.example".to_string()]);
    }

    #[test]
    fn operator_clear_lifts_a_block() {
        let policy = enforcer();
        let id = account();
        let now = Utc::now();

        for _ in 0..10 {
            policy.record(id, "c.example", Observation::Bounced, now);
        }
        assert!(matches!(
            policy.account_state(id, now),
            ReputationState::Blocked { .. }
        ));

        policy.clear(id);
        assert_eq!(policy.account_state(id, now), ReputationState::Active);
        let snapshot = policy.account_snapshot(id, now);
        assert_eq!(snapshot.attempts, 0);
    }

    #[test]
    fn old_events_age_out_of_the_window() {
        let policy = enforcer();
        let id = account();
        let start = Utc::now();

        for _ in 0..10 {
            policy.record(id, "d.example", Observation::Bounced, start);
        }
        assert!(matches!(
            policy.account_state(id, start),
            ReputationState::Blocked { .. }
        ));
        policy.clear(id);

        // A day later the bounces are gone; fresh deliveries dominate.
        let later = start + Duration::hours(25);
        for _ in 0..10 {
            policy.record(id, "d.example", Observation::Delivered, later);
        }
        let snapshot = policy.account_snapshot(id, later);
        assert_eq!(snapshot.attempts, 10);
        assert_eq!(snapshot.bounce_rate, 0.0);
    }
}
