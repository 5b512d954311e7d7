//! Warmup scheduling for new sending accounts.
//!
//! A fresh account starts at stage 1 and ramps through nine stages, each with
//! a daily send cap and a jittered minimum gap between sends. Stage 0 means
//! the account has graduated: no warmup cap, only the provider rate ceilings
//! apply.
//!
//! Stage movement happens at day rollover, driven by the prior day's volume
//! and engagement (opens + replies per delivery): strong days advance, dead
//! days regress, everything else holds.

use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;

use crate::account::SendingAccount;

/// Per-stage budget: daily cap and the min/max seconds between sends.
#[derive(Debug, Clone, Copy)]
pub struct StageBudget {
    pub daily_cap: u32,
    pub gap_min_secs: u64,
    pub gap_max_secs: u64,
}

/// The ramp, stage 1 through 9.
pub const STAGES: [StageBudget; 9] = [
    StageBudget { daily_cap: 5, gap_min_secs: 300, gap_max_secs: 600 },
    StageBudget { daily_cap: 8, gap_min_secs: 240, gap_max_secs: 480 },
    StageBudget { daily_cap: 12, gap_min_secs: 180, gap_max_secs: 360 },
    StageBudget { daily_cap: 18, gap_min_secs: 120, gap_max_secs: 300 },
    StageBudget { daily_cap: 25, gap_min_secs: 90, gap_max_secs: 240 },
    StageBudget { daily_cap: 35, gap_min_secs: 60, gap_max_secs: 180 },
    StageBudget { daily_cap: 50, gap_min_secs: 45, gap_max_secs: 120 },
    StageBudget { daily_cap: 75, gap_min_secs: 30, gap_max_secs: 90 },
    StageBudget { daily_cap: 100, gap_min_secs: 20, gap_max_secs: 60 },
];

/// What happened to an account's stage at day rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageChange {
    Advanced(u32),
    /// Advanced past the final stage; warmup is over.
    Graduated,
    Held,
    Regressed(u32),
}

/// Stage-movement thresholds.
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    /// Fraction of the stage cap the prior day must reach to advance.
    pub advance_volume_ratio: f64,
    /// Minimum engagement ratio (opens + replies per delivery) to advance.
    pub advance_engagement: f64,
    /// Engagement below this regresses the account one stage.
    pub regress_engagement: f64,
    /// Regression needs at least this much prior-day volume to be meaningful.
    pub regress_min_volume: u32,
}

impl Default for WarmupScheduler {
    fn default() -> Self {
        WarmupScheduler {
            advance_volume_ratio: 0.8,
            advance_engagement: 0.05,
            regress_engagement: 0.01,
            regress_min_volume: 10,
        }
    }
}

impl WarmupScheduler {
    /// Daily cap for the account, or `None` once graduated.
    pub fn daily_allowance(&self, account: &SendingAccount) -> Option<u32> {
        budget_for(account.warmup_stage).map(|b| b.daily_cap)
    }

    /// Jittered gap to wait after a send, or `None` once graduated (the rate
    /// limiter alone paces graduated accounts).
    pub fn send_gap(&self, account: &SendingAccount) -> Option<Duration> {
        let budget = budget_for(account.warmup_stage)?;
        let secs = rand::rng().random_range(budget.gap_min_secs..=budget.gap_max_secs);
        Some(Duration::from_secs(secs))
    }

    /// Roll the account into a new day, resetting its daily counter and
    /// deciding stage movement from the prior day's numbers.
    ///
    /// No-op (returns `Held`) when the account already rolled today or has
    /// graduated.
    pub fn rollover(
        &self,
        account: &mut SendingAccount,
        today: NaiveDate,
        prior_day_volume: u32,
        engagement_ratio: f64,
    ) -> StageChange {
        if account.last_sent_date == Some(today) {
            return StageChange::Held;
        }
        account.daily_sent_count = 0;
        account.last_sent_date = Some(today);

        let Some(budget) = budget_for(account.warmup_stage) else {
            return StageChange::Held;
        };

        let volume_ok =
            f64::from(prior_day_volume) >= f64::from(budget.daily_cap) * self.advance_volume_ratio;

        let change = if volume_ok && engagement_ratio >= self.advance_engagement {
            if account.warmup_stage as usize >= STAGES.len() {
                account.warmup_stage = 0;
                StageChange::Graduated
            } else {
                account.warmup_stage += 1;
                StageChange::Advanced(account.warmup_stage)
            }
        } else if engagement_ratio < self.regress_engagement
            && prior_day_volume >= self.regress_min_volume
        {
            // Stage 1 is the floor; report a regression only when the stage
            // actually moved.
            let demoted = account.warmup_stage.saturating_sub(1).max(1);
            if demoted == account.warmup_stage {
                StageChange::Held
            } else {
                account.warmup_stage = demoted;
                StageChange::Regressed(demoted)
            }
        } else {
            StageChange::Held
        };

        match change {
            StageChange::Held => {}
            _ => tracing::info!(
                account_id = %account.id,
                stage = account.warmup_stage,
                prior_day_volume,
                engagement_ratio,
                ?change,
                "Warmup stage changed at day rollover"
            ),
        }
        change
    }
}

fn budget_for(stage: u32) -> Option<StageBudget> {
    if stage == 0 {
        return None;
    }
    STAGES.get(stage as usize - 1).copied()
}
