//! Per-account send rate limiting over wall-clock aligned windows.
//!
//! Three windows are tracked per account: the current minute, the current
//! hour, and the current UTC day, each starting at its clock boundary (10:37
//! sends count against the 10:37:00 minute and the 10:00 hour). Counters only
//! move on [`RateLimiter::record_send`], i.e. on confirmed delivery; failed
//! attempts do not consume budget.
//!
//! Workers hold a slot via [`RateLimiter::reserve`] while a send is in
//! flight. Reservations count against every window, so two workers racing
//! the last unit of budget cannot both pass; a send that settles without
//! success gives its slot back with [`RateLimiter::release`].
//!
//! All checks take `now` as an argument so tests can drive the clock.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::account::{AccountId, SendingAccount};

/// Which window rejected a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

/// Outcome of a rate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied by `window`; budget reopens at `retry_at`.
    Denied {
        window: RateWindow,
        retry_at: DateTime<Utc>,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
struct AccountWindows {
    minute_start: DateTime<Utc>,
    minute_count: u32,
    hour_start: DateTime<Utc>,
    hour_count: u32,
    day: NaiveDate,
    day_count: u32,
    /// Sends reserved but not yet settled. Counts against every window and
    /// survives window rolls, since an in-flight send lands in whichever
    /// window it completes in.
    in_flight: u32,
}

impl AccountWindows {
    fn new(now: DateTime<Utc>) -> Self {
        AccountWindows {
            minute_start: minute_floor(now),
            minute_count: 0,
            hour_start: hour_floor(now),
            hour_count: 0,
            day: now.date_naive(),
            day_count: 0,
            in_flight: 0,
        }
    }

    fn decision(&self, per_minute: u32, hourly: u32, daily: u32) -> RateDecision {
        if self.minute_count + self.in_flight >= per_minute {
            return RateDecision::Denied {
                window: RateWindow::Minute,
                retry_at: self.minute_start + Duration::minutes(1),
            };
        }
        if self.hour_count + self.in_flight >= hourly {
            return RateDecision::Denied {
                window: RateWindow::Hour,
                retry_at: self.hour_start + Duration::hours(1),
            };
        }
        if self.day_count + self.in_flight >= daily {
            return RateDecision::Denied {
                window: RateWindow::Day,
                retry_at: next_day(self.day),
            };
        }
        RateDecision::Allowed
    }

    /// Reset any window whose clock boundary has passed.
    fn roll(&mut self, now: DateTime<Utc>) {
        let minute = minute_floor(now);
        if minute > self.minute_start {
            self.minute_start = minute;
            self.minute_count = 0;
        }
        let hour = hour_floor(now);
        if hour > self.hour_start {
            self.hour_start = hour;
            self.hour_count = 0;
        }
        let day = now.date_naive();
        if day > self.day {
            self.day = day;
            self.day_count = 0;
        }
    }
}

fn minute_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn hour_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    minute_floor(now).with_minute(0).unwrap_or(now)
}

fn next_day(day: NaiveDate) -> DateTime<Utc> {
    let tomorrow = day.succ_opt().unwrap_or(day);
    Utc.from_utc_datetime(&tomorrow.and_time(chrono::NaiveTime::MIN))
}

/// Tracks successful sends per account and enforces provider ceilings.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<AccountId, AccountWindows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advisory check whether `account` may send right now. Takes no slot.
    ///
    /// `daily_cap_override` lets the warmup scheduler impose a tighter daily
    /// budget than the provider default; the lower of the two wins.
    pub fn check(
        &self,
        account: &SendingAccount,
        daily_cap_override: Option<u32>,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let (per_minute, hourly, daily) = self.ceilings_for(account, daily_cap_override);
        let mut entry = self
            .windows
            .entry(account.id)
            .or_insert_with(|| AccountWindows::new(now));
        entry.roll(now);
        entry.decision(per_minute, hourly, daily)
    }

    /// Take a slot for one send. The slot counts against every window until
    /// [`RateLimiter::record_send`] commits it or [`RateLimiter::release`]
    /// gives it back.
    pub fn reserve(
        &self,
        account: &SendingAccount,
        daily_cap_override: Option<u32>,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let (per_minute, hourly, daily) = self.ceilings_for(account, daily_cap_override);
        let mut entry = self
            .windows
            .entry(account.id)
            .or_insert_with(|| AccountWindows::new(now));
        entry.roll(now);
        let decision = entry.decision(per_minute, hourly, daily);
        if decision.is_allowed() {
            entry.in_flight += 1;
        }
        decision
    }

    /// Give back a reserved slot after a send that did not succeed.
    pub fn release(&self, account_id: AccountId) {
        if let Some(mut entry) = self.windows.get_mut(&account_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Count one confirmed delivery against all three windows, settling the
    /// send's reservation if it held one.
    pub fn record_send(&self, account_id: AccountId, now: DateTime<Utc>) {
        let mut entry = self
            .windows
            .entry(account_id)
            .or_insert_with(|| AccountWindows::new(now));
        entry.roll(now);
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.minute_count += 1;
        entry.hour_count += 1;
        entry.day_count += 1;
    }

    fn ceilings_for(
        &self,
        account: &SendingAccount,
        daily_cap_override: Option<u32>,
    ) -> (u32, u32, u32) {
        let ceilings = account.provider.default_ceilings();
        let daily = match daily_cap_override {
            Some(cap) => ceilings.per_day.min(cap),
            None => ceilings.per_day,
        };
        (ceilings.per_minute, account.effective_hourly_ceiling(), daily)
    }

    /// Sends counted against the current day window.
    pub fn sent_today(&self, account_id: AccountId, now: DateTime<Utc>) -> u32 {
        match self.windows.get_mut(&account_id) {
            Some(mut entry) => {
                entry.roll(now);
                entry.day_count
            }
            None => 0,
        }
    }
}
