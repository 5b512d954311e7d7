//! Sending-account profiles: identity, SMTP credentials, provider families
//! with their default rate ceilings, and warmup state.
//!
//! Accounts are owned by the registry (the `accounts` table); the warmup
//! scheduler and rate limiter mutate the counter columns after each send.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a sending account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for AccountId {
    fn from(uuid: Uuid) -> Self {
        AccountId(uuid)
    }
}

impl std::ops::Deref for AccountId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Per-provider default rate ceilings (emails per window).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCeilings {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

/// Provider family of a sending account.
///
/// Large public webmail providers get stricter default ceilings than generic
/// SMTP relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    Yahoo,
    Generic,
}

impl Provider {
    /// Infer the provider family from the account's login address.
    pub fn from_address(address: &str) -> Self {
        let lower = address.to_lowercase();
        if lower.ends_with("gmail.com") {
            Provider::Gmail
        } else if lower.ends_with("outlook.com")
            || lower.ends_with("hotmail.com")
            || lower.ends_with("live.com")
        {
            Provider::Outlook
        } else if lower.ends_with("yahoo.com") || lower.ends_with("ymail.com") {
            Provider::Yahoo
        } else {
            Provider::Generic
        }
    }

    /// Default ceilings for this provider family.
    pub fn default_ceilings(&self) -> RateCeilings {
        match self {
            Provider::Gmail => RateCeilings {
                per_minute: 2,
                per_hour: 10,
                per_day: 90,
            },
            Provider::Outlook => RateCeilings {
                per_minute: 5,
                per_hour: 30,
                per_day: 250,
            },
            Provider::Yahoo => RateCeilings {
                per_minute: 3,
                per_hour: 15,
                per_day: 100,
            },
            Provider::Generic => RateCeilings {
                per_minute: 10,
                per_hour: 50,
                per_day: 200,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
            Provider::Yahoo => "yahoo",
            Provider::Generic => "generic",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(Provider::Gmail),
            "outlook" => Ok(Provider::Outlook),
            "yahoo" => Ok(Provider::Yahoo),
            "generic" => Ok(Provider::Generic),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// SMTP connection credentials for an account.
///
/// Opaque to the engine core; only the mailer interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
}

/// A sending account with its rate and warmup state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingAccount {
    pub id: AccountId,
    pub label: String,
    pub credentials: SmtpCredentials,
    pub provider: Provider,
    /// Static hourly override; the lower of this and the provider default wins.
    pub max_per_hour: Option<u32>,
    pub is_active: bool,
    /// 0 = fully ramped; 1..N = warmup stage.
    pub warmup_stage: u32,
    pub daily_sent_count: u32,
    pub last_sent_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl SendingAccount {
    /// Build a new account, inferring the provider family from the username.
    pub fn new(label: impl Into<String>, credentials: SmtpCredentials) -> Self {
        let provider = Provider::from_address(&credentials.username);
        Self {
            id: AccountId(Uuid::new_v4()),
            label: label.into(),
            credentials,
            provider,
            max_per_hour: None,
            is_active: true,
            warmup_stage: 0,
            daily_sent_count: 0,
            last_sent_date: None,
            created_at: Utc::now(),
        }
    }

    /// Effective hourly ceiling: the lower of the static override and the
    /// provider default.
    pub fn effective_hourly_ceiling(&self) -> u32 {
        let provider_hourly = self.provider.default_ceilings().per_hour;
        match self.max_per_hour {
            Some(cap) => cap.min(provider_hourly),
            None => provider_hourly,
        }
    }

    /// True if the account is still in its ramp-up period.
    pub fn is_warming_up(&self) -> bool {
        self.warmup_stage > 0
    }
}
