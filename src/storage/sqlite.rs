//! SQLite-backed [`Storage`] implementation.
//!
//! Queries are plain runtime sqlx against a `SqlitePool` in WAL mode. The
//! claim is a single conditional `UPDATE ... RETURNING` wrapping a subselect,
//! so claiming is atomic without an explicit transaction: two workers racing
//! on the same row means one update matches and the other sees zero rows.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::account::{AccountId, Provider, SendingAccount, SmtpCredentials};
use crate::envelope::{
    AnyEnvelope, CampaignId, Claimed, Envelope, EnvelopeData, EnvelopeId, EnvelopeState,
    EnvelopeStatus, Failed, FailureKind, Pending, RecipientId, Sent, WorkerId,
};
use crate::error::{BroadsideError, Result};
use crate::storage::{DeliveryOutcome, DeliveryRecord, EngagementKind, Storage};

/// SQLite repository for the whole engine.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url`, switch on WAL, and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests hand one in with migrations applied).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_uuid(value: &str, field: &str) -> Result<Uuid> {
    Uuid::from_str(value)
        .map_err(|e| BroadsideError::Other(anyhow::anyhow!("malformed {field} uuid: {e}")))
}

fn parse_status(value: &str) -> Result<EnvelopeStatus> {
    match value {
        "pending" => Ok(EnvelopeStatus::Pending),
        "claimed" => Ok(EnvelopeStatus::Claimed),
        "sent" => Ok(EnvelopeStatus::Sent),
        "failed" => Ok(EnvelopeStatus::Failed),
        other => Err(BroadsideError::Other(anyhow::anyhow!(
            "unknown envelope status '{other}'"
        ))),
    }
}

fn data_from_row(row: &SqliteRow) -> Result<EnvelopeData> {
    Ok(EnvelopeData {
        id: EnvelopeId(parse_uuid(&row.try_get::<String, _>("id")?, "envelope")?),
        campaign_id: CampaignId(parse_uuid(&row.try_get::<String, _>("campaign_id")?, "campaign")?),
        recipient_id: RecipientId(parse_uuid(
            &row.try_get::<String, _>("recipient_id")?,
            "recipient",
        )?),
        recipient_email: row.try_get("recipient_email")?,
        recipient_domain: row.try_get("recipient_domain")?,
        account_id: AccountId(parse_uuid(&row.try_get::<String, _>("account_id")?, "account")?),
        priority: row.try_get::<i64, _>("priority")? as i32,
    })
}

fn envelope_from_row(row: &SqliteRow) -> Result<AnyEnvelope> {
    let data = data_from_row(row)?;
    let status = parse_status(&row.try_get::<String, _>("status")?)?;
    let attempt = row.try_get::<i64, _>("attempt")? as u32;

    let envelope = match status {
        EnvelopeStatus::Pending => AnyEnvelope::Pending(Envelope {
            data,
            state: Pending {
                attempt,
                not_before: row.try_get("not_before")?,
            },
        }),
        EnvelopeStatus::Claimed => AnyEnvelope::Claimed(Envelope {
            data,
            state: Claimed {
                worker_id: WorkerId(parse_uuid(
                    &row.try_get::<String, _>("worker_id")?,
                    "worker",
                )?),
                claimed_at: row.try_get("claimed_at")?,
                attempt,
            },
        }),
        EnvelopeStatus::Sent => AnyEnvelope::Sent(Envelope {
            data,
            state: Sent {
                sent_at: row.try_get("sent_at")?,
                attempt,
            },
        }),
        EnvelopeStatus::Failed => {
            let raw: Option<String> = row.try_get("last_error")?;
            let reason = raw
                .as_deref()
                .and_then(|s| serde_json::from_str::<FailureKind>(s).ok())
                .unwrap_or(FailureKind::Cancelled);
            AnyEnvelope::Failed(Envelope {
                data,
                state: Failed {
                    reason,
                    failed_at: row.try_get("failed_at")?,
                    attempt,
                },
            })
        }
    };
    Ok(envelope)
}

fn account_from_row(row: &SqliteRow) -> Result<SendingAccount> {
    let provider: String = row.try_get("provider")?;
    let last_sent_date: Option<String> = row.try_get("last_sent_date")?;
    Ok(SendingAccount {
        id: AccountId(parse_uuid(&row.try_get::<String, _>("id")?, "account")?),
        label: row.try_get("label")?,
        credentials: SmtpCredentials {
            host: row.try_get("host")?,
            port: row.try_get::<i64, _>("port")? as u16,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            use_tls: row.try_get("use_tls")?,
        },
        provider: Provider::from_str(&provider)
            .map_err(|e| BroadsideError::Other(anyhow::anyhow!(e)))?,
        max_per_hour: row
            .try_get::<Option<i64>, _>("max_per_hour")?
            .map(|v| v as u32),
        is_active: row.try_get("is_active")?,
        warmup_stage: row.try_get::<i64, _>("warmup_stage")? as u32,
        daily_sent_count: row.try_get::<i64, _>("daily_sent_count")? as u32,
        last_sent_date: last_sent_date
            .as_deref()
            .map(|s| {
                NaiveDate::from_str(s).map_err(|e| {
                    BroadsideError::Other(anyhow::anyhow!("malformed last_sent_date: {e}"))
                })
            })
            .transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Storage for SqliteStore {
    async fn enqueue(&self, envelopes: &[EnvelopeData]) -> Result<usize> {
        if envelopes.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        // Stay well under sqlite's bind-parameter limit.
        for chunk in envelopes.chunks(500) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO envelopes (id, campaign_id, recipient_id, recipient_email, \
                 recipient_domain, account_id, priority, status, attempt, created_at) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.id.0.to_string())
                    .push_bind(e.campaign_id.0.to_string())
                    .push_bind(e.recipient_id.0.to_string())
                    .push_bind(e.recipient_email.clone())
                    .push_bind(e.recipient_domain.clone())
                    .push_bind(e.account_id.0.to_string())
                    .push_bind(e.priority)
                    .push_bind("pending")
                    .push_bind(0i64)
                    .push_bind(now);
            });
            qb.build().execute(&self.pool).await?;
        }
        tracing::debug!(count = envelopes.len(), "Enqueued envelopes");
        Ok(envelopes.len())
    }

    async fn claim_next(
        &self,
        worker_id: WorkerId,
        eligible_accounts: &[AccountId],
        excluded_domains: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Envelope<Claimed>>> {
        if eligible_accounts.is_empty() {
            return Ok(None);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE envelopes SET status = 'claimed', worker_id = ");
        qb.push_bind(worker_id.0.to_string());
        qb.push(", claimed_at = ");
        qb.push_bind(now);
        qb.push(" WHERE id = (SELECT id FROM envelopes WHERE status = 'pending' AND account_id IN (");
        {
            let mut sep = qb.separated(", ");
            for account in eligible_accounts {
                sep.push_bind(account.0.to_string());
            }
        }
        qb.push(")");
        if !excluded_domains.is_empty() {
            qb.push(" AND recipient_domain NOT IN (");
            let mut sep = qb.separated(", ");
            for domain in excluded_domains {
                sep.push_bind(domain.clone());
            }
            qb.push(")");
        }
        qb.push(" AND (not_before IS NULL OR not_before <= ");
        qb.push_bind(now);
        qb.push(")");
        // The caller's slice order is the rotation order.
        qb.push(" ORDER BY CASE account_id");
        for (i, account) in eligible_accounts.iter().enumerate() {
            qb.push(" WHEN ");
            qb.push_bind(account.0.to_string());
            qb.push(" THEN ");
            qb.push(i as i64);
        }
        qb.push(" END, priority DESC, created_at ASC LIMIT 1) AND status = 'pending' \
             RETURNING id, campaign_id, recipient_id, recipient_email, recipient_domain, \
             account_id, priority, attempt");

        let row = qb.build().fetch_optional(&self.pool).await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let data = data_from_row(&row)?;
        let attempt = row.try_get::<i64, _>("attempt")? as u32;
        tracing::debug!(
            envelope_id = %data.id,
            worker_id = %worker_id,
            account_id = %data.account_id,
            "Claimed envelope"
        );
        Ok(Some(Envelope {
            data,
            state: Claimed {
                worker_id,
                claimed_at: now,
                attempt,
            },
        }))
    }

    async fn persist<T: EnvelopeState + Clone>(&self, envelope: &Envelope<T>) -> Result<bool>
    where
        AnyEnvelope: From<Envelope<T>>,
    {
        let any = AnyEnvelope::from(envelope.clone());
        let result = match &any {
            AnyEnvelope::Pending(e) => {
                sqlx::query(
                    "UPDATE envelopes SET status = 'pending', attempt = ?, not_before = ?, \
                     worker_id = NULL, claimed_at = NULL \
                     WHERE id = ? AND status NOT IN ('sent', 'failed')",
                )
                .bind(e.state.attempt as i64)
                .bind(e.state.not_before)
                .bind(e.data.id.0.to_string())
                .execute(&self.pool)
                .await?
            }
            AnyEnvelope::Claimed(e) => {
                sqlx::query(
                    "UPDATE envelopes SET status = 'claimed', attempt = ?, worker_id = ?, \
                     claimed_at = ? WHERE id = ? AND status NOT IN ('sent', 'failed')",
                )
                .bind(e.state.attempt as i64)
                .bind(e.state.worker_id.0.to_string())
                .bind(e.state.claimed_at)
                .bind(e.data.id.0.to_string())
                .execute(&self.pool)
                .await?
            }
            AnyEnvelope::Sent(e) => {
                sqlx::query(
                    "UPDATE envelopes SET status = 'sent', attempt = ?, sent_at = ? \
                     WHERE id = ? AND status IN ('pending', 'claimed')",
                )
                .bind(e.state.attempt as i64)
                .bind(e.state.sent_at)
                .bind(e.data.id.0.to_string())
                .execute(&self.pool)
                .await?
            }
            AnyEnvelope::Failed(e) => {
                sqlx::query(
                    "UPDATE envelopes SET status = 'failed', attempt = ?, failed_at = ?, \
                     last_error = ? WHERE id = ? AND status IN ('pending', 'claimed')",
                )
                .bind(e.state.attempt as i64)
                .bind(e.state.failed_at)
                .bind(serde_json::to_string(&e.state.reason)?)
                .bind(e.data.id.0.to_string())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn get_envelope(&self, id: EnvelopeId) -> Result<AnyEnvelope> {
        let row = sqlx::query("SELECT * FROM envelopes WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BroadsideError::EnvelopeNotFound(id))?;
        envelope_from_row(&row)
    }

    async fn cancel_pending(&self, now: DateTime<Utc>) -> Result<u64> {
        let reason = serde_json::to_string(&FailureKind::Cancelled)?;
        let result = sqlx::query(
            "UPDATE envelopes SET status = 'failed', failed_at = ?, last_error = ? \
             WHERE status = 'pending'",
        )
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_depth(&self) -> Result<u64> {
        let depth: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM envelopes WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(depth as u64)
    }

    async fn pending_by_account(&self) -> Result<BTreeMap<AccountId, u64>> {
        let rows = sqlx::query(
            "SELECT account_id, COUNT(*) AS n FROM envelopes \
             WHERE status = 'pending' GROUP BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let id = AccountId(parse_uuid(&row.try_get::<String, _>("account_id")?, "account")?);
            counts.insert(id, row.try_get::<i64, _>("n")? as u64);
        }
        Ok(counts)
    }

    async fn campaign_counts(
        &self,
        campaign_id: CampaignId,
    ) -> Result<BTreeMap<EnvelopeStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM envelopes WHERE campaign_id = ? GROUP BY status",
        )
        .bind(campaign_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status = parse_status(&row.try_get::<String, _>("status")?)?;
            counts.insert(status, row.try_get::<i64, _>("n")? as u64);
        }
        Ok(counts)
    }

    async fn sent_by_account(&self, campaign_id: CampaignId) -> Result<BTreeMap<AccountId, u64>> {
        let rows = sqlx::query(
            "SELECT account_id, COUNT(*) AS n FROM envelopes \
             WHERE campaign_id = ? AND status = 'sent' GROUP BY account_id",
        )
        .bind(campaign_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let id = AccountId(parse_uuid(&row.try_get::<String, _>("account_id")?, "account")?);
            counts.insert(id, row.try_get::<i64, _>("n")? as u64);
        }
        Ok(counts)
    }

    async fn upsert_account(&self, account: &SendingAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, label, host, port, username, password, use_tls, provider, \
             max_per_hour, is_active, warmup_stage, daily_sent_count, last_sent_date, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET label = excluded.label, host = excluded.host, \
             port = excluded.port, username = excluded.username, password = excluded.password, \
             use_tls = excluded.use_tls, provider = excluded.provider, \
             max_per_hour = excluded.max_per_hour, is_active = excluded.is_active, \
             warmup_stage = excluded.warmup_stage, daily_sent_count = excluded.daily_sent_count, \
             last_sent_date = excluded.last_sent_date",
        )
        .bind(account.id.0.to_string())
        .bind(&account.label)
        .bind(&account.credentials.host)
        .bind(account.credentials.port as i64)
        .bind(&account.credentials.username)
        .bind(&account.credentials.password)
        .bind(account.credentials.use_tls)
        .bind(account.provider.as_str())
        .bind(account.max_per_hour.map(|v| v as i64))
        .bind(account.is_active)
        .bind(account.warmup_stage as i64)
        .bind(account.daily_sent_count as i64)
        .bind(account.last_sent_date.map(|d| d.to_string()))
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> Result<SendingAccount> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BroadsideError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    async fn list_accounts(&self) -> Result<Vec<SendingAccount>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO delivery_records (id, envelope_id, campaign_id, account_id, \
             recipient_email, outcome, detail, recorded_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.envelope_id.0.to_string())
        .bind(record.campaign_id.0.to_string())
        .bind(record.account_id.0.to_string())
        .bind(&record.recipient_email)
        .bind(record.outcome.as_str())
        .bind(record.detail.as_deref())
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delivery_count(
        &self,
        account_id: AccountId,
        outcome: Option<DeliveryOutcome>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = match outcome {
            Some(outcome) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM delivery_records WHERE account_id = ? AND outcome = ? \
                     AND recorded_at >= ? AND recorded_at < ?",
                )
                .bind(account_id.0.to_string())
                .bind(outcome.as_str())
                .bind(from)
                .bind(to)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM delivery_records WHERE account_id = ? \
                     AND recorded_at >= ? AND recorded_at < ?",
                )
                .bind(account_id.0.to_string())
                .bind(from)
                .bind(to)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count as u64)
    }

    async fn record_engagement(
        &self,
        account_id: AccountId,
        kind: EngagementKind,
        occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO engagement_events (id, account_id, kind, occurred_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account_id.0.to_string())
        .bind(kind.as_str())
        .bind(occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn engagement_count(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM engagement_events WHERE account_id = ? \
             AND occurred_at >= ? AND occurred_at < ?",
        )
        .bind(account_id.0.to_string())
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}
