use broadside::engine::{CampaignContent, DispatchConfig, Dispatcher, EngineState};
use broadside::envelope::{EnvelopeStatus, FailureKind};
use broadside::mailer::{DeliveryReceipt, MockMailer};
use broadside::planner::{PlanRequest, Recipient, plan_distribution};
use broadside::storage::{DeliveryOutcome, SqliteStore, Storage};
use broadside::{CampaignId, SendingAccount, SmtpCredentials};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn account(label: &str) -> SendingAccount {
    SendingAccount::new(
        label,
        SmtpCredentials {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: format!("{label}@example.com"),
            password: "hunter2".to_string(),
            use_tls: true,
        },
    )
}

fn recipients(n: usize) -> Vec<Recipient> {
    (0..n)
        .map(|i| Recipient::new(format!("user{i}@dest.example")))
        .collect()
}

fn content() -> CampaignContent {
    CampaignContent {
        subject: "launch".to_string(),
        body: "hello there".to_string(),
    }
}

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        workers: 2,
        claim_interval_ms: 10, // Very fast for testing
        max_retries: 3,
        backoff_ms: 10,
        backoff_factor: 2,
        max_backoff_ms: 100,
        send_timeout_ms: 5000,
        status_log_interval_ms: None, // Disable status logging in tests
        pace_warming_accounts: false,
        ..Default::default()
    }
}

async fn seed_accounts(store: &SqliteStore, n: usize) -> Vec<SendingAccount> {
    let mut accounts = Vec::new();
    for i in 0..n {
        let account = account(&format!("acct-{i}"));
        store.upsert_account(&account).await.unwrap();
        accounts.push(account);
    }
    accounts
}

async fn wait_for_sent(store: &SqliteStore, campaign: CampaignId, expected: u64) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        let counts = store.campaign_counts(campaign).await.unwrap();
        if counts.get(&EnvelopeStatus::Sent) == Some(&expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[test]
fn plan_distributes_eighty_recipients_across_four_accounts() {
    let accounts: Vec<_> = (0..4).map(|i| account(&format!("acct-{i}"))).collect();
    let request = PlanRequest {
        campaign_id: CampaignId(uuid::Uuid::new_v4()),
        emails_per_account: 20,
        priority: 0,
    };

    let plan = plan_distribution(&request, &recipients(80), &accounts).unwrap();

    assert_eq!(plan.summary.planned, 80);
    assert_eq!(plan.summary.overflow, 0);
    assert_eq!(plan.summary.per_account.len(), 4);
    assert!(plan.summary.per_account.values().all(|&n| n == 20));

    // Contiguous blocks per account, in recipient order.
    for (i, envelope) in plan.envelopes.iter().enumerate() {
        assert_eq!(envelope.account_id, accounts[i / 20].id);
    }
}

#[sqlx::test]
#[test_log::test]
async fn campaign_flows_from_plan_through_ledger(pool: sqlx::SqlitePool) {
    let store = Arc::new(SqliteStore::from_pool(pool));
    let mailer = Arc::new(MockMailer::new());
    let accounts = seed_accounts(&store, 4).await;
    let ids: Vec<_> = accounts.iter().map(|a| a.id).collect();

    let engine = Arc::new(Dispatcher::new(
        store.clone(),
        mailer.clone(),
        fast_config(),
        CancellationToken::new(),
    ));

    let (campaign, summary) = engine
        .launch_campaign(content(), &recipients(32), &ids, 8, 0)
        .await
        .unwrap();
    assert_eq!(summary.planned, 32);
    assert_eq!(summary.overflow, 0);

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    assert!(wait_for_sent(&store, campaign, 32).await, "campaign never drained");

    // Completion matches the plan: every account delivered exactly its block.
    let per_account = store.sent_by_account(campaign).await.unwrap();
    for account in &accounts {
        assert_eq!(per_account.get(&account.id), Some(&8));
    }

    // Each send went out through the credentials of its assigned account.
    for send in mailer.get_sends() {
        let account = accounts.iter().find(|a| a.id == send.account_id).unwrap();
        assert_eq!(send.account_username, account.credentials.username);
        assert_eq!(send.subject, "launch");
    }

    let status = engine.status().await.unwrap();
    assert_eq!(status.sent, 32);
    assert_eq!(status.failed, 0);
    assert_eq!(status.queue_depth, 0);

    engine.stop();
    handle.await.unwrap().unwrap();
}

#[sqlx::test]
async fn mixed_outcomes_settle_without_cross_talk(pool: sqlx::SqlitePool) {
    let store = Arc::new(SqliteStore::from_pool(pool));
    let mailer = Arc::new(MockMailer::new());
    let accounts = seed_accounts(&store, 2).await;
    let ids: Vec<_> = accounts.iter().map(|a| a.id).collect();

    // user0 hard-bounces, user1 greylists once then lands, the rest go clean.
    mailer.add_response(
        "user0@dest.example",
        Err(FailureKind::PermanentSmtp {
            code: 550,
            detail: "no such user".to_string(),
        }),
    );
    mailer.add_response(
        "user1@dest.example",
        Err(FailureKind::TransientSmtp {
            code: 451,
            detail: "greylisted".to_string(),
        }),
    );

    let engine = Arc::new(Dispatcher::new(
        store.clone(),
        mailer.clone(),
        fast_config(),
        CancellationToken::new(),
    ));
    let (campaign, _) = engine
        .launch_campaign(content(), &recipients(8), &ids, 4, 0)
        .await
        .unwrap();

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    assert!(wait_for_sent(&store, campaign, 7).await, "clean sends never settled");

    let counts = store.campaign_counts(campaign).await.unwrap();
    assert_eq!(counts.get(&EnvelopeStatus::Sent), Some(&7));
    assert_eq!(counts.get(&EnvelopeStatus::Failed), Some(&1));

    // The bounce is on user0's assigned account only.
    let now = chrono::Utc::now();
    let window = (now - chrono::Duration::hours(1), now + chrono::Duration::seconds(1));
    let bounced_a = store
        .delivery_count(ids[0], Some(DeliveryOutcome::Bounced), window.0, window.1)
        .await
        .unwrap();
    let bounced_b = store
        .delivery_count(ids[1], Some(DeliveryOutcome::Bounced), window.0, window.1)
        .await
        .unwrap();
    assert_eq!(bounced_a + bounced_b, 1);

    // 8 envelopes, one retried once, one bounced without retry.
    assert_eq!(mailer.send_count(), 9);

    engine.stop();
    handle.await.unwrap().unwrap();
}

#[sqlx::test]
async fn overflow_recipients_are_reported_not_queued(pool: sqlx::SqlitePool) {
    let store = Arc::new(SqliteStore::from_pool(pool));
    let mailer = Arc::new(MockMailer::new());
    let accounts = seed_accounts(&store, 2).await;
    let ids: Vec<_> = accounts.iter().map(|a| a.id).collect();

    let engine = Arc::new(Dispatcher::new(
        store.clone(),
        mailer.clone(),
        fast_config(),
        CancellationToken::new(),
    ));
    let (campaign, summary) = engine
        .launch_campaign(content(), &recipients(13), &ids, 5, 0)
        .await
        .unwrap();
    assert_eq!(summary.planned, 10);
    assert_eq!(summary.overflow, 3);

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    assert!(wait_for_sent(&store, campaign, 10).await);
    assert_eq!(mailer.send_count(), 10);

    engine.stop();
    handle.await.unwrap().unwrap();
}

#[sqlx::test]
async fn duplicate_completion_reports_are_ignored(pool: sqlx::SqlitePool) {
    use broadside::envelope::WorkerId;

    let store = SqliteStore::from_pool(pool);
    let account = account("solo");
    store.upsert_account(&account).await.unwrap();

    let request = PlanRequest {
        campaign_id: CampaignId(uuid::Uuid::new_v4()),
        emails_per_account: 1,
        priority: 0,
    };
    let plan = plan_distribution(&request, &recipients(1), std::slice::from_ref(&account)).unwrap();
    store.enqueue(&plan.envelopes).await.unwrap();

    let now = chrono::Utc::now();
    let worker = WorkerId(uuid::Uuid::new_v4());
    let claimed = store
        .claim_next(worker, &[account.id], &[], now)
        .await
        .unwrap()
        .unwrap();

    // Two workers racing to settle the same envelope: the first write wins,
    // the duplicate is a no-op.
    let winner = claimed.clone().succeed(&store, now).await.unwrap();
    assert!(winner.is_some());
    let duplicate = claimed
        .fail(
            FailureKind::Timeout,
            &store,
            now + chrono::Duration::seconds(1),
        )
        .await
        .unwrap();
    assert!(duplicate.is_none());

    let stored = store.get_envelope(plan.envelopes[0].id).await.unwrap();
    assert!(stored.is_terminal());
    assert_eq!(stored.status(), EnvelopeStatus::Sent);
}

#[sqlx::test]
async fn stop_lets_in_flight_sends_finish(pool: sqlx::SqlitePool) {
    let store = Arc::new(SqliteStore::from_pool(pool));
    let mailer = Arc::new(MockMailer::new());
    let accounts = seed_accounts(&store, 1).await;
    let ids: Vec<_> = accounts.iter().map(|a| a.id).collect();

    // The first recipient's send blocks until triggered.
    let trigger = mailer.add_response_with_trigger(
        "user0@dest.example",
        Ok(DeliveryReceipt {
            code: 250,
            message: "Ok".to_string(),
        }),
    );

    let config = DispatchConfig {
        workers: 1,
        ..fast_config()
    };
    let engine = Arc::new(Dispatcher::new(
        store.clone(),
        mailer.clone(),
        config,
        CancellationToken::new(),
    ));
    let (campaign, _) = engine
        .launch_campaign(content(), &recipients(3), &ids, 3, 0)
        .await
        .unwrap();

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // Wait until the single worker is parked inside the blocked send.
    let start = tokio::time::Instant::now();
    while mailer.in_flight_count() == 0 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mailer.in_flight_count(), 1);

    engine.stop();
    trigger.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // The in-flight send completed; the two never-claimed envelopes were
    // cancelled rather than left pending.
    let counts = store.campaign_counts(campaign).await.unwrap();
    assert_eq!(counts.get(&EnvelopeStatus::Sent), Some(&1));
    assert_eq!(counts.get(&EnvelopeStatus::Failed), Some(&2));
    assert_eq!(store.queue_depth().await.unwrap(), 0);
    assert_eq!(engine.state(), EngineState::Stopped);
}
