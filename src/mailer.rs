//! SMTP delivery abstraction.
//!
//! This module defines the `Mailer` trait to abstract the actual SMTP
//! conversation, enabling testability with mock implementations. Errors come
//! back pre-classified as [`FailureKind`] so the worker loop can decide retry
//! vs terminal failure without inspecting transport internals.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::account::{AccountId, SendingAccount};
use crate::envelope::FailureKind;

/// One message ready to go out: the routing data plus rendered content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Positive completion from the receiving server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// SMTP reply code, normally 250.
    pub code: u16,
    pub message: String,
}

pub type SendResult = std::result::Result<DeliveryReceipt, FailureKind>;

/// Trait for delivering a message through a sending account.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the worker loop testable without a live SMTP server.
#[async_trait]
pub trait Mailer: Send + Sync + Clone {
    /// Deliver `message` through `account`'s SMTP credentials.
    ///
    /// Failures are classified: 4xx and connection-level problems are
    /// transient, 5xx and address problems are permanent.
    async fn send(&self, account: &SendingAccount, message: &OutboundMessage) -> SendResult;
}

// ============================================================================
// Production Implementation using lettre
// ============================================================================

/// Production mailer speaking SMTP via lettre's async transport.
///
/// Transports are built per call from the account's credentials; accounts are
/// few and sends are paced, so there is nothing worth pooling here.
#[derive(Clone)]
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn transport(
        &self,
        account: &SendingAccount,
    ) -> std::result::Result<AsyncSmtpTransport<Tokio1Executor>, FailureKind> {
        let creds = Credentials::new(
            account.credentials.username.clone(),
            account.credentials.password.clone(),
        );
        let builder = if account.credentials.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.credentials.host)
                .map_err(|e| FailureKind::Connection {
                    detail: format!("TLS setup for {}: {e}", account.credentials.host),
                })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.credentials.host)
        };
        Ok(builder
            .port(account.credentials.port)
            .credentials(creds)
            .timeout(Some(self.timeout))
            .build())
    }
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[tracing::instrument(skip(self, account, message), fields(account_id = %account.id, to = %message.to))]
    async fn send(&self, account: &SendingAccount, message: &OutboundMessage) -> SendResult {
        let from = account
            .credentials
            .username
            .parse()
            .map_err(|e| FailureKind::Connection {
                detail: format!("sender address {}: {e}", account.credentials.username),
            })?;
        let to = message.to.parse().map_err(|e| FailureKind::InvalidRecipient {
            detail: format!("{}: {e}", message.to),
        })?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| FailureKind::InvalidRecipient {
                detail: format!("message build failed: {e}"),
            })?;

        let transport = self.transport(account)?;

        tracing::debug!(host = %account.credentials.host, "Opening SMTP conversation");
        match transport.send(email).await {
            Ok(response) => {
                let code = response.code();
                tracing::info!(code = %code, "Message accepted by receiving server");
                Ok(DeliveryReceipt {
                    code: smtp_code_to_u16(&code),
                    message: response.message().collect::<Vec<_>>().join(" "),
                })
            }
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }
}

fn smtp_code_to_u16(code: &lettre::transport::smtp::response::Code) -> u16 {
    // Code renders as its three digits ("250").
    code.to_string().parse().unwrap_or(0)
}

fn classify_smtp_error(error: &lettre::transport::smtp::Error) -> FailureKind {
    let code = error
        .status()
        .map(|c| smtp_code_to_u16(&c))
        .unwrap_or_default();
    let detail = error.to_string();

    if error.is_timeout() {
        FailureKind::Timeout
    } else if error.is_permanent() {
        FailureKind::PermanentSmtp { code, detail }
    } else if error.is_transient() {
        FailureKind::TransientSmtp { code, detail }
    } else {
        FailureKind::Connection { detail }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Mock mailer for testing.
///
/// Allows configuring predetermined outcomes per recipient address without
/// talking to a real SMTP server.
///
/// # Example
/// ```ignore
/// let mock = MockMailer::new();
/// mock.add_response("alice@dest.example", Ok(DeliveryReceipt { code: 250, message: "Ok".into() }));
/// ```
#[derive(Clone)]
pub struct MockMailer {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockSend>>>,
    in_flight: Arc<AtomicUsize>,
    /// Fallback when no scripted response matches; defaults to 250 Ok.
    default_response: Arc<Mutex<SendResult>>,
}

/// A mock outcome that can optionally wait for a trigger before completing.
enum MockResponse {
    Immediate(SendResult),
    /// Waits for a trigger signal before completing.
    Triggered {
        response: SendResult,
        trigger: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    },
}

/// Record of a send made through the mock mailer.
#[derive(Debug, Clone)]
pub struct MockSend {
    pub account_id: AccountId,
    pub account_username: String,
    pub to: String,
    pub subject: String,
}

impl MockMailer {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            default_response: Arc::new(Mutex::new(Ok(DeliveryReceipt {
                code: 250,
                message: "Ok".to_string(),
            }))),
        }
    }

    /// Script an outcome for a recipient address. Multiple outcomes for the
    /// same address are returned in FIFO order.
    pub fn add_response(&self, to: &str, response: SendResult) {
        self.responses
            .lock()
            .entry(to.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Script an outcome that blocks until the returned sender is triggered
    /// (by sending `()` or dropping it).
    pub fn add_response_with_trigger(&self, to: &str, response: SendResult) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(to.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: Arc::new(Mutex::new(Some(rx))),
            });
        tx
    }

    /// Change the fallback outcome for unscripted recipients.
    pub fn set_default_response(&self, response: SendResult) {
        *self.default_response.lock() = response;
    }

    /// All sends made through this mock, in order.
    pub fn get_sends(&self) -> Vec<MockSend> {
        self.calls.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sends currently executing. Useful for testing cancellation: an aborted
    /// send drops out of this count.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, account: &SendingAccount, message: &OutboundMessage) -> SendResult {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        // Guard so the counter drops even if the task is cancelled mid-await.
        let in_flight = self.in_flight.clone();
        let _guard = InFlightGuard { in_flight };

        self.calls.lock().push(MockSend {
            account_id: account.id,
            account_username: account.credentials.username.clone(),
            to: message.to.clone(),
            subject: message.subject.clone(),
        });

        let mock_response = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&message.to) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                let rx = trigger.lock().take();
                if let Some(rx) = rx {
                    // Proceed whether triggered or dropped.
                    let _ = rx.await;
                }
                response
            }
            None => self.default_response.lock().clone(),
        }
    }
}

/// Guard that decrements the in-flight counter when dropped.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::SmtpCredentials;

    fn account() -> SendingAccount {
        SendingAccount::new(
            "mock-sender",
            SmtpCredentials {
                host: "smtp.example.com".to_string(),
                port: 587,
                username: "sender@example.com".to_string(),
                password: "hunter2".to_string(),
                use_tls: true,
            },
        )
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.to_string(),
            subject: "hello".to_string(),
            body: "body".to_string(),
        }
    }

    #[tokio::test]
    async fn scripted_responses_are_fifo() {
        let mock = MockMailer::new();
        mock.add_response(
            "a@dest.example",
            Err(FailureKind::TransientSmtp {
                code: 421,
                detail: "busy".to_string(),
            }),
        );
        mock.add_response(
            "a@dest.example",
            Ok(DeliveryReceipt {
                code: 250,
                message: "Ok".to_string(),
            }),
        );

        let account = account();
        let first = mock.send(&account, &message("a@dest.example")).await;
        assert!(matches!(first, Err(FailureKind::TransientSmtp { code: 421, .. })));

        let second = mock.send(&account, &message("a@dest.example")).await;
        assert_eq!(second.unwrap().code, 250);

        let sends = mock.get_sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].account_id, account.id);
        assert_eq!(sends[0].to, "a@dest.example");
    }

    #[tokio::test]
    async fn unscripted_recipient_gets_the_default() {
        let mock = MockMailer::new();
        let ok = mock.send(&account(), &message("anyone@dest.example")).await;
        assert_eq!(ok.unwrap().code, 250);

        mock.set_default_response(Err(FailureKind::Connection {
            detail: "refused".to_string(),
        }));
        let err = mock.send(&account(), &message("anyone@dest.example")).await;
        assert!(matches!(err, Err(FailureKind::Connection { .. })));
    }

    #[tokio::test]
    async fn triggered_response_blocks_until_released() {
        let mock = MockMailer::new();
        let trigger = mock.add_response_with_trigger(
            "slow@dest.example",
            Ok(DeliveryReceipt {
                code: 250,
                message: "Ok".to_string(),
            }),
        );

        let mock_clone = mock.clone();
        let account = account();
        let handle = tokio::spawn(async move {
            mock_clone.send(&account, &message("slow@dest.example")).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(mock.in_flight_count(), 0);
    }
}
