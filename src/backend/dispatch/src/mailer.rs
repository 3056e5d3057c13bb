//! Mail collaborator contracts: account store, transport, and renderer.
//!
//! The engine depends on these narrow interfaces only; SMTP specifics live
//! behind [`Transport`], and template rendering behind [`TemplateRenderer`].
//! An SMTP implementation over lettre is provided for production, and a
//! programmable [`MockTransport`] for testing and development.

use async_trait::async_trait;
use dashmap::DashMap;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{DispatchError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Email Accounts
// ═══════════════════════════════════════════════════════════════════════════════

/// TLS mode for an SMTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Opportunistic STARTTLS upgrade
    Starttls,
    /// Implicit TLS from the first byte
    Tls,
    /// Plaintext (local relays only)
    None,
}

impl Default for TlsMode {
    fn default() -> Self {
        Self::Starttls
    }
}

/// Credentials and connection settings for a sending account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpCredentials {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
}

fn default_smtp_port() -> u16 {
    587
}

/// A sending account resolved from the external account store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
    pub id: String,
    pub from_address: String,
    pub credentials: SmtpCredentials,
}

/// Narrow contract over the external account store.
///
/// Lookups are read-only and safely shared without synchronization.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Resolve a sending account; an unknown id is a configuration error
    /// (there is no retry benefit in looking again).
    async fn get_account(&self, id: &str) -> Result<EmailAccount>;
}

/// In-memory account store for testing and development.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<String, EmailAccount>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: EmailAccount) {
        self.accounts.insert(account.id.clone(), account);
    }

    /// Seed a plain account with the given id and from-address.
    pub fn insert_simple(&self, id: impl Into<String>, from_address: impl Into<String>) {
        let id = id.into();
        self.insert(EmailAccount {
            id: id.clone(),
            from_address: from_address.into(),
            credentials: SmtpCredentials {
                host: "localhost".to_string(),
                port: default_smtp_port(),
                username: None,
                password: None,
                tls: TlsMode::None,
            },
        });
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, id: &str) -> Result<EmailAccount> {
        self.accounts
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| DispatchError::configuration(format!("unknown email account: {}", id)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════════

/// Narrow contract over the mail transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one HTML message. Errors are transient from the engine's point
    /// of view and feed the job retry policy.
    async fn send(&self, from: &str, to: &str, subject: &str, html: &str) -> Result<()>;
}

/// Builds a transport handle from a resolved account.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self, account: &EmailAccount) -> Result<Arc<dyn Transport>>;
}

/// A factory that always hands out the same transport; useful for tests and
/// single-relay deployments.
pub struct StaticTransportFactory(pub Arc<dyn Transport>);

#[async_trait]
impl TransportFactory for StaticTransportFactory {
    async fn build(&self, _account: &EmailAccount) -> Result<Arc<dyn Transport>> {
        Ok(self.0.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SMTP Transport (lettre)
// ═══════════════════════════════════════════════════════════════════════════════

/// SMTP transport over lettre's async client.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Build a transport from account credentials.
    pub fn from_account(account: &EmailAccount) -> Result<Self> {
        let creds = &account.credentials;
        let mut builder = match creds.tls {
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&creds.host)
                .map_err(|e| {
                    DispatchError::configuration(format!(
                        "invalid SMTP relay {}: {}",
                        creds.host, e
                    ))
                })?,
            TlsMode::Tls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&creds.host).map_err(|e| {
                    DispatchError::configuration(format!(
                        "invalid SMTP relay {}: {}",
                        creds.host, e
                    ))
                })?
            }
            TlsMode::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&creds.host)
            }
        };

        builder = builder.port(creds.port);
        if let (Some(username), Some(password)) = (&creds.username, &creds.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, from: &str, to: &str, subject: &str, html: &str) -> Result<()> {
        let message = Message::builder()
            .from(from.parse::<Mailbox>().map_err(|e| {
                DispatchError::configuration(format!("invalid from address {}: {}", from, e))
            })?)
            .to(to.parse::<Mailbox>().map_err(|e| {
                DispatchError::transient_send(format!("invalid recipient address {}: {}", to, e))
            })?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| DispatchError::transient_send(format!("failed to build message: {}", e)))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| DispatchError::transient_send(e.to_string()))?;
        Ok(())
    }
}

/// Factory building one lettre transport per account.
#[derive(Default)]
pub struct SmtpTransportFactory;

#[async_trait]
impl TransportFactory for SmtpTransportFactory {
    async fn build(&self, account: &EmailAccount) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(SmtpTransport::from_account(account)?))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Template Renderer
// ═══════════════════════════════════════════════════════════════════════════════

/// Narrow contract over the template engine.
pub trait TemplateRenderer: Send + Sync {
    /// Render content against a recipient's variables.
    fn render(&self, content: &str, variables: &HashMap<String, String>) -> String;
}

/// Plain `{{key}}` substitution; anything richer belongs to the external
/// template engine.
#[derive(Debug, Default)]
pub struct PassthroughRenderer;

impl TemplateRenderer for PassthroughRenderer {
    fn render(&self, content: &str, variables: &HashMap<String, String>) -> String {
        let mut rendered = content.to_string();
        for (key, value) in variables {
            rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
        }
        rendered
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mock Transport
// ═══════════════════════════════════════════════════════════════════════════════

/// A message recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Programmable transport for testing and development.
///
/// Individual recipients can be configured to fail or to hang forever (which
/// exercises the per-send timeout).
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<SentEmail>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to this address fail with a transient error.
    pub fn fail_for(&self, email: impl Into<String>) {
        self.failing.lock().insert(email.into());
    }

    /// Make sends to this address never resolve.
    pub fn hang_for(&self, email: impl Into<String>) {
        self.hanging.lock().insert(email.into());
    }

    /// Everything successfully sent so far.
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().clone()
    }

    /// Number of successful sends so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, from: &str, to: &str, subject: &str, html: &str) -> Result<()> {
        if self.hanging.lock().contains(to) {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().contains(to) {
            return Err(DispatchError::transient_send(format!(
                "mock transport refused {}",
                to
            )));
        }
        self.sent.lock().push(SentEmail {
            from: from.to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
