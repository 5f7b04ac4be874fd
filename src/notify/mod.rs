//! Account-lifecycle emails (verification, password reset).

use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{info, warn};
use serde_json::json;
use thiserror::Error;

use crate::core::config::MailSettings;

const VERIFICATION_TEMPLATE: &str = include_str!("templates/verification.hbs");
const PASSWORD_RESET_TEMPLATE: &str = include_str!("templates/password_reset.hbs");

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("cannot build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP transport: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("template: {0}")]
    Template(#[from] handlebars::TemplateError),
    #[error("render: {0}")]
    Render(#[from] handlebars::RenderError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    Sent,
    /// Transport not configured
    Skipped,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<Delivery, MailError>;
}

/// STARTTLS SMTP relay with login credentials
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpMailer {
    /// `None` when the settings are incomplete
    pub fn from_settings(settings: &MailSettings) -> Result<Option<Self>, MailError> {
        let (Some(username), Some(password), Some(sender)) =
            (&settings.username, &settings.password, &settings.sender)
        else {
            return Ok(None);
        };
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)?
            .port(settings.port)
            .credentials(Credentials::new(username.clone(), password.clone()))
            .build();
        Ok(Some(Self {
            transport,
            sender: sender.parse()?,
        }))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<Delivery, MailError> {
        let message = Message::builder()
            .from(self.sender.clone())
            .to(email.to.parse()?)
            .subject(email.subject)
            .header(ContentType::TEXT_HTML)
            .body(email.html)?;
        self.transport.send(message).await?;
        Ok(Delivery::Sent)
    }
}

/// Stand-in used when SMTP is not configured
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<Delivery, MailError> {
        warn!(
            "Mail settings incomplete, skipping \"{}\" email to {}",
            email.subject, email.to
        );
        Ok(Delivery::Skipped)
    }
}

/// Renders the account emails and hands them to a mailer
pub struct Notifier {
    templates: Handlebars<'static>,
    mailer: Arc<dyn Mailer>,
    frontend_base_url: String,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, frontend_base_url: &str) -> Result<Self, MailError> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates.register_template_string("verification", VERIFICATION_TEMPLATE)?;
        templates.register_template_string("password_reset", PASSWORD_RESET_TEMPLATE)?;
        Ok(Self {
            templates,
            mailer,
            frontend_base_url: frontend_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build from settings, falling back to `LogMailer`
    pub fn from_settings(settings: &MailSettings, frontend_base_url: &str) -> Result<Self, MailError> {
        let mailer: Arc<dyn Mailer> = match SmtpMailer::from_settings(settings)? {
            Some(smtp) => {
                info!("Sending account emails through {}:{}", settings.server, settings.port);
                Arc::new(smtp)
            }
            None => {
                warn!("SMTP settings incomplete; account emails will be skipped");
                Arc::new(LogMailer)
            }
        };
        Self::new(mailer, frontend_base_url)
    }

    pub fn verification_email(&self, to: &str, username: &str, token: &str) -> Result<OutgoingEmail, MailError> {
        let link = format!("{}/verify-email?token={}", self.frontend_base_url, token);
        let html = self.templates.render(
            "verification",
            &json!({ "username": username, "link": link, "expires": "24 hours" }),
        )?;
        Ok(OutgoingEmail {
            to: to.to_string(),
            subject: "Verify Your Email Address".to_string(),
            html,
        })
    }

    pub fn password_reset_email(&self, to: &str, username: &str, token: &str) -> Result<OutgoingEmail, MailError> {
        let link = format!("{}/reset-password?token={}", self.frontend_base_url, token);
        let html = self.templates.render(
            "password_reset",
            &json!({ "username": username, "link": link, "expires": "1 hour" }),
        )?;
        Ok(OutgoingEmail {
            to: to.to_string(),
            subject: "Reset Your Password".to_string(),
            html,
        })
    }

    /// True when the message was handed to the transport
    pub async fn send_verification(&self, to: &str, username: &str, token: &str) -> bool {
        let email = self.verification_email(to, username, token);
        self.deliver(email).await
    }

    pub async fn send_password_reset(&self, to: &str, username: &str, token: &str) -> bool {
        let email = self.password_reset_email(to, username, token);
        self.deliver(email).await
    }

    async fn deliver(&self, email: Result<OutgoingEmail, MailError>) -> bool {
        let result = match email {
            Ok(email) => self.mailer.send(email).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(Delivery::Sent) => true,
            Ok(Delivery::Skipped) => false,
            Err(e) => {
                warn!("Failed to send email: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_email_links_to_frontend() {
        let notifier = Notifier::new(Arc::new(LogMailer), "http://hub.example.org/").unwrap();
        let email = notifier.verification_email("a@example.org", "alice", "tok123").unwrap();
        assert_eq!(email.subject, "Verify Your Email Address");
        assert!(email.html.contains("Welcome alice!"));
        assert!(email.html.contains("http://hub.example.org/verify-email?token"));
        assert!(email.html.contains("tok123"));
        assert!(email.html.contains("24 hours"));
    }

    #[test]
    fn test_reset_email_expiry() {
        let notifier = Notifier::new(Arc::new(LogMailer), "http://hub.example.org").unwrap();
        let email = notifier.password_reset_email("a@example.org", "alice", "r").unwrap();
        assert!(email.html.contains("/reset-password?token"));
        assert!(email.html.contains("1 hour"));
    }

    #[tokio::test]
    async fn test_transport_failure_reports_false() {
        let mut mailer = MockMailer::new();
        mailer.expect_send().times(1).returning(|_| {
            Err(MailError::Address("not-an-address".parse::<Mailbox>().unwrap_err()))
        });
        let notifier = Notifier::new(Arc::new(mailer), "http://hub").unwrap();
        assert!(!notifier.send_password_reset("a@example.org", "alice", "t").await);
    }

    #[tokio::test]
    async fn test_skipped_and_sent() {
        let notifier = Notifier::new(Arc::new(LogMailer), "http://hub").unwrap();
        assert!(!notifier.send_verification("a@example.org", "alice", "t").await);

        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|email| email.to == "a@example.org")
            .returning(|_| Ok(Delivery::Sent));
        let notifier = Notifier::new(Arc::new(mailer), "http://hub").unwrap();
        assert!(notifier.send_verification("a@example.org", "alice", "t").await);
    }

    #[test]
    fn test_incomplete_settings_yield_no_smtp() {
        let settings = MailSettings {
            server: "smtp.example.org".into(),
            port: 587,
            username: None,
            password: Some("p".into()),
            sender: Some("hub@example.org".into()),
        };
        assert!(SmtpMailer::from_settings(&settings).unwrap().is_none());
    }
}
