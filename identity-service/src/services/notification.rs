use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{SmsGatewayConfig, SmtpConfig};
use crate::models::OtpChannel;

/// Outbound delivery of codes and reset links. Callers treat failures as
/// non-fatal: they log and carry on.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_code(
        &self,
        channel: OtpChannel,
        destination: &str,
        code: &str,
    ) -> Result<(), anyhow::Error>;

    async fn send_reset_link(&self, destination: &str, url: &str) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &SmtpConfig) -> Result<Self, anyhow::Error> {
        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let mailer = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| anyhow::anyhow!("Invalid SMTP relay {}: {}", config.host, e))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, "Email service initialized");

        Ok(Self {
            mailer,
            from_email: config.from.clone(),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: String,
        html_body: String,
    ) -> Result<(), anyhow::Error> {
        let email = Message::builder()
            .from(self.from_email.parse()?)
            .to(to_email.parse()?)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body),
                    ),
            )?;

        // SmtpTransport is blocking
        let mailer = self.mailer.clone();
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await?
            .map_err(|e| anyhow::anyhow!("Failed to send email: {}", e))?;

        tracing::info!(subject = %subject, "Email sent");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    sender: &'a str,
    to: &'a str,
    message: &'a str,
}

/// Plain HTTP SMS gateway: `POST {url}` with a bearer API key.
#[derive(Clone)]
pub struct SmsGateway {
    client: Client,
    url: String,
    api_key: SecretString,
    sender_id: String,
}

impl SmsGateway {
    pub fn new(config: &SmsGatewayConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            sender_id: config.sender_id.clone(),
        })
    }

    async fn send(&self, phone: &str, message: &str) -> Result<(), anyhow::Error> {
        let normalized: String = phone
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        if normalized.is_empty() {
            return Err(anyhow::anyhow!("Phone number is empty"));
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&SmsRequest {
                sender: &self.sender_id,
                to: &normalized,
                message,
            })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reach SMS gateway: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "SMS gateway returned error status {}: {}",
                status,
                body
            ));
        }

        tracing::info!("SMS sent");
        Ok(())
    }
}

/// Production sender: SMTP for email, optional HTTP gateway for SMS.
pub struct Notifier {
    email: EmailService,
    sms: Option<SmsGateway>,
}

impl Notifier {
    pub fn new(email: EmailService, sms: Option<SmsGateway>) -> Self {
        Self { email, sms }
    }
}

#[async_trait]
impl NotificationSender for Notifier {
    async fn send_code(
        &self,
        channel: OtpChannel,
        destination: &str,
        code: &str,
    ) -> Result<(), anyhow::Error> {
        match channel {
            OtpChannel::Email => {
                let plain = format!(
                    "Your verification code is {}\n\nIt expires in 10 minutes. If you did not request it, you can ignore this email.",
                    code
                );
                let html = format!(
                    r#"<html><body style="font-family: Arial, sans-serif;">
<h2>Your verification code</h2>
<p style="font-size: 24px; letter-spacing: 4px;"><strong>{}</strong></p>
<p style="color: #666; font-size: 12px;">It expires in 10 minutes. If you did not request it, you can ignore this email.</p>
</body></html>"#,
                    code
                );
                self.email
                    .send_email(destination, "Your verification code", plain, html)
                    .await
            }
            OtpChannel::Sms => {
                let gateway = self
                    .sms
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("SMS gateway is not configured"))?;
                gateway
                    .send(destination, &format!("Your verification code is {}", code))
                    .await
            }
        }
    }

    async fn send_reset_link(&self, destination: &str, url: &str) -> Result<(), anyhow::Error> {
        let plain = format!(
            "We received a request to reset your password. Visit the link below to choose a new one:\n\n{}\n\nThe link expires in 1 hour. If you did not request this, you can ignore this email.",
            url
        );
        let html = format!(
            r#"<html><body style="font-family: Arial, sans-serif;">
<h2>Password reset</h2>
<p>We received a request to reset your password.</p>
<p><a href="{}" style="background-color: #2196F3; color: white; padding: 14px 20px; text-decoration: none; border-radius: 4px;">Reset password</a></p>
<p style="color: #666; font-size: 12px;">The link expires in 1 hour. If you did not request this, you can ignore this email.</p>
</body></html>"#,
            url
        );
        self.email
            .send_email(destination, "Reset your password", plain, html)
            .await
    }
}

/// A message captured by [`MockNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: OtpChannel,
    pub destination: String,
    pub body: String,
}

/// Test double that records every message instead of sending it. Not wired
/// into the binary.
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<SentMessage>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Body of the most recent message sent to `destination`.
    pub fn last_to(&self, destination: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.destination == destination)
            .map(|m| m.body)
    }

    fn push(&self, message: SentMessage) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock notifier mutex poisoned: {}", e))?
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl NotificationSender for MockNotifier {
    async fn send_code(
        &self,
        channel: OtpChannel,
        destination: &str,
        code: &str,
    ) -> Result<(), anyhow::Error> {
        self.push(SentMessage {
            channel,
            destination: destination.to_string(),
            body: code.to_string(),
        })
    }

    async fn send_reset_link(&self, destination: &str, url: &str) -> Result<(), anyhow::Error> {
        self.push(SentMessage {
            channel: OtpChannel::Email,
            destination: destination.to_string(),
            body: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            user: "mailer".to_string(),
            password: SecretString::new("pw".to_string()),
            from: "noreply@example.com".to_string(),
        }
    }

    #[test]
    fn test_email_service_creation() {
        assert!(EmailService::new(&smtp_config()).is_ok());
    }

    #[tokio::test]
    async fn test_sms_without_gateway_fails() {
        let notifier = Notifier::new(EmailService::new(&smtp_config()).unwrap(), None);
        let result = notifier.send_code(OtpChannel::Sms, "+15550100", "123456").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_records_messages() {
        let mock = MockNotifier::new();
        mock.send_code(OtpChannel::Email, "a@example.com", "111111").await.unwrap();
        mock.send_code(OtpChannel::Email, "a@example.com", "222222").await.unwrap();
        assert_eq!(mock.last_to("a@example.com").as_deref(), Some("222222"));
        assert_eq!(mock.sent().len(), 2);
    }
}
