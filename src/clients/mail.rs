use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::clients::ensure_success;
use crate::configuration::{CircuitBreakerSettings, EmailClientSettings};
use crate::error::{ConfigError, ExternalError};
use crate::resilience::{BreakerState, ResilientClient};
use crate::validators::is_valid_email;

const SERVICE: &str = "mail";

pub const EMAIL_VERIFICATION_TAG: &str = "email-verification";
pub const FORGOT_PASSWORD_TAG: &str = "forgot-password";

#[async_trait]
pub trait MailClient: Send + Sync {
    async fn send_email_verification(&self, recipient: &str, token: &str) -> Result<(), ExternalError>;

    async fn send_forgot_password(&self, recipient: &str, token: &str) -> Result<(), ExternalError>;
}

#[derive(Debug, Deserialize)]
struct MailTag {
    id: String,
    name: String,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "Html")]
    html: String,
    tags: Vec<String>,
}

/// Tag ids are fetched once per process. `ready` flips only after a
/// successful fetch so a failed first attempt is retried by the next caller.
#[derive(Default)]
struct TagCache {
    ready: bool,
    ids: HashMap<String, String>,
}

pub struct HttpMailClient {
    http_client: reqwest::Client,
    base_url: String,
    sender: String,
    verification_url: String,
    reset_password_url: String,
    resilient: ResilientClient,
    tags: RwLock<TagCache>,
}

impl HttpMailClient {
    pub fn new(
        settings: &EmailClientSettings,
        breaker: &CircuitBreakerSettings,
    ) -> Result<Self, ConfigError> {
        let sender = is_valid_email(&settings.sender_email)
            .map_err(|e| ConfigError::InvalidValue(format!("email_client.sender_email: {}", e)))?;
        Ok(Self {
            http_client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            sender,
            verification_url: settings.verification_url.clone(),
            reset_password_url: settings.reset_password_url.clone(),
            resilient: ResilientClient::new(SERVICE, breaker, settings.timeout()),
            tags: RwLock::new(TagCache::default()),
        })
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.resilient.state()
    }

    /// Cached tag id by name. Concurrent first callers trigger one fetch:
    /// the flag is checked again once the write lock is held.
    async fn tag_id(&self, name: &str) -> Result<Option<String>, ExternalError> {
        {
            let cache = self.tags.read().await;
            if cache.ready {
                return Ok(cache.ids.get(name).cloned());
            }
        }

        let mut cache = self.tags.write().await;
        if !cache.ready {
            cache.ids = self.fetch_tags().await?;
            cache.ready = true;
            tracing::info!(count = cache.ids.len(), "Mail tags cached");
        }
        Ok(cache.ids.get(name).cloned())
    }

    async fn fetch_tags(&self) -> Result<HashMap<String, String>, ExternalError> {
        let request = self.http_client.get(format!("{}/tags", self.base_url));
        let tags: Vec<MailTag> = self
            .resilient
            .call(|| async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| ExternalError::from_reqwest(SERVICE, e))?;
                ensure_success(SERVICE, response)
                    .await?
                    .json::<Vec<MailTag>>()
                    .await
                    .map_err(|e| ExternalError::Decode(SERVICE.to_string(), e.to_string()))
            })
            .await?;
        Ok(tags.into_iter().map(|tag| (tag.name, tag.id)).collect())
    }

    async fn send_email(
        &self,
        recipient: &str,
        subject: &str,
        html: String,
        tag: &str,
    ) -> Result<(), ExternalError> {
        let tags = match self.tag_id(tag).await? {
            Some(id) => vec![id],
            None => {
                tracing::warn!(tag = tag, "Mail tag unknown to the mail service, sending untagged");
                Vec::new()
            }
        };
        let body = SendEmailRequest {
            from: &self.sender,
            to: recipient,
            subject,
            html,
            tags,
        };
        let request = self
            .http_client
            .post(format!("{}/email", self.base_url))
            .json(&body);

        self.resilient
            .call(|| async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| ExternalError::from_reqwest(SERVICE, e))?;
                ensure_success(SERVICE, response).await.map(|_| ())
            })
            .await
    }
}

#[async_trait]
impl MailClient for HttpMailClient {
    #[tracing::instrument(name = "mail.send_email_verification", skip(self, token))]
    async fn send_email_verification(&self, recipient: &str, token: &str) -> Result<(), ExternalError> {
        let link = format!("{}{}", self.verification_url, token);
        let html = format!(
            "Welcome!<br />Click <a href=\"{}\">here</a> to verify your email address.",
            link
        );
        self.send_email(recipient, "Verify your email", html, EMAIL_VERIFICATION_TAG)
            .await
    }

    #[tracing::instrument(name = "mail.send_forgot_password", skip(self, token))]
    async fn send_forgot_password(&self, recipient: &str, token: &str) -> Result<(), ExternalError> {
        let link = format!("{}{}", self.reset_password_url, token);
        let html = format!(
            "A password reset was requested for your account.<br />Click <a href=\"{}\">here</a> to choose a new password.",
            link
        );
        self.send_email(recipient, "Reset your password", html, FORGOT_PASSWORD_TAG)
            .await
    }
}
