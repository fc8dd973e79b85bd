use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::ensure_success;
use crate::configuration::{CircuitBreakerSettings, RoleServiceSettings};
use crate::error::ExternalError;
use crate::resilience::{BreakerState, ResilientClient};

const SERVICE: &str = "role";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDto {
    pub id: Uuid,
    /// `resource:action`
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDto {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<PermissionDto>,
}

/// Role assignments, owned by the role service
#[async_trait]
pub trait RoleClient: Send + Sync {
    async fn get_user_roles(&self, user_id: Uuid) -> Result<Vec<RoleDto>, ExternalError>;

    async fn remove_user_roles(&self, user_id: Uuid) -> Result<(), ExternalError>;

    /// Assign the default role to a newly registered user
    async fn set_user_as_default(&self, user_id: Uuid) -> Result<(), ExternalError>;
}

pub struct HttpRoleClient {
    http_client: reqwest::Client,
    base_url: String,
    resilient: ResilientClient,
}

impl HttpRoleClient {
    pub fn new(settings: &RoleServiceSettings, breaker: &CircuitBreakerSettings) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            resilient: ResilientClient::new(SERVICE, breaker, settings.timeout()),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.resilient.state()
    }

    fn roles_url(&self, user_id: Uuid) -> String {
        format!("{}/users/{}/roles", self.base_url, user_id)
    }
}

#[async_trait]
impl RoleClient for HttpRoleClient {
    #[tracing::instrument(name = "role.get_user_roles", skip(self))]
    async fn get_user_roles(&self, user_id: Uuid) -> Result<Vec<RoleDto>, ExternalError> {
        let request = self.http_client.get(self.roles_url(user_id));
        self.resilient
            .call(|| async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| ExternalError::from_reqwest(SERVICE, e))?;
                ensure_success(SERVICE, response)
                    .await?
                    .json::<Vec<RoleDto>>()
                    .await
                    .map_err(|e| ExternalError::Decode(SERVICE.to_string(), e.to_string()))
            })
            .await
    }

    #[tracing::instrument(name = "role.remove_user_roles", skip(self))]
    async fn remove_user_roles(&self, user_id: Uuid) -> Result<(), ExternalError> {
        let request = self.http_client.delete(self.roles_url(user_id));
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

    #[tracing::instrument(name = "role.set_user_as_default", skip(self))]
    async fn set_user_as_default(&self, user_id: Uuid) -> Result<(), ExternalError> {
        let url = format!("{}/default", self.roles_url(user_id));
        let request = self.http_client.post(url);
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
