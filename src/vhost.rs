//! # Virtual Host Provisioning Module
//!
//! Ensures a broker virtual host exists before any client uses it, through
//! the broker's HTTP management API.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::errors::ProvisionError;

/// Outcome of a successful provisioning call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhostStatus {
    Created,
    AlreadyExists,
}

/// Creates virtual hosts, or confirms they already exist
#[async_trait]
pub trait VhostProvisioner: Send + Sync {
    async fn ensure_vhost(&self, vhost: &str) -> Result<VhostStatus, ProvisionError>;
}

/// Client for the management API's `PUT /api/vhosts/{name}` resource
#[derive(Debug, Clone)]
pub struct ManagementApi {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl ManagementApi {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ProvisionError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProvisionError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProvisionError::InvalidUrl(base_url.to_string()));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn from_config(broker: &BrokerConfig) -> Result<Self, ProvisionError> {
        Self::new(
            &broker.management_url(),
            broker.username.clone(),
            broker.password.clone(),
        )
    }

    /// URL of a vhost resource; the name is a single percent-encoded segment
    pub fn vhost_url(&self, vhost: &str) -> Result<Url, ProvisionError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProvisionError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "vhosts", vhost]);
        Ok(url)
    }
}

#[async_trait]
impl VhostProvisioner for ManagementApi {
    async fn ensure_vhost(&self, vhost: &str) -> Result<VhostStatus, ProvisionError> {
        let response = self
            .http
            .put(self.vhost_url(vhost)?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                info!(vhost, "Broker vhost created");
                Ok(VhostStatus::Created)
            }
            StatusCode::NO_CONTENT => {
                info!(vhost, "Broker vhost already exists");
                Ok(VhostStatus::AlreadyExists)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(vhost, status = status.as_u16(), body = %body, "Broker vhost provisioning failed");
                Err(ProvisionError::UnexpectedStatus {
                    vhost: vhost.to_string(),
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vhost_url_layout() {
        let api = ManagementApi::new("http://rabbit:15672/", "guest", "guest").unwrap();
        assert_eq!(
            api.vhost_url("ads-vhost").unwrap().as_str(),
            "http://rabbit:15672/api/vhosts/ads-vhost"
        );
    }

    #[test]
    fn test_vhost_name_is_one_segment() {
        let api = ManagementApi::new("http://rabbit:15672", "guest", "guest").unwrap();
        assert_eq!(
            api.vhost_url("/").unwrap().as_str(),
            "http://rabbit:15672/api/vhosts/%2F"
        );
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(ManagementApi::new("not a url", "guest", "guest").is_err());
        assert!(ManagementApi::new("mailto:ops@example.com", "guest", "guest").is_err());
    }
}
