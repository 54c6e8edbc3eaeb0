//! Proxy supply collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::CollaboratorError;
use crate::modules::proxy::ProxyEndpoint;

/// Returns a batch of candidate endpoints.
#[async_trait]
pub trait ProxySupplier: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>, CollaboratorError>;
}

#[derive(Debug, Deserialize)]
struct SupplyEntry {
    ip: String,
    port: u16,
}

/// Supply API answering with a JSON array of `{"ip": ..., "port": ...}`.
#[derive(Debug, Clone)]
pub struct HttpProxySupplier {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpProxySupplier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CollaboratorError::Config(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

pub(crate) fn parse_supply(body: &str) -> Result<Vec<ProxyEndpoint>, CollaboratorError> {
    let entries: Vec<SupplyEntry> =
        serde_json::from_str(body).map_err(|err| CollaboratorError::Decode(err.to_string()))?;
    Ok(entries
        .into_iter()
        .filter(|entry| !entry.ip.trim().is_empty())
        .map(|entry| ProxyEndpoint::new(entry.ip.trim(), entry.port))
        .collect())
}

#[async_trait]
impl ProxySupplier for HttpProxySupplier {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| CollaboratorError::from_reqwest(err, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| CollaboratorError::from_reqwest(err, self.timeout))?;
        parse_supply(&body)
    }
}
