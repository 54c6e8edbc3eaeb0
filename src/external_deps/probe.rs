//! Liveness probes against the target site.

use std::time::Duration;

use async_trait::async_trait;

use super::CollaboratorError;
use super::transport::build_client;
use crate::modules::credentials::CredentialSet;
use crate::modules::proxy::ProxyEndpoint;

/// What a probe request carries: session material, an egress path, or both.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeRoute<'a> {
    pub credentials: Option<&'a CredentialSet>,
    pub proxy: Option<&'a ProxyEndpoint>,
}

impl<'a> ProbeRoute<'a> {
    pub fn with_credentials(credentials: &'a CredentialSet) -> Self {
        Self {
            credentials: Some(credentials),
            proxy: None,
        }
    }

    pub fn through(proxy: &'a ProxyEndpoint) -> Self {
        Self {
            credentials: None,
            proxy: Some(proxy),
        }
    }
}

/// Issues one lightweight request and reports the HTTP status.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn probe(&self, route: ProbeRoute<'_>, timeout: Duration)
    -> Result<u16, CollaboratorError>;
}

/// GETs a fixed URL with a fresh client per probe.
#[derive(Debug, Clone)]
pub struct HttpTargetProbe {
    url: String,
}

impl HttpTargetProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TargetProbe for HttpTargetProbe {
    async fn probe(
        &self,
        route: ProbeRoute<'_>,
        timeout: Duration,
    ) -> Result<u16, CollaboratorError> {
        let client = build_client(route.credentials, route.proxy, timeout)?;
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| CollaboratorError::from_reqwest(err, timeout))?;
        let status = response.status().as_u16();
        log::debug!("probe {} via {:?} -> {status}", self.url, route.proxy.map(ProxyEndpoint::key));
        Ok(status)
    }
}
