//! Reqwest transport shared by probes and executor operations.
//!
//! Builds per-lease clients (browser-like headers, session cookies, optional
//! proxy) and maps raw responses onto the executor's attempt outcomes.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::{Regex, RegexBuilder};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use super::CollaboratorError;
use crate::modules::credentials::CredentialSet;
use crate::modules::executor::AttemptError;
use crate::modules::proxy::ProxyEndpoint;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

static ACCESS_DENIED_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(访问受限|access denied|访问过于频繁)")
        .case_insensitive(true)
        .build()
        .expect("invalid access denied regex")
});

static LOGIN_EXPIRED_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(登录已过期|login expired|session expired)")
        .case_insensitive(true)
        .build()
        .expect("invalid login expired regex")
});

/// A fully read response from the target site.
#[derive(Debug, Clone)]
pub struct TargetResponse {
    pub status: u16,
    pub url: Url,
    pub body: Bytes,
}

impl TargetResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

/// Browser-like default headers with a randomly chosen user agent.
pub fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let pairs = [
        ("user-agent", random_user_agent()),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("accept-language", "zh-CN,zh;q=0.8,en-US;q=0.5,en;q=0.3"),
        ("connection", "keep-alive"),
        ("upgrade-insecure-requests", "1"),
        ("cache-control", "max-age=0"),
    ];
    for (name, value) in pairs {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers
}

/// `Cookie` header value for a credential set.
pub fn cookie_header(credentials: &CredentialSet) -> String {
    credentials
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Client bound to one identity and one egress path.
pub fn build_client(
    credentials: Option<&CredentialSet>,
    proxy: Option<&ProxyEndpoint>,
    timeout: Duration,
) -> Result<Client, CollaboratorError> {
    let mut headers = browser_headers();
    if let Some(credentials) = credentials.filter(|c| !c.is_empty()) {
        let value = HeaderValue::from_str(&cookie_header(credentials))
            .map_err(|err| CollaboratorError::Config(format!("invalid cookie value: {err}")))?;
        headers.insert(reqwest::header::COOKIE, value);
    }

    let mut builder = Client::builder().default_headers(headers).timeout(timeout);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy.url())
            .map_err(|err| CollaboratorError::Config(format!("invalid proxy {proxy}: {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| CollaboratorError::Config(err.to_string()))
}

/// GET `url` and classify the outcome.
pub async fn fetch(client: &Client, url: &str) -> Result<TargetResponse, AttemptError> {
    let response = client.get(url).send().await.map_err(classify_transport)?;
    let status = response.status().as_u16();
    let url = response.url().clone();
    let body = response.bytes().await.map_err(classify_transport)?;
    classify_response(TargetResponse { status, url, body })
}

/// Map a complete response onto an attempt outcome.
pub fn classify_response(response: TargetResponse) -> Result<TargetResponse, AttemptError> {
    let status = StatusCode::from_u16(response.status)
        .map_err(|_| AttemptError::Other(format!("invalid status {}", response.status)))?;
    match status {
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            return Err(AttemptError::AccessDenied(format!("status {status}")));
        }
        StatusCode::UNAUTHORIZED => {
            return Err(AttemptError::CredentialInvalid(format!("status {status}")));
        }
        _ if status.is_server_error() => {
            return Err(AttemptError::Transient(format!("status {status}")));
        }
        _ => {}
    }

    let text = response.text();
    if ACCESS_DENIED_RE.is_match(&text) {
        return Err(AttemptError::AccessDenied("access restriction page".into()));
    }
    if LOGIN_EXPIRED_RE.is_match(&text) {
        return Err(AttemptError::CredentialInvalid("login expired".into()));
    }
    if status.is_client_error() {
        return Err(AttemptError::Other(format!("status {status}")));
    }
    Ok(response)
}

pub fn classify_transport(err: reqwest::Error) -> AttemptError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        AttemptError::Transient(err.to_string())
    } else {
        AttemptError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> TargetResponse {
        TargetResponse {
            status,
            url: Url::parse("https://example.test/search").unwrap(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn classifies_statuses_and_markers() {
        assert!(classify_response(response(200, "<html>results</html>")).is_ok());
        assert!(matches!(
            classify_response(response(403, "")),
            Err(AttemptError::AccessDenied(_))
        ));
        assert!(matches!(
            classify_response(response(200, "<p>访问受限</p>")),
            Err(AttemptError::AccessDenied(_))
        ));
        assert!(matches!(
            classify_response(response(200, "您的登录已过期")),
            Err(AttemptError::CredentialInvalid(_))
        ));
        assert!(matches!(
            classify_response(response(503, "")),
            Err(AttemptError::Transient(_))
        ));
        assert!(matches!(
            classify_response(response(404, "")),
            Err(AttemptError::Other(_))
        ));
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let mut set = CredentialSet::new();
        set.insert("JSESSIONID".into(), "abc".into());
        set.insert("Ecp_ClientId".into(), "42".into());
        assert_eq!(cookie_header(&set), "Ecp_ClientId=42; JSESSIONID=abc");
    }

    #[test]
    fn headers_look_like_a_browser() {
        let headers = browser_headers();
        let ua = headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(USER_AGENTS.contains(&ua));
        assert!(headers.contains_key("accept-language"));
    }

    #[test]
    fn builds_proxied_client() {
        let proxy = ProxyEndpoint::new("127.0.0.1", 3128);
        assert!(build_client(None, Some(&proxy), Duration::from_secs(5)).is_ok());
    }
}
