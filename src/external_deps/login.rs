//! Account roster and the login adapter that turns accounts into sessions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use super::CollaboratorError;
use super::transport::browser_headers;
use crate::modules::credentials::CredentialSet;

/// A roster entry used to obtain new sessions.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Read the account roster (a JSON array of `{username, password}`).
///
/// A missing or malformed file yields an empty roster; the pool then simply
/// cannot refill.
pub fn load_accounts(path: impl AsRef<Path>) -> Vec<Account> {
    let path = path.as_ref();
    let parsed = std::fs::read_to_string(path)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_str::<Vec<Account>>(&raw).map_err(|err| err.to_string()));
    match parsed {
        Ok(accounts) => {
            log::info!("loaded {} accounts from {}", accounts.len(), path.display());
            accounts
        }
        Err(err) => {
            log::error!("failed to load accounts from {}: {err}", path.display());
            Vec::new()
        }
    }
}

/// Exchanges an account for fresh session material.
#[async_trait]
pub trait LoginProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn login(&self, account: &Account) -> Result<CredentialSet, CollaboratorError>;
}

static HIDDEN_INPUTS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"form input[type="hidden"]"#).expect("invalid hidden input selector")
});

/// Hidden form fields (CSRF tokens and the like) on the login page.
pub(crate) fn hidden_fields(html: &str) -> HashMap<String, String> {
    let document = Html::parse_document(html);
    document
        .select(&HIDDEN_INPUTS)
        .filter_map(|input| {
            let element = input.value();
            let name = element.attr("name")?;
            Some((name.to_string(), element.attr("value").unwrap_or_default().to_string()))
        })
        .collect()
}

/// Parse a `Cookie` header value into a credential set.
pub(crate) fn parse_cookie_header(raw: &str) -> CredentialSet {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Form-based login: fetch the login page, replay its hidden fields with the
/// account credentials, and keep whatever cookies the site set.
#[derive(Debug, Clone)]
pub struct FormLoginProvider {
    login_url: Url,
    timeout: Duration,
}

impl FormLoginProvider {
    pub fn new(login_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        let login_url = Url::parse(login_url)
            .map_err(|err| CollaboratorError::Config(format!("login url: {err}")))?;
        Ok(Self { login_url, timeout })
    }
}

#[async_trait]
impl LoginProvider for FormLoginProvider {
    fn name(&self) -> &'static str {
        "form"
    }

    async fn login(&self, account: &Account) -> Result<CredentialSet, CollaboratorError> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .default_headers(browser_headers())
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.timeout)
            .build()
            .map_err(|err| CollaboratorError::Config(err.to_string()))?;
        let reqwest_err = |err| CollaboratorError::from_reqwest(err, self.timeout);

        let page = client
            .get(self.login_url.as_str())
            .send()
            .await
            .map_err(reqwest_err)?
            .text()
            .await
            .map_err(reqwest_err)?;

        let mut form = hidden_fields(&page);
        form.insert("username".into(), account.username.clone());
        form.insert("password".into(), account.password.clone());

        let response = client
            .post(self.login_url.as_str())
            .form(&form)
            .send()
            .await
            .map_err(reqwest_err)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(CollaboratorError::Status(status));
        }

        let cookies = jar
            .cookies(&self.login_url)
            .and_then(|value| value.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default();
        if cookies.is_empty() {
            return Err(CollaboratorError::Rejected(format!(
                "login for {} set no cookies",
                account.username
            )));
        }
        log::debug!("login for {} returned {} cookies", account.username, cookies.len());
        Ok(cookies)
    }
}
