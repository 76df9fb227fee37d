use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::config::ServiceCredentials;
use crate::domain::Credential;
use crate::error::ProcessingError;
use crate::retry::RetryPolicy;

pub const TOKEN_PATH: &str = "/api/oauth/token";

/// Exchanges service credentials for a bearer credential.
///
/// `Transport` errors are retried by [`AuthSession`]; any other error is final.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, credentials: &ServiceCredentials) -> Result<Credential, ProcessingError>;
}

#[derive(Clone)]
pub struct HttpTokenIssuer {
    client: Client,
    token_url: String,
}

impl HttpTokenIssuer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProcessingError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("spectra-proc/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ProcessingError::Transport(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            token_url: format!("{base_url}{TOKEN_PATH}"),
        })
    }
}

impl TokenIssuer for HttpTokenIssuer {
    fn issue(&self, credentials: &ServiceCredentials) -> Result<Credential, ProcessingError> {
        let form = [
            ("email", credentials.email.as_str()),
            ("password", credentials.password.as_str()),
            ("grant_type", "password"),
            ("client_id", credentials.client_id.as_str()),
        ];
        let response = self.client.post(&self.token_url).form(&form).send()?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "token request rejected".to_string());
            return Err(ProcessingError::Auth { status, message });
        }
        let body = response.text()?;
        serde_json::from_str(&body).map_err(|err| ProcessingError::Auth {
            status,
            message: format!("malformed token response: {err}"),
        })
    }
}

/// Process-wide owner of the bearer credential.
///
/// The lock is held across a refresh, so concurrent callers that find the
/// credential stale wait for a single exchange instead of issuing their own.
pub struct AuthSession<I: TokenIssuer = HttpTokenIssuer> {
    issuer: I,
    credentials: ServiceCredentials,
    max_age_secs: i64,
    retry: RetryPolicy,
    credential: Mutex<Option<Credential>>,
}

impl<I: TokenIssuer> AuthSession<I> {
    pub fn new(
        issuer: I,
        credentials: ServiceCredentials,
        max_age_secs: i64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            issuer,
            credentials,
            max_age_secs,
            retry,
            credential: Mutex::new(None),
        }
    }

    /// Returns a fresh access token, refreshing first if needed.
    pub fn login(&self) -> Result<String, ProcessingError> {
        self.login_at(chrono::Utc::now().timestamp())
    }

    pub fn login_at(&self, now: i64) -> Result<String, ProcessingError> {
        let mut slot = self.lock();
        if let Some(credential) = slot.as_ref() {
            if credential.is_fresh(now, self.max_age_secs) {
                return Ok(credential.access_token.clone());
            }
            debug!(
                age_secs = now - credential.created_at,
                "credential stale, refreshing"
            );
        }
        let credential = self.exchange()?;
        let token = credential.access_token.clone();
        *slot = Some(credential);
        Ok(token)
    }

    /// Unconditionally exchanges credentials and replaces the cached credential.
    pub fn refresh(&self) -> Result<Credential, ProcessingError> {
        let mut slot = self.lock();
        let credential = self.exchange()?;
        *slot = Some(credential.clone());
        Ok(credential)
    }

    pub fn current(&self) -> Option<Credential> {
        self.lock().clone()
    }

    fn exchange(&self) -> Result<Credential, ProcessingError> {
        let credential = self
            .retry
            .run("auth:get_token", || self.issuer.issue(&self.credentials))?;
        info!(created_at = credential.created_at, "obtained access token");
        Ok(credential)
    }

    // The slot only ever holds a whole credential, so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Option<Credential>> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
