use std::fs;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;
use crate::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "spectra-processor.json";
pub const DEFAULT_TOKEN_MAX_AGE_SECS: i64 = 7000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WORKERS: usize = 4;

/// What the orchestrator writes last once conversion has succeeded.
///
/// `ForceSuccessful` always finishes with `successful`, even after a failed
/// upload already recorded `error`. `ReportUploadFailure` leaves `error` as
/// the terminal status in that case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum FinalStatusPolicy {
    #[default]
    ForceSuccessful,
    ReportUploadFailure,
}

impl FromStr for FinalStatusPolicy {
    type Err = ProcessingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "force_successful" => Ok(FinalStatusPolicy::ForceSuccessful),
            "report_upload_failure" => Ok(FinalStatusPolicy::ReportUploadFailure),
            other => Err(ProcessingError::ConfigParse(format!(
                "unknown final_status policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub token_max_age_secs: Option<i64>,
    #[serde(default)]
    pub auth_retry: Option<RetryPolicy>,
    #[serde(default)]
    pub data_retry: Option<RetryPolicy>,
    #[serde(default)]
    pub final_status: Option<FinalStatusPolicy>,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Clone)]
pub struct ServiceCredentials {
    pub email: String,
    pub password: String,
    pub client_id: String,
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub credentials: ServiceCredentials,
    pub request_timeout: Duration,
    pub token_max_age_secs: i64,
    pub auth_retry: RetryPolicy,
    pub data_retry: RetryPolicy,
    pub final_status: FinalStatusPolicy,
    pub workers: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the settings file (explicit path, working directory, then the
    /// platform config directory), applies `SPECTRA_*` environment overrides
    /// and validates the result.
    pub fn resolve(path: Option<&Utf8Path>) -> Result<Settings, ProcessingError> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None => match Self::locate_default() {
                Some(found) => Self::read(&found)?,
                None => Config::default(),
            },
        };
        let config = Self::apply_env(config, |key| std::env::var(key).ok())?;
        Self::resolve_config(config)
    }

    fn locate_default() -> Option<Utf8PathBuf> {
        let local = Utf8PathBuf::from(CONFIG_FILE_NAME);
        if local.as_std_path().exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "spectra", "spectra-processor")
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.json")).ok())
            .filter(|candidate| candidate.as_std_path().exists())
    }

    pub fn read(path: &Utf8Path) -> Result<Config, ProcessingError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| ProcessingError::ConfigRead(path.as_std_path().to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| ProcessingError::ConfigParse(err.to_string()))
    }

    pub fn apply_env<F>(mut config: Config, lookup: F) -> Result<Config, ProcessingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = non_empty("SPECTRA_BASE_URL") {
            config.base_url = Some(value);
        }
        if let Some(value) = non_empty("SPECTRA_EMAIL") {
            config.email = Some(value);
        }
        if let Some(value) = non_empty("SPECTRA_PASSWORD") {
            config.password = Some(value);
        }
        if let Some(value) = non_empty("SPECTRA_CLIENT_ID") {
            config.client_id = Some(value);
        }
        if let Some(value) = non_empty("SPECTRA_FINAL_STATUS") {
            config.final_status = Some(value.parse()?);
        }
        Ok(config)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, ProcessingError> {
        let base_url = required(config.base_url, "base_url")?;
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProcessingError::ConfigParse(format!(
                "base_url must be an http(s) URL: {base_url}"
            )));
        }

        let credentials = ServiceCredentials {
            email: required(config.email, "email")?,
            password: required(config.password, "password")?,
            client_id: required(config.client_id, "client_id")?,
        };

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(ProcessingError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }

        Ok(Settings {
            base_url,
            credentials,
            request_timeout: Duration::from_secs(
                config
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            token_max_age_secs: config
                .token_max_age_secs
                .unwrap_or(DEFAULT_TOKEN_MAX_AGE_SECS),
            auth_retry: config.auth_retry.unwrap_or(RetryPolicy::AUTH),
            data_retry: config.data_retry.unwrap_or(RetryPolicy::SINGLE_ATTEMPT),
            final_status: config.final_status.unwrap_or_default(),
            workers,
        })
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, ProcessingError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ProcessingError::MissingSetting(name.to_string()))
}
