use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::auth::{AuthSession, HttpTokenIssuer, TokenIssuer};
use crate::domain::{CanonicalBuffer, ProcessingStatus, Spectrum, SpectrumId};
use crate::error::ProcessingError;
use crate::retry::RetryPolicy;

pub const SPECTRA_PATH: &str = "/api/v1/spectra";

/// Operations against the record service.
///
/// Implementations log every failure themselves; callers treat an `Err` as
/// "this operation did not happen" and branch on it without re-reporting.
pub trait SpectraClient: Send + Sync {
    fn list(&self) -> Result<Value, ProcessingError>;
    fn get(&self, id: SpectrumId) -> Result<Spectrum, ProcessingError>;
    /// Fetches a stored file; relative URLs resolve against the service base URL.
    fn download(&self, file_url: &str) -> Result<Vec<u8>, ProcessingError>;
    fn post(&self, sample_id: u64, file: &Utf8Path) -> Result<Value, ProcessingError>;
    /// Uploads the buffer from its current position as `spectrum[processed_file]`.
    fn patch_processed_file(
        &self,
        id: SpectrumId,
        file: &mut CanonicalBuffer,
    ) -> Result<(), ProcessingError>;
    fn patch_status(&self, id: SpectrumId, status: ProcessingStatus)
    -> Result<(), ProcessingError>;
    fn patch_metadata(
        &self,
        id: SpectrumId,
        metadata: &Map<String, Value>,
    ) -> Result<(), ProcessingError>;
}

pub struct SpectraHttpClient<I: TokenIssuer = HttpTokenIssuer> {
    client: Client,
    base_url: String,
    auth: Arc<AuthSession<I>>,
    retry: RetryPolicy,
}

impl<I: TokenIssuer> SpectraHttpClient<I> {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        auth: Arc<AuthSession<I>>,
        retry: RetryPolicy,
    ) -> Result<Self, ProcessingError> {
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
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn spectrum_url(&self, id: SpectrumId) -> String {
        format!("{}{SPECTRA_PATH}/{id}", self.base_url)
    }

    fn collection_url(&self) -> String {
        format!("{}{SPECTRA_PATH}", self.base_url)
    }

    fn handle_status(response: Response) -> Result<Response, ProcessingError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "record service request failed".to_string());
        Err(ProcessingError::RemoteStatus { status, message })
    }

    /// Logs in, sends the request under the data retry policy and logs a
    /// failure before handing it back.
    fn authorized<T, B, P>(&self, operation: &str, build: B, parse: P) -> Result<T, ProcessingError>
    where
        B: Fn(&str) -> Result<RequestBuilder, ProcessingError>,
        P: FnOnce(Response) -> Result<T, ProcessingError>,
    {
        let result = self.auth.login().and_then(|token| {
            let response = self.retry.run(operation, || {
                let response = build(&token)?.send()?;
                Ok(response)
            })?;
            parse(Self::handle_status(response)?)
        });
        if let Err(err) = &result {
            error!(operation, error = %err, "record service call failed");
        }
        result
    }
}

impl<I: TokenIssuer> SpectraClient for SpectraHttpClient<I> {
    fn list(&self) -> Result<Value, ProcessingError> {
        let url = self.collection_url();
        self.authorized(
            "spectra:list_spectra",
            |token| Ok(self.client.get(&url).bearer_auth(token)),
            |response| Ok(response.json()?),
        )
    }

    fn get(&self, id: SpectrumId) -> Result<Spectrum, ProcessingError> {
        let url = self.spectrum_url(id);
        self.authorized(
            "spectra:get_spectrum",
            |token| Ok(self.client.get(&url).bearer_auth(token)),
            |response| Spectrum::from_record(&response.text()?),
        )
    }

    fn download(&self, file_url: &str) -> Result<Vec<u8>, ProcessingError> {
        let url = resolve_url(&self.base_url, file_url);
        debug!(%url, "downloading spectrum file");
        let result = self
            .retry
            .run("spectra:download_file", || {
                let response = self.client.get(&url).send()?;
                Ok(response)
            })
            .and_then(Self::handle_status)
            .and_then(|response| Ok(response.bytes()?.to_vec()));
        if let Err(err) = &result {
            error!(operation = "spectra:download_file", error = %err, "file download failed");
        }
        result
    }

    fn post(&self, sample_id: u64, file: &Utf8Path) -> Result<Value, ProcessingError> {
        let bytes = std::fs::read(file.as_std_path())
            .map_err(|err| ProcessingError::Filesystem(format!("read {file}: {err}")))?;
        let file_name = file.file_name().unwrap_or("spectrum").to_string();
        let url = self.collection_url();
        self.authorized(
            "spectra:post_spectrum",
            |token| {
                let form = Form::new()
                    .text("spectrum[sample_id]", sample_id.to_string())
                    .part(
                        "spectrum[file]",
                        Part::bytes(bytes.clone()).file_name(file_name.clone()),
                    );
                Ok(self.client.post(&url).bearer_auth(token).multipart(form))
            },
            |response| Ok(response.json()?),
        )
    }

    fn patch_processed_file(
        &self,
        id: SpectrumId,
        file: &mut CanonicalBuffer,
    ) -> Result<(), ProcessingError> {
        let mut bytes = Vec::with_capacity(file.len());
        file.read_to_end(&mut bytes)
            .map_err(|err| ProcessingError::Filesystem(err.to_string()))?;
        let file_name = file.name().to_string();
        let url = self.spectrum_url(id);
        self.authorized(
            "spectra:patch_spectrum",
            |token| {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str("text/csv")?;
                let form = Form::new().part("spectrum[processed_file]", part);
                Ok(self.client.patch(&url).bearer_auth(token).multipart(form))
            },
            |_| Ok(()),
        )
    }

    fn patch_status(
        &self,
        id: SpectrumId,
        status: ProcessingStatus,
    ) -> Result<(), ProcessingError> {
        let url = self.spectrum_url(id);
        self.authorized(
            "spectra:update_status",
            |token| {
                Ok(self
                    .client
                    .patch(&url)
                    .bearer_auth(token)
                    .form(&[("spectrum[status]", status.as_str())]))
            },
            |_| Ok(()),
        )
    }

    fn patch_metadata(
        &self,
        id: SpectrumId,
        metadata: &Map<String, Value>,
    ) -> Result<(), ProcessingError> {
        let encoded = serde_json::to_string(metadata)
            .map_err(|err| ProcessingError::Metadata(err.to_string()))?;
        let url = self.spectrum_url(id);
        self.authorized(
            "spectra:update_metadata",
            |token| {
                Ok(self
                    .client
                    .patch(&url)
                    .bearer_auth(token)
                    .form(&[("spectrum[metadata]", encoded.as_str())]))
            },
            |_| Ok(()),
        )
    }
}

/// Resolves a record-relative file URL against the service base URL.
pub fn resolve_url(base_url: &str, file_url: &str) -> String {
    if file_url.starts_with("http://") || file_url.starts_with("https://") {
        return file_url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if file_url.starts_with('/') {
        format!("{base}{file_url}")
    } else {
        format!("{base}/{file_url}")
    }
}
