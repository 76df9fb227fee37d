use std::fmt;
use std::io::{self, Cursor, Read};
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpectrumId(u64);

impl SpectrumId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpectrumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpectrumId {
    type Err = ProcessingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ProcessingError::InvalidSpectrumId(value.to_string()))
    }
}

/// Instrument file formats the converter knows how to normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpectrumFormat {
    /// FTIR export (`.0.dpt`, `.1.dpt`), already two comma-separated columns.
    Dpt,
    /// Generic delimited text, validated before re-emission.
    Csv,
    /// Tracer XRF dump: one header line followed by one count per line.
    Dat,
}

impl SpectrumFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SpectrumFormat::Dpt => "dpt",
            SpectrumFormat::Csv => "csv",
            SpectrumFormat::Dat => "dat",
        }
    }
}

impl fmt::Display for SpectrumFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpectrumFormat {
    type Err = ProcessingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dpt" => Ok(SpectrumFormat::Dpt),
            "csv" => Ok(SpectrumFormat::Csv),
            "dat" => Ok(SpectrumFormat::Dat),
            other => Err(ProcessingError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Ongoing,
    Successful,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Ongoing => "ongoing",
            ProcessingStatus::Successful => "successful",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Successful | ProcessingStatus::Error)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spectrum record as served by `GET /api/v1/spectra/{id}`.
///
/// `format` stays a plain, optional string here: an unknown or missing format
/// is a processing outcome, not a malformed record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Spectrum {
    pub id: SpectrumId,
    pub file_url: String,
    pub filename: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub sample: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
struct SpectrumEnvelope {
    spectrum: Spectrum,
}

impl Spectrum {
    /// Parses the service body, which wraps the record in a top-level `spectrum` key.
    pub fn from_record(body: &str) -> Result<Self, ProcessingError> {
        let envelope: SpectrumEnvelope = serde_json::from_str(body)
            .map_err(|err| ProcessingError::InvalidRecord(err.to_string()))?;
        Ok(envelope.spectrum)
    }

    /// A missing format is unsupported, the same as an unknown one.
    pub fn parsed_format(&self) -> Result<SpectrumFormat, ProcessingError> {
        match &self.format {
            Some(format) => format.parse(),
            None => Err(ProcessingError::UnsupportedFormat(
                "missing format".to_string(),
            )),
        }
    }
}

/// Bearer credential issued by `POST /api/oauth/token`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub created_at: i64,
}

impl Credential {
    pub fn is_fresh(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.created_at < max_age_secs
    }
}

/// Two-column `x,y` CSV held in memory, read from its start.
///
/// Dropping the buffer releases it; the orchestrator relies on that for
/// every exit path.
#[derive(Debug, Clone)]
pub struct CanonicalBuffer {
    name: String,
    data: Cursor<Vec<u8>>,
}

impl CanonicalBuffer {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Cursor::new(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> u64 {
        self.data.position()
    }

    pub fn rewind(&mut self) {
        self.data.set_position(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.get_ref()
    }

    pub fn len(&self) -> usize {
        self.data.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.get_ref().is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl Read for CanonicalBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}
