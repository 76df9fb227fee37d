use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::SpectraClient;
use crate::config::FinalStatusPolicy;
use crate::convert;
use crate::domain::{CanonicalBuffer, ProcessingStatus, SpectrumFormat, SpectrumId};
use crate::error::ProcessingError;
use crate::peaks::{self, PeakDetector, PeakSet};

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub id: SpectrumId,
    pub status: ProcessingStatus,
    pub message: String,
    pub peaks: usize,
}

impl ProcessingResult {
    fn error(id: SpectrumId, message: String) -> Self {
        Self {
            id,
            status: ProcessingStatus::Error,
            message,
            peaks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<ProcessingResult>,
}

impl BatchResult {
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == ProcessingStatus::Error)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub name: String,
    pub csv: String,
    pub peaks: PeakSet,
    pub peak_error: Option<String>,
}

/// Result of the soft peak-detection step. An empty set and a failed run
/// behave the same downstream but are logged differently.
#[derive(Debug)]
pub enum PeakOutcome {
    Found(PeakSet),
    NoPeaks,
    Failed(ProcessingError),
}

impl PeakOutcome {
    pub fn peaks(&self) -> Option<&PeakSet> {
        match self {
            PeakOutcome::Found(peaks) => Some(peaks),
            PeakOutcome::NoPeaks | PeakOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Failed,
    Skipped,
}

impl PatchOutcome {
    /// Whether this outcome leaves the upload incomplete under `policy`.
    ///
    /// `ForceSuccessful` follows the observed flow, where a metadata patch
    /// that was never sent has no response and is recorded like a failed one.
    pub fn is_incomplete(self, policy: FinalStatusPolicy) -> bool {
        match self {
            PatchOutcome::Applied => false,
            PatchOutcome::Failed => true,
            PatchOutcome::Skipped => policy == FinalStatusPolicy::ForceSuccessful,
        }
    }

    fn from_result(result: Result<(), ProcessingError>) -> Self {
        match result {
            Ok(()) => PatchOutcome::Applied,
            Err(_) => PatchOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: SpectraClient> {
    client: C,
    final_status: FinalStatusPolicy,
    detector: PeakDetector,
}

impl<C: SpectraClient> App<C> {
    pub fn new(client: C, final_status: FinalStatusPolicy) -> Self {
        Self {
            client,
            final_status,
            detector: PeakDetector::default(),
        }
    }

    pub fn with_detector(mut self, detector: PeakDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn list(&self, sink: &dyn ProgressSink) -> Result<Value, ProcessingError> {
        sink.event(ProgressEvent {
            message: "phase=Fetch; listing spectra".to_string(),
            elapsed: None,
        });
        self.client.list()
    }

    pub fn upload(
        &self,
        sample_id: u64,
        file: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<Value, ProcessingError> {
        sink.event(ProgressEvent {
            message: format!("phase=Upload; {file} for sample {sample_id}"),
            elapsed: None,
        });
        self.client.post(sample_id, file)
    }

    /// Runs the whole pipeline for one spectrum and reports how it ended.
    ///
    /// Every failure is reported through the record's status and the
    /// returned result; nothing here is propagated as an `Err`.
    pub fn process(&self, id: SpectrumId, sink: &dyn ProgressSink) -> ProcessingResult {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; spectrum {id}"),
            elapsed: None,
        });
        let Ok(spectrum) = self.client.get(id) else {
            return self.fail(id, format!("Error retrieving spectrum with {id}"));
        };
        self.set_status(id, ProcessingStatus::Ongoing);

        sink.event(ProgressEvent {
            message: format!("phase=Download; {}", spectrum.filename),
            elapsed: Some(start.elapsed()),
        });
        let Ok(raw) = self.client.download(&spectrum.file_url) else {
            return self.fail(id, "Error getting spectrum file from server".to_string());
        };

        let format = match spectrum.parsed_format() {
            Ok(format) => format,
            Err(err) => {
                warn!(spectrum_id = %id, error = %err, "no converter for spectrum");
                return self.fail(id, format!("Unsupported filetype for spectrum with id {id}"));
            }
        };

        sink.event(ProgressEvent {
            message: format!("phase=Convert; format={format}"),
            elapsed: Some(start.elapsed()),
        });
        let mut buffer = match convert::convert(format, &raw, &spectrum.filename) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(spectrum_id = %id, error = %err, "conversion failed");
                return self.fail(id, format!("Error converting spectrum with id {id}"));
            }
        };

        sink.event(ProgressEvent {
            message: format!("phase=Detect; {} bytes", buffer.len()),
            elapsed: Some(start.elapsed()),
        });
        let outcome = self.detect(id, &buffer);

        sink.event(ProgressEvent {
            message: format!("phase=Upload; {}", buffer.name()),
            elapsed: Some(start.elapsed()),
        });
        buffer.rewind();
        let file_patch =
            PatchOutcome::from_result(self.client.patch_processed_file(id, &mut buffer));
        let metadata_patch = match outcome.peaks() {
            Some(found) if peaks::metadata_is_valid(&spectrum.metadata) => {
                match peaks::build_metadata(&spectrum.metadata, found) {
                    Ok(metadata) => {
                        PatchOutcome::from_result(self.client.patch_metadata(id, &metadata))
                    }
                    Err(err) => {
                        warn!(spectrum_id = %id, error = %err, "metadata not merged");
                        PatchOutcome::Skipped
                    }
                }
            }
            _ => PatchOutcome::Skipped,
        };
        drop(buffer);

        let peak_count = outcome.peaks().map_or(0, PeakSet::len);
        let upload_failed = file_patch.is_incomplete(self.final_status)
            || metadata_patch.is_incomplete(self.final_status);
        if upload_failed {
            warn!(spectrum_id = %id, ?file_patch, ?metadata_patch, "upload incomplete");
            self.set_status(id, ProcessingStatus::Error);
        }

        sink.event(ProgressEvent {
            message: format!("phase=Finish; spectrum {id}"),
            elapsed: Some(start.elapsed()),
        });
        match (self.final_status, upload_failed) {
            (FinalStatusPolicy::ReportUploadFailure, true) => ProcessingResult {
                id,
                status: ProcessingStatus::Error,
                message: format!("Error uploading results for spectrum with id {id}"),
                peaks: peak_count,
            },
            _ => {
                self.set_status(id, ProcessingStatus::Successful);
                info!(spectrum_id = %id, peaks = peak_count, "spectrum processed");
                ProcessingResult {
                    id,
                    status: ProcessingStatus::Successful,
                    message: format!("Done processing spectrum with id {id}"),
                    peaks: peak_count,
                }
            }
        }
    }

    /// Processes every id on a pool of `workers` scoped threads. Results keep
    /// the order of `ids`.
    pub fn process_many(
        &self,
        ids: &[SpectrumId],
        workers: usize,
        sink: &dyn ProgressSink,
    ) -> BatchResult {
        let next = AtomicUsize::new(0);
        let collected = Mutex::new(Vec::with_capacity(ids.len()));
        let workers = workers.clamp(1, ids.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(&id) = ids.get(index) else {
                            break;
                        };
                        let result = self.process(id, sink);
                        collected
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((index, result));
                    }
                });
            }
        });

        let mut collected = collected
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        collected.sort_by_key(|(index, _)| *index);
        BatchResult {
            results: collected.into_iter().map(|(_, result)| result).collect(),
        }
    }

    fn detect(&self, id: SpectrumId, buffer: &CanonicalBuffer) -> PeakOutcome {
        match self.detector.detect(buffer) {
            Ok(found) if found.is_empty() => {
                info!(spectrum_id = %id, "no peaks detected");
                PeakOutcome::NoPeaks
            }
            Ok(found) => PeakOutcome::Found(found),
            Err(err) => {
                warn!(spectrum_id = %id, error = %err, "peak detection failed");
                PeakOutcome::Failed(err)
            }
        }
    }

    fn fail(&self, id: SpectrumId, message: String) -> ProcessingResult {
        error!(spectrum_id = %id, "{message}");
        self.set_status(id, ProcessingStatus::Error);
        ProcessingResult::error(id, message)
    }

    // The client has already logged a failed status patch.
    fn set_status(&self, id: SpectrumId, status: ProcessingStatus) {
        let _ = self.client.patch_status(id, status);
    }
}

/// Converts a local file and runs peak detection on it, without any remote calls.
pub fn convert_file(
    path: &Utf8Path,
    format: SpectrumFormat,
    detector: &PeakDetector,
    sink: &dyn ProgressSink,
) -> Result<ConversionReport, ProcessingError> {
    sink.event(ProgressEvent {
        message: format!("phase=Convert; {path} as {format}"),
        elapsed: None,
    });
    let raw = std::fs::read(path.as_std_path())
        .map_err(|err| ProcessingError::Filesystem(format!("read {path}: {err}")))?;
    let buffer = convert::convert(format, &raw, path.file_name().unwrap_or(path.as_str()))?;

    sink.event(ProgressEvent {
        message: "phase=Detect; local buffer".to_string(),
        elapsed: None,
    });
    let (peaks, peak_error) = match detector.detect(&buffer) {
        Ok(peaks) => (peaks, None),
        Err(err) => {
            warn!(error = %err, "peak detection failed");
            (PeakSet::default(), Some(err.to_string()))
        }
    };
    Ok(ConversionReport {
        name: buffer.name().to_string(),
        csv: String::from_utf8_lossy(buffer.as_bytes()).into_owned(),
        peaks,
        peak_error,
    })
}
