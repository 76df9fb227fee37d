use std::cmp::Ordering;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::convert::{self, Columns};
use crate::domain::CanonicalBuffer;
use crate::error::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Denoise {
    None,
    /// Edge-preserving smoothing: neighbours within `window` samples are
    /// weighted by distance and by how close their value is.
    Bilateral {
        window: usize,
        sigma_space: f64,
        sigma_range: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakDetectorConfig {
    /// A peak must be the maximum within this many samples on either side.
    pub lookahead: usize,
    pub denoise: Denoise,
    pub max_rank: usize,
    /// Minimum normalized height of a reported peak.
    pub min_height: f64,
    /// Persistence at or below this is float noise, not a peak.
    pub min_persistence: f64,
}

impl Default for PeakDetectorConfig {
    fn default() -> Self {
        Self {
            lookahead: 2,
            denoise: Denoise::Bilateral {
                window: 2,
                sigma_space: 1.0,
                sigma_range: 0.1,
            },
            max_rank: 40,
            min_height: 0.005,
            min_persistence: 1e-9,
        }
    }
}

/// Per-sample output of the peak finder, before filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub peak: bool,
    /// 1 is the most persistent peak; 0 means not ranked.
    pub rank: usize,
    /// Normalized y value.
    pub height: f64,
    pub persistence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Peak {
    pub index: usize,
    pub position: f64,
    pub rank: usize,
    pub height: f64,
}

/// Detected peaks in sample order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PeakSet(Vec<Peak>);

impl PeakSet {
    pub fn new(peaks: Vec<Peak>) -> Self {
        Self(peaks)
    }

    pub fn positions(&self) -> Vec<f64> {
        self.0.iter().map(|peak| peak.position).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Peak> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeakDetector {
    config: PeakDetectorConfig,
}

impl PeakDetector {
    pub fn new(config: PeakDetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PeakDetectorConfig {
        &self.config
    }

    /// Reads the buffer from its start; the read position is left untouched.
    pub fn detect(&self, buffer: &CanonicalBuffer) -> Result<PeakSet, ProcessingError> {
        let columns = convert::read_columns(buffer.as_bytes())
            .map_err(|err| ProcessingError::PeakDetection(err.to_string()))?;
        self.detect_columns(&columns)
    }

    pub fn detect_columns(&self, columns: &Columns) -> Result<PeakSet, ProcessingError> {
        let normalized = normalize(&columns.y)?;
        let peaks = self
            .analyze(&normalized)
            .into_iter()
            .filter(|c| {
                c.peak
                    && c.rank != 0
                    && c.rank <= self.config.max_rank
                    && c.height >= self.config.min_height
            })
            .map(|c| Peak {
                index: c.index,
                position: columns.x[c.index],
                rank: c.rank,
                height: c.height,
            })
            .collect();
        Ok(PeakSet(peaks))
    }

    /// Runs the finder on an already normalized channel.
    pub fn analyze(&self, normalized: &[f64]) -> Vec<Candidate> {
        let smoothed = match self.config.denoise {
            Denoise::None => normalized.to_vec(),
            Denoise::Bilateral {
                window,
                sigma_space,
                sigma_range,
            } => bilateral_filter(normalized, window, sigma_space, sigma_range),
        };
        let scores = persistence(&smoothed);

        let mut candidates: Vec<Candidate> = normalized
            .iter()
            .enumerate()
            .map(|(index, &height)| Candidate {
                index,
                peak: scores[index] > self.config.min_persistence
                    && is_window_max(&smoothed, index, self.config.lookahead),
                rank: 0,
                height,
                persistence: scores[index],
            })
            .collect();

        let mut ranked: Vec<usize> = candidates
            .iter()
            .filter(|c| c.peak)
            .map(|c| c.index)
            .collect();
        ranked.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        for (position, index) in ranked.into_iter().enumerate() {
            candidates[index].rank = position + 1;
        }
        candidates
    }
}

/// Divides every value by the channel maximum.
pub fn normalize(y: &[f64]) -> Result<Vec<f64>, ProcessingError> {
    if y.is_empty() {
        return Err(ProcessingError::PeakDetection("empty y-channel".to_string()));
    }
    if let Some(bad) = y.iter().find(|value| !value.is_finite()) {
        return Err(ProcessingError::PeakDetection(format!(
            "non-finite value in y-channel: {bad}"
        )));
    }
    let max = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max <= 0.0 {
        return Err(ProcessingError::PeakDetection(format!(
            "cannot normalize by non-positive maximum {max}"
        )));
    }
    Ok(y.iter().map(|value| value / max).collect())
}

pub fn bilateral_filter(y: &[f64], window: usize, sigma_space: f64, sigma_range: f64) -> Vec<f64> {
    let space = 2.0 * sigma_space * sigma_space;
    let range = 2.0 * sigma_range * sigma_range;
    (0..y.len())
        .map(|i| {
            let lo = i.saturating_sub(window);
            let hi = (i + window).min(y.len() - 1);
            let mut weighted = 0.0;
            let mut total = 0.0;
            for j in lo..=hi {
                let distance = i.abs_diff(j) as f64;
                let delta = y[j] - y[i];
                let weight = (-(distance * distance) / space - (delta * delta) / range).exp();
                weighted += weight * y[j];
                total += weight;
            }
            weighted / total
        })
        .collect()
}

/// Topological persistence of every local maximum.
///
/// Samples are swept from high to low; each maximum founds a component and
/// when two components meet, the lower one dies. Its persistence is its
/// height minus the level it died at. The global maximum survives and
/// scores the full range of the channel. Non-maxima score 0.
pub fn persistence(y: &[f64]) -> Vec<f64> {
    let n = y.len();
    let mut scores = vec![0.0; n];
    if n == 0 {
        return scores;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| y[b].partial_cmp(&y[a]).unwrap_or(Ordering::Equal).then(a.cmp(&b)));

    // parent links for union-find; usize::MAX marks an unvisited sample
    let mut parent = vec![usize::MAX; n];
    // sweep position at which each root was born, to break height ties
    let mut born = vec![0usize; n];

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for (step, &i) in order.iter().enumerate() {
        let left = (i > 0 && parent[i - 1] != usize::MAX).then(|| find(&mut parent, i - 1));
        let right = (i + 1 < n && parent[i + 1] != usize::MAX).then(|| find(&mut parent, i + 1));
        match (left, right) {
            (None, None) => {
                parent[i] = i;
                born[i] = step;
            }
            (Some(root), None) | (None, Some(root)) => parent[i] = root,
            (Some(a), Some(b)) => {
                // higher root survives; on a tie, the one born first
                let a_first = y[a] > y[b] || (y[a] == y[b] && born[a] <= born[b]);
                let (older, younger) = if a_first { (a, b) } else { (b, a) };
                scores[younger] = y[younger] - y[i];
                parent[younger] = older;
                parent[i] = older;
            }
        }
    }

    let global = order[0];
    let min = y[order[n - 1]];
    scores[global] = y[global] - min;
    scores
}

fn is_window_max(y: &[f64], index: usize, lookahead: usize) -> bool {
    let lo = index.saturating_sub(lookahead);
    let hi = (index + lookahead).min(y.len() - 1);
    (lo..=hi).all(|j| y[j] <= y[index])
}

/// Whether stored metadata can be merged into: a mapping, or a string
/// holding a JSON object.
pub fn metadata_is_valid(existing: &Value) -> bool {
    existing_entries(existing).is_ok()
}

/// Shallow-merges `peaks: [{position: "<x>"}, ...]` into the existing
/// metadata; every other key is kept.
pub fn build_metadata(
    existing: &Value,
    peaks: &PeakSet,
) -> Result<Map<String, Value>, ProcessingError> {
    let mut merged = existing_entries(existing)?;
    let entries = peaks
        .iter()
        .map(|peak| json!({ "position": format!("{:?}", peak.position) }))
        .collect();
    merged.insert("peaks".to_string(), Value::Array(entries));
    Ok(merged)
}

fn existing_entries(existing: &Value) -> Result<Map<String, Value>, ProcessingError> {
    match existing {
        Value::Object(map) => Ok(map.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ProcessingError::Metadata(format!(
                "expected a JSON object, found {other}"
            ))),
            Err(err) => Err(ProcessingError::Metadata(err.to_string())),
        },
        Value::Null => Err(ProcessingError::Metadata("metadata is absent".to_string())),
        other => Err(ProcessingError::Metadata(format!(
            "expected a mapping, found {other}"
        ))),
    }
}
