//! Delimiter and header detection for delimited text of unknown origin.
//!
//! Only a leading sample of the input is inspected. A trailing line cut
//! by the sample limit is ignored.

use crate::error::ProcessingError;

pub const SAMPLE_BYTES: usize = 1024;
const HEADER_ROWS: usize = 20;
const CONSISTENCY: f64 = 0.9;

/// Field separator detected in a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Delimited(u8),
    /// Runs of spaces and tabs.
    Whitespace,
}

impl Dialect {
    pub fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            Dialect::Delimited(delimiter) => line
                .split(*delimiter as char)
                .map(|field| field.trim())
                .collect(),
            Dialect::Whitespace => line.split_whitespace().collect(),
        }
    }
}

const CANDIDATES: [Dialect; 5] = [
    Dialect::Delimited(b','),
    Dialect::Delimited(b'\t'),
    Dialect::Delimited(b';'),
    Dialect::Delimited(b'|'),
    Dialect::Whitespace,
];

pub fn sample_lines(text: &str) -> Vec<&str> {
    let truncated = text.len() > SAMPLE_BYTES;
    let mut end = SAMPLE_BYTES.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let sample = &text[..end];
    let mut lines: Vec<&str> = sample.lines().collect();
    if truncated && !sample.ends_with('\n') {
        lines.pop();
    }
    lines
        .into_iter()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Picks the first candidate that splits at least 90% of the sample lines
/// into the same number (two or more) of fields.
pub fn sniff_dialect(text: &str) -> Result<Dialect, ProcessingError> {
    let lines = sample_lines(text);
    if lines.is_empty() {
        return Err(ProcessingError::Conversion(
            "could not determine delimiter: empty input".to_string(),
        ));
    }
    CANDIDATES
        .into_iter()
        .find(|dialect| consistency(&lines, *dialect) >= CONSISTENCY)
        .ok_or_else(|| ProcessingError::Conversion("could not determine delimiter".to_string()))
}

fn consistency(lines: &[&str], dialect: Dialect) -> f64 {
    let counts: Vec<usize> = lines.iter().map(|line| dialect.split(line).len()).collect();
    let mut modal = 0usize;
    let mut modal_hits = 0usize;
    for &count in &counts {
        let hits = counts.iter().filter(|&&c| c == count).count();
        if hits > modal_hits {
            modal = count;
            modal_hits = hits;
        }
    }
    if modal < 2 {
        return 0.0;
    }
    modal_hits as f64 / counts.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnKind {
    Numeric,
    Length(usize),
}

fn classify(field: &str) -> ColumnKind {
    if field.parse::<f64>().is_ok() {
        ColumnKind::Numeric
    } else {
        ColumnKind::Length(field.chars().count())
    }
}

/// Votes on whether the first sampled row is a header.
///
/// Each column whose type is consistent across the following rows casts a
/// vote: a numeric column whose first cell is not numeric, or a text column
/// whose first cell has a different length, counts for a header.
pub fn has_header(text: &str, dialect: Dialect) -> bool {
    let lines = sample_lines(text);
    let mut rows = lines.iter().take(HEADER_ROWS).map(|line| dialect.split(line));
    let Some(header) = rows.next() else {
        return false;
    };
    let mut kinds: Vec<Option<Option<ColumnKind>>> = vec![Some(None); header.len()];
    for row in rows {
        if row.len() != header.len() {
            continue;
        }
        for (slot, field) in kinds.iter_mut().zip(&row) {
            let kind = classify(field);
            *slot = match *slot {
                Some(None) => Some(Some(kind)),
                Some(Some(existing)) if existing == kind => Some(Some(existing)),
                // inconsistent column, no vote
                _ => None,
            };
        }
    }

    let mut votes = 0i32;
    for (kind, cell) in kinds.iter().zip(&header) {
        match kind {
            Some(Some(ColumnKind::Numeric)) => {
                votes += if cell.parse::<f64>().is_ok() { -1 } else { 1 };
            }
            Some(Some(ColumnKind::Length(len))) => {
                votes += if cell.chars().count() == *len { -1 } else { 1 };
            }
            _ => {}
        }
    }
    votes > 0
}
