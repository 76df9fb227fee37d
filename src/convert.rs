use csv::{ReaderBuilder, Terminator, WriterBuilder};

use crate::domain::{CanonicalBuffer, SpectrumFormat};
use crate::error::ProcessingError;
use crate::sniff::{self, Dialect};

/// Fixed x-domain the `dat` readings are spread over.
pub const DAT_X_RANGE: (f64, f64) = (0.0, 40.0);

/// The two numeric channels of a canonical buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Columns {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Columns {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Normalizes a raw instrument file into a canonical buffer named
/// `<stem>.csv`, positioned at its start.
///
/// Whatever the handler emits must parse back as rows of exactly two
/// numeric fields, otherwise the conversion fails.
pub fn convert(
    format: SpectrumFormat,
    raw: &[u8],
    filename: &str,
) -> Result<CanonicalBuffer, ProcessingError> {
    let buffer = match format {
        SpectrumFormat::Dpt => convert_dpt(raw, filename),
        SpectrumFormat::Csv => validate_csv(raw, filename),
        SpectrumFormat::Dat => convert_dat(raw, filename),
    }?;
    read_columns(buffer.as_bytes())?;
    Ok(buffer)
}

/// FTIR `.0.dpt` / `.1.dpt` exports: rows are re-emitted as they are.
pub fn convert_dpt(raw: &[u8], filename: &str) -> Result<CanonicalBuffer, ProcessingError> {
    let text = decode(raw)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut writer = canonical_writer();
    for record in reader.records() {
        let record = record.map_err(|err| ProcessingError::Conversion(err.to_string()))?;
        writer
            .write_record(&record)
            .map_err(|err| ProcessingError::Conversion(err.to_string()))?;
    }
    finish(writer, filename)
}

/// Delimited text: accepted only without a header row and with at most two
/// fields per row, then re-emitted comma-separated.
pub fn validate_csv(raw: &[u8], filename: &str) -> Result<CanonicalBuffer, ProcessingError> {
    let text = decode(raw)?;
    let dialect = sniff::sniff_dialect(text)?;
    if sniff::has_header(text, dialect) {
        return Err(ProcessingError::Conversion(
            "input has a header row".to_string(),
        ));
    }

    let rows = read_rows(text, dialect)?;
    let mut writer = canonical_writer();
    for (index, row) in rows.iter().enumerate() {
        if row.len() > 2 {
            return Err(ProcessingError::Conversion(format!(
                "row {} has {} fields, expected at most 2",
                index + 1,
                row.len()
            )));
        }
        writer
            .write_record(row)
            .map_err(|err| ProcessingError::Conversion(err.to_string()))?;
    }
    finish(writer, filename)
}

/// Tracer XRF `.dat` dumps: a header line, then one count per line. The
/// x-channel is synthesized evenly over [`DAT_X_RANGE`].
pub fn convert_dat(raw: &[u8], filename: &str) -> Result<CanonicalBuffer, ProcessingError> {
    let text = decode(raw)?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    if lines.next().is_none() {
        return Err(ProcessingError::Conversion("empty dat file".to_string()));
    }
    let counts = lines
        .map(|line| {
            let value = line.trim();
            value.parse::<f64>().map_err(|_| {
                ProcessingError::Conversion(format!("not a numeric reading: {value:?}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if counts.is_empty() {
        return Err(ProcessingError::Conversion(
            "dat file has no readings".to_string(),
        ));
    }

    let x = linspace(DAT_X_RANGE.0, DAT_X_RANGE.1, counts.len());
    let mut writer = canonical_writer();
    for (x, y) in x.iter().zip(&counts) {
        writer
            .write_record([format!("{x:?}"), format!("{y:?}")])
            .map_err(|err| ProcessingError::Conversion(err.to_string()))?;
    }
    finish(writer, filename)
}

/// `n` evenly spaced values from `start` to `stop`, both inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut values: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            values[n - 1] = stop;
            values
        }
    }
}

/// Drops up to two trailing extensions and appends `.csv`:
/// `sample.0.dpt` becomes `sample.csv`.
pub fn converted_name(filename: &str) -> String {
    let stem = filename.rsplitn(3, '.').last().unwrap_or(filename);
    format!("{stem}.csv")
}

/// Parses canonical CSV into its x and y channels.
pub fn read_columns(bytes: &[u8]) -> Result<Columns, ProcessingError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut columns = Columns::default();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|err| ProcessingError::Conversion(err.to_string()))?;
        if record.len() != 2 {
            return Err(ProcessingError::Conversion(format!(
                "row {} has {} fields, expected 2",
                index + 1,
                record.len()
            )));
        }
        let parse = |field: &str| {
            field.trim().parse::<f64>().map_err(|_| {
                ProcessingError::Conversion(format!(
                    "row {}: {field:?} is not a number",
                    index + 1
                ))
            })
        };
        columns.x.push(parse(&record[0])?);
        columns.y.push(parse(&record[1])?);
    }
    if columns.is_empty() {
        return Err(ProcessingError::Conversion("no data rows".to_string()));
    }
    Ok(columns)
}

fn decode(raw: &[u8]) -> Result<&str, ProcessingError> {
    let text = std::str::from_utf8(raw)
        .map_err(|err| ProcessingError::Conversion(format!("input is not utf-8: {err}")))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn read_rows(text: &str, dialect: Dialect) -> Result<Vec<Vec<String>>, ProcessingError> {
    match dialect {
        Dialect::Delimited(delimiter) => {
            let mut reader = ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .delimiter(delimiter)
                .from_reader(text.as_bytes());
            reader
                .records()
                .map(|record| {
                    record
                        .map(|record| record.iter().map(str::to_string).collect())
                        .map_err(|err| ProcessingError::Conversion(err.to_string()))
                })
                .collect()
        }
        Dialect::Whitespace => Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| dialect.split(line).into_iter().map(str::to_string).collect())
            .collect()),
    }
}

fn canonical_writer() -> csv::Writer<Vec<u8>> {
    WriterBuilder::new()
        .delimiter(b',')
        .terminator(Terminator::Any(b'\n'))
        .flexible(true)
        .from_writer(Vec::new())
}

fn finish(
    writer: csv::Writer<Vec<u8>>,
    filename: &str,
) -> Result<CanonicalBuffer, ProcessingError> {
    let bytes = writer
        .into_inner()
        .map_err(|err| ProcessingError::Conversion(err.to_string()))?;
    Ok(CanonicalBuffer::new(converted_name(filename), bytes))
}
