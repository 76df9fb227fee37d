use std::io::{self, Write};

use crossterm::style::Stylize;
use serde::Serialize;
use serde_json::Value;

use crate::app::{BatchResult, ConversionReport, ProgressEvent, ProgressSink};
use crate::domain::ProcessingStatus;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch(result: &BatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &Value) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upload(result: &Value) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_conversion(report: &ConversionReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-facing output: progress on stderr, coloured summaries on stdout.
pub struct TerminalOutput;

impl TerminalOutput {
    pub fn print_batch(result: &BatchResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for item in &result.results {
            // pad before styling; styled content ignores width
            let label = format!("{:<10}", item.status.as_str());
            let status = match item.status {
                ProcessingStatus::Successful => label.green(),
                ProcessingStatus::Error => label.red(),
                ProcessingStatus::Pending | ProcessingStatus::Ongoing => label.yellow(),
            };
            writeln!(
                stdout,
                "{:>8}  {status}  peaks={:<3}  {}",
                item.id.get(), item.peaks, item.message
            )?;
        }
        let failed = result.failed();
        let total = result.results.len();
        let summary = format!("{} processed, {} failed", total - failed, failed);
        if failed == 0 {
            writeln!(stdout, "{}", summary.bold().green())
        } else {
            writeln!(stdout, "{}", summary.bold().red())
        }
    }

    pub fn print_conversion(report: &ConversionReport) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", report.name.as_str().bold())?;
        stdout.write_all(report.csv.as_bytes())?;
        if let Some(err) = &report.peak_error {
            writeln!(stdout, "{} {err}", "peak detection failed:".yellow())?;
        }
        writeln!(stdout, "{}", format!("{} peaks", report.peaks.len()).bold())?;
        for peak in report.peaks.iter() {
            writeln!(
                stdout,
                "  x={:<12} rank={:<3} height={:.4}",
                peak.position, peak.rank, peak.height
            )?;
        }
        Ok(())
    }
}

impl ProgressSink for TerminalOutput {
    fn event(&self, event: ProgressEvent) {
        let line = match event.elapsed {
            Some(elapsed) => format!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => event.message,
        };
        eprintln!("{}", line.dim());
    }
}
