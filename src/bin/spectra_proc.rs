use std::process::ExitCode;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use spectra_processor::app::{self, App, ProgressSink};
use spectra_processor::auth::{AuthSession, HttpTokenIssuer};
use spectra_processor::client::SpectraHttpClient;
use spectra_processor::config::{ConfigLoader, FinalStatusPolicy, Settings};
use spectra_processor::domain::{SpectrumFormat, SpectrumId};
use spectra_processor::error::ProcessingError;
use spectra_processor::output::{JsonOutput, OutputMode, TerminalOutput};
use spectra_processor::peaks::PeakDetector;

/// Exit code when at least one spectrum finished with status `error`.
const EXIT_SPECTRUM_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "spectra-proc")]
#[command(about = "Normalize FTIR/XRF spectra, detect peaks and write the results back")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Settings file (defaults to ./spectra-processor.json)
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Process spectra by id")]
    Process(ProcessArgs),
    #[command(about = "List spectra held by the record service")]
    List,
    #[command(about = "Create a spectrum from a local file")]
    Upload(UploadArgs),
    #[command(about = "Convert a local file and detect peaks, without remote calls")]
    Convert(ConvertArgs),
}

#[derive(Args)]
struct ProcessArgs {
    #[arg(required = true)]
    ids: Vec<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum)]
    final_status: Option<FinalStatusPolicy>,
}

#[derive(Args)]
struct UploadArgs {
    sample_id: u64,
    file: Utf8PathBuf,
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(long, value_enum)]
    format: SpectrumFormat,
    file: Utf8PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<ProcessingError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &ProcessingError) -> u8 {
    match error {
        ProcessingError::MissingSetting(_)
        | ProcessingError::ConfigRead(_)
        | ProcessingError::ConfigParse(_)
        | ProcessingError::InvalidSpectrumId(_) => 2,
        ProcessingError::Auth { .. }
        | ProcessingError::Transport(_)
        | ProcessingError::RemoteStatus { .. }
        | ProcessingError::InvalidRecord(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &TerminalOutput,
        OutputMode::NonInteractive => &JsonOutput,
    };

    match cli.command {
        Commands::Convert(args) => {
            let report = app::convert_file(&args.file, args.format, &PeakDetector::default(), sink)?;
            let printed = match output_mode {
                OutputMode::Interactive => TerminalOutput::print_conversion(&report),
                OutputMode::NonInteractive => JsonOutput::print_conversion(&report),
            };
            printed.into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let settings = ConfigLoader::resolve(cli.config.as_deref())?;
            let app = App::new(build_client(&settings)?, settings.final_status);
            let listing = app.list(sink)?;
            JsonOutput::print_list(&listing).into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Upload(args) => {
            let settings = ConfigLoader::resolve(cli.config.as_deref())?;
            let app = App::new(build_client(&settings)?, settings.final_status);
            let created = app.upload(args.sample_id, &args.file, sink)?;
            JsonOutput::print_upload(&created).into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Process(args) => run_process(args, cli.config.as_deref(), output_mode, sink),
    }
}

fn run_process(
    args: ProcessArgs,
    config: Option<&Utf8Path>,
    output_mode: OutputMode,
    sink: &dyn ProgressSink,
) -> miette::Result<ExitCode> {
    let ids = args
        .ids
        .iter()
        .map(|id| id.parse::<SpectrumId>())
        .collect::<Result<Vec<_>, _>>()?;
    let settings = ConfigLoader::resolve(config)?;
    let final_status = args.final_status.unwrap_or(settings.final_status);
    let workers = args.workers.unwrap_or(settings.workers).max(1);

    let app = App::new(build_client(&settings)?, final_status);
    let batch = app.process_many(&ids, workers, sink);
    let printed = match output_mode {
        OutputMode::Interactive => TerminalOutput::print_batch(&batch),
        OutputMode::NonInteractive => JsonOutput::print_batch(&batch),
    };
    printed.into_diagnostic()?;

    if batch.failed() > 0 {
        Ok(ExitCode::from(EXIT_SPECTRUM_FAILED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn build_client(settings: &Settings) -> Result<SpectraHttpClient, ProcessingError> {
    let issuer = HttpTokenIssuer::new(&settings.base_url, settings.request_timeout)?;
    let session = AuthSession::new(
        issuer,
        settings.credentials.clone(),
        settings.token_max_age_secs,
        settings.auth_retry,
    );
    SpectraHttpClient::new(
        &settings.base_url,
        settings.request_timeout,
        Arc::new(session),
        settings.data_retry,
    )
}
