use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    CancelOutcome, CancelReport, CancelResult, ConversionInput, ConversionSession, LocalFile,
    ProgressView, SessionEvent,
};
use shared::{
    domain::{ConversionMode, JobId},
    protocol::ConversionResult,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, Overrides};

const RENDER_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "mdconv", about = "Convert documents to Markdown and follow their progress")]
struct Cli {
    #[arg(long, global = true)]
    server_url: Option<String>,
    #[arg(long, global = true)]
    ws_url: Option<String>,
    /// TOML file with client settings (defaults to ./mdconv.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Client-side timeout for REST calls, in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit files and URLs, then follow the active job.
    Convert(ConvertArgs),
    /// List input formats the backend accepts.
    Formats,
    Health,
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Ask the backend to cancel specific jobs.
    Cancel {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Download {
        name: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print every progress event until interrupted.
    Watch,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local paths, or URLs starting with http:// or https://.
    #[arg(required = true)]
    inputs: Vec<String>,
    #[arg(long)]
    ai: bool,
    /// Print the submission results without following progress.
    #[arg(long)]
    no_watch: bool,
    /// Directory for returned Markdown content.
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Print results as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Show,
    SetKey { key: String },
    TestKey { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let settings = load_settings(
        cli.config.as_deref(),
        &Overrides {
            server_url: cli.server_url.clone(),
            ws_url: cli.ws_url.clone(),
            request_timeout_secs: cli.timeout,
        },
    )?;
    let session = ConversionSession::from_config(&settings)
        .with_context(|| format!("invalid server settings for {}", settings.server_url))?;

    let outcome = run(&session, cli.command).await;
    session.shutdown().await;
    outcome
}

async fn run(session: &Arc<ConversionSession>, command: Command) -> Result<()> {
    match command {
        Command::Convert(args) => convert(session, args).await,
        Command::Formats => {
            for format in session.supported_formats().await? {
                println!("{format}");
            }
            Ok(())
        }
        Command::Health => {
            let health = session.health().await?;
            println!("{} (version {}, {})", health.status, health.version, health.timestamp);
            Ok(())
        }
        Command::Settings(SettingsCommand::Show) => {
            let settings = session.api_settings().await?;
            println!("configured: {}", settings.is_configured);
            if let Some(key) = settings.api_key {
                println!("key: {key}");
            }
            Ok(())
        }
        Command::Settings(SettingsCommand::SetKey { key }) => {
            let settings = session.configure_api_key(&key).await?;
            println!("configured: {}", settings.is_configured);
            Ok(())
        }
        Command::Settings(SettingsCommand::TestKey { key }) => {
            let tested = session.test_api_key(&key).await?;
            if tested.is_valid {
                println!("key is valid");
                Ok(())
            } else {
                bail!(
                    "key rejected: {}",
                    tested.error_message.unwrap_or_else(|| "no reason given".into())
                )
            }
        }
        Command::Cancel { ids } => {
            let ids: Vec<JobId> = ids.into_iter().map(JobId::from).collect();
            let reports = session.cancel_ids(&ids).await;
            print_cancel_reports(&reports);
            let failed = reports
                .iter()
                .filter(|report| matches!(report.result, CancelResult::Failed(_)))
                .count();
            if failed > 0 {
                bail!("{failed} of {} cancellation requests failed", reports.len());
            }
            Ok(())
        }
        Command::Download { name, out } => {
            let bytes = session.download(&name).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(&name));
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("saved {} bytes to {}", bytes.len(), out.display());
            Ok(())
        }
        Command::Watch => watch(session).await,
    }
}

async fn collect_inputs(raw: &[String]) -> Result<Vec<ConversionInput>> {
    let mut inputs = Vec::with_capacity(raw.len());
    for item in raw {
        if item.starts_with("http://") || item.starts_with("https://") {
            inputs.push(ConversionInput::RemoteUrl(item.clone()));
        } else {
            inputs.push(ConversionInput::LocalFile(LocalFile::read(item).await?));
        }
    }
    Ok(inputs)
}

async fn convert(session: &Arc<ConversionSession>, args: ConvertArgs) -> Result<()> {
    let inputs = collect_inputs(&args.inputs).await?;
    let mode = if args.ai {
        ConversionMode::AiEnhanced
    } else {
        ConversionMode::Standard
    };
    if !args.no_watch {
        session.start().await;
    }

    let results = tokio::select! {
        submitted = session.submit(inputs, mode) => submitted?,
        _ = tokio::signal::ctrl_c() => {
            print_cancel_outcome(&session.cancel().await);
            bail!("interrupted before the backend accepted the submission");
        }
    };

    if !args.no_watch {
        follow_active_job(session).await?;
    }

    let results = if args.no_watch {
        results
    } else {
        session.results().await
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }
    if let Some(dir) = &args.save_dir {
        save_markdown(dir, &results).await?;
    }
    Ok(())
}

async fn follow_active_job(session: &Arc<ConversionSession>) -> Result<()> {
    let mut ticker = tokio::time::interval(RENDER_INTERVAL);
    let mut last: Option<ProgressView> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let view = session.active_progress().await;
                if last.as_ref() != Some(&view) {
                    render(&view);
                    last = Some(view);
                }
                if !session.is_converting().await {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, cancelling");
                print_cancel_outcome(&session.cancel().await);
                return Ok(());
            }
        }
    }
}

async fn watch(session: &Arc<ConversionSession>) -> Result<()> {
    let mut events = session.subscribe_events();
    session.start().await;
    println!("listening on {}", session.push_url());
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::ConnectionChanged { connected }) => {
                    println!("{}", if connected { "connected" } else { "disconnected, retrying" });
                }
                Ok(SessionEvent::ProgressUpdated(snapshot)) => {
                    println!(
                        "{} {:>3}% {} {}",
                        snapshot.id,
                        snapshot.percent,
                        snapshot.status.as_str(),
                        snapshot.current_step.as_deref().unwrap_or("")
                    );
                }
                Ok(SessionEvent::JobExpired { id }) => println!("{id} expired"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn render(view: &ProgressView) {
    let label = view.file_name.as_deref().unwrap_or("-");
    let step = view.current_step.as_deref().unwrap_or("");
    match &view.id {
        Some(id) => println!(
            "[{:>3}%] {:<10} {label} ({id}) {step}",
            view.percent,
            view.status.as_str()
        ),
        None => println!(
            "[{:>3}%] {:<10} {label} {step}",
            view.percent,
            view.status.as_str()
        ),
    }
}

fn print_results(results: &[ConversionResult]) {
    for result in results {
        let output = result.output_file.as_deref().unwrap_or("-");
        println!(
            "{}\t{}\t{}\t{output}",
            result.id,
            result.status.as_str(),
            result.input_file
        );
        if let Some(error) = &result.error_message {
            println!("\terror: {error}");
        }
    }
}

fn print_cancel_outcome(outcome: &CancelOutcome) {
    match outcome {
        CancelOutcome::NothingToCancel => println!("nothing to cancel"),
        CancelOutcome::Requested(reports) => print_cancel_reports(reports),
    }
}

fn print_cancel_reports(reports: &[CancelReport]) {
    for report in reports {
        match &report.result {
            CancelResult::Accepted(message) => println!("{}: {message}", report.id),
            CancelResult::Rejected(message) => println!("{}: not cancelled ({message})", report.id),
            CancelResult::Failed(error) => println!("{}: request failed ({error})", report.id),
        }
    }
}

fn markdown_file_name(result: &ConversionResult) -> String {
    let name = result
        .output_file
        .as_deref()
        .and_then(|output| Path::new(output).file_name())
        .map(|name| name.to_string_lossy().into_owned());
    name.unwrap_or_else(|| format!("{}.md", result.id))
}

async fn save_markdown(dir: &Path, results: &[ConversionResult]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    for result in results {
        let Some(content) = &result.markdown_content else {
            continue;
        };
        let path = dir.join(markdown_file_name(result));
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
