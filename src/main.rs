mod config;
mod data_dir;
mod feed;
mod history;
mod hub;
mod overseer;
mod parser;
mod record;
mod serve;
mod signals;
mod status;
mod supervisor;
mod tail;
mod viewer;
mod worker;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Supervises one long-running worker process and streams its parsed log
/// output to any number of live viewers.
#[derive(Parser, Debug)]
#[command(name = "overseer", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "overseer.toml", global = true)]
    config: PathBuf,

    /// Worker log file (overrides config)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Print the resolved config and exit
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and supervise the worker (default)
    Serve {
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Start the worker right away
        #[arg(long)]
        start: bool,
    },
    /// Start the worker and print its parsed records to stdout, no HTTP
    Run,
    /// Print the last recorded worker status and exit
    Status,
    /// Parse a log file once and print one JSON record per line
    Parse { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "overseer=debug"
    } else {
        "overseer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(log_file) = &cli.log_file {
        config.worker.log_file = log_file.clone();
    }
    let command = cli.command.unwrap_or(Command::Serve {
        port: None,
        bind: None,
        start: false,
    });
    if let Command::Serve { port, bind, .. } = &command {
        if let Some(port) = port {
            config.serve.port = *port;
        }
        if let Some(bind) = bind {
            config.serve.bind = bind.clone();
        }
    }

    if cli.dry_run {
        return match toml::to_string_pretty(&config) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: failed to render config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let result = match command {
        Command::Status => print_status(&config),
        Command::Parse { file } => parse_file(&file, &config.tail),
        Command::Serve { start, .. } => supervise(config, Mode::Http { autostart: start }).await,
        Command::Run => supervise(config, Mode::Headless).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_status(config: &config::OverseerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dd = data_dir::DataDir::new(&config.storage.data_dir);
    let data = status::StatusFile::new(dd.status()).read()?;
    let uptime = data
        .started_at
        .map(|t| status::format_uptime((chrono::Local::now() - t).num_seconds().max(0) as u64));

    println!("state:      {}", data.state.as_str());
    match data.worker_pid {
        Some(pid) => println!("worker pid: {pid}"),
        None => println!("worker pid: -"),
    }
    if let Some(uptime) = uptime {
        println!("uptime:     {uptime}");
    }
    println!("log file:   {}", data.log_file.display());
    println!("overseer:   pid {}", data.overseer_pid);
    println!("updated:    {}", data.last_update.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

fn parse_file(path: &Path, limits: &config::TailConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut cursor = tail::TailCursor::new(path, limits.max_read_bytes);
    let mut splitter = tail::LineSplitter::new(limits.max_line_bytes);
    let mut lines = Vec::new();
    loop {
        match cursor.poll()? {
            tail::Poll::Missing => return Err(format!("{} does not exist", path.display()).into()),
            tail::Poll::Idle => break,
            tail::Poll::Data { bytes, .. } => lines.extend(splitter.push(&bytes)),
        }
    }
    lines.extend(splitter.flush());

    let mut parsed = 0;
    let mut fallback = 0;
    for line in &lines {
        let Some((format, record)) = parser::parse_line_with_format(line) else {
            continue;
        };
        parsed += 1;
        if format == parser::LineFormat::Fallback {
            fallback += 1;
        }
        println!("{}", serde_json::to_string(&record)?);
    }
    eprintln!(
        "{parsed} records from {} lines ({fallback} via keyword fallback)",
        lines.len()
    );
    Ok(())
}

enum Mode {
    Http { autostart: bool },
    Headless,
}

/// Prints log records as JSON lines; control messages are skipped.
struct StdoutSink;

impl viewer::ViewerSink for StdoutSink {
    type Error = serde_json::Error;

    async fn send(&mut self, message: viewer::ViewerMessage) -> Result<(), Self::Error> {
        if let viewer::ViewerMessage::Log(envelope) = message {
            println!("{}", serde_json::to_string(&envelope)?);
        }
        Ok(())
    }
}

async fn supervise(
    config: config::OverseerConfig,
    mode: Mode,
) -> Result<(), Box<dyn std::error::Error>> {
    let dd = data_dir::DataDir::new(&config.storage.data_dir);
    if dd.init()? {
        tracing::info!(path = %dd.root().display(), "created data directory");
    }
    let lock = data_dir::InstanceLock::acquire(&dd.lock())?;
    tracing::info!(
        data_dir = %dd.root().display(),
        lock = %lock.path().display(),
        "instance lock held"
    );

    let overseer = overseer::Overseer::new(&config, Some(status::StatusFile::new(dd.status())));
    overseer.reclaim_orphan().await;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor = overseer.spawn_monitor(shutdown_rx.clone());

    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        signals::wait_for_shutdown().await;
        let _ = signal_tx.send(true);
    });

    let result = match mode {
        Mode::Http { autostart } => {
            if autostart {
                report_start(&overseer).await;
            }
            serve_http(Arc::clone(&overseer), &config, shutdown_rx.clone()).await
        }
        Mode::Headless => {
            // Join before starting so startup output is printed too.
            let mut session = viewer::ViewerSession::open(
                overseer.feed(),
                0,
                Duration::from_secs(config.serve.heartbeat_secs),
            );
            report_start(&overseer).await;
            let mut sink = StdoutSink;
            let mut stop = shutdown_rx.clone();
            tokio::select! {
                reason = viewer::drive(&mut session, &mut sink, Duration::from_secs(config.serve.send_timeout_secs)) => {
                    tracing::warn!(?reason, "record output ended");
                }
                _ = stop.wait_for(|s| *s) => {}
            }
            session.close();
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    overseer.shutdown().await;
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "liveness monitor task failed");
    }
    signal_task.abort();
    tracing::info!("overseer stopped");
    result
}

async fn report_start(overseer: &overseer::Overseer) {
    let result = overseer.start().await;
    if result.success {
        tracing::info!(pid = ?result.pid, "{}", result.message);
    } else {
        tracing::error!("{}", result.message);
    }
}

#[cfg(feature = "serve")]
async fn serve_http(
    overseer: Arc<overseer::Overseer>,
    config: &config::OverseerConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    serve::run(overseer, &config.serve, shutdown).await
}

#[cfg(not(feature = "serve"))]
async fn serve_http(
    _overseer: Arc<overseer::Overseer>,
    _config: &config::OverseerConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!("built without the `serve` feature; supervising without HTTP");
    let _ = shutdown.wait_for(|s| *s).await;
    Ok(())
}
