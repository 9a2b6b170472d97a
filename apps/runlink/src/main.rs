use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use runlink_mock::demo_script;
use runlink_protocol::{RunIdentity, RunStatus};
use runlink_session::{
    ConnectionIndicator, NodeStatus, RunHandlers, RunSessionController, SessionConfig, StartRun,
};
use runlink_transport::TransportKind;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "runlink")]
#[command(about = "Follow a long-running agent run from the terminal")]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        env = "RUNLINK_LOG_FORMAT",
        default_value_t = LogFormat::Compact
    )]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach to a run and print its output until it finishes.
    Watch(WatchArgs),
    /// Serve a scripted demo backend.
    Mock(MockArgs),
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long, env = "RUNLINK_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "RUNLINK_THREAD")]
    thread: String,
    #[arg(long, env = "RUNLINK_RUN")]
    run: String,
    #[arg(long, env = "RUNLINK_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long, value_enum, env = "RUNLINK_TRANSPORT")]
    transport: Option<TransportArg>,
    /// JSON session config; flags override it.
    #[arg(long, env = "RUNLINK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MockArgs {
    #[arg(long, env = "RUNLINK_MOCK_LISTEN", default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Duplex,
    Stream,
    Polling,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Duplex => Self::Duplex,
            TransportArg::Stream => Self::Stream,
            TransportArg::Polling => Self::Polling,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    match cli.command {
        Command::Watch(args) => watch(args).await,
        Command::Mock(args) => {
            mock(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(args: &WatchArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            SessionConfig::from_json(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url.clone_from(base_url);
    }
    Ok(config)
}

async fn watch(args: WatchArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let controller = RunSessionController::new(config).context("invalid session configuration")?;

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    controller.set_handlers(Arc::new(ConsoleHandlers { outcome: outcome_tx }));

    let mut run = StartRun::new(RunIdentity::new(args.thread, args.run), args.token);
    if let Some(transport) = args.transport {
        run = run.with_transport(transport.into());
    }
    controller.start(run).context("failed to start run session")?;

    let outcome = tokio::select! {
        outcome = outcome_rx.recv() => outcome,
        () = shutdown_signal() => {
            info!("interrupted, detaching from run");
            None
        }
    };
    controller.stop();

    Ok(match outcome {
        Some(Outcome::Completed(status)) if status.is_success() => ExitCode::SUCCESS,
        Some(Outcome::Completed(status)) => {
            warn!(%status, "run did not succeed");
            ExitCode::FAILURE
        }
        Some(Outcome::Failed(message)) => {
            error!(%message, "run session failed");
            ExitCode::FAILURE
        }
        None => ExitCode::from(130),
    })
}

async fn mock(args: MockArgs) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    runlink_mock::serve(listener, demo_script(), shutdown_signal()).await?;
    Ok(())
}

#[derive(Debug)]
enum Outcome {
    Completed(RunStatus),
    Failed(String),
}

/// Streams text to stdout; everything else goes to the log.
struct ConsoleHandlers {
    outcome: mpsc::UnboundedSender<Outcome>,
}

impl RunHandlers for ConsoleHandlers {
    fn on_delta(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(error) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
            debug!(%error, "stdout closed");
        }
    }

    fn on_values_updated(&self, values: &Map<String, Value>) {
        let keys: Vec<&str> = values.keys().map(String::as_str).collect();
        debug!(?keys, "values updated");
    }

    fn on_node_status(&self, node: &str, status: NodeStatus) {
        info!(node, ?status, "node");
    }

    fn on_interrupt(&self, question: &str, fields: &[String], interrupt_id: Option<&str>) {
        println!();
        println!("? {question}");
        info!(?fields, interrupt_id, "run is waiting for input");
    }

    fn on_completed(&self, status: &RunStatus) {
        println!();
        info!(%status, "run finished");
        let _ = self.outcome.send(Outcome::Completed(status.clone()));
    }

    fn on_error(&self, message: &str) {
        let _ = self.outcome.send(Outcome::Failed(message.to_owned()));
    }

    fn on_connection(&self, indicator: &ConnectionIndicator) {
        match indicator {
            ConnectionIndicator::Reconnecting { attempt, delay } => {
                warn!(attempt, ?delay, "connection lost, reconnecting");
            }
            ConnectionIndicator::Polling => warn!("live stream unavailable, polling for updates"),
            other => debug!(indicator = ?other, "connection"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
