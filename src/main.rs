use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use perfsentry::config::Config;
use perfsentry::driver::RankDriver;
use perfsentry::event::FunctionTable;
use perfsentry::ps::client::Client;
use perfsentry::ps::server::PsService;
use perfsentry::ps::{ParameterServer, StatsAggregator};
use perfsentry::reader::{FrameSource, NdjsonSource};
use perfsentry::sink::{NdjsonSink, Sink};

/// Streaming performance anomaly detection for instrumented HPC ranks.
#[derive(Parser)]
#[command(name = "perfsentry", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the parameter server until SIGINT/SIGTERM or POST /shutdown.
    Server,

    /// Process one rank's NDJSON frame trace.
    Analyze {
        /// Input trace, one JSON frame per line.
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for labelled frames. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Rank id stamped on every output frame.
        #[arg(long, default_value_t = 0)]
        rank: u64,

        /// Ask the parameter server to shut down once this rank is done.
        #[arg(long)]
        shutdown_server: bool,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("perfsentry {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize tracing.
    let level = cfg.log_filter(cli.log_level.as_deref());
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting perfsentry",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Server => serve(cfg).await,
            Command::Analyze {
                input,
                output,
                rank,
                shutdown_server,
            } => analyze(cfg, input, output, rank, shutdown_server).await,
            Command::Version => Ok(()),
        }
    })
}

async fn serve(cfg: Config) -> Result<()> {
    let store = Arc::new(ParameterServer::new());
    let service = PsService::new(store.clone(), &cfg.server)?;
    service.start().await.context("starting parameter server")?;

    let cancel = service
        .shutdown_token()
        .context("parameter server did not register a shutdown token")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = cancel.cancelled() => {}
    }

    // Graceful shutdown.
    service.stop().await?;

    if let Some(path) = &cfg.server.dump_path {
        let functions = store
            .dump(path)
            .with_context(|| format!("dumping statistics to {}", path.display()))?;
        tracing::info!(path = %path.display(), functions, "statistics dumped");
    }

    tracing::info!("perfsentry stopped");

    Ok(())
}

async fn analyze(
    cfg: Config,
    input: PathBuf,
    output: Option<PathBuf>,
    rank: u64,
    shutdown_server: bool,
) -> Result<()> {
    let mut source = NdjsonSource::open(&input)?;

    let client = if cfg.client.endpoint.is_empty() {
        tracing::info!(rank, "no parameter server configured, using local statistics");
        None
    } else {
        tracing::info!(rank, endpoint = %cfg.client.endpoint, "using parameter server");
        Some(Client::new(&cfg.client).context("creating parameter server client")?)
    };

    match &output {
        Some(path) => {
            let mut sink = NdjsonSink::create(path)?;
            run_rank(&cfg, rank, &mut source, &mut sink, client.as_ref()).await?;
        }
        None => {
            let mut sink = NdjsonSink::new("stdout", std::io::stdout());
            run_rank(&cfg, rank, &mut source, &mut sink, client.as_ref()).await?;
        }
    }

    if shutdown_server {
        if let Some(client) = &client {
            let reply = client
                .shutdown()
                .await
                .context("shutting down parameter server")?;
            tracing::info!(reply = %reply, "parameter server shutdown requested");
        }
    }

    Ok(())
}

async fn run_rank<S, K, A>(
    cfg: &Config,
    rank: u64,
    source: &mut S,
    sink: &mut K,
    aggregator: Option<&A>,
) -> Result<()>
where
    S: FrameSource,
    K: Sink,
    A: StatsAggregator,
{
    let mut driver = RankDriver::new(rank, FunctionTable::new(), cfg.detector.clone(), aggregator);
    let report = driver.run(source, sink).await?;

    if let Some(step) = report.aborted_at {
        tracing::warn!(rank, step, "rank halted on a call-stack violation");
    }

    Ok(())
}
