use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conclave::{
    CollaborationRequest, EngineConfig, HttpEndpoint, HttpResponder, Output, Priority,
    ResponderRouter, SessionEvent, SessionOrchestrator,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Per-call HTTP timeout; round deadlines cut calls off well before this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (TOML). Falls back to CONCLAVE_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one collaboration session and print its output
    Run {
        /// Task for the participants. Ignored when --request is given.
        prompt: Option<String>,

        /// Read the full request from a JSON file
        #[arg(long)]
        request: Option<PathBuf>,

        /// Session time limit in seconds
        #[arg(long)]
        time_limit: Option<u64>,

        /// Round cap (clamped to the configured round limit)
        #[arg(long)]
        max_rounds: Option<u32>,

        /// low, medium, high or critical
        #[arg(long)]
        priority: Option<Priority>,

        /// Only use these responder ids
        #[arg(long = "responder")]
        responders: Vec<String>,

        /// Extra context file appended to the task
        #[arg(long)]
        context: Option<PathBuf>,

        /// Print the output as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Probe every configured responder endpoint
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run {
            prompt,
            request,
            time_limit,
            max_rounds,
            priority,
            responders,
            context,
            json,
        } => {
            let mut req = match request {
                Some(path) => read_request(&path)?,
                None => match prompt {
                    Some(p) => CollaborationRequest::new(p),
                    None => bail!("either a prompt or --request is required"),
                },
            };
            if let Some(secs) = time_limit {
                req = req.with_time_limit(Duration::from_secs(secs));
            }
            if let Some(rounds) = max_rounds {
                req = req.with_max_rounds(rounds);
            }
            if let Some(priority) = priority {
                req = req.with_priority(priority);
            }
            if !responders.is_empty() {
                req = req.with_responders(responders);
            }
            if let Some(path) = context {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading context file {}", path.display()))?;
                req = req.with_context(text);
            }
            let output = run(config, req).await?;
            print_output(&output, json)?;
        }
        Command::Check => check(&config).await?,
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("CONCLAVE_CONFIG").map(PathBuf::from));
    let mut config = match path {
        Some(p) => EngineConfig::load(&p).with_context(|| format!("loading {}", p.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("applying CONCLAVE_* overrides")?;
    if config.responders.is_empty() {
        bail!("no responders configured; add [[responders]] entries to the config file");
    }
    Ok(config)
}

fn read_request(path: &Path) -> Result<CollaborationRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading request {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing request {}", path.display()))
}

fn build_router(config: &EngineConfig) -> Result<ResponderRouter> {
    let mut router = ResponderRouter::new();
    for cfg in &config.responders {
        let endpoint = HttpEndpoint::from_config(cfg);
        let responder = HttpResponder::new(endpoint, HTTP_TIMEOUT)
            .with_context(|| format!("building HTTP client for {}", cfg.id))?;
        router.insert(cfg.id.clone(), Arc::new(responder));
    }
    Ok(router)
}

async fn run(config: EngineConfig, request: CollaborationRequest) -> Result<Output> {
    let router = build_router(&config)?;
    let orchestrator = SessionOrchestrator::builder(config, Arc::new(router)).build()?;

    let session = orchestrator.start_session(request)?;
    info!(session_id = %session.id, "{}", session.status_line());

    let (history, mut rx) = orchestrator.subscribe(&session.id)?;
    let logger = tokio::spawn(async move {
        for event in &history {
            log_event(event);
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    log_event(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let output = tokio::select! {
        result = orchestrator.wait_for_completion(&session.id) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; finalizing with the rounds so far");
            orchestrator.complete_session(&session.id).await?
        }
    };
    if let Err(e) = logger.await {
        warn!(error = %e, "Event logger stopped");
    }
    orchestrator.dispose();
    Ok(output)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::RoundStarted {
            round,
            phase,
            targets,
            ..
        } => info!(round, %phase, targets = ?targets, "round started"),
        SessionEvent::ContributionReceived {
            round,
            author_id,
            confidence,
            tokens,
            latency_ms,
            ..
        } => info!(round, author = %author_id, confidence, tokens, latency_ms, "contribution"),
        SessionEvent::ContributionFailed {
            round,
            responder_id,
            error,
            ..
        } => warn!(round, responder = %responder_id, error = %error, "contribution failed"),
        SessionEvent::DeadlineWarning {
            scope,
            round,
            fraction,
            remaining_ms,
            ..
        } => warn!(%scope, ?round, fraction, remaining_ms, "deadline approaching"),
        SessionEvent::RoundFailed { round, reason, .. } => {
            warn!(round, reason = %reason, "round failed")
        }
        other => info!(event = other.event_type(), round = ?other.round(), "session event"),
    }
}

fn print_output(output: &Output, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(output)?);
    } else {
        eprintln!("{}", output.summary());
        println!("{}", output.content);
    }
    Ok(())
}

async fn check(config: &EngineConfig) -> Result<()> {
    let probes = config.responders.iter().map(|cfg| async move {
        let endpoint = HttpEndpoint::from_config(cfg);
        let url = endpoint.models_url();
        let result = match HttpResponder::new(endpoint, Duration::from_secs(10)) {
            Ok(responder) => responder.probe().await,
            Err(e) => Err(e),
        };
        (cfg.id.as_str(), url, result)
    });

    let mut failures = 0;
    for (id, url, result) in futures::future::join_all(probes).await {
        match result {
            Ok(()) => info!(responder = id, %url, "reachable"),
            Err(e) => {
                failures += 1;
                warn!(responder = id, %url, error = %e, "unreachable");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} responders unreachable", config.responders.len());
    }
    Ok(())
}
