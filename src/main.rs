//! InsideOut telemetry monitor CLI
//!
//! Polls the inference backend, keeps the running EDA aggregate and shows
//! the reconciled dashboard view.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use insideout_telemetry::{
    aggregate::{AggregateUpdater, FileAggregateStore},
    config::Config,
    gate::{Identity, MountOutcome, SessionProvider, SessionState, ViewMounts},
    inference::{InferenceClient, InferenceConfig},
    reconcile::{DashboardView, ReconcilerConfig, ReconcilerDeps, ReconcilerHub},
    stats::{create_shared_stats_with_persistence, LoopStats, SharedStats},
    status::BroadcastStatusFeed,
    VERSION,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "insideout-monitor")]
#[command(author = "InsideOut")]
#[command(version = VERSION)]
#[command(about = "Telemetry reconciliation for the elderly-monitoring dashboard", long_about = None)]
struct Cli {
    /// Override the inference backend URL
    #[arg(long, global = true)]
    url: Option<String>,

    /// Override the monitored subject
    #[arg(long, global = true)]
    subject: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop and print the dashboard view
    ///
    /// The status feed here is local to this process and nothing writes to
    /// it, so status shows N/A. Use `serve` and `POST /status` to feed it.
    Run {
        /// Signed-in user id; without it the session is a guest
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        email: Option<String>,
    },

    /// Serve the dashboard view over HTTP (requires the server feature)
    Serve {
        /// Port to bind to (0 for random)
        #[arg(long, default_value = "8787")]
        port: u16,

        /// Sign this user in at startup
        #[arg(long)]
        user: Option<String>,
    },

    /// Fetch the latest reading once
    Latest,

    /// Check whether the inference backend is reachable
    Probe,

    /// Inspect or change the running aggregate
    Aggregate {
        #[command(subcommand)]
        action: AggregateAction,
    },

    /// Show loop statistics
    Stats {
        /// Reset all counters
        #[arg(long)]
        reset: bool,
    },

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum AggregateAction {
    /// Show the stored aggregate
    Show,
    /// Blend one sample into the aggregate
    Apply { sample: f64 },
    /// Clear the aggregate so the next sample starts it cold
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("loading configuration")?;
    if let Some(url) = cli.url {
        config.inference_url = url;
    }
    if let Some(subject) = cli.subject {
        config.subject_id = subject;
    }
    config.validate()?;

    match cli.command {
        Commands::Run { user, email } => cmd_run(&config, user, email).await,
        Commands::Serve { port, user } => cmd_serve(&config, port, user).await,
        Commands::Latest => cmd_latest(&config).await,
        Commands::Probe => cmd_probe(&config).await,
        Commands::Aggregate { action } => cmd_aggregate(&config, action).await,
        Commands::Stats { reset } => cmd_stats(&config, reset),
        Commands::Config { save } => cmd_config(&config, save),
    }
}

fn inference_client(config: &Config) -> Result<InferenceClient> {
    let inference = InferenceConfig::new(config.inference_url.clone())
        .with_timeout(config.request_timeout)
        .with_timezone(config.timezone()?);
    Ok(InferenceClient::new(inference)?)
}

fn aggregate_updater(config: &Config) -> AggregateUpdater {
    let store = FileAggregateStore::new(config.aggregate_store_path());
    AggregateUpdater::new(Arc::new(store), config.max_write_attempts)
}

fn stats(config: &Config) -> SharedStats {
    create_shared_stats_with_persistence(config.stats_path())
}

/// Cancel the returned token on Ctrl+C.
fn ctrlc_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("setting Ctrl+C handler")?;
    Ok(token)
}

async fn cmd_run(config: &Config, user: Option<String>, email: Option<String>) -> Result<()> {
    println!("InsideOut Monitor v{VERSION}");
    println!();

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let stats = stats(config);
    let deps = ReconcilerDeps {
        source: Arc::new(inference_client(config)?),
        updater: aggregate_updater(config),
        feed: Arc::new(BroadcastStatusFeed::default()),
        stats: stats.clone(),
    };
    let hub = Arc::new(ReconcilerHub::new(ReconcilerConfig::from_config(config), deps));
    let mut mounts = ViewMounts::new(hub.clone(), config.subject_id.clone());

    let sessions = SessionProvider::new();
    sessions.publish(user.map(|uid| {
        let identity = Identity::new(uid);
        match email {
            Some(email) => identity.with_email(email),
            None => identity,
        }
    }));
    mounts.on_session(sessions.current()).await;

    let mut observer = match mounts.mount("/").await? {
        MountOutcome::Mounted {
            observer: Some(observer),
            ..
        } => observer,
        MountOutcome::Redirect(to) => {
            println!("Not signed in; redirecting to {to}");
            println!("Pass --user <id> to sign in.");
            return Ok(());
        }
        _ => {
            println!("Not signed in; nothing to monitor.");
            println!("Pass --user <id> to sign in.");
            return Ok(());
        }
    };

    println!("Inference backend: {}", config.inference_url);
    println!("Subject: {}", config.subject_id);
    println!("Poll interval: {}ms", config.poll_interval.as_millis());
    println!("Status feed: local only (use `serve` and POST /status for live status)");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let cancel = ctrlc_token()?;
    if let SessionState::Resolved(Some(identity)) = sessions.current() {
        tracing::info!(uid = %identity.uid, "Monitoring as signed-in user");
    }

    loop {
        let view = tokio::select! {
            _ = cancel.cancelled() => break,
            view = observer.changed() => view,
        };
        match view {
            Some(view) => println!("{}", render(&view)),
            None => break,
        }
    }

    println!();
    println!("Stopping...");
    hub.shutdown().await;

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save stats: {e}");
    }
    println!("{}", stats.summary());
    Ok(())
}

#[cfg(feature = "server")]
async fn cmd_serve(config: &Config, port: u16, user: Option<String>) -> Result<()> {
    use insideout_telemetry::server::{run, ServerConfig, ServerServices};

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let sessions = SessionProvider::new();
    let stats = stats(config);
    let services = ServerServices {
        source: Arc::new(inference_client(config)?),
        updater: aggregate_updater(config),
        feed: BroadcastStatusFeed::default(),
        sessions: sessions.clone(),
        stats: stats.clone(),
    };
    let server_config = ServerConfig::new(port, ReconcilerConfig::from_config(config));
    let (addr, shutdown_tx) = run(server_config, services).await?;

    match user {
        Some(uid) => sessions.publish(Some(Identity::new(uid))),
        None => sessions.publish(None),
    }

    println!("Serving on http://{addr}");
    println!("Press Ctrl+C to stop");

    let cancel = ctrlc_token()?;
    cancel.cancelled().await;

    let _ = shutdown_tx.send(());
    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save stats: {e}");
    }
    Ok(())
}

#[cfg(not(feature = "server"))]
async fn cmd_serve(_config: &Config, _port: u16, _user: Option<String>) -> Result<()> {
    eprintln!("Error: serve requires the server feature (not enabled at compile time)");
    std::process::exit(1);
}

async fn cmd_latest(config: &Config) -> Result<()> {
    let client = inference_client(config)?;
    let reading = client.latest().await?;

    println!("Sensor value: {}", reading.sensor_value);
    println!("Emotion:      {}", reading.emotion);
    println!("Workload:     {}", reading.workload);
    if let Some(observed_at) = reading.emotion.observed_at {
        println!("Observed at:  {}", observed_at.to_rfc3339());
    }
    Ok(())
}

async fn cmd_probe(config: &Config) -> Result<()> {
    let client = inference_client(config)?;
    match client.test_connection().await {
        Ok(true) => println!("Inference backend at {}: OK", config.inference_url),
        Ok(false) => println!("Inference backend at {}: unhealthy", config.inference_url),
        Err(e) => println!("Inference backend at {}: {e}", config.inference_url),
    }
    Ok(())
}

async fn cmd_aggregate(config: &Config, action: AggregateAction) -> Result<()> {
    let updater = aggregate_updater(config);
    let subject = &config.subject_id;

    match action {
        AggregateAction::Show => match updater.current(subject).await? {
            Some(value) => println!("{subject}: {value}"),
            None => println!("{subject}: no aggregate yet"),
        },
        AggregateAction::Apply { sample } => {
            if let Err(e) = config.ensure_directories() {
                eprintln!("Warning: Could not create directories: {e}");
            }
            let update = updater.apply(subject, sample).await?;
            println!(
                "{subject}: {} (version {}, {} attempt(s))",
                update.value, update.version, update.attempts
            );
        }
        AggregateAction::Reset => {
            if updater.reset(subject).await? {
                println!("{subject}: aggregate cleared");
            } else {
                println!("{subject}: nothing to clear");
            }
        }
    }
    Ok(())
}

fn cmd_stats(config: &Config, reset: bool) -> Result<()> {
    let stats = LoopStats::with_persistence(config.stats_path());
    if reset {
        stats.reset();
        stats.save()?;
        println!("Statistics reset.");
        return Ok(());
    }
    println!("{}", stats.summary());
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);

    if save {
        config.save()?;
        println!();
        println!("Saved.");
    }
    Ok(())
}

fn render(view: &DashboardView) -> String {
    let reading = match &view.reading {
        Some(r) => format!(
            "eda {:.3} | emotion {} | workload {}",
            r.sensor_value, r.emotion, r.workload
        ),
        None => "no reading yet".to_string(),
    };
    let aggregate = view
        .aggregate
        .map(|a| format!("{a:.3}"))
        .unwrap_or_else(|| "N/A".to_string());

    let mut line = format!(
        "[#{}] {} | avg {} | status {}",
        view.sequence, reading, aggregate, view.status
    );
    for fault in [&view.fetch_error, &view.store_warning, &view.subscription_error]
        .into_iter()
        .flatten()
    {
        line.push_str(&format!(" | ! {fault}"));
    }
    if view.backend_reachable == Some(false) {
        line.push_str(" | backend unreachable");
    }
    line
}
