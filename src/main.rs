//! portblock - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use portblock::config::{ProxyConfig, ReplayConfig};
use portblock::events::EventBus;
use portblock::replay::{MatchMode, ReplayFallback};
use portblock::server::{self, ServerConfig};
use portblock::{Engine, MockConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "portblock",
    about = "Stateful mock API server - schema-driven CRUD, validation, chaos, proxy and replay",
    version
)]
struct Args {
    /// Path to configuration file (YAML, or JSON by extension)
    #[arg(short, long, default_value = "portblock.yaml")]
    config: PathBuf,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 4000)]
    port: u16,

    /// Seed for reproducible fake data and chaos decisions
    #[arg(long)]
    seed: Option<u64>,

    /// Reject invalid bodies and unknown fields
    #[arg(long)]
    strict: bool,

    /// Enable chaos mode with the built-in rules
    #[arg(long)]
    chaos: bool,

    /// Skip auth simulation
    #[arg(long)]
    no_auth: bool,

    /// Forward unmatched requests to this upstream
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// Record proxied exchanges to this file
    #[arg(long, value_name = "FILE", requires = "proxy")]
    record: Option<PathBuf>,

    /// Answer from recorded exchanges in this file
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut MockConfig) {
        if let Some(seed) = self.seed {
            config.settings.seed = Some(seed);
        }
        if self.strict {
            config.settings.strict = true;
        }
        if self.no_auth {
            config.settings.no_auth = true;
        }
        if self.chaos {
            config.chaos.enabled = true;
            config.chaos.preset = true;
        }
        if let Some(target) = &self.proxy {
            let proxy = config.proxy.get_or_insert_with(|| ProxyConfig {
                target: target.clone(),
                timeout_ms: 10_000,
                fallback: true,
                record: None,
            });
            proxy.target = target.clone();
            proxy.fallback = true;
            if let Some(record) = &self.record {
                proxy.record = Some(record.clone());
            }
        }
        if let Some(recordings) = &self.replay {
            config.replay = Some(ReplayConfig {
                recordings: recordings.clone(),
                query: MatchMode::Exact,
                body: MatchMode::Ignored,
                fallback: ReplayFallback::Mock,
                all_routes: true,
            });
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print example config if requested
    if args.print_config {
        let example_config = include_str!("../demos/portblock.yaml");
        println!("{}", example_config);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no schemas)");
        MockConfig::default()
    };
    args.apply(&mut config);

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        Engine::new(config.clone())?;
        println!(
            "Configuration is valid ({} schemas, {} routes defined)",
            config.schemas.len(),
            config.routes.len()
        );
        return Ok(());
    }

    let events = EventBus::new(config.settings.event_buffer);
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => info!(
                    event = %event.name(),
                    id = %event.id,
                    revision = event.revision,
                    "Resource changed"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let engine = Arc::new(
        Engine::builder(config)
            .with_event_sink(Arc::new(events))
            .build()?,
    );

    let listener = server::bind(&ServerConfig::new(args.host.clone(), args.port)).await?;
    server::serve(listener, Arc::clone(&engine), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    if let Some(recorder) = engine.recorder() {
        recorder.save()?;
    }

    let stats = engine.stats();
    info!(
        requests = stats.requests_total,
        matched = stats.requests_matched,
        unmatched = stats.requests_unmatched,
        rejected = stats.requests_rejected,
        chaos = stats.chaos_injected,
        drift = stats.drift_detected,
        "Shutdown complete"
    );
    Ok(())
}
