//! WolfLease - Lease-Based Leader Election
//!
//! Runs one election participant and optionally serves its view of the
//! election over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolflease::api::StatusServer;
use wolflease::config::{parse_duration, StoreBackend, WolfLeaseConfig};
use wolflease::election::{LeaderElector, LeaderEvent};
use wolflease::error::{Error, Result};
use wolflease::lock::{EventRecorder, LockStore, MemoryLockStore, ResourceLock, SqliteLockStore};
use tokio_util::sync::CancellationToken;

/// WolfLease - Lease-Based Leader Election
#[derive(Parser)]
#[command(name = "wolflease")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join an election and stay in it until interrupted
    Run {
        /// Name of the election
        #[arg(long)]
        election: Option<String>,

        /// Identity of this participant (defaults to the host name plus a random suffix)
        #[arg(long)]
        id: Option<String>,

        /// Namespace of the election
        #[arg(long = "election-namespace")]
        namespace: Option<String>,

        /// Lease TTL, e.g. "10s" or "500ms"
        #[arg(long)]
        ttl: Option<String>,

        /// Serve the status API on this address
        #[arg(long)]
        http: Option<String>,
    },

    /// Show a participant's view of the election
    Status {
        /// Participant address to query
        #[arg(short, long, default_value = "localhost:4040")]
        address: String,
    },

    /// Exit successfully only if the participant is leading
    Leading {
        /// Participant address to query
        #[arg(short, long, default_value = "localhost:4040")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolflease.toml")]
        output: PathBuf,

        /// Name of the election
        #[arg(long, default_value = "default")]
        election: String,
    },

    /// Validate configuration file
    Validate,

    /// Show participant configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => WolfLeaseConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    // Initialize logging
    init_logging(&config.logging.level, &config.logging.format);

    match cli.command {
        Commands::Run {
            election,
            id,
            namespace,
            ttl,
            http,
        } => {
            if let Some(election) = election {
                config.election.name = election;
            }
            if let Some(id) = id {
                config.election.id = Some(id);
            }
            if let Some(namespace) = namespace {
                config.election.namespace = namespace;
            }
            if let Some(ttl) = ttl {
                config.election.ttl_ms = parse_duration(&ttl)?.as_millis() as u64;
            }
            if let Some(http) = http {
                config.api.enabled = true;
                config.api.bind_address = http;
            }
            config.validate()?;
            run_election(config).await
        }
        Commands::Status { address } => run_status(address).await,
        Commands::Leading { address } => run_leading(address).await,
        Commands::Init { output, election } => run_init(output, election),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(config),
    }
}

/// Load a configuration file without validating it; command line flags may
/// still fill in missing values
fn load_config(path: &std::path::Path) -> Result<WolfLeaseConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Open the configured lock store
fn open_store(config: &WolfLeaseConfig) -> Result<Arc<dyn LockStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            tracing::info!("Opening lock store at {}", config.store.path.display());
            Ok(Arc::new(SqliteLockStore::open(&config.store.path)?))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory lock store, leadership is local to this process");
            Ok(Arc::new(MemoryLockStore::new()))
        }
    }
}

/// Run the election until interrupted
async fn run_election(mut config: WolfLeaseConfig) -> Result<()> {
    let identity = config.resolve_identity().to_string();
    let key = config.lock_key();

    tracing::info!(
        "Starting WolfLease participant {} for election {}",
        identity,
        key
    );

    let store = open_store(&config)?;

    // The store must be reachable before we compete
    store.get(&key).await.map_err(|e| {
        tracing::error!("Lock store is not reachable: {}", e);
        e
    })?;

    let host = sysinfo::System::host_name().unwrap_or_else(|| identity.clone());
    let recorder = EventRecorder::spawn(Arc::clone(&store), host);
    let lock = ResourceLock::new(store, key, identity, recorder);

    let mut elector = LeaderElector::new(lock, config.election_config())?;
    elector.add_observer(|event, state| match event {
        LeaderEvent::NewLeader(leader) => tracing::info!("{} is the leader", leader),
        LeaderEvent::StartedLeading => tracing::info!("{} started leading", state.identity),
        LeaderEvent::StoppedLeading => tracing::info!("{} stopped leading", state.identity),
    });
    let status = elector.status();

    let cancel = CancellationToken::new();

    let mut election_handle = tokio::spawn(elector.run(cancel.clone()));

    let api_handle = if config.api.enabled {
        let server = StatusServer::new(config.api.clone(), status);
        let api_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.start(api_cancel).await {
                tracing::error!("HTTP API error: {}", e);
            }
        }))
    } else {
        None
    };

    let joined = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down WolfLease participant");
            cancel.cancel();
            (&mut election_handle).await
        }
        joined = &mut election_handle => {
            cancel.cancel();
            joined
        }
    };

    let result = joined.map_err(|e| Error::Internal(format!("election task failed: {}", e)))?;

    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    result
}

async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            let rendered = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

async fn run_leading(address: String) -> Result<()> {
    let url = format!("http://{}/leading", address);

    let response = reqwest::get(&url).await.map_err(|e| {
        eprintln!("Failed to query participant: {}", e);
        Error::Network(e.to_string())
    })?;

    if response.status() == reqwest::StatusCode::OK {
        println!("leading");
        Ok(())
    } else {
        println!("not leading");
        std::process::exit(1);
    }
}

fn run_init(output: PathBuf, election: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfLease Configuration
# Generated configuration file

[election]
name = "{election}"
namespace = "default"
# id = "node-1"
ttl_ms = 10000
# renew_deadline_ms = 5000
# retry_period_ms = 2500
backoff_max_ms = 60000
release_on_shutdown = true

[store]
backend = "sqlite"
path = "/var/lib/wolflease/leases.db"

[api]
enabled = true
bind_address = "0.0.0.0:4040"
cors_enabled = false

[logging]
level = "info"
format = "json"
"#
    );

    std::fs::write(&output, config_content)?;

    println!("Configuration file created: {}", output.display());
    println!();
    println!("Start a participant with:");
    println!("  wolflease --config {} run", output.display());

    Ok(())
}

fn run_validate(config_path: Option<PathBuf>) -> Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("wolflease.toml"));

    match WolfLeaseConfig::from_file(&config_path) {
        Ok(config) => {
            let timings = config.election_config();
            println!("✓ Configuration is valid");
            println!("  Election: {}", config.lock_key());
            println!("  Lease: {:?}", timings.lease_duration);
            println!("  Renew Deadline: {:?}", timings.renew_deadline);
            println!("  Retry Period: {:?}", timings.retry_period);
            println!("  Store: {}", config.store.backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(mut config: WolfLeaseConfig) -> Result<()> {
    let timings = config.election_config();
    let key = config.lock_key();
    let identity = config.resolve_identity().to_string();

    println!("WolfLease Participant Information");
    println!("=================================");
    println!();
    println!("Identity:         {}", identity);
    println!("Election:         {}", key);
    println!();
    println!("Timings:");
    println!("  Lease:          {:?}", timings.lease_duration);
    println!("  Renew Deadline: {:?}", timings.renew_deadline);
    println!("  Retry Period:   {:?}", timings.retry_period);
    println!("  Backoff:        {:?} .. {:?}", timings.backoff_base, timings.backoff_max);
    println!("  Store Timeout:  {:?}", timings.store_timeout);
    println!("  Release:        {}", timings.release_on_cancel);
    println!();
    println!("Store:");
    println!("  Backend:        {}", config.store.backend);
    if config.store.backend == StoreBackend::Sqlite {
        println!("  Path:           {}", config.store.path.display());
    }
    println!();
    println!("API:");
    println!("  Enabled:        {}", config.api.enabled);
    println!("  Bind Address:   {}", config.api.bind_address);

    Ok(())
}
