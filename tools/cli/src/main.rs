//! Scoresync CLI - Command line driver for the offline sync client.
//!
//! This tool queues score mutations, drains them against the authority,
//! resolves conflicts and manages the resource cache.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scoresync_common::{ActionId, ClientConfig, ConflictId};
use scoresync_sync::{
    ActionPayload, HttpAuthority, HttpFetcher, OfflineClient, ResolutionStrategy, ScoreMutation,
};

const DEFAULT_AUTHORITY: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "scoresync")]
#[command(about = "Scoresync - Offline-first judging client")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Client configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Durable store file. Defaults to the platform data directory.
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Base URL of the remote authority.
    #[arg(short, long, global = true)]
    authority: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a score.
    Score {
        #[arg(long)]
        score_id: String,

        #[arg(long)]
        competitor: String,

        #[arg(long)]
        criterion: String,

        #[arg(long)]
        judge: String,

        #[arg(long)]
        value: f64,

        /// Required for extreme values.
        #[arg(long)]
        justification: Option<String>,
    },

    /// List actions not yet settled with the authority.
    Pending,

    /// Retry a failed action.
    Retry {
        /// Action id.
        id: String,
    },

    /// Drain the queue now.
    Sync,

    /// List open conflicts.
    Conflicts,

    /// Resolve a conflict.
    Resolve {
        /// Conflict id.
        id: String,

        /// server_wins, client_wins, last_write_wins, merge or manual_resolution.
        #[arg(short = 'S', long)]
        strategy: String,

        /// Resolved record as a JSON object (manual resolution only).
        #[arg(short, long)]
        data: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Resource cache operations.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show sync status.
    Status,

    /// Delete settled records past their retention.
    Prune,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache statistics.
    Status,
    /// Remove every cached entry.
    Clear,
    /// Fetch paths ahead of going offline.
    Prime {
        /// Resource paths, e.g. /api/events.
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?;
    }

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "scoresync", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let online = matches!(
        cli.command,
        Commands::Sync
            | Commands::Cache {
                command: CacheCommands::Prime { .. }
            }
    );
    let client = open_client(config, online).await?;

    let result = match cli.command {
        Commands::Score {
            score_id,
            competitor,
            criterion,
            judge,
            value,
            justification,
        } => {
            let mutation = ScoreMutation {
                score_id,
                competitor_id: competitor,
                criterion_id: criterion,
                judge_id: judge,
                value,
                justification,
            };
            cmd_score(&client, mutation).await
        }
        Commands::Pending => cmd_pending(&client).await,
        Commands::Retry { id } => cmd_retry(&client, &id).await,
        Commands::Sync => cmd_sync(&client).await,
        Commands::Conflicts => cmd_conflicts(&client).await,
        Commands::Resolve {
            id,
            strategy,
            data,
            notes,
        } => cmd_resolve(&client, &id, &strategy, data.as_deref(), notes).await,
        Commands::Cache { command } => cmd_cache(&client, command).await,
        Commands::Status => cmd_status(&client).await,
        Commands::Prune => cmd_prune(&client).await,
        Commands::Completions { .. } => Ok(()),
    };

    client.close().await;
    result
}

/// Merge the configuration file with command-line overrides.
fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(store) = &cli.store {
        config.store_path = Some(store.clone());
    }
    if config.store_path.is_none() {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scoresync");
        config.store_path = Some(data_dir.join("client.db"));
    }
    if let Some(url) = &cli.authority {
        config.authority_url = Some(url.clone());
    }

    Ok(config)
}

async fn open_client(config: ClientConfig, online: bool) -> Result<OfflineClient> {
    let url = config
        .authority_url
        .clone()
        .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string());
    let timeout = config.sync.submit_timeout;
    let authority =
        Arc::new(HttpAuthority::new(&url, timeout).context("Invalid authority URL")?);
    let fetcher = Arc::new(HttpFetcher::new(&url, timeout).context("Invalid authority URL")?);

    info!("Using authority {}", url);

    let client = OfflineClient::builder(config, authority, fetcher)
        .initially_online(online)
        .open()
        .await
        .context("Failed to open client")?;

    if !client.is_durable() {
        eprintln!("Warning: durable store unavailable, changes will not survive this run.");
    }
    Ok(client)
}

/// Queue a score mutation.
async fn cmd_score(client: &OfflineClient, mutation: ScoreMutation) -> Result<()> {
    let action = client
        .enqueue(ActionPayload::ScoreUpsert(mutation))
        .await
        .context("Failed to queue score")?;

    println!("Queued {} ({})", action.id, action.resource);
    Ok(())
}

/// List unsettled actions.
async fn cmd_pending(client: &OfflineClient) -> Result<()> {
    let actions = client.outstanding().await?;

    if actions.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }

    println!("{} pending action(s):", actions.len());
    for action in actions {
        let error = action
            .last_error
            .as_deref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        println!(
            "  [{}] {} {} {} (attempts: {}){}",
            action.status,
            action.id,
            action.kind,
            action.resource,
            action.retry_count,
            error
        );
    }
    Ok(())
}

async fn cmd_retry(client: &OfflineClient, id: &str) -> Result<()> {
    let id = ActionId::new(id).context("Invalid action id")?;
    let action = client
        .retry_action(&id)
        .await
        .context("Failed to requeue action")?;

    println!("Requeued {}", action.id);
    Ok(())
}

/// Drain the queue.
async fn cmd_sync(client: &OfflineClient) -> Result<()> {
    let report = client.sync_now().await.context("Sync failed")?;

    if let Some(reason) = report.skipped {
        println!("Sync skipped: {:?}", reason);
        return Ok(());
    }

    println!("Sync finished in {:?}", report.duration);
    println!("  Synced: {}", report.synced);
    println!("  Failed: {}", report.failed);
    println!("  Conflicts: {}", report.conflicts);
    if report.cancelled {
        println!("  (cancelled before completion)");
    }
    Ok(())
}

/// List open conflicts.
async fn cmd_conflicts(client: &OfflineClient) -> Result<()> {
    let conflicts = client.list_open_conflicts().await?;

    if conflicts.is_empty() {
        println!("No open conflicts.");
        return Ok(());
    }

    for conflict in conflicts {
        println!("Conflict {} on {}", conflict.id, conflict.resource);
        println!("  Detected: {}", conflict.detected_at);
        println!("  Fields: {}", conflict.conflict_fields.join(", "));
        for field in &conflict.conflict_fields {
            println!(
                "    {}: server={} client={}",
                field,
                conflict.server_data.get(field).unwrap_or(&Value::Null),
                conflict.client_data.get(field).unwrap_or(&Value::Null)
            );
        }
        println!("  Actions: {}", conflict.action_ids.len());
    }
    Ok(())
}

/// Resolve a conflict.
async fn cmd_resolve(
    client: &OfflineClient,
    id: &str,
    strategy: &str,
    data: Option<&str>,
    notes: Option<String>,
) -> Result<()> {
    let id = ConflictId::new(id).context("Invalid conflict id")?;
    let strategy: ResolutionStrategy = strategy.parse().context("Invalid strategy")?;
    let data = data
        .map(serde_json::from_str::<Map<String, Value>>)
        .transpose()
        .context("Resolved data must be a JSON object")?;

    let conflict = client
        .resolve_conflict(&id, strategy, data, notes)
        .await
        .context("Failed to resolve conflict")?;

    println!("Conflict {} resolved with {}", conflict.id, strategy);
    match &conflict.resolution_action {
        Some(action) => println!("  Resubmitting as {}", action),
        None => println!("  Nothing to resubmit"),
    }
    Ok(())
}

async fn cmd_cache(client: &OfflineClient, command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::Status => {
            let status = client.cache_status().await?;
            println!("Cache:");
            println!("  Entries: {}", status.entries);
            println!("  Size: {} bytes", status.total_size);
            match status.last_updated {
                Some(at) => println!("  Last updated: {}", at),
                None => println!("  Last updated: never"),
            }
        }
        CacheCommands::Clear => {
            let cleared = client.clear_cache().await?;
            println!("Cleared {} entries", cleared);
        }
        CacheCommands::Prime { paths } => {
            let report = client.prime_cache(&paths).await;
            println!("Primed {} of {} paths", report.primed.len(), paths.len());
            for (path, error) in &report.failed {
                println!("  failed {}: {}", path, error);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} path(s) could not be cached", report.failed.len());
            }
        }
    }
    Ok(())
}

/// Show sync status.
async fn cmd_status(client: &OfflineClient) -> Result<()> {
    let status = client.status();

    println!("Sync status:");
    println!("  Device: {}", client.device_id());
    println!("  Phase: {:?}", status.phase);
    println!("  Pending: {}", status.pending_count);
    println!("  Failed: {}", status.failed_count);
    println!("  Open conflicts: {}", status.open_conflicts);
    match status.last_synced_at {
        Some(at) => println!("  Last synced: {}", at.to_rfc3339()),
        None => println!("  Last synced: never"),
    }
    if let Some(error) = status.last_error {
        println!("  Last error: {}", error);
    }
    Ok(())
}

async fn cmd_prune(client: &OfflineClient) -> Result<()> {
    let report = client.prune().await?;
    println!(
        "Pruned {} synced action(s) and {} resolved conflict(s)",
        report.actions, report.conflicts
    );
    Ok(())
}
