use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{CaptureConditions, Embedding, EncodingCache, EuclideanMatcher, Matcher};
use rollcall_engine::{reload_from, EngineConfig, JsonRosterFile};
use rollcall_store::{LogQuery, RecognitionLogStore, ResultKind};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance recognition CLI")]
struct Cli {
    /// Audit log database (overrides ROLLCALL_LOG_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a roster file and summarize what would be cached
    Roster {
        /// Roster JSON file (defaults to ROLLCALL_ROSTER_PATH)
        path: Option<PathBuf>,
    },
    /// Match one embedding against a roster
    Match {
        /// JSON file holding the query embedding: `[f32, ...]` or `{"values": [...]}`
        embedding: PathBuf,
        /// Roster JSON file (defaults to ROLLCALL_ROSTER_PATH)
        #[arg(short, long)]
        roster: Option<PathBuf>,
        /// Base distance threshold (defaults to ROLLCALL_MATCH_THRESHOLD)
        #[arg(short, long)]
        threshold: Option<f32>,
        #[arg(long)]
        low_light: bool,
        #[arg(long)]
        low_quality: bool,
        #[arg(long)]
        outdoor: bool,
    },
    /// Query the audit log, newest first
    Logs {
        /// Result kind (matched, unmatched, no_face, ...)
        #[arg(short, long)]
        kind: Option<String>,
        #[arg(short, long)]
        identity: Option<String>,
        /// Inclusive lower bound (RFC 3339)
        #[arg(long)]
        since: Option<String>,
        /// Exclusive upper bound (RFC 3339)
        #[arg(long)]
        until: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Show audit log size and time range
    Stats,
    /// Apply the retention policy to the audit log now
    Maintain,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(db) = cli.db {
        config.log_path = db;
    }

    match cli.command {
        Commands::Roster { path } => {
            let path = roster_path(path, &config)?;
            let cache = encoding_cache(&config);
            let summary = reload_from(&cache, &JsonRosterFile::new(&path))
                .with_context(|| format!("loading roster {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            let gallery = cache.snapshot();
            for entry in gallery.entries() {
                println!(
                    "  {:<20} {:<30} {} reference(s)",
                    entry.identity_id,
                    entry.display_name,
                    entry.embeddings.len()
                );
            }
        }
        Commands::Match {
            embedding,
            roster,
            threshold,
            low_light,
            low_quality,
            outdoor,
        } => {
            let path = roster_path(roster, &config)?;
            let cache = encoding_cache(&config);
            reload_from(&cache, &JsonRosterFile::new(&path))
                .with_context(|| format!("loading roster {}", path.display()))?;

            let query = read_embedding(&embedding)?;
            let gallery = cache.snapshot();
            if let Some(dim) = gallery.dim().filter(|&d| d != query.dim()) {
                bail!("query has {} dimensions, roster has {dim}", query.dim());
            }

            let conditions = CaptureConditions {
                low_light,
                low_quality,
                outdoor,
            };
            let matcher = EuclideanMatcher::new(config.threshold);
            let base = threshold.unwrap_or(config.scheduler.match_threshold);
            match matcher.find_best_match(&query, &gallery, base, &conditions) {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => bail!("roster has no usable reference embeddings"),
            }
        }
        Commands::Logs {
            kind,
            identity,
            since,
            until,
            limit,
        } => {
            let mut query = LogQuery::default().limit(limit);
            if let Some(kind) = kind {
                query = query.kind(kind.parse::<ResultKind>()?);
            }
            if let Some(identity) = identity {
                query = query.identity(identity);
            }
            if let Some(since) = since {
                query = query.since(parse_time(&since)?);
            }
            if let Some(until) = until {
                query = query.until(parse_time(&until)?);
            }

            let store = open_store(&config).await?;
            let entries = store.query(query).await?;
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
            tracing::debug!(count = entries.len(), "log query complete");
            store.shutdown().await?;
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            println!("{}", serde_json::to_string_pretty(&store.stats().await?)?);
            store.shutdown().await?;
        }
        Commands::Maintain => {
            let store = open_store(&config).await?;
            let report = store.maintain_now().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            store.shutdown().await?;
        }
    }

    Ok(())
}

fn roster_path(explicit: Option<PathBuf>, config: &EngineConfig) -> Result<PathBuf> {
    explicit
        .or_else(|| config.roster_path.clone())
        .context("no roster given and ROLLCALL_ROSTER_PATH is not set")
}

fn encoding_cache(config: &EngineConfig) -> EncodingCache {
    match config.embedding_dim {
        Some(dim) => EncodingCache::with_dimension(dim),
        None => EncodingCache::new(),
    }
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let raw = match serde_json::from_str::<Vec<f32>>(&json) {
        Ok(values) => Embedding {
            values,
            model_version: None,
        },
        Err(_) => serde_json::from_str::<Embedding>(&json)
            .context("embedding must be a JSON array or object")?,
    };
    Ok(Embedding::normalized(raw.values, raw.model_version)?)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp {value:?}"))?
        .with_timezone(&Utc))
}

async fn open_store(config: &EngineConfig) -> Result<RecognitionLogStore> {
    // One-shot commands never run the periodic pass.
    let mut store_config = config.log_store_config();
    store_config.retention.interval = std::time::Duration::ZERO;
    RecognitionLogStore::open(&config.log_path, store_config)
        .await
        .with_context(|| format!("opening audit log {}", config.log_path.display()))
}
