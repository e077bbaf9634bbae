use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bangumi_analyzer::types::{AuthorId, Dataset, TitleId};
use bangumi_analyzer::{
    Analyzer, AnalyzerConfig, AnalyzerSettings, CacheBackend, FileSnapshotStore, MemoryCache,
    PairwiseCache, RedisCache, SimilarityEngine, SqliteStore,
};

#[derive(Parser)]
#[command(name = "bangumi-analyzer")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Creates the database tables.
    Migrate,
    /// Loads titles and authors from a JSON dataset file.
    Import { path: PathBuf },
    /// Recomputes title matches and stale authors' matches and recommendations.
    Analyze {
        #[arg(long)]
        force: bool,
    },
    ShowTitle { id: TitleId },
    ShowAuthor { id: AuthorId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = AnalyzerConfig::from_env()?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    let store = SqliteStore::connect(&config.database_url).await?;
    store.migrate().await?;

    match cli.command {
        Command::Migrate => {
            info!("Database schema is up to date");
            Ok(())
        }
        Command::Import { path } => import(&store, path).await,
        Command::Analyze { force } => analyze(&config, store, force).await,
        Command::ShowTitle { id } => print_json(&store.title_matches(id).await?),
        Command::ShowAuthor { id } => print_json(&store.author_results(id).await?),
    }
}

async fn import(store: &SqliteStore, path: PathBuf) -> Result<()> {
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let dataset: Dataset = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing dataset {}", path.display()))?;

    let stats = store.import_dataset(&dataset).await?;
    print_json(&stats)
}

async fn analyze(config: &AnalyzerConfig, store: SqliteStore, force: bool) -> Result<()> {
    let cache = PairwiseCache::new(cache_backend(config).await, config.cache_ttl, config.io_timeout);
    let engine = SimilarityEngine::new(config.overlap_policy, cache, config.pair_concurrency);

    let store = Arc::new(store);
    let mut analyzer = Analyzer::new(
        store.clone(),
        store,
        engine,
        AnalyzerSettings::from(config),
    );
    if let Some(path) = &config.snapshot_path {
        let max_age = chrono::Duration::from_std(config.snapshot_max_age)
            .context("ANALYZER_SNAPSHOT_MAX_AGE_SECS out of range")?;
        analyzer = analyzer.with_snapshot_store(Arc::new(FileSnapshotStore::new(path.clone(), max_age)));
    }

    let report = analyzer.run(force).await?;
    print_json(&report)
}

/// Redis when configured and reachable, an in-process cache when no Redis is
/// configured, nothing when caching is disabled or Redis is down.
async fn cache_backend(config: &AnalyzerConfig) -> Option<Arc<dyn CacheBackend>> {
    if !config.cache_enabled {
        info!("Similarity cache disabled");
        return None;
    }

    let Some(redis_url) = &config.redis_url else {
        let memory = MemoryCache::new(config.cache_prefix.clone());
        return Some(Arc::new(memory) as Arc<dyn CacheBackend>);
    };

    let connect = RedisCache::connect(redis_url, config.cache_prefix.clone());
    let redis = match tokio::time::timeout(config.io_timeout, connect).await {
        Ok(Ok(redis)) => redis,
        Ok(Err(e)) => {
            warn!("Redis unavailable, running without cache: {}", e);
            return None;
        }
        Err(_) => {
            warn!("Connecting to Redis timed out, running without cache");
            return None;
        }
    };

    if let Some(max_memory) = &config.redis_max_memory {
        match tokio::time::timeout(config.io_timeout, redis.limit_memory(max_memory)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to set Redis maxmemory: {}", e),
            Err(_) => warn!("Setting Redis maxmemory timed out"),
        }
    }

    Some(Arc::new(redis) as Arc<dyn CacheBackend>)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
