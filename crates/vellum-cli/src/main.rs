//! vellum — batch processor for scientific document ingestion.
//!
//! Pulls pending documents from the metadata store, runs each through
//! extraction → chunking → embedding → upload, and tracks progress in a
//! resumable checkpoint file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vellum_embed::{BgeEmbedder, EmbeddingConfig};
use vellum_pipeline::checkpoint::{load_checkpoint, RunStats, StatsTracker};
use vellum_pipeline::chunker::ChunkerConfig;
use vellum_pipeline::pipeline::{BatchProcessor, PipelineConfig, TextEmbedder};
use vellum_pipeline::store::{RemoteStore, StoreConfig};

#[derive(Debug, Parser)]
#[command(
    name = "vellum",
    version,
    about = "Process pending documents into retrieval chunks and vectors"
)]
struct Cli {
    /// Maximum documents to process (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Only process documents published in this year.
    #[arg(long)]
    year: Option<i32>,

    /// Publication month filter, 1-12 (requires --year).
    #[arg(long)]
    month: Option<u32>,

    /// Resume progress reporting from the checkpoint file.
    #[arg(long)]
    resume: bool,

    /// List the documents that would be processed, then exit.
    #[arg(long)]
    dry_run: bool,

    /// Delete the checkpoint file before starting.
    #[arg(long)]
    clear_checkpoint: bool,

    /// Parallel document workers.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Also pick up documents already in the error state.
    #[arg(long)]
    include_errors: bool,
}

/// Bridges the candle embedder into the pipeline's embedding seam.
struct CandleEmbedder(BgeEmbedder);

#[async_trait]
impl TextEmbedder for CandleEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(self.0.embed(texts).await?)
    }

    fn dimension(&self) -> usize {
        self.0.dimension()
    }
}

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if cli.month.is_some() && cli.year.is_none() {
        bail!("--month requires --year");
    }
    if let Some(month) = cli.month {
        if !(1..=12).contains(&month) {
            bail!("--month must be between 1 and 12");
        }
    }
    if cli.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let store_config = StoreConfig {
        api_base_url: required_env("VELLUM_API_BASE_URL")?,
        control_api_url: std::env::var("VELLUM_CONTROL_API_URL")
            .unwrap_or_else(|_| "https://api.cloudflare.com".to_string()),
        account_id: required_env("VELLUM_ACCOUNT_ID")?,
        api_token: required_env("VELLUM_API_TOKEN")?,
        database_id: required_env("VELLUM_DATABASE_ID")?,
    };
    let data_dir = PathBuf::from(std::env::var("VELLUM_DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let checkpoint_path = PathBuf::from(
        std::env::var("VELLUM_CHECKPOINT").unwrap_or_else(|_| "data/checkpoint.json".to_string()),
    );

    println!("{}", "=".repeat(70));
    println!("  vellum document processor");
    println!("{}", "=".repeat(70));
    println!("  API:     {}", store_config.api_base_url);
    println!(
        "  Limit:   {}",
        if cli.limit == 0 {
            "unlimited".to_string()
        } else {
            cli.limit.to_string()
        }
    );
    if let Some(year) = cli.year {
        match cli.month {
            Some(month) => println!("  Dates:   {year}-{month:02}"),
            None => println!("  Dates:   {year}"),
        }
    }
    println!("  Workers: {}", cli.workers);
    if cli.include_errors {
        println!("  Retry:   including error-state documents");
    }
    println!("{}", "=".repeat(70));

    if cli.clear_checkpoint && checkpoint_path.exists() {
        std::fs::remove_file(&checkpoint_path)
            .with_context(|| format!("failed to remove {}", checkpoint_path.display()))?;
        println!("Cleared checkpoint");
    }

    let mut stats = RunStats::new();
    if cli.resume {
        if let Some(previous) = load_checkpoint(&checkpoint_path)? {
            println!(
                "Resuming after document: {}",
                previous.last_document_id.as_deref().unwrap_or("none")
            );
            println!(
                "Previous progress: {} processed, {} failed, {} chunks",
                previous.documents_processed, previous.documents_failed, previous.chunks_created
            );
            stats = previous;
        }
    }

    let store = Arc::new(RemoteStore::new(store_config)?);

    let pipeline_config = PipelineConfig {
        limit: cli.limit,
        year: cli.year,
        month: cli.month,
        include_errors: cli.include_errors,
        workers: cli.workers,
        checkpoint_path,
        data_dir,
        ..Default::default()
    };

    if cli.dry_run {
        use vellum_pipeline::store::DocumentFilter;
        let fetch_limit = if cli.limit == 0 { 1000 } else { cli.limit.min(1000) };
        let documents = store
            .pending_documents(&DocumentFilter {
                limit: fetch_limit,
                year: cli.year,
                month: cli.month,
                include_errors: cli.include_errors,
            })
            .await?;
        if documents.is_empty() {
            println!("No pending documents to process.");
            return Ok(());
        }
        println!("[dry run] documents that would be processed:");
        for (i, doc) in documents.iter().take(20).enumerate() {
            println!(
                "  {}. {} ({})",
                i + 1,
                doc.filename,
                doc.pmcid.as_deref().unwrap_or("no PMCID")
            );
        }
        if documents.len() > 20 {
            println!("  ... and {} more", documents.len() - 20);
        }
        return Ok(());
    }

    // Load the model once, before any worker can race the one-time
    // download and device setup.
    info!("loading embedding model");
    let embedder = BgeEmbedder::new(EmbeddingConfig::default()).await?;
    info!(
        model = embedder.model_id(),
        accelerated = embedder.is_accelerated(),
        batch_size = embedder.batch_size(),
        "embedding model ready"
    );

    let processor = BatchProcessor::new(
        store,
        Arc::new(CandleEmbedder(embedder)),
        ChunkerConfig::default(),
        pipeline_config,
        Arc::new(StatsTracker::new(stats)),
    );

    let started = Instant::now();
    let final_stats = processor.run().await?;

    let elapsed = started.elapsed().as_secs_f64();
    let attempted = final_stats.attempted();
    let docs_per_min = if elapsed > 0.0 {
        attempted as f64 / (elapsed / 60.0)
    } else {
        0.0
    };

    println!();
    println!("{}", "=".repeat(70));
    println!("  RUN COMPLETE");
    println!("{}", "=".repeat(70));
    println!("  Documents processed: {}", final_stats.documents_processed);
    println!("  Documents failed:    {}", final_stats.documents_failed);
    println!("  Chunks created:      {}", final_stats.chunks_created);
    println!("  Vectors uploaded:    {}", final_stats.vectors_uploaded);
    println!("  Elapsed:             {elapsed:.1}s ({docs_per_min:.1} docs/min)");
    println!("{}", "=".repeat(70));

    Ok(())
}
