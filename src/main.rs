use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use docsynth::config;
use docsynth::crawler::{CrawlMode, CrawlRequest, Crawler};
use docsynth::costs::{CostTracker, RuntimeOverrides};
use docsynth::db;
use docsynth::embedding::EmbeddingRouter;
use docsynth::ingest::IngestOrchestrator;
use docsynth::llm::HttpLlmClient;
use docsynth::migrate;
use docsynth::models::Metadata;
use docsynth::search::{HybridParams, SearchEngine};
use docsynth::server;
use docsynth::store::Store;
use docsynth::synthesis::SynthesisEngine;
use docsynth::{extract, files};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "docsynth",
    about = "docsynth — a multi-collection hybrid-retrieval RAG backend",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/docsynth.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Start the HTTP server
    Serve,

    /// Ingest local files into a collection
    Ingest {
        /// Collection id
        collection_id: String,

        /// Files to ingest
        files: Vec<PathBuf>,
    },

    /// Fetch a URL (or crawl a site) into a collection
    Crawl {
        /// Starting URL
        url: String,

        /// Collection id
        collection_id: String,

        /// Follow same-origin links instead of fetching a single page
        #[arg(long)]
        follow: bool,

        /// Maximum pages to process
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Search a collection
    Search {
        /// Search query
        query: String,

        /// Collection id
        #[arg(long)]
        collection_id: String,

        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Synthesize grouped approaches for a query
    Synthesize {
        /// Search query
        query: String,

        /// Collection id
        #[arg(long)]
        collection_id: String,

        /// Maximum number of results fed to synthesis
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show monthly spend and recent alerts
    Costs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Ingest {
            collection_id,
            files: paths,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = Store::new(pool);
            let costs = CostTracker::new(store.clone(), cfg.budget.clone(), RuntimeOverrides::new());
            let router = EmbeddingRouter::new(cfg.embedding.clone(), costs)?;
            let orchestrator = IngestOrchestrator::new(store.clone(), router, &cfg);

            let cancel = CancellationToken::new();
            for path in paths {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".to_string());
                let bytes = std::fs::read(&path)?;
                let mime = guess_mime(&filename);

                let doc = store
                    .create_document(
                        &collection_id,
                        filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(&filename),
                        &mime,
                        bytes.len() as i64,
                        None,
                        None,
                        &Metadata::default(),
                    )
                    .await?;
                let stored = files::store_file(
                    orchestrator.storage_root(),
                    &collection_id,
                    &doc.id,
                    &files::extension_of(&filename),
                    &bytes,
                )
                .await?;
                store
                    .set_document_file(&doc.id, &stored.to_string_lossy(), bytes.len() as i64)
                    .await?;

                match orchestrator.ingest(&doc.id, &cancel).await {
                    Ok(()) => println!("ingested {} ({})", filename, doc.id),
                    Err(e) => eprintln!("failed {}: {}", filename, e),
                }
            }
        }
        Commands::Crawl {
            url,
            collection_id,
            follow,
            max_pages,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = Store::new(pool);
            let costs = CostTracker::new(store.clone(), cfg.budget.clone(), RuntimeOverrides::new());
            let router = EmbeddingRouter::new(cfg.embedding.clone(), costs)?;
            let orchestrator = IngestOrchestrator::new(store.clone(), router, &cfg);
            let crawler = Crawler::new(store, orchestrator, cfg.crawler.clone())?;

            let request = CrawlRequest {
                url,
                collection_id,
                mode: if follow { CrawlMode::Crawl } else { CrawlMode::Single },
                max_pages: max_pages.unwrap_or(cfg.crawler.max_pages),
                title_prefix: None,
            };
            let pages = crawler.crawl(&request, &CancellationToken::new()).await?;
            for page in &pages {
                println!("{} {} ({})", page.doc_id, page.title, page.url);
            }
            println!("{} pages queued for ingestion", pages.len());
        }
        Commands::Search {
            query,
            collection_id,
            top_k,
        } => {
            let pool = db::connect(&cfg).await?;
            let store = Store::new(pool);
            let costs = CostTracker::new(store.clone(), cfg.budget.clone(), RuntimeOverrides::new());
            let router = EmbeddingRouter::new(cfg.embedding.clone(), costs)?;
            let engine = SearchEngine::new(store, router, cfg.search.clone());

            let outcome = engine
                .hybrid_search(
                    &query,
                    &collection_id,
                    &HybridParams {
                        top_k,
                        ..Default::default()
                    },
                )
                .await?;

            if outcome.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, result) in outcome.results.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} ({})",
                    i + 1,
                    result.fused_score.unwrap_or(result.similarity),
                    result.doc_title,
                    result.document_id
                );
                println!(
                    "    excerpt: \"{}\"",
                    result.text.replace('\n', " ").chars().take(160).collect::<String>()
                );
            }
        }
        Commands::Synthesize {
            query,
            collection_id,
            top_k,
        } => {
            let pool = db::connect(&cfg).await?;
            let store = Store::new(pool);
            let costs = CostTracker::new(store.clone(), cfg.budget.clone(), RuntimeOverrides::new());
            let router = EmbeddingRouter::new(cfg.embedding.clone(), costs.clone())?;
            let engine = SearchEngine::new(store, router.clone(), cfg.search.clone());
            let llm = Arc::new(HttpLlmClient::new(cfg.synthesis.contradiction_model.clone())?);
            let synthesis = SynthesisEngine::new(router, llm, costs, cfg.synthesis.clone());

            let outcome = engine
                .hybrid_search(
                    &query,
                    &collection_id,
                    &HybridParams {
                        top_k: Some(top_k.unwrap_or(50)),
                        ..Default::default()
                    },
                )
                .await?;

            let result = synthesis
                .synthesize(&query, outcome.results, &CancellationToken::new())
                .await?;

            if result.approaches.is_empty() {
                println!("No approaches found.");
                return Ok(());
            }
            for (i, approach) in result.approaches.iter().enumerate() {
                let marker = if result.recommended == Some(i) { " (recommended)" } else { "" };
                println!(
                    "{}. [{:.2}] {}{}",
                    i + 1,
                    approach.consensus,
                    approach.topic,
                    marker
                );
                println!("    method: {}", approach.method);
                println!("    sources: {}", approach.sources.len());
                println!("    summary: {}", approach.summary);
            }
            if result.conflicts.is_empty() {
                println!("no conflicts detected");
            } else {
                for conflict in &result.conflicts {
                    println!(
                        "conflict [{} {:.2}] {} vs {}: {}",
                        conflict.severity,
                        conflict.confidence,
                        conflict.source_a,
                        conflict.source_b,
                        conflict.description
                    );
                }
            }
        }
        Commands::Costs => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = Store::new(pool);
            let costs = CostTracker::new(store.clone(), cfg.budget.clone(), RuntimeOverrides::new());

            let monthly = costs.monthly_spend().await?;
            println!("monthly spend: ${:.4}", monthly);
            println!("monthly budget: ${:.2}", cfg.budget.monthly_usd);

            let alerts = store.list_alerts(10).await?;
            if alerts.is_empty() {
                println!("no alerts");
            } else {
                for alert in alerts {
                    println!(
                        "  {} at ${:.4} (threshold ${:.2})",
                        alert.alert_type.as_str(),
                        alert.current_spend_usd,
                        alert.threshold_usd
                    );
                }
            }
        }
    }

    Ok(())
}

fn guess_mime(filename: &str) -> String {
    match filename.rsplit_once('.').map(|(_, e)| e.to_lowercase()).as_deref() {
        Some("pdf") => extract::MIME_PDF.to_string(),
        Some("docx") => extract::MIME_DOCX.to_string(),
        Some("md") | Some("markdown") => extract::MIME_MARKDOWN.to_string(),
        Some("html") | Some("htm") => extract::MIME_HTML.to_string(),
        _ => extract::MIME_PLAIN.to_string(),
    }
}
