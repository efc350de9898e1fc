//! Command-line interface
//!
//! A thin shell over the library: wires config, store, providers, and
//! scheduler together. All engine logic lives in the library modules.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use docstore::{DocumentStore, WriteSink};
use eyre::{Result, WrapErr};
use tracing::info;

use crate::config::Config;
use crate::domain::BookOp;
use crate::job::{BOOKS, BookJob, JobServices, book_job_factory, create_book, load_book};
use crate::llm::AnthropicClient;
use crate::ocr::HttpOcrClient;
use crate::prompts::PromptSet;
use crate::providers::{PageExtractor, ProviderLimits, ProviderRegistry};
use crate::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "bindery", about = "Per-book processing engine for scanned-book PDFs", version)]
pub struct Cli {
    /// Config file path (default: platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest one PDF and process it to completion
    Process {
        /// Path to the scanned book PDF
        pdf: PathBuf,

        /// Book id; defaults to the PDF file stem
        #[arg(long)]
        book_id: Option<String>,
    },

    /// Resume every interrupted job
    Resume,

    /// Show per-book operation status
    Status {
        /// Limit to one book
        book_id: Option<String>,
    },
}

/// Run the CLI to completion
pub async fn run(cli: Cli, extractor: Arc<dyn PageExtractor>) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(parent) = config.store.database_path.parent() {
        std::fs::create_dir_all(parent).wrap_err("failed to create store directory")?;
    }
    let store = Arc::new(DocumentStore::open(&config.store.database_path)?);
    let sink = WriteSink::spawn(store.clone());
    let prompts = PromptSet::load(config.prompts.template_dir.as_deref())?;

    let registry = Arc::new(build_registry(&config)?);
    let scheduler = Scheduler::new(
        registry,
        extractor.clone(),
        store.clone(),
        sink.clone(),
        config.engine.cpu_pool_size,
    );

    let services = JobServices {
        store: store.clone(),
        sink,
        engine: config.engine.clone(),
    };
    scheduler.register_factory(
        "book",
        book_job_factory(services.clone(), prompts.clone(), scheduler.clone()),
    );

    match cli.command {
        Command::Process { pdf, book_id } => {
            let book_id = match book_id {
                Some(id) => id,
                None => pdf
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| eyre::eyre!("cannot derive a book id from {}", pdf.display()))?
                    .to_string(),
            };

            let total_pages = extractor.page_count(&pdf).await?;
            create_book(&services.sink, &book_id, &pdf, total_pages).await?;

            let state = load_book(&store, &services.engine, prompts, &book_id).await?;
            let job = Arc::new(BookJob::new(state, services));
            scheduler.submit(job).await?;

            wait_for_idle(&scheduler).await;
        }

        Command::Resume => {
            let resumed = scheduler.resume().await?;
            info!(resumed, "Resume complete");
            if resumed > 0 {
                wait_for_idle(&scheduler).await;
            }
        }

        Command::Status { book_id } => {
            print_status(&store, book_id.as_deref())?;
        }
    }

    Ok(())
}

fn build_registry(config: &Config) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    for (name, provider_config) in &config.llm {
        let client = AnthropicClient::from_config(provider_config)?;
        registry.register_llm(
            name.clone(),
            Arc::new(client),
            ProviderLimits {
                max_concurrent: provider_config.max_concurrent,
                max_requests_per_window: provider_config.max_requests_per_window,
                rate_window_secs: provider_config.rate_window_secs,
            },
        );
    }

    for (name, provider_config) in &config.ocr {
        let client = HttpOcrClient::from_config(provider_config)?;
        registry.register_ocr(
            name.clone(),
            Arc::new(client),
            ProviderLimits {
                max_concurrent: provider_config.max_concurrent,
                max_requests_per_window: provider_config.max_requests_per_window,
                rate_window_secs: provider_config.rate_window_secs,
            },
        );
    }

    Ok(registry)
}

/// Block until every submitted job reaches a terminal state
async fn wait_for_idle(scheduler: &Scheduler) {
    while scheduler.active_jobs().await > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

fn print_status(store: &Arc<DocumentStore>, book_id: Option<&str>) -> Result<()> {
    let filters = match book_id {
        Some(id) => vec![docstore::Filter::eq("book_id", id)],
        None => Vec::new(),
    };
    let books = store.query(BOOKS, &filters)?;

    if books.is_empty() {
        println!("no books");
        return Ok(());
    }

    for book in books {
        let id = book.str_field("book_id").unwrap_or("?");
        let status = book.str_field("status").unwrap_or("?");
        let pages = book.u64_field("total_pages").unwrap_or(0);
        let cost = book.body.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
        println!("{id}: {status} ({pages} pages, ${cost:.2})");

        for op in BookOp::all() {
            let name = op.name();
            let state = if book.bool_field(&format!("{name}_complete")).unwrap_or(false) {
                "complete"
            } else if book.bool_field(&format!("{name}_failed")).unwrap_or(false) {
                "failed (permanent)"
            } else if book.bool_field(&format!("{name}_started")).unwrap_or(false) {
                "in progress"
            } else {
                "not started"
            };
            println!("  {name}: {state}");
        }
    }

    Ok(())
}
