//! # Proto Harness CLI (`proto`)
//!
//! ## Usage
//!
//! ```bash
//! proto --config ./config/proto.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `proto serve` | Start the HTTP dispatcher |
//! | `proto ingest <client>` | Index the client's `source_documents` |
//! | `proto search <client> "<query>"` | Similarity search over a client's index |
//! | `proto ask <client> ["<question>"]` | Answer questions from a client's index |
//! | `proto prepare <client>` | Clean `original_documents` into `source_documents` |
//! | `proto clients` | List configured clients and their steps |
//!
//! ## Examples
//!
//! ```bash
//! # Rebuild the index of the "support" prototype from scratch
//! proto ingest support --reset
//!
//! # Top three passages for a question
//! proto search support "How do I change my DNS records?" --limit 3
//!
//! # Translate German exports and answer questions interactively
//! proto prepare support --translate
//! proto ask support
//!
//! # Serve every client under [clients].root
//! RUST_LOG=proto_harness=debug proto serve
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use proto_harness::client::ClientRegistry;
use proto_harness::config::{self, Config};
use proto_harness::ingest::{self, IngestReport};
use proto_harness::llm::{Generator, OllamaGenerator};
use proto_harness::prepare::{self, PrepareOptions, TranslateSpec};
use proto_harness::progress::{format_number, ProgressMode};
use proto_harness::prototypes::{answer_question, Retriever, StoreRetriever};
use proto_harness::server;
use proto_harness::store::VectorStore;
use proto_harness::translate::LlmTranslator;
use proto_harness::workflow::WorkflowCatalog;

const DEFAULT_CONFIG: &str = "./config/proto.toml";

/// Proto Harness: a prototyping harness for retrieval-augmented text workflows.
#[derive(Parser)]
#[command(name = "proto", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP dispatcher on [server].bind.
    Serve,

    /// Index a client's source documents.
    ///
    /// Files whose modification time matches the index are skipped, so
    /// repeated runs only embed what changed.
    Ingest {
        client: String,

        /// Delete the existing index first.
        #[arg(long)]
        reset: bool,

        /// Progress output on stderr: off, human or json.
        #[arg(long, value_parser = ["off", "human", "json"])]
        progress: Option<String>,
    },

    /// Similarity search over a client's index.
    Search {
        client: String,

        query: String,

        /// Number of matches (default: [retrieval].target_source_chunks).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer questions from a client's index with the configured model.
    ///
    /// Without a question, reads questions from stdin until `exit`.
    Ask {
        client: String,

        question: Option<String>,

        /// Do not print the passages the answer was built from.
        #[arg(long, short = 'S')]
        hide_source: bool,
    },

    /// Clean a client's original_documents into source_documents.
    ///
    /// Front matter moves into JSON sidecars; prose is optionally translated.
    Prepare {
        client: String,

        /// Translate prose with the configured model.
        #[arg(long)]
        translate: bool,

        #[arg(long, default_value = "de")]
        from: String,

        #[arg(long, default_value = "en")]
        to: String,

        /// Replacement for ###NAME### placeholders.
        #[arg(long)]
        brand: Option<String>,
    },

    /// List configured clients.
    Clients,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn resolve_config(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        let mut cfg = Config::default();
        config::apply_env_overrides(&mut cfg);
        config::validate(&cfg)?;
        return Ok(cfg);
    }
    config::load_config(path)
}

fn progress_mode(flag: Option<&str>) -> ProgressMode {
    match flag {
        Some("off") => ProgressMode::Off,
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        _ => ProgressMode::default_for_tty(),
    }
}

fn print_report(client: &str, report: &IngestReport) {
    println!(
        "Ingest {}: {} files discovered, {} unsupported, {} unchanged",
        client,
        format_number(report.discovered as u64),
        format_number(report.unsupported as u64),
        format_number(report.unchanged as u64),
    );
    if report.discovered == report.unchanged {
        println!("No new documents to load");
        return;
    }
    println!(
        "  loaded: {}  failed: {}  replaced: {}",
        report.loaded, report.failed, report.replaced
    );
    println!(
        "  chunks: {}  written: {}  batches: {} ok, {} failed{}",
        format_number(report.chunks as u64),
        format_number(report.chunks_written as u64),
        report.batches_written,
        report.batches_failed,
        if report.created { "  (new index)" } else { "" },
    );
}

async fn run_search(cfg: &Config, client: &str, query: &str, limit: Option<usize>) -> Result<()> {
    let store = ingest::open_store(cfg, client).await?;
    if !store.exists().await? {
        println!("No index for client '{}'. Run `proto ingest {}` first.", client, client);
        return Ok(());
    }
    let k = limit.unwrap_or(cfg.retrieval.target_source_chunks);
    let matches = store.search(query, k).await?;
    store.close().await;

    if matches.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, m) in matches.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, m.score, m.source);
        let excerpt: String = m.text.chars().take(160).collect();
        println!("    {}", excerpt.replace('\n', " "));
    }
    Ok(())
}

async fn print_answer(
    generator: &dyn Generator,
    retriever: &dyn Retriever,
    question: &str,
    k: usize,
    hide_source: bool,
) -> Result<()> {
    let qa = answer_question(generator, retriever, question, k).await?;
    println!("{}", qa.answer);
    println!("\n> Answer took {:.2} s.", qa.elapsed_ms as f64 / 1000.0);
    if !hide_source {
        for m in &qa.sources {
            println!("\n> {}:", m.source);
            println!("{}", m.text);
        }
    }
    Ok(())
}

async fn run_ask(cfg: &Config, client: &str, question: Option<String>, hide_source: bool) -> Result<()> {
    let store = ingest::open_store(cfg, client).await?;
    if !store.exists().await? {
        println!("No index for client '{}'. Run `proto ingest {}` first.", client, client);
        return Ok(());
    }
    let retriever = StoreRetriever(Arc::new(store));
    let generator = OllamaGenerator::new(&cfg.llm)?;
    let k = cfg.retrieval.target_source_chunks;

    if let Some(question) = question {
        return print_answer(&generator, &retriever, &question, k, hide_source).await;
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nEnter a query: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query == "exit" {
            break;
        }
        if query.is_empty() {
            continue;
        }
        print_answer(&generator, &retriever, query, k, hide_source).await?;
    }
    Ok(())
}

fn prepare_options(cfg: &Config, translate: bool, from: String, to: String, brand: Option<String>) -> Result<PrepareOptions> {
    let translation = if translate {
        let generator = Arc::new(OllamaGenerator::new(&cfg.llm)?);
        Some(TranslateSpec {
            translator: Arc::new(LlmTranslator::new(generator)),
            from,
            to,
        })
    } else {
        None
    };
    Ok(PrepareOptions { translation, brand })
}

fn list_clients(cfg: &Config) -> Result<()> {
    let registry = ClientRegistry::load_all(cfg, WorkflowCatalog::with_builtins())?;
    let names = registry.names();
    if names.is_empty() {
        println!("No clients under {}", cfg.clients.root.display());
        return Ok(());
    }
    for name in names {
        let Some(client) = registry.get(&name) else {
            continue;
        };
        println!("{} (workflow: {})", client.name, client.workflow.name());
        for (step, step_cfg) in &client.config.steps {
            println!(
                "  {} [{:?}] input: {}",
                step,
                step_cfg.mode,
                step_cfg.input.join(", ")
            );
            if let Some(handler) = client.workflow.find(step) {
                if !handler.description().is_empty() {
                    println!("      {}", handler.description());
                }
            }
        }
        let hidden: Vec<&str> = client
            .workflow
            .step_names()
            .filter(|step| client.step(step).is_none())
            .collect();
        if !hidden.is_empty() {
            println!("  not exposed: {}", hidden.join(", "));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = resolve_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            client,
            reset,
            progress,
        } => {
            let reporter = progress_mode(progress.as_deref()).reporter();
            let report = ingest::run_ingest(&cfg, &client, reset, reporter.as_ref()).await?;
            info!(client = %client, chunks_written = report.chunks_written, "Ingest finished");
            print_report(&client, &report);
        }
        Commands::Search {
            client,
            query,
            limit,
        } => {
            run_search(&cfg, &client, &query, limit).await?;
        }
        Commands::Ask {
            client,
            question,
            hide_source,
        } => {
            run_ask(&cfg, &client, question, hide_source).await?;
        }
        Commands::Prepare {
            client,
            translate,
            from,
            to,
            brand,
        } => {
            let options = prepare_options(&cfg, translate, from, to, brand)?;
            let report = prepare::run_prepare(&cfg, &client, options).await?;
            println!(
                "Cleaned {} documents, skipped {} documents, failed {}.",
                report.cleaned, report.skipped, report.failed
            );
        }
        Commands::Clients => {
            list_clients(&cfg)?;
        }
    }

    Ok(())
}
