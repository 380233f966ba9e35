mod display;
mod ingest;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ddx_ai::{OpenAiClient, Pipeline, PipelineOptions};
use ddx_core::FieldRegistry;
use ddx_core::schema::{extraction_prompt, reduction_prompt};
use ddx_store::{JsonStore, RunMeta, StoredRun};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ddx", version, about = "Contract-driven field extraction from project documents")]
struct Cli {
    /// Path to the field configuration JSON.
    #[arg(long, env = "DDX_FIELD_CONFIG", default_value = "config/fields.json", global = true)]
    field_config: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "DDX_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract fields from every document in a directory.
    Extract(ExtractArgs),
    /// List the fields defined in the configuration.
    Fields,
    /// Print the compiled prompt for one field.
    Prompt {
        /// Field key (suffix match allowed).
        field: String,
        /// Print the reduction prompt instead of the extraction prompt.
        #[arg(long)]
        reduce: bool,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Field keys to extract.
    #[arg(long, num_args = 1.., required = true)]
    fields: Vec<String>,

    /// Directory with source documents (.pdf/.txt/.csv/.kmz).
    #[arg(long, env = "DDX_DOCS_DIR")]
    docs_dir: Option<PathBuf>,

    /// Directory for run snapshots and per-field history.
    #[arg(long, env = "DDX_STORE_DIR", default_value = "store")]
    store_dir: PathBuf,

    /// Namespace for stored runs.
    #[arg(long, env = "DDX_PROJECT_ID", default_value = "default_project")]
    project_id: String,

    /// Run id; defaults to the UTC timestamp.
    #[arg(long)]
    run_id: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of an OpenAI-compatible API.
    #[arg(long, env = "DDX_BASE_URL", default_value = "https://api.openai.com/v1")]
    base_url: String,

    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Extraction calls in flight per field.
    #[arg(long, env = "DDX_MAP_CONCURRENCY", default_value_t = 4)]
    map_concurrency: usize,

    /// Fields processed at once.
    #[arg(long, env = "DDX_FIELD_CONCURRENCY", default_value_t = 1)]
    field_concurrency: usize,

    /// Per-call timeout in seconds.
    #[arg(long, env = "DDX_TIMEOUT_SECS", default_value_t = 120)]
    timeout_secs: u64,

    /// Characters of document text sent per call.
    #[arg(long, default_value_t = 12_000)]
    max_doc_chars: usize,

    /// Print results as JSON instead of cards.
    #[arg(long)]
    json: bool,

    /// Do not persist the run.
    #[arg(long)]
    no_store: bool,
}

impl ExtractArgs {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_doc_chars: self.max_doc_chars,
            map_concurrency: self.map_concurrency,
            field_concurrency: self.field_concurrency,
            call_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    info!("ddx v{}", env!("CARGO_PKG_VERSION"));

    let registry = FieldRegistry::from_path(&cli.field_config)
        .with_context(|| format!("loading field config {}", cli.field_config.display()))?;

    match cli.command {
        Command::Extract(args) => run_extract(registry, &cli.field_config, args).await,
        Command::Fields => {
            display::print_fields(&registry);
            Ok(())
        }
        Command::Prompt { field, reduce } => {
            let contract = registry
                .resolve(&field)
                .with_context(|| format!("unknown field key {field:?}"))?;
            if reduce {
                println!("{}", reduction_prompt(contract, &[]));
            } else {
                println!("{}", extraction_prompt(contract, None));
            }
            Ok(())
        }
    }
}

async fn run_extract(
    registry: FieldRegistry,
    field_config: &std::path::Path,
    args: ExtractArgs,
) -> anyhow::Result<()> {
    let docs = ingest::load_documents(args.docs_dir.as_deref())?;
    eprintln!("  {} documents, {} fields", docs.len(), args.fields.len());

    let options = args.pipeline_options();
    let client = OpenAiClient::new(
        &args.base_url,
        args.api_key.clone(),
        args.model.clone(),
        options.call_timeout,
    )
    .context("building model client")?;
    let pipeline = Pipeline::new(Arc::new(client), Arc::new(registry), options);

    let output = pipeline.run(&args.fields, &docs).await;

    let stored: Option<StoredRun> = if args.no_store {
        None
    } else {
        let store = JsonStore::new(&args.store_dir);
        let meta = RunMeta {
            project_id: args.project_id.clone(),
            docs_dir: args.docs_dir.as_ref().map(|d| d.display().to_string()),
            fields: args.fields.clone(),
            model: Some(args.model.clone()),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        let stored = store
            .save_run(&output, args.run_id.as_deref(), meta)
            .with_context(|| format!("saving run to {}", args.store_dir.display()))?;
        Some(stored)
    };

    if args.json {
        let mut out = serde_json::to_value(&output)?;
        out["field_config"] = json!(field_config.display().to_string());
        if let Some(stored) = &stored {
            out["stored_json"] = json!({
                "run_json": stored.run_json.display().to_string(),
                "fields": stored.fields.iter().map(|f| json!({
                    "key": f.key,
                    "latest": f.latest.display().to_string(),
                    "history": f.history.display().to_string(),
                })).collect::<Vec<_>>(),
                "store_dir": args.store_dir.display().to_string(),
            });
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        display::print_run(&output, stored.as_ref());
    }
    Ok(())
}
