use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docrag::{Metadata, config::EmbedderKind};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Extract, chunk, embed and search your documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Embedder to use (overrides the stored setting)
    #[arg(long, global = true, value_parser = parse_embedder)]
    pub embedder: Option<EmbedderKind>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process a single document and store its chunks
    Process(ProcessArgs),
    /// Process every supported file under a directory
    Ingest(IngestArgs),
    /// Search stored chunks
    Search(SearchArgs),
    /// Find chunks similar to a stored one
    Similar(SimilarArgs),
    /// Show a stored chunk
    Get(GetArgs),
    /// Delete a stored chunk
    Delete {
        /// Chunk id
        id: String,
    },
    /// Show system status and statistics
    Status(StatusArgs),
    /// Remove every stored chunk from the collection
    Reset,
    /// Manage the processing cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Read and change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Preview how a file would be chunked
    Chunk(ChunkArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

/// Parse `key=value`. Values that are valid JSON scalars (numbers, booleans)
/// keep their type; anything else is a string.
fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    let value = match serde_json::from_str::<Value>(value) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(value.to_string()),
    };
    Ok((key.to_string(), value))
}

fn parse_embedder(s: &str) -> Result<EmbedderKind, String> {
    s.parse().map_err(|e: docrag::Error| e.to_string())
}

/// Collect `key=value` pairs into metadata; later pairs win.
pub fn to_metadata(pairs: &[(String, Value)]) -> Metadata {
    pairs.iter().cloned().collect()
}

// -- Processing --

#[derive(Debug, Parser)]
pub struct ProcessArgs {
    /// File to process
    pub path: PathBuf,

    /// Metadata attached to every chunk (repeatable)
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub meta: Vec<(String, Value)>,

    /// Reprocess even if a cached result exists
    #[arg(long)]
    pub force: bool,

    /// Output the full result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Directory to walk
    pub dir: PathBuf,

    /// Only process files whose relative path matches this glob
    #[arg(long)]
    pub glob: Option<String>,

    /// Metadata attached to every chunk (repeatable)
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub meta: Vec<(String, Value)>,

    /// Reprocess even if cached results exist
    #[arg(long)]
    pub force: bool,

    /// Output per-file summaries as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Retrieval --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return (defaults to the rerank_top_k setting)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Only match chunks whose metadata has this value (repeatable)
    #[arg(long = "filter", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub filter: Vec<(String, Value)>,

    /// Skip cross-encoder reranking
    #[arg(long)]
    pub no_rerank: bool,

    /// Print a context block instead of a result list
    #[arg(long, conflicts_with = "json")]
    pub context: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct SimilarArgs {
    /// Id of the stored chunk
    pub id: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Chunk id
    pub id: String,

    /// Output as JSON with metadata
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Cache --

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Delete every cached processing result
    Clear,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// List every setting with its effective value
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective value of a setting
    Get { key: String },
    /// Persist a setting
    Set { key: String, value: String },
    /// Remove a stored setting (revert to default)
    Unset { key: String },
}

// -- Chunk preview --

#[derive(Debug, Parser)]
pub struct ChunkArgs {
    /// File to chunk
    pub path: PathBuf,

    /// Target chunk size in words (defaults to the chunk_size setting)
    #[arg(long)]
    pub size: Option<usize>,

    /// Overlap in words (defaults to the chunk_overlap setting)
    #[arg(long)]
    pub overlap: Option<usize>,

    /// Output chunks as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}
