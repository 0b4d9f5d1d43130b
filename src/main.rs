use std::{path::Path, sync::Arc};

use clap::Parser;
use docrag::{
    CancelToken,
    ConfigDb,
    DataDir,
    RagService,
    ServiceConfig,
    chunking::{ChunkingConfig, chunk_text},
    config::{self, EmbedderKind, PipelineConfig},
    embedding::{ColbertEmbedder, Embedder, HashingEmbedder, TimedEmbedder},
    error::{self, Error},
    extract,
    model_manager::{ModelManager, resolve_model_id},
    reranker::{
        ColbertReranker,
        CrossEncoder,
        LexicalCrossEncoder,
        TimedCrossEncoder,
    },
    retriever::{RerankerFactory, RetrievalResult},
    text_util::{DEFAULT_CONTEXT_CHARS, normalize_whitespace, truncate_text},
};
use kdam::{BarExt, tqdm};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CacheAction, Cli, Command, ConfigAction, to_metadata};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    match &cli.command {
        Command::Config { action } => return cmd_config(&config_db, action),
        Command::Chunk(args) => {
            let pipeline = PipelineConfig::load(&config_db)?;
            return cmd_chunk(&pipeline, args);
        }
        _ => {}
    }

    let mut pipeline = PipelineConfig::load(&config_db)?;
    if let Some(kind) = cli.embedder {
        pipeline.embedder = kind;
    }
    let service = open_service(&cli, &data_dir, pipeline)?;

    match cli.command {
        Command::Process(args) => {
            let meta = to_metadata(&args.meta);
            let result = service.process_document(&args.path, &meta, args.force)?;
            if args.json {
                print_json(&result)?;
            } else {
                println!(
                    "{}: {} ({} of {} chunks stored, {:.2}s)",
                    args.path.display(),
                    result.status,
                    result.document_ids.len(),
                    result.raw_chunk_count,
                    result.processing_time
                );
                if let Some(e) = &result.error {
                    println!("  error: {e}");
                }
            }
        }
        Command::Ingest(args) => {
            let meta = to_metadata(&args.meta);
            let show_progress = !cli.quiet && !args.json;
            let mut bar = None;
            // Cancellation is for library callers. An interrupted ingest exits
            // and the next run resumes from the cache.
            let summaries = service.ingest_dir(
                &args.dir,
                args.glob.as_deref(),
                &meta,
                args.force,
                &CancelToken::new(),
                |_, total, _| {
                    if show_progress {
                        let bar = bar.get_or_insert_with(|| {
                            tqdm!(total = total, desc = "Ingesting", unit = " files")
                        });
                        let _ = bar.update(1);
                    }
                },
            )?;
            if bar.is_some() {
                eprintln!();
            }

            if args.json {
                print_json(&summaries)?;
            } else {
                for s in summaries.iter().filter(|s| s.error.is_some()) {
                    println!(
                        "{}: {} ({})",
                        s.relative_path.display(),
                        s.status,
                        s.error.as_deref().unwrap_or_default()
                    );
                }
                let stored: usize = summaries.iter().map(|s| s.stored).sum();
                println!("Processed {} files, stored {stored} chunks", summaries.len());
            }
        }
        Command::Search(args) => {
            let filter = to_metadata(&args.filter);
            let results = service.search_with(
                &args.query,
                args.count,
                (!filter.is_empty()).then_some(&filter),
                !args.no_rerank,
            );
            if args.context {
                print!("{}", context_block(&results));
            } else if args.json {
                print_json(&results)?;
            } else {
                print_results(&results);
            }
        }
        Command::Similar(args) => {
            if service.get_document(&args.id).is_none() {
                return Err(Error::NotFound {
                    kind: "chunk",
                    name: args.id,
                });
            }
            let results = service.similar(&args.id, args.count);
            if args.json {
                print_json(&results)?;
            } else {
                print_results(&results);
            }
        }
        Command::Get(args) => {
            let record = service.get_document(&args.id).ok_or_else(|| {
                Error::NotFound {
                    kind: "chunk",
                    name: args.id.clone(),
                }
            })?;
            if args.json {
                print_json(&record)?;
            } else {
                for (key, value) in &record.metadata {
                    println!("{key}: {value}");
                }
                println!();
                println!("{}", record.text);
            }
        }
        Command::Delete { id } => {
            if service.get_document(&id).is_none() {
                return Err(Error::NotFound {
                    kind: "chunk",
                    name: id,
                });
            }
            if !service.delete_document(&id) {
                return Err(Error::StoreWrite(format!("failed to delete {id}")));
            }
            println!("Deleted {id}");
        }
        Command::Status(args) => {
            cmd_status(&service, &data_dir, args.json)?;
        }
        Command::Reset => {
            if !service.reset_vector_store() {
                return Err(Error::StoreWrite("failed to reset collection".into()));
            }
            println!("Removed every chunk from '{}'", service.config().collection);
        }
        Command::Cache { action } => match action {
            CacheAction::Clear => {
                let entries = service.cache_len();
                if !service.clear_cache() {
                    return Err(Error::CacheIo("failed to clear cache".into()));
                }
                println!("Cleared {entries} cache entries");
            }
        },
        // Handled before the service is opened.
        Command::Config { .. } | Command::Chunk(_) | Command::Completions(_) => {}
    }

    Ok(())
}

/// Build the embedder and cross-encoder for `pipeline` and open the service.
fn open_service(
    cli: &Cli,
    data_dir: &DataDir,
    pipeline: PipelineConfig,
) -> error::Result<RagService> {
    let timeout = pipeline.embed_timeout();

    let embedder: Arc<dyn Embedder>;
    let reranker_factory: RerankerFactory;
    match pipeline.embedder {
        EmbedderKind::Hashing => {
            embedder = Arc::new(HashingEmbedder::new(pipeline.hashing_dimension));
            reranker_factory = Box::new(|| {
                let encoder: Arc<dyn CrossEncoder> = Arc::new(LexicalCrossEncoder);
                Ok(encoder)
            });
        }
        EmbedderKind::Colbert => {
            let model_id = resolve_model_id(cli.model.as_deref(), &pipeline.model);
            let model = ModelManager::with_model_id(model_id).shared();
            let reranker_model = Arc::clone(&model);
            embedder = Arc::new(ColbertEmbedder::new(model));
            reranker_factory = Box::new(move || {
                let encoder: Arc<dyn CrossEncoder> = Arc::new(TimedCrossEncoder::new(
                    Arc::new(ColbertReranker::new(reranker_model)),
                    timeout,
                ));
                Ok(encoder)
            });
        }
    }

    let embedder: Arc<dyn Embedder> = Arc::new(TimedEmbedder::new(embedder, timeout));

    RagService::open(
        ServiceConfig {
            vectors_dir: data_dir.vectors_dir()?,
            cache_dir: data_dir.cache_dir()?,
            pipeline,
        },
        embedder,
        Some(reranker_factory),
    )
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> error::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn source_of(result: &RetrievalResult) -> &str {
    result
        .metadata
        .get("file_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}

fn print_results(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in results.iter().enumerate() {
        let rerank = r
            .rerank_score
            .map(|s| format!(" rerank {s:.3}"))
            .unwrap_or_default();
        println!(
            "{:>2}. [{:.3}] {} (vector {:.3}{rerank})",
            i + 1,
            r.combined_score,
            source_of(r),
            r.vector_score
        );
        println!("    id: {}", r.id);
        println!("    {}", truncate_text(&r.text, 200, "..."));
    }
}

fn context_block(results: &[RetrievalResult]) -> String {
    docrag::text_util::assemble_context(
        results.iter().map(|r| (source_of(r), r.text.as_str())),
        DEFAULT_CONTEXT_CHARS,
    )
}

#[derive(Serialize)]
struct Status<'a> {
    data_dir: &'a Path,
    collection: &'a str,
    documents: usize,
    cache_entries: usize,
    embedder: &'a str,
    reranking: bool,
    capabilities: extract::Capabilities,
    supported_extensions: Vec<&'static str>,
}

fn cmd_status(
    service: &RagService,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let capabilities = service.capabilities();
    let status = Status {
        data_dir: data_dir.root(),
        collection: &service.config().collection,
        documents: service.count_documents(),
        cache_entries: service.cache_len(),
        embedder: service.store().embedder().name(),
        reranking: service.retriever().reranking_active(),
        capabilities,
        supported_extensions: capabilities.supported_extensions(),
    };

    if json {
        print_json(&status)?;
    } else {
        println!("Data directory: {}", status.data_dir.display());
        println!("Collection: {}", status.collection);
        println!("Documents: {}", status.documents);
        println!("Cache entries: {}", status.cache_entries);
        println!("Embedder: {}", status.embedder);
        println!("Reranking: {}", if status.reranking { "on" } else { "off" });
        println!("Formats: {}", status.supported_extensions.join(", "));
    }
    Ok(())
}

fn cmd_config(config_db: &ConfigDb, action: &ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::List { json } => {
            let stored: std::collections::BTreeMap<String, String> =
                config_db.list_settings()?.into_iter().collect();
            let effective: std::collections::BTreeMap<&str, &str> = config::SETTINGS
                .iter()
                .map(|&(key, default)| {
                    (key, stored.get(key).map(String::as_str).unwrap_or(default))
                })
                .collect();
            if *json {
                print_json(&effective)?;
            } else {
                for (key, value) in &effective {
                    let marker = if stored.contains_key(*key) { "" } else { " (default)" };
                    println!("{key} = {value}{marker}");
                }
            }
        }
        ConfigAction::Get { key } => {
            let default = config::default_for(key).ok_or_else(|| Error::NotFound {
                kind: "setting",
                name: key.clone(),
            })?;
            println!("{}", config_db.get_setting_or(key, default)?);
        }
        ConfigAction::Set { key, value } => {
            config::validate_setting(key, value)?;
            config_db.set_setting(key, value)?;
            // Reject combinations that would stop the pipeline from loading.
            if let Err(e) = PipelineConfig::load(config_db) {
                config_db.remove_setting(key)?;
                return Err(e);
            }
            println!("{key} = {value}");
        }
        ConfigAction::Unset { key } => {
            if !config_db.remove_setting(key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key.clone(),
                });
            }
            println!("Removed {key}");
        }
    }
    Ok(())
}

fn cmd_chunk(pipeline: &PipelineConfig, args: &cli::ChunkArgs) -> error::Result<()> {
    let chunking = ChunkingConfig {
        chunk_size: args.size.unwrap_or(pipeline.chunk_size),
        overlap: args.overlap.unwrap_or(pipeline.chunk_overlap),
    };
    chunking.validate()?;

    let text = normalize_whitespace(&extract::extract(&args.path)?);
    let chunks = chunk_text(&text, chunking.chunk_size, chunking.overlap);

    if args.json {
        let out: Vec<_> = chunks
            .iter()
            .map(|c| serde_json::json!({"text": c.text, "metadata": c.metadata()}))
            .collect();
        print_json(&out)?;
    } else {
        for (i, chunk) in chunks.iter().enumerate() {
            println!("--- chunk {i} ({} words) ---", chunk.word_count);
            println!("{}", chunk.text);
        }
        println!("\n{} chunk(s)", chunks.len());
    }
    Ok(())
}
