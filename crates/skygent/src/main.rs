//! skygent — local-first firehose ingestion and query engine.
//!
//! The CLI is a thin shell: argument parsing, settings resolution, and
//! error → exit-code mapping. All behavior lives in the engine crates.

#![deny(unsafe_code)]

mod errors;
mod file_source;
mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use skygent_core::ids::{Handle, Hashtag, StoreName};
use skygent_filter::{FilterExpr, FilterRuntime, compile};
use skygent_settings::{OutputFormat, Settings, load_settings_from_root};
use skygent_store::config::SyncPolicy;
use skygent_store::filters::FilterLibrary;
use skygent_store::lock::StoreLock;
use skygent_store::types::{EvaluationMode, Order, SearchQuery, SearchSort, StoreQuery};
use skygent_store::{StoreManager, StoreRoot};
use skygent_sync::derive::{DeriveOptions, derive};
use skygent_sync::sync::{SyncOptions, sync};
use skygent_sync::watch::{WatchConfig, watch};
use skygent_images::{ImageCache, ImageCacheConfig, orphan_sweep, ttl_sweep};

use crate::errors::exit_code_for;
use crate::file_source::FileSource;
use crate::output::{print_error, print_json, print_line};

#[derive(Parser)]
#[command(name = "skygent", version, about = "Local-first Bluesky firehose engine")]
struct Cli {
    /// Store root (defaults to SKYGENT_STORE_ROOT or ./.skygent).
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store administration.
    #[command(subcommand)]
    Store(StoreCommand),
    /// Ingest raw posts from a capture file into a store.
    Sync {
        /// Target store.
        store: String,
        /// NDJSON capture of raw posts (file-backed data source).
        #[arg(long)]
        input: PathBuf,
        /// Named filter from the library.
        #[arg(long, conflicts_with = "filter_json")]
        filter: Option<String>,
        /// Inline filter expression JSON.
        #[arg(long)]
        filter_json: Option<String>,
        /// Refresh instead of dedupe.
        #[arg(long)]
        refresh: bool,
        /// Abort on the first per-post error.
        #[arg(long)]
        strict: bool,
        /// Per-post error budget.
        #[arg(long, default_value_t = 25)]
        max_errors: usize,
    },
    /// Repeatedly sync on an interval.
    Watch {
        /// Target store.
        store: String,
        /// NDJSON capture of raw posts.
        #[arg(long)]
        input: PathBuf,
        /// Named filter from the library.
        #[arg(long, conflicts_with = "filter_json")]
        filter: Option<String>,
        /// Inline filter expression JSON.
        #[arg(long)]
        filter_json: Option<String>,
        /// Seconds between cycles.
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Replay a source store through a filter into a derived store.
    Derive {
        /// Source store.
        source: String,
        /// Target (derived) store.
        target: String,
        /// Named filter from the library.
        #[arg(long, conflicts_with = "filter_json")]
        filter: Option<String>,
        /// Inline filter expression JSON.
        #[arg(long)]
        filter_json: Option<String>,
        /// Allow effectful filters (non-deterministic across runs).
        #[arg(long)]
        derive_time: bool,
        /// Clear the target and rebuild from scratch.
        #[arg(long)]
        reset: bool,
    },
    /// Named filter library.
    #[command(subcommand)]
    Filter(FilterCommand),
    /// Scan a store's index.
    Query {
        /// Store to query.
        store: String,
        /// Restrict to an author handle.
        #[arg(long)]
        author: Option<String>,
        /// Restrict to a hashtag.
        #[arg(long)]
        hashtag: Option<String>,
        /// Newest first.
        #[arg(long)]
        newest: bool,
        /// Cap on results.
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Substring search over post text.
    Search {
        /// Store to search.
        store: String,
        /// Needle.
        query: String,
        /// Oldest first (default newest).
        #[arg(long)]
        oldest: bool,
        /// Page size.
        #[arg(long, default_value_t = 25)]
        limit: u64,
        /// Page cursor from a previous run.
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Image cache maintenance.
    #[command(subcommand)]
    Images(ImagesCommand),
}

#[derive(Subcommand)]
enum StoreCommand {
    /// Create a store.
    Create {
        /// Store name.
        name: String,
    },
    /// List stores.
    List,
    /// Delete a store and its data.
    Delete {
        /// Store name.
        name: String,
    },
    /// Rename a store, rewriting lineage references.
    Rename {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Counters and staleness.
    Stats {
        /// Store name.
        name: String,
    },
}

#[derive(Subcommand)]
enum FilterCommand {
    /// Compile and save a filter under a name.
    Save {
        /// Filter name.
        name: String,
        /// Filter expression JSON.
        json: String,
    },
    /// List saved filters.
    List,
    /// Remove a saved filter.
    Rm {
        /// Filter name.
        name: String,
    },
    /// Compile every saved filter and report problems.
    Validate,
    /// Explain why a post does or does not match a filter.
    Explain {
        /// Named filter or inline JSON (tried in that order).
        filter: String,
        /// Path to a post JSON file.
        post: PathBuf,
    },
}

#[derive(Subcommand)]
enum ImagesCommand {
    /// Delete cache entries older than the TTL (0 = everything).
    Sweep {
        /// Override TTL in seconds.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Diff the cache against a store's image references.
    Gc {
        /// Store whose events define the live set.
        store: String,
        /// Actually delete the orphans.
        #[arg(long)]
        remove: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => {}
        Err(e) => {
            let code = exit_code_for(&e);
            print_error(&e, code);
            std::process::exit(code);
        }
    }
}

struct App {
    settings: Arc<Settings>,
    manager: StoreManager,
    root: StoreRoot,
    json: bool,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let root_path = cli
        .store_root
        .clone()
        .or_else(|| std::env::var_os("SKYGENT_STORE_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./.skygent"));
    let settings = Arc::new(load_settings_from_root(&root_path)?);
    let root = StoreRoot::new(settings.store_root());
    let app = App {
        json: cli.json || settings.output_format == OutputFormat::Json,
        manager: StoreManager::new(root.clone()),
        root,
        settings,
    };

    match cli.command {
        Command::Store(cmd) => run_store(&app, cmd),
        Command::Sync {
            store,
            input,
            filter,
            filter_json,
            refresh,
            strict,
            max_errors,
        } => {
            let name = StoreName::new(store)?;
            let expr = resolve_filter(&app, filter.as_deref(), filter_json.as_deref())?;
            let _lock = StoreLock::acquire_wait(&app.root, &name, Duration::from_secs(5))?;
            let target = app.manager.ensure(&name)?;
            let source = FileSource::open(&input)?;
            let options = SyncOptions {
                policy: if refresh {
                    SyncPolicy::Refresh
                } else {
                    SyncPolicy::Dedupe
                },
                strict,
                max_errors,
                command: Some("sync".into()),
                ..Default::default()
            };
            let result = sync(&source, &target, &expr, &FilterRuntime::detached(), &options).await?;
            emit(&app, &result)
        }
        Command::Watch {
            store,
            input,
            filter,
            filter_json,
            interval,
            max_cycles,
        } => {
            let name = StoreName::new(store)?;
            let expr = resolve_filter(&app, filter.as_deref(), filter_json.as_deref())?;
            let _lock = StoreLock::acquire_wait(&app.root, &name, Duration::from_secs(5))?;
            let target = app.manager.ensure(&name)?;
            let source = Arc::new(FileSource::open(&input)?);

            let options = SyncOptions {
                command: Some("watch".into()),
                ..Default::default()
            };
            let ctrl_c_cancel = options.cancel.clone();
            let _ = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_cancel.cancel();
                }
            });

            let config = WatchConfig {
                interval: Duration::from_secs(interval),
                max_cycles,
                sync: options,
            };
            let stream = watch(
                source,
                target,
                expr,
                FilterRuntime::detached(),
                config,
            );
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => emit(&app, &event.result)?,
                    Err(e) => print_line(&format!("watch cycle failed: {e}")),
                }
            }
            Ok(())
        }
        Command::Derive {
            source,
            target,
            filter,
            filter_json,
            derive_time,
            reset,
        } => {
            let source = StoreName::new(source)?;
            let target_name = StoreName::new(target)?;
            let expr = resolve_filter(&app, filter.as_deref(), filter_json.as_deref())?;
            let _lock = StoreLock::acquire_wait(&app.root, &target_name, Duration::from_secs(5))?;
            let options = DeriveOptions {
                mode: if derive_time {
                    EvaluationMode::DeriveTime
                } else {
                    EvaluationMode::EventTime
                },
                reset,
                checkpoint_every: app.settings.sync.derivation_checkpoint_every,
                checkpoint_interval: app.settings.sync.checkpoint_interval(),
                ..Default::default()
            };
            let result = derive(
                &app.manager,
                &source,
                &target_name,
                &expr,
                &FilterRuntime::detached(),
                &options,
            )
            .await?;
            emit(&app, &result)
        }
        Command::Filter(cmd) => run_filter(&app, cmd).await,
        Command::Query {
            store,
            author,
            hashtag,
            newest,
            limit,
        } => {
            let store = app.manager.get(&StoreName::new(store)?)?;
            let query = StoreQuery {
                author: author.map(Handle::new).transpose()?,
                hashtag: hashtag.map(Hashtag::new).transpose()?,
                order: if newest { Order::Desc } else { Order::Asc },
                scan_limit: Some(limit),
                ..Default::default()
            };
            let posts = store
                .query(query)?
                .collect::<Result<Vec<_>, _>>()?;
            emit(&app, &posts)
        }
        Command::Search {
            store,
            query,
            oldest,
            limit,
            cursor,
        } => {
            let store = app.manager.get(&StoreName::new(store)?)?;
            let page = store.search(&SearchQuery {
                query,
                sort: if oldest {
                    SearchSort::Oldest
                } else {
                    SearchSort::Newest
                },
                limit: Some(limit),
                cursor,
            })?;
            emit(&app, &page)
        }
        Command::Images(cmd) => run_images(&app, cmd),
    }
}

fn run_store(app: &App, cmd: StoreCommand) -> anyhow::Result<()> {
    match cmd {
        StoreCommand::Create { name } => {
            let name = StoreName::new(name)?;
            let _ = app.manager.create(&name)?;
            print_line(&format!("created store {name}"));
            Ok(())
        }
        StoreCommand::List => {
            let names = app.manager.list()?;
            emit(app, &names)
        }
        StoreCommand::Delete { name } => {
            let name = StoreName::new(name)?;
            app.manager.delete(&name)?;
            print_line(&format!("deleted store {name}"));
            Ok(())
        }
        StoreCommand::Rename { from, to } => {
            let from = StoreName::new(from)?;
            let to = StoreName::new(to)?;
            app.manager.rename(&from, &to)?;
            print_line(&format!("renamed store {from} to {to}"));
            Ok(())
        }
        StoreCommand::Stats { name } => {
            let stats = app.manager.stats(&StoreName::new(name)?)?;
            emit(app, &stats)
        }
    }
}

async fn run_filter(app: &App, cmd: FilterCommand) -> anyhow::Result<()> {
    let library = FilterLibrary::new(app.root.clone());
    match cmd {
        FilterCommand::Save { name, json } => {
            let name = StoreName::new(name)?;
            let expr: FilterExpr = serde_json::from_str(&json)?;
            library.save(&name, &expr).map_err(|e| match e {
                skygent_store::filters::SaveError::Compile(c) => anyhow::Error::new(c),
                skygent_store::filters::SaveError::Store(s) => anyhow::Error::new(s),
            })?;
            print_line(&format!("saved filter {name}"));
            Ok(())
        }
        FilterCommand::List => {
            let names = library.list()?;
            emit(app, &names)
        }
        FilterCommand::Rm { name } => {
            let name = StoreName::new(name)?;
            if library.remove(&name)? {
                print_line(&format!("removed filter {name}"));
            } else {
                print_line(&format!("no filter named {name}"));
            }
            Ok(())
        }
        FilterCommand::Validate => {
            let results = library.validate_all()?;
            let mut failed = false;
            for (name, verdict) in &results {
                match verdict {
                    Ok(()) => print_line(&format!("{name}: ok")),
                    Err(e) => {
                        failed = true;
                        print_line(&format!("{name}: {e}"));
                    }
                }
            }
            if failed {
                anyhow::bail!(skygent_filter::FilterCompileError {
                    message: "one or more saved filters do not compile".into(),
                });
            }
            Ok(())
        }
        FilterCommand::Explain { filter, post } => {
            let library_expr = StoreName::new(filter.as_str())
                .ok()
                .and_then(|name| library.get(&name).ok().flatten());
            let expr: FilterExpr = match library_expr {
                Some(expr) => expr,
                None => serde_json::from_str(&filter)?,
            };
            let _ = compile(&expr)?;
            let raw = std::fs::read(&post)?;
            let post: skygent_core::post::Post = serde_json::from_slice(&raw)?;
            let explanation = FilterRuntime::detached().explain(&expr, &post).await?;
            print_json(&explanation)
        }
    }
}

fn run_images(app: &App, cmd: ImagesCommand) -> anyhow::Result<()> {
    let mut config = ImageCacheConfig::new(app.root.images_dir());
    config.enabled = app.settings.images.enabled;
    config.cache_ttl = app.settings.images.cache_ttl();
    config.failure_ttl = app.settings.images.failure_ttl();
    config.max_bytes = app.settings.images.fetch_max_bytes;
    config.fetch_concurrency = app.settings.images.fetch_concurrency;
    let cache = ImageCache::new(config);

    match cmd {
        ImagesCommand::Sweep { ttl } => {
            let ttl = ttl.map_or(app.settings.images.cache_ttl(), Duration::from_secs);
            let report = ttl_sweep(&cache, ttl)?;
            emit(app, &report)
        }
        ImagesCommand::Gc { store, remove } => {
            let store = app.manager.get(&StoreName::new(store)?)?;
            let report = orphan_sweep(&cache, &store, remove)?;
            emit(app, &report)
        }
    }
}

fn resolve_filter(
    app: &App,
    named: Option<&str>,
    inline: Option<&str>,
) -> anyhow::Result<FilterExpr> {
    let expr = match (named, inline) {
        (Some(name), _) => {
            let name = StoreName::new(name)?;
            FilterLibrary::new(app.root.clone())
                .get(&name)?
                .ok_or_else(|| anyhow::anyhow!("no saved filter named {name}"))?
        }
        (None, Some(json)) => serde_json::from_str(json)?,
        (None, None) => FilterExpr::All,
    };
    let _ = compile(&expr)?;
    Ok(expr)
}

fn emit<T: serde::Serialize>(app: &App, value: &T) -> anyhow::Result<()> {
    if app.json {
        print_json(value)
    } else {
        print_line(&serde_json::to_string_pretty(value)?);
        Ok(())
    }
}
