use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wellstore_engine::{
    ChannelDataEngine, ConfigHandle, DeleteRequest, DeleteScope, EngineConfig, GrowingObjectManager,
    IndexArg, IndexType, LogHeader, LogId, MergeRequest, QueryRequest,
};
use wellstore_storage::ObjectStore;

#[derive(Clone, Debug, Parser)]
#[clap(about, version, author)]
struct Args {
    /// Directory holding the store.
    #[clap(long)]
    pub root: PathBuf,

    /// JSON file with engine settings; defaults apply to missing fields.
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Create a log from a JSON header.
    Create {
        #[clap(long)]
        header: PathBuf,
    },
    /// List stored logs.
    List,
    /// Merge a data file: mnemonics on the first line, units on the second,
    /// one row per following line.
    Merge {
        #[clap(long)]
        log: String,
        #[clap(long)]
        file: PathBuf,
    },
    /// Print rows of a log.
    Query {
        #[clap(long)]
        log: String,
        #[clap(long = "mnemonic")]
        mnemonics: Vec<String>,
        #[clap(long)]
        start: Option<String>,
        #[clap(long)]
        end: Option<String>,
        #[clap(long)]
        latest: Option<usize>,
        #[clap(long)]
        json: bool,
    },
    /// Delete a whole log, a channel, or a range of rows.
    Delete {
        #[clap(long)]
        log: String,
        #[clap(long)]
        channel: Option<String>,
        #[clap(long)]
        start: Option<String>,
        #[clap(long)]
        end: Option<String>,
        /// Required to remove the whole log.
        #[clap(long)]
        all: bool,
    },
    /// Demote stale growing logs once, or keep doing so until ctrl-c.
    Sweep {
        #[clap(long)]
        watch: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct QueryOutput {
    columns: Vec<String>,
    units: Vec<String>,
    rows: Vec<String>,
    truncated: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&text)?
        }
        None => EngineConfig::default(),
    };

    let store = ObjectStore::open(&args.root).await?;
    let engine = Arc::new(ChannelDataEngine::new(
        Arc::new(store),
        Arc::new(ConfigHandle::try_new(config)?),
    ));

    match args.command {
        Command::Create { header } => {
            let text = std::fs::read_to_string(&header)
                .with_context(|| format!("reading header {}", header.display()))?;
            let header: LogHeader = serde_json::from_str(&text)?;
            let created = engine.create_log(header).await?;
            println!("created {}", created.id);
        }
        Command::List => {
            for id in engine.list_logs().await? {
                println!("{}", id);
            }
        }
        Command::Merge { log, file } => {
            let id = parse_log_id(&log)?;
            let meta = engine.log_metadata(&id).await?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading data {}", file.display()))?;

            let mut lines = text.lines().filter(|l| !l.trim().is_empty());
            let split = |line: &str| -> Vec<String> {
                line.split(meta.delimiter).map(|s| s.trim().to_string()).collect()
            };
            let columns = split(lines.next().ok_or_else(|| anyhow!("missing mnemonic line"))?);
            let units = split(lines.next().ok_or_else(|| anyhow!("missing unit line"))?);
            let rows = lines.map(|l| l.to_string()).collect();

            let result = engine
                .merge(MergeRequest::new(id, columns, rows).with_units(units))
                .await?;
            info!(
                rows = result.rows_merged,
                chunks = result.chunks_written,
                growing = result.is_growing,
                "merged"
            );
            println!(
                "start={} end={}",
                result.start.map(|v| v.format(meta.depth_scale)).unwrap_or_default(),
                result.end.map(|v| v.format(meta.depth_scale)).unwrap_or_default()
            );
        }
        Command::Query {
            log,
            mnemonics,
            start,
            end,
            latest,
            json,
        } => {
            let id = parse_log_id(&log)?;
            let meta = engine.log_metadata(&id).await?;
            let mut request = QueryRequest::new(id)
                .with_mnemonics(mnemonics)
                .with_range(
                    parse_bound(start.as_deref(), meta.index_type)?,
                    parse_bound(end.as_deref(), meta.index_type)?,
                );
            if let Some(n) = latest {
                request = request.with_latest_values(n);
            }

            let result = engine.query(request).await?;
            let delimiter = result.delimiter.to_string();
            if json {
                let output = QueryOutput {
                    columns: result.columns,
                    units: result.units,
                    rows: result.rows,
                    truncated: result.truncated,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", result.columns.join(&delimiter));
                println!("{}", result.units.join(&delimiter));
                for row in &result.rows {
                    println!("{}", row);
                }
                if result.truncated {
                    eprintln!("result truncated");
                }
            }
        }
        Command::Delete {
            log,
            channel,
            start,
            end,
            all,
        } => {
            let id = parse_log_id(&log)?;
            let meta = engine.log_metadata(&id).await?;
            let start = parse_bound(start.as_deref(), meta.index_type)?;
            let end = parse_bound(end.as_deref(), meta.index_type)?;

            let scope = match (channel, start.is_some() || end.is_some(), all) {
                (None, false, true) => DeleteScope::FullObject,
                (Some(c), false, false) => DeleteScope::FullChannel(c),
                (None, true, false) => DeleteScope::IndexRange(start, end),
                (Some(c), true, false) => DeleteScope::ChannelIndexRange(c, start, end),
                (_, _, true) => bail!("--all cannot be combined with --channel or a range"),
                (None, false, false) => bail!("nothing to delete; pass --all to remove the log"),
            };
            engine.delete(DeleteRequest::new(id, scope)).await?;
        }
        Command::Sweep { watch } => {
            let manager = Arc::new(GrowingObjectManager::new(engine.clone()));
            if !watch {
                let stats = manager.sweep().await?;
                println!(
                    "scanned={} expired={} vanished={}",
                    stats.scanned, stats.expired, stats.vanished
                );
                return Ok(());
            }

            let (tx, rx) = tokio::sync::watch::channel(false);
            let handle = manager.start(rx);
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            tx.send(true)?;
            handle.await?;
        }
    }

    Ok(())
}

fn parse_log_id(s: &str) -> anyhow::Result<LogId> {
    LogId::parse(s).ok_or_else(|| anyhow!("log id must look like well/wellbore/uid, got {:?}", s))
}

fn parse_bound(text: Option<&str>, index_type: IndexType) -> anyhow::Result<Option<IndexArg>> {
    let text = match text {
        Some(text) => text,
        None => return Ok(None),
    };
    let arg = match index_type {
        IndexType::Depth => IndexArg::Depth(text.parse().with_context(|| format!("bad depth {:?}", text))?),
        IndexType::Time => IndexArg::Time(
            DateTime::parse_from_rfc3339(text)
                .with_context(|| format!("bad time {:?}", text))?
                .with_timezone(&Utc),
        ),
    };
    Ok(Some(arg))
}
