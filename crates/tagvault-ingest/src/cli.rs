//! Command-line interface for `tv-ingest`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tagvault_meta::store::DEFAULT_PAGE_SIZE;
use tagvault_meta::{
    Digest, FileRecord, FileStatus, JournaledKvStore, ListQuery, SortKey, SortOrder,
};
use tokio::sync::broadcast::error::RecvError;

use crate::catalog::Catalog;
use crate::config::IngestConfig;
use crate::intake::ThumbnailSource;
use crate::service::IngestService;
use crate::task::{CorrelationId, IngestOutcome, TaskReport};

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "tv-ingest")]
#[command(about = "TagVault upload ingest and catalog maintenance", long_about = None)]
pub struct Cli {
    /// Config file (.toml or .json)
    #[arg(short, long, env = "TAGVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data root; overrides every directory in the config
    #[arg(short, long, env = "TAGVAULT_ROOT")]
    pub root: Option<PathBuf>,

    /// Print results as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Listing order.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SortArg {
    /// Creation time
    Created,
    /// Original file name
    Name,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Ingest local files
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Tags, repeatable or comma-separated
        #[arg(short, long)]
        tag: Vec<String>,
        /// Thumbnail applied to every file in this batch
        #[arg(long)]
        thumbnail: Option<PathBuf>,
    },
    /// List stored files
    List {
        /// Only files carrying every one of these tags
        #[arg(short, long)]
        tag: Vec<String>,
        /// Case-insensitive substring of the file name
        #[arg(short, long)]
        name: Option<String>,
        /// Only files in this status (default: completed)
        #[arg(long)]
        status: Option<FileStatus>,
        /// Sort field
        #[arg(long, value_enum, default_value = "created")]
        sort: SortArg,
        /// Oldest or A-Z first
        #[arg(long)]
        asc: bool,
        /// 1-based page
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// Items per page
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        size: usize,
    },
    /// Remove a file by digest
    Remove {
        /// Hex content digest
        digest: String,
    },
    /// Replace the tags of a file
    Retag {
        /// Hex content digest
        digest: String,
        /// New tags, repeatable or comma-separated
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Search tags by name
    Tags {
        /// Substring to match; empty lists all
        #[arg(default_value = "")]
        query: String,
        /// Maximum results
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Verify tag counts against stored files
    Fsck {
        /// Fix what is found
        #[arg(long)]
        repair: bool,
    },
    /// Delete tags no file uses
    PruneTags,
    /// Finish tasks accepted by a previous run
    Recover,
}

impl Cli {
    /// Resolve the effective configuration.
    pub fn load_config(&self) -> Result<IngestConfig> {
        let mut config = match &self.config {
            Some(path) => IngestConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => IngestConfig::default(),
        };
        if let Some(root) = &self.root {
            let rooted = IngestConfig::with_root(root);
            config.data_dir = rooted.data_dir;
            config.staging_dir = rooted.staging_dir;
            config.thumbs_dir = rooted.thumbs_dir;
            config.metadata_path = rooted.metadata_path;
        }
        config.validate()?;
        Ok(config)
    }

    /// Execute the parsed command.
    pub async fn run(self, config: IngestConfig) -> Result<()> {
        let json = self.json;
        match self.command {
            Command::Ingest {
                files,
                tag,
                thumbnail,
            } => ingest(config, &files, &tag, thumbnail, json).await,
            Command::List {
                tag,
                name,
                status,
                sort,
                asc,
                page,
                size,
            } => {
                let catalog = open_catalog(&config)?;
                let Some(tags) = catalog.tag_filter(&tag)? else {
                    if !json {
                        println!("No files (unknown tag)");
                    }
                    return Ok(());
                };
                let query = ListQuery {
                    tags,
                    name_contains: name,
                    status: status.or(Some(FileStatus::Completed)),
                    sort: match sort {
                        SortArg::Created => SortKey::CreatedAt,
                        SortArg::Name => SortKey::Name,
                    },
                    order: if asc {
                        SortOrder::Ascending
                    } else {
                        SortOrder::Descending
                    },
                    page,
                    page_size: size,
                };
                let result = catalog.list(&query)?;
                for record in &result.items {
                    print_record(&catalog, record, json)?;
                }
                if !json {
                    println!(
                        "Page {}/{} ({} files)",
                        result.page,
                        result.total_pages(),
                        result.total
                    );
                }
                Ok(())
            }
            Command::Remove { digest } => {
                let catalog = open_catalog(&config)?;
                let record = catalog.remove(&parse_digest(&digest)?).await?;
                if json {
                    println!("{}", json!({ "removed": record.digest.to_hex() }));
                } else {
                    println!("Removed {} ({})", record.original_name, record.digest);
                }
                Ok(())
            }
            Command::Retag { digest, tag } => {
                let catalog = open_catalog(&config)?;
                let record = catalog.retag(&parse_digest(&digest)?, &tag)?;
                print_record(&catalog, &record, json)
            }
            Command::Tags { query, limit } => {
                let catalog = open_catalog(&config)?;
                for entry in catalog.search_tags(&query, limit)? {
                    if json {
                        println!("{}", json!({ "name": entry.name, "count": entry.count }));
                    } else {
                        println!("{:>8}  {}", entry.count, entry.name);
                    }
                }
                Ok(())
            }
            Command::Fsck { repair } => {
                let catalog = open_catalog(&config)?;
                let report = catalog.check()?;
                for issue in &report.issues {
                    println!("{}", issue);
                }
                println!(
                    "Scanned {} files and {} tags: {} issues",
                    report.records_scanned,
                    report.tags_scanned,
                    report.issues.len()
                );
                if report.is_clean() {
                    return Ok(());
                }
                if repair {
                    let fixed = catalog.repair(&report)?;
                    println!("Repaired {} issues", fixed);
                    Ok(())
                } else {
                    anyhow::bail!("{} issues found; rerun with --repair", report.issues.len())
                }
            }
            Command::PruneTags => {
                let catalog = open_catalog(&config)?;
                let pruned = catalog.prune_unused_tags()?;
                for entry in &pruned {
                    println!("Pruned {}", entry.name);
                }
                Ok(())
            }
            Command::Recover => {
                let service = IngestService::open(config)?;
                let mut reports = service.reports();
                let n = service.recover().await?;
                let mut remaining = n;
                while remaining > 0 {
                    match reports.recv().await {
                        Ok(report) => {
                            print_report(&report, &report.correlation_id.to_string(), json);
                            remaining -= 1;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            remaining = remaining.saturating_sub(skipped as usize)
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                service.drain().await;
                println!("Recovered {} tasks", n);
                Ok(())
            }
        }
    }
}

fn open_catalog(config: &IngestConfig) -> Result<Catalog> {
    config.ensure_dirs()?;
    let kv = JournaledKvStore::open(&config.metadata_path, config.journal.clone())
        .with_context(|| format!("opening catalog {}", config.metadata_path.display()))?;
    Ok(Catalog::new(Arc::new(kv), config))
}

fn parse_digest(s: &str) -> Result<Digest> {
    Digest::from_hex(s.trim()).with_context(|| format!("invalid digest '{}'", s))
}

async fn ingest(
    config: IngestConfig,
    files: &[PathBuf],
    tags: &[String],
    thumbnail: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let service = IngestService::open(config)?;
    let mut reports = service.reports();
    let mut pending: HashMap<CorrelationId, &Path> = HashMap::new();
    let mut failed = 0usize;

    for file in files {
        let thumb = thumbnail.clone().map(ThumbnailSource::File);
        match service.intake().stage_file(file, tags, thumb).await {
            Ok(id) => {
                pending.insert(id, file.as_path());
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", file.display(), e);
            }
        }
    }

    while !pending.is_empty() {
        match reports.recv().await {
            Ok(report) => {
                if let Some(file) = pending.remove(&report.correlation_id) {
                    if matches!(report.outcome, IngestOutcome::Failed { .. }) {
                        failed += 1;
                    }
                    print_report(&report, &file.display().to_string(), json);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed task reports");
            }
            Err(RecvError::Closed) => break,
        }
    }
    service.drain().await;

    if failed > 0 {
        anyhow::bail!("{} of {} files failed", failed, files.len());
    }
    Ok(())
}

fn print_report(report: &TaskReport, label: &str, json: bool) {
    let (status, digest, detail) = match &report.outcome {
        IngestOutcome::Completed(record) => (
            "completed",
            Some(record.digest.to_hex()),
            record.file_path.display().to_string(),
        ),
        IngestOutcome::Duplicate { digest, existing } => (
            "duplicate",
            Some(digest.to_hex()),
            existing.file_path.display().to_string(),
        ),
        IngestOutcome::Failed { reason, .. } => ("failed", None, reason.clone()),
    };
    if json {
        println!(
            "{}",
            json!({
                "file": label,
                "correlation_id": report.correlation_id.to_string(),
                "status": status,
                "digest": digest,
                "detail": detail,
            })
        );
    } else {
        println!(
            "{:<10} {}  {}  {}",
            status,
            digest.as_deref().unwrap_or("-"),
            label,
            detail
        );
    }
}

fn print_record(catalog: &Catalog, record: &FileRecord, json: bool) -> Result<()> {
    let tags = catalog.tag_names(record)?;
    if json {
        println!(
            "{}",
            json!({
                "digest": record.digest.to_hex(),
                "name": record.original_name,
                "path": record.file_path,
                "size": record.size,
                "tags": tags,
                "status": record.status.as_str(),
                "thumbnail": record.thumbnail_path,
                "created_at": record.created_at.secs,
            })
        );
    } else {
        println!(
            "{}  {:>12}  {}  [{}]",
            record.digest,
            record.size,
            record.original_name,
            tags.join(", ")
        );
    }
    Ok(())
}
