//! CLI binary for tex2html.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, wires up the stores, and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tex2html::pipeline::fetch::{FsObjectStore, ObjectStore};
use tex2html::{
    convert::payloads_from_blobs, BatchOutcome, ConversionConfig, ConversionStore,
    ConversionStores, ConvertOutcome, Converter, Payload, PublishOutcome, PublishRequest,
    Publisher, RecordKey, RetryPolicy,
};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one submission source archive
  tex2html convert incoming/1234.tar.gz

  # Convert an announced document's source
  tex2html convert --document ftp/2301.00001v2.tar.gz

  # Batch-convert, skipping identifiers already tried
  tex2html batch --document ftp/2301.00001v1.tar.gz ftp/2301.00002v1.tar.gz

  # Promote a converted submission after announcement
  tex2html publish 1234 --paper-id 2301.00001 --paper-version 2 \
      --license-url http://creativecommons.org/licenses/by-sa/4.0/

  # Poll conversion state
  tex2html status 1234
  tex2html status --document 2301.00001v2 --json

STORAGE LAYOUT:
  --bucket-root points at a directory with five stores:
    sub-src/   submission source archives      (downloaded from)
    doc-src/   document source archives        (downloaded from)
    sub-out/   converted submission sites      (uploaded to)
    doc-out/   converted/published doc sites   (uploaded to)
    qa/        converter logs                  (uploaded to)

ENVIRONMENT VARIABLES:
  TEX2HTML_DB           Record database path
  TEX2HTML_BUCKET_ROOT  Storage root directory
  TEX2HTML_ENGINE       Converter build tag written into every record
  RUST_LOG              Tracing filter, overrides -v/-q
"#;

/// Track and orchestrate LaTeX-to-HTML conversion of scholarly papers.
#[derive(Parser, Debug)]
#[command(
    name = "tex2html",
    version,
    about = "Track and orchestrate LaTeX-to-HTML conversion of scholarly papers",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Record database path.
    #[arg(long, env = "TEX2HTML_DB", default_value = "records.db", global = true)]
    db: PathBuf,

    /// Root directory of the object stores (see STORAGE LAYOUT).
    #[arg(
        long,
        env = "TEX2HTML_BUCKET_ROOT",
        default_value = "buckets",
        global = true
    )]
    bucket_root: PathBuf,

    /// Converter build tag written into every record.
    #[arg(long, env = "TEX2HTML_ENGINE", default_value = "dev", global = true)]
    engine_version: String,

    /// External converter binary.
    #[arg(long, env = "TEX2HTML_CONVERTER", default_value = "latexmlc", global = true)]
    converter_bin: PathBuf,

    /// Converter wall-clock budget in seconds.
    #[arg(long, default_value_t = 300, global = true)]
    converter_timeout: u64,

    /// Extra binding search path for the converter (repeatable).
    #[arg(long, global = true)]
    style_path: Vec<PathBuf>,

    /// Base URL for CSS/JS assets linked into the produced HTML.
    #[arg(long, env = "TEX2HTML_ASSET_BASE", global = true)]
    asset_base_url: Option<String>,

    /// Local scratch directory.
    #[arg(long, default_value = "work", global = true)]
    work_dir: PathBuf,

    /// Per-identifier lock-file directory.
    #[arg(long, default_value = "locks", global = true)]
    lock_dir: PathBuf,

    /// Concurrent conversions in batch mode.
    #[arg(short, long, default_value_t = 4, global = true)]
    concurrency: usize,

    /// Output machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one source archive named by its blob key.
    Convert {
        /// Blob key of the source archive, e.g. `incoming/1234.tar.gz`.
        blob: String,
        /// Treat the blob as an announced document rather than a submission.
        #[arg(long)]
        document: bool,
    },
    /// Convert many source archives, skipping identifiers already tried.
    Batch {
        /// Blob keys of the source archives.
        blobs: Vec<String>,
        /// Treat the blobs as announced documents rather than submissions.
        #[arg(long)]
        document: bool,
    },
    /// Promote a converted submission to its announced document identity.
    Publish {
        /// Submission id whose converted site gets promoted.
        submission_id: i64,
        /// Permanent paper id, e.g. `2301.00001`.
        #[arg(long)]
        paper_id: String,
        /// Document version.
        #[arg(long, default_value_t = 1)]
        paper_version: i64,
        /// Canonical license URL from the announce metadata.
        #[arg(long)]
        license_url: Option<String>,
        /// Primary category, e.g. `cs.LG`.
        #[arg(long)]
        category: Option<String>,
        /// Submission date string carried into the artifact metadata.
        #[arg(long)]
        submitted_at: Option<String>,
    },
    /// Show the conversion record for an identifier.
    Status {
        /// Submission id, or `paperidvN` with --document.
        id: String,
        /// Look the identifier up as an announced document.
        #[arg(long)]
        document: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Wire up collaborators ────────────────────────────────────────────
    let config = build_config(&cli)?;
    let retry = RetryPolicy::new(
        config.store_retry_attempts,
        Duration::from_millis(config.store_retry_delay_ms),
    );
    let records = ConversionStore::open(&cli.db, retry)
        .await
        .with_context(|| format!("Failed to open record database {}", cli.db.display()))?;
    let stores = build_stores(&cli.bucket_root);

    match cli.command {
        Command::Convert { ref blob, document } => {
            let converter = Converter::new(config, records, stores);
            let outcome = converter
                .convert_blob(blob, document)
                .await
                .context("Conversion failed")?;
            report_convert(&cli, blob, &outcome);
        }
        Command::Batch {
            ref blobs,
            document,
        } => {
            let converter = Converter::new(config, records, stores);
            let items = payloads_from_blobs(blobs, document);
            let results = converter.convert_batch(items).await;
            report_batch(&cli, &results)?;
        }
        Command::Publish {
            submission_id,
            ref paper_id,
            paper_version,
            ref license_url,
            ref category,
            ref submitted_at,
        } => {
            let publisher = Publisher::new(config, records, stores);
            let request = PublishRequest {
                submission_id,
                paper_id: paper_id.clone(),
                version: paper_version,
                license_url: license_url.clone(),
                category: category.clone(),
                submitted_at: submitted_at.clone(),
            };
            let outcome = publisher.publish(&request).await.context("Publish failed")?;
            report_publish(&cli, &request, &outcome);
        }
        Command::Status { ref id, document } => {
            let key = parse_status_key(id, document)?;
            match records.fetch(&key).await.context("Status lookup failed")? {
                Some(record) => {
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                    } else {
                        println!("Record for {key}:");
                        println!("  status:          {:?}", record.status);
                        println!("  engine version:  {}", record.engine_version);
                        println!("  source checksum: {}", record.source_checksum);
                        println!("  start time:      {}", record.start_time);
                        match record.end_time {
                            Some(t) => println!("  end time:        {t}"),
                            None => println!("  end time:        (still in progress)"),
                        }
                    }
                }
                None => {
                    if cli.json {
                        println!("null");
                    } else {
                        println!("No record for {key}");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .engine_version(&cli.engine_version)
        .converter_bin(&cli.converter_bin)
        .converter_timeout_secs(cli.converter_timeout)
        .work_dir(&cli.work_dir)
        .lock_dir(&cli.lock_dir)
        .batch_concurrency(cli.concurrency);
    for path in &cli.style_path {
        builder = builder.style_path(path);
    }
    if let Some(url) = &cli.asset_base_url {
        builder = builder.asset_base_url(url);
    }
    builder.build().context("Invalid configuration")
}

/// The five directory-backed stores under the bucket root.
fn build_stores(root: &std::path::Path) -> ConversionStores {
    let bucket = |name: &str| -> Arc<dyn ObjectStore> {
        Arc::new(FsObjectStore::new(root.join(name)))
    };
    ConversionStores {
        sub_sources: bucket("sub-src"),
        doc_sources: bucket("doc-src"),
        sub_outputs: bucket("sub-out"),
        doc_outputs: bucket("doc-out"),
        qa_logs: bucket("qa"),
    }
}

fn parse_status_key(id: &str, document: bool) -> Result<RecordKey> {
    if document {
        let (paper_id, version) = tex2html::payload::split_paper_idv(id);
        Ok(RecordKey::Document {
            paper_id: paper_id.to_string(),
            version,
        })
    } else {
        let submission_id = id
            .parse::<i64>()
            .with_context(|| format!("'{id}' is not a submission id"))?;
        Ok(RecordKey::Submission(submission_id))
    }
}

fn report_convert(cli: &Cli, blob: &str, outcome: &ConvertOutcome) {
    if cli.json {
        let value = match outcome {
            ConvertOutcome::Converted { missing_packages } => serde_json::json!({
                "outcome": "converted",
                "blob": blob,
                "missing_packages": missing_packages,
            }),
            ConvertOutcome::Superseded => serde_json::json!({
                "outcome": "superseded",
                "blob": blob,
            }),
        };
        println!("{value}");
        return;
    }
    if cli.quiet {
        return;
    }
    match outcome {
        ConvertOutcome::Converted { missing_packages } if missing_packages.is_empty() => {
            println!("Converted {blob}");
        }
        ConvertOutcome::Converted { missing_packages } => {
            println!(
                "Converted {blob} (missing packages: {})",
                missing_packages.join(", ")
            );
        }
        ConvertOutcome::Superseded => {
            println!("Superseded: a newer upload took over {blob}");
        }
    }
}

fn report_batch(cli: &Cli, results: &[(Payload, BatchOutcome)]) -> Result<()> {
    let mut failed = 0usize;
    for (payload, outcome) in results {
        match outcome {
            BatchOutcome::Done(ConvertOutcome::Converted { .. }) => {
                if !cli.quiet {
                    println!("converted   {payload}");
                }
            }
            BatchOutcome::Done(ConvertOutcome::Superseded) => {
                if !cli.quiet {
                    println!("superseded  {payload}");
                }
            }
            BatchOutcome::SkippedAlreadyTried => {
                if !cli.quiet {
                    println!("skipped     {payload} (already tried)");
                }
            }
            BatchOutcome::Failed(e) => {
                failed += 1;
                eprintln!("failed      {payload}: {e}");
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} conversions failed", results.len());
    }
    Ok(())
}

fn report_publish(cli: &Cli, request: &PublishRequest, outcome: &PublishOutcome) {
    if cli.json {
        let name = match outcome {
            PublishOutcome::Published => "published",
            PublishOutcome::SkippedNoConversion => "skipped_no_conversion",
            PublishOutcome::SkippedAlreadyPublished => "skipped_already_published",
        };
        println!(
            "{}",
            serde_json::json!({ "outcome": name, "paper_idv": request.paper_idv() })
        );
        return;
    }
    if cli.quiet {
        return;
    }
    match outcome {
        PublishOutcome::Published => println!("Published {}", request.paper_idv()),
        PublishOutcome::SkippedNoConversion => println!(
            "Nothing to publish: submission {} has no successful conversion",
            request.submission_id
        ),
        PublishOutcome::SkippedAlreadyPublished => {
            println!("{} was already published", request.paper_idv())
        }
    }
}
