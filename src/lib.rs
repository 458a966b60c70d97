//! # tex2html
//!
//! State tracking and orchestration for LaTeX-to-HTML conversion of
//! scholarly papers.
//!
//! ## Why this crate?
//!
//! The LaTeX-to-HTML transformation itself is an external converter
//! subprocess. Everything hard about running it at scale is state: authors
//! re-upload sources mid-conversion, triggers are delivered at least once,
//! workers crash, and announce events promote submissions to permanent
//! document identities. This crate owns that state. It tracks every
//! attempt in a record store, fingerprints sources so stale results can
//! never overwrite newer ones, and makes conversion and publish idempotent
//! end to end.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source .tar.gz
//!  │
//!  ├─ 1. Lock      per-identifier file lock (host-local)
//!  ├─ 2. Fetch     download source, fingerprint decompressed content
//!  ├─ 3. Register  record the attempt (upsert, supersedes older attempts)
//!  ├─ 4. Prepare   unpack, strip binding overrides, find main .tex
//!  ├─ 5. Convert   external converter under a wall-clock budget
//!  ├─ 6. Commit    guarded success write; stale attempts discarded here
//!  └─ 7. Upload    pack the site and store it (winners only)
//! ```
//!
//! Publishing ([`publish::Publisher`]) promotes a converted submission to
//! its announced identity: rename, metadata rewrite, idempotent document
//! record, move between output stores.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tex2html::{ConversionConfig, ConversionStore, ConversionStores, Converter, RetryPolicy};
//! use tex2html::pipeline::fetch::FsObjectStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .engine_version("latexml-0.8.8")
//!         .build()?;
//!     let retry = RetryPolicy::new(
//!         config.store_retry_attempts,
//!         std::time::Duration::from_millis(config.store_retry_delay_ms),
//!     );
//!     let records = ConversionStore::open("records.db", retry).await?;
//!     let bucket = |dir: &str| -> Arc<dyn tex2html::pipeline::fetch::ObjectStore> {
//!         Arc::new(FsObjectStore::new(dir))
//!     };
//!     let converter = Converter::new(
//!         config,
//!         records,
//!         ConversionStores {
//!             sub_sources: bucket("buckets/sub-src"),
//!             doc_sources: bucket("buckets/doc-src"),
//!             sub_outputs: bucket("buckets/sub-out"),
//!             doc_outputs: bucket("buckets/doc-out"),
//!             qa_logs: bucket("buckets/qa"),
//!         },
//!     );
//!     let outcome = converter.convert_blob("incoming/1234.tar.gz", false).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `tex2html` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only
//! deps:
//! ```toml
//! tex2html = { version = "0.4", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checksum;
pub mod config;
pub mod convert;
pub mod error;
pub mod lock;
pub mod payload;
pub mod pipeline;
pub mod publish;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{BatchOutcome, ConvertOutcome, ConversionStores, Converter};
pub use error::{ConvertError, StoreError};
pub use lock::{IdLock, LockWait};
pub use payload::{Payload, RecordKey};
pub use publish::{PublishOutcome, PublishRequest, Publisher};
pub use store::{ConversionRecord, ConversionStatus, ConversionStore, RetryPolicy};
