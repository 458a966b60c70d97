//! Conversion orchestration.
//!
//! ## Why the attempt is structured the way it is
//!
//! A conversion attempt is a sequence of steps where *anything* can race
//! with a newer attempt for the same identifier, on this host or another.
//! The orchestrator therefore never assumes it is alone. It fingerprints
//! the source it downloaded, registers the attempt, converts, and then
//! asks the record store whether its result still corresponds to the
//! source currently in flight. Only a winning attempt uploads its output;
//! a superseded one returns [`ConvertOutcome::Superseded`] and discards
//! everything. Failure recording is best-effort: a broken store must never
//! mask the original conversion error.
//!
//! Cleanup runs on every exit path under a short-timeout re-acquisition of
//! the identifier lock, so a stuck cleanup can never wedge future
//! attempts, and cleanup trouble is logged, never escalated.

use crate::checksum::fingerprint_archive;
use crate::config::ConversionConfig;
use crate::error::ConvertError;
use crate::lock::{IdLock, LockWait};
use crate::payload::Payload;
use crate::pipeline::fetch::ObjectStore;
use crate::pipeline::{engine, fetch, source};
use crate::store::ConversionStore;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// The object stores a converter worker talks to, split by payload kind
/// and direction.
#[derive(Clone)]
pub struct ConversionStores {
    /// Source archives for submissions.
    pub sub_sources: Arc<dyn ObjectStore>,
    /// Source archives for announced documents.
    pub doc_sources: Arc<dyn ObjectStore>,
    /// Converted-site archives for submissions.
    pub sub_outputs: Arc<dyn ObjectStore>,
    /// Converted-site archives for announced documents.
    pub doc_outputs: Arc<dyn ObjectStore>,
    /// Converter logs kept for QA, both kinds.
    pub qa_logs: Arc<dyn ObjectStore>,
}

impl ConversionStores {
    fn sources_for(&self, payload: &Payload) -> &Arc<dyn ObjectStore> {
        if payload.is_document() {
            &self.doc_sources
        } else {
            &self.sub_sources
        }
    }

    fn outputs_for(&self, payload: &Payload) -> &Arc<dyn ObjectStore> {
        if payload.is_document() {
            &self.doc_outputs
        } else {
            &self.sub_outputs
        }
    }
}

/// How a completed conversion attempt ended. Both variants are success
/// from the caller's point of view; only errors mean something broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// This attempt won: the record is `success` and the site is uploaded.
    Converted {
        /// Style packages the converter had no binding for, as result
        /// metadata for QA.
        missing_packages: Vec<String>,
    },
    /// A newer attempt took over the identifier while this one ran. The
    /// result was discarded without uploading.
    Superseded,
}

/// One item's result in a batch run.
#[derive(Debug)]
pub enum BatchOutcome {
    Done(ConvertOutcome),
    /// A record already existed for the identifier; with at-least-once
    /// trigger delivery this means "already tried, do not redo".
    SkippedAlreadyTried,
    Failed(ConvertError),
}

/// Converter worker: configuration plus injected collaborators.
#[derive(Clone)]
pub struct Converter {
    config: ConversionConfig,
    record_store: ConversionStore,
    stores: ConversionStores,
}

impl Converter {
    pub fn new(
        config: ConversionConfig,
        record_store: ConversionStore,
        stores: ConversionStores,
    ) -> Self {
        Self {
            config,
            record_store,
            stores,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn record_store(&self) -> &ConversionStore {
        &self.record_store
    }

    /// Convert from a storage-event blob name, e.g. `incoming/1234.tar.gz`.
    pub async fn convert_blob(
        &self,
        blob_name: &str,
        is_document: bool,
    ) -> Result<ConvertOutcome, ConvertError> {
        let payload = Payload::from_blob_name(blob_name, is_document)?;
        self.convert(&payload, blob_name).await
    }

    /// Run one conversion attempt end to end.
    ///
    /// `source_key` names the source archive in the payload's source store.
    /// Holds the identifier lock for the whole attempt, then cleans up the
    /// scratch tree under a short-timeout lock re-acquisition.
    pub async fn convert(
        &self,
        payload: &Payload,
        source_key: &str,
    ) -> Result<ConvertOutcome, ConvertError> {
        let id = payload.name();
        let total_start = Instant::now();
        info!("Starting conversion for {}", payload);

        let result = self.convert_locked(payload, source_key, &id).await;

        match &result {
            Ok(ConvertOutcome::Converted { missing_packages }) => info!(
                "Conversion for {} complete in {}ms ({} missing package(s))",
                payload,
                total_start.elapsed().as_millis(),
                missing_packages.len()
            ),
            Ok(ConvertOutcome::Superseded) => {
                info!("Conversion for {} superseded by a newer attempt", payload)
            }
            Err(e) => warn!("Conversion for {} failed: {}", payload, e),
        }

        self.cleanup(&id).await;
        result
    }

    /// The attempt body, under the indefinitely-blocking identifier lock.
    async fn convert_locked(
        &self,
        payload: &Payload,
        source_key: &str,
        id: &str,
    ) -> Result<ConvertOutcome, ConvertError> {
        let _lock = IdLock::acquire(&self.config.lock_dir, id, LockWait::Indefinite).await?;

        // Once `start` has been written, any error must be recorded as a
        // failure so pollers see a terminal state.
        let mut registered_checksum: Option<String> = None;
        let result = self
            .run_attempt(payload, source_key, id, &mut registered_checksum)
            .await;

        if result.is_err() {
            if let Some(checksum) = registered_checksum {
                // Best-effort: the original error stays primary even when
                // the store refuses or is down.
                if let Err(e) = self
                    .record_store
                    .mark_failure(&payload.key(), &checksum, &self.config.engine_version)
                    .await
                {
                    warn!("Could not record failure for {}: {}", payload, e);
                }
            }
        }
        result
    }

    async fn run_attempt(
        &self,
        payload: &Payload,
        source_key: &str,
        id: &str,
        registered_checksum: &mut Option<String>,
    ) -> Result<ConvertOutcome, ConvertError> {
        let key = payload.key();
        let paths = ScratchPaths::new(&self.config.work_dir, id);

        // ── Step 1: Prepare scratch tree ─────────────────────────────────
        // A stale tree from a crashed attempt is removed wholesale.
        paths.reset()?;

        // ── Step 2: Download and fingerprint the source ──────────────────
        let sources = self.stores.sources_for(payload);
        sources.download(source_key, &paths.archive).await?;
        let checksum = fingerprint_archive(&paths.archive).map_err(|e| ConvertError::WorkDir {
            path: paths.archive.clone(),
            source: e,
        })?;

        // ── Step 3: Register the attempt ─────────────────────────────────
        self.record_store
            .start(&key, &checksum, &self.config.engine_version)
            .await?;
        *registered_checksum = Some(checksum);

        // ── Step 4: Unpack and prepare the source tree ───────────────────
        fetch::unpack_archive(&paths.archive, &paths.src_dir)?;
        source::strip_binding_overrides(&paths.src_dir)?;
        let main = source::find_main_source(&paths.src_dir)?;
        info!("Main source for {} is {}", payload, main.display());

        // ── Step 5: Run the converter, archiving the log either way ──────
        let output = engine::run_converter(&self.config, &main, &paths.site_dir, id).await?;
        self.upload_qa_log(id, &paths, &output.log).await;
        if !output.success {
            return Err(ConvertError::ConverterFailed {
                status: output.status,
                main,
                tail: engine::log_tail(&output.log),
            });
        }

        // ── Step 6: Re-fingerprint the source as it is *now* ─────────────
        // An author re-upload during conversion changes the blob; taking a
        // fresh fingerprint here lets the record-store guard reject this
        // result even before the re-upload's own attempt registers.
        sources.download(source_key, &paths.recheck_archive).await?;
        let latest_checksum =
            fingerprint_archive(&paths.recheck_archive).map_err(|e| ConvertError::WorkDir {
                path: paths.recheck_archive.clone(),
                source: e,
            })?;

        // ── Step 7: Commit, then upload ──────────────────────────────────
        // The record is finalised before the upload so the store never
        // claims success for an artifact that failed to convert; a failed
        // upload after commit surfaces as an error and the next attempt
        // simply re-converts.
        if !self
            .record_store
            .mark_success(&key, &latest_checksum, &self.config.engine_version)
            .await?
        {
            return Ok(ConvertOutcome::Superseded);
        }

        fetch::pack_dir(&paths.site_container, &paths.out_archive)?;
        self.stores
            .outputs_for(payload)
            .upload(&format!("{id}.tar.gz"), &paths.out_archive)
            .await?;

        Ok(ConvertOutcome::Converted {
            missing_packages: output.missing_packages,
        })
    }

    /// Write the converter log to scratch and upload it for QA. Log-only
    /// on failure; a lost QA log must not fail a conversion.
    async fn upload_qa_log(&self, id: &str, paths: &ScratchPaths, log: &str) {
        let log_path = paths.root.join(format!("{id}_stdout.txt"));
        if let Err(e) = std::fs::write(&log_path, log) {
            warn!("Could not write QA log for '{}': {}", id, e);
            return;
        }
        if let Err(e) = self
            .stores
            .qa_logs
            .upload(&format!("{id}_stdout.txt"), &log_path)
            .await
        {
            warn!("Could not upload QA log for '{}': {}", id, e);
        }
    }

    /// Remove the identifier's scratch tree under a short-timeout lock.
    /// Never escalates; a lost cleanup race or missing tree is just logged.
    async fn cleanup(&self, id: &str) {
        let lock = IdLock::acquire(
            &self.config.lock_dir,
            id,
            LockWait::Timeout(self.config.cleanup_lock_timeout()),
        )
        .await;
        match lock {
            Ok(_lock) => {
                let root = ScratchPaths::new(&self.config.work_dir, id).root;
                if let Err(e) = std::fs::remove_dir_all(&root) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Could not clean up scratch for '{}': {}", id, e);
                    }
                }
            }
            Err(e) => warn!("Skipping cleanup for '{}': {}", id, e),
        }
    }

    /// Convert a batch of payloads with bounded concurrency.
    ///
    /// Batch triggers are delivered at least once and whole batches can be
    /// redelivered, so every item is first checked against the record
    /// store: any existing record, whatever its status, means the item was
    /// already tried and is skipped.
    pub async fn convert_batch(&self, items: Vec<(Payload, String)>) -> Vec<(Payload, BatchOutcome)> {
        stream::iter(items.into_iter().map(|(payload, source_key)| async move {
            let outcome = match self.record_store.has_any_row(&payload.key()).await {
                Ok(true) => {
                    info!("Skipping {}: already tried", payload);
                    BatchOutcome::SkippedAlreadyTried
                }
                Ok(false) => match self.convert(&payload, &source_key).await {
                    Ok(o) => BatchOutcome::Done(o),
                    Err(e) => BatchOutcome::Failed(e),
                },
                Err(e) => BatchOutcome::Failed(e.into()),
            };
            (payload, outcome)
        }))
        .buffer_unordered(self.config.batch_concurrency)
        .collect()
        .await
    }
}

/// Parse a list of blob names into batch items, discarding malformed names
/// with a log line so one stray object never poisons a batch.
pub fn payloads_from_blobs(blob_names: &[String], is_document: bool) -> Vec<(Payload, String)> {
    blob_names
        .iter()
        .filter_map(|name| match Payload::from_blob_name(name, is_document) {
            Ok(payload) => Some((payload, name.clone())),
            Err(e) => {
                warn!("Discarding blob '{}': {}", name, e);
                None
            }
        })
        .collect()
}

/// Scratch-tree layout for one identifier, all under `work_dir/{id}`.
struct ScratchPaths {
    root: PathBuf,
    /// Downloaded source archive.
    archive: PathBuf,
    /// Fresh copy downloaded for the pre-commit fingerprint.
    recheck_archive: PathBuf,
    /// Extracted source tree.
    src_dir: PathBuf,
    /// Directory whose *contents* get packed and uploaded.
    site_container: PathBuf,
    /// `{site_container}/{id}`, the top-level directory of the site.
    site_dir: PathBuf,
    /// Packed output archive.
    out_archive: PathBuf,
}

impl ScratchPaths {
    fn new(work_dir: &std::path::Path, id: &str) -> Self {
        let root = work_dir.join(id);
        let site_container = root.join("html");
        Self {
            archive: root.join("source.tar.gz"),
            recheck_archive: root.join("source-recheck.tar.gz"),
            src_dir: root.join("extracted"),
            site_dir: site_container.join(id),
            out_archive: root.join(format!("{id}.tar.gz")),
            site_container,
            root,
        }
    }

    /// Wipe any stale tree and create the directories the attempt needs.
    fn reset(&self) -> Result<(), ConvertError> {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(ConvertError::WorkDir {
                    path: self.root.clone(),
                    source: e,
                });
            }
        }
        for dir in [&self.src_dir, &self.site_dir] {
            std::fs::create_dir_all(dir).map_err(|e| ConvertError::WorkDir {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}
