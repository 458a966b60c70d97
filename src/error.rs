//! Error types for the tex2html library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`] — **Fatal for the attempt**: the current conversion or
//!   publish cannot proceed (source missing, converter crashed, store
//!   unreachable after retries). Returned as `Err(ConvertError)` from the
//!   orchestrator entry points, and recorded as `failure` in the record
//!   store on a best-effort basis.
//!
//! * [`StoreError`] — the record store's own error kind. `Unavailable` is
//!   connectivity trouble that the store already retried internally;
//!   `RecordNotFound` is a programming error (finalising a record that was
//!   never started). Both convert into [`ConvertError`] at the orchestrator
//!   boundary via `From`.
//!
//! Two outcomes that look like errors are deliberately *not* errors:
//! a superseded attempt (a newer `start` overwrote the row, so this
//! attempt's result is discarded) and a publish with nothing to publish.
//! Those are expected, frequent results of the race-tolerant design and are
//! expressed as enum variants of [`crate::convert::ConvertOutcome`] and
//! [`crate::publish::PublishOutcome`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the tex2html library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input / object-store errors ───────────────────────────────────────
    /// The source archive could not be fetched from its store.
    #[error("Failed to download '{key}': {reason}")]
    DownloadFailed { key: String, reason: String },

    /// The produced artifact could not be written back to its store.
    #[error("Failed to upload '{key}': {reason}")]
    UploadFailed { key: String, reason: String },

    /// The blob name did not match the `<dir>/<id>.tar.gz` trigger shape.
    #[error("Blob name '{name}' is not a recognised source archive")]
    UnrecognisedBlob { name: String },

    /// Extracting the .tar.gz source archive failed.
    #[error("Failed to extract archive '{path}': {source}")]
    ArchiveExtract {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Source-tree errors ────────────────────────────────────────────────
    /// No .tex file with a document declaration was found.
    #[error("No main .tex source found in '{dir}'")]
    MainSourceNotFound { dir: PathBuf },

    /// Stripping converter-binding override files from the tree failed.
    #[error("Failed to strip binding override '{path}': {source}")]
    BindingStripFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Converter errors ──────────────────────────────────────────────────
    /// The external converter exited non-zero.
    #[error("Converter exited with {status} for '{main}'\nLast output:\n{tail}")]
    ConverterFailed {
        status: String,
        main: PathBuf,
        tail: String,
    },

    /// The external converter exceeded its wall-clock budget and was killed.
    #[error("Converter timed out after {secs}s for '{main}'")]
    ConverterTimeout { main: PathBuf, secs: u64 },

    /// The converter could not be spawned at all (missing binary etc.).
    #[error("Failed to spawn converter '{bin}': {source}")]
    ConverterSpawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Lock errors ───────────────────────────────────────────────────────
    /// A timed lock acquisition did not succeed within its budget.
    ///
    /// Only reachable when a non-default timeout is configured (the cleanup
    /// phase). The main conversion path blocks indefinitely instead.
    #[error("Could not lock identifier '{id}' within {secs}s")]
    LockTimeout { id: String, secs: u64 },

    /// The lock directory could not be created or written.
    #[error("Lock directory '{dir}' unusable: {source}")]
    LockDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Store errors ──────────────────────────────────────────────────────
    /// Record-store failure, already retried inside the store.
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── I/O and config ────────────────────────────────────────────────────
    /// Local filesystem trouble in the working directory.
    #[error("Working directory I/O failed at '{path}': {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors surfaced by the conversion record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database stayed unreachable after the retry budget was spent.
    ///
    /// The caller treats this as the whole attempt failing; there is no
    /// point retrying again at the orchestrator level.
    #[error("Record store unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// `mark_success`/`mark_failure` was called for a key that was never
    /// started. Success without a prior start is a programming error, so
    /// this is loud rather than a silent no-op.
    #[error("No conversion record for '{key}'")]
    RecordNotFound { key: String },
}
