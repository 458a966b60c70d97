//! Configuration types for the conversion worker.
//!
//! All worker behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. Keeping every knob in one struct
//! makes it trivial to share configs across tasks, serialise them for
//! logging, and diff two runs to understand why their outcomes differ.
//!
//! # Design choice: builder over constructor
//! A dozen-field constructor is unreadable and breaks on every new field.
//! The builder pattern lets callers set only what they care about and rely
//! on well-documented defaults for the rest.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for conversion and publish orchestration.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use tex2html::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .engine_version("latexml-0.8.8-a1b2c3")
///     .converter_timeout_secs(600)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Tag identifying the converter build in use. Default: `"dev"`.
    ///
    /// Written into every conversion record and compared on finalisation.
    /// Bumping it when the converter is upgraded invalidates results
    /// produced by the old build: their `mark_success` guard no longer
    /// matches, so a re-conversion with the new build always supersedes.
    pub engine_version: String,

    /// Path to the external converter binary. Default: `latexmlc`.
    pub converter_bin: PathBuf,

    /// Wall-clock budget for one converter run in seconds. Default: 300.
    ///
    /// Pathological sources can keep the converter macro-expanding for
    /// hours. On expiry the subprocess is killed and the attempt is
    /// recorded as a failure.
    pub converter_timeout_secs: u64,

    /// Extra binding search paths passed to the converter. Default: none.
    ///
    /// Deployments mount curated binding collections and list them here;
    /// author-supplied overrides inside the source tree are stripped before
    /// conversion regardless.
    pub style_paths: Vec<PathBuf>,

    /// Base URL for CSS/JS assets linked into the produced HTML.
    ///
    /// When `None`, no asset links are passed to the converter. The
    /// converter itself decides how to embed them; this config only feeds
    /// the argument template.
    pub asset_base_url: Option<String>,

    /// Root of the local scratch area. Default: `work`.
    ///
    /// One subdirectory per identifier, exclusive to the holder of that
    /// identifier's lock. Removed on cleanup; a stale tree left by a
    /// crashed attempt is removed and recreated by the next attempt.
    pub work_dir: PathBuf,

    /// Directory holding per-identifier lock files. Default: `locks`.
    ///
    /// The lock is host-local coordination only. Two hosts converting the
    /// same identifier are serialised by the record store's checksum and
    /// engine-version guard, not by this directory.
    pub lock_dir: PathBuf,

    /// Lock budget for the cleanup phase in seconds. Default: 1.
    ///
    /// Cleanup re-acquires the identifier lock with this short timeout so
    /// a stuck cleanup can never deadlock a future attempt indefinitely.
    /// Cleanup that loses the race is logged and skipped, never escalated.
    pub cleanup_lock_timeout_secs: u64,

    /// Retry budget for each record-store operation. Default: 5.
    pub store_retry_attempts: u32,

    /// Fixed delay between record-store retries in milliseconds. Default: 3000.
    ///
    /// Fixed rather than exponential: store outages here are either a blip
    /// (first retry wins) or a real outage (no backoff schedule saves the
    /// attempt), and a fixed delay keeps the worst-case attempt duration
    /// predictable for the worker pool.
    pub store_retry_delay_ms: u64,

    /// Number of concurrent conversions in batch mode. Default: 4.
    ///
    /// Conversions are subprocess-bound, so this effectively caps the
    /// number of live converter processes on this host.
    pub batch_concurrency: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            engine_version: "dev".to_string(),
            converter_bin: PathBuf::from("latexmlc"),
            converter_timeout_secs: 300,
            style_paths: Vec::new(),
            asset_base_url: None,
            work_dir: PathBuf::from("work"),
            lock_dir: PathBuf::from("locks"),
            cleanup_lock_timeout_secs: 1,
            store_retry_attempts: 5,
            store_retry_delay_ms: 3000,
            batch_concurrency: 4,
        }
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Converter wall-clock budget as a [`Duration`].
    pub fn converter_timeout(&self) -> Duration {
        Duration::from_secs(self.converter_timeout_secs)
    }

    /// Cleanup-phase lock budget as a [`Duration`].
    pub fn cleanup_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_lock_timeout_secs)
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn engine_version(mut self, tag: impl Into<String>) -> Self {
        self.config.engine_version = tag.into();
        self
    }

    pub fn converter_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.config.converter_bin = bin.into();
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter_timeout_secs = secs.max(1);
        self
    }

    /// Append one binding search path.
    pub fn style_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.style_paths.push(path.into());
        self
    }

    pub fn asset_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.asset_base_url = Some(url.into());
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.lock_dir = dir.into();
        self
    }

    pub fn cleanup_lock_timeout_secs(mut self, secs: u64) -> Self {
        self.config.cleanup_lock_timeout_secs = secs;
        self
    }

    pub fn store_retry_attempts(mut self, n: u32) -> Self {
        self.config.store_retry_attempts = n.max(1);
        self
    }

    pub fn store_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.store_retry_delay_ms = ms;
        self
    }

    pub fn batch_concurrency(mut self, n: usize) -> Self {
        self.config.batch_concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.engine_version.trim().is_empty() {
            return Err(ConvertError::InvalidConfig(
                "engine_version must not be empty".into(),
            ));
        }
        if c.converter_bin.as_os_str().is_empty() {
            return Err(ConvertError::InvalidConfig(
                "converter_bin must not be empty".into(),
            ));
        }
        if c.work_dir == c.lock_dir {
            return Err(ConvertError::InvalidConfig(
                "work_dir and lock_dir must differ".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = ConversionConfig::builder().build().unwrap();
        assert_eq!(config.converter_timeout_secs, 300);
        assert_eq!(config.store_retry_attempts, 5);
        assert_eq!(config.cleanup_lock_timeout_secs, 1);
    }

    #[test]
    fn empty_engine_version_rejected() {
        let result = ConversionConfig::builder().engine_version("  ").build();
        assert!(matches!(result, Err(ConvertError::InvalidConfig(_))));
    }

    #[test]
    fn shared_work_and_lock_dir_rejected() {
        let result = ConversionConfig::builder()
            .work_dir("scratch")
            .lock_dir("scratch")
            .build();
        assert!(matches!(result, Err(ConvertError::InvalidConfig(_))));
    }

    #[test]
    fn timeout_clamped_to_at_least_one_second() {
        let config = ConversionConfig::builder()
            .converter_timeout_secs(0)
            .build()
            .unwrap();
        assert_eq!(config.converter_timeout_secs, 1);
    }
}
