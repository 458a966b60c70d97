//! Publish orchestration: promote a converted submission to its permanent
//! document identity.
//!
//! When a submission is announced it stops being "submission 1234" and
//! becomes "2301.00001v2" forever. Publishing takes the already-converted
//! site out of the submission output store, renames everything to the
//! permanent identity, rewrites the artifact metadata, records the
//! document row, and moves the archive to the document output store.
//!
//! Publish never converts. A submission without a successful conversion
//! record yields [`PublishOutcome::SkippedNoConversion`]; announce-time
//! triggers are delivered at least once, so a repeat publish yields
//! [`PublishOutcome::SkippedAlreadyPublished`]. Both are quiet no-ops by
//! design, not errors.

use crate::config::ConversionConfig;
use crate::convert::ConversionStores;
use crate::error::ConvertError;
use crate::pipeline::fetch;
use crate::store::{ConversionStatus, ConversionStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One announce event: which submission became which document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub submission_id: i64,
    pub paper_id: String,
    pub version: i64,
    /// Canonical license URL from the announce metadata, if any.
    pub license_url: Option<String>,
    /// Primary category, e.g. `"cs.LG"`.
    pub category: Option<String>,
    /// Submission date in whatever form the announce pipeline provides.
    pub submitted_at: Option<String>,
}

impl PublishRequest {
    /// The permanent identifier, e.g. `"2301.00001v2"`.
    pub fn paper_idv(&self) -> String {
        format!("{}v{}", self.paper_id, self.version)
    }
}

/// How a publish call ended. All three variants are normal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The document record was written and the site moved.
    Published,
    /// The submission has no successful conversion record; there is
    /// nothing to promote.
    SkippedNoConversion,
    /// A document record already exists for this (paper id, version); a
    /// redelivered trigger. Nothing was moved.
    SkippedAlreadyPublished,
}

/// Publish worker: configuration plus injected collaborators.
#[derive(Clone)]
pub struct Publisher {
    config: ConversionConfig,
    record_store: ConversionStore,
    stores: ConversionStores,
}

impl Publisher {
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

    /// Promote one announced submission. Idempotent end to end.
    pub async fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, ConvertError> {
        let paper_idv = request.paper_idv();
        info!(
            "Publishing submission {} as {}",
            request.submission_id, paper_idv
        );

        let result = self.publish_inner(request, &paper_idv).await;

        // Scratch removal is log-only on every exit path.
        let scratch = self.scratch_dir(&paper_idv);
        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not clean up publish scratch for {}: {}", paper_idv, e);
            }
        }

        match &result {
            Ok(PublishOutcome::Published) => info!("Published {}", paper_idv),
            Ok(PublishOutcome::SkippedNoConversion) => info!(
                "No successful conversion for submission {}, nothing to publish",
                request.submission_id
            ),
            Ok(PublishOutcome::SkippedAlreadyPublished) => {
                info!("{} already published, skipping", paper_idv)
            }
            Err(e) => warn!("Publish of {} failed: {}", paper_idv, e),
        }
        result
    }

    async fn publish_inner(
        &self,
        request: &PublishRequest,
        paper_idv: &str,
    ) -> Result<PublishOutcome, ConvertError> {
        // ── Step 1: Eligibility ──────────────────────────────────────────
        // A redelivered trigger is checked before any store traffic: the
        // first delivery deleted the submission-side archive, so getting
        // this far twice would otherwise fail on the download.
        let doc_key = crate::payload::RecordKey::Document {
            paper_id: request.paper_id.clone(),
            version: request.version,
        };
        if self.record_store.has_any_row(&doc_key).await? {
            return Ok(PublishOutcome::SkippedAlreadyPublished);
        }

        let key = crate::payload::RecordKey::Submission(request.submission_id);
        let record = match self.record_store.fetch(&key).await? {
            Some(r) if r.status == ConversionStatus::Success => r,
            _ => return Ok(PublishOutcome::SkippedNoConversion),
        };

        // ── Step 2: Fetch and unpack the converted site ──────────────────
        let scratch = self.scratch_dir(paper_idv);
        std::fs::create_dir_all(&scratch).map_err(|e| ConvertError::WorkDir {
            path: scratch.clone(),
            source: e,
        })?;
        let sub_key = format!("{}.tar.gz", request.submission_id);
        let archive = scratch.join("sub.tar.gz");
        self.stores.sub_outputs.download(&sub_key, &archive).await?;
        let site_root = scratch.join("site");
        fetch::unpack_archive(&archive, &site_root)?;

        // ── Step 3: Rename to the permanent identity ─────────────────────
        let doc_dir = rename_site(&site_root, request.submission_id, paper_idv)?;

        // ── Step 4: Rewrite artifact metadata ────────────────────────────
        rewrite_metadata(&doc_dir, request)?;

        // ── Step 5: Record the document, then move the archive ───────────
        // The record is the idempotency gate: if the insert is a no-op the
        // document store already has (or is about to get) the site from
        // the first delivery, and nothing here may be touched again.
        if !self
            .record_store
            .publish_document(&request.paper_id, request.version, &record)
            .await?
        {
            return Ok(PublishOutcome::SkippedAlreadyPublished);
        }

        let out_archive = scratch.join(format!("{paper_idv}.tar.gz"));
        fetch::pack_dir(&site_root, &out_archive)?;
        self.stores
            .doc_outputs
            .upload(&format!("{paper_idv}.tar.gz"), &out_archive)
            .await?;

        // ── Step 6: Drop the submission-side copy ────────────────────────
        self.stores.sub_outputs.delete(&sub_key).await?;

        Ok(PublishOutcome::Published)
    }

    fn scratch_dir(&self, paper_idv: &str) -> PathBuf {
        self.config.work_dir.join(format!("publish-{paper_idv}"))
    }
}

/// Rename the site's top-level directory and entry HTML file from the
/// submission id to the permanent identifier. Returns the renamed
/// directory.
fn rename_site(
    site_root: &Path,
    submission_id: i64,
    paper_idv: &str,
) -> Result<PathBuf, ConvertError> {
    let workdir_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e: std::io::Error| ConvertError::WorkDir { path, source: e }
    };

    let sub_dir = site_root.join(submission_id.to_string());
    let doc_dir = site_root.join(paper_idv);
    std::fs::rename(&sub_dir, &doc_dir).map_err(workdir_err(&sub_dir))?;

    let sub_html = doc_dir.join(format!("{submission_id}.html"));
    let doc_html = doc_dir.join(format!("{paper_idv}.html"));
    std::fs::rename(&sub_html, &doc_html).map_err(workdir_err(&sub_html))?;

    Ok(doc_dir)
}

/// Create or update `metadata.json` inside the renamed site directory with
/// the document's announce-time facts.
fn rewrite_metadata(doc_dir: &Path, request: &PublishRequest) -> Result<(), ConvertError> {
    let path = doc_dir.join("metadata.json");
    let workdir_err = |e: std::io::Error| ConvertError::WorkDir {
        path: path.clone(),
        source: e,
    };

    let mut meta: serde_json::Map<String, serde_json::Value> = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => Default::default(),
    };
    meta.insert("paper_id".into(), request.paper_id.clone().into());
    meta.insert("version".into(), request.version.into());
    meta.insert(
        "license".into(),
        license_display(request.license_url.as_deref()).into(),
    );
    if let Some(category) = &request.category {
        meta.insert("category".into(), category.clone().into());
    }
    if let Some(submitted_at) = &request.submitted_at {
        meta.insert("submitted_at".into(), submitted_at.clone().into());
    }

    let rendered =
        serde_json::to_vec_pretty(&meta).map_err(|e| ConvertError::WorkDir {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
    std::fs::write(&path, rendered).map_err(workdir_err)
}

static RE_CC_BY_NC_SA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^http://creativecommons\.org/licenses/by-nc-sa/(\d)\.0/$").unwrap());
static RE_CC_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^http://creativecommons\.org/licenses/by/(\d)\.0/$").unwrap());

/// Map a canonical license URL to its display string.
pub fn license_display(url: Option<&str>) -> String {
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return "No License".to_string();
    };
    let name = match url {
        "http://arxiv.org/licenses/nonexclusive-distrib/1.0/" => Some("arXiv License".to_string()),
        "http://creativecommons.org/licenses/by-nc-nd/4.0/" => Some("CC BY-NC-ND".to_string()),
        "http://creativecommons.org/licenses/by-sa/4.0/" => Some("CC BY-SA".to_string()),
        "http://creativecommons.org/publicdomain/zero/1.0/"
        | "http://creativecommons.org/licenses/publicdomain/" => Some("CC Zero".to_string()),
        other => RE_CC_BY_NC_SA
            .captures(other)
            .map(|c| format!("CC BY-NC-SA {}", &c[1]))
            .or_else(|| RE_CC_BY.captures(other).map(|c| format!("CC BY {}", &c[1]))),
    };
    match name {
        Some(name) => format!("License: {name}"),
        None => "No License".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn license_urls_map_to_display_strings() {
        assert_eq!(license_display(None), "No License");
        assert_eq!(license_display(Some("")), "No License");
        assert_eq!(
            license_display(Some("http://arxiv.org/licenses/nonexclusive-distrib/1.0/")),
            "License: arXiv License"
        );
        assert_eq!(
            license_display(Some("http://creativecommons.org/licenses/by-nc-nd/4.0/")),
            "License: CC BY-NC-ND"
        );
        assert_eq!(
            license_display(Some("http://creativecommons.org/publicdomain/zero/1.0/")),
            "License: CC Zero"
        );
        assert_eq!(
            license_display(Some("http://creativecommons.org/licenses/by-nc-sa/4.0/")),
            "License: CC BY-NC-SA 4"
        );
        assert_eq!(
            license_display(Some("http://creativecommons.org/licenses/by/3.0/")),
            "License: CC BY 3"
        );
        assert_eq!(
            license_display(Some("http://example.com/whatever")),
            "No License"
        );
    }

    #[test]
    fn paper_idv_formats() {
        let request = PublishRequest {
            submission_id: 1234,
            paper_id: "2301.00001".into(),
            version: 2,
            license_url: None,
            category: None,
            submitted_at: None,
        };
        assert_eq!(request.paper_idv(), "2301.00001v2");
    }

    #[test]
    fn rename_site_moves_directory_and_entry_html() {
        let scratch = tempfile::tempdir().unwrap();
        let site = scratch.path().join("site");
        std::fs::create_dir_all(site.join("1234")).unwrap();
        std::fs::write(site.join("1234/1234.html"), b"<html/>").unwrap();
        std::fs::write(site.join("1234/fig.svg"), b"<svg/>").unwrap();

        let doc_dir = rename_site(&site, 1234, "2301.00001v2").unwrap();
        assert_eq!(doc_dir, site.join("2301.00001v2"));
        assert!(doc_dir.join("2301.00001v2.html").exists());
        assert!(doc_dir.join("fig.svg").exists());
        assert!(!site.join("1234").exists());
    }

    #[test]
    fn metadata_rewrite_merges_with_existing() {
        let scratch = tempfile::tempdir().unwrap();
        let doc_dir = scratch.path().join("2301.00001v1");
        std::fs::create_dir_all(&doc_dir).unwrap();
        std::fs::write(
            doc_dir.join("metadata.json"),
            br#"{"generator":"latexml","paper_id":"stale"}"#,
        )
        .unwrap();

        let request = PublishRequest {
            submission_id: 1,
            paper_id: "2301.00001".into(),
            version: 1,
            license_url: Some("http://creativecommons.org/licenses/by-sa/4.0/".into()),
            category: Some("cs.LG".into()),
            submitted_at: Some("2023-01-02".into()),
        };
        rewrite_metadata(&doc_dir, &request).unwrap();

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(doc_dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["generator"], "latexml");
        assert_eq!(meta["paper_id"], "2301.00001");
        assert_eq!(meta["version"], 1);
        assert_eq!(meta["license"], "License: CC BY-SA");
        assert_eq!(meta["category"], "cs.LG");
    }
}
