//! End-to-end orchestration tests.
//!
//! These run the full conversion and publish flows against directory-backed
//! object stores, a real SQLite record database in a tempdir, and a stub
//! shell script standing in for the external converter. No network, no real
//! converter install.
//!
//! Unix-only: the stub converter is a shell script.
#![cfg(unix)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tex2html::pipeline::fetch::{unpack_archive, FsObjectStore, ObjectStore};
use tex2html::{
    ConversionConfig, ConversionStatus, ConversionStore, ConversionStores, ConvertError,
    ConvertOutcome, Converter, Payload, PublishOutcome, PublishRequest, Publisher, RecordKey,
    RetryPolicy,
};

// ── Test helpers ─────────────────────────────────────────────────────────

/// A converter stub that writes a small HTML file to the `--dest=` path.
const CONVERTER_OK: &str = r#"#!/bin/sh
dest=""
for a in "$@"; do
  case "$a" in
    --dest=*) dest="${a#--dest=}" ;;
  esac
done
echo "<html><body>converted</body></html>" > "$dest"
echo "conversion log line"
"#;

/// A converter stub that fails after logging a missing-package warning.
const CONVERTER_FAIL: &str = r#"#!/bin/sh
echo "Warning:missing_file:tikz-feynman Can't find package tikz-feynman at main.tex; line 2"
echo "Fatal error, giving up" >&2
exit 1
"#;

struct Harness {
    converter: Converter,
    publisher: Publisher,
    records: ConversionStore,
    root: tempfile::TempDir,
}

impl Harness {
    fn bucket(&self, name: &str) -> PathBuf {
        self.root.path().join("buckets").join(name)
    }

    /// Seed a source archive containing the given files into a source
    /// bucket under `key`.
    fn seed_source(&self, bucket: &str, key: &str, files: &[(&str, &str)]) {
        let path = self.bucket(bucket).join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, archive_bytes(files)).unwrap();
    }
}

fn write_stub(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub-converter.sh");
    std::fs::write(&path, script).unwrap();
    let mut perm = std::fs::metadata(&path).unwrap().permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(&path, perm).unwrap();
    path
}

fn archive_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn fs_stores(root: &Path) -> ConversionStores {
    let bucket = |name: &str| -> Arc<dyn ObjectStore> {
        Arc::new(FsObjectStore::new(root.join("buckets").join(name)))
    };
    ConversionStores {
        sub_sources: bucket("sub-src"),
        doc_sources: bucket("doc-src"),
        sub_outputs: bucket("sub-out"),
        doc_outputs: bucket("doc-out"),
        qa_logs: bucket("qa"),
    }
}

fn test_config(root: &Path, converter_bin: &Path) -> ConversionConfig {
    ConversionConfig::builder()
        .engine_version("test-engine")
        .converter_bin(converter_bin)
        .converter_timeout_secs(30)
        .work_dir(root.join("work"))
        .lock_dir(root.join("locks"))
        .store_retry_attempts(2)
        .store_retry_delay_ms(1)
        .batch_concurrency(2)
        .build()
        .unwrap()
}

async fn harness_with(script: &str) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let bin = write_stub(root.path(), script);
    let config = test_config(root.path(), &bin);
    let records = ConversionStore::open(
        root.path().join("records.db"),
        RetryPolicy::new(2, Duration::from_millis(1)),
    )
    .await
    .unwrap();
    let stores = fs_stores(root.path());
    Harness {
        converter: Converter::new(config.clone(), records.clone(), stores.clone()),
        publisher: Publisher::new(config, records.clone(), stores),
        records,
        root,
    }
}

async fn harness() -> Harness {
    harness_with(CONVERTER_OK).await
}

const MAIN_TEX: &str = "\\documentclass{article}\\begin{document}x\\end{document}";

// ── Conversion ───────────────────────────────────────────────────────────

#[tokio::test]
async fn submission_converts_end_to_end() {
    let h = harness().await;
    h.seed_source(
        "sub-src",
        "42.tar.gz",
        &[("main.tex", MAIN_TEX), ("custom.sty.ltxml", "override")],
    );

    let outcome = h.converter.convert_blob("42.tar.gz", false).await.unwrap();
    assert_eq!(
        outcome,
        ConvertOutcome::Converted {
            missing_packages: vec![]
        }
    );

    // Record reached success with timestamps in order.
    let record = h
        .records
        .fetch(&RecordKey::Submission(42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConversionStatus::Success);
    assert_eq!(record.engine_version, "test-engine");
    assert!(record.end_time.unwrap() >= record.start_time);

    // Output archive holds the site under the identifier directory.
    let out = h.bucket("sub-out").join("42.tar.gz");
    assert!(out.exists());
    let unpacked = h.root.path().join("check");
    unpack_archive(&out, &unpacked).unwrap();
    let html = std::fs::read_to_string(unpacked.join("42/42.html")).unwrap();
    assert!(html.contains("converted"));

    // QA log archived, scratch tree cleaned.
    assert!(h.bucket("qa").join("42_stdout.txt").exists());
    assert!(!h.root.path().join("work/42").exists());
}

#[tokio::test]
async fn document_payload_uses_document_stores() {
    let h = harness().await;
    h.seed_source("doc-src", "2301.00001v2.tar.gz", &[("main.tex", MAIN_TEX)]);

    let outcome = h
        .converter
        .convert_blob("2301.00001v2.tar.gz", true)
        .await
        .unwrap();
    assert!(matches!(outcome, ConvertOutcome::Converted { .. }));

    assert!(h.bucket("doc-out").join("2301.00001v2.tar.gz").exists());
    let record = h
        .records
        .fetch(&RecordKey::Document {
            paper_id: "2301.00001".into(),
            version: 2,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConversionStatus::Success);
}

#[tokio::test]
async fn converter_failure_records_failure_and_keeps_qa_log() {
    let h = harness_with(CONVERTER_FAIL).await;
    h.seed_source("sub-src", "7.tar.gz", &[("main.tex", MAIN_TEX)]);

    let result = h.converter.convert_blob("7.tar.gz", false).await;
    assert!(matches!(result, Err(ConvertError::ConverterFailed { .. })));

    let record = h
        .records
        .fetch(&RecordKey::Submission(7))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConversionStatus::Failure);
    assert!(record.end_time.is_some());

    // The log made it out even though conversion failed.
    let log = std::fs::read_to_string(h.bucket("qa").join("7_stdout.txt")).unwrap();
    assert!(log.contains("missing_file"));
    // And nothing was uploaded to the output store.
    assert!(!h.bucket("sub-out").join("7.tar.gz").exists());
}

#[tokio::test]
async fn missing_packages_surface_in_outcome() {
    // Succeeds but logs a missing-package warning first.
    let script = "#!/bin/sh\n\
        for a in \"$@\"; do case \"$a\" in --dest=*) dest=\"${a#--dest=}\" ;; esac; done\n\
        echo \"Warning:missing_file:fontawesome Can't find package fontawesome at main.tex; line 3\"\n\
        echo '<html/>' > \"$dest\"\n";
    let h = harness_with(script).await;
    h.seed_source("sub-src", "9.tar.gz", &[("main.tex", MAIN_TEX)]);

    let outcome = h.converter.convert_blob("9.tar.gz", false).await.unwrap();
    assert_eq!(
        outcome,
        ConvertOutcome::Converted {
            missing_packages: vec!["fontawesome".to_string()]
        }
    );
}

#[tokio::test]
async fn unconvertible_source_is_a_main_source_error() {
    let h = harness().await;
    h.seed_source(
        "sub-src",
        "8.tar.gz",
        &[("notes.tex", "% include"), ("more.tex", "% include")],
    );

    let result = h.converter.convert_blob("8.tar.gz", false).await;
    assert!(matches!(
        result,
        Err(ConvertError::MainSourceNotFound { .. })
    ));
    let record = h
        .records
        .fetch(&RecordKey::Submission(8))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConversionStatus::Failure);
}

// ── Supersede race ───────────────────────────────────────────────────────

/// Wraps a store and swaps the source blob for different content right
/// after the first download, imitating an author re-upload while the
/// conversion is running.
struct ReuploadingStore {
    inner: FsObjectStore,
    blob_path: PathBuf,
    replacement: Vec<u8>,
    downloads: AtomicUsize,
}

#[async_trait]
impl ObjectStore for ReuploadingStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<(), ConvertError> {
        self.inner.download(key, dest).await?;
        if self.downloads.fetch_add(1, Ordering::SeqCst) == 0 {
            std::fs::write(&self.blob_path, &self.replacement).unwrap();
        }
        Ok(())
    }

    async fn upload(&self, key: &str, src: &Path) -> Result<(), ConvertError> {
        self.inner.upload(key, src).await
    }

    async fn delete(&self, key: &str) -> Result<(), ConvertError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ConvertError> {
        self.inner.exists(key).await
    }
}

#[tokio::test]
async fn reupload_during_conversion_supersedes_the_attempt() {
    let root = tempfile::tempdir().unwrap();
    let bin = write_stub(root.path(), CONVERTER_OK);
    let config = test_config(root.path(), &bin);
    let records = ConversionStore::open(
        root.path().join("records.db"),
        RetryPolicy::new(2, Duration::from_millis(1)),
    )
    .await
    .unwrap();

    let sub_src_dir = root.path().join("buckets/sub-src");
    std::fs::create_dir_all(&sub_src_dir).unwrap();
    let blob_path = sub_src_dir.join("5.tar.gz");
    std::fs::write(&blob_path, archive_bytes(&[("main.tex", MAIN_TEX)])).unwrap();

    let mut stores = fs_stores(root.path());
    stores.sub_sources = Arc::new(ReuploadingStore {
        inner: FsObjectStore::new(&sub_src_dir),
        blob_path,
        replacement: archive_bytes(&[("main.tex", "\\documentclass{article}\n% v2")]),
        downloads: AtomicUsize::new(0),
    });
    let converter = Converter::new(config, records.clone(), stores);

    let outcome = converter.convert_blob("5.tar.gz", false).await.unwrap();
    assert_eq!(outcome, ConvertOutcome::Superseded);

    // The row still shows the original attempt in progress; nothing was
    // marked success and nothing was uploaded.
    let record = records
        .fetch(&RecordKey::Submission(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConversionStatus::InProgress);
    assert!(!root.path().join("buckets/sub-out/5.tar.gz").exists());
}

// ── Batch ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_skips_identifiers_already_tried() {
    let h = harness().await;
    h.seed_source("sub-src", "100.tar.gz", &[("main.tex", MAIN_TEX)]);
    h.seed_source("sub-src", "101.tar.gz", &[("main.tex", MAIN_TEX)]);

    // First pass converts 100 alone.
    h.converter.convert_blob("100.tar.gz", false).await.unwrap();

    // Redelivered batch carries both; 100 must not be redone.
    let items = vec![
        (
            Payload::Submission { submission_id: 100 },
            "100.tar.gz".to_string(),
        ),
        (
            Payload::Submission { submission_id: 101 },
            "101.tar.gz".to_string(),
        ),
    ];
    let results = h.converter.convert_batch(items).await;
    assert_eq!(results.len(), 2);
    for (payload, outcome) in &results {
        match payload {
            Payload::Submission { submission_id: 100 } => assert!(matches!(
                outcome,
                tex2html::BatchOutcome::SkippedAlreadyTried
            )),
            Payload::Submission { submission_id: 101 } => assert!(matches!(
                outcome,
                tex2html::BatchOutcome::Done(ConvertOutcome::Converted { .. })
            )),
            other => panic!("unexpected payload {other}"),
        }
    }
}

// ── Publish ──────────────────────────────────────────────────────────────

async fn convert_submission(h: &Harness, id: i64) {
    h.seed_source(
        "sub-src",
        &format!("{id}.tar.gz"),
        &[("main.tex", MAIN_TEX)],
    );
    let outcome = h
        .converter
        .convert_blob(&format!("{id}.tar.gz"), false)
        .await
        .unwrap();
    assert!(matches!(outcome, ConvertOutcome::Converted { .. }));
}

fn publish_request(submission_id: i64) -> PublishRequest {
    PublishRequest {
        submission_id,
        paper_id: "2301.00001".into(),
        version: 2,
        license_url: Some("http://creativecommons.org/licenses/by-sa/4.0/".into()),
        category: Some("cs.LG".into()),
        submitted_at: Some("2023-01-02".into()),
    }
}

#[tokio::test]
async fn publish_promotes_converted_submission() {
    let h = harness().await;
    convert_submission(&h, 42).await;

    let outcome = h.publisher.publish(&publish_request(42)).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Published);

    // Document archive holds the renamed site with rewritten metadata.
    let out = h.bucket("doc-out").join("2301.00001v2.tar.gz");
    let unpacked = h.root.path().join("check");
    unpack_archive(&out, &unpacked).unwrap();
    let doc_dir = unpacked.join("2301.00001v2");
    assert!(doc_dir.join("2301.00001v2.html").exists());
    assert!(!unpacked.join("42").exists());
    let meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(doc_dir.join("metadata.json")).unwrap()).unwrap();
    assert_eq!(meta["paper_id"], "2301.00001");
    assert_eq!(meta["license"], "License: CC BY-SA");

    // The submission-side copy is gone, the document record written.
    assert!(!h.bucket("sub-out").join("42.tar.gz").exists());
    let doc = h
        .records
        .fetch(&RecordKey::Document {
            paper_id: "2301.00001".into(),
            version: 2,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, ConversionStatus::Success);
}

#[tokio::test]
async fn publish_without_conversion_is_a_quiet_noop() {
    let h = harness().await;
    let outcome = h.publisher.publish(&publish_request(404)).await.unwrap();
    assert_eq!(outcome, PublishOutcome::SkippedNoConversion);
    assert!(!h.bucket("doc-out").join("2301.00001v2.tar.gz").exists());
}

#[tokio::test]
async fn publish_after_failed_conversion_is_a_quiet_noop() {
    let h = harness_with(CONVERTER_FAIL).await;
    h.seed_source("sub-src", "13.tar.gz", &[("main.tex", MAIN_TEX)]);
    let _ = h.converter.convert_blob("13.tar.gz", false).await;

    let outcome = h.publisher.publish(&publish_request(13)).await.unwrap();
    assert_eq!(outcome, PublishOutcome::SkippedNoConversion);
}

#[tokio::test]
async fn redelivered_publish_skips_cleanly() {
    let h = harness().await;
    convert_submission(&h, 42).await;

    let first = h.publisher.publish(&publish_request(42)).await.unwrap();
    assert_eq!(first, PublishOutcome::Published);

    // Second delivery of the same announce event: the submission archive
    // is already deleted, so this must short-circuit, not error.
    let second = h.publisher.publish(&publish_request(42)).await.unwrap();
    assert_eq!(second, PublishOutcome::SkippedAlreadyPublished);
}

// ── Re-conversion after supersede ────────────────────────────────────────

#[tokio::test]
async fn reconversion_overwrites_a_failed_attempt() {
    let h = harness_with(CONVERTER_FAIL).await;
    h.seed_source("sub-src", "21.tar.gz", &[("main.tex", MAIN_TEX)]);
    let _ = h.converter.convert_blob("21.tar.gz", false).await;
    assert_eq!(
        h.records
            .fetch(&RecordKey::Submission(21))
            .await
            .unwrap()
            .unwrap()
            .status,
        ConversionStatus::Failure
    );

    // Same identifier, working converter now: one row, back to success.
    let bin = write_stub(h.root.path(), CONVERTER_OK);
    let config = test_config(h.root.path(), &bin);
    let converter = Converter::new(config, h.records.clone(), fs_stores(h.root.path()));
    let outcome = converter.convert_blob("21.tar.gz", false).await.unwrap();
    assert!(matches!(outcome, ConvertOutcome::Converted { .. }));
    assert_eq!(
        h.records
            .fetch(&RecordKey::Submission(21))
            .await
            .unwrap()
            .unwrap()
            .status,
        ConversionStatus::Success
    );
}
