//! The closed set of payload kinds a worker can be asked to process.
//!
//! Every inbound trigger resolves to one of two variants: a submission in
//! the moderation pipeline (keyed by integer id) or an already-announced
//! document (keyed by paper id + version). Everything downstream that used
//! to branch on "which bucket did this come from" dispatches on this enum
//! instead, so a new payload kind is a compile error at every decision
//! point rather than a silently wrong `if`.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of work: what to convert and which lifecycle it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// A submission still in the moderation pipeline.
    Submission { submission_id: i64 },
    /// An announced document, identified permanently.
    Document { paper_id: String, version: i64 },
}

/// Record-store key derived from a payload. Same shape, separated so the
/// store's API reads as "keyed lookups" rather than "payload handling".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Submission(i64),
    Document { paper_id: String, version: i64 },
}

impl Payload {
    /// The identifier as it appears in blob names, lock files, and logs:
    /// `"1234"` for submissions, `"2301.00001v2"` for documents.
    pub fn name(&self) -> String {
        match self {
            Payload::Submission { submission_id } => submission_id.to_string(),
            Payload::Document { paper_id, version } => format!("{paper_id}v{version}"),
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Payload::Document { .. })
    }

    /// The record-store key for this payload.
    pub fn key(&self) -> RecordKey {
        match self {
            Payload::Submission { submission_id } => RecordKey::Submission(*submission_id),
            Payload::Document { paper_id, version } => RecordKey::Document {
                paper_id: paper_id.clone(),
                version: *version,
            },
        }
    }

    /// Derive a payload from a storage-event blob name.
    ///
    /// Source archives arrive as `<prefix>/<id>.tar.gz`. Anything else in
    /// the bucket (listing markers, partial uploads) is extraneous and is
    /// rejected here; callers discard it with a log line rather than
    /// treating it as a failure, so trigger retry storms never build up.
    pub fn from_blob_name(name: &str, is_document: bool) -> Result<Self, ConvertError> {
        let file = name.rsplit('/').next().unwrap_or(name);
        let id = file
            .strip_suffix(".tar.gz")
            .ok_or_else(|| ConvertError::UnrecognisedBlob {
                name: name.to_string(),
            })?;
        if id.is_empty() {
            return Err(ConvertError::UnrecognisedBlob {
                name: name.to_string(),
            });
        }
        if is_document {
            let (paper_id, version) = split_paper_idv(id);
            Ok(Payload::Document {
                paper_id: paper_id.to_string(),
                version,
            })
        } else {
            let submission_id =
                id.parse::<i64>()
                    .map_err(|_| ConvertError::UnrecognisedBlob {
                        name: name.to_string(),
                    })?;
            Ok(Payload::Submission { submission_id })
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Submission { .. } => write!(f, "submission {}", self.name()),
            Payload::Document { .. } => write!(f, "document {}", self.name()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Submission(id) => write!(f, "submission {id}"),
            RecordKey::Document { paper_id, version } => {
                write!(f, "document {paper_id}v{version}")
            }
        }
    }
}

/// Split `"2301.00001v2"` into `("2301.00001", 2)`.
///
/// A bare paper id with no version marker means version 1 (the announce
/// pipeline omits `v1` for first versions).
pub fn split_paper_idv(idv: &str) -> (&str, i64) {
    match idv.rsplit_once('v') {
        Some((paper_id, v)) if !paper_id.is_empty() => match v.parse::<i64>() {
            Ok(version) => (paper_id, version),
            Err(_) => (idv, 1),
        },
        _ => (idv, 1),
    }
}
