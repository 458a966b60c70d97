//! Pipeline stages for LaTeX-to-HTML conversion.
//!
//! Each submodule implements exactly one step of the attempt. Keeping
//! stages separate makes each independently testable and lets us swap
//! implementations (e.g. a cloud-bucket object store) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ source ──▶ engine ──▶ fetch
//! (download,  (strip overrides,  (external     (re-pack,
//!  unpack)     find main .tex)    converter)    upload)
//! ```
//!
//! 1. [`fetch`]  — the [`fetch::ObjectStore`] seam for source and output
//!    archives, plus .tar.gz unpack and repack helpers
//! 2. [`source`] — prepare the extracted tree: drop converter-binding
//!    overrides and identify the main .tex file
//! 3. [`engine`] — drive the external converter subprocess under a
//!    wall-clock budget and scan its output for missing packages

pub mod engine;
pub mod fetch;
pub mod source;
