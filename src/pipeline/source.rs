//! Source-tree preparation: binding-override removal and main-source
//! detection.
//!
//! ## Main-source detection
//!
//! An extracted source tree may contain many .tex files (figures, sections,
//! Overleaf templates). The converter needs exactly one entry point, chosen
//! deterministically:
//!
//! 1. A single top-level .tex file wins outright, declaration or not.
//! 2. Otherwise, candidates are the top-level .tex files containing a
//!    `\documentclass`/`\documentstyle` line. Conventional main names
//!    (`paper.tex`, `main.tex`, `ms.tex`, `article.tex`) score above other
//!    candidates; `standalone` and `subfiles` document classes are
//!    disqualified outright, since those classes mark Overleaf sub-file
//!    components, not the document.
//! 3. Equal scores break lexicographically by filename, so the same tree
//!    always yields the same choice.
//!
//! No candidates at all is a hard error for the attempt.

use crate::error::ConvertError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A line opening a document declaration.
static RE_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\\document(?:style|class)").unwrap());

/// A declaration of the `standalone` or `subfiles` class, which marks a
/// component file rather than the document itself.
static RE_COMPONENT_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\\document(?:style|class).*(?:\{standalone\}|\{subfiles\})").unwrap()
});

/// Filenames that conventionally mark the main source.
const CONVENTIONAL_MAIN: [&str; 4] = ["paper.tex", "main.tex", "ms.tex", "article.tex"];

/// Score for a disqualified (component-class) candidate. Large and
/// negative so a disqualified file can never beat any real candidate.
const DISQUALIFIED: i32 = -99_999;

/// Delete converter-binding override files (`.ltxml`) anywhere in the
/// tree, so author-supplied bindings can never shadow the converter's own.
///
/// Returns the number of files removed.
pub fn strip_binding_overrides(dir: &Path) -> Result<usize, ConvertError> {
    let mut removed = 0usize;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = fs::read_dir(&current).map_err(|e| ConvertError::BindingStripFailed {
            path: current.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ConvertError::BindingStripFailed {
                path: current.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "ltxml") {
                fs::remove_file(&path).map_err(|e| ConvertError::BindingStripFailed {
                    path: path.clone(),
                    source: e,
                })?;
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!("Removed {} binding override file(s)", removed);
    }
    Ok(removed)
}

/// Identify the main .tex source at the top level of `dir`.
pub fn find_main_source(dir: &Path) -> Result<PathBuf, ConvertError> {
    let not_found = || ConvertError::MainSourceNotFound {
        dir: dir.to_path_buf(),
    };

    let mut tex_files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|_| not_found())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "tex"))
        .collect();
    tex_files.sort();

    // A lone .tex file is the main source by elimination.
    if tex_files.len() == 1 {
        return Ok(tex_files.remove(0));
    }

    let mut candidates: Vec<(PathBuf, i32)> = Vec::new();
    for path in tex_files {
        // Non-UTF-8 bytes are common in TeX sources; lossy decoding is
        // fine because the patterns we scan for are pure ASCII.
        let Ok(bytes) = fs::read(&path) else { continue };
        let content = String::from_utf8_lossy(&bytes);
        let Some(declaration) = content.lines().find(|l| RE_DECLARATION.is_match(l)) else {
            continue;
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let score = if RE_COMPONENT_CLASS.is_match(declaration) {
            DISQUALIFIED
        } else if CONVENTIONAL_MAIN.contains(&file_name.as_str()) {
            1
        } else {
            0
        };
        candidates.push((path, score));
    }

    // Highest score wins; the earlier sort makes equal scores resolve to
    // the lexicographically first filename.
    candidates
        .into_iter()
        .max_by_key(|(_, score)| *score)
        .map(|(path, _)| path)
        .ok_or_else(not_found)
}
