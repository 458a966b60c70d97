//! External converter subprocess.
//!
//! The LaTeX-to-HTML transformation itself lives in an external binary
//! (`latexmlc` in production). This module owns exactly three things:
//! building the argument template, running the process under a wall-clock
//! budget, and scanning its combined output.
//!
//! A non-zero exit is *not* an error here. The caller needs the captured
//! log either way (it is archived for QA even when conversion fails), so
//! the run result reports success as data and the caller escalates.
//! Timeout and spawn failure are errors: there is no log worth keeping.

use crate::config::ConversionConfig;
use crate::error::ConvertError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Style preload list passed to the converter. Limits are generous enough
/// for real documents while bounding pathological macro expansion.
const PRELOAD: &str = "--preload=[nobibtex,ids,localrawstyles,mathlexemes,\
magnify=2,zoomout=2,tokenlimit=99999999,iflimit=1499999,absorblimit=1299999,\
pushbacklimit=599999]latexml.sty";

/// Converter warning emitted for each style package it has no binding for.
static RE_MISSING_PACKAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Warning:missing_file:.+Can't\sfind\spackage\s(.+)\sat").unwrap());

/// Characters of log tail carried into an error message.
const TAIL_CHARS: usize = 2000;

/// Result of one converter run, successful or not.
#[derive(Debug)]
pub struct ConverterOutput {
    /// Whether the process exited zero.
    pub success: bool,
    /// Exit status in display form, e.g. `"exit status: 1"`.
    pub status: String,
    /// Combined stdout and stderr, archived as the QA log.
    pub log: String,
    /// Style packages the converter reported no binding for. The document
    /// still converts; these degrade fidelity and are surfaced as result
    /// metadata.
    pub missing_packages: Vec<String>,
}

/// Build the full converter argument list for one run.
///
/// Pure so the template is testable without spawning anything.
pub fn converter_args(config: &ConversionConfig, main: &Path, dest_html: &Path) -> Vec<String> {
    let mut args = vec![PRELOAD.to_string()];
    for path in &config.style_paths {
        args.push(format!("--path={}", path.display()));
    }
    args.extend(
        ["--pmml", "--cmml", "--mathtex", "--nodefaultresources"]
            .into_iter()
            .map(String::from),
    );
    args.push(format!("--timeout={}", config.converter_timeout_secs));
    if let Some(base) = &config.asset_base_url {
        let base = base.trim_end_matches('/');
        args.push(format!("--css={base}/styles.css"));
        args.push(format!("--javascript={base}/addons.js"));
    }
    args.push("--navigationtoc=context".to_string());
    args.push(format!("--source={}", main.display()));
    args.push(format!("--dest={}", dest_html.display()));
    args
}

/// Run the converter on `main`, producing `{id}.html` inside `out_dir`.
///
/// The subprocess gets the configured wall-clock budget; on expiry it is
/// killed and the attempt fails with [`ConvertError::ConverterTimeout`].
pub async fn run_converter(
    config: &ConversionConfig,
    main: &Path,
    out_dir: &Path,
    id: &str,
) -> Result<ConverterOutput, ConvertError> {
    let dest_html = out_dir.join(format!("{id}.html"));
    let args = converter_args(config, main, &dest_html);
    debug!("Running converter for '{}': {:?}", id, args);

    let child = Command::new(&config.converter_bin)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the timed-out future must reap the process.
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ConvertError::ConverterSpawn {
            bin: config.converter_bin.clone(),
            source: e,
        })?;

    let output = match tokio::time::timeout(config.converter_timeout(), child.wait_with_output())
        .await
    {
        Ok(result) => result.map_err(|e| ConvertError::ConverterSpawn {
            bin: config.converter_bin.clone(),
            source: e,
        })?,
        Err(_) => {
            warn!(
                "Converter for '{}' exceeded {}s budget, killed",
                id, config.converter_timeout_secs
            );
            return Err(ConvertError::ConverterTimeout {
                main: main.to_path_buf(),
                secs: config.converter_timeout_secs,
            });
        }
    };

    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    let missing_packages = list_missing_packages(&log);

    Ok(ConverterOutput {
        success: output.status.success(),
        status: output.status.to_string(),
        log,
        missing_packages,
    })
}

/// Scan a converter log for missing style-package warnings.
pub fn list_missing_packages(log: &str) -> Vec<String> {
    RE_MISSING_PACKAGE
        .captures_iter(log)
        .map(|c| c[1].to_string())
        .collect()
}

/// Last [`TAIL_CHARS`] characters of a log, for error messages.
pub fn log_tail(log: &str) -> String {
    let start = log
        .char_indices()
        .rev()
        .nth(TAIL_CHARS.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    log[start..].to_string()
}
