use csv::ReaderBuilder;
use log::{info, warn};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// One row of a session list. `order` is optional; when every row has it
/// the list is sorted by it, otherwise file order is kept.
#[derive(Debug, Clone, Deserialize)]
struct SessionRow {
    session: String,
    #[serde(default)]
    order: Option<i64>,
}

/// Detect whether the file uses comma or tab as delimiter.
fn detect_delimiter<P: AsRef<Path>>(path: P) -> PipelineResult<u8> {
    let file = File::open(&path)?;
    let mut reader = BufReader::new(file);
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;

    let tabs = first_line.matches('\t').count();
    let commas = first_line.matches(',').count();

    if tabs > commas {
        Ok(b'\t')
    } else {
        Ok(b',')
    }
}

/// Reads the ordered session list from a CSV/TSV file with a `session`
/// header column.
pub fn read_sessions<P: AsRef<Path>>(path: P) -> PipelineResult<Vec<String>> {
    let delim = detect_delimiter(&path)?;
    let file = File::open(&path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delim)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let row: SessionRow = result?;
        if row.session.is_empty() {
            warn!("skipping empty session entry in {:?}", path.as_ref());
            continue;
        }
        rows.push(row);
    }

    if rows.iter().all(|r| r.order.is_some()) {
        rows.sort_by_key(|r| r.order);
    }

    Ok(rows.into_iter().map(|r| r.session).collect())
}

/// Probes one required input and logs the outcome.
pub fn require_input(session: &str, label: &str, path: &Path) -> PipelineResult<PathBuf> {
    if path.exists() {
        info!("  ✓ found {}: {}", label, path.display());
        Ok(path.to_path_buf())
    } else {
        warn!("  ✗ missing {}: {}", label, path.display());
        Err(PipelineError::MissingInput {
            session: session.to_string(),
            label: label.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// Checks every `(label, path)` of a session and returns all missing ones
/// rather than stopping at the first.
pub fn check_session_inputs(session: &str, inputs: &[(String, PathBuf)]) -> Vec<PipelineError> {
    inputs
        .iter()
        .filter_map(|(label, path)| require_input(session, label, path).err())
        .collect()
}
