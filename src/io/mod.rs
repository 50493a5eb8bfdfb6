pub mod layout;
pub mod matrix;
pub mod sessions;

use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Writes any serializable run report as pretty JSON.
pub fn write_report<T: Serialize, P: AsRef<Path>>(report: &T, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .context(format!("Could not create report directory: {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(report).context("serializing run report")?;
    fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    Ok(())
}
