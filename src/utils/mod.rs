#[cfg(test)]
pub mod test_utils;

use log::{debug, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Deletes intermediate images. Files that are already gone are fine;
/// any other failure is logged and left behind.
pub fn remove_temporaries(paths: &[&Path]) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("removed {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", path.display(), e),
        }
    }
    removed
}
