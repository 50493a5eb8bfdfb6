use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::PipelineResult;

/// Outcome of a memoized step.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    /// All outputs already existed and were loaded.
    Hit(T),
    Computed(T),
}

impl<T> Cached<T> {
    pub fn into_inner(self) -> T {
        match self {
            Cached::Hit(v) | Cached::Computed(v) => v,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Cached::Hit(_))
    }
}

/// One mutex per output path, created on first use.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Runs `f` while holding the lock of `path`. Not reentrant.
    pub fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = self.path_lock(path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

/// Memoization keyed by deterministic output path.
///
/// A step whose outputs all exist is loaded instead of recomputed unless
/// `force` is set. Steps sharing an output path are serialized through a
/// per-path lock, so retries and parallel sessions never write the same
/// file at the same time.
#[derive(Debug, Default)]
pub struct OutputCache {
    force: bool,
    locks: PathLocks,
}

impl OutputCache {
    pub fn new(force: bool) -> Self {
        Self {
            force,
            locks: PathLocks::new(),
        }
    }

    pub fn force(&self) -> bool {
        self.force
    }

    /// True when every output exists and recomputation is not forced.
    pub fn is_fresh(&self, outputs: &[&Path]) -> bool {
        !self.force && !outputs.is_empty() && outputs.iter().all(|p| p.exists())
    }

    /// Runs `f` while holding the write lock of `path`.
    pub fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        self.locks.with_lock(path, f)
    }

    /// Loads the step's result when its outputs are fresh, computes it
    /// otherwise. The first output path is the lock key.
    pub fn get_or_compute<T>(
        &self,
        outputs: &[&Path],
        load: impl FnOnce() -> PipelineResult<T>,
        compute: impl FnOnce() -> PipelineResult<T>,
    ) -> PipelineResult<Cached<T>> {
        let Some(key) = outputs.first() else {
            return compute().map(Cached::Computed);
        };
        self.with_lock(key, || {
            if self.is_fresh(outputs) {
                debug!("reusing existing output {}", key.display());
                load().map(Cached::Hit)
            } else {
                compute().map(Cached::Computed)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::scratch_dir;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_existing_outputs_are_loaded() {
        let dir = scratch_dir("memo_hit");
        let out = dir.join("a.mat");
        fs::write(&out, "x").unwrap();

        let cache = OutputCache::new(false);
        let result = cache
            .get_or_compute(&[out.as_path()], || Ok(1), || Ok(2))
            .unwrap();
        assert_eq!(result, Cached::Hit(1));
    }

    #[test]
    fn test_force_recomputes_and_missing_outputs_compute() {
        let dir = scratch_dir("memo_force");
        let out = dir.join("a.mat");
        let other = dir.join("b.mat");
        fs::write(&out, "x").unwrap();

        let forced = OutputCache::new(true);
        let r = forced.get_or_compute(&[out.as_path()], || Ok(1), || Ok(2)).unwrap();
        assert_eq!(r, Cached::Computed(2));

        // one of two outputs missing
        let cache = OutputCache::new(false);
        let r = cache
            .get_or_compute(&[out.as_path(), other.as_path()], || Ok(1), || Ok(2))
            .unwrap();
        assert!(!r.is_hit());
        assert_eq!(r.into_inner(), 2);
    }

    #[test]
    fn test_writes_to_one_path_are_serialized() {
        let cache = Arc::new(OutputCache::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let path = PathBuf::from("/tmp/symtemplate-lock-test.nii.gz");

        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    cache.with_lock(&path, || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                });
            }
        })
        .unwrap();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
