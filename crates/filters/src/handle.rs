//! Shared, atomically swappable [`FilterSet`] reference and the reload loop
//! that replaces it when the mounted policy directory changes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::FilterSet;

/// Readers load the current snapshot without locking; a reload stores a new
/// one. Events already holding a snapshot keep using it.
#[derive(Clone)]
pub struct FilterHandle {
    snap: Arc<ArcSwap<FilterSet>>,
}

impl FilterHandle {
    pub fn new(set: FilterSet) -> Self {
        Self { snap: Arc::new(ArcSwap::from_pointee(set)) }
    }

    pub fn current(&self) -> Arc<FilterSet> { self.snap.load_full() }

    pub fn replace(&self, set: FilterSet) { self.snap.store(Arc::new(set)); }
}

impl Default for FilterHandle {
    fn default() -> Self { Self::new(FilterSet::empty()) }
}

/// Build a set from `path` and log every load error; the set is returned
/// either way.
pub fn load_and_report(path: &Path) -> FilterSet {
    let (set, errors) = FilterSet::build(path);
    if let Some(errors) = errors {
        warn!(
            path = %path.display(),
            errors = errors.len(),
            "not all filters could be created; some archive and delete operations will not run until resolved:\n{}",
            errors
        );
    }
    info!(path = %path.display(), archive = set.archive_len(), delete = set.delete_len(), "filters loaded");
    set
}

/// Hash of entry names, sizes and modification times. `None` when the
/// directory cannot be read.
pub fn fingerprint(path: &Path) -> Option<u64> {
    let mut entries: Vec<_> = std::fs::read_dir(path).ok()?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    let mut h = DefaultHasher::new();
    for e in entries {
        e.file_name().hash(&mut h);
        if let Ok(meta) = std::fs::metadata(e.path()) {
            meta.len().hash(&mut h);
            if let Ok(modified) = meta.modified() {
                modified.hash(&mut h);
            }
        }
    }
    Some(h.finish())
}

/// Poll `path` every `every` and swap in a freshly built set whenever the
/// directory fingerprint changes.
pub fn spawn_reload(path: PathBuf, handle: FilterHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = fingerprint(&path);
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = fingerprint(&path);
            if now == last {
                continue;
            }
            debug!(path = %path.display(), "policy directory changed");
            last = now;
            let p = path.clone();
            match tokio::task::spawn_blocking(move || load_and_report(&p)).await {
                Ok(set) => {
                    handle.replace(set);
                    counter!("filters_reload_total", 1u64);
                }
                Err(e) => warn!(error = %e, "filter reload task failed"),
            }
        }
    })
}
