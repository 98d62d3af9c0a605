use crate::residuals::ResidualState;
use crate::series::engine::SeriesCache;
use crate::series::time_dirs::DirScan;
use dashmap::DashMap;
use foamrun_model::{FieldKind, FieldValue};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Environment variable bounding the per-case time-series LRU.
pub const CACHE_MAX_CASES_ENV: &str = "CACHE_MAX_CASES";

/// Default number of cases kept in the time-series cache.
pub const DEFAULT_MAX_CASES: usize = 5;

/// One cached field-file parse, keyed by path with its observed mtime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileEntry {
    pub mtime: Option<SystemTime>,
    pub value: FieldValue,
}

/// Owner of every data-plane cache.
///
/// All keyed state lives here instead of in per-module statics so that
/// eviction is a single operation and tests can reset state per case.
/// Eviction policy: a case-level LRU over the time-series cache; dropping
/// a case purges every entry across the other maps whose key starts with
/// the case path.
#[derive(Debug)]
pub struct CacheGovernor {
    max_cases: usize,
    /// (path, mtime) -> parsed field value.
    pub(crate) files: DashMap<PathBuf, FileEntry>,
    /// Per-file header probe results.
    pub(crate) field_types: DashMap<PathBuf, (SystemTime, Option<FieldKind>)>,
    /// Field kinds by filename within a case; `p` is scalar in every step.
    pub(crate) case_field_types: DashMap<PathBuf, HashMap<String, FieldKind>>,
    /// Sorted time-directory listings keyed by case dir.
    pub(crate) time_dirs: DashMap<PathBuf, (SystemTime, Arc<[String]>)>,
    /// One-pass time-directory scans keyed by time dir.
    pub(crate) dir_scans: DashMap<PathBuf, Arc<DirScan>>,
    /// Incremental residual-parser state keyed by log path.
    pub(crate) residuals: DashMap<PathBuf, ResidualState>,
    series: Mutex<SeriesLru>,
}

#[derive(Debug, Default)]
struct SeriesLru {
    /// Front is least recently used.
    order: VecDeque<PathBuf>,
    entries: HashMap<PathBuf, Arc<Mutex<SeriesCache>>>,
}

impl SeriesLru {
    fn touch(&mut self, case: &Path) {
        if let Some(pos) = self.order.iter().position(|p| p == case) {
            let path = self.order.remove(pos).unwrap();
            self.order.push_back(path);
        }
    }
}

impl CacheGovernor {
    pub fn new(max_cases: usize) -> Self {
        Self {
            max_cases: max_cases.max(1),
            files: DashMap::new(),
            field_types: DashMap::new(),
            case_field_types: DashMap::new(),
            time_dirs: DashMap::new(),
            dir_scans: DashMap::new(),
            residuals: DashMap::new(),
            series: Mutex::new(SeriesLru::default()),
        }
    }

    /// Capacity from `CACHE_MAX_CASES`, defaulting to 5.
    pub fn from_env() -> Self {
        let max_cases = std::env::var(CACHE_MAX_CASES_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_CASES);
        Self::new(max_cases)
    }

    pub fn max_cases(&self) -> usize {
        self.max_cases
    }

    /// Fetch-or-create the series cache for a case, marking it most
    /// recently used. Inserting past capacity evicts the LRU case and
    /// purges its entries from every other map.
    pub(crate) fn series_entry(&self, case: &Path) -> Arc<Mutex<SeriesCache>> {
        let (entry, evicted) = {
            let mut lru = self.series.lock();
            if let Some(existing) = lru.entries.get(case).cloned() {
                lru.touch(case);
                (existing, Vec::new())
            } else {
                let mut evicted = Vec::new();
                while lru.entries.len() >= self.max_cases {
                    match lru.order.pop_front() {
                        Some(oldest) => {
                            lru.entries.remove(&oldest);
                            evicted.push(oldest);
                        }
                        None => break,
                    }
                }
                let fresh = Arc::new(Mutex::new(SeriesCache::default()));
                lru.entries.insert(case.to_path_buf(), fresh.clone());
                lru.order.push_back(case.to_path_buf());
                (fresh, evicted)
            }
        };

        for case in evicted {
            debug!("Evicting case from series cache: {}", case.display());
            self.purge_case_keys(&case);
        }
        entry
    }

    /// Mark a case most recently used without creating an entry.
    pub fn touch(&self, case: &Path) {
        self.series.lock().touch(case);
    }

    /// Whether a case currently has a series cache entry.
    pub fn contains_series(&self, case: &Path) -> bool {
        self.series.lock().entries.contains_key(case)
    }

    /// Drop every cache entry belonging to one case.
    pub fn clear(&self, case: &Path) {
        {
            let mut lru = self.series.lock();
            lru.entries.remove(case);
            if let Some(pos) = lru.order.iter().position(|p| p == case) {
                lru.order.remove(pos);
            }
        }
        self.purge_case_keys(case);
    }

    pub fn clear_all(&self) {
        let mut lru = self.series.lock();
        lru.entries.clear();
        lru.order.clear();
        drop(lru);

        self.files.clear();
        self.field_types.clear();
        self.case_field_types.clear();
        self.time_dirs.clear();
        self.dir_scans.clear();
        self.residuals.clear();
    }

    /// Remove one archived file entry (called as time steps stabilize, so
    /// the file cache stays bounded within a case).
    pub(crate) fn prune_file(&self, path: &Path) {
        self.files.remove(path);
    }

    fn purge_case_keys(&self, case: &Path) {
        self.files.retain(|k, _| !k.starts_with(case));
        self.field_types.retain(|k, _| !k.starts_with(case));
        self.case_field_types.remove(case);
        self.time_dirs.remove(case);
        self.dir_scans.retain(|k, _| !k.starts_with(case));
        self.residuals.retain(|k, _| !k.starts_with(case));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(n: usize) -> PathBuf {
        PathBuf::from(format!("/cases/c{n}"))
    }

    #[test]
    fn lru_keeps_only_capacity_cases() {
        let governor = CacheGovernor::new(5);
        for n in 0..7 {
            governor.series_entry(&case(n));
        }
        for n in 0..2 {
            assert!(!governor.contains_series(&case(n)), "c{n} should be evicted");
        }
        for n in 2..7 {
            assert!(governor.contains_series(&case(n)), "c{n} should remain");
        }
    }

    #[test]
    fn touch_protects_from_eviction() {
        let governor = CacheGovernor::new(2);
        governor.series_entry(&case(0));
        governor.series_entry(&case(1));
        // c0 becomes most recently used, so inserting c2 evicts c1.
        governor.series_entry(&case(0));
        governor.series_entry(&case(2));

        assert!(governor.contains_series(&case(0)));
        assert!(!governor.contains_series(&case(1)));
        assert!(governor.contains_series(&case(2)));
    }

    #[test]
    fn eviction_purges_sibling_caches() {
        let governor = CacheGovernor::new(1);
        let evictee = case(0);
        governor.series_entry(&evictee);
        governor.files.insert(
            evictee.join("0.1/p"),
            FileEntry {
                mtime: None,
                value: FieldValue::Scalar(1.0),
            },
        );
        governor
            .residuals
            .insert(evictee.join("log.foamRun"), ResidualState::default());
        governor
            .time_dirs
            .insert(evictee.clone(), (SystemTime::now(), Arc::from(Vec::<String>::new())));

        governor.series_entry(&case(1));

        assert!(!governor.contains_series(&evictee));
        assert!(governor.files.is_empty());
        assert!(governor.residuals.is_empty());
        assert!(governor.time_dirs.is_empty());
    }

    #[test]
    fn clear_is_scoped_to_one_case() {
        let governor = CacheGovernor::new(5);
        governor.series_entry(&case(0));
        governor.series_entry(&case(1));
        governor.files.insert(
            case(0).join("0.1/p"),
            FileEntry {
                mtime: None,
                value: FieldValue::Scalar(1.0),
            },
        );
        governor.files.insert(
            case(1).join("0.1/p"),
            FileEntry {
                mtime: None,
                value: FieldValue::Scalar(2.0),
            },
        );

        governor.clear(&case(0));

        assert!(!governor.contains_series(&case(0)));
        assert!(governor.contains_series(&case(1)));
        assert_eq!(governor.files.len(), 1);
    }

    #[test]
    fn capacity_is_at_least_one() {
        let governor = CacheGovernor::new(0);
        assert_eq!(governor.max_cases(), 1);
    }
}
