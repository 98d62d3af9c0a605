use crate::cache::CacheGovernor;
use crate::fields::FieldReader;
use foamrun_model::FieldKind;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::error;

/// One-pass scan of a time directory: field classification plus per-file
/// mtimes, so later reads skip their stat calls.
#[derive(Debug, Default)]
pub struct DirScan {
    pub(crate) mtime: Option<SystemTime>,
    pub scalar_fields: Vec<String>,
    pub has_u: bool,
    pub all_files: Vec<String>,
    pub file_mtimes: HashMap<String, SystemTime>,
}

/// Enumerates and numerically sorts a case's time-step directories,
/// cached by the parent directory's mtime.
#[derive(Debug, Clone)]
pub struct TimeIndex {
    cache: Arc<CacheGovernor>,
}

impl TimeIndex {
    pub fn new(cache: Arc<CacheGovernor>) -> Self {
        Self { cache }
    }

    /// Sorted time-directory names of a case. Hidden and non-numeric
    /// entries are skipped; errors yield an empty list.
    pub fn list_times(&self, case_dir: &Path, known_mtime: Option<SystemTime>) -> Arc<[String]> {
        let mtime = match known_mtime.or_else(|| dir_mtime(case_dir)) {
            Some(m) => m,
            None => {
                error!("Error accessing case directory {}", case_dir.display());
                return Arc::from(Vec::<String>::new());
            }
        };

        if let Some(cached) = self.cache.time_dirs.get(case_dir) {
            let (cached_mtime, dirs) = &*cached;
            if *cached_mtime == mtime {
                return dirs.clone();
            }
        }

        let mut numbered: Vec<(f64, String)> = Vec::new();
        match std::fs::read_dir(case_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    if let Some(value) = parse_time_name(&name) {
                        numbered.push((value, name));
                    }
                }
            }
            Err(e) => {
                error!("Error listing directories in {}: {e}", case_dir.display());
                return Arc::from(Vec::<String>::new());
            }
        }

        numbered.sort_by(|a, b| a.0.total_cmp(&b.0));
        let sorted: Arc<[String]> = numbered.into_iter().map(|(_, name)| name).collect();

        self.cache
            .time_dirs
            .insert(case_dir.to_path_buf(), (mtime, sorted.clone()));
        sorted
    }

    /// Scan one time directory, classifying every visible file and
    /// capturing its mtime. Cached by the directory's own mtime.
    pub fn scan_time_dir(
        &self,
        reader: &FieldReader,
        case_dir: &Path,
        time_path: &Path,
        known_mtime: Option<SystemTime>,
    ) -> Arc<DirScan> {
        let mtime = known_mtime.or_else(|| dir_mtime(time_path));

        if let (Some(mtime), Some(cached)) = (mtime, self.cache.dir_scans.get(time_path)) {
            if cached.mtime == Some(mtime) {
                return cached.clone();
            }
        }

        let mut scan = DirScan {
            mtime,
            ..DirScan::default()
        };

        match std::fs::read_dir(time_path) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    let entry_mtime = entry.metadata().ok().and_then(|m| m.modified().ok());
                    if let Some(m) = entry_mtime {
                        scan.file_mtimes.insert(name.clone(), m);
                    }

                    match reader.field_kind(case_dir, &entry.path(), &name, entry_mtime) {
                        Some(FieldKind::Scalar) => scan.scalar_fields.push(name.clone()),
                        Some(FieldKind::Vector) if name == "U" => scan.has_u = true,
                        _ => {}
                    }
                    scan.all_files.push(name);
                }
            }
            Err(e) => {
                error!("Error scanning time directory {}: {e}", time_path.display());
                return Arc::new(DirScan::default());
            }
        }

        scan.scalar_fields.sort();
        scan.all_files.sort();

        let scan = Arc::new(scan);
        self.cache
            .dir_scans
            .insert(time_path.to_path_buf(), scan.clone());
        scan
    }
}

/// A time directory is named by a finite non-negative float.
fn parse_time_name(name: &str) -> Option<f64> {
    name.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn dir_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
