//! Field file reader with (path, mtime) caching.

mod parse;

use crate::cache::{CacheGovernor, FileEntry};
use crate::error::{CoreError, Result};
use foamrun_model::{FieldKind, FieldValue};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// Field kinds that never require a header probe. Flux (`phi`) is a
/// surfaceScalarField but is treated as a scalar here.
fn standard_field_kind(filename: &str) -> Option<FieldKind> {
    match filename {
        "p" | "T" | "rho" | "k" | "epsilon" | "omega" | "nut" | "nuTilda" | "alpha.water"
        | "p_rgh" | "phi" => Some(FieldKind::Scalar),
        "U" => Some(FieldKind::Vector),
        _ => None,
    }
}

/// How a read interacts with the (path, mtime) cache.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Stat the file and compare mtimes before trusting the cache.
    pub check_mtime: bool,
    /// Mtime already obtained by a directory scan, saving the stat.
    pub known_mtime: Option<SystemTime>,
    /// Whether to write the parse result back into the cache.
    pub store_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            check_mtime: true,
            known_mtime: None,
            store_cache: true,
        }
    }
}

impl ReadOptions {
    /// Options for stable time steps: immutable once a newer step exists,
    /// so skip the stat, and skip the cache write since the value is
    /// archived into the series immediately.
    pub fn stable() -> Self {
        Self {
            check_mtime: false,
            known_mtime: None,
            store_cache: false,
        }
    }

    /// Options for the volatile latest step, carrying the mtime captured
    /// by the directory scan when available.
    pub fn volatile(known_mtime: Option<SystemTime>) -> Self {
        Self {
            check_mtime: known_mtime.is_none(),
            known_mtime,
            store_cache: true,
        }
    }
}

/// Reads one field file into a [`FieldValue`], caching results in the
/// governor by (path, mtime).
#[derive(Debug, Clone)]
pub struct FieldReader {
    cache: Arc<CacheGovernor>,
}

impl FieldReader {
    pub fn new(cache: Arc<CacheGovernor>) -> Self {
        Self { cache }
    }

    /// Classify a field file, preferring (in order) the per-case filename
    /// cache, the standard-name table, the per-path probe cache, and
    /// finally a 2 KiB header read.
    pub fn field_kind(
        &self,
        case_dir: &Path,
        path: &Path,
        filename: &str,
        known_mtime: Option<SystemTime>,
    ) -> Option<FieldKind> {
        if let Some(types) = self.cache.case_field_types.get(case_dir) {
            if let Some(kind) = types.get(filename) {
                return Some(*kind);
            }
        }

        if let Some(kind) = standard_field_kind(filename) {
            return Some(kind);
        }

        let mtime = match known_mtime {
            Some(m) => m,
            None => fs::metadata(path).ok()?.modified().ok()?,
        };

        if let Some(entry) = self.cache.field_types.get(path) {
            let (cached_mtime, cached_kind) = *entry;
            // A positively identified kind is stable across time steps.
            if let Some(kind) = cached_kind {
                drop(entry);
                self.remember_case_kind(case_dir, filename, kind);
                return Some(kind);
            }
            if cached_mtime == mtime {
                return cached_kind;
            }
        }

        let kind = probe_header(path);
        self.cache
            .field_types
            .insert(path.to_path_buf(), (mtime, kind));
        if let Some(kind) = kind {
            self.remember_case_kind(case_dir, filename, kind);
        }
        kind
    }

    /// Parse one field file. Cache discipline follows [`ReadOptions`]:
    /// an unchanged mtime returns the cached value without reopening the
    /// file.
    pub fn read_field(&self, path: &Path, kind: FieldKind, opts: ReadOptions) -> Result<FieldValue> {
        if !opts.check_mtime && opts.known_mtime.is_none() {
            if let Some(entry) = self.cache.files.get(path) {
                return Ok(entry.value);
            }
        }

        let mtime = match opts.known_mtime {
            Some(m) => Some(m),
            None if opts.check_mtime => match fs::metadata(path) {
                Ok(meta) => meta.modified().ok(),
                Err(_) => return Err(CoreError::NotFound("field file missing".into())),
            },
            None => None,
        };

        if mtime.is_some() {
            if let Some(entry) = self.cache.files.get(path) {
                if entry.mtime == mtime {
                    return Ok(entry.value);
                }
            }
        }

        let value = parse_file(path, kind)?;
        if opts.store_cache {
            self.cache
                .files
                .insert(path.to_path_buf(), FileEntry { mtime, value });
        }
        Ok(value)
    }

    /// Scalar convenience wrapper: parse failures are logged and surface
    /// as `None`, which series assembly records as zero.
    pub fn read_scalar(&self, path: &Path, opts: ReadOptions) -> Option<f64> {
        match self.read_field(path, FieldKind::Scalar, opts) {
            Ok(value) => value.as_scalar(),
            Err(e) => {
                warn!("Error parsing scalar field {}: {e}", path.display());
                None
            }
        }
    }

    /// Vector convenience wrapper with the zero fallback.
    pub fn read_vector(&self, path: &Path, opts: ReadOptions) -> (f64, f64, f64) {
        match self.read_field(path, FieldKind::Vector, opts) {
            Ok(value) => value.vector_or_zero(),
            Err(e) => {
                warn!("Error parsing vector field {}: {e}", path.display());
                (0.0, 0.0, 0.0)
            }
        }
    }

    fn remember_case_kind(&self, case_dir: &Path, filename: &str, kind: FieldKind) {
        self.cache
            .case_field_types
            .entry(case_dir.to_path_buf())
            .or_insert_with(HashMap::new)
            .insert(filename.to_string(), kind);
    }
}

fn probe_header(path: &Path) -> Option<FieldKind> {
    let mut header = vec![0u8; parse::HEADER_PROBE_LEN];
    let mut file = fs::File::open(path).ok()?;
    let n = file.read(&mut header).ok()?;
    parse::detect_kind(&header[..n])
}

fn parse_file(path: &Path, kind: FieldKind) -> Result<FieldValue> {
    let file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(CoreError::Parse("empty field file".into()));
    }
    // Safety: field files are written once per time step and stable steps
    // are never reparsed; a torn concurrent write surfaces as a parse
    // error, not UB on the mapping itself.
    let map = unsafe { Mmap::map(&file)? };

    let parsed = match kind {
        FieldKind::Scalar => parse::parse_scalar_content(&map),
        FieldKind::Vector => parse::parse_vector_content(&map),
    };
    parsed.ok_or_else(|| CoreError::Parse("unparseable internalField".into()))
}
