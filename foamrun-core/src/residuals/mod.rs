//! Incremental residual extraction from solver logs.
//!
//! The log grows append-only while a solver runs; state per log path is
//! `(mtime, size, offset, data)` so a poll touches only the appended
//! bytes. Truncation or an in-place rewrite discards the state and
//! rebuilds from offset zero.

use crate::cache::CacheGovernor;
use crate::error::{CoreError, Result};
use foamrun_model::{ResidualData, SeriesMap};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, warn};

const TIME_PREFIX: &[u8] = b"Time";
const SOLVING_FOR: &[u8] = b"Solving for";
const INITIAL_RESIDUAL: &[u8] = b"Initial residual =";

// Fallbacks for lines the manual token scan cannot isolate, e.g. a time
// value with a trailing unit suffix.
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Time\s*=\s*([-+]?\d*\.?\d+(?:[eE][-+]?\d+)?)").unwrap());
static RESIDUAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Solving for\s+([\w_.]+).*Initial residual\s*=\s*([-+]?\d*\.?\d+(?:[eE][-+]?\d+)?)")
        .unwrap()
});

/// Resumable parser state for one log path.
#[derive(Debug, Default, Clone)]
pub struct ResidualState {
    pub(crate) mtime: Option<SystemTime>,
    pub(crate) size: u64,
    pub(crate) offset: u64,
    pub(crate) data: SeriesMap,
}

/// Extracts `Time =` and `Solving for <field>, Initial residual = <v>`
/// tuples with O(appended bytes) work per call.
#[derive(Debug, Clone)]
pub struct ResidualParser {
    cache: Arc<CacheGovernor>,
}

impl ResidualParser {
    pub fn new(cache: Arc<CacheGovernor>) -> Self {
        Self { cache }
    }

    /// Residual history of `case_dir`'s solver log. Missing logs and
    /// rejected symlinks yield an empty map; other errors drop the cached
    /// state so the next call rebuilds from scratch.
    pub fn residuals(&self, case_dir: &Path, log_name: &str) -> ResidualData {
        let path = case_dir.join(log_name);
        match self.read_incremental(&path) {
            Ok(data) => ResidualData(data),
            Err(CoreError::NotFound(_)) => ResidualData::default(),
            Err(e) => {
                error!("Error parsing log file {}: {e}", path.display());
                self.cache.residuals.remove(&path);
                ResidualData::default()
            }
        }
    }

    /// Observed parser state, used by the HTTP layer for validators.
    pub fn cached_state(&self, path: &Path) -> Option<(SystemTime, u64, u64)> {
        let state = self.cache.residuals.get(path)?;
        Some((state.mtime?, state.size, state.offset))
    }

    fn read_incremental(&self, path: &Path) -> Result<SeriesMap> {
        let file = open_log(path)?;
        let meta = file.metadata()?;
        let mtime = meta.modified().ok();
        let size = meta.len();

        let mut entry = self
            .cache
            .residuals
            .entry(path.to_path_buf())
            .or_default();
        let state = entry.value_mut();

        if state.mtime.is_some() && state.mtime == mtime && state.size == size {
            return Ok(state.data.clone());
        }

        // Growth resumes from the recorded offset; anything else starts
        // over with fresh lists.
        let grew = size > state.size && state.size > 0 && state.mtime.is_some();
        let start_offset = if grew { state.offset } else { 0 };
        if !grew {
            state.data = SeriesMap::new();
            state.offset = 0;
        }

        let has_time_already = state.data.get("time").is_some_and(|t| !t.is_empty());
        let (chunk, consumed) = parse_chunk(file, start_offset, has_time_already)?;

        merge_chunk(&mut state.data, chunk);
        state.offset = start_offset + consumed;
        state.mtime = mtime;
        state.size = size;

        Ok(state.data.clone())
    }
}

/// Open the log without following a symlink where the platform supports
/// it; a symlinked log is treated as absent.
#[cfg(unix)]
fn open_log(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    match fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
            warn!("Ignoring symlinked log file: {}", path.display());
            Err(CoreError::NotFound("symlinked log rejected".into()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CoreError::NotFound("log file missing".into()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn open_log(path: &Path) -> Result<fs::File> {
    match fs::File::open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CoreError::NotFound("log file missing".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Read complete lines from `offset`, returning the extracted series and
/// the number of bytes consumed. A trailing line without a newline is an
/// in-progress write and is left for the next call.
fn parse_chunk(
    file: fs::File,
    offset: u64,
    has_time_already: bool,
) -> Result<(SeriesMap, u64)> {
    let mut reader = BufReader::new(file);
    if offset > 0 {
        reader.seek(SeekFrom::Start(offset))?;
    }

    let mut chunk: SeriesMap = BTreeMap::new();
    chunk.insert("time".to_string(), Vec::new());
    let mut consumed: u64 = 0;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if !line.ends_with(b"\n") {
            break;
        }

        // Malformed lines are skipped; the offset still advances so a bad
        // line cannot wedge the parser.
        if let Some(time) = parse_time_line(&line) {
            chunk.get_mut("time").unwrap().push(time);
        } else if has_time_already || !chunk["time"].is_empty() {
            if let Some((field, value)) = parse_residual_line(&line) {
                let time_len = chunk["time"].len();
                let list = chunk.entry(field).or_insert_with(|| {
                    // First sighting mid-chunk: zero-fill earlier steps.
                    vec![0.0; time_len.saturating_sub(1)]
                });
                list.push(value);
            }
        }

        consumed += n as u64;
    }

    Ok((chunk, consumed))
}

/// `Time = <float>[unit]` at column zero. The gap between `Time` and `=`
/// must be whitespace-only so `Time step execution time = ...` does not
/// advance the axis.
fn parse_time_line(line: &[u8]) -> Option<f64> {
    if !line.starts_with(TIME_PREFIX) {
        return None;
    }
    let eq = line.iter().position(|&b| b == b'=')?;
    let gap = &line[TIME_PREFIX.len()..eq];
    if !gap.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let value = trim_ascii(&line[eq + 1..]);
    if let Ok(parsed) = std::str::from_utf8(value).unwrap_or("").parse::<f64>() {
        return Some(parsed);
    }

    // Unit suffixes like `Time = 24s` defeat the direct parse.
    let caps = TIME_RE.captures(line)?;
    std::str::from_utf8(&caps[1]).ok()?.parse().ok()
}

/// `Solving for <field>, ... Initial residual = <float>, ...` via token
/// scanning, with the precompiled pattern only as a fallback.
fn parse_residual_line(line: &[u8]) -> Option<(String, f64)> {
    let idx = find_sub(line, SOLVING_FOR)?;

    if line.get(idx + SOLVING_FOR.len()) == Some(&b' ') {
        if let Some(parsed) = parse_residual_fast(line, idx + SOLVING_FOR.len() + 1) {
            return Some(parsed);
        }
    }

    let caps = RESIDUAL_RE.captures(line)?;
    let field = std::str::from_utf8(&caps[1]).ok()?.to_string();
    let value = std::str::from_utf8(&caps[2]).ok()?.parse().ok()?;
    Some((field, value))
}

fn parse_residual_fast(line: &[u8], field_start: usize) -> Option<(String, f64)> {
    let res_idx = find_sub(&line[field_start..], INITIAL_RESIDUAL)? + field_start;

    let field_chunk = &line[field_start..res_idx];
    let field_bytes = match field_chunk.iter().position(|&b| b == b',') {
        Some(comma) => trim_ascii(&field_chunk[..comma]),
        None => trim_ascii(field_chunk),
    };
    if field_bytes.is_empty() {
        return None;
    }
    let field = std::str::from_utf8(field_bytes).ok()?.to_string();

    let mut val_start = res_idx + INITIAL_RESIDUAL.len();
    let mut val_end = line
        .iter()
        .skip(val_start)
        .position(|&b| b == b',')
        .map(|p| p + val_start)
        .unwrap_or(line.len());
    while val_start < val_end && line[val_start] == b' ' {
        val_start += 1;
    }
    if let Some(space) = line[val_start..val_end].iter().position(|&b| b == b' ') {
        val_end = val_start + space;
    }
    if val_end <= val_start {
        return None;
    }

    let value = std::str::from_utf8(trim_ascii(&line[val_start..val_end]))
        .ok()?
        .parse()
        .ok()?;
    Some((field, value))
}

/// Splice the per-call buffer into the cached series, zero-filling the
/// prefix of any field first seen in this chunk so lengths stay equal.
fn merge_chunk(data: &mut SeriesMap, chunk: SeriesMap) {
    let prior_steps = data.get("time").map_or(0, Vec::len);
    for (key, values) in chunk {
        if values.is_empty() {
            continue;
        }
        if key == "time" {
            data.entry(key).or_default().extend(values);
        } else {
            data.entry(key)
                .or_insert_with(|| vec![0.0; prior_steps])
                .extend(values);
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> (Arc<CacheGovernor>, ResidualParser) {
        let cache = Arc::new(CacheGovernor::new(5));
        (cache.clone(), ResidualParser::new(cache))
    }

    fn bump_mtime(path: &Path) {
        let later = SystemTime::now() + std::time::Duration::from_secs(60);
        let file = fs::File::options().append(true).open(path).unwrap();
        file.set_modified(later).unwrap();
    }

    #[test]
    fn extracts_time_and_residuals() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(
            &log,
            "Time = 1\n\
             smoothSolver:  Solving for Ux, Initial residual = 0.1, Final residual = 0.001, No Iterations 4\n",
        )
        .unwrap();

        let (_, parser) = parser();
        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("time"), Some(&[1.0][..]));
        assert_eq!(data.series("Ux"), Some(&[0.1][..]));
    }

    #[test]
    fn incremental_growth_resumes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        let first = "Time = 1\nSolving for Ux, Initial residual = 0.1\n";
        fs::write(&log, first).unwrap();

        let (cache, parser) = parser();
        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("time"), Some(&[1.0][..]));
        assert_eq!(data.series("Ux"), Some(&[0.1][..]));

        let pre_append_size = fs::metadata(&log).unwrap().len();
        assert_eq!(
            cache.residuals.get(&log).unwrap().offset,
            pre_append_size
        );

        use std::io::Write;
        let mut file = fs::File::options().append(true).open(&log).unwrap();
        file.write_all(b"Time = 2\nSolving for Ux, Initial residual = 0.05\n")
            .unwrap();
        drop(file);
        bump_mtime(&log);

        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("time"), Some(&[1.0, 2.0][..]));
        assert_eq!(data.series("Ux"), Some(&[0.1, 0.05][..]));
        assert_eq!(
            cache.residuals.get(&log).unwrap().offset,
            fs::metadata(&log).unwrap().len()
        );
    }

    #[test]
    fn successive_reads_form_prefix_relation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(&log, "Time = 1\nSolving for p, Initial residual = 0.3\n").unwrap();

        let (_, parser) = parser();
        let first = parser.residuals(dir.path(), "log.foamRun");

        use std::io::Write;
        let mut file = fs::File::options().append(true).open(&log).unwrap();
        file.write_all(b"Time = 2\nSolving for p, Initial residual = 0.2\n")
            .unwrap();
        drop(file);
        bump_mtime(&log);

        let second = parser.residuals(dir.path(), "log.foamRun");
        for (name, list) in &first.0 {
            let longer = second.series(name).unwrap();
            assert_eq!(&longer[..list.len()], &list[..], "series {name}");
        }
    }

    #[test]
    fn shrunk_log_rebuilds_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(
            &log,
            "Time = 1\nSolving for Ux, Initial residual = 0.1\nTime = 2\nSolving for Ux, Initial residual = 0.05\n",
        )
        .unwrap();

        let (_, parser) = parser();
        parser.residuals(dir.path(), "log.foamRun");

        fs::write(&log, "Time = 7\nSolving for Ux, Initial residual = 0.9\n").unwrap();
        bump_mtime(&log);

        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("time"), Some(&[7.0][..]));
        assert_eq!(data.series("Ux"), Some(&[0.9][..]));
    }

    #[test]
    fn unchanged_log_returns_cached_data() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(&log, "Time = 1\nSolving for p, Initial residual = 0.5\n").unwrap();

        let (_, parser) = parser();
        let first = parser.residuals(dir.path(), "log.foamRun");
        let second = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(first, second);
    }

    #[test]
    fn trailing_partial_line_left_for_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(&log, "Time = 1\nTime = 2").unwrap();

        let (cache, parser) = parser();
        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("time"), Some(&[1.0][..]));
        assert_eq!(cache.residuals.get(&log).unwrap().offset, 9);

        use std::io::Write;
        let mut file = fs::File::options().append(true).open(&log).unwrap();
        file.write_all(b"\nTime = 3\n").unwrap();
        drop(file);
        bump_mtime(&log);

        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("time"), Some(&[1.0, 2.0, 3.0][..]));
    }

    #[test]
    fn time_step_line_does_not_advance_time() {
        assert_eq!(parse_time_line(b"Time = 0.005\n"), Some(0.005));
        assert_eq!(parse_time_line(b"Time step execution time = 0.01\n"), None);
        assert_eq!(parse_time_line(b"ExecutionTime = 1.2 s\n"), None);
    }

    #[test]
    fn unit_suffix_tolerated_on_time_value() {
        assert_eq!(parse_time_line(b"Time = 24s\n"), Some(24.0));
    }

    #[test]
    fn residual_line_parsing_variants() {
        assert_eq!(
            parse_residual_line(
                b"smoothSolver:  Solving for Uz, Initial residual = 9.6e-05, Final residual = 1e-06, No Iterations 2\n"
            ),
            Some(("Uz".to_string(), 9.6e-5))
        );
        assert_eq!(
            parse_residual_line(b"GAMG:  Solving for p_rgh, Initial residual = 0.01, Final residual = 0.0001, No Iterations 3\n"),
            Some(("p_rgh".to_string(), 0.01))
        );
        assert_eq!(parse_residual_line(b"Courant Number mean: 0.2\n"), None);
    }

    #[test]
    fn residuals_before_first_time_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(
            &log,
            "Solving for Ux, Initial residual = 1\nTime = 1\nSolving for Ux, Initial residual = 0.5\n",
        )
        .unwrap();

        let (_, parser) = parser();
        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("Ux"), Some(&[0.5][..]));
    }

    #[test]
    fn field_first_seen_mid_log_back_filled() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(
            &log,
            "Time = 1\n\
             Solving for Ux, Initial residual = 0.1\n\
             Time = 2\n\
             Solving for Ux, Initial residual = 0.05\n\
             Solving for k, Initial residual = 0.7\n",
        )
        .unwrap();

        let (_, parser) = parser();
        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("k"), Some(&[0.0, 0.7][..]));
        assert_eq!(data.series("Ux"), Some(&[0.1, 0.05][..]));
    }

    #[test]
    fn missing_log_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (_, parser) = parser();
        assert!(parser.residuals(dir.path(), "log.foamRun").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_log_rejected() {
        let real = tempfile::tempdir().unwrap();
        let real_log = real.path().join("target.log");
        fs::write(&real_log, "Time = 1\n").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&real_log, dir.path().join("log.foamRun")).unwrap();

        let (_, parser) = parser();
        assert!(parser.residuals(dir.path(), "log.foamRun").is_empty());
    }

    #[test]
    fn malformed_lines_skipped_without_losing_state() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.foamRun");
        fs::write(
            &log,
            "Time = 1\n\
             Solving for , Initial residual = garbage\n\
             Solving for p, Initial residual = 0.4\n",
        )
        .unwrap();

        let (cache, parser) = parser();
        let data = parser.residuals(dir.path(), "log.foamRun");
        assert_eq!(data.series("p"), Some(&[0.4][..]));
        // The bad line still advanced the offset.
        assert_eq!(
            cache.residuals.get(&log).unwrap().offset,
            fs::metadata(&log).unwrap().len()
        );
    }
}
