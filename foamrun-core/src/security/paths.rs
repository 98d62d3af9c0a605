use crate::error::{CoreError, Result};
use normpath::PathExt;
use std::path::{Component, Path, PathBuf};

/// Hidden-name prefix the startup permission probe is allowed to use.
pub const PERMISSION_PROBE_PREFIX: &str = ".permission_test_";

/// Resolve `user` against `base` and require the result to exist.
///
/// Rejects traversal sequences and hidden segments before touching the
/// filesystem, then canonicalizes and verifies the result stays under
/// `base` by normalized component comparison.
pub fn resolve(base: &Path, user: &str) -> Result<PathBuf> {
    let resolved = resolve_new(base, user)?;
    if !resolved.exists() {
        return Err(CoreError::NotFound("path does not exist".into()));
    }
    Ok(resolved)
}

/// Like [`resolve`] but the leaf may not exist yet (file creation); every
/// existing ancestor still has its symlinks resolved and checked.
pub fn resolve_new(base: &Path, user: &str) -> Result<PathBuf> {
    if user.contains("..") {
        return Err(CoreError::InvalidPath(
            "traversal characters detected".into(),
        ));
    }
    reject_hidden_segments(Path::new(user))?;

    let real_base = base
        .normalize()
        .map_err(|_| CoreError::InvalidPath("invalid base path".into()))?
        .into_path_buf();

    let candidate = if Path::new(user).is_absolute() {
        PathBuf::from(user)
    } else {
        real_base.join(user)
    };
    let real = realpath_allow_missing(&candidate)
        .map_err(|_| CoreError::InvalidPath("invalid path structure".into()))?;

    if !is_same_or_descendant(&real, &real_base) {
        return Err(CoreError::InvalidPath(
            "path escapes the configured root".into(),
        ));
    }
    Ok(real)
}

/// Join untrusted components onto a trusted base, validating each one.
/// The result is not required to exist.
pub fn safe_join<I, S>(base: &Path, parts: I) -> Result<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut joined = PathBuf::new();
    for part in parts {
        let part = part.as_ref();
        if part.contains("..") {
            return Err(CoreError::InvalidPath(
                "traversal characters detected".into(),
            ));
        }
        joined.push(part);
    }
    resolve_new(base, &joined.to_string_lossy())
}

/// Refuse to use the filesystem root, the user's home directory, or a
/// well-known system directory as a case root.
pub fn assert_safe_root(path: &Path) -> Result<()> {
    let real = realpath_allow_missing(path).unwrap_or_else(|_| path.to_path_buf());

    if real.parent().is_none() {
        return Err(CoreError::UnsafeRoot("filesystem root".into()));
    }

    if let Some(home) = home_dir() {
        if paths_equal(&real, &home) {
            return Err(CoreError::UnsafeRoot("home directory".into()));
        }
    }

    for sys in ["/etc", "/bin", "/usr", "/var", "/proc"] {
        let sys = Path::new(sys);
        if paths_equal(&real, sys) || is_same_or_descendant(&real, sys) {
            return Err(CoreError::UnsafeRoot("system directory".into()));
        }
    }

    let lowered = real.to_string_lossy().to_lowercase();
    if lowered.starts_with("c:\\windows") || lowered.starts_with("c:\\program files") {
        return Err(CoreError::UnsafeRoot("system directory".into()));
    }

    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

fn reject_hidden_segments(path: &Path) -> Result<()> {
    for component in path.components() {
        if let Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if name.starts_with('.') && !name.starts_with(PERMISSION_PROBE_PREFIX) {
                return Err(CoreError::InvalidPath("hidden path segment".into()));
            }
        }
    }
    Ok(())
}

/// Canonicalize the longest existing prefix of `path`, then re-attach the
/// missing tail. Traversal components were rejected before this point, so
/// the textual tail cannot climb back out.
fn realpath_allow_missing(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut real = std::fs::canonicalize(&existing)?;
    for name in tail.iter().rev() {
        real.push(name);
    }
    Ok(real)
}

fn paths_equal(a: &Path, b: &Path) -> bool {
    normalize_case(a) == normalize_case(b)
}

/// Component-wise prefix test, case-folded where the platform demands it.
fn is_same_or_descendant(path: &Path, base: &Path) -> bool {
    normalize_case(path).starts_with(normalize_case(base))
}

#[cfg(windows)]
fn normalize_case(p: &Path) -> PathBuf {
    PathBuf::from(p.to_string_lossy().to_lowercase())
}

#[cfg(not(windows))]
fn normalize_case(p: &Path) -> PathBuf {
    p.to_path_buf()
}
