//! Path sanitation and sandbox enforcement.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{ErrorKind, Result};
use crate::progress::{LogLevel, ProgressCoordinator};

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Rejects filenames containing `..`, path separators, NUL bytes,
/// Windows-reserved characters, or an absolute path.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ErrorKind::Security { path: PathBuf::from(name), reason: "empty filename" });
    }
    if name.contains('\0') {
        return Err(ErrorKind::Security { path: PathBuf::from(name), reason: "NUL byte in filename" });
    }
    if name.contains("..") {
        return Err(ErrorKind::Security { path: PathBuf::from(name), reason: "path traversal segment" });
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ErrorKind::Security { path: PathBuf::from(name), reason: "path separator in filename" });
    }
    if name.chars().any(|c| RESERVED_CHARS.contains(&c)) {
        return Err(ErrorKind::Security { path: PathBuf::from(name), reason: "reserved character in filename" });
    }
    if Path::new(name).is_absolute() {
        return Err(ErrorKind::Security { path: PathBuf::from(name), reason: "absolute path" });
    }
    Ok(())
}

/// Resolves symlinks on both paths and fails unless `candidate` canonicalizes
/// to a descendant of canonical(`base`).
pub fn validate_inside(base: &Path, candidate: &Path) -> Result<PathBuf> {
    let canon_base = fs::canonicalize(base).map_err(|e| ErrorKind::io(base, e))?;
    let canon_candidate = fs::canonicalize(candidate).map_err(|e| ErrorKind::io(candidate, e))?;

    if !canon_candidate.starts_with(&canon_base) {
        return Err(ErrorKind::Security {
            path: candidate.to_path_buf(),
            reason: "resolves outside the source directory",
        });
    }
    // Defense in depth: reject any remaining `..` component even though
    // canonicalize() already resolved them away on a real filesystem.
    if canon_candidate.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ErrorKind::Security {
            path: candidate.to_path_buf(),
            reason: "unresolved parent directory component",
        });
    }
    Ok(canon_candidate)
}

/// Returns a sorted list of directory entries whose filename passes
/// `validate_filename` and whose lowercased extension is in `allowed_exts`.
/// Entries that fail either check are skipped with a warning, not an error.
pub fn safe_listdir(dir: &Path, allowed_exts: &[&str], log: Option<&ProgressCoordinator>) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| ErrorKind::io(dir, e))?;
    let mut out = Vec::new();

    macro_rules! skip {
        ($($arg:tt)*) => {{
            let msg = format!($($arg)*);
            warn!("{msg}");
            if let Some(c) = log {
                c.log(LogLevel::Warn, &msg);
            }
        }};
    }

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                skip!("skipping unreadable directory entry in {}: {e}", dir.display());
                continue;
            }
        };
        let path = entry.path();
        // `file_type()` follows symlinks, so a symlink to a file is still
        // listed here; `validate_inside` below is what catches it escaping.
        if !entry.file_type().map(|t| t.is_file() || t.is_symlink()).unwrap_or(false) {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => {
                skip!("skipping non-UTF-8 filename: {}", path.display());
                continue;
            }
        };
        if let Err(e) = validate_filename(name) {
            skip!("skipping unsafe filename {}: {e}", path.display());
            continue;
        }
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| allowed_exts.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if !ext_ok {
            continue;
        }
        if let Err(e) = validate_inside(dir, &path) {
            skip!("skipping entry outside sandbox {}: {e}", path.display());
            continue;
        }
        out.push(path);
    }

    out.sort();
    Ok(out)
}
