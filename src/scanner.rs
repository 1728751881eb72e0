//! Directory discovery and `SequenceMeta` derivation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::codec;
use crate::error::{ErrorKind, Result};
use crate::progress::ProgressCoordinator;
use crate::types::SequenceMeta;

const ALLOWED_EXTS: &[&str] = &["tif", "tiff", "png", "bmp", "jpg", "jpeg"];

struct Parsed {
    path: PathBuf,
    prefix: String,
    ext: String,
    digits: String,
    index: u64,
}

/// Splits a filename into `(prefix, trailing-digit-run, lowercased extension)`.
/// Returns `None` if the stem has no trailing decimal run.
fn split_trailing_digits(stem: &str) -> Option<(String, String)> {
    let digit_len = stem.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digit_len == 0 {
        return None;
    }
    let split_at = stem.len() - digit_len;
    Some((stem[..split_at].to_string(), stem[split_at..].to_string()))
}

fn parse_candidates(files: Vec<PathBuf>) -> Vec<Parsed> {
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) => s,
            None => continue,
        };
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let Some((prefix, digits)) = split_trailing_digits(stem) else {
            continue;
        };
        let Ok(index) = digits.parse::<u64>() else {
            continue;
        };
        out.push(Parsed { path, prefix, ext, digits, index });
    }
    out
}

/// Scans `dir` for a CT slice sequence and derives its metadata.
pub fn scan_directory(dir: &Path) -> Result<SequenceMeta> {
    scan_directory_logged(dir, None)
}

/// Same as `scan_directory`, but forwards warn-level events to `log` in
/// addition to `tracing`, for callers that already hold a coordinator.
pub(crate) fn scan_directory_logged(dir: &Path, log: Option<&ProgressCoordinator>) -> Result<SequenceMeta> {
    let files = crate::validate::safe_listdir(dir, ALLOWED_EXTS, log)?;
    if files.len() < 2 {
        return Err(ErrorKind::NoSequence(dir.to_path_buf()));
    }

    let candidates = parse_candidates(files);

    // Group by (prefix, ext, digit width); keep the largest group.
    let mut groups: HashMap<(String, String, usize), Vec<Parsed>> = HashMap::new();
    for c in candidates {
        let key = (c.prefix.clone(), c.ext.clone(), c.digits.len());
        groups.entry(key).or_default().push(c);
    }

    let best = groups
        .into_values()
        .filter(|g| g.len() >= 2)
        .max_by_key(|g| g.len())
        .ok_or_else(|| ErrorKind::NoSequence(dir.to_path_buf()))?;

    let (prefix, extension, index_width) = {
        let first = &best[0];
        (first.prefix.clone(), first.ext.clone(), first.digits.len())
    };

    let seq_begin = best.iter().map(|p| p.index).min().unwrap();
    let seq_end = best.iter().map(|p| p.index).max().unwrap();

    let nominal = seq_end - seq_begin + 1;
    if nominal != best.len() as u64 {
        let msg = format!(
            "sequence in {} has gaps; {} missing indices will be skipped at build time",
            dir.display(),
            nominal - best.len() as u64
        );
        warn!("{msg}");
        if let Some(c) = log {
            c.log(crate::progress::LogLevel::Warn, &msg);
        }
    }

    let mut by_index: HashMap<u64, &PathBuf> = HashMap::new();
    for p in &best {
        by_index.insert(p.index, &p.path);
    }
    let first_path = (seq_begin..=seq_end)
        .find_map(|i| by_index.get(&i).copied())
        .ok_or_else(|| ErrorKind::NoSequence(dir.to_path_buf()))?;

    let (width, height, bit_depth) = codec::probe_logged(first_path, log)?;

    Ok(SequenceMeta {
        prefix,
        extension,
        index_width,
        seq_begin,
        seq_end,
        image_width: width,
        image_height: height,
        bit_depth,
    })
}

/// Builds the ordered, possibly-sparse file list for a discovered sequence:
/// one entry per index in `[seq_begin, seq_end]`, `None` where the file is
/// missing.
pub fn sequence_files(dir: &Path, meta: &SequenceMeta) -> Vec<Option<PathBuf>> {
    (meta.seq_begin..=meta.seq_end)
        .map(|i| {
            let name = format!("{}{:0width$}.{}", meta.prefix, i, meta.extension, width = meta.index_width);
            let path = dir.join(name);
            path.is_file().then_some(path)
        })
        .collect()
}

/// Dense, gap-free list of files directly in `dir` for a level ≥ 1
/// directory (strictly `NNNNNN.tif`, no gaps by the idempotency contract).
pub fn level_files_sorted(dir: &Path, log: Option<&ProgressCoordinator>) -> Result<Vec<PathBuf>> {
    let mut files = crate::validate::safe_listdir(dir, &["tif"], log)?;
    files.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_gray8(path: &Path, w: u32, h: u32) {
        let buf = image::GrayImage::from_pixel(w, h, image::Luma([128u8]));
        buf.save(path).unwrap();
    }

    #[test]
    fn discovers_sequence_and_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        for i in [1, 2, 10] {
            write_gray8(&dir.path().join(format!("slice_{:04}.tif", i)), 8, 8);
        }
        let meta = scan_directory(dir.path()).unwrap();
        assert_eq!(meta.seq_begin, 1);
        assert_eq!(meta.seq_end, 10);
        assert_eq!(meta.index_width, 4);
        assert_eq!(meta.prefix, "slice_");
    }

    #[test]
    fn single_file_fails_no_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write_gray8(&dir.path().join("slice_0001.tif"), 8, 8);
        assert!(matches!(scan_directory(dir.path()), Err(ErrorKind::NoSequence(_))));
    }

    #[test]
    fn gaps_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        write_gray8(&dir.path().join("slice_0001.tif"), 8, 8);
        write_gray8(&dir.path().join("slice_0003.tif"), 8, 8);
        let meta = scan_directory(dir.path()).unwrap();
        assert_eq!(meta.seq_begin, 1);
        assert_eq!(meta.seq_end, 3);
        let files = sequence_files(dir.path(), &meta);
        assert_eq!(files.len(), 3);
        assert!(files[1].is_none());
        let _ = fs::remove_dir_all(dir.path());
    }
}
