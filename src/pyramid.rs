//! Drives level construction end to end and assembles the smallest-level
//! volume.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tracing::info;

use crate::error::{ErrorKind, Result};
use crate::level::{self, LevelOutcome};
use crate::progress::ProgressCoordinator;
use crate::types::{BitDepth, LevelInfo, PixelBuf, PyramidResult, SequenceMeta, Volume3D, WorkerStatus};

const THUMBNAIL_DIR_NAME: &str = ".thumbnail";

/// Smallest `L` such that `min(width, height) / 2^L <= max_thumbnail_size`,
/// bounded below by 1 so a build always produces at least one level.
pub fn target_level_count(width: u32, height: u32, max_thumbnail_size: u32) -> u32 {
    let min_side = width.min(height).max(1);
    let mut levels = 0u32;
    let mut side = min_side;
    while side > max_thumbnail_size.max(1) {
        side /= 2;
        levels += 1;
        if side == 0 {
            break;
        }
    }
    levels.max(1)
}

fn level_dir(source_dir: &Path, level_index: u32) -> PathBuf {
    source_dir.join(THUMBNAIL_DIR_NAME).join(level_index.to_string())
}

/// Builds every level from 0 up to the target level count, returning
/// per-level metadata and, optionally, the smallest level as a dense volume.
#[allow(clippy::too_many_arguments)]
pub fn build_pyramid(
    source_dir: &Path,
    meta: &SequenceMeta,
    level0_files: Vec<Option<PathBuf>>,
    pool: &rayon::ThreadPool,
    cancel: &AtomicBool,
    coordinator: &ProgressCoordinator,
    max_thumbnail_size: u32,
    retain_smallest: bool,
) -> Result<PyramidResult> {
    let target = target_level_count(meta.image_width, meta.image_height, max_thumbnail_size);

    let mut levels = vec![LevelInfo {
        level_index: 0,
        width: meta.image_width,
        height: meta.image_height,
        slice_count: meta.nominal_count(),
        dir: source_dir.to_path_buf(),
    }];

    // Level 0's file list can contain gaps from missing indices; only the
    // present paths participate as inputs. Every level after that is dense,
    // since outputs are always written at contiguous indices.
    let mut current_files: Vec<PathBuf> = level0_files.into_iter().flatten().collect();
    let mut cancelled = false;

    for l in 0..target {
        let prev = levels.last().unwrap().clone();
        let out_dir = level_dir(source_dir, l + 1);
        std::fs::create_dir_all(&out_dir).map_err(|e| ErrorKind::io(&out_dir, e))?;

        let (out_w, out_h) = crate::downsample::decimated_dims(prev.width, prev.height);
        if out_w == 0 || out_h == 0 {
            break;
        }

        let tasks = level::build_tasks(&current_files, &out_dir);
        coordinator.emit_boundary(&format!("level {}: {} slices", l + 1, tasks.len()));
        info!(level = l + 1, tasks = tasks.len(), dir = %out_dir.display(), "building level");

        let outcome: LevelOutcome =
            level::process_level(pool, &tasks, out_w, out_h, meta.bit_depth, cancel, coordinator, l + 1, false)?;

        levels.push(LevelInfo { level_index: l + 1, width: out_w, height: out_h, slice_count: tasks.len() as u64, dir: out_dir.clone() });

        if outcome.cancelled {
            cancelled = true;
            break;
        }

        current_files = (0..tasks.len() as u64).map(|k| out_dir.join(format!("{:06}.tif", k))).collect();
    }

    let smallest_volume = if retain_smallest && !cancelled {
        let smallest = levels.last().unwrap();
        Some(load_volume(smallest, Some(coordinator))?)
    } else {
        None
    };

    Ok(PyramidResult { levels, smallest_volume, cancelled })
}

/// Loads every slice of `level` in ascending order into one dense array.
fn load_volume(level: &LevelInfo, log: Option<&ProgressCoordinator>) -> Result<Volume3D> {
    let files = if level.level_index == 0 {
        crate::scanner::level_files_sorted(&level.dir, log).unwrap_or_default()
    } else {
        (0..level.slice_count).map(|k| level.dir.join(format!("{:06}.tif", k))).collect()
    };

    let mut bit_depth: Option<BitDepth> = None;
    let mut eight: Vec<u8> = Vec::new();
    let mut sixteen: Vec<u16> = Vec::new();

    for path in &files {
        let (w, h, pixels) = crate::codec::load_logged(path, log)?;
        if w != level.width || h != level.height {
            return Err(ErrorKind::Dim { expected_w: level.width as usize, expected_h: level.height as usize, got_w: w as usize, got_h: h as usize });
        }
        // The first slice's depth is authoritative for the rest of the
        // level; a stray mismatched slice is converted rather than aborting
        // the whole volume load.
        let target = *bit_depth.get_or_insert_with(|| pixels.bit_depth());
        if pixels.bit_depth() != target {
            let msg = format!("slice {} depth disagrees with level ({:?} -> {target:?}), converting", path.display(), pixels.bit_depth());
            tracing::warn!("{msg}");
            if let Some(c) = log {
                c.log(crate::progress::LogLevel::Warn, &msg);
            }
        }
        match pixels.to_depth(target) {
            PixelBuf::Eight(v) => eight.extend(v),
            PixelBuf::Sixteen(v) => sixteen.extend(v),
        }
    }

    let shape = (files.len() as u64, level.height, level.width);
    Ok(match bit_depth.unwrap_or(BitDepth::Eight) {
        BitDepth::Eight => Volume3D::Eight { data: eight, shape },
        BitDepth::Sixteen => Volume3D::Sixteen { data: sixteen, shape },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_level_count_stops_at_max_thumbnail_size() {
        assert_eq!(target_level_count(1024, 1024, 128), 3);
        assert_eq!(target_level_count(100, 100, 50), 1);
    }

    #[test]
    fn target_level_count_never_zero() {
        assert_eq!(target_level_count(64, 64, 1024), 1);
    }

    #[test]
    fn target_level_count_handles_non_square() {
        assert_eq!(target_level_count(513, 300, 128), target_level_count(300, 300, 128));
    }

    #[test]
    fn builds_small_pyramid_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8u8 {
            let p = dir.path().join(format!("slice_{:04}.tif", i));
            let buf = image::GrayImage::from_pixel(8, 8, image::Luma([i * 10]));
            buf.save(&p).unwrap();
        }
        let meta = crate::scanner::scan_directory(dir.path()).unwrap();
        let files = crate::scanner::sequence_files(dir.path(), &meta);

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let cancel = AtomicBool::new(false);
        let coordinator = ProgressCoordinator::new(None, 20, None);
        coordinator.configure_levels(&[8, 4, 2]);

        let result = build_pyramid(dir.path(), &meta, files, &pool, &cancel, &coordinator, 1, true).unwrap();
        assert_eq!(result.levels.len(), 4);
        assert_eq!(result.levels[1].width, 4);
        assert_eq!(result.levels[2].width, 2);
        assert_eq!(result.levels[3].width, 1);
        assert!(!result.cancelled);
        let volume = result.smallest_volume.unwrap();
        assert_eq!(volume.shape(), (1, 1, 1));
    }
}
