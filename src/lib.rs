//! `ctpyramid` builds a multi-resolution LoD pyramid from a directory of
//! ordered CT slice images: sequence discovery, pairwise downsampling with
//! bounded concurrency, weighted cross-level progress with ETA, cooperative
//! cancellation, and ROI-based volume cropping.

mod codec;
mod downsample;
mod error;
mod level;
mod progress;
mod pyramid;
mod scanner;
mod types;
mod validate;
mod volume;

pub use error::{ErrorKind, Result};
pub use progress::{Callbacks, LogLevel, ProgressCoordinator};
pub use types::{
    BitDepth, LevelInfo, PixelBuf, PyramidResult, SequenceMeta, Task, Volume3D, VolumeRoi, WorkerOutcome, WorkerStatus,
};

/// Host-tunable knobs for one `build_pyramid` call.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Stop building further levels once `min(width, height) <= this`.
    pub max_thumbnail_size: u32,
    /// Whether to load the smallest level into memory on completion.
    pub retain_smallest: bool,
    /// Tasks sampled per ETA stage (clamped to `[1, 100]`).
    pub sample_size: u32,
    /// Worker pool size; `None` lets the builder choose `min(cores, 8)`.
    pub worker_count: Option<u32>,
    /// A previously-measured throughput (tasks/sec) to seed the ETA sampler,
    /// skipping its bootstrap/refine stages.
    pub seeded_speed: Option<f64>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions { max_thumbnail_size: 512, retain_smallest: true, sample_size: 20, worker_count: None, seeded_speed: None }
    }
}

const MAX_WORKERS: usize = 8;

fn worker_count(opts: &BuildOptions) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    opts.worker_count.map(|n| n as usize).unwrap_or(cores).clamp(1, MAX_WORKERS)
}

fn level_in_counts(meta: &SequenceMeta, max_thumbnail_size: u32) -> Vec<u64> {
    let target = pyramid::target_level_count(meta.image_width, meta.image_height, max_thumbnail_size);
    let mut counts = Vec::with_capacity(target as usize);
    let mut n = meta.nominal_count();
    for _ in 0..target {
        counts.push(n);
        n = n.div_ceil(2);
    }
    counts
}

/// Discovers the CT slice sequence in `source_dir`, for callers that just
/// want the metadata without running a full build.
pub fn scan_directory(source_dir: &std::path::Path) -> Result<SequenceMeta> {
    scanner::scan_directory(source_dir)
}

/// Crops a ROI from the smallest cached volume against the original
/// level-0 geometry.
pub fn crop_volume(volume: &Volume3D, level0_slice_count: u64, smallest_level: &LevelInfo, roi: &VolumeRoi) -> Volume3D {
    volume::crop_volume(volume, level0_slice_count, smallest_level, roi)
}

/// Builds the full pyramid for `source_dir`: scans the sequence, then
/// builds each level in turn until the smallest side falls at or below
/// `opts.max_thumbnail_size`.
///
/// Returns `Err` only for pre-dispatch failures (`Security`, `NoSequence`)
/// or a worker failure that blocks level completion; cooperative
/// cancellation is reported via `PyramidResult::cancelled`, never as `Err`.
pub fn build_pyramid(source_dir: &std::path::Path, opts: &BuildOptions, callbacks: Callbacks) -> Result<PyramidResult> {
    let sample_size = opts.sample_size.clamp(1, 100);
    let coordinator = ProgressCoordinator::new(Some(callbacks), sample_size, opts.seeded_speed);
    let cancel = coordinator.cancel_handle();

    let meta = scanner::scan_directory_logged(source_dir, Some(&coordinator))?;
    let in_counts = level_in_counts(&meta, opts.max_thumbnail_size);
    coordinator.configure_levels(&in_counts);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count(opts))
        .build()
        .map_err(|e| error::ErrorKind::io(source_dir, std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

    let level0_files = scanner::sequence_files(source_dir, &meta);

    pyramid::build_pyramid(
        source_dir,
        &meta,
        level0_files,
        &pool,
        &cancel,
        &coordinator,
        opts.max_thumbnail_size,
        opts.retain_smallest,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_spec() {
        let opts = BuildOptions::default();
        assert_eq!(opts.max_thumbnail_size, 512);
        assert!(opts.retain_smallest);
        assert_eq!(opts.sample_size, 20);
        assert_eq!(opts.worker_count, None);
    }

    #[test]
    fn worker_count_is_capped_at_eight() {
        let opts = BuildOptions { worker_count: Some(64), ..BuildOptions::default() };
        assert_eq!(worker_count(&opts), 8);
    }

    #[test]
    fn worker_count_defaults_within_bounds() {
        let opts = BuildOptions::default();
        let n = worker_count(&opts);
        assert!(n >= 1 && n <= 8);
    }

    #[test]
    fn build_pyramid_end_to_end_even_counts() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..16u8 {
            let p = dir.path().join(format!("slice_{:04}.tif", i));
            let buf = image::GrayImage::from_pixel(16, 16, image::Luma([i * 15]));
            buf.save(&p).unwrap();
        }
        let opts = BuildOptions { max_thumbnail_size: 4, worker_count: Some(2), ..BuildOptions::default() };
        let result = build_pyramid(dir.path(), &opts, Callbacks::default()).unwrap();
        assert!(!result.cancelled);
        assert!(result.levels.len() >= 2);
        assert!(result.smallest_volume.is_some());
    }

    #[test]
    fn build_pyramid_fails_fast_on_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_pyramid(dir.path(), &BuildOptions::default(), Callbacks::default());
        assert!(matches!(err, Err(ErrorKind::NoSequence(_))));
    }

    #[test]
    fn cancellation_is_reported_without_err() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..16u8 {
            let p = dir.path().join(format!("slice_{:04}.tif", i));
            let buf = image::GrayImage::from_pixel(16, 16, image::Luma([i * 15]));
            buf.save(&p).unwrap();
        }
        let mut first_call = true;
        let callbacks = Callbacks {
            on_progress: Some(Box::new(move |_pct| {
                if first_call {
                    first_call = false;
                    false
                } else {
                    true
                }
            })),
            on_detail: None,
            on_log: None,
        };
        let opts = BuildOptions { max_thumbnail_size: 4, worker_count: Some(2), ..BuildOptions::default() };
        let result = build_pyramid(dir.path(), &opts, callbacks).unwrap();
        assert!(result.cancelled);
        assert!(result.smallest_volume.is_none());
    }
}
