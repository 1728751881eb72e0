//! Drives one pyramid level end to end: task enumeration, resume shortcut,
//! bounded-concurrency dispatch, and result collection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::downsample;
use crate::error::{ErrorKind, Result};
use crate::progress::{LogLevel, ProgressCoordinator};
use crate::types::{BitDepth, Task, WorkerOutcome, WorkerStatus};

/// Number of images kept resident at once per in-flight group, bounding
/// peak memory instead of loading a whole level at once.
const GROUP_MULTIPLIER: usize = 4;

/// Result of building one level.
pub struct LevelOutcome {
    /// One entry per task, in `out_index` order; `None` only if the level
    /// was cancelled before that task ran.
    pub results: Vec<Option<WorkerOutcome>>,
    pub cancelled: bool,
}

/// Builds the `out_index -> (input_a, input_b, output)` task list for a
/// level.
pub fn build_tasks(input_files: &[PathBuf], out_dir: &Path) -> Vec<Task> {
    let n_out = input_files.len().div_ceil(2);
    (0..n_out)
        .map(|k| {
            let i0 = 2 * k;
            let i1 = i0 + 1;
            Task {
                out_index: k as u64,
                input_a: input_files[i0].clone(),
                input_b: input_files.get(i1).cloned(),
                output: out_dir.join(format!("{:06}.tif", k)),
            }
        })
        .collect()
}

fn output_exists_with_dims(path: &Path, expected_w: u32, expected_h: u32) -> bool {
    if !path.is_file() {
        return false;
    }
    matches!(crate::codec::probe(path), Ok((w, h, _)) if w == expected_w && h == expected_h)
}

/// Builds one level: shortcuts to `loaded_existing` if every output already
/// exists, otherwise dispatches tasks onto `pool` in bounded groups.
#[allow(clippy::too_many_arguments)]
pub fn process_level(
    pool: &rayon::ThreadPool,
    tasks: &[Task],
    expected_w: u32,
    expected_h: u32,
    expected_depth: BitDepth,
    cancel: &AtomicBool,
    coordinator: &ProgressCoordinator,
    level_index: u32,
    retain_pixels: bool,
) -> Result<LevelOutcome> {
    let n_out = tasks.len();
    let results: Mutex<Vec<Option<WorkerOutcome>>> = Mutex::new(vec![None; n_out]);

    let all_exist = tasks.iter().all(|t| output_exists_with_dims(&t.output, expected_w, expected_h));
    if all_exist {
        info!(level = level_index, count = n_out, "all outputs already present, skipping dispatch");
        let mut guard = results.lock();
        for task in tasks {
            let outcome = WorkerOutcome { out_index: task.out_index, status: WorkerStatus::LoadedExisting, pixels: None };
            coordinator.report(level_index, task.out_index, &outcome.status);
            guard[task.out_index as usize] = Some(outcome);
        }
        drop(guard);
        return Ok(LevelOutcome { results: results.into_inner(), cancelled: false });
    }

    let group_size = (pool.current_num_threads() * GROUP_MULTIPLIER).max(1);
    let first_failure: Mutex<Option<ErrorKind>> = Mutex::new(None);
    let was_cancelled = AtomicBool::new(false);

    for chunk in tasks.chunks(group_size) {
        if cancel.load(Ordering::SeqCst) {
            was_cancelled.store(true, Ordering::SeqCst);
            break;
        }

        pool.install(|| {
            chunk.par_iter().for_each(|task| {
                let mut outcome =
                    downsample::run_task(task, expected_w, expected_h, expected_depth, cancel, retain_pixels, Some(coordinator));
                coordinator.report(level_index, task.out_index, &outcome.status);

                let is_cancelled = matches!(&outcome.status, WorkerStatus::Failed(e) if e.is_cancelled());
                if is_cancelled {
                    was_cancelled.store(true, Ordering::SeqCst);
                } else if matches!(outcome.status, WorkerStatus::Failed(_)) {
                    let mut holder = first_failure.lock();
                    if holder.is_none() {
                        // Take ownership of the real error instead of stringifying it into a
                        // synthetic wrapper: `ErrorKind` has non-`Clone` sources (`io::Error`,
                        // `image::ImageError`), so this is the only way to preserve the variant.
                        if let WorkerStatus::Failed(inner) = std::mem::replace(&mut outcome.status, WorkerStatus::SkippedDuplicate) {
                            *holder = Some(ErrorKind::Worker { out_index: outcome.out_index, source: Box::new(inner) });
                        }
                    }
                }

                let mut guard = results.lock();
                let slot = &mut guard[task.out_index as usize];
                if slot.is_some() {
                    let msg = format!("level {level_index}: duplicate outcome discarded for output index {}", task.out_index);
                    warn!("{msg}");
                    coordinator.log(LogLevel::Warn, &msg);
                } else {
                    *slot = Some(outcome);
                }
            });
        });

        if was_cancelled.load(Ordering::SeqCst) || first_failure.lock().is_some() {
            break;
        }
    }

    if let Some(e) = first_failure.into_inner() {
        return Err(e);
    }

    Ok(LevelOutcome { results: results.into_inner(), cancelled: was_cancelled.into_inner() })
}
