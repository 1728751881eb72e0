//! Pairwise-mean + 2x lateral decimation worker.
//!
//! `downsample_pair` computes the elementwise mean of two equally-shaped
//! slices and top-left-samples the result to half size in one pass. Since
//! decimation only keeps positions `(2i, 2j)`, there is no need to average
//! the full-resolution buffers before subsampling: averaging the two
//! inputs at the kept positions is equivalent and avoids a W×H scratch
//! buffer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::codec;
use crate::error::ErrorKind;
use crate::progress::{LogLevel, ProgressCoordinator};
use crate::types::{BitDepth, PixelBuf, Task, WorkerOutcome, WorkerStatus};

/// `(a + b + 1) / 2`, rounding to nearest.
#[inline]
fn round_avg_u8(a: u8, b: u8) -> u8 {
    (((a as u16) + (b as u16) + 1) >> 1) as u8
}

#[inline]
fn round_avg_u16(a: u16, b: u16) -> u16 {
    (((a as u32) + (b as u32) + 1) >> 1) as u16
}

/// Output dims for a `(w, h)` input under 2x lateral decimation (truncating
/// integer division).
pub fn decimated_dims(w: u32, h: u32) -> (u32, u32) {
    (w / 2, h / 2)
}

fn downsample_pair_u8(a: &[u8], b: &[u8], w: usize, _h: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut out = vec![0u8; dw * dh];
    out.par_chunks_mut(dw).enumerate().for_each(|(i, row)| {
        let src_row = (2 * i) * w;
        for (j, dst) in row.iter_mut().enumerate() {
            let idx = src_row + 2 * j;
            *dst = round_avg_u8(a[idx], b[idx]);
        }
    });
    out
}

fn downsample_pair_u16(a: &[u16], b: &[u16], w: usize, _h: usize, dw: usize, dh: usize) -> Vec<u16> {
    let mut out = vec![0u16; dw * dh];
    out.par_chunks_mut(dw).enumerate().for_each(|(i, row)| {
        let src_row = (2 * i) * w;
        for (j, dst) in row.iter_mut().enumerate() {
            let idx = src_row + 2 * j;
            *dst = round_avg_u16(a[idx], b[idx]);
        }
    });
    out
}

fn decimate_only_u8(a: &[u8], w: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut out = vec![0u8; dw * dh];
    out.par_chunks_mut(dw).enumerate().for_each(|(i, row)| {
        let src_row = (2 * i) * w;
        for (j, dst) in row.iter_mut().enumerate() {
            *dst = a[src_row + 2 * j];
        }
    });
    out
}

fn decimate_only_u16(a: &[u16], w: usize, dw: usize, dh: usize) -> Vec<u16> {
    let mut out = vec![0u16; dw * dh];
    out.par_chunks_mut(dw).enumerate().for_each(|(i, row)| {
        let src_row = (2 * i) * w;
        for (j, dst) in row.iter_mut().enumerate() {
            *dst = a[src_row + 2 * j];
        }
    });
    out
}

/// Converts `pixels` to `expected` depth if it disagrees, logging a warning.
/// Mixed-source datasets occasionally drop in a stray 8-bit or 16-bit slice
/// among otherwise-uniform input; rejecting the pair outright would abort
/// an otherwise-buildable level over one outlier file, so the sequence's
/// declared depth wins and the odd slice is promoted or demoted to match.
fn reconcile_depth(pixels: PixelBuf, expected: BitDepth, log: Option<&ProgressCoordinator>) -> PixelBuf {
    let actual = pixels.bit_depth();
    if actual == expected {
        return pixels;
    }
    let msg = format!("slice bit depth disagrees with sequence ({actual:?} -> {expected:?}), converting before averaging");
    warn!("{msg}");
    if let Some(c) = log {
        c.log(LogLevel::Warn, &msg);
    }
    pixels.to_depth(expected)
}

/// Averages (if `b` is given) and decimates two pixel buffers, reconciling
/// either to `expected_depth` first if it disagrees. Returns `Dim` if shapes
/// disagree or the derived output would be 0x0.
pub fn downsample(
    a: (u32, u32, &PixelBuf),
    b: Option<(u32, u32, &PixelBuf)>,
    expected_depth: BitDepth,
    log: Option<&ProgressCoordinator>,
) -> Result<(u32, u32, PixelBuf), ErrorKind> {
    let (aw, ah, abuf) = a;
    if let Some((bw, bh, _)) = b {
        if aw != bw || ah != bh {
            return Err(ErrorKind::Dim {
                expected_w: aw as usize,
                expected_h: ah as usize,
                got_w: bw as usize,
                got_h: bh as usize,
            });
        }
    }
    let (dw, dh) = decimated_dims(aw, ah);
    if dw == 0 || dh == 0 {
        return Err(ErrorKind::Dim { expected_w: aw as usize, expected_h: ah as usize, got_w: dw as usize, got_h: dh as usize });
    }

    let a_conv = reconcile_depth(abuf.clone(), expected_depth, log);
    let b_conv = b.map(|(_, _, bbuf)| reconcile_depth(bbuf.clone(), expected_depth, log));

    let out = match (&a_conv, &b_conv) {
        (PixelBuf::Eight(av), Some(PixelBuf::Eight(bv))) => {
            PixelBuf::Eight(downsample_pair_u8(av, bv, aw as usize, ah as usize, dw as usize, dh as usize))
        }
        (PixelBuf::Sixteen(av), Some(PixelBuf::Sixteen(bv))) => {
            PixelBuf::Sixteen(downsample_pair_u16(av, bv, aw as usize, ah as usize, dw as usize, dh as usize))
        }
        (PixelBuf::Eight(av), None) => PixelBuf::Eight(decimate_only_u8(av, aw as usize, dw as usize, dh as usize)),
        (PixelBuf::Sixteen(av), None) => PixelBuf::Sixteen(decimate_only_u16(av, aw as usize, dw as usize, dh as usize)),
        _ => unreachable!("both operands reconciled to `expected_depth` above"),
    };
    Ok((dw, dh, out))
}

/// Runs one `Task` end to end: idempotent skip, cancellation checkpoints,
/// load, downsample, save.
pub fn run_task(
    task: &Task,
    expected_w: u32,
    expected_h: u32,
    expected_depth: BitDepth,
    cancel: &AtomicBool,
    retain_pixels: bool,
    log: Option<&ProgressCoordinator>,
) -> WorkerOutcome {
    if existing_output_matches(&task.output, expected_w, expected_h) {
        return WorkerOutcome { out_index: task.out_index, status: WorkerStatus::LoadedExisting, pixels: None };
    }

    // Checkpoint (a): before opening the first input file.
    if cancel.load(Ordering::SeqCst) {
        return cancelled(task.out_index);
    }

    let a = match codec::load_logged(&task.input_a, log) {
        Ok(v) => v,
        Err(e) => return failed(task.out_index, e),
    };
    let b = match &task.input_b {
        Some(p) => match codec::load_logged(p, log) {
            Ok(v) => Some(v),
            Err(e) => return failed(task.out_index, e),
        },
        None => None,
    };

    // Checkpoint (b): after decoding inputs, before computing the mean.
    if cancel.load(Ordering::SeqCst) {
        return cancelled(task.out_index);
    }

    let a_ref = (a.0, a.1, &a.2);
    let b_ref = b.as_ref().map(|(w, h, p)| (*w, *h, p));
    let (out_w, out_h, out_pixels) = match downsample(a_ref, b_ref, expected_depth, log) {
        Ok(v) => v,
        Err(e) => return failed(task.out_index, e),
    };

    if let Some(parent) = task.output.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return failed(task.out_index, ErrorKind::io(parent, e));
        }
    }
    if let Err(e) = codec::save_tiff(&task.output, out_w, out_h, &out_pixels) {
        return failed(task.out_index, e);
    }

    // Checkpoint (c): after writing the output.
    if cancel.load(Ordering::SeqCst) {
        return cancelled(task.out_index);
    }

    debug!(out_index = task.out_index, path = %task.output.display(), "generated level output");

    WorkerOutcome {
        out_index: task.out_index,
        status: WorkerStatus::Generated,
        pixels: if retain_pixels { Some(out_pixels) } else { None },
    }
}

fn existing_output_matches(path: &Path, expected_w: u32, expected_h: u32) -> bool {
    if !path.is_file() {
        return false;
    }
    match codec::probe(path) {
        Ok((w, h, _)) => w == expected_w && h == expected_h,
        Err(_) => false,
    }
}

fn cancelled(out_index: u64) -> WorkerOutcome {
    WorkerOutcome { out_index, status: WorkerStatus::Failed(ErrorKind::Cancelled), pixels: None }
}

fn failed(out_index: u64, e: ErrorKind) -> WorkerOutcome {
    WorkerOutcome { out_index, status: WorkerStatus::Failed(e), pixels: None }
}
