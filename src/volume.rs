//! Maps a normalized ROI across pyramid levels and crops the cached
//! smallest volume.

use crate::types::{LevelInfo, Volume3D, VolumeRoi};

struct PixelRoi {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    z0: u64,
    z1: u64,
}

/// Maps `roi` (normalized to level 0) onto `smallest`'s pixel grid.
fn map_roi(roi: &VolumeRoi, level0_slice_count: u64, smallest: &LevelInfo) -> PixelRoi {
    let roi = roi.normalized(level0_slice_count);
    // `s = 2^level_index`, not the ratio of slice counts: an odd slice count
    // at an intermediate level (e.g. 15 -> 8 -> 4) makes that ratio diverge
    // from the power-of-two the lateral halving actually used.
    let s = 2u64.pow(smallest.level_index) as f64;

    let width = smallest.width as f64;
    let height = smallest.height as f64;
    let x0 = (roi.x0 * width).floor() as u32;
    let y0 = (roi.y0 * height).floor() as u32;
    let x1 = ((roi.x1 * width).ceil() as u32).min(smallest.width);
    let y1 = ((roi.y1 * height).ceil() as u32).min(smallest.height);

    let z0 = (roi.z_bottom as f64 / s).floor() as u64;
    let z1 = (((roi.z_top + 1) as f64 / s).ceil() as u64).min(smallest.slice_count);

    PixelRoi { x0, y0, x1, y1, z0, z1 }
}

/// Crops `volume` (the smallest cached level) to `roi`, which is specified
/// in normalized level-0 coordinates plus an explicit slice range.
pub fn crop_volume(volume: &Volume3D, level0_slice_count: u64, smallest: &LevelInfo, roi: &VolumeRoi) -> Volume3D {
    let r = map_roi(roi, level0_slice_count, smallest);
    let (_, full_h, full_w) = volume.shape();
    let out_w = r.x1.saturating_sub(r.x0) as usize;
    let out_h = r.y1.saturating_sub(r.y0) as usize;
    let out_z = r.z1.saturating_sub(r.z0) as usize;

    macro_rules! crop {
        ($data:expr) => {{
            let mut out = Vec::with_capacity(out_z * out_h * out_w);
            for z in r.z0..r.z1 {
                for y in r.y0..r.y1 {
                    let row_start = (z * full_h as u64 + y as u64) as usize * full_w as usize + r.x0 as usize;
                    out.extend_from_slice(&$data[row_start..row_start + out_w]);
                }
            }
            out
        }};
    }

    match volume {
        Volume3D::Eight { data, .. } => Volume3D::Eight { data: crop!(data), shape: (out_z as u64, out_h as u32, out_w as u32) },
        Volume3D::Sixteen { data, .. } => Volume3D::Sixteen { data: crop!(data), shape: (out_z as u64, out_h as u32, out_w as u32) },
    }
}
