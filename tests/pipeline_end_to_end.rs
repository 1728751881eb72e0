//! End-to-end scenarios for the pyramid pipeline, mirroring the concrete
//! cases enumerated against the upstream specification's testable
//! properties: even/odd slice counts, resume, cancellation, ROI cropping,
//! and a malicious filename.

use std::fs;
use std::path::Path;

use ctpyramid::{build_pyramid, scan_directory, BuildOptions, Callbacks, ErrorKind};

fn write_gray8(path: &Path, w: u32, h: u32, value: u8) {
    let buf = image::GrayImage::from_pixel(w, h, image::Luma([value]));
    buf.save(path).unwrap();
}

fn write_gray16(path: &Path, w: u32, h: u32, value: u16) {
    let buf = image::ImageBuffer::<image::Luma<u16>, _>::from_pixel(w, h, image::Luma([value]));
    buf.save(path).unwrap();
}

#[test]
fn happy_path_even_slice_count() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=16u32 {
        write_gray8(&dir.path().join(format!("slice_{:04}.tif", i)), 64, 64, (i % 255) as u8);
    }

    let opts = BuildOptions { max_thumbnail_size: 8, worker_count: Some(2), ..BuildOptions::default() };
    let result = build_pyramid(dir.path(), &opts, Callbacks::default()).unwrap();

    assert!(!result.cancelled);
    // level0=64, level1=32, level2=16, level3=8 -> stop (min side 8 <= 8)
    assert_eq!(result.levels.len(), 4);
    assert_eq!(result.levels[1].width, 32);
    assert_eq!(result.levels[2].width, 16);
    assert_eq!(result.levels[3].width, 8);
    assert_eq!(result.levels[3].slice_count, 2);

    let volume = result.smallest_volume.unwrap();
    assert_eq!(volume.shape(), (2, 8, 8));
}

#[test]
fn odd_tail_produces_single_input_output() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=7u32 {
        write_gray16(&dir.path().join(format!("slice_{:03}.tif", i)), 20, 20, (i * 1000) as u16);
    }

    let opts = BuildOptions { max_thumbnail_size: 10, worker_count: Some(2), ..BuildOptions::default() };
    let result = build_pyramid(dir.path(), &opts, Callbacks::default()).unwrap();

    assert_eq!(result.levels.len(), 2);
    assert_eq!(result.levels[1].slice_count, 4);
    assert_eq!(result.levels[1].width, 10);

    let volume = result.smallest_volume.unwrap();
    assert_eq!(volume.shape(), (4, 10, 10));
    match volume {
        ctpyramid::Volume3D::Sixteen { .. } => {}
        _ => panic!("expected 16-bit volume"),
    }
}

#[test]
fn rerun_resumes_via_existing_outputs() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=8u32 {
        write_gray8(&dir.path().join(format!("slice_{:03}.tif", i)), 16, 16, i as u8);
    }
    let opts = BuildOptions { max_thumbnail_size: 4, worker_count: Some(2), ..BuildOptions::default() };

    let first = build_pyramid(dir.path(), &opts, Callbacks::default()).unwrap();
    assert!(!first.cancelled);

    let second = build_pyramid(dir.path(), &opts, Callbacks::default()).unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.levels.len(), first.levels.len());
    for (a, b) in first.levels.iter().zip(second.levels.iter()) {
        assert_eq!((a.width, a.height, a.slice_count), (b.width, b.height, b.slice_count));
    }
}

#[test]
fn cancel_mid_build_is_reported_without_error() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=16u32 {
        write_gray8(&dir.path().join(format!("slice_{:04}.tif", i)), 32, 32, i as u8);
    }
    let opts = BuildOptions { max_thumbnail_size: 4, worker_count: Some(2), ..BuildOptions::default() };

    let callbacks = Callbacks { on_progress: Some(Box::new(|_pct| false)), on_detail: None, on_log: None };
    let result = build_pyramid(dir.path(), &opts, callbacks).unwrap();

    assert!(result.cancelled);
    assert!(result.smallest_volume.is_none());
}

#[test]
fn roi_crop_matches_worked_example() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=64u32 {
        write_gray8(&dir.path().join(format!("slice_{:04}.tif", i)), 128, 128, (i % 255) as u8);
    }
    let opts = BuildOptions { max_thumbnail_size: 16, worker_count: Some(2), ..BuildOptions::default() };
    let result = build_pyramid(dir.path(), &opts, Callbacks::default()).unwrap();

    let smallest_level = result.levels.last().unwrap().clone();
    let volume = result.smallest_volume.unwrap();
    let roi = ctpyramid::VolumeRoi { x0: 0.25, y0: 0.25, x1: 0.75, y1: 0.75, z_bottom: 16, z_top: 47 };

    let cropped = ctpyramid::crop_volume(&volume, 64, &smallest_level, &roi);
    let (z, h, w) = cropped.shape();
    assert_eq!((z, h, w), (4, smallest_level.width / 2, smallest_level.height / 2));
}

#[test]
#[cfg(unix)]
fn malicious_symlink_entry_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=4u32 {
        write_gray8(&dir.path().join(format!("slice_{:02}.tif", i)), 8, 8, i as u8);
    }

    // A 5th file that matches the sequence's naming pattern but is a
    // symlink escaping the source directory.
    let outside = tempfile::tempdir().unwrap();
    fs::write(outside.path().join("passwd"), b"root:x:0:0").unwrap();
    std::os::unix::fs::symlink(outside.path().join("passwd"), dir.path().join("slice_05.tif")).unwrap();

    let meta = scan_directory(dir.path()).unwrap();
    assert_eq!(meta.seq_begin, 1);
    assert_eq!(meta.seq_end, 4);
}

#[test]
fn single_image_directory_fails_no_sequence() {
    let dir = tempfile::tempdir().unwrap();
    write_gray8(&dir.path().join("slice_01.tif"), 8, 8, 1);
    let err = scan_directory(dir.path());
    assert!(matches!(err, Err(ErrorKind::NoSequence(_))));
}
