//! Narrow, dtype-preserving image I/O.

use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageBuffer, ImageReader, Luma};
use tracing::warn;

use crate::error::{ErrorKind, Result};
use crate::progress::{LogLevel, ProgressCoordinator};
use crate::types::{BitDepth, PixelBuf};

fn open(path: &Path) -> Result<DynamicImage> {
    let reader = ImageReader::open(path).map_err(|e| ErrorKind::io(path, e))?;
    let reader = reader.with_guessed_format().map_err(|e| ErrorKind::io(path, e))?;
    reader.decode().map_err(|e| ErrorKind::decode(path, e))
}

fn log_conversion(path: &Path, log: Option<&ProgressCoordinator>, message: &str) {
    warn!(path = %path.display(), "{message}");
    if let Some(c) = log {
        c.log(LogLevel::Warn, &format!("{}: {message}", path.display()));
    }
}

/// Converts a decoded image to a single-channel buffer, preserving native
/// bit depth where possible. Palette/indexed images become 8-bit grayscale;
/// RGB/RGBA is converted via luminance with a warning.
fn to_pixels(path: &Path, img: DynamicImage, log: Option<&ProgressCoordinator>) -> (PixelBuf, u32, u32) {
    match img {
        DynamicImage::ImageLuma8(gray) => {
            let (w, h) = gray.dimensions();
            (PixelBuf::Eight(gray.into_raw()), w, h)
        }
        DynamicImage::ImageLuma16(gray) => {
            let (w, h) = gray.dimensions();
            (PixelBuf::Sixteen(gray.into_raw()), w, h)
        }
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => {
            log_conversion(path, log, "converting multi-channel 8-bit image to grayscale via luminance");
            let gray = img.to_luma8();
            let (w, h) = gray.dimensions();
            (PixelBuf::Eight(gray.into_raw()), w, h)
        }
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => {
            log_conversion(path, log, "converting multi-channel 16-bit image to grayscale via luminance");
            let gray = img.to_luma16();
            let (w, h) = gray.dimensions();
            (PixelBuf::Sixteen(gray.into_raw()), w, h)
        }
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            log_conversion(path, log, "downconverting float image to 16-bit grayscale");
            let gray = img.to_luma16();
            let (w, h) = gray.dimensions();
            (PixelBuf::Sixteen(gray.into_raw()), w, h)
        }
        other => {
            log_conversion(path, log, "unrecognized pixel mode, converting to 8-bit grayscale");
            let gray = other.to_luma8();
            let (w, h) = gray.dimensions();
            (PixelBuf::Eight(gray.into_raw()), w, h)
        }
    }
}

/// Opens one file and returns `(width, height, pixels)`.
pub fn load(path: &Path) -> Result<(u32, u32, PixelBuf)> {
    load_logged(path, None)
}

/// Same as `load`, but forwards conversion warnings to `log` as well as
/// `tracing`, for callers that already hold a coordinator.
pub(crate) fn load_logged(path: &Path, log: Option<&ProgressCoordinator>) -> Result<(u32, u32, PixelBuf)> {
    let img = open(path)?;
    let (pixels, w, h) = to_pixels(path, img, log);
    Ok((w, h, pixels))
}

/// Probes the first image of a sequence for dimensions and bit depth
/// without keeping the full pixel buffer alive longer than needed.
pub fn probe(path: &Path) -> Result<(u32, u32, BitDepth)> {
    probe_logged(path, None)
}

pub(crate) fn probe_logged(path: &Path, log: Option<&ProgressCoordinator>) -> Result<(u32, u32, BitDepth)> {
    let (w, h, pixels) = load_logged(path, log)?;
    Ok((w, h, pixels.bit_depth()))
}

/// Writes a single-channel buffer as a lossless TIFF, preserving dtype.
pub fn save_tiff(path: &Path, width: u32, height: u32, pixels: &PixelBuf) -> Result<()> {
    match pixels {
        PixelBuf::Eight(buf) => {
            let img = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, buf.clone()).ok_or_else(|| {
                ErrorKind::Dim { expected_w: width as usize, expected_h: height as usize, got_w: 0, got_h: 0 }
            })?;
            img.save(path).map_err(|e| ErrorKind::io(path, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        PixelBuf::Sixteen(buf) => {
            let img = ImageBuffer::<Luma<u16>, _>::from_raw(width, height, buf.clone()).ok_or_else(|| {
                ErrorKind::Dim { expected_w: width as usize, expected_h: height as usize, got_w: 0, got_h: 0 }
            })?;
            img.save(path).map_err(|e| ErrorKind::io(path, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_8bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tif");
        let pixels = PixelBuf::Eight(vec![10u8, 20, 30, 40]);
        save_tiff(&path, 2, 2, &pixels).unwrap();
        let (w, h, loaded) = load(&path).unwrap();
        assert_eq!((w, h), (2, 2));
        assert_eq!(loaded.bit_depth(), BitDepth::Eight);
    }

    #[test]
    fn round_trips_16bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tif");
        let pixels = PixelBuf::Sixteen(vec![1000u16, 2000, 3000, 4000]);
        save_tiff(&path, 2, 2, &pixels).unwrap();
        let (_, _, loaded) = load(&path).unwrap();
        assert_eq!(loaded.bit_depth(), BitDepth::Sixteen);
        match loaded {
            PixelBuf::Sixteen(v) => assert_eq!(v, vec![1000, 2000, 3000, 4000]),
            _ => panic!("expected 16-bit"),
        }
    }
}
