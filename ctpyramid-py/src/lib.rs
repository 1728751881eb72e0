//! Python bindings for `ctpyramid`, preserving the `ct_thumbnail` module
//! name and `build_thumbnails(input_dir, progress_cb)` surface this crate's
//! ancestor exposed, rebuilt on top of the typed core API.

use std::path::PathBuf;

use numpy::IntoPyArray;
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyModule;
use pyo3::Bound;

use ctpyramid::{build_pyramid, BuildOptions, Callbacks, ErrorKind, LevelInfo, PyramidResult, Volume3D, VolumeRoi};

fn to_pyerr(e: ErrorKind) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

#[pyclass]
struct PyPyramidResult {
    #[pyo3(get)]
    cancelled: bool,
    #[pyo3(get)]
    level_widths: Vec<u32>,
    #[pyo3(get)]
    level_heights: Vec<u32>,
    #[pyo3(get)]
    level_slice_counts: Vec<u64>,
    volume: Option<Volume3D>,
}

#[pymethods]
impl PyPyramidResult {
    /// Returns the smallest retained level as a dense NumPy array, or
    /// `None` if `retain_smallest` was disabled or the build was cancelled.
    fn smallest_volume<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyAny>> {
        match self.volume.as_ref()? {
            Volume3D::Eight { data, shape } => {
                let arr = ndarray_from_flat(data.clone(), *shape);
                Some(arr.into_pyarray(py).into_any())
            }
            Volume3D::Sixteen { data, shape } => {
                let arr = ndarray_from_flat(data.clone(), *shape);
                Some(arr.into_pyarray(py).into_any())
            }
        }
    }
}

fn ndarray_from_flat<T>(data: Vec<T>, shape: (u64, u32, u32)) -> ndarray::Array3<T> {
    let (z, h, w) = (shape.0 as usize, shape.1 as usize, shape.2 as usize);
    ndarray::Array3::from_shape_vec((z, h, w), data).expect("flat buffer matches declared shape")
}

impl From<PyramidResult> for PyPyramidResult {
    fn from(r: PyramidResult) -> Self {
        PyPyramidResult {
            cancelled: r.cancelled,
            level_widths: r.levels.iter().map(|l| l.width).collect(),
            level_heights: r.levels.iter().map(|l| l.height).collect(),
            level_slice_counts: r.levels.iter().map(|l| l.slice_count).collect(),
            volume: r.smallest_volume,
        }
    }
}

/// Builds the LoD pyramid for `input_dir`, invoking `progress_cb(percentage)`
/// after each progress tick; returning `False` from the callback requests
/// cooperative cancellation.
#[pyfunction]
#[pyo3(signature = (input_dir, max_thumbnail_size=512, retain_smallest=true, progress_cb=None))]
fn build_thumbnails(
    py: Python<'_>,
    input_dir: String,
    max_thumbnail_size: u32,
    retain_smallest: bool,
    progress_cb: Option<PyObject>,
) -> PyResult<PyPyramidResult> {
    let opts = BuildOptions { max_thumbnail_size, retain_smallest, ..BuildOptions::default() };

    let callbacks = match progress_cb {
        Some(cb) => Callbacks {
            on_progress: Some(Box::new(move |pct| {
                Python::with_gil(|py| match cb.call1(py, (pct,)) {
                    Ok(result) => result.extract::<bool>(py).unwrap_or(true),
                    Err(_) => true,
                })
            })),
            on_detail: None,
            on_log: None,
        },
        None => Callbacks::default(),
    };

    py.allow_threads(|| build_pyramid(&PathBuf::from(input_dir), &opts, callbacks))
        .map(PyPyramidResult::from)
        .map_err(to_pyerr)
}

/// Scans `input_dir` for a CT slice sequence, returning
/// `(width, height, bit_depth, seq_begin, seq_end)`.
#[pyfunction]
fn scan_directory(input_dir: String) -> PyResult<(u32, u32, u32, u64, u64)> {
    let meta = ctpyramid::scan_directory(&PathBuf::from(input_dir)).map_err(to_pyerr)?;
    Ok((meta.image_width, meta.image_height, meta.bit_depth.bits(), meta.seq_begin, meta.seq_end))
}

/// Crops `result`'s retained smallest-level volume to a ROI given in
/// normalized level-0 coordinates plus an explicit slice range, returning a
/// dense NumPy array. Raises if `result` was built with `retain_smallest`
/// disabled or the build was cancelled before a volume was assembled.
#[pyfunction]
#[pyo3(signature = (result, level0_slice_count, x0, y0, x1, y1, z_bottom, z_top))]
fn crop_volume<'py>(
    py: Python<'py>,
    result: &PyPyramidResult,
    level0_slice_count: u64,
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    z_bottom: u64,
    z_top: u64,
) -> PyResult<Bound<'py, PyAny>> {
    let volume = result.volume.as_ref().ok_or_else(|| PyRuntimeError::new_err("result has no retained volume to crop"))?;
    let width = *result.level_widths.last().ok_or_else(|| PyRuntimeError::new_err("pyramid result has no levels"))?;
    let height = *result.level_heights.last().unwrap();
    let slice_count = *result.level_slice_counts.last().unwrap();
    let smallest =
        LevelInfo { level_index: (result.level_widths.len() - 1) as u32, width, height, slice_count, dir: PathBuf::new() };
    let roi = VolumeRoi { x0, y0, x1, y1, z_bottom, z_top };
    let cropped = ctpyramid::crop_volume(volume, level0_slice_count, &smallest, &roi);
    Ok(match cropped {
        Volume3D::Eight { data, shape } => ndarray_from_flat(data, shape).into_pyarray(py).into_any(),
        Volume3D::Sixteen { data, shape } => ndarray_from_flat(data, shape).into_pyarray(py).into_any(),
    })
}

#[pymodule]
fn ct_thumbnail(_py: Python<'_>, m: &Bound<PyModule>) -> PyResult<()> {
    m.add_class::<PyPyramidResult>()?;
    m.add_function(pyo3::wrap_pyfunction!(build_thumbnails, m)?)?;
    m.add_function(pyo3::wrap_pyfunction!(scan_directory, m)?)?;
    m.add_function(pyo3::wrap_pyfunction!(crop_volume, m)?)?;
    Ok(())
}
