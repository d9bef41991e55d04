//! `pyo3` bindings mirroring the original Python extension module's surface:
//! a registry, opened video handles, and an archive-opening free function.
//! Only present when built with the `python` feature.

use std::path::PathBuf;
use std::sync::Arc;

use pyo3::exceptions::{PyFileNotFoundError, PyIsADirectoryError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::archive::{open_video_tar as open_video_tar_impl, TarEntry};
use crate::bridge::DataContainer;
use crate::error::Error;
use crate::handle::VideoHandle;
use crate::prefetch::DatasetIterator;
use crate::registry::Registry;
use crate::sampler::{Sampler, VecSampler};

impl From<Error> for PyErr {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(path) => PyFileNotFoundError::new_err(path.display().to_string()),
            Error::IsADirectory(path) => PyIsADirectoryError::new_err(path.display().to_string()),
            Error::Configuration(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

fn parse_data_container(name: &str) -> PyResult<DataContainer> {
    Ok(DataContainer::parse(name)?)
}

#[pyclass(name = "VideoHandle")]
struct PyVideoHandle {
    inner: Arc<VideoHandle>,
}

#[pymethods]
impl PyVideoHandle {
    #[getter]
    fn num_frames(&self) -> usize {
        self.inner.num_frames()
    }

    #[getter]
    fn width(&self) -> u32 {
        self.inner.width()
    }

    #[getter]
    fn height(&self) -> u32 {
        self.inner.height()
    }

    #[getter]
    fn average_frame_rate(&self) -> (i64, i64) {
        let r = self.inner.average_frame_rate();
        (r.numerator(), r.denominator())
    }

    fn is_sleeping(&self) -> bool {
        self.inner.is_sleeping()
    }

    fn sleep(&self) {
        self.inner.sleep()
    }

    fn get_batch(&self, py: Python<'_>, frame_indices: Vec<usize>) -> PyResult<PyObject> {
        let batch = py.allow_threads(|| self.inner.get_batch(&frame_indices))?;
        wrap_batch(py, batch, self.inner.data_container())
    }
}

fn wrap_batch(py: Python<'_>, batch: crate::bridge::PixelBatch, container: DataContainer) -> PyResult<PyObject> {
    match container {
        DataContainer::Raw => {
            let shape = batch.shape();
            let bytes = pyo3::types::PyBytes::new_bound(py, batch.as_slice());
            Ok((bytes, shape).into_py(py))
        }
        DataContainer::Numpy | DataContainer::PyTorch => {
            let tensor = batch.into_tensor(container).expect("non-Raw container always produces a tensor");
            Ok(tensor.into_py(py))
        }
    }
}

#[pyclass(name = "Registry")]
struct PyRegistry {
    inner: Registry,
}

#[pymethods]
impl PyRegistry {
    #[new]
    fn new(data_container: &str) -> PyResult<Self> {
        Ok(Self { inner: Registry::new(parse_data_container(data_container)?)? })
    }

    fn add_video_file(&self, path: PathBuf) -> PyResult<PyVideoHandle> {
        Ok(PyVideoHandle { inner: self.inner.add_video_file(path)? })
    }
}

/// A sampler fed from a Python iterable of `(video_index, frame_indices)`
/// pairs, materialized up front — Python callbacks can't cross the worker
/// thread boundary without the GIL, so this crate pulls the whole schedule
/// once under the GIL and then lets native threads consume it lock-free.
fn sampler_from_iterable(py: Python<'_>, iterable: PyObject) -> PyResult<Box<dyn Sampler>> {
    let mut items = Vec::new();
    for item in iterable.bind(py).iter()? {
        let (video_index, frame_indices): (usize, Vec<usize>) = item?.extract()?;
        items.push((video_index, frame_indices));
    }
    Ok(Box::new(VecSampler::new(items)))
}

#[pyclass(name = "DatasetIterator")]
struct PyDatasetIterator {
    inner: Option<DatasetIterator>,
}

#[pymethods]
impl PyDatasetIterator {
    #[new]
    fn new(
        py: Python<'_>,
        videos: Vec<PathBuf>,
        sampler: PyObject,
        max_thread: u32,
        max_prefetch: usize,
        data_container: &str,
    ) -> PyResult<Self> {
        let sampler = sampler_from_iterable(py, sampler)?;
        let inner = DatasetIterator::new(videos, sampler, max_thread, max_prefetch, parse_data_container(data_container)?)?;
        Ok(Self { inner: Some(inner) })
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(mut slf: PyRefMut<'_, Self>, py: Python<'_>) -> PyResult<Option<PyObject>> {
        let Some(inner) = slf.inner.as_mut() else { return Ok(None) };
        let data_container = py.allow_threads(|| inner.next());
        match data_container {
            None => Ok(None),
            Some(Ok(batch)) => {
                // `Raw`/`Numpy`/`PyTorch` is a per-handle setting recorded at
                // `add_video_file` time; the iterator doesn't know it, so
                // Python callers of this binding always get `Raw` bytes and
                // wrap them themselves. Matches the original library's
                // behavior of decoupling the prefetch pipeline's output
                // shape from any one tensor framework.
                wrap_batch(py, batch, DataContainer::Raw).map(Some)
            }
            Some(Err(e)) => Err(e.into()),
        }
    }
}

#[pyfunction]
#[pyo3(signature = (registry, tar_path, entry_filter=None, max_threads=-1))]
fn open_video_tar(
    py: Python<'_>,
    registry: &PyRegistry,
    tar_path: PathBuf,
    entry_filter: Option<PyObject>,
    max_threads: i64,
) -> PyResult<Vec<PyVideoHandle>> {
    let filter_err: std::cell::RefCell<Option<PyErr>> = std::cell::RefCell::new(None);
    let filter = entry_filter.map(|callback| {
        let callback = callback;
        move |entry: &TarEntry| -> crate::error::Result<bool> {
            let outcome = Python::with_gil(|py| {
                callback
                    .bind(py)
                    .call1((entry.name.clone(),))
                    .and_then(|result| result.extract::<bool>())
            });
            outcome.map_err(|e| {
                *filter_err.borrow_mut() = Some(e);
                Error::FilterError("python filter raised".to_string())
            })
        }
    });

    let filter_ref: Option<&dyn Fn(&TarEntry) -> crate::error::Result<bool>> =
        filter.as_ref().map(|f| f as &dyn Fn(&TarEntry) -> crate::error::Result<bool>);

    let handles = py.allow_threads(|| open_video_tar_impl(&registry.inner, &tar_path, filter_ref, max_threads));

    if let Some(err) = filter_err.into_inner() {
        return Err(err);
    }
    Ok(handles?.into_iter().map(|inner| PyVideoHandle { inner }).collect())
}

#[pymodule]
fn videoloader(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::init_logging();
    m.add_class::<PyRegistry>()?;
    m.add_class::<PyVideoHandle>()?;
    m.add_class::<PyDatasetIterator>()?;
    m.add_function(wrap_pyfunction!(open_video_tar, m)?)?;
    Ok(())
}
