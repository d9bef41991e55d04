//! Wraps a decoded batch's pixel buffer for hand-off to Python, without a copy.
//!
//! `get_batch` decodes into one flat buffer in the natural row-major layout
//! a decoder produces: frame, then row (height), then column (width), then
//! channel. What this module hands back is shaped `(N, W, H, 3)` instead —
//! width before height, a deliberate, documented axis order. Rather than
//! physically transposing the buffer, the width/height axes are described
//! to the tensor consumer with swapped strides over the same bytes, so the
//! reshape costs nothing.

use std::sync::Arc;

use dlpark::prelude::{DataType, Device, ManagerCtx, ShapeAndStrides, ToTensor};

use crate::error::{Error, Result};

/// Which tensor backend `get_batch` should hand pixels back as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataContainer {
    /// Return the descriptor as-is; the caller reads `buffer`/`shape` directly.
    Raw,
    /// Wrap as a DLPack capsule a `numpy.from_dlpack` can import.
    Numpy,
    /// Wrap as a DLPack capsule a `torch.from_dlpack` can import.
    ///
    /// Uses the same capsule shape as [`DataContainer::Numpy`] — the two
    /// backends differ only in which Python-side `from_dlpack` call the
    /// binding layer routes to, not in how the tensor itself is built.
    PyTorch,
}

impl DataContainer {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "raw" => Ok(DataContainer::Raw),
            "numpy" => Ok(DataContainer::Numpy),
            "pytorch" | "torch" => Ok(DataContainer::PyTorch),
            other => Err(Error::Configuration(other.to_string())),
        }
    }
}

/// A batch of decoded frames, physically stored frame-major/row-major
/// (`N, height, width, 3`) but presented with logical shape `(N, width,
/// height, 3)` — see the module doc comment.
#[derive(Debug, Clone)]
pub struct PixelBatch {
    data: Arc<Vec<u8>>,
    num_frames: usize,
    height: u32,
    width: u32,
}

impl PixelBatch {
    pub fn new(data: Vec<u8>, num_frames: usize, height: u32, width: u32) -> Self {
        debug_assert_eq!(data.len(), num_frames * height as usize * width as usize * 3);
        Self { data: Arc::new(data), num_frames, height, width }
    }

    /// Logical shape, `(N, width, height, 3)` — width precedes height.
    pub fn shape(&self) -> [i64; 4] {
        [self.num_frames as i64, self.width as i64, self.height as i64, 3]
    }

    /// Physically contiguous bytes in `(N, height, width, 3)` order — what
    /// a decoder or `ffmpeg`'s own raw-video output would produce.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Builds the DLPack-importable value for `container`.
    ///
    /// `Raw` returns `None` — callers read [`PixelBatch`] fields directly in
    /// that case, there is nothing further to build.
    pub fn into_tensor(self, container: DataContainer) -> Option<ManagerCtx<PixelBatch>> {
        match container {
            DataContainer::Raw => None,
            DataContainer::Numpy | DataContainer::PyTorch => Some(ManagerCtx::new(self)),
        }
    }
}

impl ToTensor for PixelBatch {
    fn data_ptr(&self) -> *mut std::ffi::c_void {
        self.data.as_ptr() as *mut std::ffi::c_void
    }

    fn shape_and_strides(&self) -> ShapeAndStrides {
        let (h, w) = (self.height as i64, self.width as i64);
        // Element strides over the physical (N, height, width, 3) buffer,
        // read through the logical (N, width, height, 3) shape above.
        let shape = self.shape();
        let strides = [h * w * 3, 3, w * 3, 1];
        ShapeAndStrides::new_with_strides(&shape, &strides)
    }

    fn device(&self) -> Device {
        Device::CPU
    }

    fn dtype(&self) -> DataType {
        DataType::U8
    }

    fn byte_offset(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_backends() {
        assert_eq!(DataContainer::parse("raw").unwrap(), DataContainer::Raw);
        assert_eq!(DataContainer::parse("numpy").unwrap(), DataContainer::Numpy);
        assert_eq!(DataContainer::parse("pytorch").unwrap(), DataContainer::PyTorch);
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(DataContainer::parse("tensorflow").is_err());
    }

    #[test]
    fn shape_reports_width_before_height() {
        let batch = PixelBatch::new(vec![0u8; 2 * 4 * 6 * 3], 2, 4, 6);
        assert_eq!(batch.shape(), [2, 6, 4, 3]);
        assert_eq!(batch.as_slice().len(), 144);
    }
}
