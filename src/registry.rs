//! Shared configuration and the handle-construction entry point.
//!
//! A `Registry` is the thing callers hold onto: it carries the tensor
//! backend every handle it mints will use, and is the factory for turning a
//! path on disk into a [`VideoHandle`].

use std::path::Path;
use std::sync::Arc;

use crate::bridge::DataContainer;
use crate::decoder::Decoder;
use crate::error::Result;
use crate::handle::VideoHandle;

/// A closure building a handle from freshly probed metadata, used by
/// [`Registry::with_handle_factory`] to let a caller wrap the returned
/// handle with extra state without touching `get_batch` itself.
pub type HandleFactory = Arc<dyn Fn(crate::decoder::VideoMetadata, DataContainer) -> Arc<VideoHandle> + Send + Sync>;

/// Shared state for every handle minted from it: which tensor backend to
/// hand pixels back as, and (optionally) a custom handle constructor.
#[derive(Clone)]
pub struct Registry {
    data_container: DataContainer,
    handle_factory: HandleFactory,
}

impl Registry {
    /// `data_container` is validated at construction so a misconfigured
    /// backend never surfaces as a read-time failure.
    pub fn new(data_container: DataContainer) -> Result<Self> {
        crate::init_logging();
        Ok(Self {
            data_container,
            handle_factory: Arc::new(|metadata, data_container| VideoHandle::new(metadata, data_container)),
        })
    }

    /// Builds a registry whose handles are constructed by `factory` instead
    /// of the default [`VideoHandle::new`] — the sub-classable handle hook.
    pub fn with_handle_factory(data_container: DataContainer, factory: HandleFactory) -> Result<Self> {
        crate::init_logging();
        Ok(Self { data_container, handle_factory: factory })
    }

    pub fn data_container(&self) -> DataContainer {
        self.data_container
    }

    /// Opens `path`, probes its metadata, and drops the decoder — the
    /// returned handle is sleeping in everything but name (see the `handle`
    /// module doc comment).
    pub fn add_video_file(&self, path: impl AsRef<Path>) -> Result<Arc<VideoHandle>> {
        let source = crate::decoder::VideoSource::File(path.as_ref().to_path_buf());
        let metadata = Decoder::open(&source)?.probe()?;
        Ok((self.handle_factory)(metadata, self.data_container))
    }

    pub(crate) fn build_handle(&self, metadata: crate::decoder::VideoMetadata) -> Arc<VideoHandle> {
        (self.handle_factory)(metadata, self.data_container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_video_file_reports_not_found() {
        let registry = Registry::new(DataContainer::Raw).unwrap();
        let err = registry.add_video_file("/no/such/video.mp4").unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)));
    }
}
