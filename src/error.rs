use std::path::PathBuf;

use thiserror::Error;

/// The crate-wide error type.
///
/// Variants map onto the error taxonomy: configuration errors are raised at
/// construction time, source errors from opening a video, decode/domain
/// errors from `get_batch`, and worker errors are just any of the above
/// latched from a prefetch thread.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported data container {0:?}")]
    Configuration(String),

    #[error("no such file or directory: {0}")]
    NotFound(PathBuf),

    #[error("is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("unsupported or corrupt video format: {0}")]
    UnsupportedFormat(String),

    #[error("frame index {index} out of range (num_frames = {num_frames})")]
    IndexOutOfRange { index: usize, num_frames: usize },

    #[error("failed to decode frame {frame}: {source}")]
    DecodeError {
        frame: usize,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("archive entry filter raised an error: {0}")]
    FilterError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
