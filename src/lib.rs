//! High-throughput random-access video frame reading for ML data pipelines.
//!
//! Training loops sample arbitrary, possibly sparse, possibly repeated
//! frame indices out of a large corpus of short video files, batch after
//! batch, from many parallel workers. This crate keeps that cheap by only
//! holding a decoder (and its file descriptor) open for the handles
//! currently being read — see the `handle` module — and by adapting how
//! many decode threads run at once to match consumer throughput — see
//! `prefetch`.

pub mod archive;
pub mod bridge;
pub mod decoder;
pub mod error;
pub mod handle;
mod logging;
pub mod prefetch;
pub mod rational;
pub mod registry;
pub mod sampler;

#[cfg(feature = "python")]
mod python;

pub use bridge::{DataContainer, PixelBatch};
pub use decoder::VideoSource;
pub use error::{Error, Result};
pub use handle::{KeepAwakeGuard, VideoHandle};
pub use prefetch::DatasetIterator;
pub use rational::Rational;
pub use registry::Registry;
pub use sampler::{Sampler, VecSampler};

pub(crate) use logging::init as init_logging;
