//! The core read path: a single video's sleep/awake lifecycle and its batch
//! decode algorithm.
//!
//! A [`VideoHandle`] starts out holding nothing but metadata. The first
//! [`VideoHandle::get_batch`] call opens a decoder, and the handle goes back
//! to sleep — closing the decoder and dropping its buffers — as soon as the
//! call returns, unless something is holding it awake via
//! [`VideoHandle::keep_awake`]. With potentially thousands of handles live at
//! once, only the ones actually being read should hold a file descriptor.
//!
//! Note: a handle fresh out of [`crate::registry::Registry::add_video_file`]
//! reports `is_sleeping() == false` until its first read/release cycle, even
//! though probing already closed its decoder. This mirrors the original
//! implementation's observable behavior rather than eagerly normalizing it,
//! since callers may depend on it.

use std::sync::{Arc, Mutex};

use crate::bridge::{DataContainer, PixelBatch};
use crate::decoder::{Decoder, VideoMetadata, VideoSource};
use crate::error::{Error, Result};
use crate::rational::Rational;

/// `Awake(None)` is the degenerate post-probe state: logically awake (so
/// `is_sleeping()` is false) but holding no decoder yet. It only occurs
/// between construction and the first `get_batch`/`sleep` cycle.
enum SleepState {
    Sleeping,
    Awake(Option<Decoder>),
}

struct Inner {
    state: SleepState,
    keep_awake_depth: u32,
}

/// A single video's metadata plus its sleep/awake decoder state.
pub struct VideoHandle {
    metadata: VideoMetadata,
    data_container: DataContainer,
    inner: Mutex<Inner>,
}

impl VideoHandle {
    /// Builds a handle in the degenerate awake state left behind by probing.
    pub(crate) fn new(metadata: VideoMetadata, data_container: DataContainer) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            data_container,
            inner: Mutex::new(Inner {
                state: SleepState::Awake(None),
                keep_awake_depth: 0,
            }),
        })
    }

    pub fn num_frames(&self) -> usize {
        self.metadata.num_frames
    }

    pub fn width(&self) -> u32 {
        self.metadata.width
    }

    pub fn height(&self) -> u32 {
        self.metadata.height
    }

    pub fn average_frame_rate(&self) -> Rational {
        self.metadata.average_frame_rate
    }

    pub fn source(&self) -> &VideoSource {
        &self.metadata.source
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, SleepState::Sleeping)
    }

    /// Keeps the handle awake until the returned guard is dropped, even if
    /// `get_batch` would otherwise put it back to sleep in the meantime.
    pub fn keep_awake(self: &Arc<Self>) -> KeepAwakeGuard {
        self.inner.lock().unwrap().keep_awake_depth += 1;
        KeepAwakeGuard { handle: Arc::clone(self) }
    }

    /// Drops decoder state if awake. Idempotent.
    pub fn sleep(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SleepState::Sleeping;
    }

    /// Decodes `frame_indices` (arbitrary order, duplicates allowed) and
    /// returns them as a batch in the same order they were requested.
    pub fn get_batch(&self, frame_indices: &[usize]) -> Result<PixelBatch> {
        for &f in frame_indices {
            if f >= self.metadata.num_frames {
                return Err(Error::IndexOutOfRange { index: f, num_frames: self.metadata.num_frames });
            }
        }

        let mut inner_guard = self.inner.lock().unwrap();
        let mut sleep_guard = SleepOnExit { inner: &mut inner_guard };
        let inner: &mut Inner = &mut *sleep_guard.inner;

        let needs_open = !matches!(inner.state, SleepState::Awake(Some(_)));
        if needs_open {
            let decoder = Decoder::open(&self.metadata.source)?;
            inner.state = SleepState::Awake(Some(decoder));
        }
        let decoder = match &mut inner.state {
            SleepState::Awake(Some(decoder)) => decoder,
            _ => unreachable!("just transitioned to Awake(Some(_))"),
        };

        let (width, height) = (self.metadata.width as usize, self.metadata.height as usize);
        let frame_bytes = width * height * 3;
        let mut out = vec![0u8; frame_indices.len() * frame_bytes];

        // `F_sorted`: unique, ascending; `targets` maps each unique frame to
        // every output slot that requested it, preserving request order.
        let mut unique: Vec<usize> = frame_indices.to_vec();
        unique.sort_unstable();
        unique.dedup();
        let mut targets: Vec<Vec<usize>> = vec![Vec::new(); unique.len()];
        for (out_idx, &f) in frame_indices.iter().enumerate() {
            let pos = unique.binary_search(&f).unwrap();
            targets[pos].push(out_idx);
        }

        let mut i = 0;
        while i < unique.len() {
            decoder.seek_to_covering_keyframe(self.metadata.covering_keyframe(unique[i]))?;

            let mut j = i;
            while j < unique.len() {
                // A new run starts at `unique[j]` whenever its covering keyframe
                // lies strictly after the previous target — i.e. decoding
                // straight through from where we are would skip a keyframe we
                // never visited, so a fresh seek is cheaper than decoding past it.
                if j > i && self.metadata.covering_keyframe(unique[j]).frame_number > unique[j - 1] {
                    break;
                }
                let target_frame = unique[j];
                let decoded = loop {
                    let frame = decoder.decode_next()?;
                    if frame.frame_number >= target_frame {
                        break frame;
                    }
                };
                for &out_idx in &targets[j] {
                    out[out_idx * frame_bytes..(out_idx + 1) * frame_bytes].copy_from_slice(&decoded.rgb);
                }
                j += 1;
            }
            i = j;
        }

        Ok(PixelBatch::new(out, frame_indices.len(), self.metadata.height, self.metadata.width))
    }

    pub fn data_container(&self) -> DataContainer {
        self.data_container
    }
}

/// RAII guard restoring `Sleeping` (subject to `keep_awake_depth`) on any
/// exit path out of `get_batch`, including an early `?` return.
struct SleepOnExit<'a> {
    inner: &'a mut Inner,
}

impl Drop for SleepOnExit<'_> {
    fn drop(&mut self) {
        if self.inner.keep_awake_depth == 0 {
            self.inner.state = SleepState::Sleeping;
        }
    }
}

/// Holds a [`VideoHandle`] awake. Dropping it releases the hold; if no other
/// guard is outstanding, the handle goes back to sleep immediately.
pub struct KeepAwakeGuard {
    handle: Arc<VideoHandle>,
}

impl Drop for KeepAwakeGuard {
    fn drop(&mut self) {
        let mut inner = self.handle.inner.lock().unwrap();
        inner.keep_awake_depth -= 1;
        if inner.keep_awake_depth == 0 {
            inner.state = SleepState::Sleeping;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::KeyframeEntry;

    fn metadata(num_frames: usize) -> VideoMetadata {
        VideoMetadata {
            source: VideoSource::File("/nonexistent.mp4".into()),
            num_frames,
            width: 4,
            height: 4,
            average_frame_rate: Rational::new(30, 1),
            keyframe_index: vec![KeyframeEntry { frame_number: 0, pts: 0 }],
        }
    }

    #[test]
    fn out_of_range_index_rejected_before_any_io() {
        // Sleeping with no real Decoder: get_batch must fail before opening one.
        let handle = Arc::new(VideoHandle {
            metadata: metadata(10),
            data_container: DataContainer::Raw,
            inner: Mutex::new(Inner { state: SleepState::Sleeping, keep_awake_depth: 0 }),
        });
        let err = handle.get_batch(&[0, 10]).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 10, num_frames: 10 }));
    }

    #[test]
    fn keep_awake_guard_suppresses_sleep() {
        let handle = Arc::new(VideoHandle {
            metadata: metadata(10),
            data_container: DataContainer::Raw,
            inner: Mutex::new(Inner { state: SleepState::Sleeping, keep_awake_depth: 0 }),
        });
        let guard = handle.keep_awake();
        assert_eq!(handle.inner.lock().unwrap().keep_awake_depth, 1);
        drop(guard);
        assert_eq!(handle.inner.lock().unwrap().keep_awake_depth, 0);
    }

    #[test]
    fn freshly_constructed_handle_reports_awake() {
        let handle = VideoHandle::new(metadata(10), DataContainer::Raw);
        assert!(!handle.is_sleeping());
        handle.sleep();
        assert!(handle.is_sleeping());
    }
}
