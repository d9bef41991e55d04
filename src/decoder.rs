//! Thin wrapper over `ffmpeg-next`: open, probe, seek-to-keyframe, decode-next.
//!
//! Everything above this module works in terms of [`VideoMetadata`] and
//! [`DecodedFrame`] and never touches `ffmpeg_next` types directly.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ffmpeg_next::format::{input, Pixel};
use ffmpeg_next::media::Type as MediaType;
use ffmpeg_next::software::scaling::{context::Context as Scaler, flag::Flags as ScalerFlags};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::rational::Rational;

/// Where a video's bytes live.
#[derive(Debug, Clone)]
pub enum VideoSource {
    File(PathBuf),
    /// An entry embedded in a TAR archive, identified by byte range.
    ArchiveEntry {
        archive_path: PathBuf,
        offset: u64,
        length: u64,
        name: String,
    },
}

impl VideoSource {
    /// Materializes this source as a local filesystem path `ffmpeg` can open.
    ///
    /// For a plain file this is a no-op. For an archive entry the byte range
    /// is copied into a temporary file, which is returned alongside so the
    /// caller can keep it alive for as long as the decoder needs to read it.
    fn resolve(&self) -> Result<(PathBuf, Option<NamedTempFile>)> {
        match self {
            VideoSource::File(path) => Ok((path.clone(), None)),
            VideoSource::ArchiveEntry {
                archive_path,
                offset,
                length,
                name,
            } => {
                use std::io::{Read, Seek, SeekFrom, Write};

                let mut archive = std::fs::File::open(archive_path)
                    .map_err(|_| Error::NotFound(archive_path.clone()))?;
                archive
                    .seek(SeekFrom::Start(*offset))
                    .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
                let mut remaining = *length as usize;
                let mut buf = vec![0u8; remaining.min(1 << 20)];
                let mut tmp = tempfile::Builder::new()
                    .suffix(&suffix_of(name))
                    .tempfile()
                    .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
                while remaining > 0 {
                    let chunk = remaining.min(buf.len());
                    archive
                        .read_exact(&mut buf[..chunk])
                        .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
                    tmp.write_all(&buf[..chunk])
                        .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
                    remaining -= chunk;
                }
                tmp.flush().map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
                let path = tmp.path().to_path_buf();
                Ok((path, Some(tmp)))
            }
        }
    }
}

fn suffix_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// One entry in a video's keyframe index: a keyframe's presentation frame
/// number and the packet timestamp `ffmpeg` should seek to in order to land
/// on (or just before) it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeEntry {
    pub frame_number: usize,
    pub pts: i64,
}

#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub source: VideoSource,
    pub num_frames: usize,
    pub width: u32,
    pub height: u32,
    pub average_frame_rate: Rational,
    /// Monotonically increasing by both `frame_number` and `pts`.
    pub keyframe_index: Vec<KeyframeEntry>,
}

impl VideoMetadata {
    /// The largest keyframe with `frame_number <= target`.
    pub fn covering_keyframe(&self, target: usize) -> KeyframeEntry {
        match self.keyframe_index.partition_point(|k| k.frame_number <= target) {
            0 => self.keyframe_index[0],
            n => self.keyframe_index[n - 1],
        }
    }
}

pub struct DecodedFrame {
    pub frame_number: usize,
    /// Tightly packed RGB24 pixels, row-major, `height * width * 3` bytes.
    pub rgb: Vec<u8>,
}

/// A decoder positioned somewhere in a single video stream.
///
/// Consuming a `Decoder` (dropping it) releases the underlying `ffmpeg`
/// contexts and the archive temp file, if any.
pub struct Decoder {
    source: VideoSource,
    input: ffmpeg_next::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg_next::decoder::Video,
    scaler: Scaler,
    width: u32,
    height: u32,
    next_frame_number: usize,
    /// Raw frames the decoder has already produced but `decode_next` hasn't
    /// handed out yet — a packet (or `send_eof`'s flush) can yield more than
    /// one frame, most often with B-frame reordering look-ahead.
    pending: VecDeque<ffmpeg_next::util::frame::video::Video>,
    /// Set once `send_eof` has been called for the current stream position;
    /// cleared on every seek, since a seek repositions the demuxer and the
    /// decoder needs to be told about end-of-stream again.
    eof_sent: bool,
    // Kept alive only to pin the archive-extracted temp file on disk.
    _temp_file: Option<NamedTempFile>,
}

fn open_input(path: &Path) -> Result<ffmpeg_next::format::context::Input> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    if path.is_dir() {
        return Err(Error::IsADirectory(path.to_path_buf()));
    }
    input(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))
}

impl Decoder {
    pub fn open(source: &VideoSource) -> Result<Self> {
        let (path, temp_file) = source.resolve()?;
        log::debug!("opening {}", path.display());
        let input = open_input(&path)?;

        let stream_index = input
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| Error::UnsupportedFormat("no video stream".to_string()))?
            .index();

        let decoder = build_video_decoder(&input, stream_index)?;
        let (width, height) = (decoder.width(), decoder.height());
        let scaler = Scaler::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            ScalerFlags::BILINEAR,
        )
        .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

        Ok(Self {
            source: source.clone(),
            input,
            stream_index,
            decoder,
            scaler,
            width,
            height,
            next_frame_number: 0,
            pending: VecDeque::new(),
            eof_sent: false,
            _temp_file: temp_file,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Scans every packet of the video stream once to build the full
    /// [`VideoMetadata`], including the keyframe index. Consumes the
    /// decoder's current position; callers should call this immediately
    /// after [`Decoder::open`] and construct a fresh decoder for reading.
    pub fn probe(mut self) -> Result<VideoMetadata> {
        let source = self.source.clone();
        let (average_frame_rate, reported_frames) = {
            let stream = self.input.stream(self.stream_index).expect("stream index valid");
            (Rational::from(stream.rate()), stream.frames())
        };

        let mut keyframe_index = Vec::new();
        let mut frame_number = 0usize;
        let stream_index = self.stream_index;
        for (stream, packet) in self.input.packets() {
            if stream.index() != stream_index {
                continue;
            }
            if packet.is_key() {
                let pts = packet.pts().or_else(|| packet.dts()).unwrap_or(0);
                keyframe_index.push(KeyframeEntry { frame_number, pts });
            }
            frame_number += 1;
        }

        if keyframe_index.is_empty() {
            // Every stream has at least one sync point; a truncated/odd
            // stream still gets a seekable origin at frame 0.
            keyframe_index.push(KeyframeEntry { frame_number: 0, pts: 0 });
        }

        let num_frames = if reported_frames > 0 {
            reported_frames as usize
        } else {
            frame_number
        };

        Ok(VideoMetadata {
            source,
            num_frames,
            width: self.width,
            height: self.height,
            average_frame_rate,
            keyframe_index,
        })
    }

    /// Repositions decoding so the next [`Decoder::decode_next`] call
    /// produces the frame at `keyframe.frame_number`.
    pub fn seek_to_covering_keyframe(&mut self, keyframe: KeyframeEntry) -> Result<()> {
        self.input
            .seek(keyframe.pts, ..=keyframe.pts)
            .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
        self.decoder.flush();
        self.next_frame_number = keyframe.frame_number;
        self.pending.clear();
        self.eof_sent = false;
        Ok(())
    }

    /// Decodes and returns the next frame in presentation order.
    ///
    /// Frames the decoder already holds from look-ahead (B-frame reordering)
    /// are served out of `pending` before any new packet is read; once the
    /// packet stream is exhausted, `send_eof` flushes whatever the decoder
    /// is still holding so trailing frames are never reported as an error.
    pub fn decode_next(&mut self) -> Result<DecodedFrame> {
        let frame_number = self.next_frame_number;
        if self.pending.is_empty() {
            self.fill_pending()?;
        }
        let raw = self.pending.pop_front().ok_or_else(|| Error::DecodeError {
            frame: frame_number,
            source: ffmpeg_next::Error::Eof,
        })?;

        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
        self.scaler
            .run(&raw, &mut rgb_frame)
            .map_err(|source| Error::DecodeError { frame: frame_number, source })?;
        let stride = rgb_frame.stride(0);
        let row_bytes = self.width as usize * 3;
        let data: Vec<u8> = (0..self.height as usize)
            .flat_map(|row| {
                let start = row * stride;
                &rgb_frame.data(0)[start..start + row_bytes]
            })
            .copied()
            .collect();
        self.next_frame_number += 1;
        Ok(DecodedFrame {
            frame_number,
            rgb: data,
        })
    }

    /// Sends packets to the decoder, draining every frame each one produces,
    /// until `pending` has at least one frame or the stream (including the
    /// post-`send_eof` flush) is truly exhausted.
    fn fill_pending(&mut self) -> Result<()> {
        let stream_index = self.stream_index;
        for (stream, packet) in self.input.packets() {
            if stream.index() != stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|source| Error::DecodeError { frame: self.next_frame_number, source })?;
            let mut raw = ffmpeg_next::util::frame::video::Video::empty();
            while self.decoder.receive_frame(&mut raw).is_ok() {
                self.pending.push_back(raw);
                raw = ffmpeg_next::util::frame::video::Video::empty();
            }
            if !self.pending.is_empty() {
                return Ok(());
            }
        }
        if !self.eof_sent {
            self.eof_sent = true;
            let _ = self.decoder.send_eof();
            let mut raw = ffmpeg_next::util::frame::video::Video::empty();
            while self.decoder.receive_frame(&mut raw).is_ok() {
                self.pending.push_back(raw);
                raw = ffmpeg_next::util::frame::video::Video::empty();
            }
        }
        Ok(())
    }
}

fn build_video_decoder(
    input: &ffmpeg_next::format::context::Input,
    stream_index: usize,
) -> Result<ffmpeg_next::decoder::Video> {
    let stream = input.stream(stream_index).expect("stream index valid");
    let context = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
    context
        .decoder()
        .video()
        .map_err(|e| Error::UnsupportedFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with_keyframes(frames: &[usize]) -> VideoMetadata {
        VideoMetadata {
            source: VideoSource::File("/nonexistent.mp4".into()),
            num_frames: 1000,
            width: 4,
            height: 4,
            average_frame_rate: Rational::new(30, 1),
            keyframe_index: frames
                .iter()
                .map(|&frame_number| KeyframeEntry { frame_number, pts: frame_number as i64 * 100 })
                .collect(),
        }
    }

    #[test]
    fn covering_keyframe_picks_largest_not_after_target() {
        let metadata = metadata_with_keyframes(&[0, 50, 120]);
        assert_eq!(metadata.covering_keyframe(0).frame_number, 0);
        assert_eq!(metadata.covering_keyframe(49).frame_number, 0);
        assert_eq!(metadata.covering_keyframe(50).frame_number, 50);
        assert_eq!(metadata.covering_keyframe(119).frame_number, 50);
        assert_eq!(metadata.covering_keyframe(500).frame_number, 120);
    }

    #[test]
    fn covering_keyframe_before_first_entry_clamps_to_first() {
        let metadata = metadata_with_keyframes(&[10, 80]);
        assert_eq!(metadata.covering_keyframe(5).frame_number, 10);
    }

    #[test]
    fn run_partition_boundary_matches_keyframe_crossing() {
        // Mirrors the run-partition condition in handle.rs's get_batch: a run
        // only breaks at the next target when its covering keyframe lies
        // strictly after the previous target, i.e. decoding straight through
        // would skip a keyframe never visited.
        let metadata = metadata_with_keyframes(&[0, 50, 120]);
        let targets = [10, 40, 60, 130];
        let mut run_starts = vec![0usize];
        for (idx, w) in targets.windows(2).enumerate() {
            let (prev, next) = (w[0], w[1]);
            if metadata.covering_keyframe(next).frame_number > prev {
                run_starts.push(idx + 1);
            }
        }
        assert_eq!(run_starts, vec![0, 2, 3]);
    }
}
