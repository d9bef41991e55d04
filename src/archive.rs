//! Opens every video entry in a TAR archive in one pass, probing them in
//! parallel instead of one at a time.
//!
//! Grounded on the same byte-range materialization [`crate::decoder::VideoSource`]
//! already does for a single archive entry — this module just collects the
//! entries first, then fans the probing step out across threads.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::decoder::{Decoder, VideoSource};
use crate::error::{Error, Result};
use crate::handle::VideoHandle;
use crate::registry::Registry;

/// One video-shaped entry found while scanning the TAR stream.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

/// Traverses `tar_path` once, optionally filters entries, then probes the
/// survivors in parallel using up to `max_threads` OS threads (`-1` means
/// `std::thread::available_parallelism()`).
///
/// Handles are returned in the order their entries appear in the archive;
/// filtering removes entries, it never reorders the rest.
pub fn open_video_tar(
    registry: &Registry,
    tar_path: impl AsRef<Path>,
    entry_filter: Option<&dyn Fn(&TarEntry) -> Result<bool>>,
    max_threads: i64,
) -> Result<Vec<Arc<VideoHandle>>> {
    let tar_path = tar_path.as_ref();
    let entries = scan_entries(tar_path)?;

    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        let keep = match entry_filter {
            Some(filter) => filter(&entry).map_err(|e| Error::FilterError(e.to_string()))?,
            None => true,
        };
        if keep {
            kept.push(entry);
        }
    }

    let thread_count = if max_threads < 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        (max_threads as usize).max(1)
    };

    probe_parallel(registry, tar_path, kept, thread_count)
}

fn scan_entries(tar_path: &Path) -> Result<Vec<TarEntry>> {
    let file = std::fs::File::open(tar_path).map_err(|_| Error::NotFound(tar_path.to_path_buf()))?;
    let mut archive = tar::Archive::new(file);
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(|e| Error::UnsupportedFormat(e.to_string()))? {
        let entry = entry.map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(|e| Error::UnsupportedFormat(e.to_string()))?.to_string_lossy().into_owned();
        entries.push(TarEntry {
            name,
            offset: entry.raw_file_position(),
            length: entry.header().size().unwrap_or(0),
        });
    }
    Ok(entries)
}

/// Probes `entries` across `thread_count` worker threads, preserving
/// archive order in the returned `Vec` regardless of completion order.
fn probe_parallel(
    registry: &Registry,
    tar_path: &Path,
    entries: Vec<TarEntry>,
    thread_count: usize,
) -> Result<Vec<Arc<VideoHandle>>> {
    let results: Vec<Mutex<Option<Result<Arc<VideoHandle>>>>> =
        (0..entries.len()).map(|_| Mutex::new(None)).collect();
    let results = Arc::new(results);
    let next_index = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let entries = Arc::new(entries);

    std::thread::scope(|scope| {
        for _ in 0..thread_count.min(entries.len().max(1)) {
            let results = Arc::clone(&results);
            let next_index = Arc::clone(&next_index);
            let entries = Arc::clone(&entries);
            scope.spawn(move || loop {
                let i = next_index.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if i >= entries.len() {
                    return;
                }
                let entry = &entries[i];
                let source = VideoSource::ArchiveEntry {
                    archive_path: tar_path.to_path_buf(),
                    offset: entry.offset,
                    length: entry.length,
                    name: entry.name.clone(),
                };
                let outcome = Decoder::open(&source).and_then(Decoder::probe).map(|metadata| registry.build_handle(metadata));
                *results[i].lock().unwrap() = Some(outcome);
            });
        }
    });

    // Every worker thread joined when the scope above returned, so this is
    // the only remaining strong reference.
    Arc::try_unwrap(results)
        .unwrap_or_else(|_| unreachable!("all worker threads joined"))
        .into_iter()
        .map(|cell| cell.into_inner().unwrap().expect("every slot visited exactly once"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DataContainer;
    use std::io::Write;

    fn write_fixture_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
    }

    #[test]
    fn scan_entries_lists_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("videos.tar");
        write_fixture_tar(&tar_path, &[("a.mp4", b"not a real video"), ("b.mp4", b"also not real")]);

        let entries = scan_entries(&tar_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.mp4");
        assert_eq!(entries[1].name, "b.mp4");
    }

    #[test]
    fn filter_error_aborts_before_probing() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("videos.tar");
        write_fixture_tar(&tar_path, &[("a.mp4", b"not a real video")]);

        let registry = Registry::new(DataContainer::Raw).unwrap();
        let filter: &dyn Fn(&TarEntry) -> Result<bool> = &|_| Err(Error::FilterError("nope".into()));
        let err = open_video_tar(&registry, &tar_path, Some(filter), 1).unwrap_err();
        assert!(matches!(err, Error::FilterError(_)));
    }
}
