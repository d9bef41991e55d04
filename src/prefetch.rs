//! The adaptive prefetch pipeline: a pool of worker threads that keep a
//! bounded, ordered queue of decoded batches full just ahead of the
//! consumer, scaling the number of active workers to match consumer
//! throughput.
//!
//! Two condition variables guard disjoint state, mirroring the
//! `(Mutex<T>, Condvar)` pairing used throughout this codebase for anything
//! worker threads coordinate through:
//! - `admission` — scheduling state: the queue's length, `running_workers`,
//!   `target_workers`, the sampler cursor, and the lazily-opened video list.
//! - `new_data` — the queue's contents and whether its head slot is ready.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bridge::{DataContainer, PixelBatch};
use crate::error::{Error, Result};
use crate::handle::VideoHandle;
use crate::registry::Registry;
use crate::sampler::Sampler;

/// A not-yet-opened, mid-open, or opened video, shared by every worker that
/// might need to read from it. The state machine is monotonic:
/// `Unopened → Opening → Opened`.
enum VideoSlot {
    Unopened(PathBuf),
    Opening(Arc<OpenWaiter>),
    Opened(Arc<VideoHandle>),
}

/// Lets every worker but the one performing the open block until it
/// finishes, instead of retrying or opening the video redundantly.
struct OpenWaiter {
    handle: Mutex<Option<Result<Arc<VideoHandle>>>>,
    ready: Condvar,
}

impl OpenWaiter {
    fn new() -> Self {
        Self { handle: Mutex::new(None), ready: Condvar::new() }
    }

    fn wait(&self) -> Result<Arc<VideoHandle>> {
        let mut guard = self.handle.lock().unwrap();
        while guard.is_none() {
            guard = self.ready.wait(guard).unwrap();
        }
        clone_outcome(guard.as_ref().unwrap())
    }

    fn resolve(&self, outcome: Result<Arc<VideoHandle>>) {
        *self.handle.lock().unwrap() = Some(outcome);
        self.ready.notify_all();
    }
}

fn clone_outcome(outcome: &Result<Arc<VideoHandle>>) -> Result<Arc<VideoHandle>> {
    match outcome {
        Ok(handle) => Ok(Arc::clone(handle)),
        Err(e) => Err(Error::UnsupportedFormat(e.to_string())),
    }
}

/// One queue cell: becomes ready once its worker finishes (successfully or
/// not); the consumer blocks on `ready` until then.
///
/// A failed item carries no `Error` of its own — the real error is latched
/// once into `AdmissionState::fatal_error` and re-raised by the consumer, so
/// a single failure doesn't require `Error: Clone`.
struct PrefetchSlot {
    ready: Mutex<bool>,
    ready_cond: Condvar,
    payload: Mutex<Option<std::result::Result<PixelBatch, ()>>>,
}

impl PrefetchSlot {
    fn new() -> Self {
        Self { ready: Mutex::new(false), ready_cond: Condvar::new(), payload: Mutex::new(None) }
    }

    fn fulfill(&self, payload: std::result::Result<PixelBatch, ()>) {
        *self.payload.lock().unwrap() = Some(payload);
        *self.ready.lock().unwrap() = true;
        self.ready_cond.notify_all();
    }

    fn wait_ready(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.ready_cond.wait(ready).unwrap();
        }
    }
}

/// State guarded by the `admission` condvar.
struct AdmissionState {
    videos: Vec<VideoSlot>,
    queue_len: usize,
    running_workers: u32,
    target_workers: f64,
    finished: bool,
    fatal_error: Option<Error>,
    load_time_window: VecDeque<Duration>,
    read_time_window: VecDeque<Instant>,
    max_prefetch: usize,
    max_thread: u32,
}

/// State guarded by the `new_data` condvar.
struct QueueState {
    queue: VecDeque<Arc<PrefetchSlot>>,
}

struct Shared {
    admission: (Mutex<AdmissionState>, Condvar),
    new_data: (Mutex<QueueState>, Condvar),
    sampler: Mutex<Box<dyn Sampler>>,
    registry: Registry,
    stop: AtomicBool,
}

/// Adaptive, order-preserving prefetch over a `Sampler`'s items.
///
/// Yields `Result<PixelBatch, Error>` in the order the sampler produced
/// them, regardless of which worker thread finished decoding first.
pub struct DatasetIterator {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl DatasetIterator {
    pub fn new(
        videos: Vec<PathBuf>,
        sampler: Box<dyn Sampler>,
        max_thread: u32,
        max_prefetch: usize,
        data_container: DataContainer,
    ) -> Result<Self> {
        let registry = Registry::new(data_container)?;
        let now = Instant::now();
        // A decreasing synthetic sequence so the very first `read_interval`
        // is nonzero without having observed any real reads yet.
        let read_time_window: VecDeque<Instant> = (0..=max_prefetch)
            .rev()
            .map(|i| now.checked_sub(Duration::from_secs(i as u64 + 1)).unwrap_or(now))
            .collect();
        // Optimistic: assume full parallelism is needed until reality says otherwise.
        let load_time_window: VecDeque<Duration> =
            std::iter::repeat(Duration::from_secs(1)).take(max_prefetch).collect();

        let admission = AdmissionState {
            videos: videos.into_iter().map(VideoSlot::Unopened).collect(),
            queue_len: 0,
            running_workers: 0,
            target_workers: max_thread as f64,
            finished: false,
            fatal_error: None,
            load_time_window,
            read_time_window,
            max_prefetch,
            max_thread,
        };

        let shared = Arc::new(Shared {
            admission: (Mutex::new(admission), Condvar::new()),
            new_data: (Mutex::new(QueueState { queue: VecDeque::new() }), Condvar::new()),
            sampler: Mutex::new(sampler),
            registry,
            stop: AtomicBool::new(false),
        });

        let workers = (0..max_thread)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();

        Ok(Self { shared, workers })
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }

        let item = {
            let (lock, cvar) = &shared.admission;
            let mut state = lock.lock().unwrap();
            loop {
                if shared.stop.load(Ordering::Relaxed) || state.fatal_error.is_some() {
                    return;
                }
                let admitted = (state.running_workers as f64) < state.target_workers.ceil()
                    && state.queue_len < state.max_prefetch;
                if admitted || state.finished {
                    break;
                }
                state = cvar.wait(state).unwrap();
            }
            if state.fatal_error.is_some() {
                return;
            }

            let item = shared.sampler.lock().unwrap().next();
            let Some((video_index, frame_indices)) = item else {
                state.finished = true;
                cvar.notify_all();
                drop(state);
                // The consumer's wait loop is paired with `new_data`, not
                // `admission` — it would never otherwise learn `finished`
                // flipped true while the queue was already empty.
                let (_, new_data_cvar) = &shared.new_data;
                new_data_cvar.notify_all();
                return;
            };

            state.running_workers += 1;
            state.queue_len += 1;

            let open_step = claim_open(&mut state.videos, video_index);
            (video_index, frame_indices, open_step)
        };

        let (video_index, frame_indices, open_step) = item;
        let slot = Arc::new(PrefetchSlot::new());
        {
            let (lock, cvar) = &shared.new_data;
            lock.lock().unwrap().queue.push_back(Arc::clone(&slot));
            cvar.notify_all();
        }

        let t_start = Instant::now();
        let outcome = resolve_handle(&shared, video_index, open_step)
            .and_then(|handle| handle.get_batch(&frame_indices));
        let elapsed = t_start.elapsed();

        let slot_outcome = match outcome {
            Ok(batch) => Ok(batch),
            Err(error) => {
                // Latch the error before marking the slot ready: the consumer
                // checks `fatal_error` right after `wait_ready` returns, and
                // must never observe a ready-but-unlatched failed slot.
                log::warn!("prefetch worker for video {video_index} failed: {error}");
                let (lock, cvar) = &shared.admission;
                let mut state = lock.lock().unwrap();
                state.fatal_error.get_or_insert(error);
                cvar.notify_all();
                Err(())
            }
        };
        slot.fulfill(slot_outcome);

        let (lock, cvar) = &shared.admission;
        let mut state = lock.lock().unwrap();
        state.running_workers -= 1;
        state.queue_len -= 1;
        if state.load_time_window.len() == state.max_prefetch {
            state.load_time_window.pop_front();
        }
        state.load_time_window.push_back(elapsed);
        reschedule(&mut state);
        cvar.notify_all();
    }
}

/// Claims the `Unopened → Opening` transition for `video_index` if nobody
/// else has, returning what this worker must do before it can read.
enum OpenStep {
    AlreadyOpen(Arc<VideoHandle>),
    WaitOn(Arc<OpenWaiter>),
    MustOpen(PathBuf, Arc<OpenWaiter>),
}

fn claim_open(videos: &mut [VideoSlot], video_index: usize) -> OpenStep {
    match &videos[video_index] {
        VideoSlot::Opened(handle) => OpenStep::AlreadyOpen(Arc::clone(handle)),
        VideoSlot::Opening(waiter) => OpenStep::WaitOn(Arc::clone(waiter)),
        VideoSlot::Unopened(path) => {
            let path = path.clone();
            let waiter = Arc::new(OpenWaiter::new());
            videos[video_index] = VideoSlot::Opening(Arc::clone(&waiter));
            OpenStep::MustOpen(path, waiter)
        }
    }
}

fn resolve_handle(shared: &Shared, video_index: usize, step: OpenStep) -> Result<Arc<VideoHandle>> {
    match step {
        OpenStep::AlreadyOpen(handle) => Ok(handle),
        OpenStep::WaitOn(waiter) => waiter.wait(),
        OpenStep::MustOpen(path, waiter) => {
            let outcome = shared.registry.add_video_file(&path);
            waiter.resolve(clone_outcome(&outcome));
            if let Ok(handle) = &outcome {
                let (lock, _) = &shared.admission;
                lock.lock().unwrap().videos[video_index] = VideoSlot::Opened(Arc::clone(handle));
            }
            outcome
        }
    }
}

/// Recomputes `target_workers` and wakes enough admission waiters to reach it.
fn reschedule(state: &mut AdmissionState) {
    let read_interval = state
        .read_time_window
        .back()
        .zip(state.read_time_window.front())
        .map(|(back, front)| back.duration_since(*front).as_secs_f64() * 0.95)
        .unwrap_or(1.0)
        .max(f64::EPSILON);
    let load_sum: f64 = state.load_time_window.iter().map(Duration::as_secs_f64).sum();
    let target = (load_sum / read_interval).min(state.max_thread as f64);
    state.target_workers = target;
}

impl Iterator for DatasetIterator {
    type Item = Result<PixelBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = {
            let (lock, cvar) = &self.shared.new_data;
            let mut queue_state = lock.lock().unwrap();
            loop {
                if let Some(slot) = queue_state.queue.pop_front() {
                    break Some(slot);
                }
                let (alock, _) = &self.shared.admission;
                let finished_and_empty =
                    alock.lock().unwrap().finished && queue_state.queue.is_empty();
                if finished_and_empty {
                    break None;
                }
                queue_state = cvar.wait(queue_state).unwrap();
            }
        }?;

        slot.wait_ready();

        let now = Instant::now();
        let (lock, _) = &self.shared.admission;
        {
            let mut state = lock.lock().unwrap();
            if state.read_time_window.len() == state.max_prefetch + 1 {
                state.read_time_window.pop_front();
            }
            state.read_time_window.push_back(now);
            if let Some(err) = state.fatal_error.take() {
                drop(state);
                self.shutdown();
                return Some(Err(err));
            }
            reschedule(&mut state);
        }
        {
            let (_, cvar) = &self.shared.admission;
            cvar.notify_all();
        }

        // A `None` fatal_error at this point and a failed placeholder payload
        // cannot both be true: the worker latches the error before marking
        // the slot ready (see `worker_loop`), and `next()` checks
        // `fatal_error` immediately after `wait_ready` returns, above.
        match slot.payload.lock().unwrap().take().unwrap() {
            Ok(batch) => Some(Ok(batch)),
            Err(()) => unreachable!("fatal_error must have been latched and handled above"),
        }
    }
}

impl DatasetIterator {
    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        {
            let (_, cvar) = &self.shared.admission;
            cvar.notify_all();
        }
        {
            let (_, cvar) = &self.shared.new_data;
            cvar.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DatasetIterator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::VecSampler;

    fn sampler_of_len(n: usize, items_per: usize) -> Box<dyn Sampler> {
        let items: Vec<(usize, Vec<usize>)> = (0..n).map(|i| (0, vec![i % items_per])).collect();
        Box::new(VecSampler::new(items))
    }

    #[test]
    fn empty_sampler_yields_nothing() {
        let iter = DatasetIterator::new(vec![], Box::new(VecSampler::new(vec![])), 2, 8, DataContainer::Raw).unwrap();
        let collected: Vec<_> = iter.collect();
        assert!(collected.is_empty());
    }

    #[test]
    fn missing_video_surfaces_as_error_not_panic() {
        let videos = vec![PathBuf::from("/no/such/video.mp4")];
        let mut iter =
            DatasetIterator::new(videos, sampler_of_len(1, 1), 1, 4, DataContainer::Raw).unwrap();
        let result = iter.next().expect("one item");
        assert!(result.is_err());
    }
}
