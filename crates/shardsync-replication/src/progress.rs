//! Per-file transfer progress
//!
//! Sources report bytes received for each file at chunk granularity. The
//! tracker keeps totals for status reporting and the time of the last
//! update so a caller can spot a stalled transfer.

use parking_lot::Mutex;
use shardsync_storage::StoreFileMetadata;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Called with `(file_name, bytes_so_far)` after each update
pub type ProgressListener = Arc<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProgress {
    pub length: u64,
    pub recovered: u64,
    pub complete: bool,
}

#[derive(Debug)]
struct ProgressState {
    files: BTreeMap<String, FileProgress>,
    last_update: Instant,
}

/// Snapshot of a transfer's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub files_total: usize,
    pub files_complete: usize,
    pub bytes_total: u64,
    pub bytes_recovered: u64,
}

impl ProgressSummary {
    /// Percent of bytes recovered; an empty transfer is complete
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        self.bytes_recovered as f64 * 100.0 / self.bytes_total as f64
    }
}

pub struct FileProgressTracker {
    state: Mutex<ProgressState>,
    listener: Option<ProgressListener>,
}

impl FileProgressTracker {
    pub fn new(files: &[StoreFileMetadata]) -> Self {
        let files = files
            .iter()
            .map(|meta| {
                (
                    meta.name().to_string(),
                    FileProgress {
                        length: meta.length(),
                        recovered: 0,
                        complete: false,
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(ProgressState {
                files,
                last_update: Instant::now(),
            }),
            listener: None,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: ProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Record that `bytes_so_far` bytes of `file` have been received.
    /// Updates for files the tracker was not created with are ignored.
    pub fn update(&self, file: &str, bytes_so_far: u64) {
        {
            let mut state = self.state.lock();
            let Some(progress) = state.files.get_mut(file) else {
                return;
            };
            progress.recovered = bytes_so_far.min(progress.length);
            state.last_update = Instant::now();
        }
        if let Some(listener) = &self.listener {
            listener(file, bytes_so_far);
        }
    }

    /// Mark a file fully received and verified
    pub fn complete(&self, file: &str) {
        let length = {
            let mut state = self.state.lock();
            let Some(progress) = state.files.get_mut(file) else {
                return;
            };
            progress.recovered = progress.length;
            progress.complete = true;
            let length = progress.length;
            state.last_update = Instant::now();
            length
        };
        if let Some(listener) = &self.listener {
            listener(file, length);
        }
    }

    /// Forget partial progress on a file whose transfer is restarted
    pub fn reset(&self, file: &str) {
        let mut state = self.state.lock();
        if let Some(progress) = state.files.get_mut(file)
            && !progress.complete
        {
            progress.recovered = 0;
        }
    }

    pub fn file(&self, file: &str) -> Option<FileProgress> {
        self.state.lock().files.get(file).copied()
    }

    pub fn is_complete(&self, file: &str) -> bool {
        self.file(file).is_some_and(|p| p.complete)
    }

    /// Time since the last update
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_update.elapsed()
    }

    pub fn summary(&self) -> ProgressSummary {
        let state = self.state.lock();
        state
            .files
            .values()
            .fold(ProgressSummary::default(), |mut summary, p| {
                summary.files_total += 1;
                summary.bytes_total += p.length;
                summary.bytes_recovered += p.recovered;
                if p.complete {
                    summary.files_complete += 1;
                }
                summary
            })
    }
}

impl std::fmt::Debug for FileProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileProgressTracker")
            .field("summary", &self.summary())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn files() -> Vec<StoreFileMetadata> {
        vec![
            StoreFileMetadata::for_contents("a", &[1u8; 100]),
            StoreFileMetadata::for_contents("b", &[2u8; 300]),
        ]
    }

    #[test]
    fn test_progress_accumulates() {
        let tracker = FileProgressTracker::new(&files());
        assert_eq!(tracker.summary().bytes_total, 400);

        tracker.update("a", 60);
        tracker.update("b", 100);
        let summary = tracker.summary();
        assert_eq!(summary.bytes_recovered, 160);
        assert_eq!(summary.files_complete, 0);
        assert!((summary.percent() - 40.0).abs() < f64::EPSILON);

        tracker.complete("a");
        assert!(tracker.is_complete("a"));
        assert_eq!(tracker.summary().bytes_recovered, 200);
        assert_eq!(tracker.summary().files_complete, 1);
    }

    #[test]
    fn test_unknown_file_ignored() {
        let tracker = FileProgressTracker::new(&files());
        tracker.update("zzz", 10);
        assert!(tracker.file("zzz").is_none());
        assert_eq!(tracker.summary().bytes_recovered, 0);
    }

    #[test]
    fn test_reset_keeps_completed_files() {
        let tracker = FileProgressTracker::new(&files());
        tracker.complete("a");
        tracker.update("b", 250);
        tracker.reset("a");
        tracker.reset("b");
        assert_eq!(tracker.file("a").unwrap().recovered, 100);
        assert_eq!(tracker.file("b").unwrap().recovered, 0);
    }

    #[test]
    fn test_listener_sees_updates() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let tracker = FileProgressTracker::new(&files()).with_listener(Arc::new(move |_, bytes| {
            sink.store(bytes, Ordering::SeqCst);
        }));
        tracker.update("b", 123);
        assert_eq!(seen.load(Ordering::SeqCst), 123);
        tracker.complete("b");
        assert_eq!(seen.load(Ordering::SeqCst), 300);
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        let tracker = FileProgressTracker::new(&[]);
        assert!((tracker.summary().percent() - 100.0).abs() < f64::EPSILON);
    }
}
