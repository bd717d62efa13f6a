//! Folder liveness tracking
//!
//! Folders whose live handle was used for header retrieval are tracked
//! here. A periodic sweep releases the handle of every folder that is not
//! being indexed and has been quiet for the configured threshold. The timer
//! only runs while at least one folder is tracked.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::FolderConfig;
use crate::types::{GlodaFolder, GlodaItem};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LiveFolders {
    folders: Mutex<Vec<Arc<GlodaFolder>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    threshold_ms: i64,
}

impl LiveFolders {
    fn sweep(&self, now_ms: i64) -> usize {
        let mut folders = lock(&self.folders);
        let before = folders.len();
        folders.retain(|folder| !folder.forget_if_unused(now_ms, self.threshold_ms));
        if folders.len() != before {
            debug!("Released {} idle folders, {} still live", before - folders.len(), folders.len());
        }
        folders.len()
    }
}

pub struct FolderLivenessTracker {
    interval: Duration,
    inner: Arc<LiveFolders>,
}

impl FolderLivenessTracker {
    pub fn new(config: &FolderConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.cleanup_interval_ms.max(1)),
            inner: Arc::new(LiveFolders {
                folders: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
                stopped: AtomicBool::new(false),
                threshold_ms: config.acceptably_old_threshold_ms,
            }),
        }
    }

    pub fn threshold_ms(&self) -> i64 {
        self.inner.threshold_ms
    }

    /// Starts tracking `folder` and makes sure the sweep timer runs.
    pub fn track(&self, folder: Arc<GlodaFolder>) {
        {
            let mut folders = lock(&self.inner.folders);
            if folders.iter().any(|f| f.id() == folder.id()) {
                return;
            }
            folders.push(folder);
        }
        self.ensure_timer();
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.folders).len()
    }

    /// Releases idle folders now; returns how many remain live.
    pub fn sweep(&self, now_ms: i64) -> usize {
        self.inner.sweep(now_ms)
    }

    fn ensure_timer(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut timer = lock(&self.inner.timer);
        if timer.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("No async runtime, folders are only released by explicit sweeps");
                return;
            }
        };

        let inner = self.inner.clone();
        let period = self.interval;
        debug!("Starting folder cleanup timer ({:?})", period);
        *timer = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if inner.sweep(now_ms()) > 0 {
                    continue;
                }
                let mut timer = lock(&inner.timer);
                if lock(&inner.folders).is_empty() {
                    debug!("No live folders left, stopping cleanup timer");
                    timer.take();
                    break;
                }
            }
        }));
    }

    /// Stops the timer for good. Tracked folders keep their handles.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
    }

    pub fn is_timer_running(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for FolderLivenessTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FolderActivity, FolderHandle, IndexingPriority};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingHandle {
        releases: AtomicUsize,
    }

    impl FolderHandle for CountingHandle {
        fn release_database(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn live_folder(id: i64, at_ms: i64) -> (Arc<GlodaFolder>, Arc<CountingHandle>) {
        let folder = Arc::new(GlodaFolder::new(
            id,
            format!("mailbox://a/f{}", id),
            0,
            "f",
            IndexingPriority::DEFAULT,
        ));
        let handle = Arc::new(CountingHandle::default());
        folder.attach_handle(handle.clone());
        folder.note_activity(FolderActivity::HeaderRetrieval, at_ms);
        (folder, handle)
    }

    #[test]
    fn test_sweep_releases_only_quiet_folders() {
        let tracker = FolderLivenessTracker::new(&FolderConfig {
            cleanup_interval_ms: 2000,
            acceptably_old_threshold_ms: 10_000,
        });
        let (old, old_handle) = live_folder(1, 1_000);
        let (recent, recent_handle) = live_folder(2, 9_000);
        tracker.track(old.clone());
        tracker.track(recent.clone());
        tracker.track(old.clone());
        assert_eq!(tracker.live_count(), 2);

        assert_eq!(tracker.sweep(15_000), 1);
        assert_eq!(old_handle.releases.load(Ordering::SeqCst), 1);
        assert_eq!(recent_handle.releases.load(Ordering::SeqCst), 0);

        assert_eq!(tracker.sweep(25_000), 0);
        assert_eq!(recent_handle.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_stops_once_nothing_is_live() {
        let tracker = FolderLivenessTracker::new(&FolderConfig {
            cleanup_interval_ms: 10,
            acceptably_old_threshold_ms: 0,
        });
        let (folder, handle) = live_folder(3, now_ms() - 1_000);
        tracker.track(folder);
        assert!(tracker.is_timer_running());

        for _ in 0..100 {
            if !tracker.is_timer_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.releases.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.live_count(), 0);
        assert!(!tracker.is_timer_running());
    }
}
