//! Running flag, status and counters shared between a service and its pollers.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Stage of the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Status {
    Idle = 0,
    GetCache = 1,
    Downloading = 2,
    BuildingMosaic = 3,
    Reprojecting = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::GetCache,
            2 => Status::Downloading,
            3 => Status::BuildingMosaic,
            4 => Status::Reprojecting,
            _ => Status::Idle,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Point-in-time copy of the progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub running: bool,
    pub status: Status,
    pub completed: usize,
    pub total: usize,
}

impl ProgressSnapshot {
    /// Human readable line for the current stage.
    pub fn report(&self) -> String {
        match self.status {
            Status::Idle => String::new(),
            Status::GetCache => "Get cache database...".to_string(),
            Status::Downloading => format!("Downloading... {}/{}", self.completed, self.total),
            Status::BuildingMosaic => "Building mosaic...".to_string(),
            Status::Reprojecting => "Reprojecting...".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Progress {
    running: AtomicBool,
    status: AtomicU8,
    completed: AtomicUsize,
    total: AtomicUsize,
    cancel: Mutex<CancellationToken>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            status: AtomicU8::new(Status::Idle.code()),
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

impl Progress {
    /// Allow batches to run again after [`Progress::stop`].
    pub fn start(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        self.running.store(true, Ordering::SeqCst);
    }

    /// Abort the current batch; in-flight downloads are dropped.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Token cancelled by the next [`Progress::stop`].
    pub fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status.code(), Ordering::SeqCst);
    }

    /// Reset the counters for a batch of `total` tiles.
    pub fn begin(&self, total: usize) {
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn advance(&self, count: usize) {
        self.completed.fetch_add(count, Ordering::SeqCst);
    }

    /// Back to idle with zeroed counters.
    pub fn finish(&self) {
        self.set_status(Status::Idle);
        self.begin(0);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            running: self.is_running(),
            status: self.status(),
            completed: self.completed(),
            total: self.total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_strings() {
        let progress = Progress::default();
        assert_eq!(progress.snapshot().report(), "");

        progress.set_status(Status::GetCache);
        assert_eq!(progress.snapshot().report(), "Get cache database...");

        progress.begin(12);
        progress.advance(3);
        progress.set_status(Status::Downloading);
        assert_eq!(progress.snapshot().report(), "Downloading... 3/12");

        progress.set_status(Status::BuildingMosaic);
        assert_eq!(progress.snapshot().report(), "Building mosaic...");
        progress.set_status(Status::Reprojecting);
        assert_eq!(progress.snapshot().report(), "Reprojecting...");

        progress.finish();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.status, Status::Idle);
        assert_eq!((snapshot.completed, snapshot.total), (0, 0));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Idle.code(), 0);
        assert_eq!(Status::Reprojecting.code(), 4);
        assert_eq!(Status::from_u8(2), Status::Downloading);
        assert_eq!(Status::from_u8(99), Status::Idle);
    }

    #[test]
    fn test_stop_cancels_and_start_rearms() {
        let progress = Progress::default();
        assert!(progress.is_running());
        let token = progress.token();

        progress.stop();
        assert!(!progress.is_running());
        assert!(token.is_cancelled());
        assert!(progress.token().is_cancelled());

        progress.start();
        assert!(progress.is_running());
        assert!(!progress.token().is_cancelled());
        assert!(token.is_cancelled());
    }
}
