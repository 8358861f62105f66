//! Crawl counters and the error ledger behind the exit code.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use webtrawl_core::{Error, ExitStatus};

use crate::hooks::StatsSnapshot;

pub struct Statistics {
    start: Instant,
    files: AtomicU64,
    bytes: AtomicU64,
    errors: Mutex<BTreeMap<&'static str, u64>>,
    /// Highest-priority (numerically lowest) exit status seen so far.
    worst_exit: Mutex<Option<ExitStatus>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: Mutex::new(BTreeMap::new()),
            worst_exit: Mutex::new(None),
        }
    }

    /// Record one saved document of `size` bytes.
    pub fn increment(&self, size: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &Error) {
        {
            let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
            *errors.entry(error.kind()).or_insert(0) += 1;
        }
        let status = ExitStatus::from_error(error);
        let mut worst = self.worst_exit.lock().unwrap_or_else(|e| e.into_inner());
        *worst = Some(match *worst {
            Some(existing) => existing.min(status),
            None => status,
        });
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// The exit status implied by recorded errors, if any.
    pub fn worst_exit_status(&self) -> Option<ExitStatus> {
        *self.worst_exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        StatsSnapshot {
            duration_secs: self.start.elapsed().as_secs_f64(),
            files: self.files(),
            bytes: self.bytes(),
            errors: errors
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
        }
    }
}
