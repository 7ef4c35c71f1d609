use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{event, instrument, Level};

#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Counts transfers that started and finished, and remembers the highest number that were in
/// flight at the same time.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: AtomicU64,
    finished: AtomicU64,
    in_flight: AtomicU64,
    peak: AtomicU64,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.fetch_add(1, Ordering::AcqRel);
        let now = progress.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        progress.peak.fetch_max(now, Ordering::AcqRel);
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.progress.finished.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub started: u64,
    pub finished: u64,
    pub peak_in_flight: u64,
}

impl ProgressCounter {
    pub const fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.load(Ordering::Acquire),
            finished: self.finished.load(Ordering::Acquire),
            peak_in_flight: self.peak.load(Ordering::Acquire),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide counters updated by workers as they go.
#[derive(Debug, Default)]
pub struct Progress {
    pub transfers: ProgressCounter,
    pub bytes_transferred: Counter,
    pub files_copied: Counter,
    pub files_moved: Counter,
    pub directories_created: Counter,
    pub directories_removed: Counter,
}

impl Progress {
    pub const fn new() -> Self {
        Self {
            transfers: ProgressCounter::new(),
            bytes_transferred: Counter::new(),
            files_copied: Counter::new(),
            files_moved: Counter::new(),
            directories_created: Counter::new(),
            directories_removed: Counter::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let counter = Counter::new();
        for _ in 0..10 {
            counter.inc();
        }
        assert!(counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let counter = Counter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        counter.inc();
                    }
                });
            }
        });
        assert!(counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn guards_track_peak() -> Result<()> {
        let progress = ProgressCounter::new();
        {
            let _a = progress.guard();
            let _b = progress.guard();
            {
                let _c = progress.guard();
            }
            let _d = progress.guard();
        }
        let status = progress.get();
        assert_eq!(status.started, 4);
        assert_eq!(status.finished, 4);
        assert_eq!(status.peak_in_flight, 3);
        Ok(())
    }
}
