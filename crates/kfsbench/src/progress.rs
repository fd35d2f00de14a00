//! Sweep progress bar, refreshed from a background thread.
//!
//! The sweep posts the number of finished workloads into a shared atomic;
//! the reporter thread polls it twice a second and redraws. Intermediate
//! counts may be skipped, which is fine for a progress bar, and the sweep
//! never waits on the terminal.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Write side of the progress channel.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<AtomicUsize>);

impl ProgressCounter {
    pub fn set(&self, done: usize) {
        self.0.store(done, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Owns the reporter thread; dropping it stops and joins the thread.
pub struct ProgressReporter {
    counter: ProgressCounter,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Start reporting on `total` workloads. The bar is only drawn when
    /// `visible` and stderr is a terminal.
    pub fn start(total: usize, visible: bool) -> Self {
        let bar = if visible && std::io::stderr().is_terminal() {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{percent:>3}% ({pos} of {len}) [{bar:40}] {elapsed_precise} ETA {eta}")
                .expect("valid template")
                .progress_chars("=> "),
        );
        Self::spawn(bar)
    }

    fn spawn(bar: ProgressBar) -> Self {
        let counter = ProgressCounter::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_counter = counter.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("kfsbench-progress".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    bar.set_position(thread_counter.get() as u64);
                    thread::park_timeout(POLL_INTERVAL);
                }
                bar.set_position(thread_counter.get() as u64);
                bar.finish();
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Progress reporting disabled: {}", e);
                None
            }
        };

        Self {
            counter,
            stop,
            handle,
        }
    }

    pub fn counter(&self) -> ProgressCounter {
        self.counter.clone()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::warn!("Progress reporter thread panicked");
            }
        }
    }
}
