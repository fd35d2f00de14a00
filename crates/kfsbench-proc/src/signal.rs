//! Ctrl+C handling for long sweeps.
//!
//! The first SIGINT/SIGTERM/SIGHUP only raises a flag that the sweep polls
//! between workloads, so results gathered so far still get flushed. A second
//! signal exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use signal_hook::consts::signal::SIGHUP;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static WAKEUP: OnceLock<(Mutex<bool>, Condvar)> = OnceLock::new();

fn wakeup() -> &'static (Mutex<bool>, Condvar) {
    WAKEUP.get_or_init(|| (Mutex::new(false), Condvar::new()))
}

/// Install the shutdown handlers. Repeated calls are no-ops.
pub fn install_signal_handler() -> Result<(), std::io::Error> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let raised = Arc::new(AtomicBool::new(false));
    for &sig in TERM_SIGNALS.iter().chain(&[SIGHUP]) {
        // Order matters: the conditional exit must see the flag from the
        // previous delivery, not this one.
        flag::register_conditional_shutdown(sig, 130, Arc::clone(&raised))?;
        flag::register(sig, Arc::clone(&raised))?;
    }

    std::thread::Builder::new()
        .name("kfsbench-signal".into())
        .spawn(move || {
            while !raised.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            request_shutdown();
            eprintln!("\nStopping after the current trial (Ctrl+C again to abort)");
        })?;

    Ok(())
}

/// Raise the shutdown flag and wake any sleepers.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    let (lock, cvar) = wakeup();
    *lock.lock() = true;
    cvar.notify_all();
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Sleep for `timeout` unless shutdown is requested first.
///
/// Returns `true` if shutdown was requested.
pub fn sleep_unless_shutdown(timeout: Duration) -> bool {
    let (lock, cvar) = wakeup();
    let mut woken = lock.lock();
    if shutdown_requested() {
        return true;
    }
    let result = cvar.wait_while_for(&mut woken, |woken| !*woken, timeout);
    !result.timed_out() || shutdown_requested()
}

/// Reset the flag. Used between tests.
pub fn clear_shutdown() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    *wakeup().0.lock() = false;
}
