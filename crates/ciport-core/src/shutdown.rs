use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::warn;

/// Interrupt handling: the first Ctrl-C flips a flag and starts a drain
/// deadline; running work is allowed to finish and the verification queue
/// to drain until the deadline. A second Ctrl-C exits immediately with the
/// conventional interrupt code.
pub struct Shutdown {
    requested: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            deadline: Mutex::new(None),
            grace,
        })
    }

    /// Wire the OS signal into cooperative state. Call once per process.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        let state = Arc::clone(self);
        ctrlc::set_handler(move || {
            if state.requested.swap(true, Ordering::SeqCst) {
                // Second interrupt: the user means it.
                std::process::exit(130);
            }
            if let Ok(mut deadline) = state.deadline.lock() {
                *deadline = Some(Instant::now() + state.grace);
            }
            warn!(
                grace_s = state.grace.as_secs(),
                "interrupt received; finishing in-flight work (Ctrl-C again to abort now)"
            );
        })?;
        Ok(())
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// True once the grace period after the interrupt has fully elapsed.
    pub fn drain_expired(&self) -> bool {
        if !self.requested() {
            return false;
        }
        self.deadline
            .lock()
            .ok()
            .and_then(|d| *d)
            .map(|d| Instant::now() >= d)
            .unwrap_or(true)
    }

    /// Test hook: request shutdown without a signal.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Some(Instant::now() + self.grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_requested_initially() {
        let s = Shutdown::new(Duration::from_secs(1));
        assert!(!s.requested());
        assert!(!s.drain_expired());
    }

    #[test]
    fn trigger_starts_the_grace_window() {
        let s = Shutdown::new(Duration::from_millis(20));
        s.trigger();
        assert!(s.requested());
        assert!(!s.drain_expired());
        std::thread::sleep(Duration::from_millis(30));
        assert!(s.drain_expired());
    }
}
