//! Cooperative cancellation for the data-plane threads.
//!
//! Each producer/consumer owns one [`Interrupt`]. Worker threads observe it
//! at every loop boundary and inside every bounded wait; on observation they
//! unwind with [`PipeError::Interrupted`], running their cleanup on the way
//! out. Nothing is ever interrupted by signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::pipe::PipeError;

pub struct Interrupt {
    raised: AtomicBool,
    mutex: Mutex<()>,
    woken: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            mutex: Mutex::new(()),
            woken: Condvar::new(),
        }
    }

    /// Requests shutdown and wakes every thread blocked in
    /// [`wait_for`](Self::wait_for).
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        let _guard = self.mutex.lock().unwrap();
        self.woken.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PipeError> {
        if self.is_raised() {
            Err(PipeError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`, returning early when shutdown is
    /// requested. Returns true if the interrupt was raised.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_raised() {
            return true;
        }

        let guard = self.mutex.lock().unwrap();
        let _unused = self
            .woken
            .wait_timeout_while(guard, timeout, |_| !self.is_raised())
            .unwrap();
        self.is_raised()
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn test_wait_runs_to_timeout() {
        let interrupt = Interrupt::new();
        let start = Instant::now();
        assert!(!interrupt.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_raise_wakes_waiter() {
        let interrupt = Arc::new(Interrupt::new());

        let waiter = {
            let interrupt = Arc::clone(&interrupt);
            thread::spawn(move || interrupt.wait_for(Duration::from_secs(30)))
        };

        thread::sleep(Duration::from_millis(20));
        interrupt.raise();

        let start = Instant::now();
        assert!(waiter.join().expect("waiter"));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(interrupt.check().is_err());
    }
}
