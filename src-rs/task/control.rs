use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{JobError, JobResult};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Flags {
    pause: bool,
    stop: bool,
}

/// Pause/stop signal pair shared between a task and its work thread.
///
/// Requests wake any waiter immediately; waiters also re-check the flags at
/// every poll interval.
#[derive(Debug)]
pub struct TaskControl {
    flags: Mutex<Flags>,
    signal: Condvar,
    poll_interval: Duration,
}

impl TaskControl {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            flags: Mutex::new(Flags::default()),
            signal: Condvar::new(),
            poll_interval: if poll_interval.is_zero() {
                DEFAULT_POLL_INTERVAL
            } else {
                poll_interval
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn request_pause(&self) {
        self.flags.lock().pause = true;
        self.signal.notify_all();
    }

    /// Clears a pending pause so a parked checkpoint returns.
    pub fn release(&self) {
        self.flags.lock().pause = false;
        self.signal.notify_all();
    }

    pub fn request_stop(&self) {
        self.flags.lock().stop = true;
        self.signal.notify_all();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.flags.lock().pause
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.lock().stop
    }

    /// Returns `Stopped` if stop was requested; blocks while paused.
    pub fn checkpoint(&self) -> JobResult<()> {
        let mut flags = self.flags.lock();
        loop {
            if flags.stop {
                return Err(JobError::Stopped);
            }
            if !flags.pause {
                return Ok(());
            }
            self.signal.wait_for(&mut flags, self.poll_interval);
        }
    }

    /// Sleeps for `duration`, returning `Stopped` early if stop is requested.
    pub fn sleep(&self, duration: Duration) -> JobResult<()> {
        let mut flags = self.flags.lock();
        if flags.stop {
            return Err(JobError::Stopped);
        }
        if !duration.is_zero() {
            // Pause is honoured at the next checkpoint, not here.
            self.signal.wait_while_for(&mut flags, |f| !f.stop, duration);
        }
        if flags.stop {
            return Err(JobError::Stopped);
        }
        Ok(())
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}
