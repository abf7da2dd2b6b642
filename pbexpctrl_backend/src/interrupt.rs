//! Cross-thread interruption of blocking waits.
//!
//! Measurements block the calling thread while the hardware runs. An [`Interrupter`] is the
//! only way another thread (a Ctrl-C handler, a GUI) reaches into such a wait: every
//! interruptible sleep in this crate goes through [`Interrupter::sleep`], which returns
//! [`CtrlError::Interrupted`] as soon as [`Interrupter::interrupt`] is called. The waiting code
//! then stops its devices and propagates the error.
//!
//! ```
//! use pbexpctrl_backend::interrupt::Interrupter;
//! use std::time::Duration;
//!
//! let intr = Interrupter::new();
//! let remote = intr.clone();
//! std::thread::spawn(move || remote.interrupt());
//! // Returns early with an error instead of sleeping a minute
//! assert!(intr.sleep(Duration::from_secs(60)).is_err());
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{CtrlError, CtrlResult};

/// Clonable interruption flag. All clones share the same flag.
#[derive(Clone, Default)]
pub struct Interrupter {
    flag: Arc<Mutex<bool>>,
    condvar: Arc<Condvar>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(Mutex::new(false)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Raises the flag and wakes every sleeper. The flag stays raised until [`Interrupter::reset`].
    pub fn interrupt(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_interrupted(&self) -> bool {
        *self.flag.lock()
    }

    /// `Err(Interrupted)` if the flag is raised.
    pub fn check(&self) -> CtrlResult<()> {
        if self.is_interrupted() {
            Err(CtrlError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Raises this flag on Ctrl-C, so a running measurement
    /// stops its devices before the process exits. Only one handler can be installed per
    /// process; a second call fails with [`CtrlError::Signal`].
    pub fn install_ctrlc_handler(&self) -> CtrlResult<()> {
        let remote = self.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, stopping devices");
            remote.interrupt();
        })?;
        Ok(())
    }

    /// Sleeps for `duration` unless interrupted first.
    pub fn sleep(&self, duration: Duration) -> CtrlResult<()> {
        let deadline = Instant::now() + duration;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.condvar.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        if *flag {
            Err(CtrlError::Interrupted)
        } else {
            Ok(())
        }
    }
}
