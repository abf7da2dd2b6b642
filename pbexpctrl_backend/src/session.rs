//! Ownership of the pulse sequencer for the duration of a measurement.
//!
//! A [`PulseSession`] owns its [`Sequencer`]: there is no global "current board", so only the
//! session can program or start the device, and dropping the session stops a program that
//! is still running.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use pbcompiler_backend::PulseProgram;

use crate::device::{PbStatus, Sequencer};
use crate::error::{CtrlError, CtrlResult};
use crate::interrupt::Interrupter;

/// Interval between status polls while waiting for a program to stop.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct PulseSession<S: Sequencer> {
    seq: S,
    program: Option<PulseProgram>,
}

impl<S: Sequencer> PulseSession<S> {
    pub fn new(seq: S) -> Self {
        PulseSession { seq, program: None }
    }

    pub fn sequencer(&self) -> &S {
        &self.seq
    }

    /// Last program uploaded through this session.
    pub fn program(&self) -> Option<&PulseProgram> {
        self.program.as_ref()
    }

    /// Validates `prog` and replaces the program on the device with it.
    ///
    /// Nothing is sent to the device if validation fails. A running program is stopped first.
    pub fn upload(&mut self, prog: &PulseProgram) -> CtrlResult<()> {
        prog.validate()?;
        if self.status()?.contains(PbStatus::RUNNING) {
            debug!("Stopping {} before reprogramming", self.seq.name());
            self.seq.stop()?;
        }
        self.seq.load(prog)?;
        self.program = Some(prog.clone());
        debug!("Uploaded {} instructions to {}", prog.len(), self.seq.name());
        Ok(())
    }

    pub fn start(&mut self) -> CtrlResult<()> {
        if self.program.is_none() {
            return Err(CtrlError::Config(format!(
                "No program uploaded to {}",
                self.seq.name()
            )));
        }
        self.seq.start()
    }

    pub fn stop(&mut self) -> CtrlResult<()> {
        self.seq.stop()
    }

    pub fn status(&mut self) -> CtrlResult<PbStatus> {
        self.seq.status()
    }

    pub fn is_stopped(&mut self) -> CtrlResult<bool> {
        Ok(self.status()?.contains(PbStatus::STOPPED))
    }

    /// Uploads `prog` and starts it.
    pub fn run(&mut self, prog: &PulseProgram) -> CtrlResult<()> {
        self.upload(prog)?;
        self.start()
    }

    /// Simulated run length of the uploaded program, `None` if it never stops on its own.
    pub fn expected_run_time(&self) -> Option<Duration> {
        self.program
            .as_ref()
            .and_then(PulseProgram::run_length_ns)
            .map(Duration::from_nanos)
    }

    /// Blocks until the program reports `STOPPED`.
    ///
    /// On timeout or interruption the sequencer is stopped before the error is returned.
    pub fn wait_until_stopped(
        &mut self,
        timeout: Duration,
        interrupt: &Interrupter,
    ) -> CtrlResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stopped()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.stop_quietly();
                return Err(CtrlError::Timeout {
                    task: self.seq.name().to_string(),
                    timeout,
                });
            }
            if let Err(err) = interrupt.sleep(STATUS_POLL_INTERVAL) {
                self.stop_quietly();
                return Err(err);
            }
        }
    }

    fn stop_quietly(&mut self) {
        if let Err(err) = self.seq.stop() {
            warn!("Ignoring error while stopping {}: {}", self.seq.name(), err);
        }
    }
}

impl<S: Sequencer> Drop for PulseSession<S> {
    fn drop(&mut self) {
        if let Ok(status) = self.seq.status() {
            if status.contains(PbStatus::RUNNING) {
                self.stop_quietly();
            }
        }
    }
}
