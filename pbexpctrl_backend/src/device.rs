//! Device interfaces used by the measurement code.
//!
//! The measurement logic only sees these traits, so the same code drives the real hardware
//! (`PbBoard` and `NiCard`, built with the `hardware` feature) and the simulated devices of
//! [`crate::mock`].
//!
//! - [`Sequencer`]: a pulse sequencer that loads a whole [`PulseProgram`], starts, stops and
//!   reports its status word.
//! - [`CounterCard`] / [`CounterTask`]: a counter/timer card handing out edge-counting and
//!   pulse-generating tasks.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use pbcompiler_backend::PulseProgram;

use crate::error::CtrlResult;

bitflags! {
    /// Status word of the sequencer, as returned by `pb_read_status`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PbStatus: u32 {
        const STOPPED = 1 << 0;
        const RESET = 1 << 1;
        const RUNNING = 1 << 2;
        const WAITING = 1 << 3;
    }
}

/// A pulse sequencer holding at most one program.
pub trait Sequencer {
    fn name(&self) -> &str;
    /// Replaces the stored program. The sequencer must not be running.
    fn load(&mut self, prog: &PulseProgram) -> CtrlResult<()>;
    fn start(&mut self) -> CtrlResult<()>;
    fn stop(&mut self) -> CtrlResult<()>;
    fn status(&mut self) -> CtrlResult<PbStatus>;
}

/// Level of the gate signal during which an edge counter holds its count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PausePolarity {
    Low,
    High,
}

/// Digital-level pause trigger for an edge counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PauseGate {
    pub terminal: String,
    pub pause_when: PausePolarity,
}

impl PauseGate {
    /// Counts only while `terminal` is high.
    pub fn count_while_high(terminal: &str) -> Self {
        PauseGate {
            terminal: terminal.to_string(),
            pause_when: PausePolarity::Low,
        }
    }
}

/// One configured counter task.
pub trait CounterTask {
    /// Physical channel of the task, e.g. `Dev1/ctr0`.
    fn name(&self) -> &str;
    fn start(&mut self) -> CtrlResult<()>;
    fn stop(&mut self) -> CtrlResult<()>;
    fn is_done(&mut self) -> CtrlResult<bool>;
    /// Current value of an edge counter.
    fn read_scalar(&mut self, timeout: Duration) -> CtrlResult<u32>;
}

pub trait CounterCard {
    type Task: CounterTask;

    /// Counts rising edges on `chan`, starting from zero, optionally paused by `gate`.
    fn edge_counter(&self, chan: &str, gate: Option<&PauseGate>) -> CtrlResult<Self::Task>;

    /// Emits a single pulse that is high for `high_time` on `chan`.
    fn pulse_timer(&self, chan: &str, high_time: Duration) -> CtrlResult<Self::Task>;
}

/// Stops `task`, logging instead of returning a failure. Used on cleanup paths, where the
/// task may already be stopped.
pub fn stop_quietly<T: CounterTask>(task: &mut T) {
    if let Err(err) = task.stop() {
        warn!("Ignoring error while stopping {}: {}", task.name(), err);
    }
}
