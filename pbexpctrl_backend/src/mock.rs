//! Simulated sequencer and counter card.
//!
//! Both mocks are cheap to clone and every clone shares the same state, so a test can hand
//! one clone to the code under test and keep another to inspect the event log afterwards.
//! Events are plain strings such as `"start Dev1/ctr0"` or `"load 8"`, recorded in call order.
//!
//! ## Timing model
//! - [`MockSequencer`] runs for the program's simulated run length times a time scale after
//!   `start`, then reports `STOPPED`. Programs that never halt run until stopped.
//! - A [`MockCounterCard`] pulse task is done once its high time has elapsed.
//! - An edge counter paused by the internal output of a pulse task on the same card counts
//!   `floor(rate * high time)`; any other edge counter counts `floor(rate * time since start)`.
//!   A fixed count set with [`MockCounterCard::with_fixed_count`] overrides both.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pbcompiler_backend::PulseProgram;

use crate::counter::internal_output_terminal;
use crate::device::*;
use crate::error::{CtrlError, CtrlResult};

const MOCK_ERROR_CODE: i32 = -1;

fn mock_error(device: &str, message: &str) -> CtrlError {
    CtrlError::Driver {
        device: device.to_string(),
        code: MOCK_ERROR_CODE,
        message: message.to_string(),
    }
}

#[derive(Default)]
struct SeqState {
    events: Vec<String>,
    loaded: Option<PulseProgram>,
    uploads: usize,
    started_at: Option<Instant>,
    run_for: Option<Duration>,
}

impl SeqState {
    fn is_running(&self) -> bool {
        match (self.started_at, self.run_for) {
            (Some(_), None) => true,
            (Some(start), Some(run_for)) => start.elapsed() < run_for,
            (None, _) => false,
        }
    }
}

/// Simulated PulseBlaster.
#[derive(Clone)]
pub struct MockSequencer {
    name: String,
    time_scale: f64,
    state: Arc<Mutex<SeqState>>,
}

impl Default for MockSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSequencer {
    pub fn new() -> Self {
        MockSequencer {
            name: "mock-pulseblaster".to_string(),
            time_scale: 1.0,
            state: Arc::new(Mutex::new(SeqState::default())),
        }
    }

    /// Runs programs `scale` times as long as the real device would.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Program currently stored on the device.
    pub fn loaded(&self) -> Option<PulseProgram> {
        self.state.lock().loaded.clone()
    }

    /// Number of successful `load` calls.
    pub fn uploads(&self) -> usize {
        self.state.lock().uploads
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }
}

impl Sequencer for MockSequencer {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self, prog: &PulseProgram) -> CtrlResult<()> {
        let mut state = self.state.lock();
        state.events.push(format!("load {}", prog.len()));
        if state.is_running() {
            return Err(mock_error(&self.name, "cannot program while running"));
        }
        state.loaded = Some(prog.clone());
        state.uploads += 1;
        Ok(())
    }

    fn start(&mut self) -> CtrlResult<()> {
        let mut state = self.state.lock();
        state.events.push("start".to_string());
        let run_length = match &state.loaded {
            Some(prog) => prog.run_length_ns(),
            None => return Err(mock_error(&self.name, "no program loaded")),
        };
        state.run_for =
            run_length.map(|ns| Duration::from_nanos((ns as f64 * self.time_scale) as u64));
        state.started_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> CtrlResult<()> {
        let mut state = self.state.lock();
        state.events.push("stop".to_string());
        state.started_at = None;
        Ok(())
    }

    fn status(&mut self) -> CtrlResult<PbStatus> {
        let state = self.state.lock();
        Ok(if state.is_running() {
            PbStatus::RUNNING
        } else if state.loaded.is_none() {
            PbStatus::STOPPED | PbStatus::RESET
        } else {
            PbStatus::STOPPED
        })
    }
}

#[derive(Default)]
struct CardState {
    events: Vec<String>,
    rates: HashMap<String, f64>,
    fixed_counts: HashMap<String, u32>,
    gates: HashMap<String, PauseGate>,
    // internal output terminal -> high time of the pulse task driving it
    pulses: HashMap<String, Duration>,
    failing_starts: HashSet<String>,
    hanging_pulse: bool,
}

/// Simulated counter/timer card.
#[derive(Clone, Default)]
pub struct MockCounterCard {
    state: Arc<Mutex<CardState>>,
}

impl MockCounterCard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Photon rate seen by the edge counter on `chan`, in counts per second.
    pub fn with_rate(self, chan: &str, hz: f64) -> Self {
        self.state.lock().rates.insert(chan.to_string(), hz);
        self
    }

    /// `chan` always reads `count`.
    pub fn with_fixed_count(self, chan: &str, count: u32) -> Self {
        self.state.lock().fixed_counts.insert(chan.to_string(), count);
        self
    }

    /// Pulse tasks never report done.
    pub fn with_hanging_pulse(self) -> Self {
        self.state.lock().hanging_pulse = true;
        self
    }

    /// Starting the task on `chan` fails.
    pub fn with_failing_start(self, chan: &str) -> Self {
        self.state.lock().failing_starts.insert(chan.to_string());
        self
    }

    pub fn set_fixed_count(&self, chan: &str, count: u32) {
        self.state.lock().fixed_counts.insert(chan.to_string(), count);
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Pause gate the edge counter on `chan` was configured with.
    pub fn gate_of(&self, chan: &str) -> Option<PauseGate> {
        self.state.lock().gates.get(chan).cloned()
    }
}

impl CounterCard for MockCounterCard {
    type Task = MockTask;

    fn edge_counter(&self, chan: &str, gate: Option<&PauseGate>) -> CtrlResult<MockTask> {
        let mut state = self.state.lock();
        state.events.push(format!("create {}", chan));
        if let Some(gate) = gate {
            state.gates.insert(chan.to_string(), gate.clone());
        }
        Ok(MockTask {
            name: chan.to_string(),
            kind: TaskKind::Edges {
                gate: gate.cloned(),
            },
            started_at: None,
            state: self.state.clone(),
        })
    }

    fn pulse_timer(&self, chan: &str, high_time: Duration) -> CtrlResult<MockTask> {
        let terminal = internal_output_terminal(chan)?;
        let mut state = self.state.lock();
        state.events.push(format!("create {}", chan));
        state.pulses.insert(terminal, high_time);
        Ok(MockTask {
            name: chan.to_string(),
            kind: TaskKind::Pulse { high_time },
            started_at: None,
            state: self.state.clone(),
        })
    }
}

enum TaskKind {
    Pulse { high_time: Duration },
    Edges { gate: Option<PauseGate> },
}

/// Task handed out by [`MockCounterCard`].
pub struct MockTask {
    name: String,
    kind: TaskKind,
    started_at: Option<Instant>,
    state: Arc<Mutex<CardState>>,
}

impl CounterTask for MockTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> CtrlResult<()> {
        let mut state = self.state.lock();
        state.events.push(format!("start {}", self.name));
        if state.failing_starts.contains(&self.name) {
            return Err(mock_error(&self.name, "start failed"));
        }
        if self.started_at.is_some() {
            return Err(mock_error(&self.name, "task is already running"));
        }
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> CtrlResult<()> {
        self.state.lock().events.push(format!("stop {}", self.name));
        match self.started_at.take() {
            Some(_) => Ok(()),
            None => Err(mock_error(&self.name, "task is not running")),
        }
    }

    fn is_done(&mut self) -> CtrlResult<bool> {
        match &self.kind {
            TaskKind::Pulse { high_time } => {
                let hanging = self.state.lock().hanging_pulse;
                Ok(!hanging && self.started_at.map_or(false, |t| t.elapsed() >= *high_time))
            }
            TaskKind::Edges { .. } => Ok(false),
        }
    }

    fn read_scalar(&mut self, _timeout: Duration) -> CtrlResult<u32> {
        let mut state = self.state.lock();
        state.events.push(format!("read {}", self.name));
        let gate = match &self.kind {
            TaskKind::Edges { gate } => gate,
            TaskKind::Pulse { .. } => {
                return Err(mock_error(&self.name, "not an edge counting task"))
            }
        };
        if let Some(count) = state.fixed_counts.get(&self.name) {
            return Ok(*count);
        }
        let rate = state.rates.get(&self.name).copied().unwrap_or(0.0);
        let window = gate
            .as_ref()
            .and_then(|gate| state.pulses.get(&gate.terminal).copied())
            .or_else(|| self.started_at.map(|t| t.elapsed()))
            .unwrap_or_default();
        Ok((rate * window.as_secs_f64()).floor() as u32)
    }
}
