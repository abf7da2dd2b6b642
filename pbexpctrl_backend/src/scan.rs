//! Rabi oscillation scans: sweep the microwave pulse width, record the gated photon rate.
//!
//! For every width the scan uploads a freshly compiled Rabi program, arms the gated
//! counter, runs the program to completion and reads photons per detection window. Repeated
//! passes over the widths are folded into a running average per width in a [`ScanSeries`].
//!
//! All programs are compiled before the first upload, so a width that does not fit the
//! timing budget fails the scan before any device is touched.

use maplit::btreemap;
use ndarray::Array2;
use std::time::Duration;
use tracing::info;

use pbcompiler_backend::*;

use crate::device::{CounterTask, Sequencer};
use crate::error::{CtrlError, CtrlResult};
use crate::gated::GatedCounter;
use crate::interrupt::Interrupter;
use crate::session::PulseSession;

/// Extra time granted to each run on top of twice its simulated length.
pub const RUN_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

/// Pulse widths from `min_ns` to `max_ns` inclusive, `step_ns` apart.
///
/// The last width is the largest `min_ns + k * step_ns` not above `max_ns`.
///
/// ```
/// use pbexpctrl_backend::scan::pulse_widths;
///
/// assert_eq!(pulse_widths(0, 100, 40).unwrap(), vec![0, 40, 80]);
/// assert_eq!(pulse_widths(20, 80, 30).unwrap(), vec![20, 50, 80]);
/// assert!(pulse_widths(0, 100, 0).is_err());
/// ```
pub fn pulse_widths(min_ns: u64, max_ns: u64, step_ns: u64) -> CtrlResult<Vec<u64>> {
    if step_ns == 0 {
        return Err(CtrlError::Config("Pulse width step must be positive".to_string()));
    }
    if min_ns > max_ns {
        return Err(CtrlError::Config(format!(
            "Minimum pulse width {} ns is above the maximum {} ns",
            min_ns, max_ns
        )));
    }
    let count = (max_ns - min_ns) / step_ns + 1;
    Ok((0..count).map(|k| min_ns + k * step_ns).collect())
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanPoint {
    pub x: f64,
    pub rate: f64,
    /// Number of measurements averaged into `rate`.
    pub n: usize,
}

/// Measured points in the order their x values were first recorded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanSeries {
    points: Vec<ScanPoint>,
}

impl ScanSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a measurement. A repeated `x` is averaged with the earlier ones.
    pub fn record(&mut self, x: f64, rate: f64) {
        match self.points.iter_mut().find(|p| p.x == x) {
            Some(point) => {
                point.n += 1;
                point.rate += (rate - point.rate) / point.n as f64;
            }
            None => self.points.push(ScanPoint { x, rate, n: 1 }),
        }
    }

    pub fn points(&self) -> &[ScanPoint] {
        &self.points
    }

    pub fn xs(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.x).collect()
    }

    pub fn rates(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.rate).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `2 x N` array: x values in the first row, rates in the second.
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((2, self.points.len()), |(row, col)| match row {
            0 => self.points[col].x,
            _ => self.points[col].rate,
        })
    }
}

/// Pulse-width sweep of the Rabi sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct RabiScan {
    /// Timing of every point; `mw_ns` is replaced by each width.
    pub timing: RabiTiming,
    pub encoding: MicrowaveEncoding,
    pub channels: RabiChannels,
    pub widths: Vec<u64>,
    /// Passes over all widths.
    pub repeats: usize,
    /// Bound on each program run. Defaults to twice the simulated run length plus
    /// [`RUN_TIMEOUT_MARGIN`].
    pub run_timeout: Option<Duration>,
}

impl RabiScan {
    pub fn new(timing: RabiTiming, widths: Vec<u64>) -> Self {
        RabiScan {
            timing,
            encoding: MicrowaveEncoding::default(),
            channels: RabiChannels::default(),
            widths,
            repeats: 1,
            run_timeout: None,
        }
    }

    /// Compiles the program of every width, failing on the first invalid one.
    pub fn compile_all(&self) -> CtrlResult<Vec<(u64, PulseProgram)>> {
        if self.widths.is_empty() {
            return Err(CtrlError::Config("Scan has no pulse widths".to_string()));
        }
        if self.repeats == 0 {
            return Err(CtrlError::Config("Scan needs at least one pass".to_string()));
        }
        self.widths
            .iter()
            .map(|&mw_ns| -> CtrlResult<(u64, PulseProgram)> {
                let timing = RabiTiming {
                    mw_ns,
                    ..self.timing
                };
                Ok((mw_ns, timing.compile(&self.channels, self.encoding)?))
            })
            .collect()
    }

    /// Sequencer time of the whole scan, from the simulated run lengths.
    pub fn estimated_duration(&self) -> CtrlResult<Duration> {
        Ok(self.total_run_time(&self.compile_all()?))
    }

    fn total_run_time(&self, programs: &[(u64, PulseProgram)]) -> Duration {
        let per_pass: u64 = programs
            .iter()
            .filter_map(|(_, prog)| prog.run_length_ns())
            .sum();
        Duration::from_nanos(per_pass.saturating_mul(self.repeats as u64))
    }

    fn log_parameters(&self, estimate: Duration) {
        let mut params = btreemap! {
            "widths" => format!("{:?} ns", self.widths),
            "repeats" => self.repeats.to_string(),
            "encoding" => format!("{:?}", self.encoding),
        };
        for (name, value) in self.timing.summary() {
            if name != "mw" {
                params.insert(name, value.to_string());
            }
        }
        for (name, value) in &params {
            info!("Rabi scan {:>8}: {}", name, value);
        }
        info!("Estimated scan time {:.1} s", estimate.as_secs_f64());
    }

    /// Runs the scan and returns the averaged rate (photons per detection window) per width.
    pub fn run<S: Sequencer, T: CounterTask>(
        &self,
        session: &mut PulseSession<S>,
        gated: &mut GatedCounter<T>,
        interrupt: &Interrupter,
    ) -> CtrlResult<ScanSeries> {
        let programs = self.compile_all()?;
        self.log_parameters(self.total_run_time(&programs));

        let mut series = ScanSeries::new();
        for pass in 0..self.repeats {
            for (width, prog) in &programs {
                interrupt.check()?;
                session.upload(prog)?;
                let timeout = self.run_timeout.unwrap_or_else(|| {
                    session.expected_run_time().unwrap_or_default() * 2 + RUN_TIMEOUT_MARGIN
                });

                let armed = gated.arm()?;
                session.start()?;
                session.wait_until_stopped(timeout, interrupt)?;
                let counts = armed.read()?;

                series.record(*width as f64, counts.rate());
                info!(
                    "pass {}/{}, mw {} ns: {} photons / {} gates",
                    pass + 1,
                    self.repeats,
                    width,
                    counts.photons,
                    counts.gate_pulses
                );
            }
        }
        Ok(series)
    }
}
