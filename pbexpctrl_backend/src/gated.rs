//! Photon counting gated by an external signal.
//!
//! When the pulse sequencer opens the detection window itself (the `detect` channel of a
//! Rabi program is wired to the card), the card does not time anything. Two edge counters
//! run side by side:
//! - the photon counter (`Dev1/ctr0`), paused while the gate terminal (`PFI38`) is low,
//! - the gate counter (`Dev1/ctr3`), counting the gate pulses themselves.
//!
//! Their ratio is the number of photons collected per detection window, independent of how
//! long the counters were left running.
//!
//! The two counters are started one after the other by software, gate counter first, so a
//! gate pulse may fall between the two starts. This jitter is bounded by one gate pulse per
//! sample and is accepted.

use std::time::{Duration, Instant};

use crate::counter::{check_counter_chan, DEFAULT_TIMEOUT};
use crate::device::*;
use crate::error::CtrlResult;
use crate::interrupt::Interrupter;

/// Rate reported for a sample in which no gate pulse was seen.
pub const ZERO_RATE_FALLBACK: f64 = 0.0;

pub const DEFAULT_PHOTON_CHAN: &str = "Dev1/ctr0";
pub const DEFAULT_GATE_TERMINAL: &str = "PFI38";
pub const DEFAULT_GATE_CHAN: &str = "Dev1/ctr3";

/// Raw counts of one sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatedCounts {
    pub photons: u32,
    pub gate_pulses: u32,
}

impl GatedCounts {
    /// Photons per gate pulse, or [`ZERO_RATE_FALLBACK`] without any gate pulse.
    pub fn rate(&self) -> f64 {
        if self.gate_pulses == 0 {
            ZERO_RATE_FALLBACK
        } else {
            self.photons as f64 / self.gate_pulses as f64
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GatedSample {
    /// Seconds between the start of the first sample and the end of this one.
    pub elapsed_s: f64,
    pub counts: GatedCounts,
}

/// Channel assignment of a [`GatedCounter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatedChannels {
    pub photon_chan: String,
    pub gate_terminal: String,
    pub gate_chan: String,
    pub pause_when: PausePolarity,
}

impl Default for GatedChannels {
    fn default() -> Self {
        GatedChannels {
            photon_chan: DEFAULT_PHOTON_CHAN.to_string(),
            gate_terminal: DEFAULT_GATE_TERMINAL.to_string(),
            gate_chan: DEFAULT_GATE_CHAN.to_string(),
            pause_when: PausePolarity::Low,
        }
    }
}

pub struct GatedCounter<T: CounterTask> {
    photon: T,
    gate: T,
    timeout: Duration,
}

impl<T: CounterTask> GatedCounter<T> {
    /// Configures both counters on `card`.
    pub fn new<C>(card: &C, channels: &GatedChannels) -> CtrlResult<Self>
    where
        C: CounterCard<Task = T>,
    {
        check_counter_chan(&channels.photon_chan)?;
        check_counter_chan(&channels.gate_chan)?;
        let pause = PauseGate {
            terminal: channels.gate_terminal.clone(),
            pause_when: channels.pause_when,
        };
        let photon = card.edge_counter(&channels.photon_chan, Some(&pause))?;
        let gate = card.edge_counter(&channels.gate_chan, None)?;
        Ok(GatedCounter {
            photon,
            gate,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Starts the gate counter, then the photon counter. Both keep counting until the
    /// returned guard is read or dropped.
    pub fn arm(&mut self) -> CtrlResult<ArmedGate<'_, T>> {
        self.gate.start()?;
        if let Err(err) = self.photon.start() {
            stop_quietly(&mut self.gate);
            return Err(err);
        }
        Ok(ArmedGate {
            counter: self,
            finished: false,
        })
    }

    /// Counts for `window` of wall-clock time.
    pub fn sample(
        &mut self,
        window: Duration,
        interrupt: &Interrupter,
    ) -> CtrlResult<GatedCounts> {
        let armed = self.arm()?;
        interrupt.sleep(window)?;
        armed.read()
    }

    /// Consecutive samples of `window` each. Unbounded, ends after the first error.
    pub fn samples<'a>(
        &'a mut self,
        window: Duration,
        interrupt: &Interrupter,
    ) -> GatedSamples<'a, T> {
        GatedSamples {
            counter: self,
            window,
            interrupt: interrupt.clone(),
            start: Instant::now(),
            done: false,
        }
    }
}

/// Both counters of a [`GatedCounter`] running.
///
/// Dropped without [`ArmedGate::read`], it stops the photon counter and then the gate
/// counter, logging errors from those stops.
pub struct ArmedGate<'a, T: CounterTask> {
    counter: &'a mut GatedCounter<T>,
    finished: bool,
}

impl<'a, T: CounterTask> ArmedGate<'a, T> {
    /// Reads photons, then gate pulses, then stops the photon and the gate counter.
    pub fn read(mut self) -> CtrlResult<GatedCounts> {
        let timeout = self.counter.timeout;
        let photons = self.counter.photon.read_scalar(timeout)?;
        let gate_pulses = self.counter.gate.read_scalar(timeout)?;
        self.finished = true;
        let photon_stopped = self.counter.photon.stop();
        let gate_stopped = self.counter.gate.stop();
        photon_stopped?;
        gate_stopped?;
        Ok(GatedCounts {
            photons,
            gate_pulses,
        })
    }
}

impl<'a, T: CounterTask> Drop for ArmedGate<'a, T> {
    fn drop(&mut self) {
        if !self.finished {
            stop_quietly(&mut self.counter.photon);
            stop_quietly(&mut self.counter.gate);
        }
    }
}

/// Iterator returned by [`GatedCounter::samples`].
pub struct GatedSamples<'a, T: CounterTask> {
    counter: &'a mut GatedCounter<T>,
    window: Duration,
    interrupt: Interrupter,
    start: Instant,
    done: bool,
}

impl<'a, T: CounterTask> Iterator for GatedSamples<'a, T> {
    type Item = CtrlResult<GatedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.counter.sample(self.window, &self.interrupt) {
            Ok(counts) => Some(Ok(GatedSample {
                elapsed_s: self.start.elapsed().as_secs_f64(),
                counts,
            })),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::CtrlError;
    use crate::mock::MockCounterCard;

    #[test]
    fn rate_never_nan() {
        let none = GatedCounts {
            photons: 120,
            gate_pulses: 0,
        };
        assert_eq!(none.rate(), ZERO_RATE_FALLBACK);
        let some = GatedCounts {
            photons: 120,
            gate_pulses: 40,
        };
        assert_eq!(some.rate(), 3.0);
    }

    #[test]
    fn sample_order() {
        let card = MockCounterCard::new()
            .with_fixed_count(DEFAULT_PHOTON_CHAN, 500)
            .with_fixed_count(DEFAULT_GATE_CHAN, 100);
        let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
        card.clear_events();
        let counts = gated
            .sample(Duration::from_millis(2), &Interrupter::new())
            .unwrap();
        assert_eq!(counts.rate(), 5.0);
        assert_eq!(
            card.events(),
            vec![
                "start Dev1/ctr3",
                "start Dev1/ctr0",
                "read Dev1/ctr0",
                "read Dev1/ctr3",
                "stop Dev1/ctr0",
                "stop Dev1/ctr3",
            ]
        );
        let gate = card.gate_of(DEFAULT_PHOTON_CHAN).unwrap();
        assert_eq!(gate.terminal, DEFAULT_GATE_TERMINAL);
    }

    #[test]
    fn interrupted_sample_stops_both() {
        let card = MockCounterCard::new();
        let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
        let intr = Interrupter::new();
        intr.interrupt();
        card.clear_events();
        let res = gated.sample(Duration::from_secs(60), &intr);
        assert!(matches!(res, Err(CtrlError::Interrupted)));
        assert_eq!(
            card.events(),
            vec![
                "start Dev1/ctr3",
                "start Dev1/ctr0",
                "stop Dev1/ctr0",
                "stop Dev1/ctr3",
            ]
        );
    }

    #[test]
    fn failed_photon_start_stops_gate() {
        let card = MockCounterCard::new().with_failing_start(DEFAULT_PHOTON_CHAN);
        let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
        card.clear_events();
        assert!(gated.arm().is_err());
        assert_eq!(card.events().last().map(String::as_str), Some("stop Dev1/ctr3"));
    }

    #[test]
    fn samples_are_restartable() {
        let card = MockCounterCard::new()
            .with_fixed_count(DEFAULT_PHOTON_CHAN, 10)
            .with_fixed_count(DEFAULT_GATE_CHAN, 0);
        let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
        let intr = Interrupter::new();
        let first: Vec<GatedSample> = gated
            .samples(Duration::from_millis(1), &intr)
            .take(3)
            .collect::<CtrlResult<_>>()
            .unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|s| s.counts.rate() == 0.0));
        assert!(first.windows(2).all(|w| w[0].elapsed_s <= w[1].elapsed_s));
        let again = gated.samples(Duration::from_millis(1), &intr).next();
        assert!(matches!(again, Some(Ok(_))));
    }
}
