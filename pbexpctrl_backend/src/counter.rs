//! Self-timed photon counting with a pair of counters.
//!
//! The card generates its own counting window: a pulse counter (`Dev1/ctr1` by default)
//! emits one high pulse of the requested duration, and the edge counter (`Dev1/ctr0`) is
//! paused whenever that pulse's internal output is low. Counting therefore covers exactly
//! the pulse, with no software timing involved.
//!
//! Order of operations for one window, as done by [`CounterPair::start`] and
//! [`ArmedPair::finish`]:
//! 1. start the edge counter (paused, since the pulse output is still low),
//! 2. start the pulse,
//! 3. poll the pulse task until done, bounded by the timeout, interruptibly,
//! 4. read the count,
//! 5. stop the edge counter, then the pulse.
//!
//! If anything between 1 and 4 fails or is interrupted, dropping the [`ArmedPair`] stops the
//! edge counter and then the pulse, logging and discarding errors from those stops, and the
//! error that caused it propagates.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::{Duration, Instant};

use crate::device::*;
use crate::error::{CtrlError, CtrlResult};
use crate::interrupt::Interrupter;

pub const DEFAULT_PULSE_CHAN: &str = "Dev1/ctr1";
pub const DEFAULT_COUNT_CHAN: &str = "Dev1/ctr0";

/// Bound on waiting for the pulse to finish, and on reading the count.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between `is_done` polls of the pulse task.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

// `<device>/ctr<N>`, optionally with a leading slash
static COUNTER_CHAN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^/?(?P<dev>[A-Za-z][A-Za-z0-9_]*)/ctr(?P<num>\d+)$"));

fn parse_counter_chan(chan: &str) -> CtrlResult<(String, u32)> {
    let re = COUNTER_CHAN
        .as_ref()
        .map_err(|e| CtrlError::Config(e.to_string()))?;
    let caps = re.captures(chan).ok_or_else(|| {
        CtrlError::Config(format!(
            "{:?} is not a counter channel (expected <device>/ctr<N>)",
            chan
        ))
    })?;
    let num = caps["num"]
        .parse::<u32>()
        .map_err(|e| CtrlError::Config(format!("{:?}: {}", chan, e)))?;
    Ok((caps["dev"].to_string(), num))
}

/// Terminal carrying the internal output of counter `pulse_chan`.
///
/// ```
/// use pbexpctrl_backend::counter::internal_output_terminal;
///
/// assert_eq!(
///     internal_output_terminal("Dev1/ctr1").unwrap(),
///     "/Dev1/Ctr1InternalOutput"
/// );
/// assert!(internal_output_terminal("Dev1/ai0").is_err());
/// ```
pub fn internal_output_terminal(pulse_chan: &str) -> CtrlResult<String> {
    let (dev, num) = parse_counter_chan(pulse_chan)?;
    Ok(format!("/{}/Ctr{}InternalOutput", dev, num))
}

/// Converts a length given in seconds, rejecting values that are not positive or too large
/// for a [`Duration`]. `what` names the setting in the error.
///
/// ```
/// use pbexpctrl_backend::counter::duration_from_secs;
/// use std::time::Duration;
///
/// assert_eq!(duration_from_secs("Timeout", 2.5).unwrap(), Duration::from_millis(2500));
/// assert!(duration_from_secs("Timeout", 1e30).is_err());
/// ```
pub fn duration_from_secs(what: &str, secs: f64) -> CtrlResult<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(CtrlError::Config(format!(
            "{} must be positive, got {} s",
            what, secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| CtrlError::Config(format!("{} of {} s: {}", what, secs, e)))
}

/// Checks that `chan` names a counter, e.g. `Dev1/ctr0`.
pub fn check_counter_chan(chan: &str) -> CtrlResult<()> {
    parse_counter_chan(chan).map(|_| ())
}

/// Factory for counter pairs on one card.
pub struct SyncCounter<C: CounterCard> {
    card: C,
    pulse_chan: String,
    count_chan: String,
    timeout: Duration,
}

impl<C: CounterCard> SyncCounter<C> {
    /// Uses the default channels: pulse on `Dev1/ctr1`, counts on `Dev1/ctr0`.
    pub fn new(card: C) -> Self {
        SyncCounter {
            card,
            pulse_chan: DEFAULT_PULSE_CHAN.to_string(),
            count_chan: DEFAULT_COUNT_CHAN.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_channels(card: C, pulse_chan: &str, count_chan: &str) -> CtrlResult<Self> {
        check_counter_chan(pulse_chan)?;
        check_counter_chan(count_chan)?;
        if pulse_chan.trim_start_matches('/') == count_chan.trim_start_matches('/') {
            return Err(CtrlError::Config(format!(
                "Pulse and count channel are both {}",
                pulse_chan
            )));
        }
        Ok(SyncCounter {
            card,
            pulse_chan: pulse_chan.to_string(),
            count_chan: count_chan.to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn card(&self) -> &C {
        &self.card
    }

    /// Configures a pulse task and a gated edge counter for windows of `duration`.
    pub fn pair(&self, duration: Duration) -> CtrlResult<CounterPair<C::Task>> {
        if duration.is_zero() {
            return Err(CtrlError::Config(
                "Counting window must be longer than zero".to_string(),
            ));
        }
        let gate = PauseGate::count_while_high(&internal_output_terminal(&self.pulse_chan)?);
        let pulse = self.card.pulse_timer(&self.pulse_chan, duration)?;
        let counter = self.card.edge_counter(&self.count_chan, Some(&gate))?;
        Ok(CounterPair {
            pulse,
            counter,
            duration,
            timeout: self.timeout,
        })
    }

    /// Counts over one window of `duration` and returns the rate in counts per second.
    pub fn measure(&self, duration: Duration, interrupt: &Interrupter) -> CtrlResult<f64> {
        self.pair(duration)?.measure(interrupt)
    }
}

/// A configured pulse task and the edge counter it gates.
pub struct CounterPair<T: CounterTask> {
    pulse: T,
    counter: T,
    duration: Duration,
    timeout: Duration,
}

impl<T: CounterTask> CounterPair<T> {
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Starts the counter, then the pulse.
    pub fn start(&mut self) -> CtrlResult<ArmedPair<'_, T>> {
        self.counter.start()?;
        if let Err(err) = self.pulse.start() {
            stop_quietly(&mut self.counter);
            return Err(err);
        }
        Ok(ArmedPair {
            pair: self,
            finished: false,
        })
    }

    /// Counts over one window and returns the raw count.
    pub fn count(&mut self, interrupt: &Interrupter) -> CtrlResult<u32> {
        self.start()?.finish(interrupt)
    }

    /// Counts over one window and returns counts per second.
    pub fn measure(&mut self, interrupt: &Interrupter) -> CtrlResult<f64> {
        let count = self.count(interrupt)?;
        Ok(count as f64 / self.duration.as_secs_f64())
    }

    /// Back-to-back windows as `(seconds since the first window started, rate)`.
    ///
    /// The iterator is unbounded and yields one error, then ends, if a window fails or is
    /// interrupted.
    pub fn rates<'a>(&'a mut self, interrupt: &Interrupter) -> CountRates<'a, T> {
        CountRates {
            pair: self,
            interrupt: interrupt.clone(),
            start: Instant::now(),
            done: false,
        }
    }
}

/// A running counting window. See the module documentation for the stop order.
pub struct ArmedPair<'a, T: CounterTask> {
    pair: &'a mut CounterPair<T>,
    finished: bool,
}

impl<'a, T: CounterTask> ArmedPair<'a, T> {
    fn wait_and_read(&mut self, interrupt: &Interrupter) -> CtrlResult<u32> {
        let timeout = self.pair.timeout;
        let deadline = Instant::now() + timeout;
        while !self.pair.pulse.is_done()? {
            if Instant::now() >= deadline {
                return Err(CtrlError::Timeout {
                    task: self.pair.pulse.name().to_string(),
                    timeout,
                });
            }
            interrupt.sleep(POLL_INTERVAL)?;
        }
        self.pair.counter.read_scalar(timeout)
    }

    /// Waits for the window to close, reads the count and stops both tasks.
    pub fn finish(mut self, interrupt: &Interrupter) -> CtrlResult<u32> {
        let count = self.wait_and_read(interrupt)?;
        self.finished = true;
        let counter_stopped = self.pair.counter.stop();
        let pulse_stopped = self.pair.pulse.stop();
        counter_stopped?;
        pulse_stopped?;
        Ok(count)
    }
}

impl<'a, T: CounterTask> Drop for ArmedPair<'a, T> {
    fn drop(&mut self) {
        if !self.finished {
            stop_quietly(&mut self.pair.counter);
            stop_quietly(&mut self.pair.pulse);
        }
    }
}

/// Iterator returned by [`CounterPair::rates`].
pub struct CountRates<'a, T: CounterTask> {
    pair: &'a mut CounterPair<T>,
    interrupt: Interrupter,
    start: Instant,
    done: bool,
}

impl<'a, T: CounterTask> Iterator for CountRates<'a, T> {
    type Item = CtrlResult<(f64, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pair.measure(&self.interrupt) {
            Ok(rate) => Some(Ok((self.start.elapsed().as_secs_f64(), rate))),
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
    use crate::mock::MockCounterCard;

    #[test]
    fn counter_channel_names() {
        assert!(COUNTER_CHAN.is_ok());
        for num in 0..8 {
            assert!(check_counter_chan(&format!("Dev1/ctr{}", num)).is_ok());
        }
        assert!(check_counter_chan("Dev1/ctr0").is_ok());
        assert!(check_counter_chan("/PXI1Slot3/ctr12").is_ok());
        assert!(check_counter_chan("Dev1/ctr").is_err());
        assert!(check_counter_chan("Dev1/port0/line1").is_err());
        assert_eq!(
            internal_output_terminal("/Dev2/ctr3").unwrap(),
            "/Dev2/Ctr3InternalOutput"
        );
    }

    #[test]
    fn out_of_range_durations() {
        assert_eq!(
            duration_from_secs("Window", 0.01).unwrap(),
            Duration::from_millis(10)
        );
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(matches!(
                duration_from_secs("Window", secs),
                Err(CtrlError::Config(_))
            ));
        }
    }

    #[test]
    fn rejects_shared_or_bad_channels() {
        let card = MockCounterCard::new();
        assert!(SyncCounter::with_channels(card.clone(), "Dev1/ctr0", "/Dev1/ctr0").is_err());
        assert!(SyncCounter::with_channels(card.clone(), "Dev1/pfi0", "Dev1/ctr0").is_err());
        assert!(SyncCounter::with_channels(card, "Dev1/ctr2", "Dev1/ctr0").is_ok());
    }

    #[test]
    fn zero_window_is_rejected() {
        let counter = SyncCounter::new(MockCounterCard::new());
        assert!(matches!(
            counter.pair(Duration::ZERO),
            Err(CtrlError::Config(_))
        ));
    }

    #[test]
    fn pulse_gates_the_counter() {
        let card = MockCounterCard::new();
        let counter = SyncCounter::new(card.clone());
        let _pair = counter.pair(Duration::from_millis(5)).unwrap();
        let gate = card.gate_of(DEFAULT_COUNT_CHAN).unwrap();
        assert_eq!(gate.terminal, "/Dev1/Ctr1InternalOutput");
        assert_eq!(gate.pause_when, PausePolarity::Low);
    }

    #[test]
    fn rates_end_after_error() {
        let card = MockCounterCard::new()
            .with_rate(DEFAULT_COUNT_CHAN, 1e4)
            .with_hanging_pulse();
        let counter = SyncCounter::new(card).with_timeout(Duration::from_millis(5));
        let mut pair = counter.pair(Duration::from_millis(1)).unwrap();
        let results: Vec<_> = pair.rates(&Interrupter::new()).take(3).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CtrlError::Timeout { .. })));
    }
}
