//! Runs PulseBlaster programs compiled by [`pbcompiler_backend`] and counts photons
//! synchronized to them with NI-DAQmx counters.
//!
//! ## Overview
//!
//! - [`session::PulseSession`] owns the sequencer: it uploads validated programs, starts them
//!   and waits for them to stop.
//! - [`counter::SyncCounter`] measures photon rates over windows timed by the counter card
//!   itself.
//! - [`gated::GatedCounter`] counts photons only while the sequencer's detection line is high,
//!   together with the number of detection windows.
//! - [`scan::RabiScan`] sweeps the microwave pulse width and records the gated rate per width.
//! - [`config::ExpConfig`] reads the setup (channel masks, counters, timing) from TOML.
//!
//! Devices are reached through the traits in [`device`]. The `hardware` feature adds the
//! spinapi and NI-DAQmx implementations (`spinapi::PbBoard`, `nidaqmx::NiCard`); without it
//! the simulated devices in [`mock`] are the only ones available.
//!
//! ## Example
//!
//! ```
//! use pbcompiler_backend::RabiTiming;
//! use pbexpctrl_backend::*;
//!
//! let card = MockCounterCard::new()
//!     .with_fixed_count("Dev1/ctr0", 300)
//!     .with_fixed_count("Dev1/ctr3", 10);
//! let seq = MockSequencer::new().with_time_scale(0.01);
//!
//! let mut session = PulseSession::new(seq);
//! let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
//! let timing = RabiTiming { loop_num: 10, ..Default::default() };
//! let scan = RabiScan::new(timing, pulse_widths(0, 20, 10).unwrap());
//!
//! let series = scan.run(&mut session, &mut gated, &Interrupter::new()).unwrap();
//! assert_eq!(series.xs(), vec![0.0, 10.0, 20.0]);
//! assert_eq!(series.rates(), vec![30.0; 3]);
//! ```

pub mod config;
pub mod counter;
pub mod device;
pub mod error;
pub mod gated;
pub mod interrupt;
pub mod mock;
pub mod scan;
pub mod session;

#[cfg(feature = "hardware")]
pub mod nidaqmx;
#[cfg(feature = "hardware")]
pub mod spinapi;

pub use crate::config::ExpConfig;
pub use crate::counter::{duration_from_secs, CounterPair, SyncCounter};
pub use crate::device::{CounterCard, CounterTask, PauseGate, PausePolarity, PbStatus, Sequencer};
pub use crate::error::{CtrlError, CtrlResult};
pub use crate::gated::{GatedChannels, GatedCounter, GatedCounts, GatedSample};
pub use crate::interrupt::Interrupter;
pub use crate::mock::{MockCounterCard, MockSequencer};
pub use crate::scan::{pulse_widths, RabiScan, ScanPoint, ScanSeries};
pub use crate::session::PulseSession;

#[cfg(feature = "hardware")]
pub use crate::nidaqmx::NiCard;
#[cfg(feature = "hardware")]
pub use crate::spinapi::PbBoard;
