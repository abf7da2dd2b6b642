//! Pulse-program compiler for SpinCore PulseBlaster sequencers.
//!
//! - [`channel`]: 24-bit output masks and named channel maps.
//! - [`instruction`]: single sequencer instructions.
//! - [`program`]: instruction lists, control-flow validation and run-length simulation.
//! - [`rabi`]: the Rabi and CW ODMR sequences.
//!
//! Nothing here talks to hardware; uploading and running programs lives in `pbexpctrl_backend`.

pub mod channel;
pub mod error;
pub mod instruction;
pub mod program;
pub mod rabi;

#[cfg(feature = "python")]
mod python;

pub use channel::*;
pub use error::*;
pub use instruction::*;
pub use program::*;
pub use rabi::*;
