//! Compilers for the ODMR pulse programs: the looped Rabi sequence and continuous green light.
//!
//! ## Rabi sequence
//! One Rabi shot polarizes the spin with green light, applies a microwave pulse of length `mw`,
//! optionally waits, and reads out with the detection gate open while green is on. The shot
//! is repeated `loop_num` times inside a subroutine, so the main program is only a call and a
//! stop:
//!
//! | # | output                    | opcode   | data       | duration          |
//! |---|---------------------------|----------|------------|-------------------|
//! | 0 | green                     | JSR      | 2          | `green`           |
//! | 1 | idle                      | STOP     | 0          | 500               |
//! | 2 | idle                      | LOOP     | `loop_num` | `duty - mw - wait`|
//! | 3 | green                     | CONTINUE | 0          | `off - mw - wait` |
//! | 4 | mw (+ green)              | CONTINUE | 0          | `mw`              |
//! | 5 | idle (+ green)            | CONTINUE | 0          | `wait`            |
//! | 6 | detect + green            | CONTINUE | 0          | `det`             |
//! | 7 | green                     | END_LOOP | 2          | `green`           |
//! | 8 | idle                      | RTS      | 0          | 500               |
//!
//! The dark `LOOP` row and the green row before the pulse are both shortened by the
//! microwave and wait time. Rows 2 to 5 are left out when their duration is zero, and the
//! `LOOP` opcode then moves to the first row that remains. Whether green stays on during
//! rows 4 and 5 is chosen with [`MicrowaveEncoding`].
//!
//! Compilation never touches a device. Every program returned here has passed
//! [`PulseProgram::validate`].

use maplit::btreemap;
use std::collections::BTreeMap;
use tracing::debug;

use crate::channel::{ChannelMap, ChannelMask};
use crate::error::{CompileError, CompileResult};
use crate::instruction::*;
use crate::program::*;

/// Duration of the bookkeeping rows (`STOP`, `RTS`).
pub const BOOKKEEPING_NS: u64 = 500;

/// Whether the microwave and wait rows keep the green laser on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MicrowaveEncoding {
    /// `mw | green`, `idle | green`.
    #[default]
    WithGreen,
    /// `mw`, `idle`.
    Bare,
}

/// Output patterns used by the sequences in this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RabiChannels {
    pub green: ChannelMask,
    pub microwave: ChannelMask,
    pub detect: ChannelMask,
    pub idle: ChannelMask,
}

impl RabiChannels {
    /// Picks `green`, `detect` and the named microwave switch out of a channel map.
    /// The idle pattern has no user channel set.
    pub fn from_map(map: &ChannelMap, microwave: &str) -> CompileResult<Self> {
        Ok(RabiChannels {
            green: map.get("green")?,
            microwave: map.get(microwave)?,
            detect: map.get("detect")?,
            idle: ChannelMask::NONE,
        })
    }
}

impl Default for RabiChannels {
    /// Default wiring driving the first microwave switch (`mw1`).
    fn default() -> Self {
        RabiChannels {
            green: ChannelMask::line(0),
            microwave: ChannelMask::line(3),
            detect: ChannelMask::line(1),
            idle: ChannelMask::NONE,
        }
    }
}

/// Timing of one Rabi shot, all durations in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RabiTiming {
    /// Microwave pulse width, the scanned parameter.
    pub mw_ns: u64,
    /// Detection window.
    pub det_ns: u64,
    /// Green light before the microwave pulse.
    pub off_ns: u64,
    /// Green polarization after readout.
    pub green_ns: u64,
    /// Dark time available to the microwave pulse and the wait.
    pub duty_ns: u64,
    /// Delay between the microwave pulse and readout.
    pub wait_ns: u64,
    /// Number of shots per program run.
    pub loop_num: u32,
}

impl Default for RabiTiming {
    fn default() -> Self {
        RabiTiming {
            mw_ns: 0,
            det_ns: 400,
            off_ns: 3000,
            green_ns: 5000,
            duty_ns: 5000,
            wait_ns: 0,
            loop_num: 1_000_000,
        }
    }
}

fn non_negative(name: &'static str, minuend: u64, subtrahend: u64) -> CompileResult<u64> {
    minuend
        .checked_sub(subtrahend)
        .ok_or(CompileError::NegativeDelay {
            name,
            minuend,
            subtrahend,
        })
}

impl RabiTiming {
    /// Default timing with the given microwave width.
    pub fn with_mw_ns(mw_ns: u64) -> Self {
        RabiTiming {
            mw_ns,
            ..Default::default()
        }
    }

    /// Duration of the dark `LOOP` row: `duty - mw - wait`.
    ///
    /// ```
    /// use pbcompiler_backend::*;
    ///
    /// assert_eq!(RabiTiming::with_mw_ns(15).duty_delay_ns(), Ok(4985));
    /// assert!(RabiTiming::with_mw_ns(6000).duty_delay_ns().is_err());
    /// ```
    pub fn duty_delay_ns(&self) -> CompileResult<u64> {
        non_negative("duty - mw - wait", self.duty_ns, self.pulse_and_wait_ns()?)
    }

    /// Duration of the green row preceding the microwave pulse: `off - mw - wait`.
    pub fn resync_delay_ns(&self) -> CompileResult<u64> {
        non_negative("off - mw - wait", self.off_ns, self.pulse_and_wait_ns()?)
    }

    fn pulse_and_wait_ns(&self) -> CompileResult<u64> {
        self.mw_ns
            .checked_add(self.wait_ns)
            .ok_or(CompileError::TimingOverflow { name: "mw + wait" })
    }

    /// Length of one shot, i.e. one pass through the loop body.
    pub fn shot_ns(&self) -> CompileResult<u64> {
        [
            self.resync_delay_ns()?,
            self.mw_ns,
            self.wait_ns,
            self.det_ns,
            self.green_ns,
        ]
        .iter()
        .try_fold(self.duty_delay_ns()?, |total, &row| total.checked_add(row))
        .ok_or(CompileError::TimingOverflow { name: "shot" })
    }

    /// Named parameters, for logging and for the Python side.
    pub fn summary(&self) -> BTreeMap<&'static str, u64> {
        btreemap! {
            "mw" => self.mw_ns,
            "det" => self.det_ns,
            "off" => self.off_ns,
            "green" => self.green_ns,
            "duty" => self.duty_ns,
            "wait" => self.wait_ns,
            "loop_num" => u64::from(self.loop_num),
        }
    }

    /// Builds and validates the Rabi program for this timing.
    pub fn compile(
        &self,
        channels: &RabiChannels,
        encoding: MicrowaveEncoding,
    ) -> CompileResult<PulseProgram> {
        check_loop_count(self.loop_num)?;
        let duty_delay = self.duty_delay_ns()?;
        let resync_delay = self.resync_delay_ns()?;

        let (mw_out, wait_out) = match encoding {
            MicrowaveEncoding::WithGreen => (
                channels.microwave | channels.green,
                channels.idle | channels.green,
            ),
            MicrowaveEncoding::Bare => (channels.microwave, channels.idle),
        };

        let mut prog = PulseProgram::new();
        // Subroutine start is patched in once the rows before it are placed
        let call = prog.push(PulseInstr::new(channels.green, OpCode::Jsr, 0, self.green_ns));
        prog.push(PulseInstr::new(
            channels.idle,
            OpCode::Stop,
            0,
            BOOKKEEPING_NS,
        ));
        // The first row of the body carries the LOOP opcode
        let start = prog.len();
        let body = [
            (channels.idle, duty_delay),
            (channels.green, resync_delay),
            (mw_out, self.mw_ns),
            (wait_out, self.wait_ns),
        ]
        .into_iter()
        .filter(|&(_, duration)| duration > 0)
        .chain([(channels.detect | channels.green, self.det_ns)]);
        for (row, (output, duration)) in body.enumerate() {
            if row == 0 {
                prog.push(PulseInstr::new(output, OpCode::Loop, self.loop_num, duration));
            } else {
                prog.push(PulseInstr::hold(output, duration));
            }
        }
        prog.push(PulseInstr::new(
            channels.green,
            OpCode::EndLoop,
            start as u32,
            self.green_ns,
        ));
        prog.push(PulseInstr::new(channels.idle, OpCode::Rts, 0, BOOKKEEPING_NS));

        prog.set_target(call, start);
        prog.validate()?;
        debug!(
            "Compiled Rabi program: mw {} ns, {} instructions, {} shots",
            self.mw_ns,
            prog.len(),
            self.loop_num
        );
        Ok(prog)
    }
}

/// Continuous green light for CW ODMR: hold green and branch back to the top until the
/// sequencer is stopped. The program never halts on its own.
pub fn cw_program(channels: &RabiChannels, period_ns: u64) -> CompileResult<PulseProgram> {
    let mut prog = PulseProgram::new();
    let top = prog.push(PulseInstr::hold(channels.green, period_ns));
    prog.push(PulseInstr::new(
        channels.green,
        OpCode::Branch,
        top as u32,
        period_ns,
    ));
    prog.validate()?;
    Ok(prog)
}
