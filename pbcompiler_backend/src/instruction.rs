//! Provides definitions for single sequencer instructions.
//!
//! ## Main Structures and Enumerations:
//!
//! - `OpCode`: the closed set of control-flow operations understood by the PulseBlaster core,
//!   with the numeric codes expected by `pb_inst_pbonly`.
//!
//! - `PulseInstr`: one row of a pulse program. It holds the output pattern, the opcode, the
//!   opcode argument (loop count or branch target) and how long the pattern is held.
//!
//! Instructions are plain values. Whether a sequence of them forms a program the device can
//! execute is checked by [`crate::program::PulseProgram::validate`].

use std::fmt;

use crate::channel::ChannelMask;

/// Control-flow operation of an instruction.
///
/// | opcode     | `data` field                        |
/// |------------|-------------------------------------|
/// | `Continue` | ignored                             |
/// | `Stop`     | ignored                             |
/// | `Loop`     | number of iterations                |
/// | `EndLoop`  | index of the opening `Loop`         |
/// | `Jsr`      | index of the subroutine's first row |
/// | `Rts`      | ignored                             |
/// | `Branch`   | index to jump to                    |
///
/// An `EndLoop` jumps back to its `Loop` while iterations remain, so the `Loop` row itself is
/// part of the repeated body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continue,
    Stop,
    Loop,
    EndLoop,
    Jsr,
    Rts,
    Branch,
}

impl OpCode {
    /// Numeric code expected by spinapi.
    pub fn code(&self) -> i32 {
        match self {
            OpCode::Continue => 0,
            OpCode::Stop => 1,
            OpCode::Loop => 2,
            OpCode::EndLoop => 3,
            OpCode::Jsr => 4,
            OpCode::Rts => 5,
            OpCode::Branch => 6,
        }
    }

    /// Whether `data` is an instruction index.
    pub fn has_target(&self) -> bool {
        matches!(self, OpCode::EndLoop | OpCode::Jsr | OpCode::Branch)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // `pad` so that width specifiers line up program tables
        f.pad(match self {
            OpCode::Continue => "CONTINUE",
            OpCode::Stop => "STOP",
            OpCode::Loop => "LOOP",
            OpCode::EndLoop => "END_LOOP",
            OpCode::Jsr => "JSR",
            OpCode::Rts => "RTS",
            OpCode::Branch => "BRANCH",
        })
    }
}

/// One sequencer instruction: hold `output` for `duration_ns`, then act on `opcode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseInstr {
    pub output: ChannelMask,
    pub opcode: OpCode,
    pub data: u32,
    pub duration_ns: u64,
}

impl PulseInstr {
    pub fn new(output: ChannelMask, opcode: OpCode, data: u32, duration_ns: u64) -> Self {
        PulseInstr {
            output,
            opcode,
            data,
            duration_ns,
        }
    }

    /// Wrapper for the most common instruction: hold a pattern and fall through.
    pub fn hold(output: ChannelMask, duration_ns: u64) -> Self {
        PulseInstr::new(output, OpCode::Continue, 0, duration_ns)
    }

    /// `data` as an instruction index, for opcodes that jump.
    pub fn target(&self) -> Option<usize> {
        if self.opcode.has_target() {
            Some(self.data as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for PulseInstr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:024b}, {:<8}, {:>7}, {} ns]",
            self.output.output_word(),
            self.opcode,
            self.data,
            self.duration_ns
        )
    }
}
