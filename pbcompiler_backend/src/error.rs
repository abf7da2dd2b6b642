//! Error type for everything that can go wrong before a program reaches the device.
//!
//! Every variant describes an invalid configuration: a timing budget that goes negative,
//! a loop count the sequencer cannot hold, a malformed channel bit string, or a program
//! whose control flow does not close. None of them are produced by hardware, so callers
//! can reject them synchronously without any device having been touched.

use thiserror::Error;

/// Convenience alias for results produced by the compiler.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{name} = {minuend}ns - {subtrahend}ns would be negative")]
    NegativeDelay {
        name: &'static str,
        minuend: u64,
        subtrahend: u64,
    },

    #[error("{name} does not fit in 64 bits of nanoseconds")]
    TimingOverflow { name: &'static str },

    #[error("Loop count {requested} exceeds the hardware limit of {max}")]
    LoopCountTooLarge { requested: u32, max: u32 },

    #[error("Loop count must be at least 1")]
    ZeroLoopCount,

    #[error("Malformed channel bit string {input:?}: {reason}")]
    MalformedBitString { input: String, reason: String },

    #[error("Unknown channel {0:?}")]
    UnknownChannel(String),

    #[error("Instruction {index} has zero duration")]
    ZeroDuration { index: usize },

    #[error("Pulse program has no instructions")]
    EmptyProgram,

    #[error("Instruction {index} targets {target}, but the program has {len} instructions")]
    TargetOutOfRange {
        index: usize,
        target: usize,
        len: usize,
    },

    #[error("LOOP at instruction {index} has no matching END_LOOP")]
    UnmatchedLoop { index: usize },

    #[error("END_LOOP at instruction {index} does not close an open LOOP")]
    UnmatchedEndLoop { index: usize },

    #[error("Instruction {index} nests deeper than {max} levels")]
    NestingTooDeep { index: usize, max: usize },

    #[error("Subroutine called at instruction {index} (target {target}) never reaches RTS")]
    SubroutineWithoutReturn { index: usize, target: usize },
}
