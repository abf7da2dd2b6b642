//! Pulse programs: ordered instruction lists uploaded to the sequencer as a whole.
//!
//! A [`PulseProgram`] is assembled with [`PulseProgram::push`], which returns the index of the
//! new row so later rows (an `END_LOOP`, a `JSR`) can point back at it. Nothing is checked
//! while building; [`PulseProgram::validate`] checks the whole control-flow graph at once and
//! is called by every compiler in this crate before a program is handed out, and again by the
//! device session before upload.
//!
//! ## What `validate` guarantees
//! - the program is non-empty and every row lasts at least one nanosecond,
//! - every jump target lies inside the program,
//! - loops close in stack order, each `END_LOOP` naming the `LOOP` it closes, with counts in
//!   `1..=MAX_LOOP_COUNT` and at most [`MAX_NESTING`] levels,
//! - execution entering a subroutine through `JSR` reaches an `RTS` before any `STOP`, before
//!   running off the end, and without cycling.
//!
//! ## Run length
//! [`PulseProgram::run_length_ns`] simulates the program to find how long it runs before
//! `STOP`. Loop bodies are timed once and multiplied, which is exact because programs have no
//! data-dependent branches.

use ndarray::Array2;
use std::fmt;
use std::ops::Index;

use crate::error::{CompileError, CompileResult};
use crate::instruction::*;

/// Largest loop count accepted by the sequencer's loop counter.
pub const MAX_LOOP_COUNT: u32 = 1 << 20;

/// Hardware depth limit for nested loops.
pub const MAX_NESTING: usize = 8;

// Bound on simulated steps; a program that has not stopped by then is treated as free-running.
const MAX_SIMULATION_STEPS: usize = 1 << 20;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PulseProgram {
    instrs: Vec<PulseInstr>,
}

impl PulseProgram {
    pub fn new() -> Self {
        Self { instrs: Vec::new() }
    }

    /// Appends an instruction and returns its index.
    pub fn push(&mut self, instr: PulseInstr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    /// Points the jump at `index` to `target`. Does nothing for rows that do not jump.
    pub fn set_target(&mut self, index: usize, target: usize) {
        if let Some(instr) = self.instrs.get_mut(index) {
            if instr.opcode.has_target() {
                instr.data = target as u32;
            }
        }
    }

    pub fn instructions(&self) -> &[PulseInstr] {
        &self.instrs
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PulseInstr> {
        self.instrs.iter()
    }

    /// Checks the control-flow invariants listed in the module documentation.
    ///
    /// ```
    /// use pbcompiler_backend::*;
    ///
    /// let green = ChannelMask::line(0);
    /// let mut prog = PulseProgram::new();
    /// let start = prog.push(PulseInstr::new(green, OpCode::Loop, 10, 100));
    /// prog.push(PulseInstr::new(green, OpCode::EndLoop, start as u32, 100));
    /// prog.push(PulseInstr::new(green, OpCode::Stop, 0, 100));
    /// assert!(prog.validate().is_ok());
    ///
    /// // Without its END_LOOP the loop never closes
    /// let mut broken = PulseProgram::new();
    /// broken.push(PulseInstr::new(green, OpCode::Loop, 10, 100));
    /// broken.push(PulseInstr::new(green, OpCode::Stop, 0, 100));
    /// assert!(broken.validate().is_err());
    /// ```
    pub fn validate(&self) -> CompileResult<()> {
        if self.instrs.is_empty() {
            return Err(CompileError::EmptyProgram);
        }
        let len = self.instrs.len();
        let mut open_loops: Vec<usize> = Vec::new();

        for (index, instr) in self.instrs.iter().enumerate() {
            if instr.duration_ns == 0 {
                return Err(CompileError::ZeroDuration { index });
            }
            if let Some(target) = instr.target() {
                if target >= len {
                    return Err(CompileError::TargetOutOfRange { index, target, len });
                }
            }
            match instr.opcode {
                OpCode::Loop => {
                    check_loop_count(instr.data)?;
                    open_loops.push(index);
                    if open_loops.len() > MAX_NESTING {
                        return Err(CompileError::NestingTooDeep {
                            index,
                            max: MAX_NESTING,
                        });
                    }
                }
                OpCode::EndLoop => match open_loops.pop() {
                    Some(start) if start == instr.data as usize => {}
                    _ => return Err(CompileError::UnmatchedEndLoop { index }),
                },
                _ => {}
            }
        }
        if let Some(&index) = open_loops.first() {
            return Err(CompileError::UnmatchedLoop { index });
        }

        for (index, instr) in self.instrs.iter().enumerate() {
            if instr.opcode == OpCode::Jsr {
                let target = instr.data as usize;
                if !self.reaches_rts(target) {
                    return Err(CompileError::SubroutineWithoutReturn { index, target });
                }
            }
        }
        Ok(())
    }

    // Follows fall-through and branches from `start` until an RTS, a STOP, the end of the
    // program, or a revisited row.
    fn reaches_rts(&self, start: usize) -> bool {
        let mut visited = vec![false; self.instrs.len()];
        let mut pc = start;
        loop {
            match self.instrs.get(pc) {
                None => return false,
                Some(_) if visited[pc] => return false,
                Some(instr) => {
                    visited[pc] = true;
                    match instr.opcode {
                        OpCode::Rts => return true,
                        OpCode::Stop => return false,
                        OpCode::Branch => pc = instr.data as usize,
                        _ => pc += 1,
                    }
                }
            }
        }
    }

    /// Time from start until the `STOP` instruction has been output, in nanoseconds.
    ///
    /// Returns `None` for programs that never stop on their own (e.g. a `BRANCH` back to the
    /// top), or that run off the end or return from an empty call stack. Meant for valid programs.
    pub fn run_length_ns(&self) -> Option<u64> {
        struct LoopFrame {
            count: u32,
            entered_at: u64,
        }
        let mut elapsed: u64 = 0;
        let mut pc: usize = 0;
        let mut loops: Vec<LoopFrame> = Vec::new();
        let mut calls: Vec<usize> = Vec::new();

        for _ in 0..MAX_SIMULATION_STEPS {
            let instr = self.instrs.get(pc)?;
            let entered_at = elapsed;
            elapsed = elapsed.saturating_add(instr.duration_ns);
            match instr.opcode {
                OpCode::Continue => pc += 1,
                OpCode::Stop => return Some(elapsed),
                OpCode::Loop => {
                    loops.push(LoopFrame {
                        count: instr.data,
                        entered_at,
                    });
                    pc += 1;
                }
                OpCode::EndLoop => {
                    // The first pass has been timed, the remaining ones take just as long
                    let frame = loops.pop()?;
                    let body = elapsed - frame.entered_at;
                    let repeats = u64::from(frame.count.saturating_sub(1));
                    elapsed = elapsed.saturating_add(body.saturating_mul(repeats));
                    pc += 1;
                }
                OpCode::Jsr => {
                    calls.push(pc + 1);
                    pc = instr.data as usize;
                }
                OpCode::Rts => pc = calls.pop()?,
                OpCode::Branch => pc = instr.data as usize,
            }
        }
        None
    }

    /// Instruction table with one row per instruction:
    /// `(output word, opcode, data, duration in ns)`.
    pub fn to_array(&self) -> Array2<u64> {
        Array2::from_shape_fn((self.instrs.len(), 4), |(i, j)| {
            let instr = &self.instrs[i];
            match j {
                0 => u64::from(instr.output.output_word()),
                1 => instr.opcode.code() as u64,
                2 => u64::from(instr.data),
                _ => instr.duration_ns,
            }
        })
    }
}

/// Rejects loop counts the hardware cannot hold.
pub fn check_loop_count(count: u32) -> CompileResult<()> {
    if count == 0 {
        return Err(CompileError::ZeroLoopCount);
    }
    if count > MAX_LOOP_COUNT {
        return Err(CompileError::LoopCountTooLarge {
            requested: count,
            max: MAX_LOOP_COUNT,
        });
    }
    Ok(())
}

impl Index<usize> for PulseProgram {
    type Output = PulseInstr;
    fn index(&self, index: usize) -> &PulseInstr {
        &self.instrs[index]
    }
}

impl<'a> IntoIterator for &'a PulseProgram {
    type Item = &'a PulseInstr;
    type IntoIter = std::slice::Iter<'a, PulseInstr>;
    fn into_iter(self) -> Self::IntoIter {
        self.instrs.iter()
    }
}

impl fmt::Display for PulseProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (index, instr) in self.instrs.iter().enumerate() {
            writeln!(f, "{:>3} {}", index, instr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelMask;

    fn green() -> ChannelMask {
        ChannelMask::line(0)
    }

    fn looped(count: u32) -> PulseProgram {
        let mut prog = PulseProgram::new();
        let start = prog.push(PulseInstr::new(green(), OpCode::Loop, count, 100));
        prog.push(PulseInstr::hold(ChannelMask::NONE, 50));
        prog.push(PulseInstr::new(green(), OpCode::EndLoop, start as u32, 25));
        prog.push(PulseInstr::new(ChannelMask::NONE, OpCode::Stop, 0, 10));
        prog
    }

    #[test]
    fn empty_and_zero_duration() {
        assert_eq!(PulseProgram::new().validate(), Err(CompileError::EmptyProgram));
        let mut prog = PulseProgram::new();
        prog.push(PulseInstr::hold(green(), 10));
        prog.push(PulseInstr::new(green(), OpCode::Stop, 0, 0));
        assert_eq!(prog.validate(), Err(CompileError::ZeroDuration { index: 1 }));
    }

    #[test]
    fn loop_counts() {
        assert!(looped(1).validate().is_ok());
        assert!(looped(MAX_LOOP_COUNT).validate().is_ok());
        assert_eq!(looped(0).validate(), Err(CompileError::ZeroLoopCount));
        assert_eq!(
            looped(MAX_LOOP_COUNT + 1).validate(),
            Err(CompileError::LoopCountTooLarge {
                requested: MAX_LOOP_COUNT + 1,
                max: MAX_LOOP_COUNT
            })
        );
    }

    #[test]
    fn end_loop_must_name_its_loop() {
        let mut prog = PulseProgram::new();
        prog.push(PulseInstr::hold(green(), 10));
        prog.push(PulseInstr::new(green(), OpCode::Loop, 3, 10));
        prog.push(PulseInstr::new(green(), OpCode::EndLoop, 0, 10));
        prog.push(PulseInstr::new(green(), OpCode::Stop, 0, 10));
        assert_eq!(
            prog.validate(),
            Err(CompileError::UnmatchedEndLoop { index: 2 })
        );

        let mut stray = PulseProgram::new();
        stray.push(PulseInstr::new(green(), OpCode::EndLoop, 0, 10));
        assert_eq!(
            stray.validate(),
            Err(CompileError::UnmatchedEndLoop { index: 0 })
        );
    }

    #[test]
    fn nesting_limit() {
        let mut prog = PulseProgram::new();
        let starts: Vec<usize> = (0..=MAX_NESTING)
            .map(|_| prog.push(PulseInstr::new(green(), OpCode::Loop, 2, 10)))
            .collect();
        for start in starts.iter().rev() {
            prog.push(PulseInstr::new(green(), OpCode::EndLoop, *start as u32, 10));
        }
        prog.push(PulseInstr::new(green(), OpCode::Stop, 0, 10));
        assert_eq!(
            prog.validate(),
            Err(CompileError::NestingTooDeep {
                index: MAX_NESTING,
                max: MAX_NESTING
            })
        );
    }

    #[test]
    fn targets_in_range() {
        let mut prog = PulseProgram::new();
        prog.push(PulseInstr::new(green(), OpCode::Branch, 7, 10));
        assert_eq!(
            prog.validate(),
            Err(CompileError::TargetOutOfRange {
                index: 0,
                target: 7,
                len: 1
            })
        );
    }

    #[test]
    fn subroutine_needs_rts() {
        let mut prog = PulseProgram::new();
        prog.push(PulseInstr::new(green(), OpCode::Jsr, 2, 10));
        prog.push(PulseInstr::new(green(), OpCode::Stop, 0, 10));
        prog.push(PulseInstr::hold(green(), 10));
        prog.push(PulseInstr::new(green(), OpCode::Stop, 0, 10));
        assert_eq!(
            prog.validate(),
            Err(CompileError::SubroutineWithoutReturn {
                index: 0,
                target: 2
            })
        );

        // A branch cycle inside the subroutine never returns either
        let mut cycle = PulseProgram::new();
        cycle.push(PulseInstr::new(green(), OpCode::Jsr, 2, 10));
        cycle.push(PulseInstr::new(green(), OpCode::Stop, 0, 10));
        cycle.push(PulseInstr::new(green(), OpCode::Branch, 2, 10));
        assert!(cycle.validate().is_err());
    }

    #[test]
    fn run_length_multiplies_loop_body() {
        // (100 + 50 + 25) per pass, 1000 passes, then STOP
        assert_eq!(looped(1000).run_length_ns(), Some(175 * 1000 + 10));
        assert_eq!(looped(1).run_length_ns(), Some(175 + 10));
    }

    #[test]
    fn run_length_through_subroutine_and_nested_loops() {
        let mut prog = PulseProgram::new();
        prog.push(PulseInstr::new(green(), OpCode::Jsr, 2, 7));
        prog.push(PulseInstr::new(green(), OpCode::Stop, 0, 3));
        let outer = prog.push(PulseInstr::new(green(), OpCode::Loop, 3, 10));
        let inner = prog.push(PulseInstr::new(green(), OpCode::Loop, 4, 1));
        prog.push(PulseInstr::new(green(), OpCode::EndLoop, inner as u32, 1));
        prog.push(PulseInstr::new(green(), OpCode::EndLoop, outer as u32, 10));
        prog.push(PulseInstr::new(green(), OpCode::Rts, 0, 5));
        assert!(prog.validate().is_ok());
        // outer pass: 10 + 4 * (1 + 1) + 10 = 28
        assert_eq!(prog.run_length_ns(), Some(7 + 3 * 28 + 5 + 3));
    }

    #[test]
    fn free_running_program_has_no_run_length() {
        let mut prog = PulseProgram::new();
        prog.push(PulseInstr::hold(green(), 10));
        prog.push(PulseInstr::new(green(), OpCode::Branch, 0, 10));
        assert!(prog.validate().is_ok());
        assert_eq!(prog.run_length_ns(), None);
    }

    #[test]
    fn table_rows() {
        let table = looped(5).to_array();
        assert_eq!(table.shape(), &[4, 4]);
        assert_eq!(table[[0, 1]], OpCode::Loop.code() as u64);
        assert_eq!(table[[0, 2]], 5);
        assert_eq!(table[[2, 2]], 0);
        assert_eq!(table[[1, 0]], u64::from(crate::channel::IDLE_FLAGS));
        assert_eq!(table[[3, 3]], 10);
    }
}
