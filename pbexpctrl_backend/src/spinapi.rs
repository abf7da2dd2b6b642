//! Provides a minimal rust wrapper for the SpinCore spinapi C library driving a PulseBlaster.
//!
//! [`PbBoard`] owns the board for as long as it lives: opening selects and initializes the
//! board and sets the core clock, dropping it closes the board. spinapi keeps the selected
//! board in global state, so only one `PbBoard` can exist per process.
//!
//! Every call that reports a status goes through [`pb_call`]. Errors carry the text of
//! `pb_get_error`, are logged with `tracing` and appended to `spinapi_error.logs` in the
//! directory of the calling shell.
//!
//! This module is only built with the `hardware` feature, which links against `spinapi`.

use libc;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use pbcompiler_backend::PulseProgram;

use crate::device::{PbStatus, Sequencer};
use crate::error::{CtrlError, CtrlResult};

type CInt = libc::c_int;
type CUint = libc::c_uint;
type CDouble = libc::c_double;
type CConstStr = *const libc::c_char;

/// Target of `pb_start_programming` for the pulse program memory.
pub const PULSE_PROGRAM: CInt = 0;

const DEVICE: &str = "PulseBlaster";

static BOARD_OPEN: AtomicBool = AtomicBool::new(false);

#[link(name = "spinapi")]
extern "C" {
    fn pb_count_boards() -> CInt;
    fn pb_select_board(board_num: CInt) -> CInt;
    fn pb_init() -> CInt;
    fn pb_core_clock(clock_freq: CDouble);
    fn pb_start_programming(device: CInt) -> CInt;
    fn pb_inst_pbonly(flags: CUint, inst: CInt, inst_data: CInt, length: CDouble) -> CInt;
    fn pb_stop_programming() -> CInt;
    fn pb_start() -> CInt;
    fn pb_stop() -> CInt;
    fn pb_read_status() -> CInt;
    fn pb_close() -> CInt;
    fn pb_get_error() -> CConstStr;
}

fn last_error() -> String {
    let ptr = unsafe { pb_get_error() };
    if ptr.is_null() {
        return "unknown error".to_string();
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

/// Calls a spinapi function and converts a negative return value into [`CtrlError::Driver`].
///
/// `what` names the call for the error message. Returns the (non-negative) value otherwise.
pub fn pb_call<F: FnOnce() -> CInt>(what: &str, func: F) -> CtrlResult<CInt> {
    let ret = func();
    if ret >= 0 {
        return Ok(ret);
    }
    let message = format!("{}: {}", what, last_error());
    error!("spinapi error {}: {}", ret, message);
    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./spinapi_error.logs")
        .and_then(|mut file| writeln!(file, "spinapi Error {}: {}", ret, message));
    if let Err(err) = logged {
        warn!("Failed to write spinapi_error.logs: {}", err);
    }
    Err(CtrlError::Driver {
        device: DEVICE.to_string(),
        code: ret,
        message,
    })
}

fn init_error(message: String) -> CtrlError {
    CtrlError::DeviceInit {
        device: DEVICE.to_string(),
        message,
    }
}

fn init_board(board: Option<i32>, core_clock_mhz: f64) -> CtrlResult<()> {
    let count = unsafe { pb_count_boards() };
    if count <= 0 {
        return Err(init_error(format!("no board found ({})", count)));
    }
    match board {
        Some(index) if index < 0 || index >= count => {
            return Err(init_error(format!(
                "board {} requested, {} installed",
                index, count
            )))
        }
        Some(index) => {
            pb_call("pb_select_board", || unsafe { pb_select_board(index) })?;
        }
        None if count > 1 => {
            return Err(init_error(format!(
                "{} boards installed, select one in the configuration",
                count
            )))
        }
        None => {}
    }
    pb_call("pb_init", || unsafe { pb_init() })
        .map_err(|err| init_error(err.to_string()))?;
    unsafe { pb_core_clock(core_clock_mhz) };
    info!(
        "Opened PulseBlaster board {} of {} at {} MHz",
        board.unwrap_or(0),
        count,
        core_clock_mhz
    );
    Ok(())
}

/// An open PulseBlaster board.
pub struct PbBoard {
    name: String,
}

impl PbBoard {
    /// Selects `board` (required when several are installed), initializes it and sets the
    /// core clock.
    pub fn open(board: Option<i32>, core_clock_mhz: f64) -> CtrlResult<Self> {
        if BOARD_OPEN.swap(true, Ordering::SeqCst) {
            return Err(init_error(
                "a board is already open in this process".to_string(),
            ));
        }
        if let Err(err) = init_board(board, core_clock_mhz) {
            BOARD_OPEN.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(PbBoard {
            name: format!("{}{}", DEVICE, board.unwrap_or(0)),
        })
    }
}

impl Sequencer for PbBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self, prog: &PulseProgram) -> CtrlResult<()> {
        pb_call("pb_start_programming", || unsafe {
            pb_start_programming(PULSE_PROGRAM)
        })?;
        for instr in prog {
            pb_call("pb_inst_pbonly", || unsafe {
                pb_inst_pbonly(
                    instr.output.output_word() as CUint,
                    instr.opcode.code() as CInt,
                    instr.data as CInt,
                    instr.duration_ns as CDouble,
                )
            })?;
        }
        pb_call("pb_stop_programming", || unsafe { pb_stop_programming() })?;
        debug!("Programmed {} instructions", prog.len());
        Ok(())
    }

    fn start(&mut self) -> CtrlResult<()> {
        pb_call("pb_start", || unsafe { pb_start() }).map(|_| ())
    }

    fn stop(&mut self) -> CtrlResult<()> {
        pb_call("pb_stop", || unsafe { pb_stop() }).map(|_| ())
    }

    fn status(&mut self) -> CtrlResult<PbStatus> {
        let bits = pb_call("pb_read_status", || unsafe { pb_read_status() })?;
        Ok(PbStatus::from_bits_truncate(bits as u32))
    }
}

impl Drop for PbBoard {
    fn drop(&mut self) {
        if let Err(err) = pb_call("pb_close", || unsafe { pb_close() }) {
            warn!("Failed to close {}: {}", self.name, err);
        }
        BOARD_OPEN.store(false, Ordering::SeqCst);
    }
}
