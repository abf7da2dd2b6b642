//! Provides a minimal rust wrapper for the counter/timer parts of the NI-DAQmx C library.
//!
//! ## Overview
//!
//! The core of this module is the [`NiTask`] struct which represents an NI-DAQmx task. It encapsulates
//! a handle to an NI-DAQmx task and provides methods that map to DAQmx C-functions: creating
//! edge-counting and pulse-generating counter channels, configuring a digital-level pause trigger,
//! starting, stopping, polling and reading the task. [`NiCard`] implements
//! [`CounterCard`](crate::device::CounterCard) on top of it.
//!
//! **Refer to implementations of the [`NiTask`] struct to see the wrapped methods and invoked
//! [DAQmx C-functions](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)**
//!
//! ## Error Handling
//!
//! Every DAQmx call goes through [`daqmx_call`], which turns a negative status code into
//! [`CtrlError::Driver`] carrying the extended error information. Read timeouts are reported as
//! [`CtrlError::Timeout`].
//! ***In addition to being logged with `tracing`, NI-DAQmx driver errors are saved in
//! `nidaqmx_error.logs` file in the directory of the calling shell.
//!
//! ## Cleanup and Resource Management
//!
//! The `NiTask` struct implements the `Drop` trait and clears its task when it goes out of scope.
//!
//! This module is only built with the `hardware` feature, which links against `NIDAQmx`.

use libc;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::device::*;
use crate::error::{CtrlError, CtrlResult};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_COUNTUP: CInt32 = 10128;
pub const DAQMX_VAL_SECONDS: CInt32 = 10364;
pub const DAQMX_VAL_LOW: CInt32 = 10214;
pub const DAQMX_VAL_HIGH: CInt32 = 10192;
pub const DAQMX_VAL_DIGLVL: CInt32 = 10152;

/// Status codes meaning "the operation did not complete in time".
pub const DAQMX_TIMEOUT_CODES: [CInt32; 2] = [-200560, -200474];

/// Low time of the counting pulse, before it goes high.
const PULSE_LOW_TIME_S: CFloat64 = 1e-4;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;
    fn DAQmxIsTaskDone(handle: TaskHandle, isTaskDone: *mut CBool32) -> CInt32;

    fn DAQmxCreateCICountEdgesChan(
        handle: TaskHandle,
        counter: CConstStr,
        nameToAssignToChannel: CConstStr,
        edge: CInt32,
        initialCount: CUint32,
        countDirection: CInt32,
    ) -> CInt32;
    fn DAQmxCreateCOPulseChanTime(
        handle: TaskHandle,
        counter: CConstStr,
        nameToAssignToChannel: CConstStr,
        units: CInt32,
        idleState: CInt32,
        initialDelay: CFloat64,
        lowTime: CFloat64,
        highTime: CFloat64,
    ) -> CInt32;

    fn DAQmxSetPauseTrigType(handle: TaskHandle, data: CInt32) -> CInt32;
    fn DAQmxSetDigLvlPauseTrigSrc(handle: TaskHandle, data: CConstStr) -> CInt32;
    fn DAQmxSetDigLvlPauseTrigWhen(handle: TaskHandle, data: CInt32) -> CInt32;

    fn DAQmxReadCounterScalarU32(
        handle: TaskHandle,
        timeout: CFloat64,
        value: *mut CUint32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

fn to_cstring(s: &str) -> CtrlResult<CString> {
    CString::new(s).map_err(|e| CtrlError::Config(format!("{:?}: {}", s, e)))
}

/// Calls a DAQmx C-function and converts a failure into [`CtrlError::Driver`].
///
/// Every DAQmx C-function call returns a `int32` which, if negative, indicates an error.
/// The extended error information is then retrieved with `DAQmxGetExtendedErrorInfo`, appended to
/// `nidaqmx_error.logs` and logged before the error is returned. `context` names the task or
/// channel involved.
///
/// ```ignore
/// daqmx_call("Dev1/ctr0", || unsafe { DAQmxStartTask(handle) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(context: &str, func: F) -> CtrlResult<()> {
    let err_code = func();
    if err_code >= 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let error_string = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    error!("DAQmx Error on {}: {}", context, error_string);
    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./nidaqmx_error.logs")
        .and_then(|mut file| writeln!(file, "DAQmx Error: {}", error_string));
    if let Err(err) = logged {
        warn!("Failed to write nidaqmx_error.logs: {}", err);
    }
    Err(CtrlError::Driver {
        device: context.to_string(),
        code: err_code,
        message: error_string,
    })
}

/// Represents a National Instruments (NI) DAQmx task with a single counter channel.
///
/// Creating an instance corresponds to creating a new NI-DAQmx task; dropping it clears the task.
pub struct NiTask {
    handle: TaskHandle,
    name: String,
}

impl NiTask {
    /// Creates an empty task; `name` is the physical channel it will hold, used in errors.
    pub fn new(name: &str) -> CtrlResult<Self> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = to_cstring("")?;
        daqmx_call(name, || unsafe {
            DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle)
        })?;
        Ok(Self {
            handle: taskhandle,
            name: name.to_string(),
        })
    }

    pub fn clear(&self) -> CtrlResult<()> {
        daqmx_call(&self.name, || unsafe { DAQmxClearTask(self.handle) })
    }

    pub fn create_ci_count_edges_chan(&self, counter: &str) -> CtrlResult<()> {
        let counter_cstr = to_cstring(counter)?;
        let assigned_name_cstr = to_cstring("")?;
        daqmx_call(&self.name, || unsafe {
            DAQmxCreateCICountEdgesChan(
                self.handle,
                counter_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_RISING,
                0,
                DAQMX_VAL_COUNTUP,
            )
        })
    }

    /// A single pulse, idle low, going high for `high_time`.
    pub fn create_co_pulse_chan_time(&self, counter: &str, high_time: Duration) -> CtrlResult<()> {
        let counter_cstr = to_cstring(counter)?;
        let assigned_name_cstr = to_cstring("")?;
        daqmx_call(&self.name, || unsafe {
            DAQmxCreateCOPulseChanTime(
                self.handle,
                counter_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_SECONDS,
                DAQMX_VAL_LOW,
                0.0,
                PULSE_LOW_TIME_S,
                high_time.as_secs_f64(),
            )
        })
    }

    pub fn cfg_dig_lvl_pause_trigger(&self, gate: &PauseGate) -> CtrlResult<()> {
        let src_cstr = to_cstring(&gate.terminal)?;
        let when = match gate.pause_when {
            PausePolarity::Low => DAQMX_VAL_LOW,
            PausePolarity::High => DAQMX_VAL_HIGH,
        };
        daqmx_call(&self.name, || unsafe { DAQmxSetPauseTrigType(self.handle, DAQMX_VAL_DIGLVL) })?;
        daqmx_call(&self.name, || unsafe {
            DAQmxSetDigLvlPauseTrigSrc(self.handle, src_cstr.as_ptr())
        })?;
        daqmx_call(&self.name, || unsafe { DAQmxSetDigLvlPauseTrigWhen(self.handle, when) })
    }
}

impl CounterTask for NiTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> CtrlResult<()> {
        debug!("DAQmxStartTask {}", self.name);
        daqmx_call(&self.name, || unsafe { DAQmxStartTask(self.handle) })
    }

    fn stop(&mut self) -> CtrlResult<()> {
        debug!("DAQmxStopTask {}", self.name);
        daqmx_call(&self.name, || unsafe { DAQmxStopTask(self.handle) })
    }

    fn is_done(&mut self) -> CtrlResult<bool> {
        let mut done: CBool32 = 0;
        daqmx_call(&self.name, || unsafe {
            DAQmxIsTaskDone(self.handle, &mut done as *mut CBool32)
        })?;
        Ok(done != 0)
    }

    fn read_scalar(&mut self, timeout: Duration) -> CtrlResult<u32> {
        let mut value: CUint32 = 0;
        daqmx_call(&self.name, || unsafe {
            DAQmxReadCounterScalarU32(
                self.handle,
                timeout.as_secs_f64(),
                &mut value as *mut CUint32,
                std::ptr::null_mut(),
            )
        })
        .map_err(|err| match err {
            CtrlError::Driver { code, .. } if DAQMX_TIMEOUT_CODES.contains(&code) => {
                CtrlError::Timeout {
                    task: self.name.clone(),
                    timeout,
                }
            }
            other => other,
        })?;
        Ok(value as u32)
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            warn!("Failed to clear task {}: {}", self.name, err);
        }
    }
}

/// The NI counter/timer card. Channels are addressed by full name (`Dev1/ctr0`), so one value
/// serves every device in the system.
#[derive(Clone, Copy, Debug, Default)]
pub struct NiCard;

impl CounterCard for NiCard {
    type Task = NiTask;

    fn edge_counter(&self, chan: &str, gate: Option<&PauseGate>) -> CtrlResult<NiTask> {
        let task = NiTask::new(chan)?;
        task.create_ci_count_edges_chan(chan)?;
        if let Some(gate) = gate {
            task.cfg_dig_lvl_pause_trigger(gate)?;
        }
        Ok(task)
    }

    fn pulse_timer(&self, chan: &str, high_time: Duration) -> CtrlResult<NiTask> {
        let task = NiTask::new(chan)?;
        task.create_co_pulse_chan_time(chan, high_time)?;
        Ok(task)
    }
}
