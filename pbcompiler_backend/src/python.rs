//! Python bindings, built with the `python` feature.
//!
//! The compiler is exposed as plain functions: Python passes the timing, gets back the
//! instruction table as a NumPy array of shape `(n, 4)` with columns
//! `(output word, opcode, data, duration in ns)`, ready to be fed to spinapi row by row.
//! Compile errors are raised as `ValueError`.
//!
//! ```python
//! from pbcompiler_backend import compile_rabi
//!
//! table = compile_rabi(15, loop_num=1000)
//! assert table[2, 3] == 4985
//! ```

use numpy;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use std::collections::BTreeMap;

use crate::channel::ChannelMap;
use crate::error::CompileError;
use crate::rabi::*;

impl From<CompileError> for PyErr {
    fn from(err: CompileError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

fn channels_from_py(
    channels: Option<Vec<(String, String)>>,
    microwave: &str,
) -> PyResult<RabiChannels> {
    let map = match channels {
        Some(pairs) => ChannelMap::from_bit_strings(
            pairs
                .iter()
                .map(|(name, bit_str)| (name.as_str(), bit_str.as_str())),
        )?,
        None => ChannelMap::odmr_default(),
    };
    Ok(RabiChannels::from_map(&map, microwave)?)
}

/// Compiles the Rabi program and returns its instruction table.
///
/// `channels`, if given, is a list of `(name, 24-character bit string)` pairs that must
/// define `green`, `detect` and the `microwave` channel.
#[pyfunction]
#[pyo3(signature = (
    mw, det=400, off=3000, green=5000, duty=5000, wait=0, loop_num=1_000_000,
    channels=None, microwave="mw1", bare=false
))]
#[allow(clippy::too_many_arguments)]
pub fn compile_rabi(
    py: Python,
    mw: u64,
    det: u64,
    off: u64,
    green: u64,
    duty: u64,
    wait: u64,
    loop_num: u32,
    channels: Option<Vec<(String, String)>>,
    microwave: &str,
    bare: bool,
) -> PyResult<PyObject> {
    let timing = RabiTiming {
        mw_ns: mw,
        det_ns: det,
        off_ns: off,
        green_ns: green,
        duty_ns: duty,
        wait_ns: wait,
        loop_num,
    };
    let encoding = if bare {
        MicrowaveEncoding::Bare
    } else {
        MicrowaveEncoding::WithGreen
    };
    let prog = timing.compile(&channels_from_py(channels, microwave)?, encoding)?;
    let arr = prog.to_array();
    Ok(numpy::PyArray::from_array(py, &arr).to_object(py))
}

/// Compiles the CW program (green on until stopped) and returns its instruction table.
#[pyfunction]
#[pyo3(signature = (period=1000, channels=None))]
pub fn compile_cw(
    py: Python,
    period: u64,
    channels: Option<Vec<(String, String)>>,
) -> PyResult<PyObject> {
    let prog = cw_program(&channels_from_py(channels, "mw1")?, period)?;
    let arr = prog.to_array();
    Ok(numpy::PyArray::from_array(py, &arr).to_object(py))
}

/// Dark time `duty - mw - wait` of the Rabi loop.
#[pyfunction]
#[pyo3(signature = (mw, duty=5000, wait=0))]
pub fn rabi_duty_delay(mw: u64, duty: u64, wait: u64) -> PyResult<u64> {
    let timing = RabiTiming {
        duty_ns: duty,
        wait_ns: wait,
        ..RabiTiming::with_mw_ns(mw)
    };
    Ok(timing.duty_delay_ns()?)
}

/// Lab default timing parameters, by name.
#[pyfunction]
pub fn rabi_defaults() -> BTreeMap<&'static str, u64> {
    RabiTiming::default().summary()
}

#[pymodule]
fn pbcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compile_rabi, m)?)?;
    m.add_function(wrap_pyfunction!(compile_cw, m)?)?;
    m.add_function(wrap_pyfunction!(rabi_duty_delay, m)?)?;
    m.add_function(wrap_pyfunction!(rabi_defaults, m)?)?;
    Ok(())
}
