//! Python bindings.
//!
//! Exposes [`Device`] as `exg_acq.Device` and decoded packets as
//! `exg_acq.Frame`. Every blocking call releases the GIL while it waits on
//! the acquisition worker.

use std::time::Duration;

use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::controller::Device;
use crate::errors::DriverError;
use crate::frame::Frame;
use crate::logging;
use crate::profile::{DeviceConfig, DeviceProfile};

/// Convert a Python timeout in seconds. `None`, infinity and values beyond
/// `Duration::MAX` wait without limit; negative and NaN values poll once.
fn timeout_from_secs(timeout: Option<f64>) -> Option<Duration> {
    let secs = timeout?;
    if secs.is_nan() {
        return Some(Duration::ZERO);
    }
    Duration::try_from_secs_f64(secs.max(0.0)).ok()
}

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::Config(msg) => PyValueError::new_err(msg),
        DriverError::Timeout(msg) => PyTimeoutError::new_err(msg),
        e @ (DriverError::NotConnected
        | DriverError::Terminated(_)
        | DriverError::Io(_)
        | DriverError::Serial(_)
        | DriverError::Bluetooth(_)) => PyConnectionError::new_err(e.to_string()),
        e => PyRuntimeError::new_err(e.to_string()),
    }
}

/// One decoded packet.
///
/// Attributes:
///     seq: Packet counter (0-255, wrapping).
///     samples: Scaled samples per sub-frame, `[sub_frame][channel]` in µV.
///     aux: Scaled auxiliary values (IMU axes), in profile order.
///     trigger: Trigger byte, or None when the device has no trigger input.
///     battery: Battery percent carried by the packet, or None.
#[pyclass(name = "Frame", frozen)]
#[derive(Clone)]
struct PyFrame {
    #[pyo3(get)]
    seq: u8,
    #[pyo3(get)]
    samples: Vec<Vec<f64>>,
    #[pyo3(get)]
    aux: Vec<f64>,
    #[pyo3(get)]
    trigger: Option<u8>,
    #[pyo3(get)]
    battery: Option<u8>,
}

#[pymethods]
impl PyFrame {
    fn __repr__(&self) -> String {
        format!(
            "Frame(seq={}, sub_frames={}, trigger={:?}, battery={:?})",
            self.seq,
            self.samples.len(),
            self.trigger,
            self.battery
        )
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("seq", self.seq)?;
        dict.set_item("samples", self.samples.clone())?;
        dict.set_item("aux", self.aux.clone())?;
        dict.set_item("trigger", self.trigger)?;
        dict.set_item("battery", self.battery)?;
        Ok(dict)
    }
}

impl From<Frame> for PyFrame {
    fn from(f: Frame) -> Self {
        PyFrame {
            seq: f.seq,
            samples: f.samples,
            aux: f.aux,
            trigger: f.trigger,
            battery: f.battery,
        }
    }
}

/// Amplifier handle.
///
/// Example:
///     >>> dev = Device("USB16", fs=1000)
///     >>> dev.connect_device("/dev/ttyACM0")
///     >>> dev.start_acquisition_data()
///     >>> rows = dev.get_data(timeout=0.1)
///     >>> dev.close_dev()
#[pyclass(name = "Device")]
struct PyDevice {
    inner: Device,
}

impl PyDevice {
    fn build(profile: DeviceProfile, fs: u32, channels: Option<Vec<usize>>) -> PyResult<Self> {
        let config = DeviceConfig::new(profile, fs)
            .and_then(|c| c.with_channels(channels.unwrap_or_default()))
            .map_err(to_py_err)?;
        Ok(Self {
            inner: Device::new(config),
        })
    }
}

#[pymethods]
impl PyDevice {
    /// Create a handle for an iRecorder model (`W8`, `W16`, `W32`, `USB8`,
    /// `USB16`, `USB32`).
    ///
    /// Raises:
    ///     ValueError: unknown model, unsupported rate or invalid channels.
    #[new]
    #[pyo3(signature = (dev_type, fs=500, channels=None))]
    fn new(dev_type: &str, fs: u32, channels: Option<Vec<usize>>) -> PyResult<Self> {
        let profile = DeviceProfile::irecorder(dev_type).map_err(to_py_err)?;
        Self::build(profile, fs, channels)
    }

    /// Create a handle from a JSON device profile.
    #[staticmethod]
    #[pyo3(signature = (profile_json, fs, channels=None))]
    fn from_profile(profile_json: &str, fs: u32, channels: Option<Vec<usize>>) -> PyResult<Self> {
        let profile = DeviceProfile::from_json(profile_json).map_err(to_py_err)?;
        Self::build(profile, fs, channels)
    }

    /// Sampling rates supported by an iRecorder model.
    #[staticmethod]
    fn get_available_frequency(dev_type: &str) -> PyResult<Vec<u32>> {
        DeviceProfile::irecorder(dev_type)
            .map(|p| p.supported_rates)
            .map_err(to_py_err)
    }

    /// Connect to a port path, Bluetooth MAC or `host:port`.
    fn connect_device(&self, py: Python<'_>, addr: &str) -> PyResult<()> {
        py.detach(|| self.inner.connect_to(addr)).map_err(to_py_err)
    }

    /// Select the acquired channels (hardware indices, output order). An
    /// empty list selects all. Only allowed while idle or disconnected.
    fn update_channels(&self, channels: Vec<usize>) -> PyResult<()> {
        self.inner.update_channels(channels).map_err(to_py_err)
    }

    #[pyo3(signature = (with_queue=true))]
    fn start_acquisition_data(&self, py: Python<'_>, with_queue: bool) -> PyResult<()> {
        py.detach(|| self.inner.start_acquisition_data(with_queue))
            .map_err(to_py_err)
    }

    /// Rows of `[channels..., trigger]` decoded since the last call.
    ///
    /// Args:
    ///     timeout: Seconds to wait for data; None waits until data arrives.
    #[pyo3(signature = (timeout=Some(0.02)))]
    fn get_data(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Vec<Vec<f64>>> {
        let timeout = timeout_from_secs(timeout);
        let frames = py
            .detach(|| self.inner.get_data(timeout))
            .map_err(to_py_err)?;
        Ok(frames.iter().flat_map(Frame::rows).collect())
    }

    /// Like `get_data`, but returns `Frame` objects.
    #[pyo3(signature = (timeout=Some(0.02)))]
    fn get_frames(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Vec<PyFrame>> {
        let timeout = timeout_from_secs(timeout);
        let frames = py
            .detach(|| self.inner.get_data(timeout))
            .map_err(to_py_err)?;
        Ok(frames.into_iter().map(PyFrame::from).collect())
    }

    fn stop_acquisition(&self, py: Python<'_>) -> PyResult<()> {
        py.detach(|| self.inner.stop_acquisition()).map_err(to_py_err)
    }

    fn start_acquisition_impedance(&self, py: Python<'_>) -> PyResult<()> {
        py.detach(|| self.inner.start_acquisition_impedance())
            .map_err(to_py_err)
    }

    /// Per-channel impedance in ohms (`inf` for open electrodes), or None
    /// until the first window completes.
    fn get_impedance(&self) -> PyResult<Option<Vec<f64>>> {
        self.inner.get_impedance().map_err(to_py_err)
    }

    fn get_battery_value(&self) -> u8 {
        self.inner.get_battery()
    }

    fn get_packet_drop_times(&self) -> u64 {
        self.inner.get_dropped_packet_count()
    }

    fn get_checksum_error_count(&self) -> u64 {
        self.inner.get_checksum_error_count()
    }

    /// One of `TERMINATED`, `IDLE`, `SIGNAL`, `IMPEDANCE` or a transitional
    /// `*_STARTING` state.
    fn get_dev_status(&self) -> &'static str {
        self.inner.state().as_str()
    }

    fn close_dev(&self, py: Python<'_>) -> PyResult<()> {
        py.detach(|| self.inner.close()).map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        let config = self.inner.config();
        format!(
            "Device({}, fs={}Hz, channels={}, state={})",
            config.profile.name,
            config.sample_rate,
            config.channels.len(),
            self.inner.state()
        )
    }
}

/// Route the driver's logs into Python's `logging` at `level` (or the
/// `EXG_ACQ_LOG` default).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

#[pymodule]
fn exg_acq(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;
    m.add_class::<PyDevice>()?;
    m.add_class::<PyFrame>()?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add("DEFAULT_SAMPLING_RATE", 500u32)?;
    Ok(())
}
