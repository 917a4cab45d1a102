//! Acquisition engine for EEG/EMG amplifiers.
//!
//! The crate turns the raw byte stream of an amplifier (serial, Bluetooth
//! RFCOMM or Wi-Fi) into calibrated multi-channel frames, drives the device
//! through its idle / signal / impedance modes, and estimates electrode
//! impedance online.
//!
//! # Pipeline
//!
//! ```text
//! Transport bytes -> FrameDecoder -> { DeliveryQueue, FrameSinks }  (signal mode)
//!                                 -> ImpedanceEstimator           (impedance mode)
//! ```
//!
//! Hardware families are described by a [`DeviceProfile`] value (header,
//! channel layout, scale, byte order, trailer fields), never by a dedicated
//! parser type.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use exg_acq::{Device, DeviceConfig, DeviceProfile};
//!
//! # fn main() -> exg_acq::Result<()> {
//! let config = DeviceConfig::new(DeviceProfile::irecorder("USB16")?, 1000)?;
//! let device = Device::new(config);
//! device.connect_to("/dev/ttyACM0")?;
//! device.start_acquisition_data(true)?;
//! let frames = device.get_data(Some(Duration::from_millis(100)))?;
//! println!("{} frames, {} dropped", frames.len(), device.get_dropped_packet_count());
//! device.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Timing
//!
//! Frames carry no timestamps. Reconstruct sample times from the start of
//! acquisition and the configured rate, and use the dropped-packet count
//! (sequence gaps) to detect holes.

pub mod bluetooth;
pub mod controller;
pub mod decoder;
mod errors;
pub mod frame;
pub mod impedance;
pub mod logging;
pub mod profile;
#[cfg(feature = "python")]
mod python;
pub mod queue;
pub mod transport;

pub use bluetooth::{RfcommConnector, RfcommStream, RfcommTransport};
pub use controller::{ControllerOptions, ControllerState, Device};
pub use decoder::{DecodeStats, FrameDecoder, SequenceTracker};
pub use errors::*;
pub use frame::Frame;
pub use impedance::{compute_impedance, ImpedanceEstimator, ImpedanceReadout, ImpedanceWindow};
pub use profile::{
    AuxField, ByteOrder, ChecksumKind, DeviceConfig, DeviceProfile, FrameLayout, ImpedanceParams,
    TransportKind,
};
pub use queue::{DeliveryQueue, Overflow, QueuePolicy};
pub use transport::{
    connector_for, Connector, DiscoveredDevice, Discovery, FrameSink, SerialConnector,
    SerialDiscovery, SerialTransport, TcpConnector, TcpTransport, Transport,
};
