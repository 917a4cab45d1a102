//! Byte-level links to the amplifier.
//!
//! The controller only ever talks to a device through the [`Transport`] trait:
//! mode commands, raw receive, heartbeat and close. A [`Connector`] knows how
//! to (re)create a transport, which is what allows a Wi-Fi link to be rebuilt
//! after a receive failure without the controller knowing the address.
//!
//! Concrete links:
//! - [`TcpTransport`]: Wi-Fi amplifiers, single-byte commands.
//! - [`SerialTransport`]: USB-serial amplifiers, framed commands.
//! - [`RfcommTransport`](crate::bluetooth::RfcommTransport): Bluetooth.
//! - [`mock`]: scripted in-process link used by the tests.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::bluetooth::RfcommConnector;
use crate::errors::{DriverError, Result};
use crate::frame::Frame;
use crate::profile::{DeviceConfig, TransportKind};

pub mod mock;
mod serial;
mod tcp;

pub use serial::{SerialConnector, SerialDiscovery, SerialTransport};
pub use tcp::{TcpConnector, TcpTransport};

/// Receive chunk size used when a transport does not override it.
pub const DEFAULT_RECV_SIZE: usize = 2048;

/// One open link to a device.
///
/// Every method may fail with a transport error; none of them retry on
/// their own. `recv` returning an empty buffer means "nothing arrived
/// within the link's poll window" and is not an error.
pub trait Transport: Send {
    /// Enter signal streaming mode.
    fn start_data(&mut self) -> Result<()>;

    /// Enter impedance measurement mode.
    fn start_impedance(&mut self) -> Result<()>;

    /// Leave either streaming mode and return to idle.
    fn stop_recv(&mut self) -> Result<()>;

    /// Read up to `max_bytes` of raw stream.
    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>>;

    /// Keepalive; returns the battery level in percent.
    fn send_heartbeat(&mut self) -> Result<u8>;

    /// Release the link. Further calls are undefined.
    fn close(&mut self) -> Result<()>;

    /// Preferred `recv` chunk size for this medium.
    fn recv_size(&self) -> usize {
        DEFAULT_RECV_SIZE
    }
}

/// Opens transports to one fixed device address.
pub trait Connector: Send + Sync {
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}

/// Consumer of the decoded frame stream (file writer, network forwarder).
///
/// Sinks receive exactly the batches the delivery queue would receive and
/// are closed when the acquisition ends. `write` runs on the receive thread
/// with no device lock held, so it may call back into the device; it must
/// not block on a stop or close of that same device.
pub trait FrameSink: Send {
    fn write(&mut self, frames: &[Frame]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// A device reported by a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Display name, e.g. `iRe16-0042`.
    pub name: String,
    /// Address accepted by the matching connector (port path, MAC, `host:port`).
    pub address: String,
}

/// Background device scan with its own thread and result channel.
pub trait Discovery: Send {
    /// Begin scanning. Newly found devices are reported once each.
    fn start(&mut self) -> Result<Receiver<DiscoveredDevice>>;

    /// Stop scanning and join the scan thread.
    fn stop(&mut self);
}

/// Pick the connector for `config`'s transport kind.
///
/// `address` is a serial port path, a Bluetooth MAC or a `host:port` pair.
pub fn connector_for(config: &DeviceConfig, address: &str) -> Result<Arc<dyn Connector>> {
    match config.transport() {
        TransportKind::Wifi => Ok(Arc::new(TcpConnector::new(address))),
        TransportKind::Serial => Ok(Arc::new(SerialConnector::new(address, config.sample_rate))),
        TransportKind::Bluetooth => Ok(Arc::new(RfcommConnector::new(address))),
        TransportKind::Mock => Err(DriverError::Config(
            "mock transport has no address; pass a MockConnector directly".into(),
        )),
    }
}
