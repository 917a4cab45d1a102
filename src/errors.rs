use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("device not connected, please connect first")]
    NotConnected,
    #[error("acquisition not started: {0}")]
    NotAcquiring(String),
    #[error("device terminated: {0}")]
    Terminated(TerminationReason),
    #[error("delivery queue full, frames rejected")]
    QueueFull,
}

#[cfg_attr(not(feature = "bluez"), allow(dead_code))]
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    NotFound { mac: String },
    #[error("pairing failed: {0}")]
    Pairing(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
}

/// Why a session left the connected states.
///
/// Recorded by the controller when it enters `TerminateStarting` and
/// surfaced to every later public call as [`DriverError::Terminated`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Connection to the device could not be established.
    ConnectFailed(String),
    /// Receive failed (timeout or remote closed) and retries were exhausted.
    Transmission(String),
    /// The data or impedance mode-entry command failed.
    ModeStartFailed(String),
    /// A keepalive heartbeat could not be sent while idle.
    HeartbeatFailed(String),
    /// The stop command failed while returning to idle.
    StopFailed(String),
    /// `close()` was called.
    Closed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ConnectFailed(e) => write!(f, "device connection failed: {e}"),
            TerminationReason::Transmission(e) => write!(f, "data transmission failed: {e}"),
            TerminationReason::ModeStartFailed(e) => {
                write!(f, "data/impedance mode initialization failed: {e}")
            }
            TerminationReason::HeartbeatFailed(e) => write!(f, "heartbeat failed: {e}"),
            TerminationReason::StopFailed(e) => write!(f, "stopping acquisition failed: {e}"),
            TerminationReason::Closed => write!(f, "device closed"),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
