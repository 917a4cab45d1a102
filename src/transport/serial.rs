use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use tokio_util::sync::CancellationToken;

use super::{Connector, DiscoveredDevice, Discovery, Transport};
use crate::errors::{DriverError, Result};

const BAUD_RATE: u32 = 921_600;
const IO_TIMEOUT_SECS: u64 = 5;
const COMMAND_WAIT_MS: u64 = 50;
const RECV_SIZE: usize = 1020;
const SCAN_INTERVAL_MS: u64 = 500;

/// USB VID/PID of the amplifier's CDC bridge.
pub const USB_VID: u16 = 0x0483;
pub const USB_PID: u16 = 0x5740;

// Every command is `55 66` + 4-byte verb + argument + `0A`.
const CMD_PREFIX: [u8; 2] = [0x55, 0x66];
const CMD_SUFFIX: u8 = 0x0A;

fn command(verb: &[u8; 4], arg: u8) -> [u8; 8] {
    [
        CMD_PREFIX[0],
        CMD_PREFIX[1],
        verb[0],
        verb[1],
        verb[2],
        verb[3],
        arg,
        CMD_SUFFIX,
    ]
}

fn rate_code(sample_rate: u32) -> Result<u8> {
    match sample_rate {
        500 => Ok(0x01),
        1000 => Ok(0x02),
        2000 => Ok(0x03),
        4000 => Ok(0x04),
        8000 => Ok(0x05),
        other => Err(DriverError::Config(format!(
            "no serial rate command for {other}Hz"
        ))),
    }
}

// ============================================================================
// Connector / Transport
// ============================================================================

/// Opens [`SerialTransport`]s on a fixed port and programs the sample rate.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    sample_rate: u32,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            port: port.into(),
            sample_rate,
            baud_rate: BAUD_RATE,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>> {
        let code = rate_code(self.sample_rate)?;
        debug!(
            "opening serial port: port={}, baud={}, rate={}Hz",
            self.port, self.baud_rate, self.sample_rate
        );
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(timeout.max(Duration::from_secs(IO_TIMEOUT_SECS)))
            .open()?;
        let mut transport = SerialTransport {
            port: Some(port),
            command_wait: Duration::from_millis(COMMAND_WAIT_MS),
        };
        transport.write(&command(b"RATE", code))?;
        transport.settle()?;
        info!("serial link established: port={}", self.port);
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        format!("serial {}", self.port)
    }
}

/// USB-serial link speaking framed commands.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    command_wait: Duration,
}

impl SerialTransport {
    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(DriverError::NotConnected)
    }

    fn write(&mut self, cmd: &[u8]) -> Result<()> {
        debug!("serial command: {:02X?}", cmd);
        self.port()?.write_all(cmd)?;
        Ok(())
    }

    /// The device echoes every mode command.
    fn read_ack(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut ack = vec![0u8; len];
        self.port()?.read_exact(&mut ack)?;
        Ok(ack)
    }

    /// Give the device time to answer, then drop whatever it sent.
    fn settle(&mut self) -> Result<()> {
        thread::sleep(self.command_wait);
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn start_data(&mut self) -> Result<()> {
        let cmd = command(b"MODE", b'W');
        self.write(&cmd)?;
        self.read_ack(cmd.len()).map(|_| ())
    }

    fn start_impedance(&mut self) -> Result<()> {
        let cmd = command(b"MODE", b'Z');
        self.write(&cmd)?;
        self.read_ack(cmd.len()).map(|_| ())
    }

    fn stop_recv(&mut self) -> Result<()> {
        self.write(&command(b"MODE", b'R'))?;
        self.settle()
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        match self.port()?.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                Err(DriverError::Timeout("data transmission timeout".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_heartbeat(&mut self) -> Result<u8> {
        let cmd = command(b"BATT", b'B');
        self.write(&cmd)?;
        let reply = self.read_ack(cmd.len() + 1)?;
        reply
            .last()
            .copied()
            .ok_or_else(|| DriverError::Protocol("empty battery reply".into()))
    }

    fn close(&mut self) -> Result<()> {
        if self.port.is_none() {
            return Ok(());
        }
        let stopped = self.stop_recv();
        self.port = None;
        stopped
    }

    fn recv_size(&self) -> usize {
        RECV_SIZE
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Polls the system's serial ports for amplifiers by USB VID/PID.
#[derive(Default)]
pub struct SerialDiscovery {
    token: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

impl SerialDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Display name from the USB serial number (`IR1_xxxx` → `iRe8-xxxx`).
fn display_name(serial_number: &str) -> String {
    let mut parts = serial_number.split('_');
    let family = parts.next().unwrap_or_default().to_lowercase();
    let suffix = serial_number.rsplit('_').next().unwrap_or_default();
    let channels = match family.as_str() {
        "ir1" => 8,
        "ir2" => 16,
        _ => 32,
    };
    format!("iRe{channels}-{suffix}")
}

fn scan(seen: &mut HashSet<String>, tx: &Sender<DiscoveredDevice>) -> Result<()> {
    for port in serialport::available_ports()? {
        let SerialPortType::UsbPort(usb) = &port.port_type else {
            continue;
        };
        if usb.vid != USB_VID || usb.pid != USB_PID {
            continue;
        }
        let name = display_name(usb.serial_number.as_deref().unwrap_or_default());
        if seen.insert(port.port_name.clone()) {
            info!("serial device found: name={}, port={}", name, port.port_name);
            if tx
                .send(DiscoveredDevice {
                    name,
                    address: port.port_name,
                })
                .is_err()
            {
                break;
            }
        }
    }
    Ok(())
}

impl Discovery for SerialDiscovery {
    fn start(&mut self) -> Result<Receiver<DiscoveredDevice>> {
        if self.worker.is_some() {
            return Err(DriverError::Command("discovery already running".into()));
        }
        let (tx, rx) = unbounded();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let worker = thread::Builder::new()
            .name("serial-discovery".into())
            .spawn(move || {
                let mut seen = HashSet::new();
                while !cancelled.is_cancelled() {
                    if let Err(e) = scan(&mut seen, &tx) {
                        warn!("serial port enumeration failed: {}", e);
                    }
                    thread::sleep(Duration::from_millis(SCAN_INTERVAL_MS));
                }
                debug!("serial discovery stopped");
            })?;
        self.token = Some(token);
        self.worker = Some(worker);
        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("serial discovery thread panicked");
            }
        }
    }
}

impl Drop for SerialDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}
