//! Bluetooth RFCOMM link.
//!
//! Without features the socket is opened with raw libc calls and the device
//! must already be paired and trusted (e.g. via `bluetoothctl`). With the
//! `bluez` feature the connector scans for the device, pairs it with a PIN
//! agent if needed and then opens the socket through BlueZ.
//!
//! Either way the result is a blocking [`RfcommStream`] with kernel-level
//! read/write timeouts, wrapped in an [`RfcommTransport`] that speaks the
//! amplifier's single-byte command set.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::thread;
use std::time::Duration;
#[cfg(feature = "bluez")]
use std::time::Instant;

#[cfg(feature = "bluez")]
use bluer::agent::{Agent, RequestConfirmationFn, RequestPinCodeFn};
#[cfg(feature = "bluez")]
use bluer::rfcomm::{SocketAddr, Stream};
#[cfg(feature = "bluez")]
use bluer::{AdapterEvent, Address, Session};
#[cfg(feature = "bluez")]
use futures::StreamExt;
use log::{debug, info, warn};
#[cfg(feature = "bluez")]
use tokio::runtime::Runtime;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::transport::{Connector, Transport};

#[cfg(not(feature = "bluez"))]
const AF_BLUETOOTH: libc::c_ushort = 31;
#[cfg(not(feature = "bluez"))]
const BTPROTO_RFCOMM: libc::c_int = 3;

const SCAN_TIMEOUT_SECS: u64 = 30;
const PAIR_TIMEOUT_SECS: u64 = 15;
const IO_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
/// The amplifier's Bluetooth bridge needs a pause after every command.
const COMMAND_DELAY_MS: u64 = 200;
const RECV_SIZE: usize = 550;

const CMD_START_DATA: u8 = b'W';
const CMD_START_IMPEDANCE: u8 = b'Z';
const CMD_STOP: u8 = b'R';
const CMD_BATTERY: u8 = b'B';

fn link_error(e: impl ToString) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

// ============================================================================
// Connector
// ============================================================================

/// Opens [`RfcommTransport`]s to one device MAC, retrying flaky connects
/// with exponential backoff.
#[derive(Debug, Clone)]
pub struct RfcommConnector {
    pub mac: String,
    pub pin: String,
    pub channel: u8,
    pub io_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub scan_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub pair_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RfcommConnector {
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            pin: "0000".to_string(),
            channel: 1,
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            pair_timeout: Duration::from_secs(PAIR_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = pin.into();
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * (1 << (attempt - 1).min(3))
    }

    /// Try `open` up to `max_retries` times, verifying each socket.
    fn with_retries(&self, mut open: impl FnMut() -> Result<RfcommStream>) -> Result<RfcommStream> {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, self.mac, attempt
                );
                thread::sleep(delay);
            }
            match open().and_then(|stream| stream.verify_connected().map(|_| stream)) {
                Ok(stream) => {
                    info!("RFCOMM connection established: mac={}", self.mac);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        self.mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DriverError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }

    #[cfg(not(feature = "bluez"))]
    fn open(&self, io_timeout: Duration) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(&self.mac)?;
        self.with_retries(|| open_rfcomm_raw(bdaddr, self.channel, io_timeout))
    }

    #[cfg(feature = "bluez")]
    fn open(&self, io_timeout: Duration) -> Result<RfcommStream> {
        let rt = Runtime::new()
            .map_err(|e| DriverError::Command(format!("tokio runtime init failed: {e}")))?;
        let address = rt.block_on(self.prepare_device())?;
        self.with_retries(|| rt.block_on(open_rfcomm(address, self.channel, io_timeout)))
    }

    /// Discover, pair and trust the device so the socket can be opened.
    #[cfg(feature = "bluez")]
    async fn prepare_device(&self) -> Result<Address> {
        let session = Session::new().await.map_err(link_error)?;
        let adapter = session.default_adapter().await.map_err(link_error)?;
        adapter.set_powered(true).await.map_err(link_error)?;

        let agent_handle = session
            .register_agent(build_agent(self.pin.clone()))
            .await
            .map_err(|e| DriverError::Bluetooth(BluetoothError::Pairing(e.to_string())))?;

        let address: Address = self.mac.parse().map_err(|_| link_error("invalid mac"))?;
        wait_for_device(&adapter, address, self.scan_timeout).await?;
        let device = adapter.device(address).map_err(link_error)?;

        if !device.is_paired().await.unwrap_or(false) {
            info!("pairing device via bluer: mac={}", self.mac);
            tokio::time::timeout(self.pair_timeout, device.pair())
                .await
                .map_err(|_| DriverError::Timeout("pairing timed out".into()))?
                .map_err(|e| DriverError::Bluetooth(BluetoothError::Pairing(e.to_string())))?;
        }
        if let Err(e) = device.set_trusted(true).await {
            debug!("could not mark device trusted: {}", e);
        }
        drop(agent_handle);
        Ok(address)
    }
}

impl Connector for RfcommConnector {
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>> {
        let stream = self.open(timeout.max(self.io_timeout))?;
        Ok(Box::new(RfcommTransport {
            stream: Some(stream),
            command_delay: Duration::from_millis(COMMAND_DELAY_MS),
        }))
    }

    fn describe(&self) -> String {
        format!("bluetooth {}", self.mac)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Bluetooth link speaking single-byte mode commands.
pub struct RfcommTransport {
    stream: Option<RfcommStream>,
    command_delay: Duration,
}

impl RfcommTransport {
    fn stream(&mut self) -> Result<&mut RfcommStream> {
        self.stream.as_mut().ok_or(DriverError::NotConnected)
    }

    fn command(&mut self, cmd: u8) -> Result<()> {
        debug!("rfcomm command: {}", cmd as char);
        self.stream()?.write_all(&[cmd])?;
        thread::sleep(self.command_delay);
        Ok(())
    }
}

impl Transport for RfcommTransport {
    fn start_data(&mut self) -> Result<()> {
        self.command(CMD_START_DATA)
    }

    fn start_impedance(&mut self) -> Result<()> {
        self.command(CMD_START_IMPEDANCE)
    }

    fn stop_recv(&mut self) -> Result<()> {
        self.command(CMD_STOP)
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        match self.stream()?.read(&mut buf) {
            Ok(0) => Err(DriverError::Protocol("remote transmission closed".into())),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(DriverError::Timeout("data transmission timeout".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_heartbeat(&mut self) -> Result<u8> {
        self.command(CMD_BATTERY)?;
        let mut battery = [0u8; 1];
        self.stream()?.read_exact(&mut battery)?;
        Ok(battery[0])
    }

    fn close(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            thread::sleep(self.command_delay);
        }
        Ok(())
    }

    fn recv_size(&self) -> usize {
        RECV_SIZE
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Blocking RFCOMM socket that behaves like a Read/Write object.
pub struct RfcommStream {
    file: File,
}

impl RfcommStream {
    /// Check `SO_ERROR` so a half-open socket is not mistaken for a link.
    pub fn verify_connected(&self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.file.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(DriverError::Io(std::io::Error::last_os_error()));
        }
        if err != 0 {
            return Err(DriverError::Bluetooth(BluetoothError::NotConnected(
                std::io::Error::from_raw_os_error(err).to_string(),
            )));
        }
        Ok(())
    }

    /// Take ownership of a configured socket fd.
    fn from_fd(fd: RawFd, timeout: Duration) -> Result<Self> {
        if let Err(e) = configure_fd(fd, timeout) {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
        Ok(Self {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }
}

impl Read for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for RfcommStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Close-on-exec, blocking mode and read/write timeouts.
fn configure_fd(fd: RawFd, timeout: Duration) -> Result<()> {
    let os_err = || link_error(std::io::Error::last_os_error());

    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(os_err());
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(os_err());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(os_err());
    }

    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_err());
        }
    }
    Ok(())
}

#[cfg(feature = "bluez")]
fn build_agent(pin: String) -> Agent {
    let pin_code_fn: RequestPinCodeFn = Box::new(move |_req| {
        let pin = pin.clone();
        Box::pin(async move { Ok(pin) })
    });
    let confirm_fn: RequestConfirmationFn = Box::new(|_req| Box::pin(async { Ok(()) }));
    Agent {
        request_default: true,
        request_pin_code: Some(pin_code_fn),
        request_confirmation: Some(confirm_fn),
        ..Default::default()
    }
}

#[cfg(feature = "bluez")]
async fn wait_for_device(adapter: &bluer::Adapter, address: Address, timeout: Duration) -> Result<()> {
    let not_found = || {
        DriverError::Bluetooth(BluetoothError::NotFound {
            mac: address.to_string(),
        })
    };
    let mut events = adapter.discover_devices().await.map_err(link_error)?;
    let deadline = Instant::now() + timeout;
    while let Some(evt) = events.next().await {
        if let AdapterEvent::DeviceAdded(addr) = evt {
            if addr == address {
                info!("device discovered: mac={}", addr);
                return Ok(());
            }
        }
        if Instant::now() > deadline {
            return Err(not_found());
        }
    }
    Err(not_found())
}

#[cfg(feature = "bluez")]
async fn open_rfcomm(address: Address, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!("opening RFCOMM socket: mac={}, channel={}", address, channel);
    let stream = tokio::time::timeout(timeout, Stream::connect(SocketAddr::new(address, channel)))
        .await
        .map_err(|_| DriverError::Timeout("rfcomm connect timed out".into()))?
        .map_err(link_error)?;

    // Own a blocking duplicate; the async stream closes its copy on drop.
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(link_error(std::io::Error::last_os_error()));
    }
    RfcommStream::from_fd(fd, timeout)
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
#[derive(Copy, Clone)]
struct BdAddr {
    b: [u8; 6],
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

/// `bdaddr_t` stores the MAC bytes in reverse order.
#[cfg(not(feature = "bluez"))]
fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let bytes: Vec<u8> = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| link_error("invalid mac"))?;
    if bytes.len() != 6 {
        return Err(link_error("invalid mac"));
    }
    let mut addr = BdAddr { b: [0; 6] };
    for (dst, src) in addr.b.iter_mut().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    Ok(addr)
}

#[cfg(not(feature = "bluez"))]
fn open_rfcomm_raw(address: BdAddr, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket (manual): channel={}, addr_bytes={:02X?}",
        channel, address.b
    );
    let fd = unsafe { libc::socket(AF_BLUETOOTH as libc::c_int, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
    if fd < 0 {
        return Err(link_error(std::io::Error::last_os_error()));
    }

    let addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(link_error(err));
    }
    RfcommStream::from_fd(fd, timeout)
}
