use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::{Connector, Transport};
use crate::errors::{DriverError, Result};

const IO_TIMEOUT_SECS: u64 = 5;
const SETTLE_DELAY_MS: u64 = 100;
const RECV_SIZE: usize = 2048;

const CMD_START_DATA: u8 = b'W';
const CMD_START_IMPEDANCE: u8 = b'Z';
const CMD_STOP: u8 = b'R';
const CMD_BATTERY: u8 = b'B';

/// Opens [`TcpTransport`]s to a Wi-Fi amplifier at `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    io_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn resolve(&self) -> Result<SocketAddr> {
        self.address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DriverError::Config(format!("cannot resolve {}", self.address)))
    }
}

impl Connector for TcpConnector {
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>> {
        let addr = self.resolve()?;
        debug!("opening TCP link: addr={}, timeout={:?}", addr, timeout);
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        // The amplifier drops commands sent right after accept.
        thread::sleep(Duration::from_millis(SETTLE_DELAY_MS));
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;
        info!("TCP link established: addr={}", addr);
        Ok(Box::new(TcpTransport { stream: Some(stream) }))
    }

    fn describe(&self) -> String {
        format!("wifi {}", self.address)
    }
}

/// Wi-Fi link speaking single-byte mode commands.
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(DriverError::NotConnected)
    }

    fn command(&mut self, cmd: u8) -> Result<()> {
        debug!("tcp command: {}", cmd as char);
        self.stream()?.write_all(&[cmd])?;
        Ok(())
    }
}

impl Transport for TcpTransport {
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
        let n = match self.stream()?.read(&mut buf) {
            Ok(0) => return Err(DriverError::Protocol("remote transmission closed".into())),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(DriverError::Timeout("data transmission timeout".into()))
            }
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn send_heartbeat(&mut self) -> Result<u8> {
        self.command(CMD_BATTERY)?;
        let mut battery = [0u8; 1];
        self.stream()?.read_exact(&mut battery)?;
        Ok(battery[0])
    }

    fn close(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            warn!("tcp shutdown failed: {}", e);
        }
        Ok(())
    }

    fn recv_size(&self) -> usize {
        RECV_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn commands_and_heartbeat_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let device = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut cmd = [0u8; 1];
            sock.read_exact(&mut cmd).unwrap();
            assert_eq!(cmd[0], CMD_BATTERY);
            sock.write_all(&[87]).unwrap();
            sock.read_exact(&mut cmd).unwrap();
            assert_eq!(cmd[0], CMD_START_DATA);
            sock.write_all(&[1, 2, 3]).unwrap();
            sock.read_exact(&mut cmd).unwrap();
            assert_eq!(cmd[0], CMD_STOP);
        });

        let connector = TcpConnector::new(addr.to_string());
        let mut link = connector.connect(Duration::from_secs(2)).unwrap();
        assert_eq!(link.send_heartbeat().unwrap(), 87);
        link.start_data().unwrap();
        let mut got = Vec::new();
        while got.len() < 3 {
            got.extend(link.recv(16).unwrap());
        }
        assert_eq!(got, vec![1, 2, 3]);
        link.stop_recv().unwrap();
        device.join().unwrap();
        link.close().unwrap();
    }
}
