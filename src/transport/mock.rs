//! Scripted in-process transport.
//!
//! [`MockConnector`] hands out transports that share one [`MockHandle`]. The
//! handle queues byte chunks for `recv`, injects failures into any operation
//! and records the command history, so the controller can be driven through
//! every state without hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{Connector, Transport};
use crate::errors::{DriverError, Result};
use crate::profile::{ByteOrder, DeviceProfile};

/// How long an idle `recv` waits for a chunk before returning empty.
const RECV_POLL: Duration = Duration::from_millis(10);

/// Operations observed by the mock, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCommand {
    Connect,
    StartData,
    StartImpedance,
    Stop,
    Heartbeat,
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    chunks: VecDeque<Vec<u8>>,
    streaming: bool,
    battery: u8,
    history: Vec<MockCommand>,
    fail_connect: u32,
    fail_recv: u32,
    fail_start: bool,
    fail_stop: bool,
    fail_heartbeat: bool,
    fail_close: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MockState>,
    arrived: Condvar,
}

/// Test-side control of every transport a [`MockConnector`] creates.
#[derive(Clone)]
pub struct MockHandle {
    inner: Arc<Inner>,
}

impl MockHandle {
    /// Queue a chunk for delivery while the link is streaming.
    pub fn push_bytes(&self, bytes: impl Into<Vec<u8>>) {
        self.inner.state.lock().chunks.push_back(bytes.into());
        self.inner.arrived.notify_all();
    }

    /// Chunks not yet consumed by `recv`.
    pub fn pending_chunks(&self) -> usize {
        self.inner.state.lock().chunks.len()
    }

    pub fn set_battery(&self, percent: u8) {
        self.inner.state.lock().battery = percent;
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connect(&self, n: u32) {
        self.inner.state.lock().fail_connect = n;
    }

    /// Fail the next `n` receives.
    pub fn fail_recv(&self, n: u32) {
        self.inner.state.lock().fail_recv = n;
        self.inner.arrived.notify_all();
    }

    pub fn fail_start(&self, fail: bool) {
        self.inner.state.lock().fail_start = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.inner.state.lock().fail_stop = fail;
    }

    pub fn fail_heartbeat(&self, fail: bool) {
        self.inner.state.lock().fail_heartbeat = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.inner.state.lock().fail_close = fail;
    }

    pub fn history(&self) -> Vec<MockCommand> {
        self.inner.state.lock().history.clone()
    }

    pub fn count(&self, command: MockCommand) -> usize {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.state.lock().streaming
    }
}

/// Connector producing [`MockTransport`]s bound to one [`MockHandle`].
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockHandle) {
        let inner = Arc::new(Inner::default());
        inner.state.lock().battery = 100;
        let handle = MockHandle {
            inner: Arc::clone(&inner),
        };
        (Arc::new(Self { inner }), handle)
    }
}

impl Connector for MockConnector {
    fn connect(&self, _timeout: Duration) -> Result<Box<dyn Transport>> {
        let mut state = self.inner.state.lock();
        state.history.push(MockCommand::Connect);
        if state.fail_connect > 0 {
            state.fail_connect -= 1;
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )));
        }
        Ok(Box::new(MockTransport {
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

pub struct MockTransport {
    inner: Arc<Inner>,
    closed: bool,
}

impl MockTransport {
    fn record(&self, command: MockCommand) -> parking_lot::MutexGuard<'_, MockState> {
        let mut state = self.inner.state.lock();
        state.history.push(command);
        state
    }

    fn start(&mut self, command: MockCommand) -> Result<()> {
        let mut state = self.record(command);
        if state.fail_start {
            return Err(DriverError::Command("mock mode start rejected".into()));
        }
        state.streaming = true;
        Ok(())
    }
}

impl Transport for MockTransport {
    fn start_data(&mut self) -> Result<()> {
        self.start(MockCommand::StartData)
    }

    fn start_impedance(&mut self) -> Result<()> {
        self.start(MockCommand::StartImpedance)
    }

    fn stop_recv(&mut self) -> Result<()> {
        let mut state = self.record(MockCommand::Stop);
        if state.fail_stop {
            return Err(DriverError::Command("mock stop rejected".into()));
        }
        state.streaming = false;
        state.chunks.clear();
        Ok(())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut state = self.inner.state.lock();
        if self.closed {
            return Err(DriverError::NotConnected);
        }
        if state.fail_recv == 0 && (!state.streaming || state.chunks.is_empty()) {
            self.inner.arrived.wait_for(&mut state, RECV_POLL);
        }
        if state.fail_recv > 0 {
            state.fail_recv -= 1;
            return Err(DriverError::Timeout("mock receive failure".into()));
        }
        if !state.streaming {
            return Ok(Vec::new());
        }
        let Some(mut chunk) = state.chunks.pop_front() else {
            return Ok(Vec::new());
        };
        if chunk.len() > max_bytes {
            let rest = chunk.split_off(max_bytes);
            state.chunks.push_front(rest);
        }
        Ok(chunk)
    }

    fn send_heartbeat(&mut self) -> Result<u8> {
        let state = self.record(MockCommand::Heartbeat);
        if state.fail_heartbeat {
            return Err(DriverError::Command("mock heartbeat failed".into()));
        }
        Ok(state.battery)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        // Closing the link does not change the device's mode.
        let state = self.record(MockCommand::Close);
        if state.fail_close {
            return Err(DriverError::Command("mock close failed".into()));
        }
        Ok(())
    }
}

/// Serialise one packet for `profile`.
///
/// `raw` holds `sub_frames * channels` unscaled samples in wire order and
/// `aux` one raw value per aux field. Trigger and battery are only written
/// when the profile carries them. Reserved bytes are zero.
pub fn encode_frame(
    profile: &DeviceProfile,
    seq: u8,
    raw: &[i32],
    aux: &[i32],
    trigger: u8,
    battery: u8,
) -> Vec<u8> {
    let layout = profile.layout();
    let mut out = vec![0u8; layout.frame_len];
    out[..layout.header_len].copy_from_slice(&profile.header);

    let bps = profile.bytes_per_sample;
    let mut at = layout.signal_start;
    for &value in raw.iter().take(profile.sub_frames * profile.channels) {
        write_signed(&mut out[at..at + bps], value, profile.byte_order);
        at += bps;
    }
    let mut at = layout.aux_start;
    for (field, &value) in profile.aux.iter().zip(aux) {
        write_signed(&mut out[at..at + field.bytes], value, field.order);
        at += field.bytes;
    }

    out[layout.checksum_at] = profile
        .checksum
        .compute(&out[layout.signal_start..layout.payload_end]);
    if let Some(i) = layout.trigger_at {
        out[i] = trigger;
    }
    if let Some(i) = layout.battery_at {
        out[i] = battery;
    }
    out[layout.seq_at] = seq;
    out
}

fn write_signed(dst: &mut [u8], value: i32, order: ByteOrder) {
    let bytes = value.to_be_bytes();
    let tail = &bytes[4 - dst.len()..];
    match order {
        ByteOrder::Big => dst.copy_from_slice(tail),
        ByteOrder::Little => {
            for (d, s) in dst.iter_mut().zip(tail.iter().rev()) {
                *d = *s;
            }
        }
    }
}
