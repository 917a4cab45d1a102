//! Device lifecycle state machine.
//!
//! A [`Device`] owns one background worker thread per connection. The worker
//! is the only code that drives the transport after `connect`: it sends
//! heartbeats while idle, enters signal or impedance mode on request, runs
//! the receive loop and tears everything down on exit. Public calls post a
//! request (or cancel a token) and then block on a condition variable until
//! the worker reports the target state.
//!
//! ```text
//! Terminated --connect--> Idle --start_data--> SignalStarting --> Signal
//!                         Idle --start_imp---> ImpedanceStarting --> Impedance
//! Signal/Impedance --stop--> Idle
//! Signal/Impedance --recv error--> TerminateStarting --> Terminated
//! Idle --heartbeat error--> TerminateStarting
//! any --close--> TerminateStarting --> Terminated
//! ```
//!
//! Cancellation is structured: every connection has a session token, and
//! every acquisition runs under a child of it. Stopping cancels the child,
//! closing cancels the session (and therefore any running acquisition).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::decoder::FrameDecoder;
use crate::errors::{DriverError, Result, TerminationReason};
use crate::frame::Frame;
use crate::impedance::{ImpedanceEstimator, ImpedanceReadout};
use crate::queue::{DeliveryQueue, QueuePolicy};
use crate::transport::{
    connector_for, Connector, DiscoveredDevice, Discovery, FrameSink, Transport,
};
use crate::profile::DeviceConfig;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Terminated,
    Idle,
    SignalStarting,
    Signal,
    ImpedanceStarting,
    Impedance,
    TerminateStarting,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::Terminated => "TERMINATED",
            ControllerState::Idle => "IDLE",
            ControllerState::SignalStarting => "SIGNAL_STARTING",
            ControllerState::Signal => "SIGNAL",
            ControllerState::ImpedanceStarting => "IMPEDANCE_STARTING",
            ControllerState::Impedance => "IMPEDANCE",
            ControllerState::TerminateStarting => "TERMINATE_STARTING",
        }
    }

    fn is_transitional(self) -> bool {
        matches!(
            self,
            ControllerState::SignalStarting
                | ControllerState::ImpedanceStarting
                | ControllerState::TerminateStarting
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and buffering knobs of a [`Device`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Keepalive period while idle.
    pub heartbeat_interval: Duration,
    /// Granularity of the idle loop and of unbounded `get_data` waits.
    pub poll_interval: Duration,
    /// Upper bound for any blocking state transition.
    pub transition_timeout: Duration,
    /// Timeout of the initial connection attempt.
    pub connect_timeout: Duration,
    /// Pause before rebuilding a failed reconnect-capable link.
    pub reconnect_cooldown: Duration,
    /// Timeout of the reconnection attempt.
    pub reconnect_timeout: Duration,
    pub queue: QueuePolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            transition_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            reconnect_cooldown: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(3),
            queue: QueuePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Signal,
    Impedance,
}

impl Mode {
    fn starting(self) -> ControllerState {
        match self {
            Mode::Signal => ControllerState::SignalStarting,
            Mode::Impedance => ControllerState::ImpedanceStarting,
        }
    }

    fn running(self) -> ControllerState {
        match self {
            Mode::Signal => ControllerState::Signal,
            Mode::Impedance => ControllerState::Impedance,
        }
    }
}

struct StartRequest {
    mode: Mode,
    token: CancellationToken,
    /// Configuration snapshot taken when the acquisition was requested.
    config: DeviceConfig,
}

// ============================================================================
// Shared state
// ============================================================================

struct Status {
    state: ControllerState,
    failure: Option<TerminationReason>,
}

#[derive(Default)]
struct SinkSet {
    open: bool,
    sinks: Vec<Box<dyn FrameSink>>,
}

/// Everything both the caller side and the worker touch.
struct Shared {
    status: Mutex<Status>,
    changed: Condvar,
    battery: AtomicU8,
    dropped: AtomicU64,
    checksum_errors: AtomicU64,
    with_queue: AtomicBool,
    sinks: Mutex<SinkSet>,
    impedance: Mutex<Option<ImpedanceReadout>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            status: Mutex::new(Status {
                state: ControllerState::Terminated,
                failure: None,
            }),
            changed: Condvar::new(),
            battery: AtomicU8::new(0),
            dropped: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            with_queue: AtomicBool::new(true),
            sinks: Mutex::new(SinkSet::default()),
            impedance: Mutex::new(None),
        }
    }

    fn state(&self) -> ControllerState {
        self.status.lock().state
    }

    fn set_state(&self, state: ControllerState) {
        let mut status = self.status.lock();
        if status.state != state {
            debug!("controller state: {} -> {}", status.state, state);
        }
        status.state = state;
        drop(status);
        self.changed.notify_all();
    }

    /// Enter `TerminateStarting`. Only the first reason of a session is kept.
    fn begin_terminate(&self, reason: TerminationReason) {
        let mut status = self.status.lock();
        if status.failure.is_none() {
            status.failure = Some(reason);
        }
        status.state = ControllerState::TerminateStarting;
        drop(status);
        self.changed.notify_all();
    }

    fn record_failure(&self, reason: TerminationReason) {
        self.status.lock().failure = Some(reason);
    }

    fn failure(&self) -> Option<TerminationReason> {
        self.status.lock().failure.clone()
    }

    fn open_sinks(&self) {
        self.sinks.lock().open = true;
    }

    /// Sinks are written outside the lock so a sink may call back into the
    /// device (for example to attach another sink).
    fn write_sinks(&self, frames: &[Frame]) {
        let mut sinks = std::mem::take(&mut self.sinks.lock().sinks);
        if sinks.is_empty() {
            return;
        }
        sinks.retain_mut(|sink| match sink.write(frames) {
            Ok(()) => true,
            Err(e) => {
                warn!("frame sink failed, detaching: {}", e);
                if let Err(e) = sink.close() {
                    debug!("closing failed sink: {}", e);
                }
                false
            }
        });
        let mut set = self.sinks.lock();
        let attached = std::mem::replace(&mut set.sinks, sinks);
        set.sinks.extend(attached);
    }

    fn close_sinks(&self) {
        let sinks = {
            let mut set = self.sinks.lock();
            set.open = false;
            std::mem::take(&mut set.sinks)
        };
        for mut sink in sinks {
            if let Err(e) = sink.close() {
                warn!("frame sink close failed: {}", e);
            }
        }
    }
}

/// Guarantees `Terminated` is published however the worker exits.
struct TerminateGuard(Arc<Shared>);

impl Drop for TerminateGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.begin_terminate(TerminationReason::Transmission(
                "acquisition worker panicked".into(),
            ));
        }
        self.0.close_sinks();
        self.0.set_state(ControllerState::Terminated);
    }
}

// ============================================================================
// Device
// ============================================================================

#[derive(Default)]
struct Session {
    token: CancellationToken,
    mode: Option<CancellationToken>,
    requests: Option<Sender<StartRequest>>,
    worker: Option<JoinHandle<()>>,
    discovery: Option<Box<dyn Discovery>>,
}

/// Public handle to one amplifier.
///
/// All methods take `&self`; the handle may be shared between threads.
pub struct Device {
    config: RwLock<DeviceConfig>,
    options: ControllerOptions,
    shared: Arc<Shared>,
    queue: Arc<DeliveryQueue>,
    session: Mutex<Session>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_options(config, ControllerOptions::default())
    }

    pub fn with_options(config: DeviceConfig, options: ControllerOptions) -> Self {
        let queue = Arc::new(DeliveryQueue::new(options.queue));
        Self {
            config: RwLock::new(config),
            options,
            shared: Arc::new(Shared::new()),
            queue,
            session: Mutex::new(Session::default()),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> DeviceConfig {
        self.config.read().clone()
    }

    /// Change the acquired channel subset. An empty list selects all.
    ///
    /// Only allowed while no acquisition runs; the new selection applies
    /// from the next `start_acquisition_*` call.
    pub fn update_channels(&self, channels: Vec<usize>) -> Result<()> {
        let _session = self.session.lock();
        let state = self.state();
        if !matches!(state, ControllerState::Idle | ControllerState::Terminated) {
            return Err(DriverError::Command(format!(
                "channels can only be changed while idle, device is {state}"
            )));
        }
        let mut config = self.config.write();
        let updated = config.clone().with_channels(channels)?;
        info!("channel selection updated: {:?}", updated.channels);
        *config = updated;
        Ok(())
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    /// Why the last session ended, if it did not end by `close()`.
    pub fn last_failure(&self) -> Option<TerminationReason> {
        self.shared
            .failure()
            .filter(|reason| *reason != TerminationReason::Closed)
    }

    /// Start a background device scan. It is stopped by `connect` and `close`.
    pub fn discover(&self, mut discovery: Box<dyn Discovery>) -> Result<Receiver<DiscoveredDevice>> {
        if self.state() != ControllerState::Terminated {
            return Err(DriverError::Command("device already connected".into()));
        }
        let mut session = self.session.lock();
        if let Some(mut previous) = session.discovery.take() {
            previous.stop();
        }
        let found = discovery.start()?;
        session.discovery = Some(discovery);
        Ok(found)
    }

    /// Connect through the connector matching the profile's transport.
    pub fn connect_to(&self, address: &str) -> Result<()> {
        self.connect(connector_for(&self.config(), address)?)
    }

    /// Open the link, read the battery and enter `Idle`.
    ///
    /// This is the only call that performs transport I/O on the caller's
    /// thread.
    pub fn connect(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let mut session = self.session.lock();
        if self.shared.state() != ControllerState::Terminated {
            return Err(DriverError::Command("device already connected".into()));
        }
        if let Some(mut discovery) = session.discovery.take() {
            discovery.stop();
        }
        if let Some(previous) = session.worker.take() {
            if previous.join().is_err() {
                warn!("previous acquisition worker panicked");
            }
        }
        let config = self.config();

        info!("connecting to {}", connector.describe());
        let mut transport = match connector.connect(self.options.connect_timeout) {
            Ok(transport) => transport,
            Err(e) => {
                error!("connection failed: {}", e);
                self.shared
                    .record_failure(TerminationReason::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };
        let setup = transport.send_heartbeat().and_then(|battery| {
            ImpedanceEstimator::for_config(&config).map(|estimator| (battery, estimator))
        });
        let (battery, estimator) = match setup {
            Ok(ok) => ok,
            Err(e) => {
                error!("connection setup failed: {}", e);
                if let Err(close_err) = transport.close() {
                    warn!("transport close failed: {}", close_err);
                }
                self.shared
                    .record_failure(TerminationReason::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };

        self.shared.battery.store(battery, Ordering::Release);
        self.shared.dropped.store(0, Ordering::Release);
        self.shared.checksum_errors.store(0, Ordering::Release);
        self.queue.flush();

        let token = CancellationToken::new();
        let (tx, rx) = unbounded();
        *self.shared.impedance.lock() = estimator.as_ref().map(ImpedanceEstimator::readout);
        let name = format!("acq-{}", config.profile.name);
        let connected_msg = format!(
            "device connected: {} @ {}Hz, battery {}%",
            config.profile.name, config.sample_rate, battery
        );
        let worker = Worker {
            options: self.options.clone(),
            shared: Arc::clone(&self.shared),
            queue: Arc::clone(&self.queue),
            reconnectable: config.transport().supports_reconnect(),
            connector,
            transport,
            decoder: FrameDecoder::new(&config),
            estimator,
            config,
            requests: rx,
            session: token.clone(),
        };

        {
            let mut status = self.shared.status.lock();
            status.failure = None;
            status.state = ControllerState::Idle;
        }
        self.shared.changed.notify_all();

        let handle = match thread::Builder::new().name(name).spawn(move || worker.run()) {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .begin_terminate(TerminationReason::ConnectFailed(e.to_string()));
                self.shared.set_state(ControllerState::Terminated);
                return Err(e.into());
            }
        };

        *session = Session {
            token,
            mode: None,
            requests: Some(tx),
            worker: Some(handle),
            discovery: None,
        };
        info!("{}", connected_msg);
        Ok(())
    }

    /// Enter signal mode. Frames go to the delivery queue when `with_queue`
    /// is set and to every attached sink regardless.
    ///
    /// An impedance measurement in progress is stopped first.
    pub fn start_acquisition_data(&self, with_queue: bool) -> Result<()> {
        self.start(Mode::Signal, with_queue)
    }

    /// Enter impedance mode. A signal acquisition in progress is stopped first.
    pub fn start_acquisition_impedance(&self) -> Result<()> {
        let config = self.config.read();
        if config.profile.impedance.is_none() {
            return Err(DriverError::Config(format!(
                "{} has no impedance mode",
                config.profile.name
            )));
        }
        drop(config);
        self.start(Mode::Impedance, true)
    }

    /// Return to `Idle`, discarding undelivered frames.
    pub fn stop_acquisition(&self) -> Result<()> {
        match self.settled_state()? {
            ControllerState::Terminated => Err(self.terminated_error()),
            ControllerState::Signal | ControllerState::Impedance => {
                if let Some(token) = self.session.lock().mode.take() {
                    token.cancel();
                }
                match self.wait_for(|s| {
                    matches!(s, ControllerState::Idle | ControllerState::Terminated)
                })? {
                    ControllerState::Idle => Ok(()),
                    _ => Err(self.terminated_error()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Frames decoded since the last call.
    ///
    /// Waits up to `timeout` for the first batch; `None` waits until data
    /// arrives or the acquisition ends. An expired wait returns no frames.
    pub fn get_data(&self, timeout: Option<Duration>) -> Result<Vec<Frame>> {
        self.ensure_streaming()?;
        if let Some(timeout) = timeout {
            return Ok(self.queue.drain(Some(timeout)));
        }
        loop {
            let frames = self.queue.drain(Some(self.options.poll_interval));
            if !frames.is_empty() {
                return Ok(frames);
            }
            self.ensure_streaming()?;
        }
    }

    /// Latest per-channel impedance in ohms while measuring.
    pub fn get_impedance(&self) -> Result<Option<Vec<f64>>> {
        if self.state() == ControllerState::Terminated {
            if let Some(reason) = self.last_failure() {
                return Err(DriverError::Terminated(reason));
            }
        }
        if self.state() != ControllerState::Impedance {
            return Ok(None);
        }
        Ok(self
            .shared
            .impedance
            .lock()
            .as_ref()
            .and_then(ImpedanceReadout::latest))
    }

    /// Battery level in percent, from the last heartbeat or packet.
    pub fn get_battery(&self) -> u8 {
        self.shared.battery.load(Ordering::Acquire)
    }

    /// Sequence gaps seen in the current or most recent acquisition.
    pub fn get_dropped_packet_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Acquire)
    }

    /// Checksum failures in the current or most recent acquisition.
    pub fn get_checksum_error_count(&self) -> u64 {
        self.shared.checksum_errors.load(Ordering::Acquire)
    }

    /// Frames lost to a full bounded delivery queue.
    pub fn get_queue_overflow_count(&self) -> u64 {
        self.queue.overflowed()
    }

    /// Attach a consumer for the rest of the current signal acquisition.
    pub fn attach_sink(&self, sink: Box<dyn FrameSink>) -> Result<()> {
        let mut set = self.shared.sinks.lock();
        if !set.open || self.state() != ControllerState::Signal {
            return Err(DriverError::NotAcquiring(
                "sinks can only be attached while acquiring signal".into(),
            ));
        }
        set.sinks.push(sink);
        Ok(())
    }

    /// Shut the session down and wait for `Terminated`.
    ///
    /// Succeeds on an already closed device. Transport close failures are
    /// logged, never returned.
    pub fn close(&self) -> Result<()> {
        let (token, worker, discovery) = {
            let mut session = self.session.lock();
            (
                session.token.clone(),
                session.worker.take(),
                session.discovery.take(),
            )
        };
        if let Some(mut discovery) = discovery {
            discovery.stop();
        }
        token.cancel();
        let Some(worker) = worker else {
            return Ok(());
        };
        if let Err(e) = self.wait_for(|s| s == ControllerState::Terminated) {
            self.session.lock().worker = Some(worker);
            return Err(e);
        }
        if worker.join().is_err() {
            warn!("acquisition worker panicked");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn start(&self, mode: Mode, with_queue: bool) -> Result<()> {
        loop {
            match self.settled_state()? {
                ControllerState::Terminated => return Err(self.terminated_error()),
                ControllerState::Idle => break,
                state if state == mode.running() => {
                    self.shared.with_queue.store(with_queue, Ordering::Release);
                    return Ok(());
                }
                _ => self.stop_acquisition()?,
            }
        }

        self.shared.with_queue.store(with_queue, Ordering::Release);
        {
            let mut session = self.session.lock();
            let token = session.token.child_token();
            let requests = session.requests.as_ref().ok_or(DriverError::NotConnected)?;
            requests
                .send(StartRequest {
                    mode,
                    token: token.clone(),
                    config: self.config(),
                })
                .map_err(|_| DriverError::NotConnected)?;
            session.mode = Some(token);
        }

        let target = mode.running();
        let reached =
            self.wait_for(|s| s == target || s == ControllerState::Terminated)?;
        if reached == target {
            Ok(())
        } else {
            Err(self.terminated_error())
        }
    }

    fn ensure_streaming(&self) -> Result<()> {
        match self.state() {
            ControllerState::Signal => {
                if self.shared.with_queue.load(Ordering::Acquire) {
                    Ok(())
                } else {
                    Err(DriverError::NotAcquiring(
                        "queue delivery disabled for this acquisition".into(),
                    ))
                }
            }
            ControllerState::Terminated => Err(self.terminated_error()),
            _ => Err(DriverError::NotAcquiring(
                "data acquisition not started, please start first".into(),
            )),
        }
    }

    fn terminated_error(&self) -> DriverError {
        match self.shared.failure() {
            None | Some(TerminationReason::Closed) => DriverError::NotConnected,
            Some(reason) => DriverError::Terminated(reason),
        }
    }

    /// Wait until no transition is in flight.
    fn settled_state(&self) -> Result<ControllerState> {
        self.wait_for(|s| !s.is_transitional())
    }

    fn wait_for(&self, done: impl Fn(ControllerState) -> bool) -> Result<ControllerState> {
        let deadline = Instant::now() + self.options.transition_timeout;
        let mut status = self.shared.status.lock();
        loop {
            if done(status.state) {
                return Ok(status.state);
            }
            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                if done(status.state) {
                    return Ok(status.state);
                }
                return Err(DriverError::Timeout(format!(
                    "state transition stuck in {}",
                    status.state
                )));
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Some(mut discovery) = session.discovery.take() {
            discovery.stop();
        }
        session.token.cancel();
        if let Some(worker) = session.worker.take() {
            if worker.join().is_err() {
                warn!("acquisition worker panicked");
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Owns the transport, decoder and estimator for one connection.
struct Worker {
    options: ControllerOptions,
    shared: Arc<Shared>,
    queue: Arc<DeliveryQueue>,
    reconnectable: bool,
    connector: Arc<dyn Connector>,
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    estimator: Option<ImpedanceEstimator>,
    config: DeviceConfig,
    requests: Receiver<StartRequest>,
    session: CancellationToken,
}

impl Worker {
    fn run(mut self) {
        let guard = TerminateGuard(Arc::clone(&self.shared));
        let reason = self.supervise();
        match &reason {
            TerminationReason::Closed => info!("closing device"),
            other => error!("device terminated: {}", other),
        }
        self.shared.begin_terminate(reason);
        if let Err(e) = self.transport.close() {
            warn!("transport close failed: {}", e);
        }
        self.queue.flush();
        drop(guard);
        info!("device disconnected");
    }

    fn supervise(&mut self) -> TerminationReason {
        loop {
            let request = match self.idle() {
                Ok(request) => request,
                Err(reason) => return reason,
            };
            if let Err(reason) = self.acquire(request) {
                return reason;
            }
        }
    }

    /// Heartbeat until a start request arrives or the session is cancelled.
    fn idle(&mut self) -> std::result::Result<StartRequest, TerminationReason> {
        self.shared.set_state(ControllerState::Idle);
        let mut last_heartbeat = Instant::now();
        loop {
            if self.session.is_cancelled() {
                return Err(TerminationReason::Closed);
            }
            match self.requests.recv_timeout(self.options.poll_interval) {
                Ok(request) => return Ok(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(TerminationReason::Closed),
            }
            if last_heartbeat.elapsed() >= self.options.heartbeat_interval {
                match self.transport.send_heartbeat() {
                    Ok(battery) => {
                        debug!("heartbeat ok: battery={}%", battery);
                        self.shared.battery.store(battery, Ordering::Release);
                        last_heartbeat = Instant::now();
                    }
                    Err(e) => {
                        error!("heartbeat failed: {}", e);
                        return Err(TerminationReason::HeartbeatFailed(e.to_string()));
                    }
                }
            }
        }
    }

    /// One signal or impedance acquisition, from mode entry back to idle.
    fn acquire(&mut self, request: StartRequest) -> std::result::Result<(), TerminationReason> {
        let StartRequest {
            mode,
            token,
            config,
        } = request;
        self.shared.set_state(mode.starting());
        if config.channels != self.config.channels {
            self.reconfigure(config).map_err(|e| {
                error!("applying channel selection failed: {}", e);
                TerminationReason::ModeStartFailed(e.to_string())
            })?;
        }
        self.shared.dropped.store(0, Ordering::Release);
        self.shared.checksum_errors.store(0, Ordering::Release);

        let started = match mode {
            Mode::Signal => self.transport.start_data(),
            Mode::Impedance => self.transport.start_impedance(),
        };
        if let Err(e) = started {
            error!("{} mode start failed: {}", mode.running(), e);
            return Err(TerminationReason::ModeStartFailed(e.to_string()));
        }
        if mode == Mode::Signal {
            self.shared.open_sinks();
        }
        self.shared.set_state(mode.running());
        info!("{} acquisition started", mode.running());

        let result = match self.receive(mode, &token) {
            Err(reason) => Err(reason),
            Ok(()) if self.session.is_cancelled() => Err(TerminationReason::Closed),
            Ok(()) => self.transport.stop_recv().map_err(|e| {
                error!("stop command failed: {}", e);
                TerminationReason::StopFailed(e.to_string())
            }),
        };
        if let Err(reason) = &result {
            self.shared.begin_terminate(reason.clone());
        }

        if mode == Mode::Signal {
            self.shared.close_sinks();
        }
        self.decoder.clear();
        if let Some(estimator) = &mut self.estimator {
            estimator.reset();
        }
        let discarded = self.queue.flush();
        info!(
            "{} acquisition stopped, {} undelivered frames discarded",
            mode.running(),
            discarded
        );
        result
    }

    fn receive(
        &mut self,
        mode: Mode,
        token: &CancellationToken,
    ) -> std::result::Result<(), TerminationReason> {
        let size = self.transport.recv_size();
        let mut retried = false;
        while !token.is_cancelled() {
            match self.transport.recv(size) {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => self.route(mode, &bytes),
                Err(e) if self.reconnectable && !retried => {
                    retried = true;
                    warn!(
                        "receive failed ({}), reconnecting {}",
                        e,
                        self.connector.describe()
                    );
                    if let Err(e) = self.reconnect() {
                        error!("reconnection failed: {}", e);
                        return Err(TerminationReason::Transmission(e.to_string()));
                    }
                    info!("link re-established");
                }
                Err(e) => {
                    error!("receive failed: {}", e);
                    return Err(TerminationReason::Transmission(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Rebuild the decoder and estimator for a new channel selection.
    fn reconfigure(&mut self, config: DeviceConfig) -> Result<()> {
        let estimator = ImpedanceEstimator::for_config(&config)?;
        *self.shared.impedance.lock() = estimator.as_ref().map(ImpedanceEstimator::readout);
        self.estimator = estimator;
        self.decoder = FrameDecoder::new(&config);
        debug!("acquiring channels {:?}", config.channels);
        self.config = config;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        thread::sleep(self.options.reconnect_cooldown);
        if let Err(e) = self.transport.close() {
            debug!("closing failed link: {}", e);
        }
        self.transport = self.connector.connect(self.options.reconnect_timeout)?;
        Ok(())
    }

    fn route(&mut self, mode: Mode, bytes: &[u8]) {
        let frames = self.decoder.feed(bytes);
        let stats = self.decoder.stats();
        self.shared.dropped.store(stats.dropped, Ordering::Release);
        self.shared
            .checksum_errors
            .store(stats.checksum_errors, Ordering::Release);

        let Some(last) = frames.last() else {
            return;
        };
        if let Some(battery) = last.battery {
            self.shared.battery.store(battery, Ordering::Release);
        }

        match mode {
            Mode::Impedance => {
                if let Some(estimator) = &mut self.estimator {
                    estimator.accumulate(&frames);
                }
            }
            Mode::Signal => {
                self.shared.write_sinks(&frames);
                if self.shared.with_queue.load(Ordering::Acquire) {
                    if let Err(e) = self.queue.push(frames) {
                        debug!("frames not queued: {}", e);
                    }
                }
            }
        }
    }
}
