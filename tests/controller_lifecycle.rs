use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use exg_acq::transport::mock::{encode_frame, MockCommand, MockConnector, MockHandle};
use exg_acq::{
    ControllerOptions, ControllerState, Device, DeviceConfig, DeviceProfile, DriverError, Frame,
    FrameSink, TerminationReason,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options() -> ControllerOptions {
    ControllerOptions {
        heartbeat_interval: Duration::from_secs(60),
        poll_interval: Duration::from_millis(5),
        transition_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        reconnect_cooldown: Duration::from_millis(10),
        reconnect_timeout: Duration::from_secs(1),
        ..ControllerOptions::default()
    }
}

fn connected(model: &str, options: ControllerOptions) -> (Device, MockHandle) {
    init_logs();
    let config = DeviceConfig::new(DeviceProfile::irecorder(model).unwrap(), 500).unwrap();
    let device = Device::with_options(config, options);
    let (connector, handle) = MockConnector::new();
    device.connect(connector).unwrap();
    (device, handle)
}

/// `count` consecutive packets from `first`; packet `i` carries `i` on every channel.
fn packets(device: &Device, first: u8, count: u8, battery: u8) -> Vec<u8> {
    let config = device.config();
    let profile = &config.profile;
    (0..count)
        .flat_map(|i| {
            let raw = vec![i32::from(i); profile.channels];
            encode_frame(profile, first.wrapping_add(i), &raw, &[], 0, battery)
        })
        .collect()
}

fn collect(device: &Device, want: usize) -> Vec<Frame> {
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut frames = Vec::new();
    while frames.len() < want && Instant::now() < deadline {
        frames.extend(device.get_data(Some(Duration::from_millis(50))).unwrap());
    }
    frames
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn connect_reads_battery_and_idles() {
    init_logs();
    let config = DeviceConfig::new(DeviceProfile::irecorder("W8").unwrap(), 500).unwrap();
    let device = Device::with_options(config, options());
    assert_eq!(device.state(), ControllerState::Terminated);

    let (connector, handle) = MockConnector::new();
    handle.set_battery(64);
    device.connect(connector.clone()).unwrap();
    assert_eq!(device.state(), ControllerState::Idle);
    assert_eq!(device.get_battery(), 64);
    assert!(matches!(
        device.connect(connector),
        Err(DriverError::Command(_))
    ));
    assert_eq!(
        handle.history(),
        vec![MockCommand::Connect, MockCommand::Heartbeat]
    );
}

#[test]
fn failed_connect_stays_terminated() {
    init_logs();
    let config = DeviceConfig::new(DeviceProfile::irecorder("W8").unwrap(), 500).unwrap();
    let device = Device::with_options(config, options());
    let (connector, handle) = MockConnector::new();
    handle.fail_connect(1);

    assert!(device.connect(connector.clone()).is_err());
    assert_eq!(device.state(), ControllerState::Terminated);
    assert!(matches!(
        device.last_failure(),
        Some(TerminationReason::ConnectFailed(_))
    ));
    assert!(matches!(
        device.start_acquisition_data(true),
        Err(DriverError::Terminated(TerminationReason::ConnectFailed(_)))
    ));

    device.connect(connector).unwrap();
    assert_eq!(device.state(), ControllerState::Idle);
    assert_eq!(device.last_failure(), None);
}

#[test]
fn signal_frames_reach_get_data_in_order() {
    let (device, handle) = connected("W8", options());
    assert!(matches!(
        device.get_data(Some(Duration::ZERO)),
        Err(DriverError::NotAcquiring(_))
    ));

    device.start_acquisition_data(true).unwrap();
    assert_eq!(device.state(), ControllerState::Signal);
    assert!(handle.is_streaming());

    handle.push_bytes(packets(&device, 0, 10, 77));
    let frames = collect(&device, 10);
    let seqs: Vec<u8> = frames.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<u8>>());
    assert_eq!(frames[0].samples[0].len(), 8);
    assert_eq!(device.get_battery(), 77);
    assert_eq!(device.get_dropped_packet_count(), 0);

    device.stop_acquisition().unwrap();
    assert_eq!(device.state(), ControllerState::Idle);
    assert!(!handle.is_streaming());
    assert_eq!(handle.count(MockCommand::Stop), 1);
    device.close().unwrap();
}

#[test]
fn gaps_and_corruption_are_counted_per_acquisition() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();

    let mut bytes = packets(&device, 0, 5, 90);
    bytes.extend(packets(&device, 7, 5, 90));
    let mut bad = packets(&device, 12, 5, 90);
    bad[3] ^= 0x01;
    bytes.extend(bad);
    handle.push_bytes(bytes);

    let frames = collect(&device, 14);
    assert_eq!(frames.len(), 14);
    assert!(wait_until(|| device.get_checksum_error_count() == 1));
    // 4 -> 7, then the corrupted 12 leaves 11 -> 13.
    assert_eq!(device.get_dropped_packet_count(), 2);

    device.stop_acquisition().unwrap();
    assert_eq!(device.get_dropped_packet_count(), 2);
    device.start_acquisition_data(true).unwrap();
    assert_eq!(device.get_dropped_packet_count(), 0);
    assert_eq!(device.get_checksum_error_count(), 0);
}

#[test]
fn stop_discards_undelivered_frames() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    handle.push_bytes(packets(&device, 0, 10, 90));
    assert!(wait_until(|| handle.pending_chunks() == 0));
    thread::sleep(Duration::from_millis(20));

    device.stop_acquisition().unwrap();
    device.start_acquisition_data(true).unwrap();
    assert!(device.get_data(Some(Duration::from_millis(50))).unwrap().is_empty());
}

#[test]
fn impedance_mode_publishes_estimates() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_impedance().unwrap();
    assert_eq!(device.state(), ControllerState::Impedance);
    assert_eq!(device.get_impedance().unwrap(), None);
    assert!(matches!(
        device.get_data(Some(Duration::ZERO)),
        Err(DriverError::NotAcquiring(_))
    ));

    // A 500 Hz window is 1024 samples.
    let mut bytes = Vec::new();
    for block in 0..11u8 {
        bytes.extend(packets(&device, block.wrapping_mul(100), 100, 90));
    }
    handle.push_bytes(bytes);

    let mut estimate = None;
    assert!(wait_until(|| {
        estimate = device.get_impedance().unwrap();
        estimate.is_some()
    }));
    let estimate = estimate.unwrap();
    assert_eq!(estimate.len(), 8);
    assert!(estimate.iter().all(|z| *z >= 0.0));
    assert!(estimate.iter().all(|z| *z == estimate[0]));

    device.stop_acquisition().unwrap();
    assert_eq!(device.get_impedance().unwrap(), None);
}

#[test]
fn switching_modes_stops_the_running_one() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    device.start_acquisition_impedance().unwrap();
    assert_eq!(device.state(), ControllerState::Impedance);
    assert_eq!(
        handle.history()[2..],
        [
            MockCommand::StartData,
            MockCommand::Stop,
            MockCommand::StartImpedance
        ]
    );
}

#[test]
fn profile_without_impedance_rejects_mode() {
    init_logs();
    let config = DeviceConfig::new(DeviceProfile::econ_alpha(), 500).unwrap();
    let device = Device::with_options(config, options());
    let (connector, _handle) = MockConnector::new();
    device.connect(connector).unwrap();
    assert!(matches!(
        device.start_acquisition_impedance(),
        Err(DriverError::Config(_))
    ));
    assert_eq!(device.state(), ControllerState::Idle);
}

#[test]
fn mode_start_failure_terminates() {
    let (device, handle) = connected("W8", options());
    handle.fail_start(true);
    assert!(matches!(
        device.start_acquisition_data(true),
        Err(DriverError::Terminated(TerminationReason::ModeStartFailed(_)))
    ));
    assert_eq!(device.state(), ControllerState::Terminated);
    assert_eq!(handle.history().last(), Some(&MockCommand::Close));
}

#[test]
fn stop_failure_terminates() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    handle.fail_stop(true);
    assert!(matches!(
        device.stop_acquisition(),
        Err(DriverError::Terminated(TerminationReason::StopFailed(_)))
    ));
    assert_eq!(device.state(), ControllerState::Terminated);
}

#[test]
fn receive_failure_without_reconnect_terminates() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    handle.fail_recv(1);

    assert!(wait_until(|| device.state() == ControllerState::Terminated));
    assert!(matches!(
        device.last_failure(),
        Some(TerminationReason::Transmission(_))
    ));
    assert!(matches!(
        device.get_data(Some(Duration::ZERO)),
        Err(DriverError::Terminated(TerminationReason::Transmission(_)))
    ));
    assert_eq!(handle.count(MockCommand::Connect), 1);
}

#[test]
fn wifi_link_reconnects_once() {
    let (device, handle) = connected("W32", options());
    device.start_acquisition_data(true).unwrap();

    handle.fail_recv(1);
    assert!(wait_until(|| handle.count(MockCommand::Connect) == 2));
    assert_eq!(device.state(), ControllerState::Signal);

    handle.push_bytes(packets(&device, 0, 6, 90));
    assert_eq!(collect(&device, 6).len(), 6);

    handle.fail_recv(1);
    assert!(wait_until(|| device.state() == ControllerState::Terminated));
    assert_eq!(handle.count(MockCommand::Connect), 2);
}

#[test]
fn heartbeat_failure_terminates_idle_device() {
    let (device, handle) = connected(
        "USB8",
        ControllerOptions {
            heartbeat_interval: Duration::from_millis(20),
            ..options()
        },
    );
    handle.set_battery(33);
    assert!(wait_until(|| device.get_battery() == 33));

    handle.fail_heartbeat(true);
    assert!(wait_until(|| device.state() == ControllerState::Terminated));
    assert!(matches!(
        device.last_failure(),
        Some(TerminationReason::HeartbeatFailed(_))
    ));
}

#[test]
fn close_succeeds_even_if_transport_close_fails() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    handle.fail_close(true);

    device.close().unwrap();
    assert_eq!(device.state(), ControllerState::Terminated);
    assert_eq!(device.last_failure(), None);
    assert!(matches!(
        device.start_acquisition_data(true),
        Err(DriverError::NotConnected)
    ));
    device.close().unwrap();
}

#[test]
fn close_from_idle_with_failing_transport_close() {
    let (device, handle) = connected("W8", options());
    handle.fail_close(true);
    device.close().unwrap();
    assert_eq!(device.state(), ControllerState::Terminated);
    assert_eq!(handle.history().last(), Some(&MockCommand::Close));
    assert_eq!(device.last_failure(), None);
}

#[test]
fn close_from_impedance_with_failing_transport_close() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_impedance().unwrap();
    handle.fail_close(true);
    device.close().unwrap();
    assert_eq!(device.state(), ControllerState::Terminated);
    assert_eq!(device.get_impedance().unwrap(), None);
    assert!(!handle.history().contains(&MockCommand::Stop));
}

#[test]
fn close_after_heartbeat_failure() {
    let (device, handle) = connected(
        "W8",
        ControllerOptions {
            heartbeat_interval: Duration::from_millis(20),
            ..options()
        },
    );
    handle.fail_close(true);
    handle.fail_heartbeat(true);
    assert!(wait_until(|| device.state() == ControllerState::Terminated));

    device.close().unwrap();
    assert_eq!(device.state(), ControllerState::Terminated);
    assert!(matches!(
        device.last_failure(),
        Some(TerminationReason::HeartbeatFailed(_))
    ));
}

#[test]
fn close_after_receive_failure() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    handle.fail_close(true);
    handle.fail_recv(1);
    assert!(wait_until(|| device.state() == ControllerState::Terminated));

    device.close().unwrap();
    device.close().unwrap();
    assert_eq!(device.state(), ControllerState::Terminated);
    assert_eq!(handle.count(MockCommand::Close), 1);
}

/// Packets whose channel `ch` carries `ch * 100`.
fn channel_packets(first: u8, count: u8) -> Vec<u8> {
    let profile = DeviceProfile::irecorder("W8").unwrap();
    let raw: Vec<i32> = (0..8).map(|ch| ch * 100).collect();
    (0..count)
        .flat_map(|i| encode_frame(&profile, first.wrapping_add(i), &raw, &[], 0, 90))
        .collect()
}

fn raw_row(device: &Device, frame: &Frame) -> Vec<i64> {
    let scale = device.config().profile.scale;
    frame.samples[0]
        .iter()
        .map(|v| (v / scale).round() as i64)
        .collect()
}

#[test]
fn channels_change_between_acquisitions() {
    let (device, handle) = connected("W8", options());
    device.start_acquisition_data(true).unwrap();
    handle.push_bytes(channel_packets(0, 5));
    let frames = collect(&device, 5);
    assert_eq!(raw_row(&device, &frames[0]), vec![0, 100, 200, 300, 400, 500, 600, 700]);

    assert!(matches!(
        device.update_channels(vec![3, 1]),
        Err(DriverError::Command(_))
    ));
    device.stop_acquisition().unwrap();
    assert!(matches!(
        device.update_channels(vec![3, 9]),
        Err(DriverError::Config(_))
    ));
    device.update_channels(vec![3, 1]).unwrap();
    assert_eq!(device.config().channels, vec![3, 1]);

    device.start_acquisition_data(true).unwrap();
    handle.push_bytes(channel_packets(5, 5));
    let frames = collect(&device, 5);
    assert_eq!(frames.len(), 5);
    assert_eq!(raw_row(&device, &frames[0]), vec![300, 100]);
    assert_eq!(frames[0].rows().next().map(|r| r.len()), Some(3));

    device.start_acquisition_impedance().unwrap();
    let mut bytes = Vec::new();
    for block in 0..11u8 {
        bytes.extend(channel_packets(block.wrapping_mul(100), 100));
    }
    handle.push_bytes(bytes);
    let mut estimate = None;
    assert!(wait_until(|| {
        estimate = device.get_impedance().unwrap();
        estimate.is_some()
    }));
    assert_eq!(estimate.map(|z| z.len()), Some(2));
}

#[derive(Clone, Default)]
struct Recorder {
    seqs: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl FrameSink for Recorder {
    fn write(&mut self, frames: &[Frame]) -> exg_acq::Result<()> {
        self.seqs.lock().extend(frames.iter().map(|f| f.seq));
        Ok(())
    }

    fn close(&mut self) -> exg_acq::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

#[test]
fn sinks_receive_frames_without_queue() {
    let (device, handle) = connected("W8", options());
    let recorder = Recorder::default();
    assert!(device.attach_sink(Box::new(recorder.clone())).is_err());

    device.start_acquisition_data(false).unwrap();
    device.attach_sink(Box::new(recorder.clone())).unwrap();
    assert!(matches!(
        device.get_data(Some(Duration::ZERO)),
        Err(DriverError::NotAcquiring(_))
    ));

    handle.push_bytes(packets(&device, 40, 8, 90));
    assert!(wait_until(|| recorder.seqs.lock().len() == 8));
    assert_eq!(*recorder.seqs.lock(), (40..48).collect::<Vec<u8>>());

    device.stop_acquisition().unwrap();
    assert!(*recorder.closed.lock());
}

/// Attaches `extra` to the device from inside its first write.
struct Chaining {
    device: Arc<Device>,
    extra: Option<Recorder>,
    attached: Arc<Mutex<Option<bool>>>,
}

impl FrameSink for Chaining {
    fn write(&mut self, _frames: &[Frame]) -> exg_acq::Result<()> {
        if let Some(extra) = self.extra.take() {
            let ok = self.device.attach_sink(Box::new(extra)).is_ok();
            *self.attached.lock() = Some(ok);
        }
        Ok(())
    }

    fn close(&mut self) -> exg_acq::Result<()> {
        Ok(())
    }
}

#[test]
fn sink_can_attach_another_sink_from_write() {
    let (device, handle) = connected("W8", options());
    let device = Arc::new(device);
    device.start_acquisition_data(false).unwrap();

    let recorder = Recorder::default();
    let attached = Arc::new(Mutex::new(None));
    device
        .attach_sink(Box::new(Chaining {
            device: Arc::clone(&device),
            extra: Some(recorder.clone()),
            attached: Arc::clone(&attached),
        }))
        .unwrap();

    handle.push_bytes(packets(&device, 0, 5, 90));
    assert!(wait_until(|| attached.lock().is_some()));
    assert_eq!(*attached.lock(), Some(true));

    handle.push_bytes(packets(&device, 5, 5, 90));
    assert!(wait_until(|| recorder.seqs.lock().len() == 5));
    assert_eq!(*recorder.seqs.lock(), (5..10).collect::<Vec<u8>>());

    device.stop_acquisition().unwrap();
    assert!(*recorder.closed.lock());
}
