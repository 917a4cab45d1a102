//! Declarative description of an amplifier's wire format.
//!
//! Every supported hardware family is expressed as a [`DeviceProfile`] value
//! instead of a dedicated parser type. The decoder, the impedance estimator
//! and the controller read everything they need (header bytes, frame length,
//! channel layout, scale factors, byte order, supported rates) from the
//! profile handed to them at construction.
//!
//! # Frame layout
//!
//! ```text
//! | header | signal block | aux fields | reserved | checksum | trigger? | battery? | seq |
//! ```
//!
//! The signal block holds `sub_frames` time-ordered samples of `channels`
//! values each. The checksum covers the signal block and the aux fields.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

/// Microvolts per LSB for the 24-bit ADC front-ends.
pub const DEFAULT_UV_PER_LSB: f64 = 0.022_351_74;

/// Sync word that opens every data packet.
pub const DEFAULT_HEADER: [u8; 2] = [0xBB, 0xAA];

// ============================================================================
// Profile building blocks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    /// Decode a signed two's-complement integer of 1..=4 bytes.
    pub fn read_signed(self, bytes: &[u8]) -> i32 {
        let width = bytes.len();
        debug_assert!((1..=4).contains(&width));
        let mut raw: u32 = 0;
        match self {
            ByteOrder::Big => {
                for &b in bytes {
                    raw = (raw << 8) | b as u32;
                }
            }
            ByteOrder::Little => {
                for &b in bytes.iter().rev() {
                    raw = (raw << 8) | b as u32;
                }
            }
        }
        // Sign-extend from the top bit of the field.
        let shift = 32 - 8 * width as u32;
        ((raw << shift) as i32) >> shift
    }
}

/// How the trailer checksum byte is derived from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// `!sum(payload) & 0xFF`
    #[default]
    OnesComplementSum,
    /// `sum(payload) & 0xFF`
    Sum,
}

impl ChecksumKind {
    pub fn compute(self, payload: &[u8]) -> u8 {
        let sum = payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        match self {
            ChecksumKind::OnesComplementSum => !sum,
            ChecksumKind::Sum => sum,
        }
    }
}

/// Non-signal field carried after the signal block (IMU axes and similar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxField {
    pub name: String,
    pub bytes: usize,
    #[serde(default)]
    pub order: ByteOrder,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

impl AuxField {
    pub fn new(name: impl Into<String>, bytes: usize, order: ByteOrder, scale: f64) -> Self {
        Self {
            name: name.into(),
            bytes,
            order,
            scale,
        }
    }
}

/// Physical medium the device is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Serial,
    Bluetooth,
    Wifi,
    /// In-process scripted transport, see [`crate::transport::mock`].
    Mock,
}

impl TransportKind {
    /// Whether a failed receive may be retried by recreating the link.
    pub fn supports_reconnect(self) -> bool {
        matches!(self, TransportKind::Wifi)
    }
}

/// Tunables of the tone-injection impedance measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceParams {
    /// Window length in seconds; the sample count is `window_seconds * fs`.
    pub window_seconds: f64,
    /// Half-open DFT bin range `[start, end)` searched for the injected tone.
    pub tone_bins: (usize, usize),
    /// Series resistance subtracted from the raw estimate, in ohms.
    pub baseline_ohms: f64,
    /// Ohms per unit of DFT magnitude, before normalisation by `N / 2`.
    pub injection_factor: f64,
    /// Saturation level in raw ADC counts; scaled by the profile's `scale`.
    pub saturation_counts: f64,
    /// Channels with at most this fraction of in-range samples are open.
    pub open_fraction: f64,
    /// Channels whose samples never exceed this magnitude carry no signal.
    pub dead_level: f64,
}

impl ImpedanceParams {
    /// Reject settings the estimator cannot evaluate.
    pub fn validate(&self) -> Result<()> {
        if !(self.window_seconds.is_finite() && self.window_seconds > 0.0) {
            return Err(DriverError::Config(format!(
                "impedance window_seconds must be positive, got {}",
                self.window_seconds
            )));
        }
        let (lo, hi) = self.tone_bins;
        if lo >= hi {
            return Err(DriverError::Config(format!(
                "impedance tone_bins must be a non-empty range, got [{lo}, {hi})"
            )));
        }
        if !(0.0..=1.0).contains(&self.open_fraction) {
            return Err(DriverError::Config(
                "impedance open_fraction must be within 0.0-1.0".into(),
            ));
        }
        for (name, value) in [
            ("injection_factor", self.injection_factor),
            ("saturation_counts", self.saturation_counts),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(DriverError::Config(format!(
                    "impedance {name} must be finite and positive, got {value}"
                )));
            }
        }
        if !(self.baseline_ohms.is_finite() && self.dead_level.is_finite()) {
            return Err(DriverError::Config(
                "impedance baseline_ohms and dead_level must be finite".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ImpedanceParams {
    fn default() -> Self {
        Self {
            window_seconds: 2.048,
            tone_bins: (62, 67),
            baseline_ohms: 5000.0,
            injection_factor: 1000.0 / 6.0 * std::f64::consts::PI / 4.0,
            saturation_counts: 4_000_000.0,
            open_fraction: 0.2,
            dead_level: 1.0,
        }
    }
}

// ============================================================================
// DeviceProfile
// ============================================================================

/// Wire format and capabilities of one amplifier family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub header: Vec<u8>,
    /// Hardware signal channels per sample.
    pub channels: usize,
    pub bytes_per_sample: usize,
    /// Time-ordered samples per packet.
    #[serde(default = "one")]
    pub sub_frames: usize,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Physical units (e.g. µV) per LSB.
    pub scale: f64,
    #[serde(default)]
    pub aux: Vec<AuxField>,
    /// Unchecked bytes between the payload and the checksum.
    #[serde(default)]
    pub reserved_bytes: usize,
    #[serde(default)]
    pub checksum: ChecksumKind,
    #[serde(default)]
    pub has_trigger: bool,
    #[serde(default)]
    pub has_battery: bool,
    /// Bytes to accumulate before a parse attempt, as a fraction of one
    /// second of stream. `0.0` parses as soon as one frame is buffered.
    #[serde(default)]
    pub parse_threshold_ratio: f64,
    pub supported_rates: Vec<u32>,
    pub transport: TransportKind,
    #[serde(default)]
    pub impedance: Option<ImpedanceParams>,
}

fn one() -> usize {
    1
}

impl DeviceProfile {
    /// Profile for the iRecorder family by model name (`W8`, `W16`, `W32`,
    /// `USB8`, `USB16`, `USB32`).
    ///
    /// `W8`/`W16` are Bluetooth, `W32` is Wi-Fi, `USB*` are serial.
    pub fn irecorder(model: &str) -> Result<Self> {
        let (transport, digits) = if let Some(rest) = model.strip_prefix("USB") {
            (TransportKind::Serial, rest)
        } else if let Some(rest) = model.strip_prefix('W') {
            let kind = if rest == "32" {
                TransportKind::Wifi
            } else {
                TransportKind::Bluetooth
            };
            (kind, rest)
        } else {
            return Err(DriverError::Config(format!(
                "unsupported device type {model}"
            )));
        };
        let channels = match digits {
            "8" => 8,
            "16" => 16,
            "32" => 32,
            _ => {
                return Err(DriverError::Config(format!(
                    "unsupported device type {model}"
                )))
            }
        };
        let supported_rates = if transport == TransportKind::Serial {
            vec![500, 1000, 2000]
        } else {
            vec![500]
        };

        Ok(Self {
            name: format!("iRecorder {model}"),
            header: DEFAULT_HEADER.to_vec(),
            channels,
            bytes_per_sample: 3,
            sub_frames: 1,
            byte_order: ByteOrder::Big,
            scale: DEFAULT_UV_PER_LSB,
            aux: Vec::new(),
            reserved_bytes: 0,
            checksum: ChecksumKind::OnesComplementSum,
            has_trigger: true,
            has_battery: true,
            parse_threshold_ratio: 0.01,
            supported_rates,
            transport,
            impedance: Some(ImpedanceParams::default()),
        })
    }

    /// Profile for the eight-channel EMG armband: eight time-ordered samples
    /// per packet followed by a six-axis IMU block.
    pub fn econ_alpha() -> Self {
        let aux = ["ACC_X", "ACC_Y", "ACC_Z", "GYR_X", "GYR_Y", "GYR_Z"]
            .into_iter()
            .map(|name| AuxField::new(name, 2, ByteOrder::Little, 1.0))
            .collect();
        Self {
            name: "eConAlpha".to_string(),
            header: DEFAULT_HEADER.to_vec(),
            channels: 8,
            bytes_per_sample: 3,
            sub_frames: 8,
            byte_order: ByteOrder::Big,
            scale: DEFAULT_UV_PER_LSB,
            aux,
            reserved_bytes: 4,
            checksum: ChecksumKind::OnesComplementSum,
            has_trigger: false,
            has_battery: true,
            parse_threshold_ratio: 0.0,
            supported_rates: vec![500],
            transport: TransportKind::Serial,
            impedance: None,
        }
    }

    /// Parse a profile from its JSON form.
    pub fn from_json(text: &str) -> Result<Self> {
        let profile: DeviceProfile = serde_json::from_str(text)
            .map_err(|e| DriverError::Config(format!("invalid profile: {e}")))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load a JSON profile from disk.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read device profile at {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Failed to parse device profile at {}", path.display()))
    }

    /// Reject layouts the decoder cannot handle.
    pub fn validate(&self) -> Result<()> {
        if self.header.is_empty() {
            return Err(DriverError::Config("profile header must not be empty".into()));
        }
        if self.channels == 0 {
            return Err(DriverError::Config("profile needs at least one channel".into()));
        }
        if !(1..=4).contains(&self.bytes_per_sample) {
            return Err(DriverError::Config(format!(
                "bytes_per_sample must be 1-4, got {}",
                self.bytes_per_sample
            )));
        }
        if self.sub_frames == 0 {
            return Err(DriverError::Config("sub_frames must be at least 1".into()));
        }
        if let Some(field) = self.aux.iter().find(|f| !(1..=4).contains(&f.bytes)) {
            return Err(DriverError::Config(format!(
                "aux field {} must be 1-4 bytes, got {}",
                field.name, field.bytes
            )));
        }
        if self.supported_rates.is_empty() {
            return Err(DriverError::Config("profile lists no sampling rates".into()));
        }
        if !(0.0..=1.0).contains(&self.parse_threshold_ratio) {
            return Err(DriverError::Config(
                "parse_threshold_ratio must be within 0.0-1.0".into(),
            ));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(DriverError::Config(format!(
                "scale must be finite and positive, got {}",
                self.scale
            )));
        }
        if let Some(field) = self.aux.iter().find(|f| !f.scale.is_finite()) {
            return Err(DriverError::Config(format!(
                "aux field {} scale must be finite",
                field.name
            )));
        }
        if let Some(params) = &self.impedance {
            params.validate()?;
        }
        Ok(())
    }

    pub fn layout(&self) -> FrameLayout {
        FrameLayout::of(self)
    }

    /// Minimum buffered byte count before the decoder scans for frames.
    pub fn min_parse_bytes(&self, sample_rate: u32) -> usize {
        let frame_len = self.layout().frame_len;
        let threshold = (frame_len as f64 * sample_rate as f64 * self.parse_threshold_ratio) as usize;
        threshold.max(frame_len)
    }
}

/// Byte offsets derived from a [`DeviceProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub header_len: usize,
    pub signal_start: usize,
    pub aux_start: usize,
    pub payload_end: usize,
    pub checksum_at: usize,
    pub trigger_at: Option<usize>,
    pub battery_at: Option<usize>,
    pub seq_at: usize,
    pub frame_len: usize,
}

impl FrameLayout {
    fn of(profile: &DeviceProfile) -> Self {
        let header_len = profile.header.len();
        let signal_start = header_len;
        let aux_start =
            signal_start + profile.sub_frames * profile.channels * profile.bytes_per_sample;
        let payload_end = aux_start + profile.aux.iter().map(|f| f.bytes).sum::<usize>();
        let checksum_at = payload_end + profile.reserved_bytes;
        let mut next = checksum_at + 1;
        let trigger_at = profile.has_trigger.then(|| {
            next += 1;
            next - 1
        });
        let battery_at = profile.has_battery.then(|| {
            next += 1;
            next - 1
        });
        let seq_at = next;
        Self {
            header_len,
            signal_start,
            aux_start,
            payload_end,
            checksum_at,
            trigger_at,
            battery_at,
            seq_at,
            frame_len: seq_at + 1,
        }
    }
}

// ============================================================================
// DeviceConfig
// ============================================================================

/// Validated acquisition settings, fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub profile: DeviceProfile,
    pub sample_rate: u32,
    /// Hardware channel indices emitted in each frame, in output order.
    pub channels: Vec<usize>,
}

impl DeviceConfig {
    /// Build a configuration that acquires every hardware channel.
    pub fn new(profile: DeviceProfile, sample_rate: u32) -> Result<Self> {
        let channels = (0..profile.channels).collect();
        let config = Self {
            profile,
            sample_rate,
            channels,
        };
        config.validate()?;
        Ok(config)
    }

    /// Restrict acquisition to `channels`. An empty list selects all.
    pub fn with_channels(mut self, channels: Vec<usize>) -> Result<Self> {
        self.channels = if channels.is_empty() {
            (0..self.profile.channels).collect()
        } else {
            channels
        };
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.profile.validate()?;
        if !self.profile.supported_rates.contains(&self.sample_rate) {
            return Err(DriverError::Config(format!(
                "invalid sampling rate {}Hz for {}. Supported: {:?}",
                self.sample_rate, self.profile.name, self.profile.supported_rates
            )));
        }
        if self.channels.is_empty() {
            return Err(DriverError::Config("no channels selected".into()));
        }
        let mut seen = vec![false; self.profile.channels];
        for &ch in &self.channels {
            match seen.get_mut(ch) {
                None => {
                    return Err(DriverError::Config(format!(
                        "channel {ch} out of range (device has {})",
                        self.profile.channels
                    )))
                }
                Some(true) => {
                    return Err(DriverError::Config(format!("channel {ch} selected twice")))
                }
                Some(flag) => *flag = true,
            }
        }
        if let (Some(params), Some(len)) = (&self.profile.impedance, self.impedance_window_len()) {
            if len == 0 {
                return Err(DriverError::Config(format!(
                    "impedance window is empty at {}Hz",
                    self.sample_rate
                )));
            }
            if params.tone_bins.1 > len {
                return Err(DriverError::Config(format!(
                    "impedance tone_bins end {} exceeds the {len}-sample window at {}Hz",
                    params.tone_bins.1, self.sample_rate
                )));
            }
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportKind {
        self.profile.transport
    }

    /// Samples per impedance window (≈2 s at the configured rate).
    pub fn impedance_window_len(&self) -> Option<usize> {
        self.profile
            .impedance
            .as_ref()
            .map(|p| (p.window_seconds * self.sample_rate as f64).round() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irecorder_layout_matches_wire_format() {
        let profile = DeviceProfile::irecorder("W8").unwrap();
        let layout = profile.layout();
        assert_eq!(profile.transport, TransportKind::Bluetooth);
        assert_eq!(layout.payload_end, 2 + 8 * 3);
        assert_eq!(layout.checksum_at, 26);
        assert_eq!(layout.trigger_at, Some(27));
        assert_eq!(layout.battery_at, Some(28));
        assert_eq!(layout.seq_at, 29);
        assert_eq!(layout.frame_len, 30);
    }

    #[test]
    fn econ_alpha_layout_has_reserved_gap() {
        let layout = DeviceProfile::econ_alpha().layout();
        assert_eq!(layout.aux_start, 2 + 8 * 8 * 3);
        assert_eq!(layout.payload_end, layout.aux_start + 12);
        assert_eq!(layout.checksum_at, layout.payload_end + 4);
        assert_eq!(layout.trigger_at, None);
        assert_eq!(layout.battery_at, Some(layout.checksum_at + 1));
        assert_eq!(layout.frame_len, layout.checksum_at + 3);
    }

    #[test]
    fn model_names_select_transport() {
        assert_eq!(
            DeviceProfile::irecorder("W32").unwrap().transport,
            TransportKind::Wifi
        );
        assert_eq!(
            DeviceProfile::irecorder("USB16").unwrap().supported_rates,
            vec![500, 1000, 2000]
        );
        assert!(DeviceProfile::irecorder("W12").is_err());
        assert!(DeviceProfile::irecorder("X8").is_err());
    }

    #[test]
    fn read_signed_sign_extends() {
        assert_eq!(ByteOrder::Big.read_signed(&[0xFF, 0xFF, 0xFE]), -2);
        assert_eq!(ByteOrder::Big.read_signed(&[0x00, 0x01, 0x00]), 256);
        assert_eq!(ByteOrder::Little.read_signed(&[0x00, 0x01, 0x00]), 256);
        assert_eq!(ByteOrder::Little.read_signed(&[0xFE, 0xFF]), -2);
        assert_eq!(ByteOrder::Big.read_signed(&[0x80]), -128);
        assert_eq!(
            ByteOrder::Big.read_signed(&[0x7F, 0xFF, 0xFF, 0xFF]),
            i32::MAX
        );
    }

    #[test]
    fn checksum_conventions() {
        assert_eq!(ChecksumKind::OnesComplementSum.compute(&[0x01, 0x02]), 0xFC);
        assert_eq!(ChecksumKind::Sum.compute(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn config_rejects_bad_rate_and_channels() {
        let profile = DeviceProfile::irecorder("W8").unwrap();
        assert!(matches!(
            DeviceConfig::new(profile.clone(), 1000),
            Err(DriverError::Config(_))
        ));
        let config = DeviceConfig::new(profile, 500).unwrap();
        assert_eq!(config.channels.len(), 8);
        assert!(config.clone().with_channels(vec![0, 8]).is_err());
        assert!(config.clone().with_channels(vec![1, 1]).is_err());
        let picked = config.with_channels(vec![3, 0]).unwrap();
        assert_eq!(picked.channels, vec![3, 0]);
    }

    #[test]
    fn impedance_window_spans_two_seconds() {
        let config = DeviceConfig::new(DeviceProfile::irecorder("W8").unwrap(), 500).unwrap();
        assert_eq!(config.impedance_window_len(), Some(1024));
        let config = DeviceConfig::new(DeviceProfile::econ_alpha(), 500).unwrap();
        assert_eq!(config.impedance_window_len(), None);
    }

    #[test]
    fn parse_threshold_scales_with_rate() {
        let profile = DeviceProfile::irecorder("USB8").unwrap();
        // 30-byte frames, 1% of one second at 2 kHz
        assert_eq!(profile.min_parse_bytes(2000), 600);
        let profile = DeviceProfile::econ_alpha();
        assert_eq!(profile.min_parse_bytes(500), profile.layout().frame_len);
    }

    #[test]
    fn profile_json_roundtrip_fills_defaults() {
        let json = r#"{
            "name": "bench",
            "header": [187, 170],
            "channels": 4,
            "bytes_per_sample": 3,
            "scale": 0.5,
            "has_trigger": true,
            "supported_rates": [250],
            "transport": "wifi"
        }"#;
        let profile = DeviceProfile::from_json(json).unwrap();
        assert_eq!(profile.sub_frames, 1);
        assert_eq!(profile.byte_order, ByteOrder::Big);
        assert_eq!(profile.checksum, ChecksumKind::OnesComplementSum);
        assert!(!profile.has_battery);
        assert_eq!(profile.layout().frame_len, 2 + 12 + 1 + 1 + 1);
        assert!(DeviceProfile::from_json(r#"{"name": "x"}"#).is_err());
    }

    fn with_impedance(edit: impl FnOnce(&mut ImpedanceParams)) -> DeviceProfile {
        let mut profile = DeviceProfile::irecorder("W8").unwrap();
        if let Some(params) = profile.impedance.as_mut() {
            edit(params);
        }
        profile
    }

    #[test]
    fn reversed_tone_bins_are_rejected_from_json() {
        let mut value = serde_json::to_value(DeviceProfile::irecorder("W8").unwrap()).unwrap();
        value["impedance"]["tone_bins"] = serde_json::json!([70, 60]);
        let err = DeviceProfile::from_json(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("tone_bins"), "{err}");
        assert!(with_impedance(|p| p.tone_bins = (64, 64)).validate().is_err());
    }

    #[test]
    fn impedance_window_must_be_positive() {
        let profile = with_impedance(|p| p.window_seconds = 0.0);
        assert!(matches!(
            DeviceConfig::new(profile, 500),
            Err(DriverError::Config(_))
        ));
        let profile = with_impedance(|p| p.window_seconds = f64::NAN);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn impedance_fractions_and_factors_are_checked() {
        assert!(with_impedance(|p| p.open_fraction = 1.5).validate().is_err());
        assert!(with_impedance(|p| p.injection_factor = 0.0).validate().is_err());
        assert!(with_impedance(|p| p.saturation_counts = f64::INFINITY)
            .validate()
            .is_err());
        let mut profile = DeviceProfile::irecorder("W8").unwrap();
        profile.scale = -1.0;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn tone_bins_must_fit_the_window() {
        // 0.1 s at 500 Hz is a 50-sample window; the default bins end at 67.
        let profile = with_impedance(|p| p.window_seconds = 0.1);
        let err = DeviceConfig::new(profile.clone(), 500).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
        let mut profile = profile;
        if let Some(p) = profile.impedance.as_mut() {
            p.tone_bins = (10, 12);
        }
        assert_eq!(
            DeviceConfig::new(profile, 500).unwrap().impedance_window_len(),
            Some(50)
        );
    }
}
