//! Stateful packet framer.
//!
//! Bytes arrive from the transport in arbitrary chunks. [`FrameDecoder`]
//! accumulates them, extracts fixed-length packets that start with the
//! profile's sync header, validates the trailer checksum and tracks the
//! wrapping sequence counter.
//!
//! Consumption is governed by the fixed frame length: once a candidate is
//! located its whole span is consumed, so header bytes occurring inside a
//! payload never cause a false resynchronisation. A candidate that fails
//! its checksum is skipped as noise, never re-scanned.

use log::{debug, warn};

use crate::frame::Frame;
use crate::profile::{DeviceConfig, DeviceProfile, FrameLayout};

// ============================================================================
// Sequence tracking
// ============================================================================

/// Wrapping 0-255 packet counter with a monotonic loss counter.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u8>,
    dropped: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` and report whether packets were lost before it.
    ///
    /// The first packet after construction or [`reset`](Self::reset) has no
    /// history to compare against and is never reported as a gap.
    pub fn observe(&mut self, seq: u8) -> bool {
        let gap = match self.last {
            Some(last) => seq != last.wrapping_add(1),
            None => false,
        };
        if gap {
            self.dropped += 1;
        }
        self.last = Some(seq);
        gap
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.dropped = 0;
    }
}

/// Running counters since the last buffer clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Frames emitted.
    pub frames: u64,
    /// Candidates discarded for a checksum mismatch.
    pub checksum_errors: u64,
    /// Sequence discontinuities seen on accepted frames.
    pub dropped: u64,
}

// ============================================================================
// FrameDecoder
// ============================================================================

pub struct FrameDecoder {
    profile: DeviceProfile,
    layout: FrameLayout,
    channels: Vec<usize>,
    min_parse: usize,
    buffer: Vec<u8>,
    tracker: SequenceTracker,
    frames: u64,
    checksum_errors: u64,
}

impl FrameDecoder {
    /// Decoder for a validated configuration (selected channels, parse
    /// threshold at the configured rate).
    pub fn new(config: &DeviceConfig) -> Self {
        let mut decoder = Self::from_profile(config.profile.clone());
        decoder.channels = config.channels.clone();
        decoder.min_parse = config.profile.min_parse_bytes(config.sample_rate);
        decoder
    }

    /// Decoder emitting every hardware channel, parsing as soon as one frame
    /// is buffered.
    pub fn from_profile(profile: DeviceProfile) -> Self {
        let layout = profile.layout();
        Self {
            channels: (0..profile.channels).collect(),
            min_parse: layout.frame_len,
            layout,
            profile,
            buffer: Vec::with_capacity(layout.frame_len * 64),
            tracker: SequenceTracker::new(),
            frames: 0,
            checksum_errors: 0,
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Append `bytes` and return every complete, checksum-valid frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() < self.min_parse {
            return Vec::new();
        }

        let frame_len = self.layout.frame_len;
        let mut frames = Vec::new();
        let mut pos = 0;
        let mut consumed = 0;
        let mut checksum_errors = 0u64;
        let mut gaps = 0u64;

        while let Some(start) = self.find_header(pos) {
            let end = start + frame_len;
            if end > self.buffer.len() {
                break;
            }
            pos = end;
            consumed = end;

            let raw = &self.buffer[start..end];
            let payload = &raw[self.layout.signal_start..self.layout.payload_end];
            let expected = self.profile.checksum.compute(payload);
            if raw[self.layout.checksum_at] != expected {
                checksum_errors += 1;
                debug!(
                    "checksum invalid, packet dropped: received={:#04X}, calculated={:#04X}, frame={:02X?}",
                    raw[self.layout.checksum_at], expected, raw
                );
                continue;
            }

            let seq = raw[self.layout.seq_at];
            let previous = self.tracker.last();
            if self.tracker.observe(seq) {
                gaps += 1;
                debug!(
                    "packet loss: current={}, last valid={:?}, buffered={}",
                    seq,
                    previous,
                    self.buffer.len()
                );
            }
            frames.push(self.decode(raw));
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        } else {
            self.discard_noise();
        }

        self.frames += frames.len() as u64;
        self.checksum_errors += checksum_errors;
        if checksum_errors > 0 {
            warn!(
                "checksum errors in batch: {} (suppressing per-frame logs)",
                checksum_errors
            );
        }
        if gaps > 0 {
            warn!(
                "sequence gaps in batch: {}, dropped total: {} (suppressing per-frame logs)",
                gaps,
                self.tracker.dropped()
            );
        }
        frames
    }

    /// Forget buffered bytes, sequence history and counters.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.tracker.reset();
        self.frames = 0;
        self.checksum_errors = 0;
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            frames: self.frames,
            checksum_errors: self.checksum_errors,
            dropped: self.tracker.dropped(),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.tracker.dropped()
    }

    /// Bytes held back for the next `feed`.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn find_header(&self, from: usize) -> Option<usize> {
        let header = &self.profile.header;
        if from >= self.buffer.len() {
            return None;
        }
        self.buffer[from..]
            .windows(header.len())
            .position(|w| w == header.as_slice())
            .map(|i| i + from)
    }

    /// Drop leading bytes that can never start a frame. Keeps a partial
    /// header at the tail.
    fn discard_noise(&mut self) {
        match self.find_header(0) {
            Some(0) => {}
            Some(start) => {
                self.buffer.drain(..start);
            }
            None => {
                let keep = self.profile.header.len() - 1;
                let cut = self.buffer.len().saturating_sub(keep);
                self.buffer.drain(..cut);
            }
        }
    }

    fn decode(&self, raw: &[u8]) -> Frame {
        let layout = &self.layout;
        let bps = self.profile.bytes_per_sample;
        let row_bytes = self.profile.channels * bps;

        let samples = (0..self.profile.sub_frames)
            .map(|t| {
                let base = layout.signal_start + t * row_bytes;
                self.channels
                    .iter()
                    .map(|&ch| {
                        let at = base + ch * bps;
                        self.profile.byte_order.read_signed(&raw[at..at + bps]) as f64
                            * self.profile.scale
                    })
                    .collect()
            })
            .collect();

        let mut at = layout.aux_start;
        let aux = self
            .profile
            .aux
            .iter()
            .map(|field| {
                let value = field.order.read_signed(&raw[at..at + field.bytes]) as f64 * field.scale;
                at += field.bytes;
                value
            })
            .collect();

        Frame {
            seq: raw[layout.seq_at],
            samples,
            aux,
            trigger: layout.trigger_at.map(|i| raw[i]),
            battery: layout.battery_at.map(|i| raw[i]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ByteOrder, ChecksumKind, TransportKind};
    use crate::transport::mock::encode_frame;

    fn four_channel_profile() -> DeviceProfile {
        DeviceProfile {
            name: "bench".into(),
            header: vec![0xBB, 0xAA],
            channels: 4,
            bytes_per_sample: 3,
            sub_frames: 1,
            byte_order: ByteOrder::Big,
            scale: 1.0,
            aux: vec![],
            reserved_bytes: 0,
            checksum: ChecksumKind::OnesComplementSum,
            has_trigger: true,
            has_battery: true,
            parse_threshold_ratio: 0.0,
            supported_rates: vec![500],
            transport: TransportKind::Mock,
            impedance: None,
        }
    }

    fn frame_bytes(profile: &DeviceProfile, seq: u8) -> Vec<u8> {
        let raw: Vec<i32> = (0..4).map(|ch| seq as i32 * 10 + ch).collect();
        encode_frame(profile, seq, &raw, &[], 0, 80)
    }

    #[test]
    fn tracker_first_frame_is_not_a_gap() {
        let mut tracker = SequenceTracker::new();
        assert!(!tracker.observe(17));
        assert!(!tracker.observe(18));
        assert!(tracker.observe(20));
        assert_eq!(tracker.dropped(), 1);
    }

    #[test]
    fn tracker_wraps_at_256() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(254);
        tracker.observe(255);
        assert!(!tracker.observe(0));
        assert_eq!(tracker.dropped(), 0);
        tracker.reset();
        assert_eq!(tracker.last(), None);
    }

    #[test]
    fn decodes_scaled_signed_samples() {
        let mut profile = four_channel_profile();
        profile.scale = 0.5;
        let bytes = encode_frame(&profile, 9, &[-2, 4, 0, 1000], &[], 3, 55);
        let mut decoder = FrameDecoder::from_profile(profile);
        let frames = decoder.feed(&bytes);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.seq, 9);
        assert_eq!(frame.samples, vec![vec![-1.0, 2.0, 0.0, 500.0]]);
        assert_eq!(frame.trigger, Some(3));
        assert_eq!(frame.battery, Some(55));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn short_input_waits_for_more_bytes() {
        let profile = four_channel_profile();
        let bytes = frame_bytes(&profile, 0);
        let mut decoder = FrameDecoder::from_profile(profile);
        assert!(decoder.feed(&bytes[..5]).is_empty());
        assert_eq!(decoder.buffered(), 5);
        assert_eq!(decoder.feed(&bytes[5..]).len(), 1);
    }

    #[test]
    fn sequence_gap_counts_once() {
        let profile = four_channel_profile();
        let mut stream = Vec::new();
        for seq in [0u8, 1, 3, 4] {
            stream.extend(frame_bytes(&profile, seq));
        }
        let mut decoder = FrameDecoder::from_profile(profile);
        let frames = decoder.feed(&stream);
        assert_eq!(frames.len(), 4);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn checksum_failure_is_skipped_and_decoder_resyncs() {
        let profile = four_channel_profile();
        let mut bad = frame_bytes(&profile, 1);
        bad[4] ^= 0x01;
        let mut stream = frame_bytes(&profile, 0);
        stream.extend(bad);
        stream.extend(frame_bytes(&profile, 2));

        let mut decoder = FrameDecoder::from_profile(profile);
        let frames = decoder.feed(&stream);
        let seqs: Vec<u8> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert_eq!(decoder.stats().checksum_errors, 1);
        // The lost packet shows up as a gap on the next accepted frame.
        assert_eq!(decoder.dropped(), 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn header_inside_payload_does_not_resync() {
        let profile = four_channel_profile();
        // Channel 0 raw value 0x00BBAA puts the sync word inside the payload.
        let first = encode_frame(&profile, 0, &[0x00BB_AA, 0, 0, 0], &[], 0, 80);
        let second = frame_bytes(&profile, 1);
        let mut stream = first.clone();
        stream.extend(&second);

        let mut decoder = FrameDecoder::from_profile(profile);
        let frames = decoder.feed(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples[0][0], 0x00BB_AA as f64);
        assert_eq!(frames[1].seq, 1);
        assert_eq!(decoder.stats().checksum_errors, 0);
    }

    #[test]
    fn leading_noise_is_skipped() {
        let profile = four_channel_profile();
        let mut stream = vec![0x01, 0x02, 0xBB, 0x03];
        stream.extend(frame_bytes(&profile, 0));
        let mut decoder = FrameDecoder::from_profile(profile);
        let frames = decoder.feed(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn noise_without_header_keeps_partial_tail() {
        let profile = four_channel_profile();
        let mut decoder = FrameDecoder::from_profile(profile.clone());
        let mut noise = vec![0x00; 40];
        noise.push(0xBB);
        assert!(decoder.feed(&noise).is_empty());
        assert_eq!(decoder.buffered(), 1);
        let frame = frame_bytes(&profile, 0);
        assert_eq!(decoder.feed(&frame[1..]).len(), 1);
    }

    #[test]
    fn clear_discards_partial_bytes_and_history() {
        let profile = four_channel_profile();
        let mut decoder = FrameDecoder::from_profile(profile.clone());
        decoder.feed(&frame_bytes(&profile, 10));
        decoder.feed(&frame_bytes(&profile, 11)[..7]);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.feed(&[]).len(), 0);

        let frames = decoder.feed(&frame_bytes(&profile, 40));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 40);
        assert_eq!(decoder.dropped(), 0);
        assert_eq!(decoder.stats().frames, 1);
    }

    #[test]
    fn channel_selection_reorders_output() {
        let profile = four_channel_profile();
        let config = DeviceConfig::new(profile.clone(), 500)
            .unwrap()
            .with_channels(vec![3, 1])
            .unwrap();
        let bytes = encode_frame(&profile, 0, &[10, 11, 12, 13], &[], 0, 0);
        let mut decoder = FrameDecoder::new(&config);
        let frames = decoder.feed(&bytes);
        assert_eq!(frames[0].samples, vec![vec![13.0, 11.0]]);
    }

    #[test]
    fn multi_sample_packet_with_aux_fields() {
        let profile = DeviceProfile::econ_alpha();
        let raw: Vec<i32> = (0..64).collect();
        let aux = [1, -1, 2, -2, 300, -300];
        let bytes = encode_frame(&profile, 5, &raw, &aux, 0, 77);
        let mut decoder = FrameDecoder::from_profile(profile.clone());
        let frames = decoder.feed(&bytes);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.sub_frames(), 8);
        assert_eq!(frame.samples[1][0], 8.0 * profile.scale);
        assert_eq!(frame.samples[7][7], 63.0 * profile.scale);
        assert_eq!(frame.aux, vec![1.0, -1.0, 2.0, -2.0, 300.0, -300.0]);
        assert_eq!(frame.trigger, None);
        assert_eq!(frame.battery, Some(77));
    }

    #[test]
    fn plain_sum_checksum_profile() {
        let mut profile = four_channel_profile();
        profile.checksum = ChecksumKind::Sum;
        let bytes = frame_bytes(&profile, 0);
        let mut decoder = FrameDecoder::from_profile(profile.clone());
        assert_eq!(decoder.feed(&bytes).len(), 1);

        profile.checksum = ChecksumKind::OnesComplementSum;
        let mut strict = FrameDecoder::from_profile(profile);
        assert!(strict.feed(&bytes).is_empty());
        assert_eq!(strict.stats().checksum_errors, 1);
    }

    #[test]
    fn parse_threshold_defers_scanning() {
        let mut profile = four_channel_profile();
        profile.parse_threshold_ratio = 0.01;
        let config = DeviceConfig::new(profile.clone(), 500).unwrap();
        // 18-byte frames, 1% of 500 frames/s -> 90 bytes
        let mut decoder = FrameDecoder::new(&config);
        let mut total = 0;
        for seq in 0..4u8 {
            total += decoder.feed(&frame_bytes(&profile, seq)).len();
        }
        assert_eq!(total, 0);
        assert_eq!(decoder.feed(&frame_bytes(&profile, 4)).len(), 5);
    }
}
