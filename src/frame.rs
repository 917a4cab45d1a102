/// One decoded packet.
///
/// `samples` holds one row per time-ordered sub-frame, each row containing
/// the selected signal channels in physical units. Multi-sample protocols
/// produce several rows per packet; most produce exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Packet counter (0-255, wrapping).
    pub seq: u8,
    /// Scaled signal samples, `[sub_frame][channel]`.
    pub samples: Vec<Vec<f64>>,
    /// Scaled auxiliary values (IMU axes etc.), in profile order.
    pub aux: Vec<f64>,
    /// Trigger/status byte, if the profile carries one.
    pub trigger: Option<u8>,
    /// Battery level in percent, if the profile carries one.
    pub battery: Option<u8>,
}

impl Frame {
    /// Flatten into rows of `channels..., trigger` for row-oriented sinks.
    ///
    /// Profiles without a trigger byte append nothing after the channels.
    pub fn rows(&self) -> impl Iterator<Item = Vec<f64>> + '_ {
        self.samples.iter().map(move |row| {
            let mut out = row.clone();
            if let Some(trigger) = self.trigger {
                out.push(trigger as f64);
            }
            out
        })
    }

    /// Number of time-ordered samples carried by this packet.
    pub fn sub_frames(&self) -> usize {
        self.samples.len()
    }
}
