//! Online electrode impedance estimation.
//!
//! In impedance mode the amplifier injects a small calibration current at a
//! fixed frequency into every electrode. The voltage that tone produces is
//! proportional to the contact impedance, so each channel's impedance is read
//! off the DFT magnitude around the tone over a window of ≈2 s.
//!
//! Windows are filled on the receive path and handed to a dedicated worker
//! thread through a single-slot channel. While a transform is running, newly
//! completed windows are skipped rather than queued, so at most one
//! computation is ever in flight and only the freshest result is kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, warn};
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::errors::{DriverError, Result};
use crate::frame::Frame;
use crate::profile::{DeviceConfig, ImpedanceParams};

// ============================================================================
// Window
// ============================================================================

/// Fixed-size per-channel ring buffer with a write cursor.
#[derive(Debug, Clone)]
pub struct ImpedanceWindow {
    data: Vec<Vec<f64>>,
    len: usize,
    cursor: usize,
}

impl ImpedanceWindow {
    pub fn new(channels: usize, len: usize) -> Self {
        Self {
            data: vec![vec![0.0; len]; channels],
            len,
            cursor: 0,
        }
    }

    /// Write one sample row at the cursor. Returns `true` when this write
    /// filled the window; the cursor then wraps to zero.
    pub fn push(&mut self, row: &[f64]) -> bool {
        for (column, &value) in self.data.iter_mut().zip(row) {
            column[self.cursor] = value;
        }
        self.cursor += 1;
        if self.cursor == self.len {
            self.cursor = 0;
            true
        } else {
            false
        }
    }

    pub fn channels(&self) -> &[Vec<f64>] {
        &self.data
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reset(&mut self) {
        for column in &mut self.data {
            column.iter_mut().for_each(|v| *v = 0.0);
        }
        self.cursor = 0;
    }
}

// ============================================================================
// Spectral estimate
// ============================================================================

/// Impedance in ohms per channel from one full window.
///
/// Channels that are open (almost every sample saturated) or dead (no
/// sample above `dead_level`) are reported as `f64::INFINITY`.
pub fn compute_impedance(channels: &[Vec<f64>], params: &ImpedanceParams, scale: f64) -> Vec<f64> {
    let Some(n) = channels.first().map(Vec::len).filter(|&n| n > 0) else {
        return vec![f64::INFINITY; channels.len()];
    };

    let saturation = params.saturation_counts * scale;
    let factor = params.injection_factor / (n as f64 / 2.0);
    let hi = params.tone_bins.1.min(n);
    let lo = params.tone_bins.0.min(hi);

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer = vec![Complex::new(0.0, 0.0); n];

    channels
        .iter()
        .map(|column| {
            let in_range = column.iter().filter(|v| v.abs() <= saturation).count();
            if in_range as f64 / n as f64 <= params.open_fraction {
                return f64::INFINITY;
            }
            if column.iter().all(|v| v.abs() <= params.dead_level) {
                return f64::INFINITY;
            }

            for (slot, &v) in buffer.iter_mut().zip(column) {
                *slot = Complex::new(v, 0.0);
            }
            fft.process(&mut buffer);
            let peak = buffer[lo..hi]
                .iter()
                .map(|c| c.norm())
                .fold(0.0_f64, f64::max);
            (peak * factor - params.baseline_ohms).abs().trunc()
        })
        .collect()
}

// ============================================================================
// Estimator
// ============================================================================

struct Job {
    generation: u64,
    window: Vec<Vec<f64>>,
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<Vec<f64>>>,
    generation: AtomicU64,
    completed: AtomicU64,
}

/// Cloneable handle to an estimator's latest result.
#[derive(Clone)]
pub struct ImpedanceReadout {
    shared: Arc<Shared>,
}

impl ImpedanceReadout {
    pub fn latest(&self) -> Option<Vec<f64>> {
        self.shared.latest.lock().clone()
    }
}

/// Accumulates impedance-mode samples and publishes the latest estimate.
pub struct ImpedanceEstimator {
    window: ImpedanceWindow,
    shared: Arc<Shared>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    dispatched: u64,
    skipped: u64,
}

impl ImpedanceEstimator {
    /// Start an estimator for `channels` signals and `window_len` samples.
    pub fn new(channels: usize, window_len: usize, params: ImpedanceParams, scale: f64) -> Result<Self> {
        if window_len == 0 {
            return Err(DriverError::Config("impedance window must not be empty".into()));
        }
        let (tx, rx) = bounded::<Job>(1);
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);

        let worker = thread::Builder::new()
            .name("impedance".into())
            .spawn(move || {
                for job in rx.iter() {
                    let result = compute_impedance(&job.window, &params, scale);
                    // A result for a window from before the last reset is stale.
                    if job.generation == worker_shared.generation.load(Ordering::Acquire) {
                        *worker_shared.latest.lock() = Some(result);
                    }
                    worker_shared.completed.fetch_add(1, Ordering::AcqRel);
                }
                debug!("impedance worker stopped");
            })?;

        Ok(Self {
            window: ImpedanceWindow::new(channels, window_len),
            shared,
            jobs: Some(tx),
            worker: Some(worker),
            dispatched: 0,
            skipped: 0,
        })
    }

    /// Estimator for the configured device, or `None` when its profile has
    /// no impedance mode.
    pub fn for_config(config: &DeviceConfig) -> Result<Option<Self>> {
        let (Some(params), Some(len)) = (
            config.profile.impedance.clone(),
            config.impedance_window_len(),
        ) else {
            return Ok(None);
        };
        Self::new(config.channels.len(), len, params, config.profile.scale).map(Some)
    }

    /// Push every sample row of `frames` into the window, dispatching a
    /// computation each time the window fills.
    pub fn accumulate(&mut self, frames: &[Frame]) {
        for frame in frames {
            for row in &frame.samples {
                if self.window.push(row) {
                    self.dispatch();
                }
            }
        }
    }

    /// Latest completed per-channel impedance in ohms.
    pub fn latest(&self) -> Option<Vec<f64>> {
        self.shared.latest.lock().clone()
    }

    /// Read-only view of the published result for other threads.
    pub fn readout(&self) -> ImpedanceReadout {
        ImpedanceReadout {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Discard the partial window and any published or in-flight result.
    pub fn reset(&mut self) {
        self.window.reset();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        *self.shared.latest.lock() = None;
    }

    /// Windows handed to the worker.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Windows dropped because the worker was still busy.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Computations the worker has finished.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub fn window(&self) -> &ImpedanceWindow {
        &self.window
    }

    fn dispatch(&mut self) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        let job = Job {
            generation: self.shared.generation.load(Ordering::Acquire),
            window: self.window.channels().to_vec(),
        };
        match jobs.try_send(job) {
            Ok(()) => self.dispatched += 1,
            Err(TrySendError::Full(_)) => {
                self.skipped += 1;
                debug!("impedance worker busy, window skipped");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("impedance worker gone, window dropped");
            }
        }
    }
}

impl Drop for ImpedanceEstimator {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("impedance worker panicked");
            }
        }
    }
}
