//! Chirp preamble generation and detection.

use std::f32::consts::PI;
use std::time::Duration;

use crate::correlation::TemplateCorrelator;
use crate::error::Result;
use crate::fsk::ModulationKernel;

/// Normalized correlation needed to declare a preamble.
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.55;
/// Windows quieter than this (RMS) are never reported.
const MIN_WINDOW_RMS: f32 = 1e-4;
const EDGE_RAMP: Duration = Duration::from_millis(4);

/// Linear chirp from `start_freq` to `end_freq`.
pub fn generate_chirp(
    sample_rate: u32,
    duration_samples: usize,
    start_freq: f32,
    end_freq: f32,
    amplitude: f32,
) -> Vec<f32> {
    let fs = sample_rate as f32;
    let duration = duration_samples as f32 / fs;
    let sweep = (end_freq - start_freq) / duration;
    (0..duration_samples)
        .map(|n| {
            let t = n as f32 / fs;
            amplitude * (2.0 * PI * (start_freq * t + sweep * t * t / 2.0)).sin()
        })
        .collect()
}

/// Up-chirp across the kernel's occupied band, with short ramps at both ends.
pub fn generate_preamble(
    kernel: &dyn ModulationKernel,
    leader: Duration,
    amplitude: f32,
) -> Vec<f32> {
    let sample_rate = kernel.sample_rate();
    let len = ((leader.as_secs_f64() * sample_rate as f64) as usize).max(1);
    let (low, high) = kernel.occupied_band();
    let mut chirp = generate_chirp(sample_rate, len, low, high, amplitude);

    let ramp = ((EDGE_RAMP.as_secs_f64() * sample_rate as f64) as usize).min(len / 2);
    for i in 0..ramp {
        let gain = 0.5 - 0.5 * (PI * i as f32 / ramp as f32).cos();
        chirp[i] *= gain;
        chirp[len - 1 - i] *= gain;
    }
    chirp
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Index of the first preamble sample in the searched buffer.
    pub start: usize,
    /// Normalized correlation, 0..=1.
    pub score: f32,
}

pub struct PreambleDetector {
    correlator: TemplateCorrelator,
    template_energy: f64,
    threshold: f32,
}

impl PreambleDetector {
    pub fn new(template: Vec<f32>) -> Self {
        let template_energy = template.iter().map(|&x| (x as f64) * (x as f64)).sum();
        Self {
            correlator: TemplateCorrelator::new(template),
            template_energy,
            threshold: DEFAULT_DETECTION_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn template_len(&self) -> usize {
        self.correlator.template().len()
    }

    /// Find the first preamble fully contained in `samples`.
    ///
    /// The first window above the threshold is refined to the correlation peak
    /// within half a preamble, so a later preamble in the same buffer is never
    /// preferred over an earlier one.
    pub fn detect(&mut self, samples: &[f32]) -> Result<Option<Detection>> {
        let m = self.template_len();
        if m == 0 || samples.len() < m || self.template_energy <= 0.0 {
            return Ok(None);
        }
        let raw = self.correlator.correlate(samples)?;

        let mut prefix = Vec::with_capacity(samples.len() + 1);
        prefix.push(0.0f64);
        let mut acc = 0.0f64;
        for &s in samples {
            acc += (s as f64) * (s as f64);
            prefix.push(acc);
        }
        let min_energy = (MIN_WINDOW_RMS as f64).powi(2) * m as f64;
        let score_at = |i: usize| -> f32 {
            let window_energy = prefix[i + m] - prefix[i];
            if window_energy < min_energy {
                return 0.0;
            }
            let denom = (window_energy * self.template_energy).sqrt();
            (raw[i] as f64 / denom).abs() as f32
        };

        let Some(first) = (0..raw.len()).find(|&i| score_at(i) > self.threshold) else {
            return Ok(None);
        };
        let end = (first + m / 2).min(raw.len());
        let (start, score) = (first..end)
            .map(|i| (i, score_at(i)))
            .fold((first, 0.0f32), |best, cur| if cur.1 > best.1 { cur } else { best });

        log::trace!("preamble at {} (score {:.3})", start, score);
        Ok(Some(Detection { start, score }))
    }
}
