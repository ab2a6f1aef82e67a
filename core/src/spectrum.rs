//! Spectrum and waterfall.
//!
//! The analyzer runs on the processing thread, fed with captured samples. It
//! keeps an overlapping window, emits one [`SpectrumFrame`] per hop and keeps
//! the most recent frames in a [`Waterfall`].

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::config::ModemConfig;
use crate::error::{ModemError, Result};

pub const MIN_FFT_SIZE: usize = 64;
pub const MAX_FFT_SIZE: usize = 32_768;

pub fn is_supported_fft_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowFunction {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowFunction {
    /// Periodic window of `len` coefficients.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        let n = len as f32;
        (0..len)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / n;
                match self {
                    WindowFunction::Rectangular => 1.0,
                    WindowFunction::Hann => 0.5 - 0.5 * x.cos(),
                    WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect()
    }
}

/// One column of the waterfall.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumFrame {
    pub sequence: u64,
    /// Start of the analysis window, seconds since the stream started.
    pub timestamp_secs: f64,
    pub fft_size: usize,
    pub first_bin_hz: f32,
    pub bin_hz: f32,
    pub reference_level_db: f32,
    pub range_db: f32,
    /// Magnitudes clamped to `[reference - range, reference]`.
    pub magnitudes_db: Vec<f32>,
}

impl SpectrumFrame {
    pub fn frequency_of(&self, index: usize) -> f32 {
        self.first_bin_hz + index as f32 * self.bin_hz
    }

    /// Strongest bin as `(frequency, dB)`.
    pub fn peak(&self) -> Option<(f32, f32)> {
        self.magnitudes_db
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &db)| (self.frequency_of(i), db))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    pub sample_rate: u32,
    pub fft_size: usize,
    pub window: WindowFunction,
    pub update_rate_hz: f32,
    pub reference_level_db: f32,
    pub range_db: f32,
    pub history: usize,
    pub center_hz: f32,
    pub bandwidth_hz: u32,
    pub display_multiplier: f32,
}

impl AnalyzerSettings {
    pub fn from_config(config: &ModemConfig, bandwidth_hz: u32) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            fft_size: config.spectrum.fft_size,
            window: config.spectrum.window,
            update_rate_hz: config.spectrum.update_rate_hz,
            reference_level_db: config.spectrum.reference_level_db,
            range_db: config.spectrum.range_db,
            history: config.spectrum.history,
            center_hz: config.modem.center_frequency_hz,
            bandwidth_hz,
            display_multiplier: config.spectrum.display_multiplier,
        }
    }

    /// Samples between consecutive frames.
    pub fn hop(&self) -> usize {
        ((self.sample_rate as f32 / self.update_rate_hz).round() as usize).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_supported_fft_size(self.fft_size) {
            return Err(ModemError::ConfigurationInvalid(format!(
                "FFT size {} must be a power of two in {}..={}",
                self.fft_size, MIN_FFT_SIZE, MAX_FFT_SIZE
            )));
        }
        if self.sample_rate == 0 || !(self.update_rate_hz > 0.0) {
            return Err(ModemError::ConfigurationInvalid(
                "sample rate and update rate must be positive".to_string(),
            ));
        }
        if !(self.range_db > 0.0) || self.history == 0 || !(self.display_multiplier > 0.0) {
            return Err(ModemError::ConfigurationInvalid(
                "display range, history and multiplier must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded history of spectrum frames, oldest first.
#[derive(Debug, Clone)]
pub struct Waterfall {
    capacity: usize,
    frames: VecDeque<Arc<SpectrumFrame>>,
}

impl Waterfall {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a frame, evicting the oldest one when full.
    pub fn push(&mut self, frame: Arc<SpectrumFrame>) -> Option<Arc<SpectrumFrame>> {
        let evicted = if self.frames.len() == self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&Arc<SpectrumFrame>> {
        self.frames.back()
    }

    pub fn snapshot(&self) -> Vec<Arc<SpectrumFrame>> {
        self.frames.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

pub struct SpectralAnalyzer {
    settings: AnalyzerSettings,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Amplitude scale that makes a full-scale sine read 0 dBFS.
    amplitude_scale: f32,
    bins: (usize, usize),
    pending: Vec<f32>,
    /// Samples still to discard when the hop is longer than the FFT.
    skip: usize,
    /// Absolute index of `pending[0]` in the stream.
    pending_start: u64,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    next_sequence: u64,
    waterfall: Waterfall,
}

impl SpectralAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Result<Self> {
        settings.validate()?;
        let fft = FftPlanner::new().plan_fft_forward(settings.fft_size);
        let window = settings.window.coefficients(settings.fft_size);
        let amplitude_scale = 2.0 / window.iter().sum::<f32>();
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let bins = display_bins(&settings);

        Ok(Self {
            fft,
            window,
            amplitude_scale,
            bins,
            pending: Vec::with_capacity(settings.fft_size * 2),
            skip: 0,
            pending_start: 0,
            buffer: vec![Complex::new(0.0, 0.0); settings.fft_size],
            scratch,
            next_sequence: 0,
            waterfall: Waterfall::new(settings.history),
            settings,
        })
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    pub fn waterfall(&self) -> &Waterfall {
        &self.waterfall
    }

    pub fn latest(&self) -> Option<&Arc<SpectrumFrame>> {
        self.waterfall.latest()
    }

    /// Feed captured samples; returns the frames completed by them.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<Arc<SpectrumFrame>> {
        let mut input = samples;
        if self.skip > 0 {
            let dropped = self.skip.min(input.len());
            self.skip -= dropped;
            self.pending_start += dropped as u64;
            input = &input[dropped..];
        }
        self.pending.extend_from_slice(input);

        let size = self.settings.fft_size;
        let hop = self.settings.hop();
        let mut produced = Vec::new();
        while self.pending.len() >= size {
            let frame = Arc::new(self.analyze());
            self.waterfall.push(frame.clone());
            produced.push(frame);

            let advance = hop.min(self.pending.len());
            self.pending.drain(..advance);
            self.pending_start += advance as u64;
            self.skip = hop - advance;
            if self.skip > 0 {
                // Hop is longer than what is buffered; nothing left to analyze.
                break;
            }
        }
        produced
    }

    /// Change the displayed dB range. Applies from the next frame on.
    pub fn set_display_range(&mut self, reference_level_db: f32, range_db: f32) -> Result<()> {
        if !(range_db > 0.0) || !reference_level_db.is_finite() {
            return Err(ModemError::ConfigurationInvalid(format!(
                "invalid display range {} dB below {} dB",
                range_db, reference_level_db
            )));
        }
        self.settings.reference_level_db = reference_level_db;
        self.settings.range_db = range_db;
        Ok(())
    }

    /// Follow a new session bandwidth. Applies from the next frame on.
    pub fn set_bandwidth(&mut self, bandwidth_hz: u32) {
        self.settings.bandwidth_hz = bandwidth_hz;
        self.bins = display_bins(&self.settings);
    }

    /// Replace all settings. FFT-related changes rebuild the plan and restart
    /// the sliding window; the waterfall keeps frames that still fit.
    pub fn reconfigure(&mut self, settings: AnalyzerSettings) -> Result<()> {
        settings.validate()?;
        let rebuild = settings.fft_size != self.settings.fft_size
            || settings.window != self.settings.window
            || settings.sample_rate != self.settings.sample_rate;
        if rebuild {
            let same_rate = settings.sample_rate == self.settings.sample_rate;
            let mut fresh = SpectralAnalyzer::new(settings)?;
            fresh.next_sequence = self.next_sequence;
            // Frames at another sample rate would not line up in time.
            if same_rate {
                fresh.pending_start = self.pending_start + self.pending.len() as u64;
                for frame in self.waterfall.snapshot() {
                    fresh.waterfall.push(frame);
                }
            }
            *self = fresh;
        } else {
            self.waterfall.set_capacity(settings.history);
            self.settings = settings;
            self.bins = display_bins(&self.settings);
        }
        Ok(())
    }

    fn analyze(&mut self) -> SpectrumFrame {
        let size = self.settings.fft_size;
        for ((slot, &sample), &w) in self.buffer.iter_mut().zip(&self.pending[..size]).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let reference = self.settings.reference_level_db;
        let floor = reference - self.settings.range_db;
        let (lo, hi) = self.bins;
        let magnitudes_db = self.buffer[lo..=hi]
            .iter()
            .map(|c| {
                let amplitude = c.norm() * self.amplitude_scale;
                (20.0 * amplitude.max(1e-12).log10()).clamp(floor, reference)
            })
            .collect();

        let bin_hz = self.settings.sample_rate as f32 / size as f32;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        SpectrumFrame {
            sequence,
            timestamp_secs: self.pending_start as f64 / self.settings.sample_rate as f64,
            fft_size: size,
            first_bin_hz: lo as f32 * bin_hz,
            bin_hz,
            reference_level_db: reference,
            range_db: self.settings.range_db,
            magnitudes_db,
        }
    }
}

/// Inclusive bin range covering `multiplier × bandwidth` around the center.
fn display_bins(settings: &AnalyzerSettings) -> (usize, usize) {
    let bin_hz = settings.sample_rate as f32 / settings.fft_size as f32;
    let nyquist_bin = settings.fft_size / 2;
    let half_span = settings.display_multiplier * settings.bandwidth_hz as f32 / 2.0;
    let lo = ((settings.center_hz - half_span) / bin_hz).floor().max(0.0) as usize;
    let hi = ((settings.center_hz + half_span) / bin_hz).ceil().max(0.0) as usize;
    let hi = hi.min(nyquist_bin);
    (lo.min(hi), hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AnalyzerSettings {
        AnalyzerSettings {
            sample_rate: 8000,
            fft_size: 256,
            window: WindowFunction::Hann,
            update_rate_hz: 62.5, // hop of 128 samples
            reference_level_db: 0.0,
            range_db: 100.0,
            history: 200,
            center_hz: 1500.0,
            bandwidth_hz: 1000,
            display_multiplier: 2.0,
        }
    }

    fn tone(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| amplitude * (2.0 * PI * freq * n as f32 / 8000.0).sin())
            .collect()
    }

    #[test]
    fn test_rejects_unsupported_fft_sizes() {
        for size in [0, 32, 100, 65_536] {
            let mut s = settings();
            s.fft_size = size;
            assert!(SpectralAnalyzer::new(s).is_err(), "size {} accepted", size);
        }
    }

    #[test]
    fn test_tone_peak_and_level() {
        let mut analyzer = SpectralAnalyzer::new(settings()).unwrap();
        // 1500 Hz sits exactly on bin 48.
        let frames = analyzer.push_samples(&tone(1500.0, 1.0, 256));
        assert_eq!(frames.len(), 1);
        let (freq, db) = frames[0].peak().unwrap();
        assert!((freq - 1500.0).abs() < 1.0);
        assert!(db.abs() < 0.5, "full-scale tone read {} dB", db);
    }

    #[test]
    fn test_display_span_follows_bandwidth() {
        let mut analyzer = SpectralAnalyzer::new(settings()).unwrap();
        let frame = analyzer.push_samples(&tone(1500.0, 0.5, 256)).remove(0);
        assert!(frame.first_bin_hz <= 500.0);
        assert!(frame.frequency_of(frame.magnitudes_db.len() - 1) >= 2500.0);

        analyzer.set_bandwidth(250);
        let narrow = analyzer.push_samples(&tone(1500.0, 0.5, 128)).remove(0);
        assert!(narrow.magnitudes_db.len() < frame.magnitudes_db.len());
        assert!(narrow.first_bin_hz > frame.first_bin_hz);
    }

    #[test]
    fn test_values_clamped_to_display_range() {
        let mut analyzer = SpectralAnalyzer::new(settings()).unwrap();
        analyzer.set_display_range(-20.0, 40.0).unwrap();
        let frame = analyzer.push_samples(&tone(1500.0, 1.0, 256)).remove(0);
        assert!(frame
            .magnitudes_db
            .iter()
            .all(|&db| (-60.0..=-20.0).contains(&db)));
        assert_eq!(frame.reference_level_db, -20.0);
        assert!(analyzer.set_display_range(0.0, 0.0).is_err());
    }

    #[test]
    fn test_overlapping_hop() {
        let mut analyzer = SpectralAnalyzer::new(settings()).unwrap();
        let frames = analyzer.push_samples(&vec![0.0; 1024]);
        // Windows start at 0, 128, ..., 768.
        assert_eq!(frames.len(), 7);
        assert!((frames[1].timestamp_secs - 128.0 / 8000.0).abs() < 1e-9);
    }

    #[test]
    fn test_hop_longer_than_fft_skips_samples() {
        let mut s = settings();
        s.update_rate_hz = 10.0; // hop of 800 samples
        let mut analyzer = SpectralAnalyzer::new(s).unwrap();
        let mut frames = Vec::new();
        for _ in 0..40 {
            frames.extend(analyzer.push_samples(&vec![0.0; 100]));
        }
        // 4000 samples: windows at 0, 800, 1600, 2400, 3200.
        assert_eq!(frames.len(), 5);
        assert!((frames[4].timestamp_secs - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_waterfall_keeps_latest_frames_in_order() {
        let mut s = settings();
        s.fft_size = 64;
        s.update_rate_hz = 125.0; // hop of 64
        let mut analyzer = SpectralAnalyzer::new(s).unwrap();
        let frames = analyzer.push_samples(&vec![0.1; 64 * 500]);
        assert_eq!(frames.len(), 500);

        let history = analyzer.waterfall().snapshot();
        assert_eq!(history.len(), 200);
        let sequences: Vec<u64> = history.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, (300..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_reconfigure_fft_size_keeps_history() {
        let mut analyzer = SpectralAnalyzer::new(settings()).unwrap();
        analyzer.push_samples(&vec![0.0; 512]);
        let before = analyzer.waterfall().len();
        let mut s = settings();
        s.fft_size = 512;
        analyzer.reconfigure(s).unwrap();
        assert_eq!(analyzer.waterfall().len(), before);
        let next = analyzer.push_samples(&vec![0.0; 512]);
        assert_eq!(next[0].fft_size, 512);
        assert_eq!(next[0].sequence, before as u64);
    }

    #[test]
    fn test_waterfall_capacity_shrink() {
        let mut waterfall = Waterfall::new(3);
        for sequence in 0..3 {
            let frame = SpectrumFrame {
                sequence,
                timestamp_secs: 0.0,
                fft_size: 64,
                first_bin_hz: 0.0,
                bin_hz: 1.0,
                reference_level_db: 0.0,
                range_db: 1.0,
                magnitudes_db: vec![],
            };
            assert!(waterfall.push(Arc::new(frame)).is_none());
        }
        waterfall.set_capacity(1);
        assert_eq!(waterfall.latest().unwrap().sequence, 2);
        assert_eq!(waterfall.len(), 1);
    }
}
