use std::f32::consts::PI;

use crate::error::{ModemError, Result};
use crate::license::Throughput;

/// Fraction of each symbol ramped in and out to limit key clicks.
const EDGE_TAPER_RATIO: f32 = 0.08;
const MIN_TAPER_SAMPLES: usize = 4;
const MAX_TONES: usize = 16;

/// Turns coded bits into audio and audio back into soft bits.
///
/// Implementations must be deterministic: the same bits always produce the
/// same samples, and `demodulate` of a clean `modulate` output recovers the bits.
pub trait ModulationKernel: Send {
    fn sample_rate(&self) -> u32;

    fn throughput(&self) -> Throughput;

    fn bits_per_symbol(&self) -> usize;

    fn samples_per_symbol(&self) -> usize;

    /// Lowest and highest frequency the kernel puts energy on.
    fn occupied_band(&self) -> (f32, f32);

    /// Modulate bits. The last symbol is zero padded if needed.
    fn modulate(&self, bits: &[bool]) -> Vec<f32>;

    /// Soft bits (0.0..=1.0) for a whole number of symbols.
    fn demodulate(&self, samples: &[f32]) -> Result<Vec<f32>>;

    fn symbols_for_bits(&self, bits: usize) -> usize {
        bits.div_ceil(self.bits_per_symbol())
    }

    fn samples_for_bits(&self, bits: usize) -> usize {
        self.symbols_for_bits(bits) * self.samples_per_symbol()
    }
}

/// Geometry shared by the kernel and configuration validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MfskGeometry {
    pub tones: usize,
    pub samples_per_symbol: usize,
    /// Tone index (in multiples of the symbol rate) of the lowest tone.
    pub first_tone: u32,
}

/// Orthogonal M-ary FSK.
///
/// Tones sit on multiples of the symbol rate, so every symbol holds a whole
/// number of cycles and the tones are orthogonal over one symbol. Symbols are
/// Gray coded onto tones.
pub struct MfskKernel {
    sample_rate: u32,
    throughput: Throughput,
    geometry: MfskGeometry,
    frequencies: Vec<f32>,
    bits_per_symbol: usize,
    amplitude: f32,
    taper: Vec<f32>,
}

impl MfskKernel {
    pub fn new(
        sample_rate: u32,
        center_hz: f32,
        throughput: Throughput,
        amplitude: f32,
    ) -> Result<Self> {
        let geometry = Self::check_geometry(sample_rate, center_hz, throughput)?;
        let rate = throughput.symbol_rate as f32;
        let frequencies = (0..geometry.tones)
            .map(|k| (geometry.first_tone + k as u32) as f32 * rate)
            .collect::<Vec<_>>();
        let sps = geometry.samples_per_symbol;
        let taper_len = ((sps as f32 * EDGE_TAPER_RATIO) as usize).max(MIN_TAPER_SAMPLES);

        log::debug!(
            "MFSK kernel: {} tones {:.1}..{:.1} Hz, {} samples/symbol",
            geometry.tones,
            frequencies[0],
            frequencies[geometry.tones - 1],
            sps
        );

        Ok(Self {
            sample_rate,
            throughput,
            bits_per_symbol: geometry.tones.trailing_zeros() as usize,
            geometry,
            frequencies,
            amplitude: amplitude.clamp(0.0, 1.0),
            taper: raised_cosine_window(sps, taper_len),
        })
    }

    /// Validate a mode against the sound card rate and derive the tone plan.
    pub fn check_geometry(
        sample_rate: u32,
        center_hz: f32,
        throughput: Throughput,
    ) -> Result<MfskGeometry> {
        let rate = throughput.symbol_rate;
        if rate == 0 || sample_rate % rate != 0 {
            return Err(ModemError::ConfigurationInvalid(format!(
                "symbol rate {} Bd must divide the sample rate {} Hz",
                rate, sample_rate
            )));
        }
        let slots = (throughput.bandwidth_hz / rate) as usize;
        if slots < 2 {
            return Err(ModemError::ConfigurationInvalid(format!(
                "bandwidth {} Hz is too narrow for {} Bd",
                throughput.bandwidth_hz, rate
            )));
        }
        let mut tones = 2;
        while tones * 2 <= slots.min(MAX_TONES) {
            tones *= 2;
        }

        let first = (center_hz / rate as f32 - (tones as f32 - 1.0) / 2.0).round();
        let nyquist = sample_rate as f32 / 2.0;
        let top = (first + tones as f32) * rate as f32;
        if first < 1.0 || top >= nyquist {
            return Err(ModemError::ConfigurationInvalid(format!(
                "{} tones around {} Hz do not fit below Nyquist ({} Hz)",
                tones, center_hz, nyquist
            )));
        }

        Ok(MfskGeometry {
            tones,
            samples_per_symbol: (sample_rate / rate) as usize,
            first_tone: first as u32,
        })
    }

    pub fn geometry(&self) -> MfskGeometry {
        self.geometry
    }

    pub fn frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    fn write_symbol(&self, value: usize, out: &mut Vec<f32>) {
        let tone = gray_encode(value);
        let omega = 2.0 * PI * self.frequencies[tone] / self.sample_rate as f32;
        out.extend(
            self.taper
                .iter()
                .enumerate()
                .map(|(n, &w)| self.amplitude * w * (omega * n as f32).sin()),
        );
    }

    /// Energy on each tone for one symbol.
    fn tone_energies(&self, symbol: &[f32]) -> Vec<f32> {
        let n = symbol.len();
        let mean = symbol.iter().sum::<f32>() / n as f32;

        (0..self.geometry.tones)
            .map(|tone| {
                // Exact bin: tone frequencies are whole multiples of the symbol rate.
                let k = self.geometry.first_tone + tone as u32;
                let omega = 2.0 * PI * k as f32 / n as f32;
                let coeff = 2.0 * omega.cos();
                let (mut q1, mut q2) = (0.0f32, 0.0f32);
                for &sample in symbol {
                    let q0 = coeff * q1 - q2 + (sample - mean);
                    q2 = q1;
                    q1 = q0;
                }
                let real = q1 - q2 * omega.cos();
                let imag = q2 * omega.sin();
                (real * real + imag * imag).sqrt()
            })
            .collect()
    }
}

impl ModulationKernel for MfskKernel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn throughput(&self) -> Throughput {
        self.throughput
    }

    fn bits_per_symbol(&self) -> usize {
        self.bits_per_symbol
    }

    fn samples_per_symbol(&self) -> usize {
        self.geometry.samples_per_symbol
    }

    fn occupied_band(&self) -> (f32, f32) {
        let half = self.throughput.symbol_rate as f32 / 2.0;
        (
            self.frequencies[0] - half,
            self.frequencies[self.frequencies.len() - 1] + half,
        )
    }

    fn modulate(&self, bits: &[bool]) -> Vec<f32> {
        let bps = self.bits_per_symbol;
        let mut out = Vec::with_capacity(self.samples_for_bits(bits.len()));
        for chunk in bits.chunks(bps) {
            let value = (0..bps).fold(0usize, |acc, i| {
                (acc << 1) | chunk.get(i).copied().unwrap_or(false) as usize
            });
            self.write_symbol(value, &mut out);
        }
        out
    }

    fn demodulate(&self, samples: &[f32]) -> Result<Vec<f32>> {
        let sps = self.geometry.samples_per_symbol;
        if samples.len() % sps != 0 {
            return Err(ModemError::InvalidInputSize);
        }
        let bps = self.bits_per_symbol;
        let mut soft = Vec::with_capacity(samples.len() / sps * bps);

        for symbol in samples.chunks_exact(sps) {
            let energies = self.tone_energies(symbol);
            for bit in 0..bps {
                let mask = 1 << (bps - 1 - bit);
                let (mut best_one, mut best_zero) = (0.0f32, 0.0f32);
                for (tone, &energy) in energies.iter().enumerate() {
                    if gray_decode(tone) & mask != 0 {
                        best_one = best_one.max(energy);
                    } else {
                        best_zero = best_zero.max(energy);
                    }
                }
                let total = best_one + best_zero;
                soft.push(if total > 1e-9 { best_one / total } else { 0.5 });
            }
        }

        Ok(soft)
    }
}

fn gray_encode(value: usize) -> usize {
    value ^ (value >> 1)
}

fn gray_decode(mut code: usize) -> usize {
    let mut shift = code >> 1;
    while shift != 0 {
        code ^= shift;
        shift >>= 1;
    }
    code
}

/// Window that ramps both edges with a sine-squared profile.
fn raised_cosine_window(len: usize, taper_len: usize) -> Vec<f32> {
    let taper = taper_len.min(len / 2);
    let mut window = vec![1.0; len];
    for i in 0..taper {
        let progress = i as f32 / taper as f32;
        let value = (PI * progress / 2.0).sin().powi(2);
        window[i] = value;
        window[len - 1 - i] = value;
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(bw: u32, rate: u32) -> MfskKernel {
        MfskKernel::new(8000, 1500.0, Throughput::new(bw, rate), 0.5).unwrap()
    }

    fn hard(soft: &[f32]) -> Vec<bool> {
        soft.iter().map(|&s| s > 0.5).collect()
    }

    #[test]
    fn test_tone_plan() {
        let k = kernel(1000, 250);
        assert_eq!(k.geometry().tones, 4);
        assert_eq!(k.samples_per_symbol(), 32);
        assert_eq!(k.frequencies(), &[1250.0, 1500.0, 1750.0, 2000.0]);
        let (lo, hi) = k.occupied_band();
        assert_eq!(hi - lo, 1000.0);
    }

    #[test]
    fn test_tone_count_caps_at_sixteen() {
        let geometry =
            MfskKernel::check_geometry(48_000, 1500.0, Throughput::new(5000, 100)).unwrap();
        assert_eq!(geometry.tones, 16);
    }

    #[test]
    fn test_rejects_rate_not_dividing_sample_rate() {
        assert!(MfskKernel::check_geometry(8000, 1500.0, Throughput::new(1000, 300)).is_err());
    }

    #[test]
    fn test_rejects_band_too_narrow() {
        assert!(MfskKernel::check_geometry(8000, 1500.0, Throughput::new(300, 200)).is_err());
    }

    #[test]
    fn test_gray_code_inverse() {
        for v in 0..16 {
            assert_eq!(gray_decode(gray_encode(v)), v);
        }
    }

    #[test]
    fn test_modulate_demodulate_clean() {
        let k = kernel(1000, 250);
        let bits: Vec<bool> = (0..64).map(|i| (i * 7 + 3) % 5 < 2).collect();
        let samples = k.modulate(&bits);
        assert_eq!(samples.len(), 32 * 32);
        let soft = k.demodulate(&samples).unwrap();
        assert_eq!(hard(&soft), bits);
    }

    #[test]
    fn test_padding_of_last_symbol() {
        let k = kernel(2000, 250); // 8 tones, 3 bits per symbol
        assert_eq!(k.bits_per_symbol(), 3);
        let bits = vec![true; 4];
        let samples = k.modulate(&bits);
        assert_eq!(samples.len(), 2 * k.samples_per_symbol());
        let soft = k.demodulate(&samples).unwrap();
        assert_eq!(hard(&soft[..4]), bits);
        assert_eq!(hard(&soft[4..]), vec![false, false]);
    }

    #[test]
    fn test_demodulate_is_gain_independent() {
        let k = kernel(1000, 250);
        let bits = vec![true, false, false, true, true, true];
        let quiet: Vec<f32> = k.modulate(&bits).iter().map(|s| s * 0.01).collect();
        assert_eq!(hard(&k.demodulate(&quiet).unwrap()), bits);
    }

    #[test]
    fn test_demodulate_rejects_partial_symbol() {
        let k = kernel(1000, 250);
        assert!(k.demodulate(&[0.0; 33]).is_err());
    }

    #[test]
    fn test_silence_gives_no_information() {
        let k = kernel(1000, 250);
        let soft = k.demodulate(&[0.0; 64]).unwrap();
        assert!(soft.iter().all(|&s| s == 0.5));
    }
}
