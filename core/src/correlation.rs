//! FFT cross-correlation of a stream against a fixed template.
//!
//! Output index `i` is the correlation for a window starting at `signal[i]`
//! that fully overlaps the template ("valid" mode). Plans and the template
//! spectrum are cached per FFT size.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{ModemError, Result};

struct Plan {
    size: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    template_spectrum: Vec<Complex<f32>>,
}

pub struct TemplateCorrelator {
    template: Vec<f32>,
    planner: RealFftPlanner<f32>,
    plan: Option<Plan>,
}

impl TemplateCorrelator {
    pub fn new(template: Vec<f32>) -> Self {
        Self {
            template,
            planner: RealFftPlanner::new(),
            plan: None,
        }
    }

    pub fn template(&self) -> &[f32] {
        &self.template
    }

    /// Correlate `signal` against the template. Empty when the signal is
    /// shorter than the template.
    pub fn correlate(&mut self, signal: &[f32]) -> Result<Vec<f32>> {
        let m = self.template.len();
        if m == 0 || signal.len() < m {
            return Ok(Vec::new());
        }

        let size = (signal.len() + m - 1).next_power_of_two();
        self.prepare(size)?;
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ModemError::Fft("correlation plan missing".to_string()))?;

        let mut padded = vec![0.0f32; size];
        padded[..signal.len()].copy_from_slice(signal);
        let mut spectrum = plan.forward.make_output_vec();
        plan.forward
            .process(&mut padded, &mut spectrum)
            .map_err(|e| ModemError::Fft(format!("forward transform failed: {:?}", e)))?;

        for (bin, t) in spectrum.iter_mut().zip(&plan.template_spectrum) {
            *bin *= t;
        }
        // Products of real spectra are real at DC and Nyquist; drop rounding noise.
        if let Some(first) = spectrum.first_mut() {
            first.im = 0.0;
        }
        if let Some(last) = spectrum.last_mut() {
            last.im = 0.0;
        }

        let mut full = vec![0.0f32; size];
        plan.inverse
            .process(&mut spectrum, &mut full)
            .map_err(|e| ModemError::Fft(format!("inverse transform failed: {:?}", e)))?;

        let scale = 1.0 / size as f32;
        let valid_len = signal.len() - m + 1;
        Ok(full[m - 1..m - 1 + valid_len]
            .iter()
            .map(|v| v * scale)
            .collect())
    }

    fn prepare(&mut self, size: usize) -> Result<()> {
        if self.plan.as_ref().is_some_and(|p| p.size == size) {
            return Ok(());
        }
        let forward = self.planner.plan_fft_forward(size);
        let inverse = self.planner.plan_fft_inverse(size);

        // Time-reversed template turns the convolution into a correlation.
        let mut reversed = vec![0.0f32; size];
        for (i, &v) in self.template.iter().rev().enumerate() {
            reversed[i] = v;
        }
        let mut template_spectrum = forward.make_output_vec();
        forward
            .process(&mut reversed, &mut template_spectrum)
            .map_err(|e| ModemError::Fft(format!("template transform failed: {:?}", e)))?;

        self.plan = Some(Plan {
            size,
            forward,
            inverse,
            template_spectrum,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(signal: &[f32], template: &[f32]) -> Vec<f32> {
        (0..=signal.len() - template.len())
            .map(|i| template.iter().enumerate().map(|(j, t)| signal[i + j] * t).sum())
            .collect()
    }

    #[test]
    fn test_valid_length() {
        let mut c = TemplateCorrelator::new(vec![1.0; 10]);
        assert_eq!(c.correlate(&[1.0; 100]).unwrap().len(), 91);
        assert!(c.correlate(&[1.0, 2.0]).unwrap().is_empty());
    }

    #[test]
    fn test_impulse_template_returns_signal() {
        let signal = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut c = TemplateCorrelator::new(vec![1.0, 0.0, 0.0]);
        let result = c.correlate(&signal).unwrap();
        for (r, s) in result.iter().zip(&signal[..3]) {
            assert!((r - s).abs() < 1e-4);
        }
    }

    #[test]
    fn test_matches_direct_computation() {
        let signal: Vec<f32> = (0..300).map(|i| ((i * 37 % 101) as f32 / 50.0) - 1.0).collect();
        let template: Vec<f32> = (0..40).map(|i| ((i * 13 % 17) as f32 / 8.0) - 1.0).collect();
        let mut c = TemplateCorrelator::new(template.clone());
        let fast = c.correlate(&signal).unwrap();
        let slow = direct(&signal, &template);
        assert_eq!(fast.len(), slow.len());
        for (i, (a, b)) in fast.iter().zip(&slow).enumerate() {
            assert!((a - b).abs() < 1e-2, "mismatch at {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_plan_reuse_across_sizes() {
        let mut c = TemplateCorrelator::new(vec![0.5, 1.0, 1.5]);
        let a = c.correlate(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let _ = c.correlate(&[0.0; 1000]).unwrap();
        let b = c.correlate(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(a.len(), 2);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
        assert!((a[0] - 7.0).abs() < 1e-4);
    }
}
