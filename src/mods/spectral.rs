//! src/mods/spectral.rs
//! Fixed-size forward/inverse FFT with owned buffers, plus regularised deconvolution.

use rustfft::{ num_complex::Complex, Fft, FftPlanner };
use std::sync::Arc;

/// Per-bin Wiener-style inverse filter, overwriting the observed spectrum:
/// `spectrum = conj(den) * spectrum / (|den|^2 + damping)`.
pub fn deconvolve_in_place(spectrum: &mut [Complex<f64>], den: &[Complex<f64>], damping: f64) {
    for (s, d) in spectrum.iter_mut().zip(den) {
        *s = deconvolve_bin(*s, *d, damping);
    }
}

#[inline]
fn deconvolve_bin(num: Complex<f64>, den: Complex<f64>, damping: f64) -> Complex<f64> {
    let denom = 1.0 / (den.norm_sqr() + damping);
    den.conj() * num * denom
}

/// Reusable N-point complex transform.
///
/// Owns one time-domain and one frequency-domain buffer and the two plans
/// that map between them. Plans are built once; the type is deliberately not
/// `Clone`. Neither direction normalises, so a forward/inverse pair scales by N.
pub struct SpectralTransform {
    time: Vec<Complex<f64>>,
    freq: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl SpectralTransform {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            time: vec![Complex::new(0.0, 0.0); size],
            freq: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            forward,
            inverse,
        }
    }

    pub fn time(&self) -> &[Complex<f64>] {
        &self.time
    }

    pub fn freq(&self) -> &[Complex<f64>] {
        &self.freq
    }

    pub fn freq_mut(&mut self) -> &mut [Complex<f64>] {
        &mut self.freq
    }

    /// Load real samples into the time buffer (imaginary parts zeroed).
    pub fn load_real<I: IntoIterator<Item = f64>>(&mut self, samples: I) {
        let mut it = samples.into_iter();
        for slot in self.time.iter_mut() {
            *slot = Complex::new(it.next().unwrap_or(0.0), 0.0);
        }
    }

    /// time -> freq
    pub fn forward(&mut self) {
        self.freq.copy_from_slice(&self.time);
        self.forward.process_with_scratch(&mut self.freq, &mut self.scratch);
    }

    /// freq -> time
    pub fn inverse(&mut self) {
        self.time.copy_from_slice(&self.freq);
        self.inverse.process_with_scratch(&mut self.time, &mut self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::chirp::{ Chirp, ToneWave };

    #[test]
    fn forward_then_inverse_scales_by_size() {
        let mut t = SpectralTransform::new(16);
        t.load_real((0..16).map(|i| (i as f64) * 0.25 - 1.0));
        t.forward();
        t.inverse();
        for (i, c) in t.time().iter().enumerate() {
            let expected = ((i as f64) * 0.25 - 1.0) * 16.0;
            assert!((c.re - expected).abs() < 1e-9);
            assert!(c.im.abs() < 1e-9);
        }
    }

    #[test]
    fn impulse_has_flat_spectrum() {
        let mut t = SpectralTransform::new(32);
        t.load_real(std::iter::once(1.0));
        t.forward();
        for c in t.freq() {
            assert!((c.re - 1.0).abs() < 1e-12 && c.im.abs() < 1e-12);
        }
    }

    #[test]
    fn deconvolve_bin_formula() {
        let mut out = [Complex::new(3.0, 1.0)];
        let den = [Complex::new(1.0, -2.0)];
        deconvolve_in_place(&mut out, &den, 5.0);
        // conj(den) * num = (1 + 2i)(3 + i) = 1 + 7i ; |den|^2 + 5 = 10
        assert!((out[0].re - 0.1).abs() < 1e-12);
        assert!((out[0].im - 0.7).abs() < 1e-12);
    }

    #[test]
    fn matched_filter_peaks_at_zero_delay() {
        let n = 256;
        let sr = 48_000.0;
        let chirp = Chirp::new(ToneWave::new(1.0, 2000.0), ToneWave::new(1.0, 20000.0), 0.002);
        let mut t = SpectralTransform::new(n);
        t.load_real((0..n).map(|i| chirp.sample((i as f64) / sr)));
        t.forward();
        let reference = t.freq().to_vec();

        deconvolve_in_place(t.freq_mut(), &reference, 1e-12);
        t.inverse();

        let out: Vec<f64> = t
            .time()
            .iter()
            .map(|c| c.re)
            .collect();
        assert!((out[0] - n as f64).abs() < 1e-3 * (n as f64));
        for v in &out[1..] {
            assert!(v.abs() < 0.01 * (n as f64), "side lobe {}", v);
        }
    }

    #[test]
    fn deconvolution_recovers_a_delay() {
        let n = 128;
        let sr = 48_000.0;
        let chirp = Chirp::new(ToneWave::new(1.0, 3000.0), ToneWave::new(1.0, 18000.0), 0.001);
        let mut t = SpectralTransform::new(n);
        t.load_real((0..n).map(|i| chirp.sample((i as f64) / sr)));
        t.forward();
        let reference = t.freq().to_vec();

        let delay = 37;
        t.load_real((0..n).map(|i| 0.5 * chirp.sample(((i as f64) - (delay as f64)) / sr)));
        t.forward();
        deconvolve_in_place(t.freq_mut(), &reference, 1e-3);
        t.inverse();

        let peak = t
            .time()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.re.abs().total_cmp(&b.1.re.abs()))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(delay));
    }
}
