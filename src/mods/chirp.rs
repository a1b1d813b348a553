//! src/mods/chirp.rs
//! Analytic waveform generators: pure tones, linear chirps and pulse trains.

use std::f64::consts::PI;

/// A pure sinusoid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToneWave {
    pub amplitude: f64,
    pub frequency: f64,
}

impl ToneWave {
    pub const fn new(amplitude: f64, frequency: f64) -> Self {
        Self { amplitude, frequency }
    }

    #[inline]
    pub fn sample(&self, time: f64) -> f64 {
        self.amplitude * (time * self.frequency * PI * 2.0).sin()
    }
}

/// Linear sweep of amplitude and instantaneous frequency between two tones.
///
/// The phase is the integral of the frequency ramp, so the sample at any `t`
/// is exact and a block synthesised later matches what was played.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Chirp {
    a0: f64,
    a_slope: f64,
    w0: f64,
    w_half_slope: f64,
    duration: f64,
}

impl Chirp {
    pub fn new(start: ToneWave, end: ToneWave, duration: f64) -> Self {
        if duration <= 0.0 {
            return Self::silence();
        }
        Self {
            a0: start.amplitude,
            a_slope: (end.amplitude - start.amplitude) / duration,
            w0: start.frequency * PI * 2.0,
            w_half_slope: ((end.frequency - start.frequency) * PI) / duration,
            duration,
        }
    }

    /// Zero-length chirp; samples to 0 everywhere.
    pub const fn silence() -> Self {
        Self { a0: 0.0, a_slope: 0.0, w0: 0.0, w_half_slope: 0.0, duration: 0.0 }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Number of whole frames the chirp occupies at `sample_rate`.
    pub fn frame_count(&self, sample_rate: f64) -> usize {
        (self.duration * sample_rate) as usize
    }

    #[inline]
    pub fn sample(&self, time: f64) -> f64 {
        if time < 0.0 || time >= self.duration {
            return 0.0;
        }
        (self.a0 + time * self.a_slope) * (time * (self.w0 + time * self.w_half_slope)).sin()
    }
}

/// A chirp repeated every `period` seconds, starting at `offset`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RepeatingChirp {
    chirp: Chirp,
    offset: f64,
    period: f64,
}

impl RepeatingChirp {
    pub fn new(chirp: Chirp, offset: f64, period: f64) -> Self {
        Self { chirp, offset, period }
    }

    #[inline]
    pub fn time_since_start(&self, time: f64) -> f64 {
        (time - self.offset).rem_euclid(self.period)
    }

    #[inline]
    pub fn sample(&self, time: f64) -> f64 {
        self.chirp.sample(self.time_since_start(time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep() -> Chirp {
        Chirp::new(ToneWave::new(1.0, 1000.0), ToneWave::new(0.5, 20000.0), 0.004)
    }

    #[test]
    fn tone_matches_sine() {
        let tone = ToneWave::new(0.5, 440.0);
        assert_eq!(tone.sample(0.0), 0.0);
        let quarter = 1.0 / (4.0 * 440.0);
        assert!((tone.sample(quarter) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn chirp_is_zero_outside_its_duration() {
        let c = sweep();
        for t in [-1.0, -1e-9, 0.004, 0.0040001, 1.0, 1e6] {
            assert_eq!(c.sample(t), 0.0, "t = {}", t);
        }
        assert!(c.sample(0.001) != 0.0);
    }

    #[test]
    fn chirp_instantaneous_frequency_ramps_linearly() {
        // Phase derivative at t is 2π(f0 + (f1 - f0)·t/d).
        let c = sweep();
        let phase = |t: f64| t * (c.w0 + t * c.w_half_slope);
        let h = 1e-9;
        for (t, expected_hz) in [(0.0, 1000.0), (0.002, 10500.0), (0.0039, 19525.0)] {
            let rate = (phase(t + h) - phase(t)) / h / (2.0 * PI);
            assert!((rate - expected_hz).abs() < 1.0, "t = {} rate = {}", t, rate);
        }
    }

    #[test]
    fn chirp_amplitude_envelope_interpolates() {
        let c = sweep();
        assert!((c.a0 + 0.002 * c.a_slope - 0.75).abs() < 1e-12);
    }

    #[test]
    fn silence_is_silent() {
        let c = Chirp::new(ToneWave::new(0.0, 0.0), ToneWave::new(0.0, 0.0), 0.0);
        assert_eq!(c, Chirp::silence());
        assert_eq!(c.sample(0.0), 0.0);
        assert_eq!(c.frame_count(96000.0), 0);
    }

    #[test]
    fn repeating_chirp_is_periodic() {
        let r = RepeatingChirp::new(sweep(), 0.0125, 0.025);
        let mut t = -0.1;
        while t < 0.2 {
            let a = r.sample(t);
            let b = r.sample(t + 0.025);
            assert!((a - b).abs() < 1e-6, "t = {} {} vs {}", t, a, b);
            t += 0.000_137;
        }
    }

    #[test]
    fn repeating_chirp_starts_at_offset() {
        let c = sweep();
        let r = RepeatingChirp::new(c, 0.01, 0.025);
        assert_eq!(r.sample(0.009), 0.0);
        assert!((r.sample(0.011) - c.sample(0.001)).abs() < 1e-9);
        assert!((r.sample(0.036) - c.sample(0.001)).abs() < 1e-9);
    }
}
