//! src/mods/searcher.rs
//! Per (microphone, speaker) echo search: loopback calibration followed by
//! overlapped-block deconvolution into a delay histogram.

use anyhow::{ ensure, Result };
use std::sync::Arc;

use super::chirp::Chirp;
use super::recorder::CircularRecorder;
use super::spectral::{ deconvolve_in_place, SpectralTransform };
use rustfft::num_complex::Complex;

/// Tunables that do not derive from the stream layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchParams {
    /// Buckets shown to the left of the calibration mark.
    pub negative_space: usize,
    /// Estimated speaker→microphone delay in samples; only scales the
    /// distance compensation.
    pub shift: f64,
    /// Regularisation added to |reference|^2 in every bin.
    pub damping: f64,
    /// Raw samples captured before the calibration peak is picked.
    pub calibration_time: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SearchState {
    Calibrating,
    Running,
}

/// What a single [`EchoSearcher::update`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// The reader had fallen out of the recorder window and was moved forward.
    pub resynced: bool,
    /// Calibration completed during this update.
    pub calibrated: bool,
    pub batches: usize,
}

/// Delay histogram indexed modulo its length.
struct DelayRing {
    values: Vec<f64>,
}

impl DelayRing {
    fn new(len: usize) -> Self {
        Self { values: vec![0.0; len] }
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    fn set(&mut self, index: usize, value: f64) {
        let len = self.values.len();
        self.values[index % len] = value;
    }

    /// Index of the largest magnitude; first wins on ties.
    fn peak(&self) -> usize {
        let mut best = 0usize;
        let mut best_v = -1.0f64;
        for (i, v) in self.values.iter().enumerate() {
            let v = v.abs();
            if v > best_v {
                best = i;
                best_v = v;
            }
        }
        best
    }
}

pub struct EchoSearcher {
    recorder: Arc<CircularRecorder>,
    transformer: SpectralTransform,
    reference: Vec<Complex<f64>>,
    size: usize,
    params: SearchParams,

    next_rec: usize,
    results: DelayRing,
    calibration_p: usize,
    state: SearchState,
}

impl EchoSearcher {
    /// `size` is the FFT block, `results_size` the histogram length (one
    /// pulse period in frames).
    pub fn new(
        size: usize,
        results_size: usize,
        sample_rate: f64,
        recorder: Arc<CircularRecorder>,
        needle: &Chirp,
        params: SearchParams
    ) -> Result<Self> {
        ensure!(size.is_power_of_two() && size >= 4, "FFT block {} must be a power of two", size);
        ensure!(
            (size as f64) >= 2.0 * needle.duration() * sample_rate,
            "FFT block {} is shorter than twice the chirp ({} frames)",
            size,
            needle.frame_count(sample_rate)
        );
        ensure!(
            recorder.capacity() >= size,
            "recorder holds {} samples, fewer than one FFT block ({})",
            recorder.capacity(),
            size
        );
        ensure!(results_size > params.negative_space, "histogram shorter than the guard band");

        // spectrum of the ideal needle
        let mut transformer = SpectralTransform::new(size);
        transformer.load_real((0..size).map(|i| needle.sample((i as f64) / sample_rate)));
        transformer.forward();
        let reference = transformer.freq().to_vec();

        Ok(Self {
            recorder,
            transformer,
            reference,
            size,
            params,
            next_rec: 0,
            results: DelayRing::new(results_size),
            calibration_p: 0,
            state: SearchState::Calibrating,
        })
    }

    /// Anchor the histogram on the strongest raw sample, which is normally the
    /// direct speaker→microphone path.
    pub fn perform_calibration(&mut self) {
        let rs = self.results.len();
        let peak = self.results.peak();
        self.calibration_p = (peak + rs - (self.params.negative_space % rs)) % rs;
        self.state = SearchState::Running;
    }

    /// Deconvolve the block starting at the read cursor and commit its middle half.
    pub fn analyse_next_batch(&mut self) -> Result<()> {
        let sz = self.size;
        let latest = self.recorder.latest();
        ensure!(
            self.next_rec + sz <= latest,
            "not enough data: need {} samples from {}, only {} recorded",
            sz,
            self.next_rec,
            latest
        );
        ensure!(
            self.recorder.is_fresh(self.next_rec),
            "stale batch: sample {} was overwritten ({} recorded, {} held)",
            self.next_rec,
            latest,
            self.recorder.capacity()
        );

        let dist0 = self.params.shift - (self.params.negative_space as f64);
        let scale_factor = (sz as f64).powf(-0.5);

        let rec = &self.recorder;
        let start = self.next_rec;
        self.transformer.load_real((0..sz).map(|i| rec.get(start + i)));
        self.transformer.forward();
        deconvolve_in_place(self.transformer.freq_mut(), &self.reference, self.params.damping);
        self.transformer.inverse();

        // only the middle half survives the circular wrap of the block
        let rs = self.results.len();
        let p0 = (self.next_rec + sz / 4 + rs - (self.calibration_p % rs)) % rs;
        let echo = self.transformer.time();
        for i in sz / 4..(3 * sz) / 4 {
            let p = (p0 + i) % rs;
            // sound pressure falls off as 1/d
            let dist = (p as f64) + dist0;
            self.results.set(p, echo[i].re * dist * scale_factor);
        }
        self.next_rec += sz / 2;
        Ok(())
    }

    pub fn update(&mut self) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        let latest = self.recorder.latest();

        if self.next_rec < latest && !self.recorder.is_fresh(self.next_rec) {
            // fell out of the recorder window; skip to current
            self.next_rec = latest - self.size;
            report.resynced = true;
        }

        if self.state == SearchState::Calibrating {
            // raw loopback capture, no transform
            let end = latest.min(self.params.calibration_time);
            while self.next_rec < end {
                self.results.set(self.next_rec, self.recorder.get(self.next_rec));
                self.next_rec += 1;
            }
            if self.next_rec >= self.params.calibration_time {
                self.perform_calibration();
                report.calibrated = true;
            }
        }

        if self.state == SearchState::Running {
            while self.next_rec + self.size <= latest {
                self.analyse_next_batch()?;
                report.batches += 1;
            }
        }

        Ok(report)
    }

    pub fn is_calibrated(&self) -> bool {
        self.state == SearchState::Running
    }

    pub fn observations(&self) -> &[f64] {
        &self.results.values
    }

    pub fn calibration_anchor(&self) -> usize {
        self.calibration_p
    }

    pub fn next_rec(&self) -> usize {
        self.next_rec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::chirp::{ RepeatingChirp, ToneWave };
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{ Distribution, Normal };

    const SR: f64 = 8000.0;
    const PERIOD: usize = 400;
    const FFT: usize = 64;

    fn needle() -> Chirp {
        // 20 frames at 8 kHz
        Chirp::new(ToneWave::new(1.0, 500.0), ToneWave::new(1.0, 3500.0), 0.0025)
    }

    fn params(calibration_time: usize) -> SearchParams {
        SearchParams { negative_space: 40, shift: 50.0, damping: 1.0, calibration_time }
    }

    fn searcher(rec: &Arc<CircularRecorder>, calibration_time: usize) -> EchoSearcher {
        EchoSearcher::new(FFT, PERIOD, SR, rec.clone(), &needle(), params(calibration_time)).unwrap()
    }

    #[test]
    fn rejects_undersized_block() {
        let rec = Arc::new(CircularRecorder::new(4096));
        let long = Chirp::new(ToneWave::new(1.0, 500.0), ToneWave::new(1.0, 3500.0), 0.005);
        assert!(EchoSearcher::new(64, PERIOD, SR, rec.clone(), &long, params(100)).is_err());
        assert!(EchoSearcher::new(96, PERIOD, SR, rec, &needle(), params(100)).is_err());
    }

    #[test]
    fn calibration_anchors_on_the_peak() {
        let rec = Arc::new(CircularRecorder::new(4096));
        let mut s = searcher(&rec, 100);
        s.results.values.iter_mut().for_each(|v| {
            *v = 0.01;
        });
        s.results.values[123] = -2.0;
        s.perform_calibration();
        assert_eq!(s.calibration_anchor(), 123 - 40);
        assert!(s.is_calibrated());

        // wraps below zero
        let mut s = searcher(&rec, 100);
        s.results.values[7] = 1.0;
        s.perform_calibration();
        assert_eq!(s.calibration_anchor(), 7 + PERIOD - 40);
    }

    #[test]
    fn calibrates_exactly_at_the_window_end() {
        let rec = Arc::new(CircularRecorder::new(4096));
        let mut s = searcher(&rec, 300);
        for i in 0..299 {
            rec.record(if i == 250 { 0.9 } else { 0.0 });
        }
        let report = s.update().unwrap();
        assert!(!report.calibrated);
        assert_eq!(s.state, SearchState::Calibrating);
        assert_eq!(s.observations()[250], 0.9);

        for _ in 0..200 {
            rec.record(0.0);
        }
        let report = s.update().unwrap();
        assert!(report.calibrated);
        assert_eq!(s.calibration_anchor(), 250 - 40);
        // window samples are never analysed as batches past the window
        assert_eq!(s.next_rec(), 300 + report.batches * FFT / 2);

        let again = s.update().unwrap();
        assert!(!again.calibrated);
    }

    #[test]
    fn batch_without_data_is_an_error() {
        let rec = Arc::new(CircularRecorder::new(4096));
        let mut s = searcher(&rec, 0);
        for _ in 0..FFT - 1 {
            rec.record(0.0);
        }
        assert!(s.analyse_next_batch().is_err());
        rec.record(0.0);
        assert!(s.analyse_next_batch().is_ok());
        assert_eq!(s.next_rec(), FFT / 2);
    }

    #[test]
    fn stale_batch_is_an_error() {
        let rec = Arc::new(CircularRecorder::new(256));
        let mut s = searcher(&rec, 100);
        for _ in 0..200 {
            rec.record(0.0);
        }
        s.update().unwrap();
        let behind = s.next_rec();

        for _ in 0..1000 {
            rec.record(0.0);
        }
        assert!(!rec.is_fresh(behind));
        let err = s.analyse_next_batch().unwrap_err();
        assert!(err.to_string().contains("stale"), "{}", err);
        assert_eq!(s.next_rec(), behind);

        // update() resyncs instead of failing
        assert!(s.update().unwrap().resynced);
    }

    #[test]
    fn resync_while_calibrating_calibrates_on_the_held_ring() {
        let rec = Arc::new(CircularRecorder::new(256));
        let mut s = searcher(&rec, 1000);
        for _ in 0..1500 {
            rec.record(0.0);
        }

        let report = s.update().unwrap();
        assert!(report.resynced && report.calibrated);
        assert_eq!(report.batches, 1);
        assert_eq!(s.next_rec(), 1500 - FFT + report.batches * FFT / 2);
        // nothing was copied, so the anchor falls on bucket 0
        assert_eq!(s.calibration_anchor(), PERIOD - 40);
        assert!(s.is_calibrated());
    }

    #[test]
    fn resyncs_after_falling_behind() {
        let rec = Arc::new(CircularRecorder::new(256));
        let mut s = searcher(&rec, 100);
        for _ in 0..200 {
            rec.record(0.0);
        }
        let first = s.update().unwrap();
        assert!(first.calibrated && !first.resynced);

        for _ in 0..1000 {
            rec.record(0.0);
        }
        let report = s.update().unwrap();
        assert!(report.resynced);
        assert_eq!(report.batches, 1);
        assert_eq!(s.next_rec(), 1200 - FFT + FFT / 2);
    }

    #[test]
    fn echo_reads_back_at_its_delay_with_the_default_layout() {
        use crate::mods::display::strongest_echo;

        let sr = 96000.0;
        let (period, fft, loopback, delay) = (2400usize, 1024usize, 60usize, 600usize);
        let needle = Chirp::new(ToneWave::new(1.0, 1000.0), ToneWave::new(1.0, 20000.0), 0.004);
        let pulse = RepeatingChirp::new(needle, 0.0, (period as f64) / sr);
        let rec = Arc::new(CircularRecorder::new(96000));
        let params = SearchParams { negative_space: 40, shift: 50.0, damping: 100.0, calibration_time: 48000 };
        let mut s = EchoSearcher::new(fft, period, sr, rec.clone(), &needle, params).unwrap();

        for g in 0..48000 + 6 * period {
            let t = (g as f64) / sr;
            let direct = pulse.sample(t - (loopback as f64) / sr);
            let echo = 0.5 * pulse.sample(t - ((loopback + delay) as f64) / sr);
            rec.record(direct + echo);
        }
        let report = s.update().unwrap();
        assert!(report.calibrated && !report.resynced);

        let r = strongest_echo(s.observations(), 10.0, 40, sr).unwrap();
        assert!((599..=601).contains(&r.frames), "{:?}", r);
        assert!((r.metres - 1.0625).abs() < 0.01);
    }

    #[test]
    fn locates_an_echo_in_the_histogram() {
        let delay = 100usize;
        let pulse = RepeatingChirp::new(needle(), 0.0, (PERIOD as f64) / SR);
        let rec = Arc::new(CircularRecorder::new(4096));
        let mut rng = StdRng::seed_from_u64(0x9e3779b97f4a7c15);
        let noise = Normal::new(0.0, 0.001).unwrap();
        for g in 0..PERIOD * 5 {
            let t = (g as f64) / SR;
            let direct = pulse.sample(t);
            let echo = 0.6 * pulse.sample(t - (delay as f64) / SR);
            rec.record(direct + echo + noise.sample(&mut rng));
        }

        let mut s = searcher(&rec, 2 * PERIOD);
        let report = s.update().unwrap();
        assert!(report.calibrated);
        assert!(report.batches * (FFT / 2) >= PERIOD);

        let cal = s.calibration_anchor();
        let direct_at = (FFT / 4 + PERIOD - cal) % PERIOD;
        let echo_at = (direct_at + delay) % PERIOD;

        let obs = s.observations();
        let peak = obs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap();
        assert!(
            (peak as isize - echo_at as isize).abs() <= 1,
            "peak {} expected {} (direct {})",
            peak,
            echo_at,
            direct_at
        );

        let near_direct = (direct_at.saturating_sub(2)..=direct_at + 2)
            .map(|i| obs[i % PERIOD].abs())
            .fold(0.0, f64::max);
        let quiet = obs[(direct_at + delay / 2) % PERIOD].abs();
        assert!(near_direct > 5.0 * quiet);
    }
}
