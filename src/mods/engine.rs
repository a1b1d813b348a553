//! src/mods/engine.rs
//! Owns recorders, pulse generators and searchers. The producer half
//! ([`FrameProcessor`]) is handed to the audio backend; the consumer half
//! ([`Echolocator`]) is polled by the presentation loop.

use anyhow::{ Context, Result };
use cpal::FromSample;
use std::sync::Arc;

use super::audio::{ AudioBackend, ChannelCounts };
use super::chirp::{ Chirp, RepeatingChirp, ToneWave };
use super::recorder::CircularRecorder;
use super::searcher::{ EchoSearcher, SearchParams };
use crate::logger::Logger;
use crate::{ log_debug, log_info, log_warn, Config };

pub const SPEED_OF_SOUND: f64 = 340.0; // metres/second

/// Block and step sizes derived from the pulse configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamLayout {
    pub chirp_frames: usize,
    /// Smallest power of two (at least 16) covering twice the chirp.
    pub fft_size: usize,
    pub frames_per_step_raw: f64,
    pub frames_per_step: usize,
    /// The step is not a whole number of frames; pulses will drift.
    pub drifts: bool,
}

impl StreamLayout {
    pub fn derive(step_s: f64, chirp_s: f64, sample_rate: f64) -> Self {
        let mut fft_size = 16usize;
        while (fft_size as f64) < 2.0 * chirp_s * sample_rate {
            fft_size <<= 1;
        }

        let frames_per_step_raw = sample_rate * step_s;
        let frames_per_step = (frames_per_step_raw + 0.5) as usize;
        let drifts = ((frames_per_step_raw + 0.5).rem_euclid(1.0) - 0.5).abs() > 0.001;

        Self {
            chirp_frames: (chirp_s * sample_rate) as usize,
            fft_size,
            frames_per_step_raw,
            frames_per_step,
            drifts,
        }
    }
}

/// Output half of the callback: writes every channel's pulse train.
pub struct ChirpPlayer {
    outputs: Vec<RepeatingChirp>,
    seconds_per_frame: f64,
    frame: u64,
}

impl ChirpPlayer {
    pub fn channels(&self) -> usize {
        self.outputs.len()
    }

    /// Fill an interleaved output block. Never allocates.
    pub fn fill<T>(&mut self, output: &mut [T]) where T: FromSample<f32> {
        let n = self.outputs.len();
        if n == 0 {
            return;
        }
        for frame in output.chunks_mut(n) {
            let t = (self.frame as f64) * self.seconds_per_frame;
            for (slot, pulse) in frame.iter_mut().zip(&self.outputs) {
                *slot = T::from_sample_(pulse.sample(t) as f32);
            }
            self.frame += 1;
        }
    }
}

/// Input half of the callback: feeds the first channels of each frame into
/// their recorders.
pub struct MicCapture {
    inputs: Vec<Arc<CircularRecorder>>,
    stride: usize,
}

impl MicCapture {
    /// Channels per interleaved input frame as delivered by the device.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn capture<T: Copy>(&mut self, input: &[T]) where f32: FromSample<T> {
        for frame in input.chunks_exact(self.stride.max(1)) {
            for (rec, &s) in self.inputs.iter().zip(frame) {
                rec.record(f32::from_sample_(s) as f64);
            }
        }
    }
}

/// Everything the audio callback touches, and nothing else.
pub struct FrameProcessor {
    player: ChirpPlayer,
    capture: MicCapture,
}

impl FrameProcessor {
    pub fn player_mut(&mut self) -> &mut ChirpPlayer {
        &mut self.player
    }

    pub fn capture_mut(&mut self) -> &mut MicCapture {
        &mut self.capture
    }

    /// For backends that drive output and input from separate callbacks.
    pub fn split(self) -> (ChirpPlayer, MicCapture) {
        (self.player, self.capture)
    }
}

/// Consumer side of the engine.
///
/// Field order matters: the stream is dropped before the searchers and the
/// recorders they read.
pub struct Echolocator<B: AudioBackend> {
    stream: Option<B::Stream>,
    searchers: Vec<EchoSearcher>,
    backend: B,
    config: Config,
    layout: StreamLayout,
    base_chirp: Chirp,
    logger: Arc<Logger>,
    resyncs: usize,
}

impl<B: AudioBackend> Echolocator<B> {
    pub fn new(config: &Config, backend: B, logger: Arc<Logger>) -> Result<Self> {
        config.validate()?;
        let sr = config.sample_rate as f64;
        let layout = StreamLayout::derive(config.step_s, config.chirp_s, sr);

        let _ = log_info!(
            logger,
            "Step: {} seconds ({} pulses per second)",
            config.step_s,
            1.0 / config.step_s
        );
        let _ = log_info!(
            logger,
            "Max detectable distance: ~{} metres (assuming 1 speaker)",
            config.step_s * SPEED_OF_SOUND * 0.5
        );
        let _ = log_info!(logger, "Chirp samples: {}", layout.chirp_frames);
        let _ = log_info!(logger, "FFT kernel size: {}", layout.fft_size);
        let _ = log_info!(logger, "Frames per step: {}", layout.frames_per_step_raw);
        if layout.drifts {
            let _ = log_warn!(logger, "framesPerStep is not an integer; output will drift");
        }

        let base_chirp = Chirp::new(
            ToneWave::new(config.start_amp, config.start_hz),
            ToneWave::new(config.end_amp, config.end_hz),
            config.chirp_s
        );

        Ok(Self {
            stream: None,
            searchers: Vec::new(),
            backend,
            config: config.clone(),
            layout,
            base_chirp,
            logger,
            resyncs: 0,
        })
    }

    /// Build recorders, pulse trains and searchers for the device channels,
    /// then open the stream. Restarting tears the previous stream down first.
    pub fn start(&mut self) -> Result<()> {
        self.stream = None;
        self.searchers.clear();

        let sr = self.config.sample_rate;
        let devices = self.backend.channels(sr).context("querying audio channels")?;
        anyhow::ensure!(devices.inputs > 0, "input device has no channels");
        anyhow::ensure!(devices.outputs > 0, "output device has no channels");
        let used = ChannelCounts {
            inputs: devices.inputs.min(self.config.max_inputs),
            outputs: devices.outputs,
        };
        let _ = log_debug!(
            self.logger,
            "Recording {} of {} input channels, driving {} outputs",
            used.inputs,
            devices.inputs,
            used.outputs
        );

        // one second of history per microphone
        let inputs: Vec<Arc<CircularRecorder>> = (0..used.inputs)
            .map(|_| Arc::new(CircularRecorder::new(sr as usize)))
            .collect();

        let step = self.config.step_s;
        let single = self.config.single_speaker;
        let outputs: Vec<RepeatingChirp> = (0..used.outputs)
            .map(|i| {
                let chirp = if single && i != 0 { Chirp::silence() } else { self.base_chirp };
                RepeatingChirp::new(chirp, ((i as f64) * step) / (used.outputs as f64), step)
            })
            .collect();

        let params = SearchParams {
            negative_space: self.config.negative_space,
            shift: self.config.shift,
            damping: self.config.damping,
            calibration_time: self.config.calibration_time(),
        };
        for o in 0..outputs.len() {
            if single && o != 0 {
                continue;
            }
            for rec in &inputs {
                self.searchers.push(
                    EchoSearcher::new(
                        self.layout.fft_size,
                        self.layout.frames_per_step,
                        sr as f64,
                        rec.clone(),
                        &self.base_chirp,
                        params
                    )?
                );
            }
        }

        let processor = FrameProcessor {
            player: ChirpPlayer {
                outputs,
                seconds_per_frame: 1.0 / (sr as f64),
                frame: 0,
            },
            capture: MicCapture {
                inputs,
                stride: devices.inputs,
            },
        };
        self.stream = Some(self.backend.open(sr, processor).context("opening audio stream")?);
        let _ = log_info!(self.logger, "Started {} searches", self.searchers.len());
        Ok(())
    }

    /// Pull whatever the recorders gained since the last call into every search.
    pub fn analyse(&mut self) -> Result<()> {
        for (i, searcher) in self.searchers.iter_mut().enumerate() {
            let report = searcher.update()?;
            if report.resynced {
                self.resyncs += 1;
                let _ = log_warn!(
                    self.logger,
                    "search {} fell behind the recorder; resumed at sample {}",
                    i,
                    searcher.next_rec()
                );
            }
            if report.calibrated {
                let _ = log_info!(
                    self.logger,
                    "search {} calibrated at bucket {}",
                    i,
                    searcher.calibration_anchor()
                );
            }
        }
        Ok(())
    }

    /// True only once every search has calibrated.
    pub fn is_calibrated(&self) -> bool {
        self.searchers.iter().all(|s| s.is_calibrated())
    }

    pub fn searches_count(&self) -> usize {
        self.searchers.len()
    }

    pub fn observations(&self, search: usize) -> &[f64] {
        self.searchers[search].observations()
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    pub fn resync_count(&self) -> usize {
        self.resyncs
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl<B: AudioBackend> Drop for Echolocator<B> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            let _ = self.logger.info("Audio shutdown complete.");
        }
    }
}
