//! src/mods/simulated.rs
//! Synthetic room standing in for the sound card: whatever the engine plays
//! comes back on every microphone after a loopback delay, plus one echo and
//! seeded Gaussian noise.

use anyhow::{ anyhow, Result };
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{ Distribution, Normal };
use std::collections::VecDeque;
use std::sync::{ Arc, Mutex };
use std::thread;
use std::time::Duration;

use super::audio::{ AudioBackend, ChannelCounts };
use super::engine::FrameProcessor;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoomSettings {
    pub inputs: usize,
    pub outputs: usize,
    /// Frames between speaker and microphone on the direct path.
    pub loopback_delay: usize,
    /// Extra frames the echo travels beyond the direct path.
    pub echo_delay: usize,
    pub echo_gain: f64,
    /// Standard deviation of the noise floor.
    pub noise: f64,
    pub seed: u64,
}

struct RoomState {
    processor: FrameProcessor,
    history: VecDeque<f64>,
    noise: RoomNoise,
    out_block: Vec<f32>,
    in_block: Vec<f32>,
}

type Shared = Arc<Mutex<Option<RoomState>>>;

pub struct SimulatedRoom {
    settings: RoomSettings,
    shared: Shared,
}

/// Drives an open simulated stream from the test or a pump thread.
#[derive(Clone)]
pub struct RoomHandle {
    settings: RoomSettings,
    shared: Shared,
}

/// Closes the room when dropped; later pumps become no-ops.
pub struct SimulatedStream {
    shared: Shared,
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            *state = None;
        }
    }
}

impl SimulatedRoom {
    pub fn new(settings: RoomSettings) -> Self {
        Self { settings, shared: Arc::new(Mutex::new(None)) }
    }

    pub fn handle(&self) -> RoomHandle {
        RoomHandle { settings: self.settings, shared: self.shared.clone() }
    }
}

impl AudioBackend for SimulatedRoom {
    type Stream = SimulatedStream;

    fn channels(&mut self, _sample_rate: u32) -> Result<ChannelCounts> {
        Ok(ChannelCounts { inputs: self.settings.inputs, outputs: self.settings.outputs })
    }

    fn open(&mut self, _sample_rate: u32, processor: FrameProcessor) -> Result<SimulatedStream> {
        let s = &self.settings;
        let depth = s.loopback_delay + s.echo_delay + 1;
        let state = RoomState {
            processor,
            history: std::iter::repeat(0.0).take(depth).collect(),
            noise: RoomNoise::new(s.noise, s.seed)?,
            out_block: Vec::new(),
            in_block: Vec::new(),
        };
        *self.shared.lock().map_err(|_| anyhow!("room state poisoned"))? = Some(state);
        Ok(SimulatedStream { shared: self.shared.clone() })
    }
}

/// Reproducible noise floor for one room.
struct RoomNoise {
    rng: StdRng,
    dist: Normal<f64>,
}

impl RoomNoise {
    fn new(std_dev: f64, seed: u64) -> Result<Self> {
        let dist = Normal::new(0.0, std_dev).map_err(|e| anyhow!("noise level {}: {}", std_dev, e))?;
        Ok(Self { rng: StdRng::seed_from_u64(seed), dist })
    }

    #[inline]
    fn sample(&mut self) -> f64 {
        self.dist.sample(&mut self.rng)
    }
}

impl RoomHandle {
    /// Run `frames` frames through the engine. Returns false once the stream
    /// has been closed.
    pub fn pump(&self, frames: usize) -> bool {
        let mut guard = match self.shared.lock() {
            Ok(g) => g,
            Err(_) => {
                return false;
            }
        };
        let state = match guard.as_mut() {
            Some(state) => state,
            None => {
                return false;
            }
        };

        let s = &self.settings;
        let outs = s.outputs.max(1);
        state.out_block.clear();
        state.out_block.resize(frames * outs, 0.0);
        state.in_block.clear();
        state.in_block.resize(frames * s.inputs, 0.0);
        state.processor.player_mut().fill(&mut state.out_block);

        let depth = state.history.len();
        for f in 0..frames {
            let mix: f64 = state.out_block[f * outs..(f + 1) * outs]
                .iter()
                .map(|&v| v as f64)
                .sum();
            state.history.pop_front();
            state.history.push_back(mix);

            let direct = state.history[depth - 1 - s.loopback_delay];
            let echo = state.history[depth - 1 - s.loopback_delay - s.echo_delay];
            let heard = direct + s.echo_gain * echo + state.noise.sample();
            for c in 0..s.inputs {
                state.in_block[f * s.inputs + c] = heard as f32;
            }
        }
        state.processor.capture_mut().capture(&state.in_block);
        true
    }

    /// Pump blocks at wall-clock pace until the stream closes.
    pub fn spawn_realtime(self, sample_rate: u32, block_frames: usize) -> thread::JoinHandle<()> {
        let block = Duration::from_secs_f64((block_frames as f64) / (sample_rate as f64));
        thread::spawn(move || {
            while self.pump(block_frames) {
                thread::sleep(block);
            }
        })
    }
}
