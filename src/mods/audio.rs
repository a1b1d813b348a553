//! src/mods/audio.rs
//! Hardware audio boundary: the backend seam and the cpal implementation.

use anyhow::{ Context, Result };
use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use cpal::{ FromSample, SizedSample };
use std::sync::Arc;

use super::engine::{ ChirpPlayer, FrameProcessor, MicCapture };
use crate::logger::Logger;
use crate::{ log_error, log_info };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelCounts {
    pub inputs: usize,
    pub outputs: usize,
}

/// Where frames come from and go to.
///
/// `open` receives the [`FrameProcessor`] by value: it is the only context the
/// periodic callback needs, so no global lookup of the engine is involved.
/// Dropping the returned stream must stop the callbacks.
pub trait AudioBackend {
    type Stream;

    /// Query device channel counts and check the rate can be served.
    fn channels(&mut self, sample_rate: u32) -> Result<ChannelCounts>;

    fn open(&mut self, sample_rate: u32, processor: FrameProcessor) -> Result<Self::Stream>;
}

pub struct CpalBackend {
    input: cpal::Device,
    output: cpal::Device,
    logger: Arc<Logger>,
}

/// Running input+output pair. Output is paused first on drop.
pub struct CpalStream {
    output: cpal::Stream,
    input: cpal::Stream,
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.output.pause();
        let _ = self.input.pause();
    }
}

impl CpalBackend {
    pub fn new(logger: Arc<Logger>) -> Result<Self> {
        let host = cpal::default_host();
        let input = host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No default input device"))?;
        let output = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No default output device"))?;
        Ok(Self { input, output, logger })
    }

    fn stream_config(channels: usize, sample_rate: u32) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: channels as cpal::ChannelCount,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

fn input_rate_supported(device: &cpal::Device, want: u32) -> bool {
    match device.supported_input_configs() {
        Ok(configs) =>
            configs.into_iter().any(|c| {
                (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&want)
            }),
        Err(_) => false,
    }
}

fn output_rate_supported(device: &cpal::Device, want: u32) -> bool {
    match device.supported_output_configs() {
        Ok(configs) =>
            configs.into_iter().any(|c| {
                (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&want)
            }),
        Err(_) => false,
    }
}

impl AudioBackend for CpalBackend {
    type Stream = CpalStream;

    fn channels(&mut self, sample_rate: u32) -> Result<ChannelCounts> {
        let in_cfg = self.input.default_input_config().context("default input config")?;
        let out_cfg = self.output.default_output_config().context("default output config")?;

        let _ = log_info!(
            self.logger,
            "Input: {} (x{}, {:?})",
            self.input.name().unwrap_or_else(|_| "<unnamed>".into()),
            in_cfg.channels(),
            in_cfg.sample_format()
        );
        let _ = log_info!(
            self.logger,
            "Output: {} (x{}, {:?})",
            self.output.name().unwrap_or_else(|_| "<unnamed>".into()),
            out_cfg.channels(),
            out_cfg.sample_format()
        );

        if !input_rate_supported(&self.input, sample_rate) {
            anyhow::bail!("input device does not support {} Hz", sample_rate);
        }
        if !output_rate_supported(&self.output, sample_rate) {
            anyhow::bail!("output device does not support {} Hz", sample_rate);
        }

        Ok(ChannelCounts {
            inputs: in_cfg.channels() as usize,
            outputs: out_cfg.channels() as usize,
        })
    }

    fn open(&mut self, sample_rate: u32, processor: FrameProcessor) -> Result<CpalStream> {
        let (player, capture) = processor.split();
        let in_format = self.input.default_input_config()?.sample_format();
        let out_format = self.output.default_output_config()?.sample_format();
        let in_cfg = Self::stream_config(capture.stride(), sample_rate);
        let out_cfg = Self::stream_config(player.channels(), sample_rate);

        let input = match in_format {
            cpal::SampleFormat::F32 =>
                build_input::<f32>(&self.input, &in_cfg, capture, self.logger.clone())?,
            cpal::SampleFormat::I16 =>
                build_input::<i16>(&self.input, &in_cfg, capture, self.logger.clone())?,
            cpal::SampleFormat::U16 =>
                build_input::<u16>(&self.input, &in_cfg, capture, self.logger.clone())?,
            other => anyhow::bail!("Unsupported input sample format {:?}", other),
        };
        let output = match out_format {
            cpal::SampleFormat::F32 =>
                build_output::<f32>(&self.output, &out_cfg, player, self.logger.clone())?,
            cpal::SampleFormat::I16 =>
                build_output::<i16>(&self.output, &out_cfg, player, self.logger.clone())?,
            cpal::SampleFormat::U16 =>
                build_output::<u16>(&self.output, &out_cfg, player, self.logger.clone())?,
            other => anyhow::bail!("Unsupported output sample format {:?}", other),
        };

        input.play().context("starting input stream")?;
        output.play().context("starting output stream")?;
        Ok(CpalStream { output, input })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut capture: MicCapture,
    logger: Arc<Logger>
) -> Result<cpal::Stream>
    where T: SizedSample, f32: FromSample<T>
{
    let err_fn = move |e: cpal::StreamError| {
        let _ = log_error!(logger, "input stream error: {}", e);
    };
    device
        .build_input_stream(config, move |data: &[T], _| capture.capture(data), err_fn, None)
        .context("building input stream")
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut player: ChirpPlayer,
    logger: Arc<Logger>
) -> Result<cpal::Stream>
    where T: SizedSample + FromSample<f32>
{
    let err_fn = move |e: cpal::StreamError| {
        let _ = log_error!(logger, "output stream error: {}", e);
    };
    device
        .build_output_stream(config, move |data: &mut [T], _| player.fill(data), err_fn, None)
        .context("building output stream")
}
