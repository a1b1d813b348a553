//! src/mods/display.rs
//! Terminal rendering of the delay histograms.

use super::engine::SPEED_OF_SOUND;

const SHADES: &[u8] = b" .:-=+*#%@";

/// Map `v` in `[low, high]` onto 0..=255, saturating at both ends. An empty
/// range maps everything to 0.
pub fn to_saturated_level(v: f64, low: f64, high: f64) -> u8 {
    // flat input: nothing stands out
    if high - low <= 1e-12 * low.abs().max(1.0) {
        return 0;
    }
    let scaled = ((v - low) * 256.0) / (high - low);
    scaled.clamp(0.0, 255.0) as u8
}

/// One text row per histogram, spread over `width` columns. Each column
/// shows the loudest of the buckets it covers, so nothing is skipped when
/// the row is narrower than the histogram. Brightness is normalised against
/// `[mean, mean + 3·sd]` of the column magnitudes so volume and damping do
/// not matter.
pub fn render_band(obs: &[f64], width: usize) -> String {
    if obs.is_empty() || width == 0 {
        return String::new();
    }
    let width = width.min(obs.len());
    let column = |x: usize| {
        let from = (x * obs.len()) / width;
        let to = ((x + 1) * obs.len()) / width;
        obs[from..to].iter().fold(0.0f64, |m, v| m.max(v.abs()))
    };
    let levels: Vec<f64> = (0..width).map(column).collect();

    let (mut sum, mut sum2) = (0.0f64, 0.0f64);
    for &v in &levels {
        sum += v;
        sum2 += v * v;
    }
    let avg = sum / (width as f64);
    let variance = (sum2 / (width as f64) - avg * avg).max(0.0);
    let sd = variance.sqrt();

    levels
        .iter()
        .map(|&v| {
            let level = to_saturated_level(v, avg, avg + sd * 3.0) as usize;
            SHADES[(level * SHADES.len()) / 256] as char
        })
        .collect()
}

/// Echo read off a histogram, measured from the direct-path peak.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EchoReading {
    pub direct: usize,
    pub echo: usize,
    /// Frames from the direct path to the echo, around the ring.
    pub frames: usize,
    pub metres: f64,
}

/// Read the echo off a histogram whose buckets were scaled by
/// `bucket + dist0`. The direct path is the loudest bucket once that scaling
/// is undone; the echo is the strongest scaled bucket at least `min_gap`
/// after it and `min_gap` short of wrapping back onto it. The histogram is
/// circular, so the direct path may sit anywhere in it.
pub fn strongest_echo(
    obs: &[f64],
    dist0: f64,
    min_gap: usize,
    sample_rate: f64
) -> Option<EchoReading> {
    let len = obs.len();
    let gap = min_gap.max(1);
    if len <= 2 * gap {
        return None;
    }
    let unscaled = |p: usize| obs[p].abs() / ((p as f64) + dist0).abs().max(1.0);
    let direct = (0..len).max_by(|&a, &b| unscaled(a).total_cmp(&unscaled(b)))?;

    let frames = (gap..=len - gap).max_by(|&a, &b| {
        obs[(direct + a) % len].abs().total_cmp(&obs[(direct + b) % len].abs())
    })?;
    let metres = ((frames as f64) / sample_rate) * SPEED_OF_SOUND * 0.5;
    Some(EchoReading { direct, echo: (direct + frames) % len, frames, metres })
}
