//! src/main.rs

use anyhow::Result;
use crossbeam_channel::{ after, bounded, never, select, tick };
use std::{ env, sync::Arc, time::Duration };

mod logger;
use logger::{ LogLevel, Logger };

mod mods;
use mods::audio::{ AudioBackend, CpalBackend };
use mods::display;
use mods::engine::{ Echolocator, StreamLayout };
use mods::simulated::{ RoomSettings, SimulatedRoom };

// ───────────────────────────────────────────────────────────────────────────────
// CLI config + parsing
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    // pulse
    pub sample_rate: u32,
    pub step_s: f64,
    pub chirp_s: f64,
    pub start_hz: f64,
    pub end_hz: f64,
    pub start_amp: f64,
    pub end_amp: f64,

    // search
    pub damping: f64,
    pub calibration_samples: Option<usize>,
    pub negative_space: usize,
    pub shift: f64,
    pub single_speaker: bool,
    pub max_inputs: usize,

    // presentation
    pub tick_ms: u64,
    pub run_secs: u64,
    /// Columns per histogram row; `None` gives one per bucket.
    pub width: Option<usize>,

    // paths
    pub log_path: String,
    pub log_level: LogLevel,

    // synthetic room
    pub simulate: bool,
    pub sim_delay: usize,
    pub sim_echo_delay: usize,
    pub sim_echo_gain: f64,
    pub sim_noise: f64,
}

impl Default for Config {
    fn default() -> Self {
        let default_log = env
            ::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join("build")
            .join("Echolocator.log")
            .to_string_lossy()
            .into_owned();

        Self {
            sample_rate: 96000,
            step_s: 0.025,
            chirp_s: 0.004,
            start_hz: 1000.0,
            end_hz: 20000.0,
            start_amp: 1.0,
            end_amp: 1.0,

            damping: 100.0,
            calibration_samples: None,
            negative_space: 40,
            // speaker→mic frames; chosen for clarity, in reality probably closer to 10
            shift: 50.0,
            single_speaker: true,
            // laptops report two identical microphones; record only the first
            max_inputs: 1,

            tick_ms: 100,
            run_secs: 0,
            width: None,

            log_path: default_log,
            log_level: LogLevel::Info,

            simulate: false,
            sim_delay: 12,
            sim_echo_delay: 280,
            sim_echo_gain: 0.4,
            sim_noise: 0.01,
        }
    }
}

impl Config {
    /// Raw samples captured before calibration (two seconds unless overridden).
    pub fn calibration_time(&self) -> usize {
        self.calibration_samples.unwrap_or(2 * (self.sample_rate as usize))
    }

    pub fn validate(&self) -> Result<()> {
        use anyhow::ensure;
        ensure!(self.sample_rate > 0, "sample rate must be positive");
        ensure!(self.step_s > 0.0, "step must be positive");
        ensure!(self.chirp_s > 0.0, "chirp duration must be positive");
        ensure!(self.chirp_s < self.step_s, "chirp must be shorter than the step");
        let nyquist = (self.sample_rate as f64) / 2.0;
        for hz in [self.start_hz, self.end_hz] {
            ensure!(hz >= 0.0 && hz < nyquist, "{} Hz is outside [0, {} Hz)", hz, nyquist);
        }
        ensure!(self.damping > 0.0, "damping must be positive");
        ensure!(self.max_inputs >= 1, "at least one input channel is needed");
        ensure!(self.tick_ms > 0, "tick must be positive");

        let layout = StreamLayout::derive(self.step_s, self.chirp_s, self.sample_rate as f64);
        ensure!(
            layout.frames_per_step > self.negative_space,
            "step of {} frames leaves no room after a guard band of {}",
            layout.frames_per_step,
            self.negative_space
        );
        ensure!(
            (self.sample_rate as usize) >= layout.fft_size,
            "one second of audio is shorter than the FFT block ({})",
            layout.fft_size
        );
        Ok(())
    }
}

fn print_usage(cfg: &Config) {
    println!("Usage: chirp-echolocator [OPTIONS]\n");
    println!("General:");
    println!("  --log-path <PATH>             Log file (default: {})", cfg.log_path);
    println!(
        "  --log-level <LEVEL>           Log level: debug, info, warning, error (default: info)"
    );
    println!(
        "  --run-secs <SEC>              Stop after this long, 0 = until Ctrl-C (default: {})",
        cfg.run_secs
    );

    println!("\nPulse options:");
    println!("  --sample-rate, --sr <HZ>      Stream sample rate (default: {})", cfg.sample_rate);
    println!("  --step-s <SEC>                Pulse repetition interval (default: {})", cfg.step_s);
    println!("  --chirp-s <SEC>               Chirp duration (default: {})", cfg.chirp_s);
    println!("  --start-hz <HZ>               Chirp start frequency (default: {:.0})", cfg.start_hz);
    println!("  --end-hz <HZ>                 Chirp end frequency (default: {:.0})", cfg.end_hz);
    println!("  --start-amp <VAL>             Chirp start amplitude (default: {:.2})", cfg.start_amp);
    println!("  --end-amp <VAL>               Chirp end amplitude (default: {:.2})", cfg.end_amp);

    println!("\nSearch options:");
    println!("  --damping <VAL>               Deconvolution damping (default: {:.1})", cfg.damping);
    println!(
        "  --calibration-samples <N>     Raw samples before calibrating (default: 2 x sample rate)"
    );
    println!(
        "  --negative-space <N>          Buckets left of the calibration mark (default: {})",
        cfg.negative_space
    );
    println!(
        "  --shift <FRAMES>              Estimated speaker->mic delay (default: {:.0})",
        cfg.shift
    );
    println!("  --all-speakers                Chirp on every output channel, not just the first");
    println!("  --max-inputs <N>              Microphone channels to use (default: {})", cfg.max_inputs);

    println!("\nDisplay options:");
    println!("  -tm, --tick-ms <MS>           Refresh interval (default: {})", cfg.tick_ms);
    println!("  --width <COLS>                Histogram columns (default: one per bucket)");

    println!("\nSimulation:");
    println!("  --simulate                    Use a synthetic room instead of the sound card");
    println!("  --sim-delay <FRAMES>          Direct path delay (default: {})", cfg.sim_delay);
    println!(
        "  --sim-echo-delay <FRAMES>     Echo delay beyond the direct path (default: {})",
        cfg.sim_echo_delay
    );
    println!("  --sim-echo-gain <VAL>         Echo gain (default: {:.2})", cfg.sim_echo_gain);
    println!("  --sim-noise <VAL>             Noise amplitude (default: {:.3})", cfg.sim_noise);

    println!("\nExamples:");
    println!("  chirp-echolocator --sr 48000 --step-s 0.05");
    println!("  chirp-echolocator --simulate --sim-echo-delay 500 --run-secs 10");
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, name: &str) -> Result<T, String> {
    let raw = args.get(i + 1).ok_or_else(|| format!("Missing value for {}", name))?;
    raw.parse().map_err(|_| format!("Invalid {} value: {}", name, raw))
}

fn parse_arguments_from(args: &[String]) -> std::result::Result<Config, String> {
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--log-path" => {
                config.log_path = parse_value(args, i, "--log-path")?;
                i += 2;
            }
            "--log-level" => {
                let raw: String = parse_value(args, i, "--log-level")?;
                config.log_level = raw.parse()?;
                i += 2;
            }
            "--run-secs" => {
                config.run_secs = parse_value(args, i, "--run-secs")?;
                i += 2;
            }
            "--sample-rate" | "--sr" => {
                config.sample_rate = parse_value(args, i, "--sample-rate")?;
                i += 2;
            }
            "--step-s" => {
                config.step_s = parse_value(args, i, "--step-s")?;
                i += 2;
            }
            "--chirp-s" => {
                config.chirp_s = parse_value(args, i, "--chirp-s")?;
                i += 2;
            }
            "--start-hz" => {
                config.start_hz = parse_value(args, i, "--start-hz")?;
                i += 2;
            }
            "--end-hz" => {
                config.end_hz = parse_value(args, i, "--end-hz")?;
                i += 2;
            }
            "--start-amp" => {
                config.start_amp = parse_value::<f64>(args, i, "--start-amp")?.clamp(0.0, 1.0);
                i += 2;
            }
            "--end-amp" => {
                config.end_amp = parse_value::<f64>(args, i, "--end-amp")?.clamp(0.0, 1.0);
                i += 2;
            }
            "--damping" => {
                config.damping = parse_value(args, i, "--damping")?;
                i += 2;
            }
            "--calibration-samples" => {
                config.calibration_samples = Some(parse_value(args, i, "--calibration-samples")?);
                i += 2;
            }
            "--negative-space" => {
                config.negative_space = parse_value(args, i, "--negative-space")?;
                i += 2;
            }
            "--shift" => {
                config.shift = parse_value(args, i, "--shift")?;
                i += 2;
            }
            "--all-speakers" => {
                config.single_speaker = false;
                i += 1;
            }
            "--max-inputs" => {
                config.max_inputs = parse_value::<usize>(args, i, "--max-inputs")?.max(1);
                i += 2;
            }
            "-tm" | "--tick-ms" => {
                config.tick_ms = parse_value::<u64>(args, i, "--tick-ms")?.max(1);
                i += 2;
            }
            "--width" => {
                config.width = Some(parse_value::<usize>(args, i, "--width")?.max(1));
                i += 2;
            }
            "--simulate" => {
                config.simulate = true;
                i += 1;
            }
            "--sim-delay" => {
                config.sim_delay = parse_value(args, i, "--sim-delay")?;
                i += 2;
            }
            "--sim-echo-delay" => {
                config.sim_echo_delay = parse_value(args, i, "--sim-echo-delay")?;
                i += 2;
            }
            "--sim-echo-gain" => {
                config.sim_echo_gain = parse_value(args, i, "--sim-echo-gain")?;
                i += 2;
            }
            "--sim-noise" => {
                config.sim_noise = parse_value(args, i, "--sim-noise")?;
                i += 2;
            }
            "-h" | "--help" => {
                print_usage(&Config::default());
                std::process::exit(0);
            }
            _ => {
                return Err(format!("Unknown option: {}", args[i]));
            }
        }
    }

    Ok(config)
}

fn parse_arguments() -> std::result::Result<Config, String> {
    let args: Vec<String> = env::args().collect();
    parse_arguments_from(&args)
}

// ───────────────────────────────────────────────────────────────────────────────
// presentation loop
// ───────────────────────────────────────────────────────────────────────────────
fn run_display<B: AudioBackend>(
    engine: &mut Echolocator<B>,
    cfg: &Config,
    logger: &Arc<Logger>
) -> Result<()> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    let ticker = tick(Duration::from_millis(cfg.tick_ms));
    let deadline = if cfg.run_secs > 0 {
        after(Duration::from_secs(cfg.run_secs))
    } else {
        never()
    };

    anyhow::ensure!(engine.is_running(), "audio stream is not open");
    let _ = log_debug!(
        logger,
        "Rendering {} buckets per search",
        engine.layout().frames_per_step
    );
    let sr = cfg.sample_rate as f64;
    let dist0 = cfg.shift - (cfg.negative_space as f64);
    let mut shown = false;

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(deadline) -> _ => break,
            recv(ticker) -> _ => {
                engine.analyse()?;
                if !engine.is_calibrated() {
                    continue;
                }
                if !shown {
                    shown = true;
                    print!("\x1b[2J");
                    let _ = log_info!(logger, "Calibrated {} searches", engine.searches_count());
                }
                print!("\x1b[H");
                for i in 0..engine.searches_count() {
                    let obs = engine.observations(i);
                    let band = display::render_band(obs, cfg.width.unwrap_or(obs.len()));
                    match display::strongest_echo(obs, dist0, cfg.negative_space, sr) {
                        Some(echo) => {
                            println!(
                                "{:>2} |{}| {:>5} fr {:>6.2} m",
                                i,
                                band,
                                echo.frames,
                                echo.metres
                            );
                        }
                        None => println!("{:>2} |{}|", i, band),
                    }
                }
            }
        }
    }

    println!();
    let _ = log_info!(logger, "Shutting down after {} resyncs...", engine.resync_count());
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────────
// main
// ───────────────────────────────────────────────────────────────────────────────
fn main() -> Result<()> {
    let cli = match parse_arguments() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}\n", e);
            print_usage(&Config::default());
            std::process::exit(1);
        }
    };

    let logger = Arc::new(Logger::to_file(&cli.log_path, cli.log_level)?.with_stderr(true));
    let _ = log_info!(logger, "Logging to {}", cli.log_path);

    if cli.simulate {
        let room = SimulatedRoom::new(RoomSettings {
            inputs: 1,
            outputs: 2,
            loopback_delay: cli.sim_delay,
            echo_delay: cli.sim_echo_delay,
            echo_gain: cli.sim_echo_gain,
            noise: cli.sim_noise,
            seed: 0x2545f4914f6cdd1d,
        });
        let handle = room.handle();
        let mut engine = Echolocator::new(&cli, room, logger.clone())?;
        engine.start()?;
        let pump = handle.spawn_realtime(cli.sample_rate, 256);

        let outcome = run_display(&mut engine, &cli, &logger);
        // stream goes before the pump thread is joined
        drop(engine);
        let _ = pump.join();
        outcome?;
    } else {
        let backend = CpalBackend::new(logger.clone())?;
        let mut engine = Echolocator::new(&cli, backend, logger.clone())?;
        if let Err(e) = engine.start() {
            let _ = log_error!(logger, "audio start failed: {:#}", e);
            return Err(e);
        }
        let outcome = run_display(&mut engine, &cli, &logger);
        drop(engine);
        outcome?;
    }

    let _ = logger.info("Done.");
    Ok(())
}
