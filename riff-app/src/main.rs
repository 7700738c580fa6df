//! riff - terminal practice-loop player
//!
//! Plays one track with independent tempo and pitch, beat-snapped loops and
//! a three-band EQ. Keys are listed in the status area.

mod keymap;

use std::fs::{self, OpenOptions};
use std::io::{self, stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyEventKind},
    execute, queue,
    style::Print,
    terminal::{
        disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use keymap::Action;
use riff_audio::{
    Engine, EngineConfig, EqBand, ExportRange, ExportSettings, ExportedAudio, LoopState, Renderer,
    MAX_CHANNELS,
};
use riff_library::{PlayerConfig, TrackLoader};

/// Frame rate for status updates
const FPS: u64 = 30;
/// Passes through the loop seam written by a loop export
const EXPORT_LOOP_REPETITIONS: u32 = 4;

fn main() -> anyhow::Result<()> {
    let mut config = PlayerConfig::load();
    let log_path = init_logging()?;

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.last_file.clone())
        .ok_or_else(|| anyhow!("usage: riff <audio file>"))?;

    let mut output = AudioOutput::open()?;
    let decoded = TrackLoader::with_sample_rate(output.sample_rate)
        .load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let title = decoded.metadata.title.clone();

    let (mut engine, renderer) = Engine::new(engine_config(&config, output.channels));
    engine.load_track(decoded.samples, decoded.sample_rate, decoded.channels)?;
    output.start(renderer)?;
    engine.set_render_active(true);

    config.last_file = Some(path.clone());
    if let Err(e) = config.save() {
        warn!(error = %e, "could not save config");
    }

    info!(log = %log_path.display(), "riff started");

    let _terminal = TerminalGuard::enter()?;
    let mut app = App {
        engine,
        output,
        config,
        title,
        source: path,
        loop_in: None,
        message: String::new(),
    };
    app.run()
}

/// Log to a file, since the terminal is in raw mode
fn init_logging() -> anyhow::Result<PathBuf> {
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("riff");
    fs::create_dir_all(&dir)?;
    let path = dir.join("riff.log");
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riff=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(path)
}

/// Persisted player settings on top of the engine defaults
fn engine_config(config: &PlayerConfig, output_channels: usize) -> EngineConfig {
    EngineConfig {
        crossfade_ms: config.crossfade_ms,
        watchdog_interval: Duration::from_millis(config.watchdog_ms),
        output_channels,
        ..EngineConfig::default()
    }
}

/// Device channel count the renderer can fill frame for frame
fn usable_channels(device_channels: u16) -> anyhow::Result<usize> {
    if device_channels == 0 || device_channels > MAX_CHANNELS {
        return Err(anyhow!(
            "output device has {} channels, riff supports 1 to {}",
            device_channels,
            MAX_CHANNELS
        ));
    }
    Ok(device_channels as usize)
}

/// Restores the terminal even on early return
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        execute!(stdout(), EnterAlternateScreen, Hide)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(stdout(), Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

/// Default output device and the stream currently feeding it
struct AudioOutput {
    device: cpal::Device,
    stream_config: cpal::StreamConfig,
    sample_rate: u32,
    channels: usize,
    stream: Option<cpal::Stream>,
}

impl AudioOutput {
    fn open() -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no audio output device found"))?;
        let supported = device
            .default_output_config()
            .context("failed to get audio config")?;

        let sample_rate = supported.sample_rate().0;
        let channels = usable_channels(supported.channels())?;
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels,
            "audio output opened"
        );

        Ok(Self {
            device,
            stream_config: supported.into(),
            sample_rate,
            channels,
            stream: None,
        })
    }

    /// Build and start a stream whose callback drives `renderer`
    fn start(&mut self, mut renderer: Renderer) -> anyhow::Result<()> {
        // Drop the old stream first so two callbacks never overlap
        self.stream = None;

        let channels = renderer.output_channels();
        if channels != self.channels {
            return Err(anyhow!(
                "renderer writes {} channels but the device takes {}",
                channels,
                self.channels
            ));
        }
        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render_block(data, data.len() / channels);
                },
                |err| {
                    error!(error = %err, "audio stream error");
                },
                None,
            )
            .context("failed to create audio stream")?;
        stream.play().context("failed to start audio")?;

        self.stream = Some(stream);
        Ok(())
    }
}

struct App {
    engine: Engine,
    output: AudioOutput,
    config: PlayerConfig,
    title: String,
    source: PathBuf,
    /// Pending loop start from `i` when no region exists yet
    loop_in: Option<u64>,
    message: String,
}

impl App {
    fn run(&mut self) -> anyhow::Result<()> {
        let frame_duration = Duration::from_millis(1000 / FPS);
        let mut out = stdout();
        execute!(out, Clear(ClearType::All))?;

        loop {
            let frame_start = Instant::now();

            self.engine.poll();
            if self.engine.check_health(frame_start).is_err() {
                self.rebuild_output();
            }

            self.draw(&mut out)?;

            let timeout = frame_duration.saturating_sub(frame_start.elapsed());
            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Release {
                        if let Some(action) = keymap::action_for(key) {
                            if action == Action::Quit {
                                break;
                            }
                            self.apply(action);
                        }
                    }
                }
            }

            let elapsed = frame_start.elapsed();
            if elapsed < frame_duration {
                thread::sleep(frame_duration - elapsed);
            }
        }

        self.engine.pause();
        self.engine.set_render_active(false);
        info!("riff stopped");
        Ok(())
    }

    fn rebuild_output(&mut self) {
        let renderer = self.engine.reset_render_pipeline();
        match self.output.start(renderer) {
            Ok(()) => {
                info!("output stream rebuilt");
                self.message = "audio restarted after a stall".to_string();
            }
            Err(e) => {
                error!(error = %e, "failed to rebuild output stream");
                self.engine.set_render_active(false);
                self.message = format!("audio output lost: {e}");
            }
        }
    }

    fn apply(&mut self, action: Action) {
        let engine = &mut self.engine;
        let params = engine.params();

        match action {
            Action::TogglePlay => engine.toggle(),
            Action::Seek(secs) => engine.seek_by_secs(secs),
            Action::AdjustTempo(delta) => engine.set_tempo(params.tempo_ratio + delta),
            Action::AdjustPitch(delta) => engine.set_pitch(params.pitch_semitones + delta),
            Action::AdjustVolume(delta) => engine.set_volume(params.volume + delta),
            Action::AdjustEq(band, delta) => engine.set_eq(band, params.eq.get(band) + delta),
            Action::ResetEq => {
                for band in [EqBand::Low, EqBand::Mid, EqBand::High] {
                    engine.set_eq(band, 0.0);
                }
            }
            Action::LoopIn => self.loop_in(),
            Action::LoopOut => self.loop_out(),
            Action::ToggleLoop => {
                if engine.loop_region().is_none() {
                    self.message = "no loop set".to_string();
                } else {
                    engine.toggle_loop();
                }
            }
            Action::HalveLoop => {
                let ok = engine.halve_loop();
                self.report(ok, "halve");
            }
            Action::DoubleLoop => {
                let ok = engine.double_loop();
                self.report(ok, "double");
            }
            Action::NudgeLoop(bars) => {
                let ok = engine.nudge_loop(bars);
                self.report(ok, "nudge");
            }
            Action::ResizeLoop(bars) => {
                let ok = engine.resize_loop(bars);
                self.report(ok, "resize");
            }
            Action::SnapLoop => {
                let ok = engine.snap_loop_to_beat();
                self.report(ok, "snap");
            }
            Action::SnapLoopStart => {
                let ok = engine.snap_loop_start_to_beat();
                self.report(ok, "snap the start of the");
            }
            Action::SnapLoopEnd => {
                let ok = engine.snap_loop_end_to_beat();
                self.report(ok, "snap the end of the");
            }
            Action::LoopFromHere(bars) => {
                let ok = engine.loop_from_here(bars);
                self.report(ok, "loop");
            }
            Action::ClearLoop => {
                engine.clear_loop();
                self.loop_in = None;
                self.message.clear();
            }
            Action::ExportLoop => self.export(),
            Action::Quit => {}
        }
    }

    fn report(&mut self, ok: bool, what: &str) {
        self.message = if ok {
            String::new()
        } else {
            format!("cannot {what} loop here")
        };
    }

    fn loop_in(&mut self) {
        let position = self.engine.current_position();
        match self.engine.loop_region() {
            Some(region) if position < region.end() => {
                if let Err(e) = self.engine.set_loop(position, region.end()) {
                    self.message = e.to_string();
                }
                self.loop_in = None;
            }
            _ => {
                self.loop_in = Some(position);
                self.message = "loop in set, press o at the loop end".to_string();
            }
        }
    }

    fn loop_out(&mut self) {
        let position = self.engine.current_position();
        let start = self
            .loop_in
            .take()
            .or_else(|| self.engine.loop_region().map(|r| r.start()))
            .unwrap_or(0);

        match self.engine.set_loop(start, position) {
            Ok(()) => {
                self.engine.enable_loop();
                self.message.clear();
            }
            Err(e) => self.message = e.to_string(),
        }
    }

    fn export(&mut self) {
        let range = if self.engine.loop_region().is_some() {
            ExportRange::Loop {
                repetitions: EXPORT_LOOP_REPETITIONS,
            }
        } else {
            ExportRange::Full
        };
        let settings = ExportSettings {
            range,
            ..Default::default()
        };

        let result = self
            .engine
            .export(&settings)
            .map_err(anyhow::Error::from)
            .and_then(|audio| {
                let path = export_path(&self.config.export_dir_or_default(), &self.source);
                write_wav(&path, &audio)?;
                Ok((path, audio.duration_secs()))
            });

        self.message = match result {
            Ok((path, secs)) => {
                info!(path = %path.display(), duration_secs = secs, "export written");
                format!("exported {:.1}s to {}", secs, path.display())
            }
            Err(e) => {
                warn!(error = %e, "export failed");
                format!("export failed: {e}")
            }
        };
    }

    fn draw(&self, out: &mut impl Write) -> io::Result<()> {
        let engine = &self.engine;
        let params = engine.params();
        let sample_rate = engine.sample_rate().unwrap_or(self.output.sample_rate) as f64;
        let duration = engine.duration_frames() as f64 / sample_rate;

        let transport = format!(
            "{} {} / {}  tempo {:.2}x  pitch {:+}  vol {:>3.0}%",
            if engine.is_playing() { "▶" } else { "⏸" },
            format_time(engine.current_position_secs()),
            format_time(duration),
            params.tempo_ratio,
            params.pitch_semitones,
            params.volume * 100.0,
        );

        let bpm = if engine.is_analyzing() && engine.track_bpm().is_none() {
            "bpm …".to_string()
        } else if let Some(track_bpm) = engine.track_bpm() {
            format!("bpm {:.1} ({:.1})", engine.current_bpm(), track_bpm)
        } else {
            "bpm --".to_string()
        };

        let looping = match engine.loop_region() {
            Some(region) => format!(
                "loop {}-{} {}{}",
                format_time(region.start() as f64 / sample_rate),
                format_time(region.end() as f64 / sample_rate),
                loop_label(engine.loop_state()),
                if engine.loop_settings().enabled { "" } else { " (off)" },
            ),
            None => match self.loop_in {
                Some(frame) => format!("loop in {}", format_time(frame as f64 / sample_rate)),
                None => "no loop".to_string(),
            },
        };

        let eq = format!(
            "eq L{:+.1} M{:+.1} H{:+.1}",
            params.eq.low_db, params.eq.mid_db, params.eq.high_db
        );

        let lines = [
            format!("riff  {}", self.title),
            transport,
            format!("{bpm}  {looping}  {eq}"),
            self.message.clone(),
            String::new(),
            keymap::HELP.to_string(),
        ];
        for (row, line) in lines.iter().enumerate() {
            queue!(
                out,
                MoveTo(0, row as u16),
                Clear(ClearType::CurrentLine),
                Print(line)
            )?;
        }
        out.flush()
    }
}

fn loop_label(state: LoopState) -> &'static str {
    match state {
        LoopState::NoLoop => "",
        LoopState::LoopArmed => "ARMED",
        LoopState::Looping | LoopState::Crossfading => "LOOPING",
    }
}

/// `mm:ss.t`
fn format_time(secs: f64) -> String {
    let tenths = (secs.max(0.0) * 10.0).round() as u64;
    format!("{:02}:{:02}.{}", tenths / 600, (tenths / 10) % 60, tenths % 10)
}

fn export_path(dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("track");
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    dir.join(format!("{stem}-riff-{stamp}.wav"))
}

/// 32-bit float WAV
fn write_wav(path: &Path, audio: &ExportedAudio) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("cannot create {}", path.display()))?;
    for &sample in &audio.samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "00:00.0");
        assert_eq!(format_time(61.25), "01:01.3");
        assert_eq!(format_time(599.96), "10:00.0");
        assert_eq!(format_time(-3.0), "00:00.0");
    }

    #[test]
    fn test_engine_config_from_player_config() {
        let player = PlayerConfig {
            crossfade_ms: 45.0,
            watchdog_ms: 800,
            ..Default::default()
        };
        let config = engine_config(&player, 1);
        assert_eq!(config.crossfade_ms, 45.0);
        assert_eq!(config.watchdog_interval, Duration::from_millis(800));
        assert_eq!(config.output_channels, 1);
        assert_eq!(config.grain_frames, EngineConfig::default().grain_frames);
    }

    #[test]
    fn test_usable_channels() {
        assert_eq!(usable_channels(2).unwrap(), 2);
        assert_eq!(usable_channels(MAX_CHANNELS).unwrap(), MAX_CHANNELS as usize);
        assert!(usable_channels(0).is_err());
        assert!(usable_channels(MAX_CHANNELS + 1).is_err());
    }

    #[test]
    fn test_export_path_uses_source_stem() {
        let path = export_path(Path::new("/tmp/exports"), Path::new("/music/My Song.flac"));
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(path.starts_with("/tmp/exports"));
        assert!(name.starts_with("My Song-riff-"));
        assert!(name.ends_with(".wav"));
    }

    #[test]
    fn test_write_wav() {
        let path = std::env::temp_dir().join(format!("riff-export-{}.wav", std::process::id()));
        let audio = ExportedAudio {
            samples: vec![0.0, 0.25, -0.5, 1.0],
            sample_rate: 48000,
            channels: 2,
        };
        write_wav(&path, &audio).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        fs::remove_file(&path).ok();

        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48000);
        assert_eq!(samples, audio.samples);
    }
}
