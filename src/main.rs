use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use hires_audio_pipeline::audio::{
    AudioPlayer, DeviceCapabilities, FrameSource, NullDeviceHandle, NullOpener, SymphoniaSource,
    ToneSource,
};
use hires_audio_pipeline::cli::{
    CliApp, Commands, ConfigAction, ParseError, PlayOptions, RuntimeCommand, StatusDisplay,
};
use hires_audio_pipeline::config::{ConfigManager, PipelineConfig};
use hires_audio_pipeline::filters::{canonical_name, FilterGraph};
use hires_audio_pipeline::logging::{self, OperationTimer, PipelineEvent};
use hires_audio_pipeline::{AudioFormat, FilterError, PipelineError};

/// Longest the scheduler sleeps when the player asks for nothing sooner
const IDLE_TICK: Duration = Duration::from_millis(20);
const POSITION_REFRESH: Duration = Duration::from_millis(250);

const AVAILABLE_FILTERS: &[(&str, &str)] = &[
    ("convert", "rate, layout and encoding conversion (aliases: lavrresample, resample); args: rate, channels, encoding"),
    ("volume", "linear gain, also carries replay gain and mute; args: volume"),
    ("scaletempo", "tempo change that keeps pitch; args: stride, overlap"),
    ("format", "force a format at this point of the chain (alias: force); args: rate, channels, encoding"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Quit,
}

/// Drives one player against a null device clocked by wall time
struct PlaybackSession {
    player: AudioPlayer,
    device: NullDeviceHandle,
    options: PlayOptions,
    last_clock: Instant,
    /// Fractional samples the device clock still owes
    clock_carry: f64,
    /// Last known audible position, used to answer refresh seeks
    position: Option<f64>,
    finished: bool,
    failed: Option<String>,
}

impl PlaybackSession {
    fn new(mut config: PipelineConfig, options: PlayOptions) -> Self {
        if let Some(speed) = options.speed {
            config.playback.speed = speed;
        }
        if let Some(volume) = options.volume {
            config.playback.volume = volume.max(0.0);
        }
        if options.mute {
            config.playback.mute = true;
        }
        if let Some(gapless) = options.gapless {
            config.gapless = gapless;
        }
        if options.device_rate.is_some() {
            config.output.rate = options.device_rate;
        }
        if options.device_channels.is_some() {
            config.output.channels = options.device_channels;
        }
        config.filters.extend(options.filters.iter().cloned());

        let capabilities = DeviceCapabilities {
            buffer_seconds: config.device.buffer_seconds,
            supports_passthrough: config.device.passthrough,
            untimed: options.fast,
            ..DeviceCapabilities::default()
        };
        let opener = NullOpener::new(capabilities);
        let device = opener.handle();

        Self {
            player: AudioPlayer::new(config, Box::new(opener)),
            device,
            options,
            last_clock: Instant::now(),
            clock_carry: 0.0,
            position: None,
            finished: false,
            failed: None,
        }
    }

    fn load(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        self.player.config().validate()?;
        self.player.load(source);
        self.player.set_play_end(self.options.end);
        if let Some(start) = self.options.start {
            info!("Starting at {:.3}s", start);
            self.player.seek(start)?;
        }
        Ok(())
    }

    /// Let the null device consume what it would have played since the last tick
    fn advance_clock(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_clock).as_secs_f64();
        self.last_clock = now;

        let rate = self.player.device().map_or(0, |d| d.format().rate);
        if rate == 0 || self.player.is_paused() {
            self.clock_carry = 0.0;
            return;
        }
        let samples = elapsed * rate as f64 + self.clock_carry;
        let whole = samples.floor();
        self.clock_carry = samples - whole;
        self.device.play(whole as usize);
    }

    fn device_idle(&self) -> bool {
        self.device.stats().queued_samples == 0
    }

    fn handle_events(&mut self) {
        for event in self.player.take_events() {
            match event {
                PipelineEvent::FormatChanged { device, format } => {
                    println!("Output: {} {}", device, format);
                }
                PipelineEvent::PlaybackStarted => println!("Playing"),
                PipelineEvent::SpeedReset => println!("Speed change failed, back to 1.00x"),
                PipelineEvent::SeekAudio { pts: Some(pts) } => self.seek_to(pts),
                PipelineEvent::RefreshSeek => {
                    if let Some(pts) = self.position {
                        self.seek_to(pts);
                    }
                }
                PipelineEvent::ResetPlayback => self.player.notify_seek(None),
                PipelineEvent::TrackFailed { reason } => {
                    self.failed = Some(reason);
                    self.finished = true;
                }
                PipelineEvent::AudioEof => self.finished = true,
                _ => {}
            }
        }
    }

    fn seek_to(&mut self, pts: f64) {
        debug!("Seeking source to {:.3}", pts);
        if let Err(e) = self.player.seek(pts) {
            warn!("Seek to {:.3} failed: {}", pts, e);
        }
    }

    async fn run(
        &mut self,
        shutdown: Arc<AtomicBool>,
        mut commands: Option<tokio::sync::mpsc::UnboundedReceiver<String>>,
    ) -> Result<(), PipelineError> {
        let mut last_refresh = Instant::now();
        let live_position = !self.options.fast && !self.options.interactive;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.advance_clock();
            let wakeup = self.player.advance();
            self.handle_events();
            if let Some(pts) = self.player.playing_pts() {
                self.position = Some(pts);
            }

            if self.finished && self.device_idle() {
                break;
            }

            if live_position && last_refresh.elapsed() >= POSITION_REFRESH {
                StatusDisplay::display_position_update(&self.player);
                last_refresh = Instant::now();
            }

            let wait = if self.options.fast && !self.finished {
                Duration::ZERO
            } else {
                wakeup.map_or(IDLE_TICK, |w| w.as_duration().min(IDLE_TICK))
            };

            let mut control = LoopControl::Continue;
            let mut stdin_closed = false;
            match commands.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        biased;

                        line = rx.recv() => match line {
                            Some(line) => control = self.execute_line(&line),
                            None => stdin_closed = true,
                        },
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None if wait.is_zero() => tokio::task::yield_now().await,
                None => tokio::time::sleep(wait).await,
            }

            if stdin_closed {
                commands = None;
            }
            if control == LoopControl::Quit {
                break;
            }
        }

        if live_position {
            println!();
        }
        self.shutdown();
        Ok(())
    }

    fn execute_line(&mut self, line: &str) -> LoopControl {
        match CliApp::parse_command(line) {
            Ok(RuntimeCommand::Quit) => return LoopControl::Quit,
            Ok(command) => {
                if let Err(e) = self.execute(command) {
                    error!("Command failed: {}", e);
                    StatusDisplay::display_error(&e);
                }
            }
            Err(ParseError::EmptyCommand) => {}
            Err(ParseError::HelpRequested) => CliApp::display_help(),
            Err(e) => {
                eprintln!("Error: {}", e);
                println!("Type 'help' for available commands.");
            }
        }
        LoopControl::Continue
    }

    fn execute(&mut self, command: RuntimeCommand) -> Result<(), PipelineError> {
        match command {
            RuntimeCommand::Pause => {
                self.player.set_paused(true);
                self.device.set_paused(true);
            }
            RuntimeCommand::Resume => {
                self.player.set_paused(false);
                self.device.set_paused(false);
            }
            RuntimeCommand::Seek(seconds) => self.player.seek(seconds)?,
            RuntimeCommand::Speed(speed) => self.player.set_speed(speed)?,
            RuntimeCommand::Volume(volume) => self.player.set_volume(volume),
            RuntimeCommand::Mute(mute) => self.player.set_mute(mute),
            RuntimeCommand::AddFilter(spec) => {
                let info = self.player.add_filter(&spec)?;
                println!("Added {} ({} -> {})", info.name, info.fmt_in, info.fmt_out);
            }
            RuntimeCommand::RemoveFilter(label) => {
                if !self.player.remove_filter(&label)? {
                    println!("No filter labelled '{}'", label);
                }
            }
            RuntimeCommand::FilterCommand { label, name, arg } => {
                self.player.send_command(&label, &name, &arg)?
            }
            RuntimeCommand::Reload => self.device.request_reload(),
            RuntimeCommand::Status => StatusDisplay::display_full_status(&self.player),
            RuntimeCommand::Chain => match self.player.chain() {
                Some(chain) => StatusDisplay::display_chain(&chain.graph.stages()),
                None => println!("No filter chain"),
            },
            RuntimeCommand::Events => {
                StatusDisplay::display_events(&self.player.event_log().recent(20))
            }
            RuntimeCommand::Quit => {}
        }
        Ok(())
    }

    /// Tear down the chain and close the device, draining it when playback ran out
    fn shutdown(&mut self) {
        self.player.set_end_of_file(self.finished && self.failed.is_none());
        self.player.uninit_audio_chain();
        self.player.uninit_audio_out();
        self.handle_events();

        let stats = self.device.stats();
        info!(
            "Device wrote {} samples in {} calls ({} opens, {} resets)",
            stats.written_samples, stats.write_calls, stats.opens, stats.resets
        );
        StatusDisplay::display_statistics(&self.player.event_log().statistics());
    }
}

/// Forward stdin lines to the scheduler from a dedicated thread
fn spawn_stdin_reader() -> tokio::sync::mpsc::UnboundedReceiver<String> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line.trim().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

async fn play(
    config: PipelineConfig,
    source: Box<dyn FrameSource>,
    options: PlayOptions,
) -> Result<(), PipelineError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived interrupt signal. Stopping playback...");
        shutdown_flag.store(true, Ordering::Relaxed);
    }) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    let commands = if options.interactive {
        println!("Type 'help' for available commands, 'quit' to stop.");
        Some(spawn_stdin_reader())
    } else {
        None
    };

    let mut session = PlaybackSession::new(config, options);
    session.load(source)?;
    session.run(shutdown, commands).await?;

    if let Some(reason) = session.failed {
        eprintln!("Playback failed: {}", reason);
        std::process::exit(1);
    }
    Ok(())
}

fn negotiate(
    input: AudioFormat,
    output: Option<AudioFormat>,
    filters: Vec<hires_audio_pipeline::config::FilterSpec>,
) -> Result<(), PipelineError> {
    let timer = OperationTimer::new("negotiate");
    let hint = output.unwrap_or_default();
    let mut graph = FilterGraph::new(filters);
    graph.initialize(input, hint.clone())?;

    // Same as opening a device: unset fields follow what the chain produces
    let mut device_format = hint;
    device_format.copy_unset_fields_from(graph.filter_output());
    graph.set_output_format(device_format);
    if !graph.is_initialized() {
        graph.negotiate()?;
    }
    timer.finish_with_threshold(Duration::from_millis(10));

    for line in graph.describe(None) {
        println!("{}", line);
    }
    println!();
    StatusDisplay::display_chain(&graph.stages());
    println!(
        "{} conversion stage(s) inserted, output {}",
        graph.auto_inserted_count(),
        graph.output_format()
    );
    Ok(())
}

fn config_command(mut manager: ConfigManager, action: ConfigAction) -> Result<(), PipelineError> {
    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(manager.get_config())
                .map_err(hires_audio_pipeline::ConfigError::from)?;
            println!("{}", text);
        }
        ConfigAction::Path => println!("{}", manager.config_path().display()),
        ConfigAction::Reset => {
            manager.reset_to_defaults()?;
            println!("Configuration reset to defaults");
        }
        ConfigAction::AddFilter { spec } => {
            if canonical_name(&spec.name).is_none() {
                return Err(FilterError::UnknownFilter { name: spec.name }.into());
            }
            manager.add_filter(spec)?;
            println!("Filter added");
        }
        ConfigAction::RemoveFilter { label } => {
            if manager.remove_filter(&label)? {
                println!("Removed filters labelled '{}'", label);
            } else {
                println!("No filter labelled '{}'", label);
            }
        }
    }
    Ok(())
}

async fn run(cli: CliApp) -> Result<(), PipelineError> {
    let manager = match cli.config {
        Some(path) => ConfigManager::with_path(CliApp::expand_path(&path.to_string_lossy()))?,
        None => ConfigManager::new()?,
    };

    match cli.command {
        Commands::Play { path, options } => {
            let source = SymphoniaSource::open(CliApp::expand_path(&path))?;
            play(manager.get_config().clone(), Box::new(source), options).await
        }
        Commands::Tone {
            frequency,
            rate,
            channels,
            length,
            options,
        } => {
            let source = ToneSource::new(AudioFormat::pcm(rate, channels), frequency, length);
            play(manager.get_config().clone(), Box::new(source), options).await
        }
        Commands::Negotiate {
            input,
            output,
            filters,
        } => negotiate(input, output, filters),
        Commands::Filters => {
            println!("Available filters:");
            for (name, description) in AVAILABLE_FILTERS {
                println!("  {:<12} {}", name, description);
            }
            Ok(())
        }
        Commands::Config { action } => config_command(manager, action),
    }
}

#[tokio::main]
async fn main() {
    let cli = CliApp::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("HIRES_PIPELINE_LOG_LEVEL").ok())
        .unwrap_or_else(|| "warn".to_string());
    if let Err(e) = logging::init_with_level(&level) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        error!("{}", e);
        StatusDisplay::display_error(&e);
        std::process::exit(1);
    }
}
