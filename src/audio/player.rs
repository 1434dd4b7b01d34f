//! Audio player: owns the output chain and the device, and keeps them configured.
//!
//! The per-tick synchronization logic lives in [`super::sync`]; this module holds
//! everything around it: building and tearing down the chain, opening the device
//! with a negotiated format, passthrough fallback, speed and volume control.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

use super::chain::OutputChain;
use super::decode::{FrameSource, ReplayGainData};
use super::device::{DeviceOpener, OutputDevice};
use super::sync::{Clock, SyncSession, SystemClock};
use crate::config::{FilterSpec, GaplessMode, PipelineConfig, ReplayGainMode};
use crate::error::{ConfigError, DecodeError, FilterError, PipelineError};
use crate::filters::{Control, ControlReply, StageArgs, StageInfo};
use crate::logging::{EventLog, OperationTimer, PipelineEvent};
use crate::models::{AudioFormat, PlaybackStatus};

/// Label of the stage inserted to change playback speed
pub const SPEED_LABEL: &str = "playback-speed";
/// Label of the stage inserted for software volume
pub const VOLUME_LABEL: &str = "softvol";

/// Dropping more buffered filter output than this while playing asks for a refresh seek
const REFRESH_SEEK_DELAY: f64 = 0.2;

/// When the scheduler should call [`AudioPlayer::advance`] again
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wakeup {
    Now,
    /// After this many seconds
    After(f64),
}

impl Wakeup {
    pub fn as_duration(&self) -> Duration {
        match self {
            Wakeup::Now => Duration::ZERO,
            Wakeup::After(seconds) => Duration::from_secs_f64(seconds.max(0.0)),
        }
    }

    fn earliest(self, other: Wakeup) -> Wakeup {
        match (self, other) {
            (Wakeup::After(a), Wakeup::After(b)) => Wakeup::After(a.min(b)),
            _ => Wakeup::Now,
        }
    }
}

/// State of a video stream the audio is synchronized to
#[derive(Debug, Clone, PartialEq)]
pub struct VideoReference {
    pub status: PlaybackStatus,
    /// Pts of the frame currently displayed
    pub pts: Option<f64>,
    /// A still image; audio never waits for it
    pub is_coverart: bool,
    /// Audio and video come from different demuxers
    pub separate_demuxer: bool,
}

impl VideoReference {
    pub fn new(status: PlaybackStatus, pts: Option<f64>) -> Self {
        Self {
            status,
            pts,
            is_coverart: false,
            separate_demuxer: false,
        }
    }
}

pub struct AudioPlayer {
    pub(crate) config: PipelineConfig,
    pub(crate) chain: Option<OutputChain>,
    pub(crate) device: Option<Box<dyn OutputDevice>>,
    opener: Box<dyn DeviceOpener>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) session: SyncSession,
    /// Decoder format the device was opened for
    decoder_format: Option<AudioFormat>,
    /// Clock time before which nothing is written to a freshly opened device
    pub(crate) resume_at: Option<f64>,
    replaygain: Option<ReplayGainData>,
    /// Extra speed factor applied by display sync
    speed_factor: f64,
    pub(crate) audio_speed: f64,
    pub(crate) video: Option<VideoReference>,
    pub(crate) hrseek_pts: Option<f64>,
    pub(crate) playback_pts: Option<f64>,
    pub(crate) play_end_pts: Option<f64>,
    pub(crate) paused: bool,
    pub(crate) display_sync_active: bool,
    /// Playback stops because the file ended, so closing the device drains it
    end_of_file: bool,
    events: VecDeque<PipelineEvent>,
    event_log: EventLog,
    wakeup: Option<Wakeup>,
}

impl std::fmt::Debug for AudioPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlayer")
            .field("status", &self.session.status)
            .field("chain", &self.chain)
            .field("device", &self.device.as_ref().map(|d| d.name().to_string()))
            .field("audio_speed", &self.audio_speed)
            .finish()
    }
}

impl AudioPlayer {
    pub fn new(config: PipelineConfig, opener: Box<dyn DeviceOpener>) -> Self {
        Self::with_clock(config, opener, Box::new(SystemClock::new()))
    }

    pub fn with_clock(
        config: PipelineConfig,
        opener: Box<dyn DeviceOpener>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let audio_speed = config.playback.speed;
        Self {
            config,
            chain: None,
            device: None,
            opener,
            clock,
            session: SyncSession::default(),
            decoder_format: None,
            resume_at: None,
            replaygain: None,
            speed_factor: 1.0,
            audio_speed,
            video: None,
            hrseek_pts: None,
            playback_pts: None,
            play_end_pts: None,
            paused: false,
            display_sync_active: false,
            end_of_file: false,
            events: VecDeque::new(),
            event_log: EventLog::new(),
            wakeup: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> PlaybackStatus {
        self.session.status
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn chain(&self) -> Option<&OutputChain> {
        self.chain.as_ref()
    }

    pub fn device(&self) -> Option<&dyn OutputDevice> {
        self.device.as_deref()
    }

    pub fn audio_speed(&self) -> f64 {
        self.audio_speed
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    /// Take every event emitted since the last call
    pub fn take_events(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn emit(&mut self, event: PipelineEvent) {
        self.event_log.record(&event);
        self.events.push_back(event);
    }

    pub(crate) fn wake(&mut self, wakeup: Wakeup) {
        self.wakeup = Some(match self.wakeup {
            Some(pending) => pending.earliest(wakeup),
            None => wakeup,
        });
    }

    pub(crate) fn take_wakeup(&mut self) -> Option<Wakeup> {
        self.wakeup.take()
    }

    pub(crate) fn set_status(&mut self, status: PlaybackStatus) {
        let from = self.session.status;
        if from == status {
            return;
        }
        self.session.status = status;
        if from == PlaybackStatus::Syncing {
            self.hrseek_pts = None;
        }
        self.emit(PipelineEvent::StatusChanged { from, to: status });
    }

    /// Start playing a source, replacing any current chain
    pub fn load(&mut self, source: Box<dyn FrameSource>) {
        self.reinit_audio_chain_src(Some(source));
    }

    /// Create a chain without a source
    pub fn load_blank(&mut self) {
        self.reinit_audio_chain_src(None);
    }

    fn reinit_audio_chain_src(&mut self, source: Option<Box<dyn FrameSource>>) {
        self.uninit_audio_chain();

        let mut chain = OutputChain::new(source, self.config.filters.clone());
        chain.spdif_passthrough = self.config.device.passthrough;
        if let Some(source) = chain.decode.source_mut() {
            self.replaygain = source.replaygain();
            if self.config.device.passthrough {
                if let Err(e) = source.reinit_codec(true) {
                    warn!("Passthrough unavailable for {}: {}", source.describe(), e);
                    chain.spdif_passthrough = false;
                }
            }
        }
        if let Some(device) = self.device.as_ref() {
            chain.buffer.reinit_format(device.format().clone());
        }
        self.chain = Some(chain);
        self.end_of_file = false;

        self.reset_audio_state();
        self.wake(Wakeup::Now);
    }

    /// Drop the chain; the device stays open for the next track
    pub fn uninit_audio_chain(&mut self) {
        if self.chain.take().is_some() {
            self.replaygain = None;
            self.set_status(PlaybackStatus::Eof);
        }
    }

    /// Close the device, draining it first when gapless or at the end of the file
    pub fn uninit_audio_out(&mut self) {
        if let Some(mut device) = self.device.take() {
            if self.config.gapless.is_enabled() || self.end_of_file {
                device.drain();
            }
            info!("Closed audio device {}", device.name());
            self.emit(PipelineEvent::DeviceClosed);
        }
        self.decoder_format = None;
    }

    /// Mark that playback ends because the input is exhausted
    pub fn set_end_of_file(&mut self, end_of_file: bool) {
        self.end_of_file = end_of_file;
    }

    /// Put the chain and the synchronization state back to SYNCING with nothing buffered
    pub fn reset_audio_state(&mut self) {
        let status = match self.chain.as_mut() {
            Some(chain) => {
                chain.reset();
                PlaybackStatus::Syncing
            }
            None => PlaybackStatus::Eof,
        };
        self.set_status(status);
        self.session.reset();
    }

    /// Forget buffered audio after a seek; `hrseek` is the exact target, if any
    pub fn notify_seek(&mut self, hrseek: Option<f64>) {
        if let Some(device) = self.device.as_mut() {
            device.reset();
        }
        self.reset_audio_state();
        self.hrseek_pts = hrseek;
        self.session.allow_second_chance_seek = true;
        self.wake(Wakeup::Now);
    }

    /// Seek the source and line the audio up with exactly `seconds`
    pub fn seek(&mut self, seconds: f64) -> Result<(), PipelineError> {
        self.notify_seek(Some(seconds));
        let source = self
            .chain
            .as_mut()
            .and_then(|chain| chain.decode.source_mut())
            .ok_or_else(|| DecodeError::SeekError("nothing to seek".to_string()))?;
        source.seek(seconds)?;
        Ok(())
    }

    pub fn set_video(&mut self, video: Option<VideoReference>) {
        self.video = video;
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoReference> {
        self.video.as_mut()
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Last known playback position, used to sync audio enabled mid-stream
    pub fn set_playback_pts(&mut self, pts: Option<f64>) {
        self.playback_pts = pts;
    }

    /// Stop buffering audio past this pts
    pub fn set_play_end(&mut self, pts: Option<f64>) {
        self.play_end_pts = pts;
    }

    pub fn set_display_sync_active(&mut self, active: bool) {
        self.display_sync_active = active;
    }

    /// Seconds of audio written ahead of the video clock consumed by the host
    pub fn consume_delay(&mut self, seconds: f64) {
        self.session.delay -= seconds;
    }

    /// Pts of the end of everything written to the device
    pub fn written_pts(&self) -> Option<f64> {
        self.chain.as_ref()?.written_pts(self.audio_speed)
    }

    /// Pts of the sample currently audible
    pub fn playing_pts(&self) -> Option<f64> {
        let pts = self.written_pts()?;
        match self.device.as_ref() {
            Some(device) => Some(pts - self.audio_speed * device.delay()),
            None => Some(pts),
        }
    }

    fn track_failed(&mut self, reason: String) {
        self.uninit_audio_chain();
        self.uninit_audio_out();
        self.emit(PipelineEvent::TrackFailed { reason });
    }

    /// Configure the filter chain and the device for the current decoder format.
    ///
    /// Opens the device if there is none. If the device cannot take a passthrough
    /// format, the source is switched to PCM and the next tick tries again.
    pub(crate) fn reinit_audio_filters_and_output(&mut self) {
        let Some(input) = self.chain.as_ref().map(|c| c.decode.input_format().clone()) else {
            return;
        };
        if !input.is_valid() {
            // Format not known yet; the next tick decodes more
            self.wake(Wakeup::Now);
            return;
        }

        if self.config.gapless == GaplessMode::Weak
            && self.device.is_some()
            && self.decoder_format.as_ref() != Some(&input)
        {
            self.uninit_audio_out();
        }

        let output_hint = match self.device.as_ref() {
            Some(device) => device.format().clone(),
            None if input.encoding.is_pcm() => self.config.output.to_format(),
            None => AudioFormat::unset(),
        };

        let timer = OperationTimer::new("filter negotiation");
        let initialized = {
            let Some(chain) = self.chain.as_mut() else {
                return;
            };
            chain.drop_output_frame();
            if self.device.is_some()
                && chain.graph.is_initialized()
                && chain.graph.input_format() == &input
            {
                return;
            }
            chain.graph.initialize(input.clone(), output_hint)
        };
        timer.finish_with_threshold(Duration::from_millis(50));
        if let Err(e) = initialized {
            error!("Error at audio filter chain pre-init: {}", e);
            self.track_failed(e.user_message());
            return;
        }

        if self.device.is_none() && !self.open_device(&input) {
            return;
        }

        if let Err(e) = self.recreate_audio_filters() {
            self.track_failed(e.user_message());
            return;
        }
        self.update_playback_speed();

        if let Some(device) = self.device.as_ref() {
            let event = PipelineEvent::FormatChanged {
                device: device.name().to_string(),
                format: device.format().clone(),
            };
            self.emit(event);
        }
    }

    /// Open the device for the chain's current output. Returns false if the
    /// caller should stop reinitializing.
    fn open_device(&mut self, input: &AudioFormat) -> bool {
        let Some(chain) = self.chain.as_mut() else {
            return false;
        };
        let out_format = chain.graph.output_format().clone();
        let spdif_fallback = out_format.encoding.is_spdif() && chain.spdif_passthrough;

        let mut device = match self.opener.open(&out_format, chain.spdif_passthrough) {
            Ok(device) => Some(device),
            Err(e) => {
                error!("{}", e);
                None
            }
        };

        if out_format.encoding.is_spdif() {
            if let Some(opened) = device.as_ref() {
                if opened.format() != &out_format {
                    error!("Passthrough format unsupported.");
                    device = None;
                }
            }
        }

        let Some(device) = device else {
            if spdif_fallback && chain.decode.has_source() {
                debug!("Falling back to PCM output.");
                chain.spdif_passthrough = false;
                chain.spdif_failed = true;
                let switched = chain
                    .decode
                    .source_mut()
                    .map_or(Ok(()), |source| source.reinit_codec(false));
                if let Err(e) = switched {
                    self.track_failed(e.user_message());
                    return false;
                }
                self.reset_audio_state();
                if let Some(chain) = self.chain.as_mut() {
                    chain.decode.clear_input_format();
                }
                self.wake(Wakeup::Now);
                return false;
            }

            error!("Could not open/initialize audio device -> no sound.");
            self.track_failed("could not open audio device".to_string());
            return false;
        };

        let format = device.format().clone();
        info!("AO: [{}] {}", device.name(), format);
        chain.set_device_format(format);
        self.device = Some(device);
        self.decoder_format = Some(input.clone());

        self.resume_at = (self.config.device.wait_open > 0.0)
            .then(|| self.clock.now() + self.config.device.wait_open);
        true
    }

    /// Make sure the graph is negotiated for its current input and output
    fn ensure_graph(&mut self) -> Result<(), FilterError> {
        let Some(chain) = self.chain.as_mut() else {
            return Ok(());
        };
        if chain.graph.is_initialized() {
            return Ok(());
        }
        let input = chain.graph.input_format().clone();
        let output = chain.graph.output_format().clone();
        chain.graph.initialize(input, output)
    }

    fn recreate_audio_filters(&mut self) -> Result<(), FilterError> {
        let result = self.ensure_graph().and_then(|()| {
            self.recreate_speed_filters();
            self.ensure_graph()
        });
        if let Err(e) = result {
            error!("Couldn't find matching filter/ao format!");
            return Err(e);
        }
        self.update_volume();
        Ok(())
    }

    /// Tear the filter chain down and build it again.
    ///
    /// Returns `Ok(false)` without a chain. If the dropped filter output was long
    /// enough to disturb sync, a refresh seek is requested.
    pub fn reinit_filters(&mut self) -> Result<bool, FilterError> {
        let Some(chain) = self.chain.as_mut() else {
            return Ok(false);
        };
        let delay = if chain.graph.is_initialized() {
            chain.graph.total_delay()
        } else {
            0.0
        };
        chain.graph.uninit();
        self.recreate_audio_filters()?;

        if self.session.status == PlaybackStatus::Playing && delay > REFRESH_SEEK_DELAY {
            self.emit(PipelineEvent::RefreshSeek);
        }
        Ok(true)
    }

    /// Reopen the device, trying passthrough again if it fell back to PCM earlier
    pub fn reload_audio_output(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        device.reset();
        self.uninit_audio_out();
        if let Err(e) = self.reinit_filters() {
            debug!("Filter rebuild during reload failed: {}", e);
        }

        let mut failed = None;
        if let Some(chain) = self.chain.as_mut() {
            if chain.spdif_failed && chain.decode.has_source() {
                chain.spdif_passthrough = true;
                chain.spdif_failed = false;
                chain.graph.mark_uninitialized();
                if let Some(source) = chain.decode.source_mut() {
                    if let Err(e) = source.reinit_codec(true) {
                        error!("Error reinitializing audio: {}", e);
                        failed = Some(e.user_message());
                    }
                }
            }
        }
        if let Some(reason) = failed {
            self.track_failed(reason);
        }
        self.wake(Wakeup::Now);
    }

    fn speed_control(&self, speed: f64) -> Control {
        // Keep pitch only for user speed changes, not for small sync corrections
        if self.config.playback.pitch_correction && self.config.playback.speed != 1.0 {
            Control::SetPlaybackSpeed(speed)
        } else {
            Control::SetPlaybackSpeedResample(speed)
        }
    }

    /// Hand the speed to existing stages. Returns false if stages must be added or removed.
    fn update_speed_filters(&mut self) -> bool {
        let speed = self.audio_speed;
        let control = self.speed_control(speed);
        let Some(chain) = self.chain.as_mut() else {
            return false;
        };
        let graph = &mut chain.graph;
        if !graph.is_initialized() {
            return false;
        }

        // Exactly one stage may change the speed
        graph.control_broadcast(&Control::SetPlaybackSpeed(1.0));
        graph.control_broadcast(&Control::SetPlaybackSpeedResample(1.0));

        if speed == 1.0 {
            return graph.find_by_label(SPEED_LABEL).is_none();
        }

        // A tempo stage the user configured always handles speed
        if graph.find_by_label(SPEED_LABEL).is_none()
            && graph.control_latest_first(&Control::SetPlaybackSpeed(speed)).is_some()
        {
            return true;
        }

        graph.control_latest_first(&control).is_some()
    }

    fn recreate_speed_filters(&mut self) {
        if self.update_speed_filters() {
            return;
        }

        let tempo = matches!(self.speed_control(self.audio_speed), Control::SetPlaybackSpeed(_));
        let audio_speed = self.audio_speed;
        let added = match self.chain.as_mut() {
            Some(chain) => chain.graph.remove_stage(SPEED_LABEL).and_then(|_| {
                if audio_speed == 1.0 {
                    return Ok(None);
                }
                let filter = if tempo { "scaletempo" } else { "convert" };
                chain
                    .graph
                    .add_stage(filter, SPEED_LABEL, &StageArgs::new())
                    .map(Some)
            }),
            None => return,
        };

        match added {
            Ok(None) => {}
            Ok(Some(stage)) => {
                debug!("Inserted {} for playback speed {}", stage.name, audio_speed);
                if !self.update_speed_filters() {
                    self.reset_speed();
                }
            }
            Err(e) => {
                warn!("Could not change playback speed: {}", e);
                self.reset_speed();
            }
        }
    }

    fn reset_speed(&mut self) {
        self.config.playback.speed = 1.0;
        self.speed_factor = 1.0;
        self.audio_speed = 1.0;
        self.emit(PipelineEvent::SpeedReset);
    }

    /// Apply the configured speed and the sync speed factor to the chain
    pub fn update_playback_speed(&mut self) {
        self.audio_speed = self.config.playback.speed * self.speed_factor;

        let initialized = self
            .chain
            .as_ref()
            .map_or(false, |chain| chain.graph.is_initialized());
        if !initialized {
            return;
        }
        if !self.update_speed_filters() {
            if let Err(e) = self.recreate_audio_filters() {
                error!("Could not rebuild filters for speed change: {}", e);
            }
        }
    }

    pub fn set_speed(&mut self, speed: f64) -> Result<(), PipelineError> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(ConfigError::InvalidValue(format!("speed={}", speed)).into());
        }
        self.config.playback.speed = speed;
        self.update_playback_speed();
        Ok(())
    }

    /// Speed correction requested by display sync, on top of the user speed
    pub fn set_speed_factor(&mut self, factor: f64) {
        if factor > 0.0 && factor.is_finite() {
            self.speed_factor = factor;
            self.update_playback_speed();
        }
    }

    /// Linear gain from the replay gain settings and the track's tags
    pub fn compute_replaygain(&self) -> f32 {
        let options = &self.config.playback.replaygain;
        match (options.mode, self.replaygain) {
            (ReplayGainMode::Off, _) | (_, None) => {
                if options.fallback != 0.0 {
                    let gain = db_gain(options.fallback);
                    debug!("Applying fallback gain: {}", gain);
                    gain
                } else {
                    1.0
                }
            }
            (mode, Some(data)) => {
                debug!(
                    "Replaygain: Track={}/{} Album={}/{}",
                    data.track_gain, data.track_peak, data.album_gain, data.album_peak
                );
                let (gain, peak) = if mode == ReplayGainMode::Track {
                    (data.track_gain, data.track_peak)
                } else {
                    (data.album_gain, data.album_peak)
                };
                let mut linear = db_gain(gain + options.preamp);
                if !options.clip && peak > 0.0 {
                    linear = linear.min(1.0 / peak);
                }
                debug!("Applying replay-gain: {}", linear);
                linear
            }
        }
    }

    /// Push volume, mute and replay gain into the chain, inserting a volume stage if needed
    pub fn update_volume(&mut self) {
        let playback = &self.config.playback;
        let mut gain = (playback.volume / 100.0).max(0.0).powi(3) * self.compute_replaygain();
        if playback.mute {
            gain = 0.0;
        }

        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        if !chain.graph.is_initialized() {
            return;
        }
        if chain.graph.control_latest_first(&Control::SetVolume(gain)).is_some() {
            return;
        }
        if gain == 1.0 {
            return;
        }

        debug!("Inserting volume filter.");
        let accepted = chain
            .graph
            .add_stage("volume", VOLUME_LABEL, &StageArgs::new())
            .ok()
            .and_then(|_| chain.graph.control_latest_first(&Control::SetVolume(gain)));
        if accepted.is_none() {
            error!("No volume control available.");
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.config.playback.volume = volume.max(0.0);
        self.update_volume();
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.config.playback.mute = mute;
        self.update_volume();
    }

    /// Add a labelled stage to the running chain
    pub fn add_filter(&mut self, spec: &FilterSpec) -> Result<StageInfo, FilterError> {
        let label = spec.label.clone().unwrap_or_else(|| spec.name.clone());
        let chain = self.chain.as_mut().ok_or(FilterError::NotInitialized)?;
        let info = chain.graph.add_stage(&spec.name, &label, &spec.args)?;
        self.config.filters.push(FilterSpec {
            label: Some(label),
            ..spec.clone()
        });
        Ok(info)
    }

    pub fn remove_filter(&mut self, label: &str) -> Result<bool, FilterError> {
        let chain = self.chain.as_mut().ok_or(FilterError::NotInitialized)?;
        let removed = chain.graph.remove_stage(label)?;
        self.config
            .filters
            .retain(|spec| spec.label.as_deref() != Some(label));
        Ok(removed)
    }

    /// Send a command to a labelled stage, or to all stages with `all`
    pub fn send_command(&mut self, label: &str, name: &str, arg: &str) -> Result<(), FilterError> {
        let chain = self.chain.as_mut().ok_or(FilterError::NotInitialized)?;
        match chain.graph.send_command(label, name, arg)? {
            ControlReply::Ok => Ok(()),
            ControlReply::Unsupported => Err(FilterError::StageFailed {
                stage: label.to_string(),
                reason: format!("command '{}' not supported", name),
            }),
        }
    }
}

fn db_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}
