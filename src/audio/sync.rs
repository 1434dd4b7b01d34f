//! Synchronization state machine driving the device from the output chain.
//!
//! [`AudioPlayer::advance`] is called once per scheduler wakeup. It never blocks:
//! whenever it has to wait it returns and asks to be woken again.

use log::{debug, info, log_enabled, warn, Level};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::chain::{PullRequest, PullStatus};
use super::decode::DecodeStatus;
use super::player::{AudioPlayer, Wakeup};
use crate::config::GaplessMode;
use crate::logging::PipelineEvent;
use crate::models::PlaybackStatus;

/// Audio further than this ahead of separately demuxed video gets one more seek
const SECOND_CHANCE_THRESHOLD: f64 = 0.2;
/// Minimum samples buffered while skipping towards the sync point
const MIN_SKIP_BUFFER: i64 = 2500;

/// Monotonic time source in seconds
pub trait Clock: Send {
    fn now(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += seconds;
    }

    pub fn set(&self, seconds: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-session synchronization state
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub status: PlaybackStatus,
    /// Seconds of audio written ahead of the playback clock
    pub delay: f64,
    /// Drop/duplicate budget spent recently
    pub drop_throttle: f64,
    /// Clock time the drift statistics started at
    pub stat_start: Option<f64>,
    /// Seconds of device-rate audio written since the statistics started
    pub written_audio: f64,
    /// One corrective seek is allowed after a seek on separately demuxed tracks
    pub allow_second_chance_seek: bool,
    /// Samples handed to the device in total
    pub shown_samples: u64,
    /// Smoothed audio minus video difference, fed by the host
    pub last_av_difference: f64,
    /// The device ran dry and nothing has been written since
    pub underrun: bool,
}

impl Default for SyncSession {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Eof,
            delay: 0.0,
            drop_throttle: 0.0,
            stat_start: None,
            written_audio: 0.0,
            allow_second_chance_seek: false,
            shown_samples: 0,
            last_av_difference: 0.0,
            underrun: false,
        }
    }
}

impl SyncSession {
    /// Forget the timing state; the status is managed by the player
    pub fn reset(&mut self) {
        self.delay = 0.0;
        self.drop_throttle = 0.0;
        self.stat_start = None;
        self.allow_second_chance_seek = false;
        self.underrun = false;
    }
}

impl AudioPlayer {
    /// Run one tick of the state machine. Returns when the scheduler should call again,
    /// or `None` if only an external event can make progress.
    pub fn advance(&mut self) -> Option<Wakeup> {
        self.fill_audio_out_buffers();
        self.take_wakeup()
    }

    /// Host estimate of how far audio is ahead of the display
    pub fn set_av_difference(&mut self, seconds: f64) {
        self.session.last_av_difference = seconds;
    }

    fn fill_audio_out_buffers(&mut self) {
        let was_eof = self.session.status == PlaybackStatus::Eof;

        self.dump_audio_stats();

        if self
            .device
            .as_mut()
            .map_or(false, |device| device.take_reload_request())
        {
            self.reload_audio_output();
        }

        let Some(chain) = self.chain.as_mut() else {
            return;
        };

        if !chain.graph.is_initialized() || self.device.is_none() {
            // Learn the input format; does nothing if a frame is already waiting
            let status = loop {
                match chain.decode.decode_new_frame() {
                    DecodeStatus::NoProgress => continue,
                    status => break status,
                }
            };
            match status {
                DecodeStatus::Wait => return,
                DecodeStatus::Eof => {
                    self.set_status(PlaybackStatus::Eof);
                    return;
                }
                _ => {}
            }
            self.reinit_audio_filters_and_output();
            self.wake(Wakeup::Now);
            return;
        }

        if let Some(resume_at) = self.resume_at {
            let now = self.clock.now();
            if resume_at > now {
                self.wake(Wakeup::After(resume_at - now));
                return;
            }
            self.resume_at = None;
        }

        let pts_reset = self
            .chain
            .as_ref()
            .map_or(false, |chain| chain.pts_reset_requested());
        if self.video.is_some() && pts_reset {
            info!("Reset playback due to audio timestamp reset.");
            self.reset_audio_state();
            self.emit(PipelineEvent::ResetPlayback);
            self.wake(Wakeup::Now);
            return;
        }

        let Some(device) = self.device.as_ref() else {
            return;
        };
        let device_rate = device.format().rate as f64;
        let play_rate = device_rate / self.audio_speed;
        let align = device.format().sample_alignment().max(1) as i64;
        let video_status = self
            .video
            .as_ref()
            .map_or(PlaybackStatus::Eof, |video| video.status);

        // Without a device clock, keep roughly in step with video
        if self.session.status == PlaybackStatus::Playing
            && device.is_untimed()
            && video_status != PlaybackStatus::Eof
            && self.session.delay > 0.0
        {
            return;
        }

        let mut playsize = device.space_available() as i64;

        let (sync_known, skip) = self.get_sync_samples();
        if skip > 0 {
            playsize = (skip + 1).min(playsize.max(MIN_SKIP_BUFFER));
        } else if skip < 0 {
            // Silence will be prepended
            playsize = (playsize + skip).max(1);
        }

        let mut skip_duplicate: i64 = 0;
        let sync = &self.config.sync;
        let drop_limit = (sync.sync_max_audio_change + sync.sync_max_video_change) / 100.0;
        if self.display_sync_active
            && sync.display_sync_drop
            && self.session.last_av_difference.abs() >= sync.sync_audio_drop_size
            && self.session.drop_throttle < drop_limit
            && self.session.status == PlaybackStatus::Playing
        {
            let samples = (sync.sync_audio_drop_size * play_rate).ceil() as i64;
            let samples = (samples + align / 2) / align * align;
            skip_duplicate = if self.session.last_av_difference >= 0.0 {
                -samples
            } else {
                samples
            };
            playsize = playsize.max(samples);
            self.session.drop_throttle += 1.0 - drop_limit - samples as f64 / play_rate;
        }

        let playsize = (playsize / align * align).max(0) as usize;

        let mut status = if self.session.status >= PlaybackStatus::Draining {
            PullStatus::Eof
        } else {
            PullStatus::Ok
        };
        let mut working = false;
        if playsize > self.buffered_samples() {
            status = self.pull(playsize);
            match status {
                PullStatus::Wait => {
                    self.check_underrun();
                    return;
                }
                PullStatus::Starved => {
                    self.check_underrun();
                    self.wake(Wakeup::Now);
                    return;
                }
                PullStatus::NoProgress => {
                    self.wake(Wakeup::Now);
                    return;
                }
                PullStatus::NewFormat => {
                    if self.config.gapless == GaplessMode::Off {
                        self.uninit_audio_out();
                    }
                    self.reinit_audio_filters_and_output();
                    self.wake(Wakeup::Now);
                    return;
                }
                PullStatus::Failed => self.wake(Wakeup::Now),
                PullStatus::Ok | PullStatus::Eof => {}
            }
            working = true;
        }

        // Audio that ended earlier but has data again, e.g. a track starting late
        if self.session.status >= PlaybackStatus::Draining && self.buffered_samples() > 0 {
            self.set_status(PlaybackStatus::Syncing);
            self.wake(Wakeup::Now);
            return;
        }

        let mut end_sync = false;
        if skip >= 0 {
            let max = self.buffered_samples();
            let skip = skip as usize;
            if let Some(chain) = self.chain.as_mut() {
                chain.buffer.skip(skip.min(max));
            }
            // Something left over means the target time was reached
            end_sync |= sync_known && skip < max;
            working |= skip > 0;
        } else {
            let silence = skip.unsigned_abs() as usize;
            if silence > playsize {
                // Too far behind to pad
                if let Some(device) = self.device.as_mut() {
                    device.reset();
                }
                self.set_status(PlaybackStatus::Draining);
                self.session.delay = 0.0;
                return;
            }
            if let Some(chain) = self.chain.as_mut() {
                chain.buffer.prepend_silence(silence);
            }
            end_sync = true;
        }

        if skip_duplicate != 0 {
            self.apply_drift_correction(skip_duplicate, play_rate);
        }

        if self.session.status == PlaybackStatus::Syncing {
            if end_sync {
                self.set_status(PlaybackStatus::Filling);
            }
            if status != PullStatus::Ok && self.buffered_samples() == 0 {
                self.set_status(PlaybackStatus::Eof);
            }
            if working || end_sync {
                self.wake(Wakeup::Now);
            }
            return;
        }

        // Everything the device asked for is buffered
        if self.session.status == PlaybackStatus::Filling {
            self.set_status(PlaybackStatus::Ready);
        }

        // Writing starts the device, so let video start first
        let starting = self.session.status == PlaybackStatus::Ready;
        if starting {
            if let Some(video) = self.video.as_ref() {
                if !video.is_coverart && video.status <= PlaybackStatus::Ready {
                    return;
                }
            }
            debug!("starting audio playback");
        }

        let buffered = self.buffered_samples();
        let mut playsize = playsize;
        let mut partial_fill = false;
        if playsize > buffered {
            playsize = buffered;
            partial_fill = true;
        }
        let audio_eof = status == PullStatus::Eof && partial_fill;

        // With gapless the device is drained when it is closed instead
        let final_chunk = audio_eof && !self.config.gapless.is_enabled();

        let mut samples = buffered;
        if audio_eof || samples >= align as usize {
            samples = samples / align as usize * align as usize;
        }
        samples = samples.min(if self.paused { 0 } else { playsize });
        let played = self.write_to_device(samples, final_chunk);
        if let Some(chain) = self.chain.as_mut() {
            chain.buffer.skip(played);
        }

        self.session.drop_throttle =
            (self.session.drop_throttle - played as f64 / play_rate).max(0.0);

        self.dump_audio_stats();

        let mut next = PlaybackStatus::Playing;
        if audio_eof && playsize == 0 {
            next = PlaybackStatus::Draining;
            // Gapless reports EOF right away and lets the device play out on its own
            let drained = self.device.as_ref().map_or(true, |device| device.is_drained());
            if drained || self.config.gapless.is_enabled() {
                next = PlaybackStatus::Eof;
            }
        }
        self.set_status(next);
        if starting && next == PlaybackStatus::Playing {
            self.emit(PipelineEvent::PlaybackStarted);
        }
        if next == PlaybackStatus::Eof && !was_eof {
            debug!("audio EOF reached");
            self.emit(PipelineEvent::AudioEof);
            self.wake(Wakeup::Now);
        }
    }

    fn buffered_samples(&self) -> usize {
        self.chain.as_ref().map_or(0, |chain| chain.buffer.samples())
    }

    fn pull(&mut self, min_samples: usize) -> PullStatus {
        let mut request = PullRequest::new(min_samples, self.audio_speed);
        request.end_pts = self.play_end_pts;
        request.audio_delay = self.config.sync.audio_delay;
        let Some(chain) = self.chain.as_mut() else {
            return PullStatus::Failed;
        };
        chain.pull_and_filter(&request).unwrap_or_else(|e| {
            warn!("Audio filtering failed: {}", e);
            PullStatus::Failed
        })
    }

    /// Samples to skip (positive) or pad with silence (negative) to line the
    /// written position up with the reference clock.
    ///
    /// The flag is false while the offset cannot be known yet.
    pub(crate) fn get_sync_samples(&mut self) -> (bool, i64) {
        if self.session.status != PlaybackStatus::Syncing {
            return (true, 0);
        }
        let Some(device) = self.device.as_ref() else {
            return (true, 0);
        };
        let play_rate = device.format().rate as f64 / self.audio_speed;
        let align = device.format().sample_alignment().max(1) as i64;

        if !self.config.sync.initial_audio_sync {
            self.set_status(PlaybackStatus::Filling);
            return (true, 0);
        }

        let written_pts = self.written_pts();
        if written_pts.is_none() && self.buffered_samples() == 0 {
            // No audio read yet
            return (false, 0);
        }

        let video = self
            .video
            .clone()
            .filter(|video| !video.is_coverart && video.status != PlaybackStatus::Eof);

        let sync_pts = match video.as_ref() {
            Some(video) => {
                if video.status < PlaybackStatus::Ready {
                    return (false, 0);
                }
                video.pts.map(|pts| pts - self.config.sync.audio_delay)
            }
            None => self.hrseek_pts.or(self.playback_pts),
        };
        let Some(sync_pts) = sync_pts else {
            self.set_status(PlaybackStatus::Filling);
            return (true, 0);
        };
        let Some(written_pts) = written_pts else {
            // Missing timestamp, reset, or just broken
            warn!("Failed audio resync.");
            self.set_status(PlaybackStatus::Filling);
            return (true, 0);
        };
        let diff = (written_pts - sync_pts).clamp(-3600.0, 3600.0);

        if diff > SECOND_CHANCE_THRESHOLD && self.session.allow_second_chance_seek {
            if let Some(video) = video.filter(|video| video.separate_demuxer) {
                self.reset_audio_state();
                debug!("retrying audio seek");
                self.emit(PipelineEvent::SeekAudio { pts: video.pts });
                return (false, 0);
            }
        }
        self.session.allow_second_chance_seek = false;

        let skip = (-diff * play_rate).round() as i64 / align * align;
        (true, skip)
    }

    /// Drop (positive) or duplicate (negative) buffered samples to correct drift.
    ///
    /// Clamped to what is buffered; returns the amount applied.
    pub(crate) fn apply_drift_correction(&mut self, skip_duplicate: i64, play_rate: f64) -> i64 {
        let Some(chain) = self.chain.as_mut() else {
            return 0;
        };
        let max = chain.buffer.samples() as i64;
        let amount = skip_duplicate.clamp(-max, max);
        self.session.last_av_difference += amount as f64 / play_rate;

        let samples = amount.unsigned_abs() as usize;
        if amount >= 0 {
            chain.buffer.skip(samples);
            self.emit(PipelineEvent::DropAudio { samples });
        } else {
            chain.buffer.duplicate(samples);
            self.emit(PipelineEvent::DuplicateAudio { samples });
        }
        debug!("audio skip_duplicate={}", amount);
        amount
    }

    /// Count one underrun when the device played out everything while input is late
    fn check_underrun(&mut self) {
        if self.session.status != PlaybackStatus::Playing || self.paused || self.session.underrun {
            return;
        }
        let dry = self
            .device
            .as_ref()
            .map_or(false, |device| !device.is_untimed() && device.is_drained());
        if !dry {
            return;
        }
        if let Some(chain) = self.chain.as_mut() {
            chain.buffer.record_underrun();
            warn!(
                "Audio underrun ({} so far), {} samples buffered",
                chain.buffer.underrun_count(),
                chain.buffer.samples()
            );
        }
        self.session.underrun = true;
    }

    fn write_to_device(&mut self, samples: usize, final_chunk: bool) -> usize {
        if self.paused || samples == 0 {
            return 0;
        }
        let (Some(chain), Some(device)) = (self.chain.as_ref(), self.device.as_mut()) else {
            return 0;
        };
        let data = chain.buffer.peek(samples);
        let played = device.write(&data, final_chunk).min(samples);
        if played > 0 {
            self.session.underrun = false;
            let rate = device.format().rate as f64;
            self.session.shown_samples += played as u64;
            self.session.delay += played as f64 / (rate / self.audio_speed);
            self.session.written_audio += played as f64 / rate;
        }
        played
    }

    fn dump_audio_stats(&mut self) {
        if !log_enabled!(target: "stats", Level::Debug) {
            return;
        }
        let Some(device) = self.device.as_ref() else {
            self.session.stat_start = None;
            return;
        };
        if self.session.status != PlaybackStatus::Playing || self.paused {
            self.session.stat_start = None;
            return;
        }

        let delay = device.delay();
        let now = self.clock.now();
        let start = match self.session.stat_start {
            Some(start) => start,
            None => {
                self.session.stat_start = Some(now);
                self.session.written_audio = delay;
                now
            }
        };
        let drift = self.session.written_audio - delay - (now - start);
        self.emit(PipelineEvent::Stats { drift });
    }
}
