//! End-to-end runs of the player against null devices and a manual clock.

mod scenarios;

use crate::audio::{AudioPlayer, DeviceCapabilities, ManualClock, NullDeviceHandle, NullOpener, Wakeup};
use crate::config::PipelineConfig;
use crate::logging::PipelineEvent;
use crate::models::PlaybackStatus;

const MAX_TICKS: usize = 500;

struct Harness {
    player: AudioPlayer,
    device: NullDeviceHandle,
    clock: ManualClock,
    events: Vec<PipelineEvent>,
}

impl Harness {
    fn new(config: PipelineConfig, capabilities: DeviceCapabilities) -> Self {
        let opener = NullOpener::new(capabilities);
        let device = opener.handle();
        let clock = ManualClock::new();
        let player = AudioPlayer::with_clock(config, Box::new(opener), Box::new(clock.clone()));
        Self {
            player,
            device,
            clock,
            events: Vec::new(),
        }
    }

    fn tick(&mut self) -> Option<Wakeup> {
        let wakeup = self.player.advance();
        self.events.extend(self.player.take_events());
        wakeup
    }

    /// Let the device play `samples` and the clock move accordingly, then tick
    fn play_and_tick(&mut self, samples: usize) -> Option<Wakeup> {
        self.device.play(samples);
        if let Some(rate) = self.player.device().map(|d| d.format().rate) {
            self.clock.advance(samples as f64 / rate as f64);
        }
        self.tick()
    }

    fn run_until(&mut self, status: PlaybackStatus, per_tick: usize) {
        for _ in 0..MAX_TICKS {
            if self.player.status() == status {
                return;
            }
            self.play_and_tick(per_tick);
        }
        assert_eq!(self.player.status(), status, "status never reached");
    }

    /// Tick until the player reports the end of the audio
    fn run_to_eof(&mut self, per_tick: usize) {
        for _ in 0..MAX_TICKS {
            if self.saw(|e| matches!(e, PipelineEvent::AudioEof)) {
                return;
            }
            self.play_and_tick(per_tick);
        }
        panic!("no AudioEof after {} ticks: {:?}", MAX_TICKS, self.player.status());
    }

    fn saw(&self, pred: impl Fn(&PipelineEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }

    fn count(&self, pred: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    /// Every status the player moved to, in order
    fn statuses(&self) -> Vec<PlaybackStatus> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StatusChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn buffered(&self) -> usize {
        self.player.chain().map_or(0, |c| c.buffer.samples())
    }
}
