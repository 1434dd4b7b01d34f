use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::Harness;
use crate::audio::{
    DeviceCapabilities, FrameSource, OutputChain, PullRequest, PullStatus, SourceStatus, ToneSource,
    VideoReference,
};
use crate::config::{GaplessMode, PipelineConfig};
use crate::error::DecodeError;
use crate::logging::PipelineEvent;
use crate::models::{AudioFormat, ChannelLayout, PlaybackStatus, SampleEncoding};

fn stereo(rate: u32) -> AudioFormat {
    AudioFormat::pcm(rate, 2)
}

fn pinned(format: AudioFormat) -> DeviceCapabilities {
    DeviceCapabilities::pinned(format)
}

/// Hands out frames only while it has budget, then reports upstream starvation
struct StallingSource {
    inner: ToneSource,
    budget: Arc<AtomicUsize>,
}

impl FrameSource for StallingSource {
    fn request_frame(&mut self) -> Result<SourceStatus, DecodeError> {
        if self.budget.load(Ordering::SeqCst) == 0 {
            return Ok(SourceStatus::Starved);
        }
        let status = self.inner.request_frame()?;
        if matches!(status, SourceStatus::Frame(_)) {
            self.budget.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(status)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[test]
fn test_matching_formats_play_to_eof() {
    let mut h = Harness::new(PipelineConfig::default(), pinned(stereo(48000)));
    let source = ToneSource::new(stereo(48000), 440.0, 1.0);
    let total = source.total_samples();
    h.player.load(Box::new(source));

    h.run_to_eof(4800);

    assert_eq!(
        h.statuses(),
        vec![
            PlaybackStatus::Syncing,
            PlaybackStatus::Filling,
            PlaybackStatus::Ready,
            PlaybackStatus::Playing,
            PlaybackStatus::Eof,
        ]
    );
    assert_eq!(h.count(|e| matches!(e, PipelineEvent::PlaybackStarted)), 1);
    assert_eq!(h.player.chain().unwrap().graph.auto_inserted_count(), 0);

    let align = stereo(48000).sample_alignment() as i64;
    let written = h.device.stats().written_samples as i64;
    assert!((written - total as i64).abs() <= align, "wrote {} of {}", written, total);
    assert_eq!(h.player.session().shown_samples, written as u64);

    // Gapless: the device is only drained when it is closed
    assert_eq!(h.device.stats().drains, 0);
    assert_eq!(h.device.stats().final_chunks, 0);
    h.player.set_end_of_file(true);
    h.player.uninit_audio_chain();
    h.player.uninit_audio_out();
    assert_eq!(h.device.stats().drains, 1);
}

#[test]
fn test_gapless_off_marks_final_chunk() {
    let mut config = PipelineConfig::default();
    config.gapless = GaplessMode::Off;
    let mut h = Harness::new(config, pinned(stereo(48000)));
    h.player.load(Box::new(ToneSource::new(stereo(48000), 440.0, 0.5)));

    h.run_to_eof(usize::MAX);

    assert_eq!(h.device.stats().final_chunks, 1);
    assert_eq!(h.device.stats().written_samples, 24000);
    assert_eq!(h.player.status(), PlaybackStatus::Eof);
}

#[test]
fn test_rate_mismatch_resamples_to_device_rate() {
    let mut h = Harness::new(PipelineConfig::default(), pinned(stereo(48000)));
    h.player.load(Box::new(ToneSource::new(stereo(44100), 440.0, 1.0)));

    h.run_to_eof(4800);

    let graph = &h.player.chain().unwrap().graph;
    assert_eq!(graph.auto_inserted_count(), 1);
    assert_eq!(graph.output_format().rate, 48000);
    let stages = graph.stages();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].fmt_in.rate, 44100);
    assert_eq!(stages[0].fmt_out.rate, 48000);

    // One second of input is one second at the device rate
    let written = h.device.stats().written_samples as i64;
    assert!((written - 48000).abs() <= 4, "wrote {}", written);
}

#[test]
fn test_audio_ahead_of_video_is_padded_with_silence() {
    let mut config = PipelineConfig::default();
    config.device.buffer_seconds = 1.0;
    let caps = DeviceCapabilities {
        buffer_seconds: 1.0,
        ..pinned(stereo(48000))
    };
    let mut h = Harness::new(config, caps);
    h.player
        .set_video(Some(VideoReference::new(PlaybackStatus::Ready, Some(0.0))));
    h.player.load(Box::new(
        ToneSource::new(stereo(48000), 440.0, 2.0).with_start_pts(Some(0.5)),
    ));

    // Open, then one pull to learn the timestamps
    h.tick();
    h.tick();
    assert_eq!(h.player.status(), PlaybackStatus::Syncing);
    assert_eq!(h.buffered(), 48000);

    let (known, skip) = h.player.get_sync_samples();
    assert!(known);
    assert_eq!(skip, -24000);

    h.tick();
    assert_eq!(h.player.status(), PlaybackStatus::Filling);
    assert_eq!(h.buffered(), 72000);
    let silence = h.player.chain().unwrap().buffer.peek(24000);
    assert!(silence.iter().all(|v| *v == 0.0));

    // Audio waits for video to start
    h.tick();
    h.tick();
    assert_eq!(h.player.status(), PlaybackStatus::Ready);
    assert_eq!(h.device.stats().written_samples, 0);

    h.player.video_mut().unwrap().status = PlaybackStatus::Playing;
    h.tick();
    assert_eq!(h.player.status(), PlaybackStatus::Playing);
    assert_eq!(h.device.stats().written_samples, 48000);
    assert!(h.saw(|e| matches!(e, PipelineEvent::PlaybackStarted)));
}

#[test]
fn test_audio_behind_video_is_skipped() {
    let caps = DeviceCapabilities {
        buffer_seconds: 1.0,
        ..pinned(stereo(48000))
    };
    let mut h = Harness::new(PipelineConfig::default(), caps);
    h.player
        .set_video(Some(VideoReference::new(PlaybackStatus::Ready, Some(0.25))));
    h.player.load(Box::new(ToneSource::new(stereo(48000), 440.0, 2.0)));

    h.tick();
    h.tick();
    assert_eq!(h.player.get_sync_samples(), (true, 12000));

    h.tick();
    assert_eq!(h.player.status(), PlaybackStatus::Filling);
    assert_eq!(h.buffered(), 36000);
    let written_pts = h.player.written_pts().unwrap();
    assert!((written_pts - 0.25).abs() < 1e-9);
}

#[test]
fn test_coverart_does_not_hold_audio() {
    let mut h = Harness::new(PipelineConfig::default(), pinned(stereo(48000)));
    let mut video = VideoReference::new(PlaybackStatus::Ready, Some(0.0));
    video.is_coverart = true;
    h.player.set_video(Some(video));
    h.player.load(Box::new(ToneSource::new(stereo(48000), 440.0, 1.0)));

    h.run_until(PlaybackStatus::Playing, 0);
    assert!(h.device.stats().written_samples > 0);
}

#[test]
fn test_channel_change_is_renegotiated_once() {
    let source = ToneSource::new(stereo(48000), 440.0, 0.1).then(AudioFormat::pcm(48000, 6), 0.1);
    let mut chain = OutputChain::new(Some(Box::new(source)), Vec::new());
    chain.decode.decode_new_frame();
    chain
        .graph
        .initialize(stereo(48000), stereo(48000))
        .unwrap();
    chain.set_device_format(stereo(48000));

    let request = PullRequest::new(48000, 1.0);
    let mut new_format = 0;
    let mut pulls = 0;
    let status = loop {
        pulls += 1;
        assert!(pulls < 10);
        match chain.pull_and_filter(&request).unwrap() {
            PullStatus::NewFormat => {
                new_format += 1;
                // Only the old format made it into the buffer
                assert_eq!(chain.buffer.samples(), 4800);
                assert_eq!(chain.buffer.format().channel_count(), 2);

                let input = chain.decode.input_format().clone();
                assert_eq!(input.channel_count(), 6);
                let device = AudioFormat::pcm(48000, 6);
                chain.graph.initialize(input, device.clone()).unwrap();
                chain.set_device_format(device);
            }
            status => break status,
        }
    };

    assert_eq!(new_format, 1);
    assert_eq!(status, PullStatus::Eof);
    assert_eq!(chain.graph.input_format().channel_count(), 6);
    assert_eq!(chain.buffer.samples(), 4800);
    assert_eq!(chain.buffer.format().channel_count(), 6);
}

#[test]
fn test_weak_gapless_reopens_device_on_channel_change() {
    let mut h = Harness::new(PipelineConfig::default(), DeviceCapabilities::default());
    h.player.load(Box::new(
        ToneSource::new(stereo(48000), 440.0, 0.1).then(AudioFormat::pcm(48000, 6), 0.1),
    ));

    h.run_to_eof(usize::MAX);

    let stats = h.device.stats();
    assert_eq!(stats.opens, 2);
    assert_eq!(stats.last_format.map(|f| f.channel_count()), Some(6));
    assert_eq!(h.count(|e| matches!(e, PipelineEvent::FormatChanged { .. })), 2);
    assert_eq!(h.count(|e| matches!(e, PipelineEvent::DeviceClosed)), 1);
    assert!(stats.written_samples >= 4800 && stats.written_samples <= 9600);
    assert_eq!(h.player.chain().unwrap().graph.auto_inserted_count(), 0);
}

#[test]
fn test_strict_gapless_converts_channel_change() {
    let mut config = PipelineConfig::default();
    config.gapless = GaplessMode::Strict;
    let mut h = Harness::new(config, DeviceCapabilities::default());
    h.player.load(Box::new(
        ToneSource::new(stereo(48000), 440.0, 0.1).then(AudioFormat::pcm(48000, 6), 0.1),
    ));

    h.run_to_eof(usize::MAX);

    let stats = h.device.stats();
    assert_eq!(stats.opens, 1);
    assert_eq!(stats.last_format.map(|f| f.channel_count()), Some(2));
    assert_eq!(stats.written_samples, 9600);
    assert!(!h.saw(|e| matches!(e, PipelineEvent::DeviceClosed)));

    let graph = &h.player.chain().unwrap().graph;
    assert_eq!(graph.auto_inserted_count(), 1);
    assert_eq!(graph.input_format().channel_count(), 6);
}

#[test]
fn test_passthrough_plays_whole_aligned_units() {
    let spdif = AudioFormat::new(48000, SampleEncoding::SpdifAc3, ChannelLayout::stereo());
    let align = spdif.sample_alignment();
    let mut config = PipelineConfig::default();
    config.device.passthrough = true;
    let caps = DeviceCapabilities {
        supports_passthrough: true,
        ..DeviceCapabilities::default()
    };
    let mut h = Harness::new(config, caps);
    // 30 whole bursts
    let source = ToneSource::new(spdif.clone(), 440.0, 0.96);
    let total = source.total_samples();
    assert_eq!(total, 30 * align);
    h.player.load(Box::new(source));

    h.run_to_eof(4800);

    assert_eq!(h.device.stats().last_format, Some(spdif));
    assert_eq!(h.player.chain().unwrap().graph.auto_inserted_count(), 0);
    assert!(h.player.chain().unwrap().graph.stages().is_empty());

    let written = h.device.stats().written_samples;
    assert_eq!(written % align, 0);
    assert!(total - written < align);
}

#[test]
fn test_end_position_stops_output() {
    let mut h = Harness::new(PipelineConfig::default(), pinned(stereo(48000)));
    h.player.load(Box::new(ToneSource::new(stereo(48000), 440.0, 1.0)));
    h.player.set_play_end(Some(0.5));

    h.run_to_eof(4800);

    let written = h.device.stats().written_samples as i64;
    assert!((written - 24000).abs() <= 1, "wrote {}", written);
}

#[test]
fn test_speed_change_while_playing() {
    let mut h = Harness::new(PipelineConfig::default(), pinned(stereo(48000)));
    h.player.load(Box::new(ToneSource::new(stereo(48000), 440.0, 2.0)));
    h.run_until(PlaybackStatus::Playing, 4800);

    h.player.set_speed(2.0).unwrap();
    assert_eq!(h.player.audio_speed(), 2.0);
    let stages = h.player.chain().unwrap().graph.stages();
    assert!(stages.iter().any(|s| s.label.as_deref() == Some("playback-speed")));

    h.run_to_eof(4800);

    // Two seconds at double speed take about one second of device time
    let written = h.device.stats().written_samples as i64;
    assert!(written < 2 * 48000);
    assert!(!h.saw(|e| matches!(e, PipelineEvent::SpeedReset)));
}

#[test]
fn test_starved_source_counts_one_underrun_per_stall() {
    let mut h = Harness::new(PipelineConfig::default(), pinned(stereo(48000)));
    let budget = Arc::new(AtomicUsize::new(15));
    h.player.load(Box::new(StallingSource {
        inner: ToneSource::new(stereo(48000), 440.0, 1.0),
        budget: budget.clone(),
    }));
    h.run_until(PlaybackStatus::Playing, 4800);
    let underruns = |h: &Harness| h.player.chain().unwrap().buffer.underrun_count();

    for _ in 0..5 {
        h.play_and_tick(usize::MAX);
    }
    assert_eq!(h.player.status(), PlaybackStatus::Playing);
    assert_eq!(underruns(&h), 1);
    assert!(h.player.session().underrun);

    // Data flows again, then runs out a second time
    budget.store(10, Ordering::SeqCst);
    for _ in 0..5 {
        h.play_and_tick(usize::MAX);
    }
    assert_eq!(underruns(&h), 2);

    let status = h.player.chain().unwrap().buffer.buffer_status(0.2);
    assert_eq!(status.underrun_count, 2);
}
