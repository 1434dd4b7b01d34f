//! Decode bridge: pulls raw frames from an upstream source one at a time.
//!
//! The bridge holds at most one decoded frame that has not been handed to the
//! filter chain yet, and remembers the format of the last frame it saw so the
//! chain can detect format changes.

use log::{error, trace};

use crate::error::DecodeError;
use crate::models::{AudioFormat, AudioFrame};

/// Answer of a frame source to a frame request
#[derive(Debug, Clone, PartialEq)]
pub enum SourceStatus {
    Frame(AudioFrame),
    /// Nothing available yet; the source will wake the scheduler
    Wait,
    /// Made internal progress, ask again right away
    Again,
    /// Upstream has no data buffered (network or demuxer underrun)
    Starved,
    Eof,
}

/// Loudness normalization values carried by a track, in dB and linear peak
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayGainData {
    pub track_gain: f32,
    pub track_peak: f32,
    pub album_gain: f32,
    pub album_peak: f32,
}

impl Default for ReplayGainData {
    fn default() -> Self {
        Self {
            track_gain: 0.0,
            track_peak: 1.0,
            album_gain: 0.0,
            album_peak: 1.0,
        }
    }
}

/// Upstream producer of decoded frames
pub trait FrameSource: Send {
    fn request_frame(&mut self) -> Result<SourceStatus, DecodeError>;

    /// Drop decoder state after a seek
    fn reset(&mut self);

    fn replaygain(&self) -> Option<ReplayGainData> {
        None
    }

    /// Jump to a position in seconds; the next frame starts at or before it
    fn seek(&mut self, _seconds: f64) -> Result<(), DecodeError> {
        Err(DecodeError::SeekError("source is not seekable".to_string()))
    }

    /// Switch between compressed passthrough output and PCM decoding
    fn reinit_codec(&mut self, _passthrough: bool) -> Result<(), DecodeError> {
        Ok(())
    }

    /// Short description for log messages
    fn describe(&self) -> String {
        "source".to_string()
    }
}

/// Outcome of one decode attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A frame is waiting in the bridge
    Ok,
    Wait,
    NoProgress,
    Starved,
    Eof,
}

pub struct DecodeBridge {
    source: Option<Box<dyn FrameSource>>,
    input_frame: Option<AudioFrame>,
    input_format: AudioFormat,
}

impl std::fmt::Debug for DecodeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeBridge")
            .field("source", &self.source.as_ref().map(|s| s.describe()))
            .field("input_frame", &self.input_frame.as_ref().map(|f| f.sample_count()))
            .field("input_format", &self.input_format)
            .finish()
    }
}

impl DecodeBridge {
    /// Bridge over a source; `None` makes a blank bridge that is always at EOF
    pub fn new(source: Option<Box<dyn FrameSource>>) -> Self {
        Self {
            source,
            input_frame: None,
            input_format: AudioFormat::unset(),
        }
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn source_mut(&mut self) -> Option<&mut (dyn FrameSource + 'static)> {
        self.source.as_deref_mut()
    }

    /// Format of the most recently decoded frame
    pub fn input_format(&self) -> &AudioFormat {
        &self.input_format
    }

    pub fn clear_input_format(&mut self) {
        self.input_format = AudioFormat::unset();
    }

    pub fn has_frame(&self) -> bool {
        self.input_frame.is_some()
    }

    pub fn pending_frame(&self) -> Option<&AudioFrame> {
        self.input_frame.as_ref()
    }

    pub fn take_frame(&mut self) -> Option<AudioFrame> {
        self.input_frame.take()
    }

    /// Make sure a decoded frame is waiting, requesting one from the source if needed
    pub fn decode_new_frame(&mut self) -> DecodeStatus {
        if self.input_frame.is_some() {
            return DecodeStatus::Ok;
        }
        let Some(source) = self.source.as_mut() else {
            return DecodeStatus::Eof;
        };

        match source.request_frame() {
            Ok(SourceStatus::Frame(frame)) => {
                if !frame.format.is_valid() {
                    error!("Decoder produced an invalid audio format: {}", frame.format);
                    return DecodeStatus::Eof;
                }
                trace!("decoded {} samples at {:?}", frame.sample_count(), frame.pts);
                self.input_format = frame.format.clone();
                self.input_frame = Some(frame);
                DecodeStatus::Ok
            }
            Ok(SourceStatus::Wait) => DecodeStatus::Wait,
            Ok(SourceStatus::Again) => DecodeStatus::NoProgress,
            Ok(SourceStatus::Starved) => DecodeStatus::Starved,
            Ok(SourceStatus::Eof) => DecodeStatus::Eof,
            Err(e) => {
                error!("Error decoding audio: {}", e);
                DecodeStatus::Eof
            }
        }
    }

    /// Forget the pending frame and reset the source
    pub fn reset(&mut self) {
        self.input_frame = None;
        if let Some(source) = self.source.as_mut() {
            source.reset();
        }
    }
}

#[derive(Debug, Clone)]
struct ToneSegment {
    format: AudioFormat,
    samples: usize,
}

/// Synthetic source producing a sine tone in fixed-size frames.
///
/// Several segments with different formats can be chained to simulate a stream
/// whose format changes midway.
#[derive(Debug, Clone)]
pub struct ToneSource {
    segments: Vec<ToneSegment>,
    frequency: f32,
    frame_seconds: f64,
    start_pts: Option<f64>,
    segment: usize,
    position: usize,
    pts: Option<f64>,
    phase: f64,
    replaygain: Option<ReplayGainData>,
}

impl ToneSource {
    pub fn new(format: AudioFormat, frequency: f32, seconds: f64) -> Self {
        let samples = (seconds * format.rate as f64).round() as usize;
        Self {
            segments: vec![ToneSegment { format, samples }],
            frequency,
            frame_seconds: 0.02,
            start_pts: Some(0.0),
            segment: 0,
            position: 0,
            pts: Some(0.0),
            phase: 0.0,
            replaygain: None,
        }
    }

    /// Continue the stream in another format
    pub fn then(mut self, format: AudioFormat, seconds: f64) -> Self {
        let samples = (seconds * format.rate as f64).round() as usize;
        self.segments.push(ToneSegment { format, samples });
        self
    }

    pub fn with_frame_duration(mut self, seconds: f64) -> Self {
        self.frame_seconds = seconds.max(0.001);
        self
    }

    /// First frame timestamp; `None` produces frames without timestamps
    pub fn with_start_pts(mut self, pts: Option<f64>) -> Self {
        self.start_pts = pts;
        self.pts = pts;
        self
    }

    pub fn with_replaygain(mut self, data: ReplayGainData) -> Self {
        self.replaygain = Some(data);
        self
    }

    /// Total number of samples over all segments
    pub fn total_samples(&self) -> usize {
        self.segments.iter().map(|s| s.samples).sum()
    }
}

impl FrameSource for ToneSource {
    fn request_frame(&mut self) -> Result<SourceStatus, DecodeError> {
        while let Some(segment) = self.segments.get(self.segment) {
            if self.position >= segment.samples {
                self.segment += 1;
                self.position = 0;
                continue;
            }

            let format = segment.format.clone();
            let per_frame = ((self.frame_seconds * format.rate as f64).round() as usize).max(1);
            let count = per_frame.min(segment.samples - self.position);
            let channels = format.channel_count();
            let step = self.frequency as f64 / format.rate as f64;

            let mut data = Vec::with_capacity(count * channels);
            for _ in 0..count {
                let value = (self.phase * std::f64::consts::TAU).sin() as f32 * 0.5;
                self.phase = (self.phase + step).fract();
                data.extend(std::iter::repeat(value).take(channels));
            }

            let frame = AudioFrame::new(format, data, self.pts);
            self.pts = frame.end_pts();
            self.position += count;
            return Ok(SourceStatus::Frame(frame));
        }
        Ok(SourceStatus::Eof)
    }

    fn reset(&mut self) {
        self.segment = 0;
        self.position = 0;
        self.phase = 0.0;
        self.pts = self.start_pts;
    }

    fn seek(&mut self, seconds: f64) -> Result<(), DecodeError> {
        self.reset();
        let start = self.start_pts.unwrap_or(0.0);
        let mut remaining = (seconds - start).max(0.0);
        while let Some(segment) = self.segments.get(self.segment) {
            let length = segment.samples as f64 / segment.format.rate as f64;
            if remaining < length {
                self.position = (remaining * segment.format.rate as f64) as usize;
                remaining -= self.position as f64 / segment.format.rate as f64;
                break;
            }
            remaining -= length;
            self.segment += 1;
        }
        self.pts = self.start_pts.map(|_| seconds.max(start) - remaining);
        Ok(())
    }

    fn replaygain(&self) -> Option<ReplayGainData> {
        self.replaygain
    }

    fn describe(&self) -> String {
        format!("tone {}Hz", self.frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn request_frame(&mut self) -> Result<SourceStatus, DecodeError> {
            Err(DecodeError::CorruptedFile("truncated packet".to_string()))
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_tone_source_frames() {
        let mut source = ToneSource::new(AudioFormat::pcm(48000, 2), 440.0, 0.05);
        let mut frames = Vec::new();
        while let SourceStatus::Frame(frame) = source.request_frame().unwrap() {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].sample_count(), 960);
        assert_eq!(frames[2].sample_count(), 480);
        assert!((frames[1].pts.unwrap() - 0.02).abs() < 1e-9);
        assert_eq!(source.request_frame().unwrap(), SourceStatus::Eof);
    }

    #[test]
    fn test_tone_source_format_change() {
        let mut source = ToneSource::new(AudioFormat::pcm(48000, 2), 440.0, 0.02)
            .then(AudioFormat::pcm(48000, 6), 0.02);
        assert_eq!(source.total_samples(), 1920);

        let formats: Vec<usize> = std::iter::from_fn(|| match source.request_frame() {
            Ok(SourceStatus::Frame(frame)) => Some(frame.format.channel_count()),
            _ => None,
        })
        .collect();
        assert_eq!(formats, vec![2, 6]);
    }

    #[test]
    fn test_tone_source_seek() {
        let mut source = ToneSource::new(AudioFormat::pcm(1000, 1), 10.0, 1.0)
            .then(AudioFormat::pcm(2000, 1), 1.0)
            .with_frame_duration(0.1);

        source.seek(1.25).unwrap();
        match source.request_frame().unwrap() {
            SourceStatus::Frame(frame) => {
                assert_eq!(frame.format.rate, 2000);
                assert!((frame.pts.unwrap() - 1.25).abs() < 1e-9);
            }
            other => panic!("unexpected: {:?}", other),
        }

        source.seek(5.0).unwrap();
        assert_eq!(source.request_frame().unwrap(), SourceStatus::Eof);
    }

    #[test]
    fn test_bridge_keeps_one_frame() {
        let source = ToneSource::new(AudioFormat::pcm(48000, 1), 440.0, 0.04);
        let mut bridge = DecodeBridge::new(Some(Box::new(source)));

        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Ok);
        let first = bridge.pending_frame().cloned();
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Ok);
        assert_eq!(bridge.pending_frame().cloned(), first);
        assert_eq!(bridge.input_format(), &AudioFormat::pcm(48000, 1));

        bridge.take_frame();
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Ok);
        bridge.take_frame();
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Eof);
    }

    #[test]
    fn test_bridge_reset_rewinds_source() {
        let source = ToneSource::new(AudioFormat::pcm(48000, 1), 440.0, 0.02);
        let mut bridge = DecodeBridge::new(Some(Box::new(source)));
        bridge.decode_new_frame();
        bridge.take_frame();
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Eof);

        bridge.reset();
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Ok);
        assert_eq!(bridge.pending_frame().and_then(|f| f.pts), Some(0.0));
    }

    #[test]
    fn test_decode_errors_end_the_stream() {
        let mut bridge = DecodeBridge::new(Some(Box::new(FailingSource)));
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Eof);
        assert!(!bridge.has_frame());
    }

    #[test]
    fn test_blank_bridge_is_at_eof() {
        let mut bridge = DecodeBridge::new(None);
        assert!(!bridge.has_source());
        assert_eq!(bridge.decode_new_frame(), DecodeStatus::Eof);
    }
}
