use std::collections::VecDeque;
use std::time::Duration;

use crate::models::{AudioFormat, AudioFrame};

/// Sample buffer sitting between the filter chain and the output device.
///
/// Holds interleaved samples in the device format. Grows as needed; the
/// synchronization logic decides how much to keep in it.
#[derive(Debug, Default)]
pub struct AudioRingBuffer {
    format: AudioFormat,
    data: VecDeque<f32>,
    underrun_count: usize,
}

impl AudioRingBuffer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            data: VecDeque::new(),
            underrun_count: 0,
        }
    }

    /// Switch to a new format, discarding buffered data
    pub fn reinit_format(&mut self, format: AudioFormat) {
        self.format = format;
        self.data.clear();
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn channels(&self) -> usize {
        self.format.channel_count().max(1)
    }

    /// Number of buffered per-channel samples
    pub fn samples(&self) -> usize {
        self.data.len() / self.channels()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the playback duration of buffered audio in seconds
    pub fn seconds(&self) -> f64 {
        self.format.samples_to_seconds(self.samples())
    }

    pub fn buffered_duration(&self) -> Duration {
        Duration::from_secs_f64(self.seconds().max(0.0))
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append the samples of a frame. The frame must already be in the buffer format.
    pub fn append(&mut self, frame: &AudioFrame) {
        debug_assert_eq!(frame.format.channel_count(), self.format.channel_count());
        self.append_interleaved(&frame.data);
    }

    /// Append raw interleaved values in the buffer format
    pub fn append_interleaved(&mut self, data: &[f32]) {
        debug_assert_eq!(data.len() % self.channels(), 0);
        self.data.extend(data.iter().copied());
    }

    /// Copy up to `samples` samples from the front without consuming them
    pub fn peek(&self, samples: usize) -> Vec<f32> {
        let values = samples.min(self.samples()) * self.channels();
        self.data.iter().take(values).copied().collect()
    }

    /// Drop up to `samples` samples from the front; returns how many were dropped
    pub fn skip(&mut self, samples: usize) -> usize {
        let samples = samples.min(self.samples());
        self.data.drain(..samples * self.channels());
        samples
    }

    /// Insert silence ahead of the buffered data
    pub fn prepend_silence(&mut self, samples: usize) {
        for _ in 0..samples * self.channels() {
            self.data.push_front(0.0);
        }
    }

    /// Append a copy of the last `samples` samples, so they play twice in a row.
    /// Clamped to what is buffered.
    pub fn duplicate(&mut self, samples: usize) {
        let samples = samples.min(self.samples());
        let start = self.data.len() - samples * self.channels();
        let tail: Vec<f32> = self.data.range(start..).copied().collect();
        self.data.extend(tail);
    }

    /// Record that the device ran dry while playing
    pub fn record_underrun(&mut self) {
        self.underrun_count += 1;
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count
    }

    /// Get buffer status information
    pub fn buffer_status(&self, target_seconds: f64) -> BufferStatus {
        BufferStatus {
            buffered_duration: self.buffered_duration(),
            available_samples: self.samples(),
            fill_level: if target_seconds > 0.0 {
                (self.seconds() / target_seconds) as f32
            } else {
                0.0
            },
            underrun_count: self.underrun_count,
        }
    }
}

/// Buffer status information
#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub buffered_duration: Duration,
    pub available_samples: usize,
    /// Buffered duration relative to the target, may exceed 1.0
    pub fill_level: f32,
    pub underrun_count: usize,
}

impl BufferStatus {
    /// Get a human-readable status description
    pub fn status_description(&self) -> String {
        if self.available_samples == 0 {
            "Buffer is empty".to_string()
        } else if self.fill_level < 0.5 {
            "Buffer needs more data".to_string()
        } else if self.fill_level > 0.8 {
            "Buffer is well-filled".to_string()
        } else {
            "Buffer is normal".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_frame(values: &[f32]) -> AudioFrame {
        AudioFrame::new(AudioFormat::pcm(1000, 2), values.to_vec(), None)
    }

    #[test]
    fn test_append_and_skip() {
        let mut buffer = AudioRingBuffer::new(AudioFormat::pcm(1000, 2));
        assert!(buffer.is_empty());

        buffer.append(&stereo_frame(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        assert_eq!(buffer.samples(), 3);
        assert!((buffer.seconds() - 0.003).abs() < 1e-9);

        assert_eq!(buffer.skip(2), 2);
        assert_eq!(buffer.peek(10), vec![5.0, 6.0]);
        assert_eq!(buffer.skip(5), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_prepend_silence() {
        let mut buffer = AudioRingBuffer::new(AudioFormat::pcm(1000, 2));
        buffer.append(&stereo_frame(&[1.0, 1.0]));
        buffer.prepend_silence(2);

        assert_eq!(buffer.samples(), 3);
        assert_eq!(buffer.peek(3), vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_duplicate_repeats_tail() {
        let mut buffer = AudioRingBuffer::new(AudioFormat::pcm(1000, 2));
        buffer.append(&stereo_frame(&[1.0, 2.0, 3.0, 4.0]));
        buffer.duplicate(1);

        assert_eq!(buffer.samples(), 3);
        assert_eq!(buffer.peek(3), vec![1.0, 2.0, 3.0, 4.0, 3.0, 4.0]);

        // Clamped to the buffered amount
        buffer.duplicate(5);
        assert_eq!(buffer.samples(), 6);
    }

    #[test]
    fn test_reinit_discards_data() {
        let mut buffer = AudioRingBuffer::new(AudioFormat::pcm(1000, 2));
        buffer.append(&stereo_frame(&[1.0, 2.0]));
        buffer.reinit_format(AudioFormat::pcm(48000, 6));

        assert!(buffer.is_empty());
        assert_eq!(buffer.format().channel_count(), 6);
    }

    #[test]
    fn test_buffer_status() {
        let mut buffer = AudioRingBuffer::new(AudioFormat::pcm(1000, 1));
        let status = buffer.buffer_status(0.1);
        assert_eq!(status.status_description(), "Buffer is empty");

        buffer.append(&AudioFrame::silence(AudioFormat::pcm(1000, 1), 90, None));
        buffer.record_underrun();
        let status = buffer.buffer_status(0.1);
        assert_eq!(status.available_samples, 90);
        assert_eq!(status.underrun_count, 1);
        assert_eq!(status.status_description(), "Buffer is well-filled");
    }
}
