/*!
Streaming linear resampler for interleaved f32 audio.

Used by the conversion stage of the filter chain. Besides plain rate conversion it
supports a playback speed factor: with speed `s` the source is consumed `s` times
faster than real time, which changes tempo and pitch together.

State is carried across `process()` calls, so chunk boundaries produce no clicks.
*/

#[derive(Debug, Clone)]
pub struct LinearResampler {
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    speed: f64,

    // Source frames consumed per output frame
    step: f64,

    // Position relative to the start of `prev_frame`
    pos: f64,
    prev_frame: Vec<f32>,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Self {
        let mut rs = Self {
            src_rate,
            dst_rate,
            channels,
            speed: 1.0,
            step: 0.0,
            pos: 0.0,
            prev_frame: Vec::new(),
        };
        rs.update_step();
        rs
    }

    fn update_step(&mut self) {
        self.step = if self.dst_rate == 0 {
            0.0
        } else {
            self.src_rate as f64 / self.dst_rate as f64 * self.speed
        };
    }

    /// Reset the streaming state (phase and history).
    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev_frame.clear();
    }

    /// Change the playback speed factor. Keeps the streaming phase.
    pub fn set_speed(&mut self, speed: f64) {
        if speed > 0.0 && speed.is_finite() {
            self.speed = speed;
            self.update_step();
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Check if the resampler would alter the signal at all
    pub fn is_identity(&self) -> bool {
        self.src_rate == self.dst_rate && self.speed == 1.0
    }

    /// Latency introduced by the retained history, in seconds of output
    pub fn delay(&self) -> f64 {
        if self.prev_frame.is_empty() || self.src_rate == 0 {
            0.0
        } else {
            (1.0 - self.pos).max(0.0) / self.src_rate as f64 / self.speed
        }
    }

    /// Resample interleaved samples, preserving state across calls.
    ///
    /// `input.len()` must be a multiple of the channel count.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.channels == 0 || self.step <= 0.0 {
            return Vec::new();
        }

        let ch = self.channels;
        let in_frames = input.len() / ch;

        // Working buffer is [prev_frame, input...] so interpolation spans chunk boundaries
        let mut work = Vec::with_capacity((in_frames + 1) * ch);
        if self.prev_frame.len() == ch {
            work.extend_from_slice(&self.prev_frame);
        } else if in_frames == 0 {
            return Vec::new();
        }
        work.extend_from_slice(&input[..in_frames * ch]);

        let total_frames = work.len() / ch;
        let expected_out_frames = (in_frames as f64 / self.step).ceil() as usize + 4;
        let mut out = Vec::with_capacity(expected_out_frames * ch);

        while self.pos < (total_frames - 1) as f64 {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            let base0 = i * ch;
            let base1 = (i + 1) * ch;

            out.extend((0..ch).map(|c| {
                let s0 = work[base0 + c];
                let s1 = work[base1 + c];
                s0 + (s1 - s0) * frac
            }));

            self.pos += self.step;
        }

        // The last frame becomes index 0 of the next call
        let last_base = (total_frames - 1) * ch;
        self.prev_frame.clear();
        self.prev_frame.extend_from_slice(&work[last_base..last_base + ch]);
        self.pos -= (total_frames - 1) as f64;

        out
    }

    /// Emit the retained final frame at end of stream
    pub fn flush(&mut self) -> Vec<f32> {
        let out = if self.prev_frame.len() == self.channels && self.pos < 1.0 {
            self.prev_frame.clone()
        } else {
            Vec::new()
        };
        self.reset();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    fn sine(freq: f32, rate: u32, frames: usize, channels: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|n| {
                let v = (2.0 * std::f32::consts::PI * freq * n as f32 / rate as f32).sin();
                std::iter::repeat(v).take(channels)
            })
            .collect()
    }

    #[test]
    fn test_cd_rate_to_dvd_rate_length() {
        // 100ms of mono audio
        let input = sine(1000.0, 44_100, 4410, 1);
        let mut rs = LinearResampler::new(44_100, 48_000, 1);
        let out = rs.process(&input);
        let out = out.len() + rs.flush().len();

        assert!((out as isize - 4800).abs() <= 2, "got {}", out);
    }

    #[test]
    fn test_decoder_sized_chunks_match_single_pass() {
        let channels = 2;
        let frames = 44_100;
        let input = sine(440.0, 44_100, frames, channels);

        let mut whole = LinearResampler::new(44_100, 48_000, channels);
        let expected = whole.process(&input);

        // 20ms decoder frames
        let mut chunked = LinearResampler::new(44_100, 48_000, channels);
        let actual: Vec<f32> = input
            .chunks(882 * channels)
            .flat_map(|chunk| chunked.process(chunk))
            .collect();

        assert!((expected.len() as isize - actual.len() as isize).abs() <= 2 * channels as isize);
        let common = min(expected.len(), actual.len());
        for k in (0..common).step_by(997) {
            assert!((expected[k] - actual[k]).abs() < 1e-3, "mismatch at {}", k);
        }
    }

    #[test]
    fn test_speed_factor_shortens_output() {
        let input = sine(440.0, 48_000, 4800, 1);
        let mut rs = LinearResampler::new(48_000, 48_000, 1);
        rs.set_speed(2.0);
        assert!(!rs.is_identity());

        let out = rs.process(&input);
        assert!((out.len() as isize - 2400).abs() <= 2, "got {}", out.len());
    }

    #[test]
    fn test_delay_scales_with_speed() {
        let mut rs = LinearResampler::new(48_000, 48_000, 1);
        rs.set_speed(1.5);
        // 480 frames of span is a whole number of steps, so the last frame is held
        rs.process(&sine(440.0, 48_000, 481, 1));
        assert!((rs.delay() - 1.0 / 48_000.0 / 1.5).abs() < 1e-12);

        rs.set_speed(3.0);
        assert!((rs.delay() - 1.0 / 48_000.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_speed_is_ignored() {
        let mut rs = LinearResampler::new(48_000, 48_000, 2);
        rs.set_speed(0.0);
        rs.set_speed(f64::NAN);
        assert_eq!(rs.speed(), 1.0);
        assert!(rs.is_identity());
    }

    #[test]
    fn test_flush_returns_tail_and_resets() {
        let mut rs = LinearResampler::new(48_000, 48_000, 2);
        let out = rs.process(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let tail = rs.flush();

        assert_eq!(out.len() + tail.len(), 6);
        assert_eq!(rs.delay(), 0.0);
    }
}
