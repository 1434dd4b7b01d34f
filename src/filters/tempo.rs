use log::trace;
use std::collections::VecDeque;

use super::{check_known_args, parse_arg, Control, ControlReply, Negotiation, Stage, StageArgs};
use crate::error::FilterError;
use crate::models::{AudioFormat, AudioFrame, SampleEncoding};

const DEFAULT_STRIDE_MS: f64 = 60.0;
const DEFAULT_OVERLAP: f64 = 0.2;

/// Tempo change without pitch change, by overlap-add of fixed-size segments.
///
/// Each step emits `stride` samples and advances the input by `stride * speed`. The
/// start of every segment is crossfaded with the natural continuation of the previous
/// one to hide the seam.
#[derive(Debug)]
pub struct ScaleTempoStage {
    stride_ms: f64,
    overlap: f64,
    speed: f64,
    format: AudioFormat,
    stride: usize,
    overlap_len: usize,
    pending: Vec<f32>,
    tail: Vec<f32>,
    // Fractional input position carried between steps
    carry: f64,
    // Input samples still to be dropped when the speed jumps past buffered data
    skip: usize,
}

impl ScaleTempoStage {
    pub fn from_args(args: &StageArgs) -> Result<Self, FilterError> {
        check_known_args("scaletempo", args, &["stride", "overlap"])?;
        let stride_ms = parse_arg::<f64>("scaletempo", args, "stride")?.unwrap_or(DEFAULT_STRIDE_MS);
        let overlap = parse_arg::<f64>("scaletempo", args, "overlap")?.unwrap_or(DEFAULT_OVERLAP);

        if !(stride_ms > 0.0 && stride_ms.is_finite()) {
            return Err(FilterError::InvalidArgument {
                filter: "scaletempo".to_string(),
                key: "stride".to_string(),
                value: stride_ms.to_string(),
            });
        }
        if !(0.0..1.0).contains(&overlap) {
            return Err(FilterError::InvalidArgument {
                filter: "scaletempo".to_string(),
                key: "overlap".to_string(),
                value: overlap.to_string(),
            });
        }

        Ok(Self {
            stride_ms,
            overlap,
            speed: 1.0,
            format: AudioFormat::unset(),
            stride: 0,
            overlap_len: 0,
            pending: Vec::new(),
            tail: Vec::new(),
            carry: 0.0,
            skip: 0,
        })
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    fn channels(&self) -> usize {
        self.format.channel_count().max(1)
    }

    fn pending_samples(&self) -> usize {
        self.pending.len() / self.channels()
    }

    /// Input seconds received but not yet stepped over; negative while skipping ahead
    fn backlog(&self) -> f64 {
        if self.format.rate == 0 {
            return 0.0;
        }
        (self.pending_samples() as f64 - self.skip as f64) / self.format.rate as f64
    }

    fn has_state(&self) -> bool {
        !self.pending.is_empty() || !self.tail.is_empty() || self.skip > 0
    }

    fn clear_state(&mut self) {
        self.pending.clear();
        self.tail.clear();
        self.carry = 0.0;
        self.skip = 0;
    }

    fn crossfade(&self, from: &[f32], to: &[f32], out: &mut Vec<f32>) {
        let ch = self.channels();
        let len = from.len().min(to.len()) / ch;
        for k in 0..len {
            let w = (k as f32 + 0.5) / len as f32;
            for c in 0..ch {
                let i = k * ch + c;
                out.push(from[i] * (1.0 - w) + to[i] * w);
            }
        }
    }

    fn consume_skip(&mut self) {
        if self.skip == 0 {
            return;
        }
        let dropped = self.skip.min(self.pending_samples());
        self.pending.drain(..dropped * self.channels());
        self.skip -= dropped;
    }

    /// Run as many overlap-add steps as the pending input allows
    fn process(&mut self) -> Vec<f32> {
        let ch = self.channels();
        let need = (self.stride + self.overlap_len) * ch;
        let mut out = Vec::new();

        self.consume_skip();
        while self.stride > 0 && self.pending.len() >= need {
            let head = self.overlap_len * ch;
            let body_end = self.stride * ch;
            if self.tail.is_empty() {
                out.extend_from_slice(&self.pending[..head]);
            } else {
                self.crossfade(&self.tail, &self.pending[..head], &mut out);
            }
            out.extend_from_slice(&self.pending[head..body_end]);
            self.tail = self.pending[body_end..need].to_vec();

            self.carry += self.stride as f64 * self.speed;
            let advance = self.carry.floor() as usize;
            self.carry -= advance as f64;
            let available = self.pending_samples();
            self.pending.drain(..advance.min(available) * ch);
            self.skip = advance.saturating_sub(available);
        }
        out
    }

    /// Emit everything held back, ending the current seam
    fn drain_state(&mut self) -> Vec<f32> {
        let ch = self.channels();
        let mut out = Vec::new();
        self.consume_skip();

        let head = (self.overlap_len * ch).min(self.pending.len());
        if self.tail.is_empty() {
            out.extend_from_slice(&self.pending);
        } else if head == self.tail.len() {
            self.crossfade(&self.tail, &self.pending[..head], &mut out);
            out.extend_from_slice(&self.pending[head..]);
        } else {
            out.extend_from_slice(&self.tail);
            out.extend_from_slice(&self.pending);
        }
        self.clear_state();
        out
    }
}

impl Stage for ScaleTempoStage {
    fn name(&self) -> &str {
        "scaletempo"
    }

    fn negotiate(
        &mut self,
        input: &AudioFormat,
        _requested: &AudioFormat,
    ) -> Result<Negotiation, FilterError> {
        if input.encoding != SampleEncoding::Float {
            let mut wanted = input.clone();
            wanted.encoding = SampleEncoding::Float;
            return Ok(Negotiation::Mismatch(wanted));
        }

        self.format = input.clone();
        self.stride = ((self.stride_ms / 1000.0) * input.rate as f64).round().max(1.0) as usize;
        self.overlap_len = ((self.stride as f64) * self.overlap) as usize;
        self.clear_state();
        trace!(
            "scaletempo: stride {} overlap {} samples",
            self.stride,
            self.overlap_len
        );
        Ok(Negotiation::Accept(input.clone()))
    }

    fn transform(
        &mut self,
        frame: Option<AudioFrame>,
        out: &mut VecDeque<AudioFrame>,
    ) -> Result<(), FilterError> {
        let Some(frame) = frame else {
            let data = self.drain_state();
            if !data.is_empty() {
                out.push_back(AudioFrame::new(self.format.clone(), data, None));
            }
            return Ok(());
        };

        if self.speed == 1.0 {
            if !self.has_state() {
                out.push_back(frame);
                return Ok(());
            }
            let pts = frame.pts.map(|pts| pts - self.backlog());
            let mut data = self.drain_state();
            data.extend_from_slice(&frame.data);
            out.push_back(AudioFrame::new(self.format.clone(), data, pts));
            return Ok(());
        }

        let pts = frame.pts.map(|pts| pts - self.backlog());
        self.pending.extend_from_slice(&frame.data);
        let data = self.process();
        if !data.is_empty() {
            out.push_back(AudioFrame::new(self.format.clone(), data, pts));
        }
        Ok(())
    }

    fn control(&mut self, control: &Control) -> ControlReply {
        match control {
            Control::SetPlaybackSpeed(speed) if *speed > 0.0 && speed.is_finite() => {
                self.speed = *speed;
                ControlReply::Ok
            }
            _ => ControlReply::Unsupported,
        }
    }

    fn reset(&mut self) {
        self.clear_state();
    }

    /// The overlap tail lies inside input already stepped over, so only the backlog counts
    fn delay(&self) -> f64 {
        self.backlog() / self.speed
    }
}
