//! Output chain: decode bridge, filter graph and the device-format buffer.
//!
//! The chain pulls raw frames from the decode bridge, runs them through the
//! filter graph and collects the result in an [`AudioRingBuffer`] that the
//! synchronization logic writes to the device from.

use log::{trace, warn};

use super::buffer::AudioRingBuffer;
use super::decode::{DecodeBridge, DecodeStatus, FrameSource};
use crate::config::FilterSpec;
use crate::error::FilterError;
use crate::filters::FilterGraph;
use crate::models::{AudioFormat, AudioFrame};

/// Timestamp jumps larger than this are reported
const PTS_TOLERANCE: f64 = 0.1;
/// Forward jumps at least this large ask the owner to reset playback
const PTS_RESET_THRESHOLD: f64 = 5.0;

/// Result of [`OutputChain::pull_and_filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// The requested amount is buffered
    Ok,
    /// The source will wake the scheduler when it has data
    Wait,
    /// Internal progress only, try again on the next tick
    NoProgress,
    /// Upstream underrun
    Starved,
    /// Decoding ended and the graph was flushed, or the end pts was reached
    Eof,
    /// The next frame has a different format; renegotiate before pulling again
    NewFormat,
    /// The graph is unusable
    Failed,
}

/// Parameters of one pull
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PullRequest {
    pub min_samples: usize,
    /// Stop buffering once the written position reaches this pts
    pub end_pts: Option<f64>,
    /// Flush the graph on decoder EOF and before a format change
    pub allow_flush: bool,
    pub audio_delay: f64,
    pub speed: f64,
}

impl PullRequest {
    pub fn new(min_samples: usize, speed: f64) -> Self {
        Self {
            min_samples,
            end_pts: None,
            allow_flush: true,
            audio_delay: 0.0,
            speed,
        }
    }
}

#[derive(Debug)]
pub struct OutputChain {
    pub graph: FilterGraph,
    pub buffer: AudioRingBuffer,
    pub decode: DecodeBridge,
    /// Filtered frame partially copied into the buffer
    output_frame: Option<AudioFrame>,
    /// End pts of the last frame fed into the graph
    pts: Option<f64>,
    pts_reset: bool,
    /// Passthrough is attempted while set
    pub spdif_passthrough: bool,
    /// Passthrough was tried and fell back to PCM
    pub spdif_failed: bool,
}

impl OutputChain {
    pub fn new(source: Option<Box<dyn FrameSource>>, filters: Vec<FilterSpec>) -> Self {
        Self {
            graph: FilterGraph::new(filters),
            buffer: AudioRingBuffer::default(),
            decode: DecodeBridge::new(source),
            output_frame: None,
            pts: None,
            pts_reset: false,
            spdif_passthrough: true,
            spdif_failed: false,
        }
    }

    /// Chain without a source, producing nothing
    pub fn blank(filters: Vec<FilterSpec>) -> Self {
        Self::new(None, filters)
    }

    pub fn pts(&self) -> Option<f64> {
        self.pts
    }

    /// A forward timestamp jump large enough to need a playback reset was seen
    pub fn pts_reset_requested(&self) -> bool {
        self.pts_reset
    }

    pub fn drop_output_frame(&mut self) {
        self.output_frame = None;
    }

    /// Seconds of output produced by the graph but not yet written to the device
    pub fn pending_output(&self) -> f64 {
        let frame = self.output_frame.as_ref().map_or(0.0, |f| f.duration());
        self.graph.total_delay() + frame + self.buffer.seconds()
    }

    /// Source pts corresponding to the end of everything handed to the device so far
    pub fn written_pts(&self, speed: f64) -> Option<f64> {
        let pts = self.pts?;
        if !self.graph.is_initialized() {
            return None;
        }
        // The graph divides durations by the speed
        Some(pts - self.pending_output() * speed)
    }

    /// Forget timestamps and every frame in flight; negotiated formats are kept
    pub fn reset(&mut self) {
        self.pts = None;
        self.pts_reset = false;
        self.decode.reset();
        self.output_frame = None;
        self.graph.reset();
        self.buffer.clear();
    }

    /// Move filtered output into the buffer until `min_samples` are buffered.
    ///
    /// Returns `Ok(false)` when the graph has no more output. `reached_end` is set
    /// when the end pts cut the output short.
    fn copy_output(
        &mut self,
        request: &PullRequest,
        eof: bool,
        reached_end: &mut bool,
    ) -> Result<bool, FilterError> {
        while self.buffer.samples() < request.min_samples {
            let current = self.buffer.samples();
            let mut max_samples = usize::MAX;
            if let (Some(end_pts), Some(written)) = (request.end_pts, self.written_pts(request.speed)) {
                let rate = self.buffer.format().rate as f64 / request.speed;
                let remaining = (end_pts - written - request.audio_delay) * rate;
                max_samples = remaining.clamp(0.0, usize::MAX as f64) as usize;
            }

            if self.output_frame.as_ref().map_or(true, |f| f.is_empty()) {
                self.output_frame = None;
                self.graph.drain_step(eof)?;
                self.output_frame = self.graph.pop_output()?;
            }
            let Some(frame) = self.output_frame.as_mut() else {
                return Ok(false);
            };

            let size = frame.sample_count();
            if current + size > max_samples {
                if current < max_samples {
                    let take = max_samples - current;
                    let values = take * frame.format.channel_count();
                    self.buffer.append_interleaved(&frame.data[..values]);
                    frame.skip_samples(take);
                }
                *reached_end = true;
                return Ok(true);
            }

            self.buffer.append(frame);
            self.output_frame = None;
        }
        Ok(true)
    }

    /// Decode and filter until at least `min_samples` are buffered
    pub fn pull_and_filter(&mut self, request: &PullRequest) -> Result<PullStatus, FilterError> {
        if !self.graph.is_initialized() {
            return Ok(PullStatus::Failed);
        }

        let mut reached_end = false;
        let mut status = PullStatus::Ok;
        loop {
            if self.copy_output(request, false, &mut reached_end)? {
                break;
            }

            match self.decode.decode_new_frame() {
                DecodeStatus::Ok => {}
                DecodeStatus::NoProgress => continue,
                DecodeStatus::Wait => {
                    status = PullStatus::Wait;
                    break;
                }
                DecodeStatus::Starved => {
                    status = PullStatus::Starved;
                    break;
                }
                DecodeStatus::Eof => {
                    if request.allow_flush {
                        self.copy_output(request, true, &mut reached_end)?;
                    }
                    status = PullStatus::Eof;
                    break;
                }
            }

            if self.decode.input_format() != self.graph.input_format() {
                if request.allow_flush {
                    self.copy_output(request, true, &mut reached_end)?;
                }
                return Ok(PullStatus::NewFormat);
            }

            let Some(frame) = self.decode.take_frame() else {
                continue;
            };
            match frame.pts {
                Some(pts) => {
                    if let Some(last) = self.pts {
                        let desync = pts - last;
                        if desync.abs() > PTS_TOLERANCE {
                            warn!("Invalid audio PTS: {:.6} -> {:.6}", last, pts);
                            if desync >= PTS_RESET_THRESHOLD {
                                self.pts_reset = true;
                            }
                        }
                    }
                    self.pts = frame.end_pts();
                }
                None => self.pts = None,
            }
            trace!("feeding {} samples", frame.sample_count());
            self.graph.feed(frame)?;
        }

        if status == PullStatus::Ok
            && self.buffer.samples() < request.min_samples
            && reached_end
        {
            status = PullStatus::Eof;
        }
        Ok(status)
    }

    /// Point the buffer at the device format
    pub fn set_device_format(&mut self, format: AudioFormat) {
        self.buffer.reinit_format(format.clone());
        self.graph.set_output_format(format);
    }
}
