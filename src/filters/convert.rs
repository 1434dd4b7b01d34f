use log::debug;
use std::collections::VecDeque;

use super::{check_known_args, parse_arg, Control, ControlReply, Negotiation, Stage, StageArgs};
use crate::audio::resampler::LinearResampler;
use crate::error::FilterError;
use crate::models::{AudioFormat, AudioFrame, ChannelLayout, SampleEncoding, Speaker};

const FOLD_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// General format converter: channel remix, rate conversion and sample quantization.
///
/// The graph inserts this stage whenever two neighbours disagree on a format. It can
/// also be configured explicitly with forced `rate`, `channels` or `encoding`.
#[derive(Debug)]
pub struct ConvertStage {
    forced: AudioFormat,
    input: AudioFormat,
    output: AudioFormat,
    // Rows are output channels, columns input channels
    matrix: Vec<Vec<f32>>,
    resampler: LinearResampler,
    speed: f64,
}

impl ConvertStage {
    pub fn from_args(args: &StageArgs) -> Result<Self, FilterError> {
        check_known_args("convert", args, &["rate", "channels", "encoding"])?;

        let mut forced = AudioFormat::unset();
        if let Some(rate) = parse_arg::<u32>("convert", args, "rate")? {
            forced.rate = rate;
        }
        if let Some(count) = parse_arg::<usize>("convert", args, "channels")? {
            forced.channels = ChannelLayout::default_for_count(count);
            if !forced.channels.is_set() {
                return Err(FilterError::InvalidArgument {
                    filter: "convert".to_string(),
                    key: "channels".to_string(),
                    value: count.to_string(),
                });
            }
        }
        if let Some(encoding) = parse_arg::<SampleEncoding>("convert", args, "encoding")? {
            forced.encoding = encoding;
        }

        Ok(Self {
            forced,
            input: AudioFormat::unset(),
            output: AudioFormat::unset(),
            matrix: Vec::new(),
            resampler: LinearResampler::new(0, 0, 0),
            speed: 1.0,
        })
    }

    fn configure(&mut self, input: &AudioFormat, output: &AudioFormat) {
        self.input = input.clone();
        self.output = output.clone();
        self.matrix = remix_matrix(&input.channels, &output.channels);
        self.resampler = LinearResampler::new(input.rate, output.rate, output.channel_count());
        self.resampler.set_speed(self.speed);
        debug!("convert: {} -> {}", input, output);
    }

    fn is_passthrough(&self) -> bool {
        self.input.encoding.is_spdif()
    }

    fn remix(&self, data: &[f32]) -> Vec<f32> {
        let in_ch = self.input.channel_count();
        if self.input.channels == self.output.channels || in_ch == 0 {
            return data.to_vec();
        }
        let out_ch = self.output.channel_count();
        let samples = data.len() / in_ch;
        let mut out = Vec::with_capacity(samples * out_ch);
        for frame in data.chunks_exact(in_ch) {
            out.extend(
                self.matrix
                    .iter()
                    .map(|row| row.iter().zip(frame).map(|(g, s)| g * s).sum::<f32>()),
            );
        }
        out
    }

    fn quantize(&self, data: &mut [f32]) {
        let Some(bits) = self.output.encoding.integer_bits() else {
            return;
        };
        let scale = 2f64.powi(bits as i32 - 1);
        let max = ((scale - 1.0) / scale) as f32;
        for sample in data.iter_mut() {
            let q = ((*sample as f64) * scale).round() / scale;
            *sample = (q as f32).clamp(-1.0, max);
        }
    }

    fn emit(&self, data: Vec<f32>, pts: Option<f64>, out: &mut VecDeque<AudioFrame>) {
        if !data.is_empty() {
            out.push_back(AudioFrame::new(self.output.clone(), data, pts));
        }
    }
}

impl Stage for ConvertStage {
    fn name(&self) -> &str {
        "convert"
    }

    fn negotiate(
        &mut self,
        input: &AudioFormat,
        requested: &AudioFormat,
    ) -> Result<Negotiation, FilterError> {
        let mut output = self.forced.clone();
        output.copy_unset_fields_from(requested);
        output.copy_unset_fields_from(input);

        if input.encoding.is_spdif() || output.encoding.is_spdif() {
            // Compressed data can only be passed through untouched
            if *input != output {
                return Ok(Negotiation::Mismatch(output));
            }
        }

        self.configure(input, &output);
        Ok(Negotiation::Accept(output))
    }

    fn transform(
        &mut self,
        frame: Option<AudioFrame>,
        out: &mut VecDeque<AudioFrame>,
    ) -> Result<(), FilterError> {
        let Some(frame) = frame else {
            let tail = self.resampler.flush();
            self.emit(tail, None, out);
            return Ok(());
        };

        if self.is_passthrough() {
            out.push_back(frame);
            return Ok(());
        }
        if frame.format != self.input {
            return Err(FilterError::StageFailed {
                stage: "convert".to_string(),
                reason: format!("unexpected frame format {}", frame.format),
            });
        }

        let pts = frame.pts.map(|pts| pts - self.resampler.delay() * self.speed);
        let mut data = self.remix(&frame.data);
        if self.resampler.is_identity() {
            // Speed went back to 1.0 with history still held
            let mut held = self.resampler.flush();
            if !held.is_empty() {
                held.extend_from_slice(&data);
                data = held;
            }
        } else {
            data = self.resampler.process(&data);
        }
        self.quantize(&mut data);
        self.emit(data, pts, out);
        Ok(())
    }

    fn control(&mut self, control: &Control) -> ControlReply {
        match control {
            Control::SetPlaybackSpeedResample(speed) if *speed > 0.0 && speed.is_finite() => {
                self.speed = *speed;
                self.resampler.set_speed(*speed);
                ControlReply::Ok
            }
            _ => ControlReply::Unsupported,
        }
    }

    fn reset(&mut self) {
        self.resampler.reset();
    }

    fn delay(&self) -> f64 {
        self.resampler.delay()
    }
}

/// Speakers that can stand in for a missing one, best match first
fn fold_targets(speaker: Speaker) -> &'static [(&'static [Speaker], f32)] {
    use Speaker::*;
    match speaker {
        Fc => &[(&[Fl, Fr], FOLD_GAIN)],
        Fl | Fr => &[(&[Fc], 1.0)],
        Sl => &[(&[Bl], 1.0), (&[Fl], FOLD_GAIN), (&[Fc], FOLD_GAIN)],
        Bl => &[(&[Sl], 1.0), (&[Fl], FOLD_GAIN), (&[Fc], FOLD_GAIN)],
        Sr => &[(&[Br], 1.0), (&[Fr], FOLD_GAIN), (&[Fc], FOLD_GAIN)],
        Br => &[(&[Sr], 1.0), (&[Fr], FOLD_GAIN), (&[Fc], FOLD_GAIN)],
        Bc => &[
            (&[Bl, Br], FOLD_GAIN),
            (&[Sl, Sr], FOLD_GAIN),
            (&[Fl, Fr], FOLD_GAIN),
            (&[Fc], FOLD_GAIN),
        ],
        Lfe => &[],
    }
}

/// Build an output-by-input gain matrix mapping one layout onto another
pub fn remix_matrix(input: &ChannelLayout, output: &ChannelLayout) -> Vec<Vec<f32>> {
    let mut matrix = vec![vec![0.0f32; input.count()]; output.count()];
    let mono_in = *input == ChannelLayout::mono();

    for (i, speaker) in input.speakers().iter().enumerate() {
        if let Some(o) = output.position(*speaker) {
            matrix[o][i] += 1.0;
            continue;
        }
        let group = fold_targets(*speaker)
            .iter()
            .find(|(targets, _)| targets.iter().all(|t| output.position(*t).is_some()));
        if let Some((targets, gain)) = group {
            let gain = if mono_in { 1.0 } else { *gain };
            for target in targets.iter() {
                if let Some(o) = output.position(*target) {
                    matrix[o][i] += gain;
                }
            }
        }
    }

    for row in matrix.iter_mut() {
        let sum: f32 = row.iter().sum();
        if sum > 1.0 {
            row.iter_mut().for_each(|g| *g /= sum);
        }
    }
    matrix
}
