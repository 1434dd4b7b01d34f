use std::collections::VecDeque;

use super::{check_known_args, parse_arg, Control, ControlReply, Negotiation, Stage, StageArgs};
use crate::error::FilterError;
use crate::models::{AudioFormat, AudioFrame, SampleEncoding};

/// Linear gain stage used for software volume and replaygain
#[derive(Debug)]
pub struct VolumeStage {
    gain: f32,
}

impl VolumeStage {
    pub fn from_args(args: &StageArgs) -> Result<Self, FilterError> {
        check_known_args("volume", args, &["volume"])?;
        let gain = parse_arg::<f32>("volume", args, "volume")?.unwrap_or(1.0);
        Self::with_gain(gain).ok_or_else(|| FilterError::InvalidArgument {
            filter: "volume".to_string(),
            key: "volume".to_string(),
            value: gain.to_string(),
        })
    }

    pub fn with_gain(gain: f32) -> Option<Self> {
        (gain >= 0.0 && gain.is_finite()).then_some(Self { gain })
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    fn set_gain(&mut self, gain: f32) -> ControlReply {
        if gain >= 0.0 && gain.is_finite() {
            self.gain = gain;
            ControlReply::Ok
        } else {
            ControlReply::Unsupported
        }
    }
}

impl Stage for VolumeStage {
    fn name(&self) -> &str {
        "volume"
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
        Ok(Negotiation::Accept(input.clone()))
    }

    fn transform(
        &mut self,
        frame: Option<AudioFrame>,
        out: &mut VecDeque<AudioFrame>,
    ) -> Result<(), FilterError> {
        if let Some(mut frame) = frame {
            if self.gain != 1.0 {
                frame.data.iter_mut().for_each(|s| *s *= self.gain);
            }
            out.push_back(frame);
        }
        Ok(())
    }

    fn control(&mut self, control: &Control) -> ControlReply {
        match control {
            Control::SetVolume(gain) => self.set_gain(*gain),
            Control::Command { name, arg } if name == "volume" => match arg.trim().parse::<f32>() {
                Ok(gain) => self.set_gain(gain),
                Err(_) => ControlReply::Unsupported,
            },
            _ => ControlReply::Unsupported,
        }
    }
}
