use std::collections::VecDeque;

use super::{check_known_args, parse_arg, Negotiation, Stage, StageArgs};
use crate::error::FilterError;
use crate::models::{AudioFormat, AudioFrame, ChannelLayout, SampleEncoding};

/// Pins parts of the stream format at its position in the chain.
///
/// It never converts anything itself; it refuses any input that differs from the
/// forced fields so the graph puts a converter in front of it. Without arguments
/// it has nothing to do and detaches.
#[derive(Debug)]
pub struct FormatStage {
    forced: AudioFormat,
}

impl FormatStage {
    pub fn from_args(args: &StageArgs) -> Result<Self, FilterError> {
        check_known_args("format", args, &["rate", "encoding", "channels"])?;

        let mut forced = AudioFormat::unset();
        forced.rate = parse_arg::<u32>("format", args, "rate")?.unwrap_or(0);
        forced.encoding = parse_arg::<SampleEncoding>("format", args, "encoding")?.unwrap_or_default();
        if let Some(count) = parse_arg::<usize>("format", args, "channels")? {
            forced.channels = ChannelLayout::default_for_count(count);
            if !forced.channels.is_set() {
                return Err(FilterError::InvalidArgument {
                    filter: "format".to_string(),
                    key: "channels".to_string(),
                    value: count.to_string(),
                });
            }
        }
        Ok(Self { forced })
    }
}

impl Stage for FormatStage {
    fn name(&self) -> &str {
        "format"
    }

    fn negotiate(
        &mut self,
        input: &AudioFormat,
        _requested: &AudioFormat,
    ) -> Result<Negotiation, FilterError> {
        if self.forced.is_unset() {
            return Ok(Negotiation::Detach);
        }

        let mut wanted = self.forced.clone();
        wanted.copy_unset_fields_from(input);
        if *input == wanted {
            Ok(Negotiation::Accept(wanted))
        } else {
            Ok(Negotiation::Mismatch(wanted))
        }
    }

    fn transform(
        &mut self,
        frame: Option<AudioFrame>,
        out: &mut VecDeque<AudioFrame>,
    ) -> Result<(), FilterError> {
        out.extend(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_args_detaches() {
        let mut stage = FormatStage::from_args(&StageArgs::new()).unwrap();
        let answer = stage.negotiate(&AudioFormat::pcm(48000, 2), &AudioFormat::unset()).unwrap();
        assert_eq!(answer, Negotiation::Detach);
    }

    #[test]
    fn test_forced_fields() {
        let mut args = StageArgs::new();
        args.insert("encoding".to_string(), "s16".to_string());
        args.insert("channels".to_string(), "1".to_string());
        let mut stage = FormatStage::from_args(&args).unwrap();

        let wanted = AudioFormat::new(44100, SampleEncoding::S16, ChannelLayout::mono());
        assert_eq!(
            stage.negotiate(&AudioFormat::pcm(44100, 2), &AudioFormat::unset()).unwrap(),
            Negotiation::Mismatch(wanted.clone())
        );
        assert_eq!(
            stage.negotiate(&wanted, &AudioFormat::unset()).unwrap(),
            Negotiation::Accept(wanted)
        );
    }

    #[test]
    fn test_bad_encoding_rejected() {
        let mut args = StageArgs::new();
        args.insert("encoding".to_string(), "mp3".to_string());
        assert!(matches!(
            FormatStage::from_args(&args),
            Err(FilterError::InvalidArgument { .. })
        ));
    }
}
