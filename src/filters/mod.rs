//! Filter stages and the graph that negotiates formats between them.
//!
//! A stage is asked to accept a candidate input format via [`Stage::negotiate`]
//! and may accept it, ask for a different input, or declare itself redundant.
//! The [`FilterGraph`](graph::FilterGraph) resolves these answers into a
//! consistent chain, inserting conversion stages where needed.

pub mod convert;
pub mod format;
pub mod graph;
pub mod tempo;
pub mod volume;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::error::FilterError;
use crate::models::{AudioFormat, AudioFrame};

pub use convert::ConvertStage;
pub use format::FormatStage;
pub use graph::{FilterGraph, InitState, StageInfo};
pub use tempo::ScaleTempoStage;
pub use volume::VolumeStage;

/// Per-stage options, as given in the configuration
pub type StageArgs = BTreeMap<String, String>;

/// A stage's answer to a candidate input format
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    /// Input accepted; the stage will produce this output format
    Accept(AudioFormat),
    /// Input refused; the stage would accept this format instead
    Mismatch(AudioFormat),
    /// The stage is redundant for this input and asks to be removed
    Detach,
}

/// Runtime control messages routed through the graph
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Linear gain factor
    SetVolume(f32),
    /// Change tempo, keeping pitch
    SetPlaybackSpeed(f64),
    /// Change tempo by resampling, which also shifts pitch
    SetPlaybackSpeedResample(f64),
    /// Free-form command addressed by label
    Command { name: String, arg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    Unsupported,
}

/// A single transform in the filter chain
pub trait Stage: Send + fmt::Debug {
    fn name(&self) -> &str;

    /// Check a candidate input format.
    ///
    /// `requested` is the output the graph would like this stage to produce; unset
    /// fields mean "don't care". Most stages ignore it, conversion stages honor it.
    fn negotiate(
        &mut self,
        input: &AudioFormat,
        requested: &AudioFormat,
    ) -> Result<Negotiation, FilterError>;

    /// Process one frame, or flush internal state when `frame` is `None`.
    ///
    /// Output frames are pushed onto `out`. Flushing must be safe to repeat.
    fn transform(
        &mut self,
        frame: Option<AudioFrame>,
        out: &mut VecDeque<AudioFrame>,
    ) -> Result<(), FilterError>;

    fn control(&mut self, _control: &Control) -> ControlReply {
        ControlReply::Unsupported
    }

    /// Drop internal state after a seek
    fn reset(&mut self) {}

    /// Internal latency in seconds of output
    fn delay(&self) -> f64 {
        0.0
    }
}

/// Map a filter name or alias to its canonical name
pub fn canonical_name(name: &str) -> Option<&'static str> {
    match name {
        "convert" | "lavrresample" | "resample" => Some("convert"),
        "volume" => Some("volume"),
        "scaletempo" => Some("scaletempo"),
        "format" | "force" => Some("format"),
        _ => None,
    }
}

/// Construct a stage by name
pub fn create_stage(name: &str, args: &StageArgs) -> Result<Box<dyn Stage>, FilterError> {
    let canonical = canonical_name(name).ok_or_else(|| FilterError::UnknownFilter {
        name: name.to_string(),
    })?;
    log::debug!("Creating filter {} ({})", name, canonical);

    let stage: Box<dyn Stage> = match canonical {
        "convert" => Box::new(ConvertStage::from_args(args)?),
        "volume" => Box::new(VolumeStage::from_args(args)?),
        "scaletempo" => Box::new(ScaleTempoStage::from_args(args)?),
        "format" => Box::new(FormatStage::from_args(args)?),
        _ => {
            return Err(FilterError::UnknownFilter {
                name: name.to_string(),
            })
        }
    };
    Ok(stage)
}

/// Parse a numeric stage argument, if present
pub(crate) fn parse_arg<T: std::str::FromStr>(
    filter: &str,
    args: &StageArgs,
    key: &str,
) -> Result<Option<T>, FilterError> {
    match args.get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FilterError::InvalidArgument {
                filter: filter.to_string(),
                key: key.to_string(),
                value: value.clone(),
            }),
    }
}

/// Reject arguments a stage does not know
pub(crate) fn check_known_args(
    filter: &str,
    args: &StageArgs,
    known: &[&str],
) -> Result<(), FilterError> {
    match args.iter().find(|(key, _)| !known.contains(&key.as_str())) {
        Some((key, value)) => Err(FilterError::InvalidArgument {
            filter: filter.to_string(),
            key: key.clone(),
            value: value.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_aliases() {
        assert_eq!(canonical_name("lavrresample"), Some("convert"));
        assert_eq!(canonical_name("force"), Some("format"));
        assert_eq!(canonical_name("echo"), None);

        let stage = create_stage("resample", &StageArgs::new()).unwrap();
        assert_eq!(stage.name(), "convert");
    }

    #[test]
    fn test_unknown_filter_fails() {
        match create_stage("reverb", &StageArgs::new()) {
            Err(FilterError::UnknownFilter { name }) => assert_eq!(name, "reverb"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_argument_fails_construction() {
        let mut args = StageArgs::new();
        args.insert("volume".to_string(), "loud".to_string());
        assert!(matches!(
            create_stage("volume", &args),
            Err(FilterError::InvalidArgument { .. })
        ));

        let mut args = StageArgs::new();
        args.insert("bogus".to_string(), "1".to_string());
        assert!(create_stage("scaletempo", &args).is_err());
    }
}
