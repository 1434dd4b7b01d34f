use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{FilterSpec, GaplessMode};
use crate::models::{AudioFormat, ChannelLayout, SampleEncoding};

pub mod status;
pub use status::StatusDisplay;

/// Audio output pipeline CLI
#[derive(Debug, Parser)]
#[command(name = "rpipe")]
#[command(about = "Decode, filter and play audio through a negotiated output chain")]
#[command(version = "0.1.0")]
pub struct CliApp {
    /// Configuration file (defaults to ~/.config/hires-pipeline/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Play a file through the pipeline
    Play {
        /// Audio file to decode
        path: String,
        #[command(flatten)]
        options: PlayOptions,
    },
    /// Play a generated sine tone
    Tone {
        /// Tone frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,
        /// Sample rate of the generated stream
        #[arg(long, default_value_t = 48000)]
        rate: u32,
        /// Channel count of the generated stream
        #[arg(long, default_value_t = 2)]
        channels: usize,
        /// Tone length (e.g. "5", "5s", "0:05")
        #[arg(long, default_value = "5", value_parser = parse_seconds)]
        length: f64,
        #[command(flatten)]
        options: PlayOptions,
    },
    /// Show the chain negotiated between an input format and a device format
    Negotiate {
        /// Input format as rate:encoding:channels (e.g. 44100:s16:2)
        #[arg(long, value_parser = parse_format)]
        input: AudioFormat,
        /// Device format, unset fields inherited from the input (e.g. 48000::2)
        #[arg(long, value_parser = parse_format)]
        output: Option<AudioFormat>,
        /// Filter to add, as [@label:]name[=key=value[:key=value...]]
        #[arg(long = "af", value_parser = parse_filter_spec)]
        filters: Vec<FilterSpec>,
    },
    /// List the filters that can be added to the chain
    Filters,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Playback options shared by `play` and `tone`
#[derive(Debug, Clone, Default, Args)]
pub struct PlayOptions {
    /// Playback speed factor
    #[arg(long)]
    pub speed: Option<f64>,
    /// Volume in percent
    #[arg(long)]
    pub volume: Option<f32>,
    #[arg(long)]
    pub mute: bool,
    /// Gapless mode: off, weak or strict
    #[arg(long, value_parser = parse_gapless)]
    pub gapless: Option<GaplessMode>,
    /// Filter to add, as [@label:]name[=key=value[:key=value...]]
    #[arg(long = "af", value_parser = parse_filter_spec)]
    pub filters: Vec<FilterSpec>,
    /// Force the device sample rate
    #[arg(long)]
    pub device_rate: Option<u32>,
    /// Force the device channel count
    #[arg(long)]
    pub device_channels: Option<usize>,
    /// Start position
    #[arg(long, value_parser = parse_seconds)]
    pub start: Option<f64>,
    /// Stop position
    #[arg(long, value_parser = parse_seconds)]
    pub end: Option<f64>,
    /// Run as fast as possible instead of in real time
    #[arg(long)]
    pub fast: bool,
    /// Read runtime commands from stdin while playing
    #[arg(long, short)]
    pub interactive: bool,
}

/// Configuration subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the active configuration
    Show,
    /// Print the configuration file location
    Path,
    /// Restore the defaults
    Reset,
    /// Append a filter to the configured chain
    AddFilter {
        #[arg(value_parser = parse_filter_spec)]
        spec: FilterSpec,
    },
    /// Remove configured filters by label
    RemoveFilter { label: String },
}

/// Commands accepted on stdin while playing
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCommand {
    Pause,
    Resume,
    Seek(f64),
    Speed(f64),
    Volume(f32),
    Mute(bool),
    AddFilter(FilterSpec),
    RemoveFilter(String),
    FilterCommand { label: String, name: String, arg: String },
    Reload,
    Status,
    Chain,
    Events,
    Quit,
}

impl CliApp {
    /// Parse command line arguments
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Expand tilde (~) in path to home directory
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home_dir) = dirs::home_dir() {
                home_dir.join(rest)
            } else {
                PathBuf::from(path)
            }
        } else if path == "~" {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(path))
        } else {
            PathBuf::from(path)
        }
    }

    /// Parse a runtime command (for interactive mode)
    pub fn parse_command(input: &str) -> Result<RuntimeCommand, ParseError> {
        let args: Vec<&str> = input.split_whitespace().collect();
        if args.is_empty() {
            return Err(ParseError::EmptyCommand);
        }

        match args[0] {
            "pause" => Ok(RuntimeCommand::Pause),
            "resume" | "play" => Ok(RuntimeCommand::Resume),
            "seek" => {
                let position = Self::require(&args, 1, "seek", "position")?;
                Ok(RuntimeCommand::Seek(Self::parse_time(position)?.as_secs_f64()))
            }
            "speed" => {
                let value = Self::require(&args, 1, "speed", "factor")?;
                match value.parse::<f64>() {
                    Ok(speed) if speed > 0.0 && speed.is_finite() => Ok(RuntimeCommand::Speed(speed)),
                    _ => Err(ParseError::InvalidArgument {
                        argument: "speed".to_string(),
                        value: value.to_string(),
                        expected: "positive number".to_string(),
                    }),
                }
            }
            "volume" => {
                let value = Self::require(&args, 1, "volume", "level")?;
                match value.parse::<f32>() {
                    Ok(level) if level >= 0.0 => Ok(RuntimeCommand::Volume(level)),
                    _ => Err(ParseError::InvalidArgument {
                        argument: "volume level".to_string(),
                        value: value.to_string(),
                        expected: "number >= 0".to_string(),
                    }),
                }
            }
            "mute" => Ok(RuntimeCommand::Mute(true)),
            "unmute" => Ok(RuntimeCommand::Mute(false)),
            "af" => {
                let action = Self::require(&args, 1, "af", "action")?;
                match action {
                    "add" => {
                        let spec = Self::require(&args, 2, "af add", "filter")?;
                        Ok(RuntimeCommand::AddFilter(parse_filter_spec(spec)?))
                    }
                    "rm" | "remove" => {
                        let label = Self::require(&args, 2, "af rm", "label")?;
                        Ok(RuntimeCommand::RemoveFilter(label.to_string()))
                    }
                    "cmd" | "command" => {
                        let label = Self::require(&args, 2, "af cmd", "label")?;
                        let name = Self::require(&args, 3, "af cmd", "command")?;
                        let arg = Self::require(&args, 4, "af cmd", "argument")?;
                        Ok(RuntimeCommand::FilterCommand {
                            label: label.to_string(),
                            name: name.to_string(),
                            arg: arg.to_string(),
                        })
                    }
                    "list" | "show" => Ok(RuntimeCommand::Chain),
                    _ => Err(ParseError::UnknownCommand {
                        command: format!("af {}", action),
                    }),
                }
            }
            "reload" => Ok(RuntimeCommand::Reload),
            "status" => Ok(RuntimeCommand::Status),
            "chain" => Ok(RuntimeCommand::Chain),
            "events" => Ok(RuntimeCommand::Events),
            "quit" | "exit" => Ok(RuntimeCommand::Quit),
            "help" => Err(ParseError::HelpRequested),
            other => Err(ParseError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }

    fn require<'a>(
        args: &[&'a str],
        index: usize,
        command: &str,
        argument: &str,
    ) -> Result<&'a str, ParseError> {
        args.get(index).copied().ok_or_else(|| ParseError::MissingArgument {
            command: command.to_string(),
            argument: argument.to_string(),
        })
    }

    /// Display help information
    pub fn display_help() {
        println!("Runtime commands:");
        println!();
        println!("Playback Control:");
        println!("  pause | resume       - Pause or resume the device");
        println!("  seek <time>          - Seek to position (e.g., '1:30', '90s')");
        println!("  speed <factor>       - Set playback speed");
        println!("  volume <percent>     - Set volume");
        println!("  mute | unmute        - Toggle mute");
        println!();
        println!("Filter Chain:");
        println!("  af add <spec>                 - Add a filter, [@label:]name[=k=v:...]");
        println!("  af rm <label>                 - Remove a labeled filter");
        println!("  af cmd <label> <name> <arg>   - Send a command to a filter");
        println!("  chain                         - Show the negotiated chain");
        println!();
        println!("Device:");
        println!("  reload               - Reopen the output device");
        println!();
        println!("Information:");
        println!("  status               - Show pipeline status");
        println!("  events               - Show recent pipeline events");
        println!();
        println!("General:");
        println!("  help                 - Show this help message");
        println!("  exit, quit           - Stop playback and exit");
    }

    /// Parse time string to Duration
    pub fn parse_time(time_str: &str) -> Result<Duration, ParseError> {
        let trimmed = time_str.trim();
        let invalid = || ParseError::InvalidTimeFormat {
            input: time_str.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid());
        }

        // "1:30", "90", "90s", "1:30.5"
        if trimmed.contains(':') {
            let parts: Vec<&str> = trimmed.split(':').collect();
            if parts.len() != 2 {
                return Err(invalid());
            }

            let minutes: u64 = parts[0].parse().map_err(|_| invalid())?;
            let seconds: f64 = parts[1].parse().map_err(|_| invalid())?;
            if !(0.0..60.0).contains(&seconds) {
                return Err(invalid());
            }

            Ok(Duration::from_secs_f64(minutes as f64 * 60.0 + seconds))
        } else {
            let seconds: f64 = trimmed.trim_end_matches('s').parse().map_err(|_| invalid())?;
            if !(seconds >= 0.0 && seconds.is_finite()) {
                return Err(invalid());
            }
            Ok(Duration::from_secs_f64(seconds))
        }
    }

    /// Format duration for display
    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        let millis = duration.subsec_millis();
        format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
    }
}

fn parse_seconds(input: &str) -> Result<f64, ParseError> {
    CliApp::parse_time(input).map(|d| d.as_secs_f64())
}

fn parse_gapless(input: &str) -> Result<GaplessMode, ParseError> {
    match input.to_ascii_lowercase().as_str() {
        "no" | "off" => Ok(GaplessMode::Off),
        "weak" => Ok(GaplessMode::Weak),
        "yes" | "strict" => Ok(GaplessMode::Strict),
        _ => Err(ParseError::InvalidArgument {
            argument: "gapless".to_string(),
            value: input.to_string(),
            expected: "off, weak or strict".to_string(),
        }),
    }
}

/// Parse `[@label:]name[=key=value[:key=value...]]`
pub fn parse_filter_spec(input: &str) -> Result<FilterSpec, ParseError> {
    let invalid = |expected: &str| ParseError::InvalidArgument {
        argument: "filter".to_string(),
        value: input.to_string(),
        expected: expected.to_string(),
    };

    let mut rest = input.trim();
    let mut label = None;
    if let Some(labeled) = rest.strip_prefix('@') {
        let (name, tail) = labeled
            .split_once(':')
            .ok_or_else(|| invalid("'@label:name'"))?;
        if name.is_empty() {
            return Err(invalid("a non-empty label"));
        }
        label = Some(name);
        rest = tail;
    }

    let (name, args) = match rest.split_once('=') {
        Some((name, args)) => (name, Some(args)),
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(invalid("a filter name"));
    }

    let mut spec = FilterSpec::new(name);
    if let Some(label) = label {
        spec = spec.with_label(label);
    }
    if let Some(args) = args {
        for pair in args.split(':').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("key=value pairs"))?;
            spec = spec.with_arg(key, value);
        }
    }
    Ok(spec)
}

/// Parse `rate:encoding:channels`; empty fields stay unset
pub fn parse_format(input: &str) -> Result<AudioFormat, ParseError> {
    let invalid = || ParseError::InvalidArgument {
        argument: "format".to_string(),
        value: input.to_string(),
        expected: "rate:encoding:channels".to_string(),
    };

    let parts: Vec<&str> = input.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(invalid());
    }

    let mut format = AudioFormat::unset();
    if let Some(rate) = parts.first().filter(|s| !s.is_empty()) {
        format.rate = rate.parse().map_err(|_| invalid())?;
    }
    if let Some(encoding) = parts.get(1).filter(|s| !s.is_empty()) {
        format.encoding = encoding
            .parse::<SampleEncoding>()
            .map_err(|_| invalid())?;
    }
    if let Some(channels) = parts.get(2).filter(|s| !s.is_empty()) {
        let count: usize = channels.parse().map_err(|_| invalid())?;
        if count == 0 || count > crate::models::MAX_CHANNELS {
            return Err(invalid());
        }
        format.channels = ChannelLayout::default_for_count(count);
    }
    Ok(format)
}

/// Command parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Missing argument for {command}: {argument}")]
    MissingArgument { command: String, argument: String },

    #[error("Invalid argument {argument}: got '{value}', expected {expected}")]
    InvalidArgument {
        argument: String,
        value: String,
        expected: String,
    },

    #[error("Invalid time format: {input}")]
    InvalidTimeFormat { input: String },

    #[error("Help requested")]
    HelpRequested,
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn test_expand_path_tilde_home() {
        let expanded = CliApp::expand_path("~/Music/test.flac");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("Music/test.flac"));
    }

    #[test]
    fn test_expand_path_no_tilde() {
        let path = "/absolute/path/to/file";
        assert_eq!(CliApp::expand_path(path).to_string_lossy(), path);
    }

    #[test]
    fn test_expand_path_relative() {
        let path = "relative/path/to/file";
        assert_eq!(CliApp::expand_path(path).to_string_lossy(), path);
    }
}
