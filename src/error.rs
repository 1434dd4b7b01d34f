use thiserror::Error;

/// Main pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("File error: {0}")]
    File(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Filter(err) => err.user_message(),
            PipelineError::Device(err) => err.user_message(),
            PipelineError::File(err) => Self::format_file_error(err),
            PipelineError::Decode(err) => err.user_message(),
            PipelineError::Config(err) => err.user_message(),
        }
    }

    /// Get suggested recovery actions for the error
    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            PipelineError::Filter(err) => err.recovery_suggestions(),
            PipelineError::Device(err) => err.recovery_suggestions(),
            PipelineError::File(err) => Self::file_error_suggestions(err),
            PipelineError::Decode(err) => err.recovery_suggestions(),
            PipelineError::Config(err) => err.recovery_suggestions(),
        }
    }

    /// Check if the pipeline can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Filter(err) => err.is_recoverable(),
            PipelineError::Device(err) => err.is_recoverable(),
            PipelineError::File(_) => false,
            PipelineError::Decode(err) => err.is_recoverable(),
            PipelineError::Config(err) => err.is_recoverable(),
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Filter(FilterError::DuplicateLabel { .. }) => ErrorSeverity::Warning,
            PipelineError::Filter(FilterError::UnknownFilter { .. }) => ErrorSeverity::Error,
            PipelineError::Filter(_) => ErrorSeverity::Critical,
            PipelineError::Device(DeviceError::PassthroughRejected { .. }) => ErrorSeverity::Warning,
            PipelineError::Device(_) => ErrorSeverity::Critical,
            PipelineError::File(_) => ErrorSeverity::Error,
            PipelineError::Decode(DecodeError::UnsupportedFormat { .. }) => ErrorSeverity::Warning,
            PipelineError::Decode(_) => ErrorSeverity::Error,
            PipelineError::Config(_) => ErrorSeverity::Warning,
        }
    }

    fn format_file_error(err: &std::io::Error) -> String {
        match err.kind() {
            std::io::ErrorKind::NotFound => "File or directory not found".to_string(),
            std::io::ErrorKind::PermissionDenied => "Permission denied - cannot access file".to_string(),
            std::io::ErrorKind::InvalidData => "File contains invalid or corrupted data".to_string(),
            _ => format!("File system error: {}", err),
        }
    }

    fn file_error_suggestions(err: &std::io::Error) -> Vec<String> {
        match err.kind() {
            std::io::ErrorKind::NotFound => vec![
                "Check that the file path is correct".to_string(),
                "Try using absolute path instead of relative path".to_string(),
            ],
            std::io::ErrorKind::PermissionDenied => vec![
                "Check file permissions".to_string(),
                "Ensure the file is not locked by another application".to_string(),
            ],
            _ => vec!["Try the operation again".to_string()],
        }
    }
}

/// Error severity levels for logging and user feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }

    pub fn log_level(&self) -> log::Level {
        match self {
            ErrorSeverity::Info => log::Level::Info,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Error => log::Level::Error,
            ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

/// Filter chain construction and negotiation errors
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Unknown filter: {name}")]
    UnknownFilter { name: String },

    #[error("Invalid argument for {filter}: {key}={value}")]
    InvalidArgument {
        filter: String,
        key: String,
        value: String,
    },

    #[error("Filter chain not initialized")]
    NotInitialized,

    #[error("Invalid input format for {stage}: {format}")]
    InvalidFormat { stage: String, format: String },

    #[error("Stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("Unable to convert audio input format to output format at {stage}")]
    NegotiationFailed { stage: String },

    #[error("Filter chain output {actual} does not match requested {expected}")]
    OutputMismatch { expected: String, actual: String },

    #[error("Frame format {actual} does not match chain input {expected}")]
    InputMismatch { expected: String, actual: String },

    #[error("Duplicate filter label: {label}")]
    DuplicateLabel { label: String },

    #[error("No filter with label: {label}")]
    LabelNotFound { label: String },
}

impl FilterError {
    pub fn user_message(&self) -> String {
        match self {
            FilterError::UnknownFilter { name } => {
                format!("Audio filter '{}' does not exist", name)
            }
            FilterError::InvalidArgument { filter, key, value } => {
                format!("Audio filter '{}' rejected option {}={}", filter, key, value)
            }
            FilterError::NotInitialized => "Audio filter chain is not ready".to_string(),
            FilterError::InvalidFormat { stage, format } => {
                format!("Filter '{}' received an unusable format ({})", stage, format)
            }
            FilterError::StageFailed { stage, reason } => {
                format!("Audio filter '{}' failed: {}", stage, reason)
            }
            FilterError::NegotiationFailed { stage } => {
                format!("Could not find a format that filter '{}' accepts", stage)
            }
            FilterError::OutputMismatch { expected, actual } => {
                format!("Filters produce {} but the device needs {}", actual, expected)
            }
            FilterError::InputMismatch { expected, actual } => {
                format!("Decoder produced {} while filters expect {}", actual, expected)
            }
            FilterError::DuplicateLabel { label } => {
                format!("A filter labelled '{}' already exists", label)
            }
            FilterError::LabelNotFound { label } => {
                format!("No filter labelled '{}'", label)
            }
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            FilterError::UnknownFilter { .. } => vec![
                "Available filters: convert, volume, scaletempo, format".to_string(),
                "Check the filter list in the configuration file".to_string(),
            ],
            FilterError::InvalidArgument { .. } => vec![
                "Check the filter options in the configuration file".to_string(),
            ],
            FilterError::NegotiationFailed { .. }
            | FilterError::OutputMismatch { .. }
            | FilterError::InvalidFormat { .. } => vec![
                "Remove forced formats from the filter list".to_string(),
                "Try a different output device format".to_string(),
            ],
            FilterError::DuplicateLabel { .. } => vec![
                "Remove the existing filter first or choose another label".to_string(),
            ],
            _ => vec!["Try restarting playback".to_string()],
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            FilterError::DuplicateLabel { .. } => true, // Chain is left untouched
            FilterError::LabelNotFound { .. } => true,
            FilterError::InputMismatch { .. } => true, // Renegotiation fixes this
            _ => false,
        }
    }
}

/// Output device errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to open output device: {0}")]
    OpenFailed(String),

    #[error("Device rejected passthrough format: {format}")]
    PassthroughRejected { format: String },

    #[error("No output device open")]
    NotOpen,
}

impl DeviceError {
    pub fn user_message(&self) -> String {
        match self {
            DeviceError::OpenFailed(msg) => format!("Could not open audio output: {}", msg),
            DeviceError::PassthroughRejected { format } => {
                format!("Output does not accept {} passthrough, decoding instead", format)
            }
            DeviceError::NotOpen => "Audio output is not open".to_string(),
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            DeviceError::OpenFailed(_) => vec![
                "Check that the audio device is connected".to_string(),
                "Close other applications using exclusive audio access".to_string(),
            ],
            DeviceError::PassthroughRejected { .. } => vec![
                "Disable passthrough in the configuration".to_string(),
            ],
            DeviceError::NotOpen => vec!["Restart playback".to_string()],
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            DeviceError::OpenFailed(_) => false,
            DeviceError::PassthroughRejected { .. } => true, // Falls back to PCM
            DeviceError::NotOpen => true,
        }
    }
}

/// Audio decoding errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    #[error("Seek error: {0}")]
    SeekError(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),
}

impl DecodeError {
    pub fn user_message(&self) -> String {
        match self {
            DecodeError::UnsupportedFormat { format } => {
                format!("Audio format '{}' is not supported", format)
            }
            DecodeError::CorruptedFile(msg) => {
                format!("Audio file appears to be corrupted or damaged: {}", msg)
            }
            DecodeError::SeekError(msg) => {
                format!("Cannot seek in this audio file: {}", msg)
            }
            DecodeError::DecodeFailed(msg) => {
                format!("Failed to decode audio data: {}", msg)
            }
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            DecodeError::UnsupportedFormat { format } => vec![
                format!("Convert '{}' to a supported format", format),
                "Try `rpipe tone` to check the output side without a decoder".to_string(),
            ],
            DecodeError::CorruptedFile(_) => vec![
                "Decode the file with another tool to locate the damage".to_string(),
            ],
            DecodeError::SeekError(_) => vec![
                "Start playback without --start".to_string(),
            ],
            DecodeError::DecodeFailed(_) => vec![
                "Retry with passthrough disabled".to_string(),
            ],
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            DecodeError::UnsupportedFormat { .. } => false,
            DecodeError::CorruptedFile(_) => false,
            DecodeError::SeekError(_) => true,
            DecodeError::DecodeFailed(_) => false,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::ConfigDirNotFound => {
                "Cannot find or create configuration directory".to_string()
            }
            ConfigError::IoError(err) => {
                format!("Cannot access configuration file: {}", err)
            }
            ConfigError::SerializationError(_) => {
                "Configuration could not be written as TOML".to_string()
            }
            ConfigError::DeserializationError(_) => {
                "Configuration file is not valid TOML for this version".to_string()
            }
            ConfigError::InvalidValue(msg) => {
                format!("Configuration contains an invalid value: {}", msg)
            }
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            ConfigError::ConfigDirNotFound => vec![
                "Check that you have write permissions to your home directory".to_string(),
                "Try creating the directory manually: ~/.config/hires-pipeline/".to_string(),
            ],
            ConfigError::IoError(_) => vec![
                "Point --config at a writable file".to_string(),
            ],
            ConfigError::SerializationError(_) => vec![
                "Run `rpipe config reset` to start from defaults".to_string(),
            ],
            ConfigError::DeserializationError(_) | ConfigError::InvalidValue(_) => vec![
                "Run `rpipe config reset` to restore defaults".to_string(),
                "Compare the file with the output of `rpipe config show`".to_string(),
            ],
        }
    }

    pub fn is_recoverable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_pipeline_error_from_filter_error() {
        let filter_error = FilterError::UnknownFilter {
            name: "echo".to_string(),
        };
        let err: PipelineError = filter_error.into();

        match err {
            PipelineError::Filter(FilterError::UnknownFilter { name }) => {
                assert_eq!(name, "echo");
            }
            _ => panic!("Expected Filter error variant"),
        }
    }

    #[test]
    fn test_pipeline_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let err: PipelineError = io_error.into();
        assert!(matches!(err, PipelineError::File(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_filter_error_display() {
        let error = FilterError::NegotiationFailed {
            stage: "scaletempo".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Unable to convert audio input format to output format at scaletempo"
        );

        let error = FilterError::DuplicateLabel {
            label: "softvol".to_string(),
        };
        assert_eq!(format!("{}", error), "Duplicate filter label: softvol");

        let error = FilterError::InvalidArgument {
            filter: "format".to_string(),
            key: "rate".to_string(),
            value: "fast".to_string(),
        };
        assert_eq!(format!("{}", error), "Invalid argument for format: rate=fast");
    }

    #[test]
    fn test_device_error_display() {
        let error = DeviceError::OpenFailed("busy".to_string());
        assert_eq!(format!("{}", error), "Failed to open output device: busy");

        let error = DeviceError::PassthroughRejected {
            format: "spdif-ac3".to_string(),
        };
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_severity_mapping() {
        let err: PipelineError = FilterError::NotInitialized.into();
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.severity().log_level(), log::Level::Error);

        let err: PipelineError = DeviceError::PassthroughRejected {
            format: "spdif-dts".to_string(),
        }
        .into();
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert_eq!(err.severity().as_str(), "WARNING");

        let err: PipelineError = ConfigError::ConfigDirNotFound.into();
        assert_eq!(err.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_decode_error_display() {
        let error = DecodeError::UnsupportedFormat {
            format: "UNKNOWN".to_string(),
        };
        assert_eq!(format!("{}", error), "Unsupported format: UNKNOWN");

        let error = DecodeError::DecodeFailed("bad packet".to_string());
        assert_eq!(format!("{}", error), "Decode failed: bad packet");
    }

    #[test]
    fn test_recovery_suggestions_are_present() {
        let errors: Vec<PipelineError> = vec![
            FilterError::UnknownFilter { name: "x".to_string() }.into(),
            DeviceError::NotOpen.into(),
            DecodeError::SeekError("x".to_string()).into(),
            ConfigError::InvalidValue("speed".to_string()).into(),
        ];
        for err in errors {
            assert!(!err.recovery_suggestions().is_empty());
            assert!(!err.user_message().is_empty());
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied");
        let config_error = ConfigError::IoError(io_error);
        let err = PipelineError::Config(config_error);

        let mut current_error: &dyn Error = &err;
        let mut error_count = 0;
        while let Some(source) = current_error.source() {
            current_error = source;
            error_count += 1;
        }
        assert!(error_count >= 1);
    }
}
