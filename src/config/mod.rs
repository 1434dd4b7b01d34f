use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::{AudioFormat, ChannelLayout, SampleEncoding};

/// Pipeline configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gapless: GaplessMode,
    pub output: OutputHints,
    pub sync: SyncOptions,
    pub playback: PlaybackOptions,
    pub device: DeviceOptions,
    /// User-requested filter stages, in chain order
    pub filters: Vec<FilterSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gapless: GaplessMode::Weak,
            output: OutputHints::default(),
            sync: SyncOptions::default(),
            playback: PlaybackOptions::default(),
            device: DeviceOptions::default(),
            filters: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.playback.speed > 0.0 && self.playback.speed.is_finite()) {
            return Err(ConfigError::InvalidValue(format!("speed={}", self.playback.speed)));
        }
        if self.playback.volume < 0.0 {
            return Err(ConfigError::InvalidValue(format!("volume={}", self.playback.volume)));
        }
        if self.device.buffer_seconds <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "buffer_seconds={}",
                self.device.buffer_seconds
            )));
        }
        if self.sync.sync_audio_drop_size < 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "sync_audio_drop_size={}",
                self.sync.sync_audio_drop_size
            )));
        }
        if let Some(channels) = self.output.channels {
            if channels == 0 || channels > crate::models::MAX_CHANNELS {
                return Err(ConfigError::InvalidValue(format!("channels={}", channels)));
            }
        }
        Ok(())
    }
}

/// Whether the device is kept open across format changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaplessMode {
    /// Reopen the device on every format change
    Off,
    /// Reopen only when the decoder format changes
    Weak,
    /// Keep the device, let the filter chain convert
    Strict,
}

impl GaplessMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, GaplessMode::Off)
    }
}

/// Preferred device format. Unset fields are inherited from the decoded stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputHints {
    pub rate: Option<u32>,
    pub encoding: Option<SampleEncoding>,
    pub channels: Option<usize>,
}

impl OutputHints {
    pub fn to_format(&self) -> AudioFormat {
        AudioFormat::new(
            self.rate.unwrap_or(0),
            self.encoding.unwrap_or(SampleEncoding::Unknown),
            self.channels
                .map(ChannelLayout::default_for_count)
                .unwrap_or_default(),
        )
    }
}

/// A/V synchronization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Skip or pad audio at start so it lines up with the reference clock
    pub initial_audio_sync: bool,
    /// Seconds added to the audio position relative to video
    pub audio_delay: f64,
    /// Size of one drop/duplicate correction in seconds
    pub sync_audio_drop_size: f64,
    /// Percent of audio that may be altered for sync
    pub sync_max_audio_change: f64,
    /// Percent of video speed change allowed for sync
    pub sync_max_video_change: f64,
    /// Correct display-sync drift by dropping or duplicating audio
    pub display_sync_drop: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            initial_audio_sync: true,
            audio_delay: 0.0,
            sync_audio_drop_size: 0.020,
            sync_max_audio_change: 0.125,
            sync_max_video_change: 1.0,
            display_sync_drop: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayGainMode {
    Off,
    Track,
    Album,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayGainOptions {
    pub mode: ReplayGainMode,
    /// Extra gain in dB
    pub preamp: f32,
    /// Allow clipping instead of limiting the gain by the peak
    pub clip: bool,
    /// Gain in dB for files without replay gain data
    pub fallback: f32,
}

impl Default for ReplayGainOptions {
    fn default() -> Self {
        Self {
            mode: ReplayGainMode::Off,
            preamp: 0.0,
            clip: true,
            fallback: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    pub speed: f64,
    /// Keep pitch when the speed changes
    pub pitch_correction: bool,
    /// Software volume in percent, cubic curve
    pub volume: f32,
    pub mute: bool,
    pub replaygain: ReplayGainOptions,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch_correction: true,
            volume: 100.0,
            mute: false,
            replaygain: ReplayGainOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Seconds to wait after opening the device before writing
    pub wait_open: f64,
    /// Amount of audio the device buffers, in seconds
    pub buffer_seconds: f64,
    /// Send compressed streams to the device undecoded when possible
    pub passthrough: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            wait_open: 0.0,
            buffer_seconds: 0.2,
            passthrough: false,
        }
    }
}

/// One requested filter stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl FilterSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            args: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    config: PipelineConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    /// Use an explicit configuration file instead of the default location
    pub fn with_path(config_path: PathBuf) -> Result<Self, ConfigError> {
        let config = Self::load_config(&config_path)?;
        config.validate()?;
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn get_config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update_config<F>(&mut self, updater: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut PipelineConfig),
    {
        let mut updated = self.config.clone();
        updater(&mut updated);
        updated.validate()?;
        self.config = updated;
        self.save_config()
    }

    pub fn set_speed(&mut self, speed: f64) -> Result<(), ConfigError> {
        self.update_config(|config| config.playback.speed = speed)
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<(), ConfigError> {
        self.update_config(|config| config.playback.volume = volume.max(0.0))
    }

    pub fn set_gapless(&mut self, mode: GaplessMode) -> Result<(), ConfigError> {
        self.update_config(|config| config.gapless = mode)
    }

    pub fn add_filter(&mut self, spec: FilterSpec) -> Result<(), ConfigError> {
        self.update_config(|config| config.filters.push(spec))
    }

    /// Remove filters with the given label; returns whether anything was removed
    pub fn remove_filter(&mut self, label: &str) -> Result<bool, ConfigError> {
        let before = self.config.filters.len();
        self.update_config(|config| {
            config
                .filters
                .retain(|f| f.label.as_deref() != Some(label))
        })?;
        Ok(self.config.filters.len() != before)
    }

    pub fn reset_to_defaults(&mut self) -> Result<(), ConfigError> {
        self.config = PipelineConfig::default();
        self.save_config()
    }

    fn get_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::home_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join(".config")
            .join("hires-pipeline");

        std::fs::create_dir_all(&config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
        if !path.exists() {
            return Ok(PipelineConfig::default());
        }

        let config_content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&config_content)?;
        Ok(config)
    }

    fn save_config(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let config_content = toml::to_string_pretty(&self.config)?;
        std::fs::write(&self.config_path, config_content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let config_manager = ConfigManager {
            config: PipelineConfig::default(),
            config_path,
        };

        (config_manager, temp_dir)
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();

        assert_eq!(config.gapless, GaplessMode::Weak);
        assert!(config.sync.initial_audio_sync);
        assert_eq!(config.playback.speed, 1.0);
        assert_eq!(config.playback.volume, 100.0);
        assert!(config.filters.is_empty());
        assert!(config.output.to_format().is_unset());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = PipelineConfig::default();
        config.gapless = GaplessMode::Strict;
        config.output.rate = Some(48000);
        config.filters.push(FilterSpec::new("volume").with_label("vol").with_arg("volume", "0.5"));

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: PipelineConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config, deserialized);
        assert!(serialized.contains("strict"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_text = r#"
            gapless = "off"

            [playback]
            speed = 1.5

            [[filters]]
            name = "scaletempo"
        "#;
        let config: PipelineConfig = toml::from_str(toml_text).unwrap();

        assert_eq!(config.gapless, GaplessMode::Off);
        assert_eq!(config.playback.speed, 1.5);
        assert!(config.playback.pitch_correction);
        assert_eq!(config.filters.len(), 1);
        assert!(config.filters[0].enabled);
        assert_eq!(config.sync, SyncOptions::default());
    }

    #[test]
    fn test_output_hints_to_format() {
        let hints = OutputHints {
            rate: Some(44100),
            encoding: None,
            channels: Some(6),
        };
        let format = hints.to_format();

        assert_eq!(format.rate, 44100);
        assert_eq!(format.encoding, SampleEncoding::Unknown);
        assert_eq!(format.channels, ChannelLayout::surround51());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.playback.speed = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let mut config = PipelineConfig::default();
        config.output.channels = Some(12);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.device.buffer_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_config() {
        let (mut config_manager, _temp_dir) = create_test_config_manager();

        config_manager.set_speed(1.25).unwrap();
        config_manager.set_volume(-5.0).unwrap();

        let loaded = ConfigManager::load_config(&config_manager.config_path).unwrap();
        assert_eq!(loaded.playback.speed, 1.25);
        assert_eq!(loaded.playback.volume, 0.0);
    }

    #[test]
    fn test_invalid_update_is_not_applied() {
        let (mut config_manager, _temp_dir) = create_test_config_manager();

        assert!(config_manager.set_speed(-1.0).is_err());
        assert_eq!(config_manager.get_config().playback.speed, 1.0);
    }

    #[test]
    fn test_add_and_remove_filter() {
        let (mut config_manager, _temp_dir) = create_test_config_manager();

        config_manager
            .add_filter(FilterSpec::new("scaletempo").with_label("tempo"))
            .unwrap();
        assert_eq!(config_manager.get_config().filters.len(), 1);

        assert!(config_manager.remove_filter("tempo").unwrap());
        assert!(!config_manager.remove_filter("tempo").unwrap());
        assert!(config_manager.get_config().filters.is_empty());
    }

    #[test]
    fn test_load_nonexistent_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigManager::load_config(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_load_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        fs::write(&config_path, "invalid toml content [[[").unwrap();

        match ConfigManager::load_config(&config_path) {
            Err(ConfigError::DeserializationError(_)) => {}
            other => panic!("Expected DeserializationError, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_with_path_and_reset() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("nested").join("config.toml");

        let mut config_manager = ConfigManager::with_path(nested_path.clone()).unwrap();
        config_manager.set_gapless(GaplessMode::Off).unwrap();
        assert!(nested_path.exists());

        config_manager.reset_to_defaults().unwrap();
        let reloaded = ConfigManager::with_path(nested_path).unwrap();
        assert_eq!(reloaded.get_config().gapless, GaplessMode::Weak);
    }
}
