use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of channels a layout may carry
pub const MAX_CHANNELS: usize = 8;

/// Sample encoding of an audio stream.
///
/// PCM encodings describe the nominal sample type of the stream; internally all PCM data is
/// carried as interleaved `f32`. The `Spdif*` encodings are compressed passthrough formats that
/// must reach the device untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleEncoding {
    #[default]
    Unknown,
    U8,
    S16,
    S32,
    Float,
    Double,
    SpdifAc3,
    SpdifEac3,
    SpdifDts,
    SpdifTrueHd,
}

impl SampleEncoding {
    /// Check if this is a real encoding (not the unset marker)
    pub fn is_known(&self) -> bool {
        !matches!(self, SampleEncoding::Unknown)
    }

    pub fn is_pcm(&self) -> bool {
        matches!(
            self,
            SampleEncoding::U8
                | SampleEncoding::S16
                | SampleEncoding::S32
                | SampleEncoding::Float
                | SampleEncoding::Double
        )
    }

    /// Check if this is a compressed passthrough encoding
    pub fn is_spdif(&self) -> bool {
        matches!(
            self,
            SampleEncoding::SpdifAc3
                | SampleEncoding::SpdifEac3
                | SampleEncoding::SpdifDts
                | SampleEncoding::SpdifTrueHd
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleEncoding::Float | SampleEncoding::Double)
    }

    /// Integer bit depth for quantizing PCM encodings, `None` for float and passthrough
    pub fn integer_bits(&self) -> Option<u32> {
        match self {
            SampleEncoding::U8 => Some(8),
            SampleEncoding::S16 => Some(16),
            SampleEncoding::S32 => Some(32),
            _ => None,
        }
    }

    /// Number of samples that must be written to a device as one unit.
    ///
    /// Passthrough streams can only be cut at codec frame boundaries.
    pub fn sample_alignment(&self) -> usize {
        match self {
            SampleEncoding::SpdifAc3 => 1536,
            SampleEncoding::SpdifEac3 => 1536 * 4,
            SampleEncoding::SpdifDts => 512,
            SampleEncoding::SpdifTrueHd => 15360,
            _ => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleEncoding::Unknown => "unknown",
            SampleEncoding::U8 => "u8",
            SampleEncoding::S16 => "s16",
            SampleEncoding::S32 => "s32",
            SampleEncoding::Float => "float",
            SampleEncoding::Double => "double",
            SampleEncoding::SpdifAc3 => "spdif-ac3",
            SampleEncoding::SpdifEac3 => "spdif-eac3",
            SampleEncoding::SpdifDts => "spdif-dts",
            SampleEncoding::SpdifTrueHd => "spdif-truehd",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" => Ok(SampleEncoding::U8),
            "s16" => Ok(SampleEncoding::S16),
            "s32" => Ok(SampleEncoding::S32),
            "float" | "f32" => Ok(SampleEncoding::Float),
            "double" | "f64" => Ok(SampleEncoding::Double),
            "spdif-ac3" => Ok(SampleEncoding::SpdifAc3),
            "spdif-eac3" => Ok(SampleEncoding::SpdifEac3),
            "spdif-dts" => Ok(SampleEncoding::SpdifDts),
            "spdif-truehd" => Ok(SampleEncoding::SpdifTrueHd),
            other => Err(format!("unknown sample encoding '{}'", other)),
        }
    }
}

/// Role of a single channel within a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Fl,
    Fr,
    Fc,
    Lfe,
    Bl,
    Br,
    Bc,
    Sl,
    Sr,
}

impl Speaker {
    pub fn is_left(&self) -> bool {
        matches!(self, Speaker::Fl | Speaker::Bl | Speaker::Sl)
    }

    pub fn is_right(&self) -> bool {
        matches!(self, Speaker::Fr | Speaker::Br | Speaker::Sr)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Fl => "fl",
            Speaker::Fr => "fr",
            Speaker::Fc => "fc",
            Speaker::Lfe => "lfe",
            Speaker::Bl => "bl",
            Speaker::Br => "br",
            Speaker::Bc => "bc",
            Speaker::Sl => "sl",
            Speaker::Sr => "sr",
        }
    }
}

/// Ordered set of channel roles. An empty layout means "unset".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelLayout {
    speakers: Vec<Speaker>,
}

impl ChannelLayout {
    /// Build a layout from explicit speakers. Fails on duplicates or too many channels.
    pub fn new(speakers: Vec<Speaker>) -> Option<Self> {
        if speakers.len() > MAX_CHANNELS {
            return None;
        }
        let mut sorted = speakers.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != speakers.len() {
            return None;
        }
        Some(Self { speakers })
    }

    pub fn unset() -> Self {
        Self::default()
    }

    pub fn mono() -> Self {
        Self { speakers: vec![Speaker::Fc] }
    }

    pub fn stereo() -> Self {
        Self { speakers: vec![Speaker::Fl, Speaker::Fr] }
    }

    pub fn surround51() -> Self {
        Self {
            speakers: vec![Speaker::Fl, Speaker::Fr, Speaker::Fc, Speaker::Lfe, Speaker::Bl, Speaker::Br],
        }
    }

    pub fn surround71() -> Self {
        Self {
            speakers: vec![
                Speaker::Fl,
                Speaker::Fr,
                Speaker::Fc,
                Speaker::Lfe,
                Speaker::Bl,
                Speaker::Br,
                Speaker::Sl,
                Speaker::Sr,
            ],
        }
    }

    /// Default layout for a plain channel count; unset for 0 or counts above the maximum
    pub fn default_for_count(count: usize) -> Self {
        use Speaker::*;
        let speakers = match count {
            1 => vec![Fc],
            2 => vec![Fl, Fr],
            3 => vec![Fl, Fr, Fc],
            4 => vec![Fl, Fr, Bl, Br],
            5 => vec![Fl, Fr, Fc, Bl, Br],
            6 => vec![Fl, Fr, Fc, Lfe, Bl, Br],
            7 => vec![Fl, Fr, Fc, Lfe, Bc, Sl, Sr],
            8 => vec![Fl, Fr, Fc, Lfe, Bl, Br, Sl, Sr],
            _ => Vec::new(),
        };
        Self { speakers }
    }

    pub fn count(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_set(&self) -> bool {
        !self.speakers.is_empty()
    }

    pub fn speakers(&self) -> &[Speaker] {
        &self.speakers
    }

    pub fn position(&self, speaker: Speaker) -> Option<usize> {
        self.speakers.iter().position(|s| *s == speaker)
    }

    /// Same channel set, ignoring order
    pub fn equals_reordered(&self, other: &ChannelLayout) -> bool {
        if self.count() != other.count() {
            return false;
        }
        let mut a = self.speakers.clone();
        let mut b = other.speakers.clone();
        a.sort();
        b.sort();
        a == b
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_set() {
            return f.write_str("unset");
        }
        let named = [
            (ChannelLayout::mono(), "mono"),
            (ChannelLayout::stereo(), "stereo"),
            (ChannelLayout::surround51(), "5.1"),
            (ChannelLayout::surround71(), "7.1"),
        ];
        if let Some((_, name)) = named.iter().find(|(layout, _)| layout == self) {
            return f.write_str(name);
        }
        let names: Vec<&str> = self.speakers.iter().map(|s| s.as_str()).collect();
        f.write_str(&names.join("-"))
    }
}

/// Audio format descriptor: rate, encoding and channel layout.
///
/// Any field may be unset (`0`, `Unknown`, empty layout) when used as a hint; a format
/// describing real data must be [`valid`](AudioFormat::is_valid).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub encoding: SampleEncoding,
    pub channels: ChannelLayout,
}

impl AudioFormat {
    pub fn new(rate: u32, encoding: SampleEncoding, channels: ChannelLayout) -> Self {
        Self {
            rate,
            encoding,
            channels,
        }
    }

    /// Convenience constructor for float PCM with a default layout
    pub fn pcm(rate: u32, channel_count: usize) -> Self {
        Self::new(rate, SampleEncoding::Float, ChannelLayout::default_for_count(channel_count))
    }

    pub fn unset() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.encoding.is_known() && self.channels.is_set()
    }

    /// Check if every field is unset
    pub fn is_unset(&self) -> bool {
        self.rate == 0 && !self.encoding.is_known() && !self.channels.is_set()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.count()
    }

    /// Equal apart from channel order
    pub fn equals_reordered(&self, other: &AudioFormat) -> bool {
        self.rate == other.rate
            && self.encoding == other.encoding
            && self.channels.equals_reordered(&other.channels)
    }

    /// Fill every unset field from `src`
    pub fn copy_unset_fields_from(&mut self, src: &AudioFormat) {
        if !self.encoding.is_known() {
            self.encoding = src.encoding;
        }
        if !self.channels.is_set() {
            self.channels = src.channels.clone();
        }
        if self.rate == 0 {
            self.rate = src.rate;
        }
    }

    pub fn sample_alignment(&self) -> usize {
        self.encoding.sample_alignment()
    }

    /// Playback duration of `samples` per-channel samples
    pub fn samples_to_seconds(&self, samples: usize) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        samples as f64 / self.rate as f64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {} {}ch {}",
            self.rate,
            self.channels,
            self.channels.count(),
            self.encoding
        )
    }
}

/// A chunk of interleaved audio with its own format and optional start timestamp.
///
/// "Samples" always counts per-channel sample frames, so a stereo frame holding
/// 960 samples has 1920 values in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub format: AudioFormat,
    pub data: Vec<f32>,
    pub pts: Option<f64>,
}

impl AudioFrame {
    pub fn new(format: AudioFormat, data: Vec<f32>, pts: Option<f64>) -> Self {
        debug_assert!(format.channel_count() == 0 || data.len() % format.channel_count() == 0);
        Self { format, data, pts }
    }

    pub fn silence(format: AudioFormat, samples: usize, pts: Option<f64>) -> Self {
        let data = vec![0.0; samples * format.channel_count()];
        Self { format, data, pts }
    }

    pub fn sample_count(&self) -> usize {
        let channels = self.format.channel_count();
        if channels == 0 {
            0
        } else {
            self.data.len() / channels
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.format.samples_to_seconds(self.sample_count())
    }

    pub fn end_pts(&self) -> Option<f64> {
        self.pts.map(|pts| pts + self.duration())
    }

    /// Drop `samples` from the front, advancing the timestamp accordingly
    pub fn skip_samples(&mut self, samples: usize) {
        let samples = samples.min(self.sample_count());
        let channels = self.format.channel_count();
        self.data.drain(..samples * channels);
        if let Some(pts) = self.pts.as_mut() {
            *pts += self.format.samples_to_seconds(samples);
        }
    }
}

/// Audio output synchronization state, ordered for threshold comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PlaybackStatus {
    /// Determining the sample offset needed to align with the reference clock
    Syncing,
    /// Accumulating enough buffered samples before the device may start
    Filling,
    /// Buffered sufficiently, waiting for a paired video stream to start
    Ready,
    Playing,
    /// Everything was handed to the device, waiting for it to finish
    Draining,
    Eof,
}

impl PlaybackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Syncing => "syncing",
            PlaybackStatus::Filling => "filling",
            PlaybackStatus::Ready => "ready",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Draining => "draining",
            PlaybackStatus::Eof => "eof",
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validity() {
        assert!(AudioFormat::pcm(48000, 2).is_valid());
        assert!(!AudioFormat::unset().is_valid());
        assert!(AudioFormat::unset().is_unset());

        let no_rate = AudioFormat::new(0, SampleEncoding::Float, ChannelLayout::stereo());
        assert!(!no_rate.is_valid());

        let no_encoding = AudioFormat::new(48000, SampleEncoding::Unknown, ChannelLayout::stereo());
        assert!(!no_encoding.is_valid());

        let no_channels = AudioFormat::new(48000, SampleEncoding::Float, ChannelLayout::unset());
        assert!(!no_channels.is_valid());
    }

    #[test]
    fn test_equal_reordered_ignores_order_only() {
        let a = AudioFormat::new(48000, SampleEncoding::Float, ChannelLayout::stereo());
        let swapped = ChannelLayout::new(vec![Speaker::Fr, Speaker::Fl]).unwrap();
        let b = AudioFormat::new(48000, SampleEncoding::Float, swapped);

        assert_ne!(a, b);
        assert!(a.equals_reordered(&b));

        let c = AudioFormat::new(48000, SampleEncoding::Float, ChannelLayout::mono());
        assert!(!a.equals_reordered(&c));
    }

    #[test]
    fn test_copy_unset_fields() {
        let mut hint = AudioFormat::new(44100, SampleEncoding::Unknown, ChannelLayout::unset());
        let natural = AudioFormat::pcm(48000, 6);
        hint.copy_unset_fields_from(&natural);

        assert_eq!(hint.rate, 44100);
        assert_eq!(hint.encoding, SampleEncoding::Float);
        assert_eq!(hint.channels, ChannelLayout::surround51());
    }

    #[test]
    fn test_channel_layout_rejects_duplicates() {
        assert!(ChannelLayout::new(vec![Speaker::Fl, Speaker::Fl]).is_none());
        assert!(ChannelLayout::new(vec![Speaker::Fl, Speaker::Fr]).is_some());
        assert_eq!(ChannelLayout::default_for_count(9).count(), 0);
    }

    #[test]
    fn test_layout_display() {
        assert_eq!(ChannelLayout::stereo().to_string(), "stereo");
        assert_eq!(ChannelLayout::surround51().to_string(), "5.1");
        let custom = ChannelLayout::new(vec![Speaker::Fc, Speaker::Lfe]).unwrap();
        assert_eq!(custom.to_string(), "fc-lfe");
        assert_eq!(AudioFormat::pcm(48000, 2).to_string(), "48000Hz stereo 2ch float");
    }

    #[test]
    fn test_encoding_parse_and_alignment() {
        assert_eq!("s16".parse::<SampleEncoding>().unwrap(), SampleEncoding::S16);
        assert_eq!("F32".parse::<SampleEncoding>().unwrap(), SampleEncoding::Float);
        assert!("mp3".parse::<SampleEncoding>().is_err());

        assert_eq!(SampleEncoding::Float.sample_alignment(), 1);
        assert_eq!(SampleEncoding::SpdifAc3.sample_alignment(), 1536);
        assert!(SampleEncoding::SpdifDts.is_spdif());
        assert!(!SampleEncoding::SpdifDts.is_pcm());
    }

    #[test]
    fn test_frame_skip_advances_pts() {
        let format = AudioFormat::pcm(1000, 2);
        let mut frame = AudioFrame::new(format, (0..20).map(|v| v as f32).collect(), Some(1.0));
        assert_eq!(frame.sample_count(), 10);
        assert!((frame.end_pts().unwrap() - 1.01).abs() < 1e-9);

        frame.skip_samples(4);
        assert_eq!(frame.sample_count(), 6);
        assert_eq!(frame.data[0], 8.0);
        assert!((frame.pts.unwrap() - 1.004).abs() < 1e-9);
    }

    #[test]
    fn test_status_ordering() {
        assert!(PlaybackStatus::Syncing < PlaybackStatus::Filling);
        assert!(PlaybackStatus::Ready <= PlaybackStatus::Ready);
        assert!(PlaybackStatus::Draining >= PlaybackStatus::Draining);
        assert!(PlaybackStatus::Eof > PlaybackStatus::Playing);
    }

    #[test]
    fn test_format_toml_roundtrip_shape() {
        let format = AudioFormat::new(44100, SampleEncoding::SpdifAc3, ChannelLayout::stereo());
        let json = serde_json::to_string(&format).unwrap();
        assert!(json.contains("spdif-ac3"));
        assert!(json.contains("\"fl\""));
    }
}
