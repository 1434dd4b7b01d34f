use std::fs::File;
use std::path::Path;

use log::{debug, warn};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey, Value};
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use super::decode::{FrameSource, ReplayGainData, SourceStatus};
use crate::error::DecodeError;
use crate::models::{AudioFormat, AudioFrame, ChannelLayout, SampleEncoding};

/// Consecutive undecodable packets tolerated before giving up
const MAX_DECODE_RETRIES: usize = 3;

/// Frame source decoding a file on disk with symphonia
pub struct SymphoniaSource {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    replaygain: Option<ReplayGainData>,
    decode_errors: usize,
    name: String,
}

impl SymphoniaSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| DecodeError::DecodeFailed(format!("Failed to open file: {}", e)))?;
        let media_source = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let mut probed = symphonia::default::get_probe()
            .format(&hint, media_source, &format_opts, &MetadataOptions::default())
            .map_err(|e| DecodeError::UnsupportedFormat {
                format: format!("unrecognized container: {}", e),
            })?;

        let track = probed
            .format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::UnsupportedFormat {
                format: "no audio track found".to_string(),
            })?;
        let track_id = track.id;
        let time_base = track.codec_params.time_base;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::UnsupportedFormat {
                format: format!("no decoder: {}", e),
            })?;

        // Tags can live in the container or ahead of it (ID3)
        let mut replaygain = None;
        if let Some(revision) = probed.format.metadata().current() {
            replaygain = read_replaygain(revision);
        }
        if replaygain.is_none() {
            if let Some(metadata) = probed.metadata.get() {
                if let Some(revision) = metadata.current() {
                    replaygain = read_replaygain(revision);
                }
            }
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!("Opened {} (track {}, replaygain {:?})", name, track_id, replaygain);

        Ok(Self {
            format_reader: probed.format,
            decoder,
            track_id,
            time_base,
            replaygain,
            decode_errors: 0,
            name,
        })
    }

    fn packet_pts(&self, ts: u64) -> Option<f64> {
        self.time_base.map(|tb| {
            let time = tb.calc_time(ts);
            time.seconds as f64 + time.frac
        })
    }
}

impl FrameSource for SymphoniaSource {
    fn request_frame(&mut self) -> Result<SourceStatus, DecodeError> {
        let packet = match self.format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(SourceStatus::Eof);
            }
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                return Ok(SourceStatus::Again);
            }
            Err(err) => {
                return Err(DecodeError::DecodeFailed(format!("Failed to read packet: {}", err)));
            }
        };

        if packet.track_id() != self.track_id {
            return Ok(SourceStatus::Again);
        }
        let pts = self.packet_pts(packet.ts());

        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                self.decode_errors = 0;
                Ok(convert_buffer(decoded, pts)
                    .map(SourceStatus::Frame)
                    .unwrap_or(SourceStatus::Again))
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                self.decode_errors += 1;
                if self.decode_errors > MAX_DECODE_RETRIES {
                    return Err(DecodeError::CorruptedFile(msg.to_string()));
                }
                warn!("Skipping undecodable packet in {}: {}", self.name, msg);
                Ok(SourceStatus::Again)
            }
            Err(e) => Err(DecodeError::DecodeFailed(format!("Failed to decode packet: {}", e))),
        }
    }

    fn reset(&mut self) {
        self.decoder.reset();
        self.decode_errors = 0;
    }

    fn seek(&mut self, seconds: f64) -> Result<(), DecodeError> {
        self.format_reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| DecodeError::SeekError(format!("Seek failed: {}", e)))?;
        self.decoder.reset();
        Ok(())
    }

    fn replaygain(&self) -> Option<ReplayGainData> {
        self.replaygain
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Nominal encoding of a decoded buffer; the samples themselves are always carried as f32
fn buffer_encoding(buffer: &AudioBufferRef) -> SampleEncoding {
    match buffer {
        AudioBufferRef::U8(_) | AudioBufferRef::S8(_) => SampleEncoding::U8,
        AudioBufferRef::U16(_) | AudioBufferRef::S16(_) => SampleEncoding::S16,
        AudioBufferRef::U24(_)
        | AudioBufferRef::S24(_)
        | AudioBufferRef::U32(_)
        | AudioBufferRef::S32(_) => SampleEncoding::S32,
        AudioBufferRef::F32(_) => SampleEncoding::Float,
        AudioBufferRef::F64(_) => SampleEncoding::Double,
    }
}

/// Interleave a decoded buffer into a frame. Returns `None` for empty buffers.
fn convert_buffer(decoded: AudioBufferRef, pts: Option<f64>) -> Option<AudioFrame> {
    let spec = *decoded.spec();
    if decoded.frames() == 0 {
        return None;
    }
    let format = AudioFormat::new(
        spec.rate,
        buffer_encoding(&decoded),
        ChannelLayout::default_for_count(spec.channels.count()),
    );

    let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
    samples.copy_interleaved_ref(decoded);
    Some(AudioFrame::new(format, samples.samples().to_vec(), pts))
}

fn parse_db(value: &Value) -> Option<f32> {
    match value {
        Value::Float(v) => Some(*v as f32),
        Value::String(s) => s
            .trim()
            .trim_end_matches("dB")
            .trim_end_matches("db")
            .trim()
            .parse()
            .ok(),
        _ => None,
    }
}

fn read_replaygain(revision: &MetadataRevision) -> Option<ReplayGainData> {
    let mut data = ReplayGainData::default();
    let mut found = false;

    for tag in revision.tags() {
        let Some(key) = tag.std_key else {
            continue;
        };
        let Some(value) = parse_db(&tag.value) else {
            continue;
        };
        match key {
            StandardTagKey::ReplayGainTrackGain => data.track_gain = value,
            StandardTagKey::ReplayGainTrackPeak => data.track_peak = value,
            StandardTagKey::ReplayGainAlbumGain => data.album_gain = value,
            StandardTagKey::ReplayGainAlbumPeak => data.album_peak = value,
            _ => continue,
        }
        found = true;
    }

    found.then_some(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_wav(rate: u32, channels: u16, samples: &[i16]) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_open_nonexistent_file() {
        match SymphoniaSource::open("/nonexistent/file.wav") {
            Err(DecodeError::DecodeFailed(msg)) => assert!(msg.contains("Failed to open file")),
            other => panic!("unexpected: {:?}", other.map(|s| s.describe())),
        }
    }

    #[test]
    fn test_open_garbage_is_unsupported() {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(b"definitely not audio").unwrap();
        assert!(matches!(
            SymphoniaSource::open(file.path()),
            Err(DecodeError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_decodes_wav_frames() {
        let samples: Vec<i16> = (0..4410 * 2).map(|i| (i % 200) as i16 * 100).collect();
        let file = write_wav(44100, 2, &samples);
        let mut source = SymphoniaSource::open(file.path()).unwrap();

        let mut total = 0;
        let mut first_format = None;
        loop {
            match source.request_frame().unwrap() {
                SourceStatus::Frame(frame) => {
                    first_format.get_or_insert(frame.format.clone());
                    total += frame.sample_count();
                }
                SourceStatus::Again => continue,
                _ => break,
            }
        }

        let format = first_format.unwrap();
        assert_eq!(format.rate, 44100);
        assert_eq!(format.encoding, SampleEncoding::S16);
        assert_eq!(format.channels, ChannelLayout::stereo());
        assert_eq!(total, 4410);
    }
}
