use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DeviceError;
use crate::models::{AudioFormat, ChannelLayout, SampleEncoding};

/// An opened output device accepting interleaved samples in one fixed format
pub trait OutputDevice: Send {
    fn name(&self) -> &str;

    /// Format the device was actually opened with
    fn format(&self) -> &AudioFormat;

    /// Number of samples the device can take right now
    fn space_available(&self) -> usize;

    /// Queue interleaved samples; returns how many per-channel samples were accepted
    fn write(&mut self, samples: &[f32], final_chunk: bool) -> usize;

    /// Seconds until a sample written now becomes audible
    fn delay(&self) -> f64;

    /// Discard everything queued
    fn reset(&mut self);

    /// Play out everything queued
    fn drain(&mut self);

    fn is_drained(&self) -> bool;

    /// Devices without a real clock, such as file writers
    fn is_untimed(&self) -> bool {
        false
    }

    /// Consume a pending request to reopen the device
    fn take_reload_request(&mut self) -> bool;
}

/// Opens devices, negotiating the actual format from a preferred one
pub trait DeviceOpener: Send {
    fn open(
        &mut self,
        preferred: &AudioFormat,
        passthrough: bool,
    ) -> Result<Box<dyn OutputDevice>, DeviceError>;
}

/// What a device can play
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub name: String,
    /// Empty means any rate
    pub supported_sample_rates: Vec<u32>,
    pub max_channels: usize,
    pub supports_passthrough: bool,
    /// Fixed format the device always opens with, unset fields follow the request
    pub pinned: AudioFormat,
    pub buffer_seconds: f64,
    pub untimed: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            name: "null".to_string(),
            supported_sample_rates: Vec::new(),
            max_channels: crate::models::MAX_CHANNELS,
            supports_passthrough: false,
            pinned: AudioFormat::unset(),
            buffer_seconds: 0.2,
            untimed: false,
        }
    }
}

impl DeviceCapabilities {
    /// Device that always opens with exactly this format
    pub fn pinned(format: AudioFormat) -> Self {
        Self {
            pinned: format,
            ..Self::default()
        }
    }

    /// Pick the closest format this device can play
    pub fn best_format(&self, preferred: &AudioFormat, passthrough: bool) -> AudioFormat {
        let mut format = self.pinned.clone();
        format.copy_unset_fields_from(preferred);

        if format.encoding.is_spdif() && !(passthrough && self.supports_passthrough) {
            format.encoding = SampleEncoding::Float;
            format.channels = ChannelLayout::stereo();
        }

        if !self.supported_sample_rates.is_empty()
            && !self.supported_sample_rates.contains(&format.rate)
        {
            // Lowest supported rate at or above the request, else the highest one
            let above = self
                .supported_sample_rates
                .iter()
                .copied()
                .filter(|r| *r >= format.rate)
                .min();
            let highest = self.supported_sample_rates.iter().copied().max();
            if let Some(rate) = above.or(highest) {
                format.rate = rate;
            }
        }

        if format.channel_count() > self.max_channels {
            format.channels = ChannelLayout::default_for_count(self.max_channels);
        }
        format
    }
}

/// Counters shared between a null device and whoever drives it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NullDeviceStats {
    pub opens: usize,
    pub written_samples: usize,
    pub write_calls: usize,
    pub final_chunks: usize,
    pub resets: usize,
    pub drains: usize,
    pub queued_samples: usize,
    pub last_format: Option<AudioFormat>,
}

#[derive(Debug, Default)]
struct NullState {
    stats: NullDeviceStats,
    reload_requested: bool,
    paused: bool,
}

/// Handle to the shared state of null devices, used to move their clock forward
#[derive(Debug, Clone, Default)]
pub struct NullDeviceHandle {
    state: Arc<Mutex<NullState>>,
}

impl NullDeviceHandle {
    fn lock(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let the device play `samples` of its queue
    pub fn play(&self, samples: usize) {
        let mut state = self.lock();
        if !state.paused {
            state.stats.queued_samples = state.stats.queued_samples.saturating_sub(samples);
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }

    pub fn request_reload(&self) {
        self.lock().reload_requested = true;
    }

    pub fn stats(&self) -> NullDeviceStats {
        self.lock().stats.clone()
    }
}

/// Output device that discards audio, with a queue that only empties when told to
#[derive(Debug)]
pub struct NullDevice {
    name: String,
    format: AudioFormat,
    capacity: usize,
    untimed: bool,
    handle: NullDeviceHandle,
}

impl NullDevice {
    pub fn new(name: &str, format: AudioFormat, buffer_seconds: f64, handle: NullDeviceHandle) -> Self {
        let capacity = ((format.rate as f64 * buffer_seconds) as usize).max(format.sample_alignment());
        Self {
            name: name.to_string(),
            format,
            capacity,
            untimed: false,
            handle,
        }
    }
}

impl OutputDevice for NullDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn space_available(&self) -> usize {
        if self.untimed {
            return self.capacity;
        }
        self.capacity.saturating_sub(self.handle.lock().stats.queued_samples)
    }

    fn write(&mut self, samples: &[f32], final_chunk: bool) -> usize {
        let channels = self.format.channel_count().max(1);
        let offered = samples.len() / channels;
        let accepted = offered.min(self.space_available());

        let mut state = self.handle.lock();
        state.stats.write_calls += 1;
        state.stats.written_samples += accepted;
        if !self.untimed {
            state.stats.queued_samples += accepted;
        }
        if final_chunk {
            state.stats.final_chunks += 1;
        }
        accepted
    }

    fn delay(&self) -> f64 {
        self.format
            .samples_to_seconds(self.handle.lock().stats.queued_samples)
    }

    fn reset(&mut self) {
        let mut state = self.handle.lock();
        state.stats.resets += 1;
        state.stats.queued_samples = 0;
    }

    fn drain(&mut self) {
        let mut state = self.handle.lock();
        state.stats.drains += 1;
        state.stats.queued_samples = 0;
    }

    fn is_drained(&self) -> bool {
        self.handle.lock().stats.queued_samples == 0
    }

    fn is_untimed(&self) -> bool {
        self.untimed
    }

    fn take_reload_request(&mut self) -> bool {
        std::mem::take(&mut self.handle.lock().reload_requested)
    }
}

/// Opens [`NullDevice`]s according to a capability description
#[derive(Debug, Clone, Default)]
pub struct NullOpener {
    pub capabilities: DeviceCapabilities,
    /// Refuse every open request
    pub fail: bool,
    handle: NullDeviceHandle,
}

impl NullOpener {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            fail: false,
            handle: NullDeviceHandle::default(),
        }
    }

    pub fn handle(&self) -> NullDeviceHandle {
        self.handle.clone()
    }
}

impl DeviceOpener for NullOpener {
    fn open(
        &mut self,
        preferred: &AudioFormat,
        passthrough: bool,
    ) -> Result<Box<dyn OutputDevice>, DeviceError> {
        if self.fail {
            return Err(DeviceError::OpenFailed(format!(
                "{} refused to open",
                self.capabilities.name
            )));
        }

        let format = self.capabilities.best_format(preferred, passthrough);
        if !format.is_valid() {
            return Err(DeviceError::OpenFailed(format!("unusable format {}", format)));
        }
        if format != *preferred {
            debug!("Device changed format {} -> {}", preferred, format);
        }
        info!("Opened {} with {}", self.capabilities.name, format);

        {
            let mut state = self.handle.lock();
            state.stats.opens += 1;
            state.stats.queued_samples = 0;
            state.stats.last_format = Some(format.clone());
        }

        let mut device = NullDevice::new(
            &self.capabilities.name,
            format,
            self.capabilities.buffer_seconds,
            self.handle.clone(),
        );
        device.untimed = self.capabilities.untimed;
        Ok(Box::new(device))
    }
}
