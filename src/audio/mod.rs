//! Output side of the pipeline: decode bridge, output chain, device and the
//! synchronization state machine that ties them together.

pub mod buffer;
pub mod chain;
pub mod decode;
pub mod device;
pub mod player;
pub mod resampler;
pub mod symphonia_source;
pub mod sync;

#[cfg(test)]
mod tests;

pub use buffer::{AudioRingBuffer, BufferStatus};
pub use chain::{OutputChain, PullRequest, PullStatus};
pub use decode::{DecodeBridge, DecodeStatus, FrameSource, ReplayGainData, SourceStatus, ToneSource};
pub use device::{
    DeviceCapabilities, DeviceOpener, NullDevice, NullDeviceHandle, NullDeviceStats, NullOpener,
    OutputDevice,
};
pub use player::{AudioPlayer, VideoReference, Wakeup};
pub use resampler::LinearResampler;
pub use symphonia_source::SymphoniaSource;
pub use sync::{Clock, ManualClock, SyncSession, SystemClock};
