//! Capability surface over a spatialized, OpenAL-family audio driver.
//!
//! This crate does not talk to a real device. Device enumeration, HRTF
//! configuration and the concrete driver binding are external collaborators
//! (see the crate's own non-goals) — what lives here is the trait the audio
//! engine programs against, plus a [`mock`] implementation good enough to
//! drive the engine's tests deterministically.

pub mod mock;

use std::fmt;

/// Opaque handle to a backend-owned playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceHandle(pub u32);

/// Opaque handle to a backend-owned PCM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

/// Playback state as reported by the backend for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// PCM encoding of a buffer upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    IntegerPcm,
    Float,
}

/// Format of one buffer's worth of PCM data.
#[derive(Debug, Clone, Copy)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub encoding: SampleEncoding,
}

/// A scalar source parameter the engine writes every tick when dirty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceParam {
    Gain(f32),
    Pitch(f32),
    Position([f32; 3]),
    Velocity([f32; 3]),
    Looping(bool),
    /// Direct-channel remix (mono/stereo passthrough, no panning/attenuation).
    DirectChannels(bool),
    /// Whether the backend spatializes this source at all.
    SpatializationEnabled(bool),
    /// `true` ⇒ position/velocity are relative to the listener, not world-space.
    RelativeToListener(bool),
    RolloffFactor(f32),
    ReferenceDistance(f32),
    MaxDistance(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerOrientation {
    pub forward: [f32; 3],
    pub up: [f32; 3],
}

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("no free source available in the backend's device-side pool")]
    SourcePoolExhausted,
    #[error("unknown source handle {0:?}")]
    UnknownSource(SourceHandle),
    #[error("unknown buffer handle {0:?}")]
    UnknownBuffer(BufferHandle),
    #[error("device error: {0}")]
    Device(String),
    #[error("operation unsupported by this backend: {0}")]
    Unsupported(String),
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceState::Initial => "Initial",
            SourceState::Playing => "Playing",
            SourceState::Paused => "Paused",
            SourceState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// The minimum capability set the engine expects from a spatialized audio
/// backend. Every method here maps to a single OpenAL-family call; batching
/// (e.g. bulk source creation) is left to implementations that can usefully
/// exploit it.
pub trait AudioBackend: Send {
    /// Rent a source from the backend's own device-side pool.
    fn create_source(&mut self) -> Result<SourceHandle, BackendError>;
    fn destroy_source(&mut self, source: SourceHandle) -> Result<(), BackendError>;

    fn create_buffer(&mut self, format: PcmFormat, pcm: &[u8]) -> Result<BufferHandle, BackendError>;
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError>;
    /// Re-specify the data of a buffer the caller already owns (must not be
    /// queued on any source). Lets a streaming generator refill a fixed set
    /// of buffer handles chunk after chunk instead of churning handles.
    fn rebuffer(&mut self, buffer: BufferHandle, format: PcmFormat, pcm: &[u8]) -> Result<(), BackendError>;

    /// Attach a single immutable buffer to a source (static playback).
    fn set_source_buffer(&mut self, source: SourceHandle, buffer: Option<BufferHandle>) -> Result<(), BackendError>;

    /// Append a buffer to a source's streaming queue.
    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<(), BackendError>;
    /// Pop up to `max` buffers the backend has finished consuming, oldest first.
    fn unqueue_processed_buffers(&mut self, source: SourceHandle, max: usize) -> Result<Vec<BufferHandle>, BackendError>;
    /// Number of buffers currently queued (processed or not) on the source.
    fn queued_buffer_count(&self, source: SourceHandle) -> Result<usize, BackendError>;
    /// Forcibly unqueue every buffer on `source`, processed or not, and
    /// return them oldest-first. Used when a voice is disconnected from its
    /// source (stop / demotion / dispose) so its generator can reclaim the
    /// buffers regardless of playback progress.
    fn clear_queue(&mut self, source: SourceHandle) -> Result<Vec<BufferHandle>, BackendError>;

    fn set_source_param(&mut self, source: SourceHandle, param: SourceParam) -> Result<(), BackendError>;

    fn play(&mut self, source: SourceHandle) -> Result<(), BackendError>;
    fn pause(&mut self, source: SourceHandle) -> Result<(), BackendError>;
    fn stop(&mut self, source: SourceHandle) -> Result<(), BackendError>;
    fn rewind(&mut self, source: SourceHandle) -> Result<(), BackendError>;

    fn source_state(&self, source: SourceHandle) -> Result<SourceState, BackendError>;
    /// Playhead, in seconds of source material, since the last `play`/`rewind`.
    fn playhead_seconds(&self, source: SourceHandle) -> Result<f32, BackendError>;
    /// Seek a (non-streaming) source's playhead directly.
    fn seek_seconds(&mut self, source: SourceHandle, seconds: f32) -> Result<(), BackendError>;

    fn set_listener_position(&mut self, position: [f32; 3]) -> Result<(), BackendError>;
    fn set_listener_velocity(&mut self, velocity: [f32; 3]) -> Result<(), BackendError>;
    fn set_listener_orientation(&mut self, orientation: ListenerOrientation) -> Result<(), BackendError>;

    /// Capacity of the backend's own device-side source pool, if bounded.
    fn source_capacity(&self) -> usize;
}
