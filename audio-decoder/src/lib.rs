//! The decoder capability the engine's generators consume.
//!
//! Concrete decoders (e.g. a third-party sample-file decoder) are an
//! external collaborator and out of this crate's scope; `decoder-symphonia`
//! in this workspace is one real implementation, and [`mock`] is a
//! deterministic one used for tests.

pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    IntegerPcm,
    Float,
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub encoding: Encoding,
    pub can_seek: bool,
    /// `None` if unknown or effectively infinite (e.g. a live stream).
    pub total_duration_secs: Option<f32>,
}

impl DecoderInfo {
    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8).max(1) * self.channels.max(1) as usize
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecoderError {
    #[error("seek is not supported by this decoder")]
    SeekUnsupported,
    #[error("decode failed: {0}")]
    Failed(String),
}

/// Decodes interleaved PCM frames on demand. Implementations are not
/// required to be `Sync`; the engine only ever calls a given decoder from
/// one background worker at a time.
pub trait Decoder: Send {
    fn info(&self) -> DecoderInfo;

    /// Decode up to `max_frames` into `out` (which must be at least
    /// `max_frames * info().bytes_per_frame()` bytes). Returns the number
    /// of frames actually produced; `0` means end of stream.
    fn decode(&mut self, max_frames: usize, out: &mut [u8]) -> Result<usize, DecoderError>;

    /// Seek to an absolute timestamp. Fails with [`DecoderError::SeekUnsupported`]
    /// if `info().can_seek` is `false`.
    fn seek(&mut self, timestamp_secs: f32) -> Result<(), DecoderError>;
}
