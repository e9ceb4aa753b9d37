//! Shared black-box test fixtures. These go through the public `Provider`
//! seam exactly as a host application would (audio-engine's own fields are
//! crate-private); there is no backdoor into `EngineState` from outside the
//! crate.

use audio_engine::{GeneratorId, Provider, ProviderCtx, ResolvedUri};

pub fn silence_format() -> audio_backend::PcmFormat {
    audio_backend::PcmFormat { channels: 1, sample_rate: 10, bits_per_sample: 32, encoding: audio_backend::SampleEncoding::Float }
}

/// Hands out a fresh one-second static generator of silence for every URI it
/// is asked to resolve, regardless of path.
pub struct SilentStaticProvider {
    pub duration_secs: f32,
}

impl Provider for SilentStaticProvider {
    fn resolve(&mut self, _uri: &ResolvedUri, ctx: &mut ProviderCtx) -> Option<GeneratorId> {
        let format = silence_format();
        let frames = (format.sample_rate as f32 * self.duration_secs) as usize;
        let pcm = vec![0u8; frames * 4];
        let buffer = ctx.backend.create_buffer(format, &pcm).ok()?;
        Some(ctx.generators.insert_static(format, audio_engine::generator::StaticGenerator::new(buffer), Some(self.duration_secs)))
    }
}
