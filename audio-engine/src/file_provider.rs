//! The filesystem-backed [`Provider`]. Registered twice against the same [`crate::resolver::Resolver`]
//! — once for `file` (whole-file static generators, cached by path) and once
//! for `stream` (a fresh streaming generator per request:
//! streaming sources are exclusive and not meant to be shared).
//!
//! Decoder construction is injected as a closure rather than this crate
//! depending on `decoder-symphonia` directly, so the engine stays decoder-
//! agnostic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use audio_backend::{PcmFormat, SampleEncoding};
use audio_decoder::{Decoder, DecoderError, Encoding};

use crate::generator::{GeneratorKind, StaticGenerator, StreamingGenerator};
use crate::ids::GeneratorId;
use crate::resolver::{Provider, ProviderCtx, ResolvedUri};

fn to_pcm_format(info: audio_decoder::DecoderInfo) -> PcmFormat {
    PcmFormat {
        channels: info.channels,
        sample_rate: info.sample_rate,
        bits_per_sample: info.bits_per_sample,
        encoding: match info.encoding {
            Encoding::IntegerPcm => SampleEncoding::IntegerPcm,
            Encoding::Float => SampleEncoding::Float,
        },
    }
}

type OpenDecoder = dyn Fn(&Path, Option<u32>) -> Result<Box<dyn Decoder>, DecoderError> + Send + Sync;

/// Resolves `file:` and `stream:` URIs against a search path, opening files
/// with an injected decoder factory.
pub struct FileProvider {
    search_paths: Vec<PathBuf>,
    open_decoder: Arc<OpenDecoder>,
    streaming_buffer_count: usize,
    chunk_frames: usize,
    target_sample_rate: Option<u32>,
    /// Path → (generator, weak liveness token). Only used for the `file`
    /// (static) scheme; `stream` never caches. A stale entry is detected by
    /// a failed `Weak` upgrade rather than scanning every live generator.
    static_cache: HashMap<PathBuf, (GeneratorId, Weak<()>)>,
}

impl FileProvider {
    pub fn new(
        search_paths: Vec<PathBuf>,
        open_decoder: impl Fn(&Path, Option<u32>) -> Result<Box<dyn Decoder>, DecoderError> + Send + Sync + 'static,
        streaming_buffer_count: usize,
        chunk_frames: usize,
    ) -> Self {
        Self {
            search_paths,
            open_decoder: Arc::new(open_decoder),
            streaming_buffer_count: streaming_buffer_count.max(2),
            chunk_frames: chunk_frames.max(1),
            target_sample_rate: None,
            static_cache: HashMap::new(),
        }
    }

    pub fn with_target_sample_rate(mut self, sample_rate: u32) -> Self {
        self.target_sample_rate = Some(sample_rate);
        self
    }

    /// First existing `<root>/<relative>` wins; if no search paths are
    /// configured (or none match), fall back to treating `relative` as a
    /// path in its own right.
    fn locate(&self, relative: &str) -> Option<PathBuf> {
        for root in &self.search_paths {
            let candidate = root.join(relative);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if self.search_paths.is_empty() {
            let candidate = PathBuf::from(relative);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn resolve_static(&mut self, path: &Path, ctx: &mut ProviderCtx) -> Option<GeneratorId> {
        if let Some((id, liveness)) = self.static_cache.get(path) {
            if liveness.upgrade().is_some() && ctx.generators.exists(*id) {
                return Some(*id);
            }
        }

        let mut decoder = (self.open_decoder)(path, self.target_sample_rate).ok()?;
        let info = decoder.info();
        let format = to_pcm_format(info);
        let bytes_per_frame = info.bytes_per_frame();

        let mut pcm = Vec::new();
        let mut chunk = vec![0u8; self.chunk_frames * bytes_per_frame];
        loop {
            match decoder.decode(self.chunk_frames, &mut chunk) {
                Ok(0) => break,
                Ok(frames) => pcm.extend_from_slice(&chunk[..frames * bytes_per_frame]),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "static decode failed partway through");
                    break;
                }
            }
        }

        let buffer = ctx.backend.create_buffer(format, &pcm).ok()?;
        let id = ctx.generators.reserve_id();
        ctx.generators.insert_with_id(id, false, format, info.total_duration_secs, GeneratorKind::Static(StaticGenerator::new(buffer)));

        let liveness = ctx.generators.get(id).expect("just inserted").liveness_token();
        self.static_cache.insert(path.to_path_buf(), (id, liveness));
        Some(id)
    }

    fn resolve_streaming(&mut self, path: &Path, ctx: &mut ProviderCtx) -> Option<GeneratorId> {
        let decoder = (self.open_decoder)(path, self.target_sample_rate).ok()?;
        let info = decoder.info();
        let format = to_pcm_format(info);
        let bytes_per_frame = info.bytes_per_frame();

        let mut buffers = Vec::with_capacity(self.streaming_buffer_count);
        for _ in 0..self.streaming_buffer_count {
            buffers.push(ctx.backend.create_buffer(format, &vec![0u8; self.chunk_frames * bytes_per_frame]).ok()?);
        }

        let id = ctx.generators.reserve_id();
        let generator = StreamingGenerator::spawn(id, format, buffers, self.chunk_frames, false, info.can_seek, decoder, ctx.marshaller.clone());
        ctx.generators.insert_with_id(id, true, format, info.total_duration_secs, GeneratorKind::Streaming(generator));
        Some(id)
    }
}

impl Provider for FileProvider {
    fn resolve(&mut self, uri: &ResolvedUri, ctx: &mut ProviderCtx) -> Option<GeneratorId> {
        let relative = uri.path.trim_start_matches('/');
        let path = self.locate(relative)?;

        match uri.scheme.as_str() {
            "stream" => self.resolve_streaming(&path, ctx),
            _ => self.resolve_static(&path, ctx),
        }
    }
}
