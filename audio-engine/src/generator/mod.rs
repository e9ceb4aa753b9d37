//! Generators: producers of PCM data attached to voices. A small
//! discriminator over two concrete variants (static, streaming) rather
//! than open dispatch.

pub mod static_gen;
pub mod streaming;

pub use static_gen::StaticGenerator;
pub use streaming::StreamingGenerator;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use audio_backend::{AudioBackend, BackendError, PcmFormat};

use crate::ids::{GeneratorId, IdAllocator};

pub enum GeneratorKind {
    Static(StaticGenerator),
    Streaming(StreamingGenerator),
}

pub struct GeneratorEntry {
    /// Streamers are exclusive (not shareable across voices); static buffers
    /// are not.
    pub exclusive: bool,
    pub format: PcmFormat,
    pub duration_secs: Option<f32>,
    ref_count: AtomicU32,
    /// Dropped when the entry is destroyed. A cache keyed by something else
    /// (e.g. the file provider's path index) holds only a [`Weak`] to this
    /// and treats a failed upgrade as "stale, evict" — an O(1) replacement
    /// for scanning every generator for a match.
    liveness: Arc<()>,
    pub kind: GeneratorKind,
}

impl GeneratorEntry {
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn liveness_token(&self) -> Weak<()> {
        Arc::downgrade(&self.liveness)
    }
}

/// Owns every live generator. Audio-thread-exclusive except for the ref
/// count itself, which is atomic so a "silent release" from a provider can
/// happen without racing a concurrent voice attach.
#[derive(Default)]
pub struct GeneratorTable {
    entries: HashMap<GeneratorId, GeneratorEntry>,
    ids: IdAllocator,
}

impl GeneratorTable {
    /// Allocate an id without inserting anything yet. Needed when
    /// constructing the generator itself (e.g. naming a streaming worker
    /// thread) requires knowing the id up front.
    pub fn reserve_id(&mut self) -> GeneratorId {
        GeneratorId(self.ids.next())
    }

    pub fn insert_static(&mut self, format: PcmFormat, generator: StaticGenerator, duration_secs: Option<f32>) -> GeneratorId {
        let id = self.reserve_id();
        self.insert_with_id(id, false, format, duration_secs, GeneratorKind::Static(generator));
        id
    }

    pub fn insert_streaming(&mut self, format: PcmFormat, generator: StreamingGenerator, duration_secs: Option<f32>) -> GeneratorId {
        let id = self.reserve_id();
        self.insert_with_id(id, true, format, duration_secs, GeneratorKind::Streaming(generator));
        id
    }

    /// Insert a generator under an id obtained from a prior [`Self::reserve_id`] call.
    pub fn insert_with_id(&mut self, id: GeneratorId, exclusive: bool, format: PcmFormat, duration_secs: Option<f32>, kind: GeneratorKind) {
        self.entries.insert(
            id,
            GeneratorEntry {
                exclusive,
                format,
                duration_secs,
                ref_count: AtomicU32::new(0),
                liveness: Arc::new(()),
                kind,
            },
        );
    }

    pub fn get(&self, id: GeneratorId) -> Option<&GeneratorEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: GeneratorId) -> Option<&mut GeneratorEntry> {
        self.entries.get_mut(&id)
    }

    pub fn exists(&self, id: GeneratorId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn retain(&self, id: GeneratorId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.ref_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Decrement without destroying, even at zero: used by providers that
    /// hand ownership off to a caller that will release properly later.
    pub fn release_silent(&self, id: GeneratorId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Decrement, destroying (and releasing backend buffers) once the count
    /// reaches zero.
    pub fn release(&mut self, id: GeneratorId, backend: &mut dyn AudioBackend) -> Result<(), BackendError> {
        let should_destroy = match self.entries.get(&id) {
            Some(entry) => entry.ref_count.fetch_sub(1, Ordering::AcqRel) <= 1,
            None => false,
        };
        if should_destroy {
            if let Some(entry) = self.entries.remove(&id) {
                match entry.kind {
                    GeneratorKind::Static(s) => backend.destroy_buffer(s.buffer)?,
                    GeneratorKind::Streaming(s) => {
                        for &b in s.buffers() {
                            backend.destroy_buffer(b)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill a streaming generator's buffer with freshly decoded PCM and
    /// push it onto `filled` (the audio-thread half of the producer
    /// hand-off).
    pub fn fill_streaming_buffer(
        &self,
        id: GeneratorId,
        handle: audio_backend::BufferHandle,
        pcm: &[u8],
        format: PcmFormat,
        backend: &mut dyn AudioBackend,
    ) -> Result<(), BackendError> {
        if let Some(GeneratorKind::Streaming(s)) = self.entries.get(&id).map(|e| &e.kind) {
            backend.rebuffer(handle, format, pcm)?;
            s.push_filled(handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_backend::mock::MockBackend;
    use audio_backend::SampleEncoding;

    fn fmt() -> PcmFormat {
        PcmFormat { channels: 1, sample_rate: 10, bits_per_sample: 32, encoding: SampleEncoding::Float }
    }

    #[test]
    fn static_generator_destroyed_when_refs_reach_zero() {
        let mut backend = MockBackend::new(1);
        let buffer = backend.create_buffer(fmt(), &[0u8; 40]).unwrap();
        let mut table = GeneratorTable::default();
        let id = table.insert_static(fmt(), StaticGenerator::new(buffer), Some(1.0));
        table.retain(id);
        table.retain(id);
        assert_eq!(table.get(id).unwrap().ref_count(), 2);
        table.release(id, &mut backend).unwrap();
        assert!(table.exists(id));
        table.release(id, &mut backend).unwrap();
        assert!(!table.exists(id));
    }

    #[test]
    fn silent_release_does_not_destroy() {
        let mut backend = MockBackend::new(1);
        let buffer = backend.create_buffer(fmt(), &[0u8; 40]).unwrap();
        let mut table = GeneratorTable::default();
        let id = table.insert_static(fmt(), StaticGenerator::new(buffer), Some(1.0));
        table.retain(id);
        table.release_silent(id);
        assert_eq!(table.get(id).unwrap().ref_count(), 0);
        assert!(table.exists(id));
    }
}
