use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);
    };
}

id_type!(BusId);
id_type!(EmitterId);
id_type!(VoiceId);
id_type!(GeneratorId);

/// Monotonically increasing id allocator; every id handed out is unique for
/// the engine's lifetime (ids are never reused, so stale handles from a
/// deleted bus/voice/emitter fail lookups instead of aliasing a new one).
#[derive(Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
