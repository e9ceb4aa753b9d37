//! Static generator: one immutable backend buffer shared by every voice playing it.

use audio_backend::BufferHandle;

pub struct StaticGenerator {
    pub buffer: BufferHandle,
}

impl StaticGenerator {
    pub fn new(buffer: BufferHandle) -> Self {
        Self { buffer }
    }
}
