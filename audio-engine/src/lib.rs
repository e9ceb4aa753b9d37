//! Runtime game audio engine: hierarchical mix buses, prioritized and
//! virtualized voice scheduling, positional emitters, static and streaming
//! generators, and a URI-based resource resolver, all mutated exclusively
//! through an audio-thread marshaller.
//!
//! [`Engine`] is the entry point: construct one over an [`audio_backend::AudioBackend`],
//! drive it with [`Engine::tick`], and hand [`Engine::handle`] clones to
//! every other thread that wants to create buses, emitters, voices or play
//! sounds.

pub mod bus;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod file_provider;
pub mod generator;
pub mod ids;
pub mod listener;
pub mod marshaller;
mod pool;
pub mod resolver;
mod scheduler;
pub mod voice;

pub use bus::{BusHandle, BusSnapshot};
pub use emitter::{EmitterHandle, EmitterSnapshot};
pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::EngineError;
pub use ids::{BusId, EmitterId, GeneratorId, VoiceId};
pub use listener::ListenerState;
pub use marshaller::{MarshallerHandle, Reply};
pub use resolver::{Provider, ProviderCtx, Resolver, ResolvedUri};
pub use voice::{MixMode, VoiceHandle, VoiceSnapshot, VoiceState};

#[cfg(test)]
mod tests {
    use super::*;
    use audio_backend::mock::MockBackend;

    #[test]
    fn engine_creation() {
        let engine = Engine::new(EngineConfig::default(), Box::new(MockBackend::new(4)));
        assert_eq!(engine.master_bus().effective().effective_gain, 1.0);
    }
}
