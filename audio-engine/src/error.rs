use crate::ids::{BusId, EmitterId, VoiceId};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("bus {0:?} does not exist")]
    UnknownBus(BusId),
    #[error("emitter {0:?} does not exist")]
    UnknownEmitter(EmitterId),
    #[error("voice {0:?} does not exist")]
    UnknownVoice(VoiceId),
    #[error("operation attempted on a disposed voice")]
    AlreadyDisposed,
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("resource could not be resolved")]
    ResourceNotFound,
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("backend error: {0}")]
    Backend(#[from] audio_backend::BackendError),
    #[error("deferred action failed: {0}")]
    ActionFailed(String),
    #[error("engine was dropped before the request could be processed")]
    EngineGone,
}
