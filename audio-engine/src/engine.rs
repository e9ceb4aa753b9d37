//! The engine proper: owns every
//! audio-thread-exclusive table and runs the per-tick pipeline. Everything
//! else in this crate is a piece [`EngineState`] assembles; everything a
//! host embeds is a piece [`Engine`] hands out.
//!
//! Two call surfaces exist on purpose:
//! [`Engine`] itself is only ever touched from the thread that drives
//! `tick` (direct methods mutate state immediately, no marshalling needed
//! since there's no one to race with); [`EngineHandle`] is the cloneable,
//! `Send + Sync` surface for every other thread, and defers every mutation
//! through the marshaller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use audio_backend::{AudioBackend, ListenerOrientation};

use crate::bus::{BusHandle, BusTree};
use crate::emitter::{EmitterHandle, EmitterTable};
use crate::generator::GeneratorTable;
use crate::ids::{BusId, GeneratorId, IdAllocator, VoiceId};
use crate::listener::ListenerState;
use crate::marshaller::{Marshaller, MarshallerHandle};
use crate::pool::SourcePool;
use crate::resolver::{ProviderCtx, Resolver};
use crate::scheduler;
use crate::voice::{Voice, VoiceCtx, VoiceHandle};

fn vec3(v: glam::Vec3) -> [f32; 3] {
    v.to_array()
}

/// Tunables a game would otherwise hard-code per app; here they're one
/// struct so a host can size the engine to its platform.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on simultaneously-physical voices. Clamped at
    /// construction to the backend's own [`AudioBackend::source_capacity`],
    /// so this is a wish, not a guarantee.
    pub source_pool_capacity: usize,
    /// Ring depth for streaming generators; at least 2 so one
    /// buffer can play while another decodes.
    pub streaming_buffer_count: usize,
    /// Frames per streaming chunk and per static-decode read.
    pub streaming_chunk_frames: usize,
    /// Scheme [`Resolver::resolve`] synthesizes for a bare path with no
    /// explicit scheme prefix.
    pub default_scheme: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_pool_capacity: 256,
            streaming_buffer_count: 4,
            streaming_chunk_frames: 8192,
            default_scheme: "file".to_string(),
        }
    }
}

/// Everything the marshaller's deferred actions are allowed to touch.
/// Audio-thread-exclusive: every field here is either owned
/// outright or, where it publishes snapshots, safe for other threads to
/// read without ever taking a lock on this struct itself.
pub struct EngineState {
    pub(crate) buses: BusTree,
    pub(crate) emitters: EmitterTable,
    pub(crate) generators: GeneratorTable,
    pub(crate) pool: SourcePool,
    pub(crate) backend: Box<dyn AudioBackend>,
    pub(crate) listener: ListenerState,
    pub(crate) voices: HashMap<VoiceId, Voice>,
    pub(crate) one_shots: HashSet<VoiceId>,
    voice_ids: IdAllocator,
}

impl EngineState {
    pub(crate) fn new(config: EngineConfig, mut backend: Box<dyn AudioBackend>) -> Self {
        let capacity = config.source_pool_capacity.min(backend.source_capacity());
        let pool = SourcePool::new(capacity, backend.as_mut())
            .expect("pool capacity is clamped to the backend's own capacity and cannot be exhausted by construction");
        Self {
            buses: BusTree::new(),
            emitters: EmitterTable::default(),
            generators: GeneratorTable::default(),
            pool,
            backend,
            listener: ListenerState::default(),
            voices: HashMap::new(),
            one_shots: HashSet::new(),
            voice_ids: IdAllocator::default(),
        }
    }

    /// Look a voice up and hand it a [`VoiceCtx`] built from the rest of
    /// this struct's fields, disjointly borrowed.
    pub(crate) fn with_voice<R>(&mut self, id: VoiceId, f: impl FnOnce(&mut Voice, &mut VoiceCtx) -> R) -> Option<R> {
        let voice = self.voices.get_mut(&id)?;
        let mut ctx = VoiceCtx {
            buses: &self.buses,
            emitters: &self.emitters,
            generators: &mut self.generators,
            pool: &mut self.pool,
            backend: self.backend.as_mut(),
        };
        Some(f(voice, &mut ctx))
    }

    /// Upload one decoded chunk to a streaming generator's next free buffer
    /// and hand it back to the backend (the streaming producer hand-off).
    /// Called from a marshalled job the background decode thread submits;
    /// failures are logged rather than propagated since there's no waiter
    /// on the other end.
    pub(crate) fn fill_streaming_buffer(&mut self, id: GeneratorId, handle: audio_backend::BufferHandle, pcm: &[u8], format: audio_backend::PcmFormat) {
        if let Err(err) = self.generators.fill_streaming_buffer(id, handle, pcm, format, self.backend.as_mut()) {
            tracing::warn!(generator = ?id, error = %err, "failed to upload streaming buffer to backend");
        }
    }

    fn advance_voices(&mut self, dt: f32) {
        let ids: Vec<VoiceId> = self.voices.keys().copied().collect();
        for id in ids {
            self.with_voice(id, |voice, ctx| voice.tick(dt, ctx));
        }
    }

    fn apply_listener(&mut self) {
        if let Err(err) = self.listener.apply(self.backend.as_mut()) {
            tracing::warn!(error = %err, "failed to apply listener transform to backend");
        }
    }

    fn run_virtualization(&mut self) {
        let EngineState { voices, buses, emitters, generators, pool, backend, .. } = self;
        let mut builder = move || VoiceCtx {
            buses: &*buses,
            emitters: &*emitters,
            generators: &mut *generators,
            pool: &mut *pool,
            backend: backend.as_mut(),
        };
        scheduler::run_virtualization_pass(voices, &mut builder);
    }

    fn reap_one_shots(&mut self) {
        let EngineState { voices, one_shots, buses, emitters, generators, pool, backend, .. } = self;
        let mut builder = move || VoiceCtx {
            buses: &*buses,
            emitters: &*emitters,
            generators: &mut *generators,
            pool: &mut *pool,
            backend: backend.as_mut(),
        };
        scheduler::reap_one_shots(voices, one_shots, &mut builder);
    }

    pub(crate) fn spawn_voice(&mut self, generator: GeneratorId, bus: Option<BusId>, is_one_shot: bool) -> Option<VoiceId> {
        if !self.generators.exists(generator) {
            return None;
        }
        self.generators.retain(generator);
        let bus_id = bus.unwrap_or_else(|| self.buses.master());
        let id = VoiceId(self.voice_ids.next());
        self.voices.insert(id, Voice::new(id, generator, bus_id, is_one_shot));
        Some(id)
    }
}

/// Owns the marshaller and every audio-thread-exclusive table. There is
/// exactly one of these per running engine, and only the thread that calls
/// [`Engine::tick`] should ever hold `&mut Engine`.
pub struct Engine {
    marshaller: Marshaller,
    state: EngineState,
    resolver: Arc<Resolver>,
}

impl Engine {
    pub fn new(config: EngineConfig, backend: Box<dyn AudioBackend>) -> Self {
        let resolver = Arc::new(Resolver::new(config.default_scheme.clone()));
        Self { marshaller: Marshaller::new(), state: EngineState::new(config, backend), resolver }
    }

    /// Run one tick: drain deferred mutations, advance every voice, push
    /// the listener transform, promote virtual voices where the pool has
    /// room, reap finished one-shots, then drain once more so any
    /// reentrant effect from this tick (e.g. a one-shot scheduled from a
    /// voice's own completion) lands before the next caller observes state.
    pub fn tick(&mut self, dt: f32) {
        self.marshaller.drain(&mut self.state);
        self.state.advance_voices(dt);
        self.state.apply_listener();
        self.state.run_virtualization();
        self.state.reap_one_shots();
        self.marshaller.drain(&mut self.state);
    }

    /// A cloneable handle other threads use to talk to this engine.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle { marshaller: self.marshaller.handle(), resolver: self.resolver.clone() }
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }

    pub fn master_bus(&self) -> BusHandle {
        let id = self.state.buses.master();
        BusHandle::new(id, self.marshaller.handle(), self.state.buses.published_handle(id).expect("master bus always exists"))
    }

    pub fn create_bus(&mut self, path: &str) -> BusHandle {
        let id = self.state.buses.resolve_or_create(path);
        BusHandle::new(id, self.marshaller.handle(), self.state.buses.published_handle(id).expect("just resolved"))
    }

    pub fn lookup_bus(&self, path: &str) -> Option<BusHandle> {
        let id = self.state.buses.lookup(path)?;
        Some(BusHandle::new(id, self.marshaller.handle(), self.state.buses.published_handle(id)?))
    }

    pub fn delete_bus(&mut self, path: &str) -> bool {
        self.state.buses.delete(path)
    }

    pub fn create_emitter(&mut self) -> EmitterHandle {
        let id = self.state.emitters.create();
        EmitterHandle::new(
            id,
            self.marshaller.handle(),
            self.resolver.clone(),
            self.state.emitters.published_handle(id).expect("just created"),
        )
    }

    pub fn destroy_emitter(&mut self, emitter: &EmitterHandle) {
        self.state.emitters.destroy(emitter.id());
    }

    /// Accepts `glam::Vec3` at the host boundary, since a game embedding
    /// this engine almost always tracks its listener in that type already
    /// (every other table below this one stays on plain `[f32; 3]`).
    pub fn set_listener_transform(&mut self, position: glam::Vec3, velocity: glam::Vec3) {
        self.state.listener.set_position(vec3(position));
        self.state.listener.set_velocity(vec3(velocity));
    }

    pub fn set_listener_orientation(&mut self, orientation: ListenerOrientation) {
        self.state.listener.set_orientation(orientation);
    }

    /// Resolve `uri` against the registered providers, synchronously (the
    /// calling thread already has exclusive access to `self.state`, so
    /// there's no need to go through the marshaller).
    pub fn resolve(&mut self, uri: &str) -> Option<GeneratorId> {
        let marshaller = self.marshaller.handle();
        let mut ctx = ProviderCtx { generators: &mut self.state.generators, backend: self.state.backend.as_mut(), marshaller };
        self.resolver.resolve(uri, &mut ctx)
    }

    /// Create a voice bound to an already-resolved generator. `bus`
    /// defaults to the master bus. Returns `None` if `generator` is
    /// unknown.
    pub fn create_voice(&mut self, generator: GeneratorId, bus: Option<BusId>) -> Option<VoiceHandle> {
        let id = self.state.spawn_voice(generator, bus, false)?;
        let published = self.state.voices[&id].published_handle();
        Some(VoiceHandle::new(id, self.marshaller.handle(), published))
    }

    /// Resolve `uri` and create a one-shot voice owned by the engine,
    /// started immediately and disposed automatically once it reaches
    /// `Stopped`. Returns `false` if the resource could not be resolved;
    /// the failure is logged rather than swallowed silently.
    pub fn play_one_shot(&mut self, uri: &str, bus: Option<BusId>) -> bool {
        let Some(generator) = self.resolve(uri) else {
            tracing::warn!(uri, "one-shot resource could not be resolved");
            return false;
        };
        let Some(id) = self.state.spawn_voice(generator, bus, true) else {
            return false;
        };
        self.state.one_shots.insert(id);
        self.state.with_voice(id, |v, ctx| v.play(ctx));
        true
    }

    /// Stop and dispose every live voice. Leaves buses, emitters and
    /// generators intact; a host that wants a clean slate also drops the
    /// `Engine` itself.
    pub fn dispose(&mut self) {
        let ids: Vec<VoiceId> = self.state.voices.keys().copied().collect();
        for id in ids {
            self.state.with_voice(id, |v, ctx| v.dispose(ctx));
        }
        self.state.voices.clear();
        self.state.one_shots.clear();
    }
}

/// Cloneable, `Send + Sync` handle for threads other than the one driving
/// [`Engine::tick`]. Every operation defers through the marshaller; the
/// reply-bearing ones block the *calling* thread (never the audio thread)
/// until a tick processes them.
#[derive(Clone)]
pub struct EngineHandle {
    marshaller: MarshallerHandle,
    resolver: Arc<Resolver>,
}

impl EngineHandle {
    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }

    pub fn resolve_or_create_bus(&self, path: impl Into<String>) -> crate::marshaller::Reply<BusHandle> {
        let path = path.into();
        let for_handle = self.marshaller.clone();
        self.marshaller.defer_with_reply("engine.resolve_or_create_bus", move |state| {
            let id = state.buses.resolve_or_create(&path);
            let published = state.buses.published_handle(id).expect("just resolved");
            BusHandle::new(id, for_handle, published)
        })
    }

    pub fn create_emitter(&self) -> crate::marshaller::Reply<EmitterHandle> {
        let for_handle = self.marshaller.clone();
        let resolver = self.resolver.clone();
        self.marshaller.defer_with_reply("engine.create_emitter", move |state| {
            let id = state.emitters.create();
            let published = state.emitters.published_handle(id).expect("just created");
            EmitterHandle::new(id, for_handle, resolver, published)
        })
    }

    pub fn resolve(&self, uri: impl Into<String>) -> crate::marshaller::Reply<Option<GeneratorId>> {
        let uri = uri.into();
        let resolver = self.resolver.clone();
        let marshaller = self.marshaller.clone();
        self.marshaller.defer_with_reply("engine.resolve", move |state| {
            let mut ctx = ProviderCtx { generators: &mut state.generators, backend: state.backend.as_mut(), marshaller };
            resolver.resolve(&uri, &mut ctx)
        })
    }

    pub fn create_voice(&self, generator: GeneratorId, bus: Option<BusId>) -> crate::marshaller::Reply<Option<VoiceHandle>> {
        let for_handle = self.marshaller.clone();
        self.marshaller.defer_with_reply("engine.create_voice", move |state| {
            let id = state.spawn_voice(generator, bus, false)?;
            let published = state.voices[&id].published_handle();
            Some(VoiceHandle::new(id, for_handle, published))
        })
    }

    /// Fire-and-forget: resolve `uri` and play it as a one-shot once a
    /// future tick drains this action. A resolution failure is logged,
    /// never surfaced to this caller.
    pub fn play_one_shot(&self, uri: impl Into<String>, bus: Option<BusId>) {
        let uri = uri.into();
        let resolver = self.resolver.clone();
        let marshaller = self.marshaller.clone();
        self.marshaller.defer("engine.play_one_shot", move |state| {
            let mut ctx = ProviderCtx { generators: &mut state.generators, backend: state.backend.as_mut(), marshaller };
            let Some(generator) = resolver.resolve(&uri, &mut ctx) else {
                tracing::warn!(uri, "one-shot resource could not be resolved");
                return;
            };
            let Some(id) = state.spawn_voice(generator, bus, true) else {
                return;
            };
            state.one_shots.insert(id);
            state.with_voice(id, |v, ctx| v.play(ctx));
        });
    }

    pub fn set_listener_transform(&self, position: glam::Vec3, velocity: glam::Vec3) {
        let position = vec3(position);
        let velocity = vec3(velocity);
        self.marshaller.defer("engine.set_listener_transform", move |state| {
            state.listener.set_position(position);
            state.listener.set_velocity(velocity);
        });
    }

    pub fn set_listener_orientation(&self, orientation: ListenerOrientation) {
        self.marshaller.defer("engine.set_listener_orientation", move |state| state.listener.set_orientation(orientation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_backend::mock::MockBackend;

    fn engine(capacity: usize) -> Engine {
        Engine::new(EngineConfig { source_pool_capacity: capacity, ..EngineConfig::default() }, Box::new(MockBackend::new(capacity)))
    }

    #[test]
    fn tick_drains_deferred_bus_creation() {
        let mut e = engine(2);
        let handle = e.handle();
        let reply = handle.resolve_or_create_bus("/sfx");
        assert!(reply.try_wait().is_none());
        e.tick(0.0);
        let bus = reply.wait().unwrap();
        assert_eq!(bus.effective().effective_gain, 1.0);
    }

    #[test]
    fn resolve_without_a_provider_yields_none() {
        let mut e = engine(1);
        assert!(e.resolve("does-not-matter").is_none());
    }

    #[test]
    fn master_gain_cascades_to_a_playing_voice() {
        let mut e = engine(1);
        let format = audio_backend::PcmFormat { channels: 1, sample_rate: 10, bits_per_sample: 32, encoding: audio_backend::SampleEncoding::Float };
        let buffer = e.state.backend.create_buffer(format, &[0u8; 40]).unwrap();
        let gen = e.state.generators.insert_static(format, crate::generator::StaticGenerator::new(buffer), Some(1.0));

        let voice = e.create_voice(gen, None).unwrap();
        voice.play();
        e.tick(0.0);
        e.master_bus().set_gain(0.5);
        e.tick(0.01);

        let source = e.state.voices.values().next().unwrap().source().unwrap();
        let params = e.state.backend.params(source).unwrap();
        assert!((params.gain - 0.5).abs() < 1e-5);
    }

    #[test]
    fn one_shot_without_a_provider_logs_and_returns_false() {
        let mut e = engine(1);
        assert!(!e.play_one_shot("sfx/boom.ogg", None));
        e.tick(0.01);
        assert!(e.state.voices.is_empty());
    }

    #[test]
    fn dispose_clears_every_voice() {
        let mut e = engine(1);
        let resolver = e.resolver();
        struct Always(GeneratorId);
        impl crate::resolver::Provider for Always {
            fn resolve(&mut self, _uri: &crate::resolver::ResolvedUri, _ctx: &mut ProviderCtx) -> Option<GeneratorId> {
                Some(self.0)
            }
        }
        let backend_buffer = {
            let format = audio_backend::PcmFormat { channels: 1, sample_rate: 10, bits_per_sample: 32, encoding: audio_backend::SampleEncoding::Float };
            let buffer = e.state.backend.create_buffer(format, &[0u8; 40]).unwrap();
            e.state.generators.insert_static(format, crate::generator::StaticGenerator::new(buffer), Some(1.0))
        };
        resolver.register("file", Box::new(Always(backend_buffer)));
        assert!(e.play_one_shot("sfx/boom.ogg", None));
        assert_eq!(e.state.voices.len(), 1);
        e.dispose();
        assert!(e.state.voices.is_empty());
        assert!(e.state.one_shots.is_empty());
    }
}
