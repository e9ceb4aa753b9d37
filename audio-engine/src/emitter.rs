//! Positional emitters.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::ids::{BusId, EmitterId, GeneratorId, IdAllocator};
use crate::marshaller::{MarshallerHandle, Reply};
use crate::resolver::{ProviderCtx, Resolver};
use crate::voice::VoiceHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitterSnapshot {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub bus_override: Option<BusId>,
    pub priority_bias: i32,
    pub version: u64,
}

impl Default for EmitterSnapshot {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            velocity: [0.0, 0.0, 0.0],
            bus_override: None,
            priority_bias: 0,
            version: 0,
        }
    }
}

struct EmitterNode {
    snapshot: EmitterSnapshot,
    published: Arc<ArcSwap<EmitterSnapshot>>,
}

impl EmitterNode {
    fn publish(&self) {
        self.published.store(Arc::new(self.snapshot));
    }
}

#[derive(Default)]
pub struct EmitterTable {
    nodes: HashMap<EmitterId, EmitterNode>,
    ids: IdAllocator,
}

impl EmitterTable {
    pub fn create(&mut self) -> EmitterId {
        let id = EmitterId(self.ids.next());
        let snapshot = EmitterSnapshot::default();
        let node = EmitterNode {
            snapshot,
            published: Arc::new(ArcSwap::from_pointee(snapshot)),
        };
        node.publish();
        self.nodes.insert(id, node);
        id
    }

    pub fn destroy(&mut self, id: EmitterId) {
        self.nodes.remove(&id);
    }

    pub fn exists(&self, id: EmitterId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn snapshot(&self, id: EmitterId) -> Option<EmitterSnapshot> {
        self.nodes.get(&id).map(|n| n.snapshot)
    }

    pub fn published_handle(&self, id: EmitterId) -> Option<Arc<ArcSwap<EmitterSnapshot>>> {
        self.nodes.get(&id).map(|n| n.published.clone())
    }

    /// Bump the version only if the transform actually changed, so unrelated
    /// voices don't get spuriously re-dirtied.
    pub fn set_transform(&mut self, id: EmitterId, position: [f32; 3], velocity: [f32; 3]) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.snapshot.position == position && node.snapshot.velocity == velocity {
                return;
            }
            node.snapshot.position = position;
            node.snapshot.velocity = velocity;
            node.snapshot.version += 1;
            node.publish();
        }
    }

    pub fn set_bus_override(&mut self, id: EmitterId, bus: Option<BusId>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.snapshot.bus_override == bus {
                return;
            }
            node.snapshot.bus_override = bus;
            node.snapshot.version += 1;
            node.publish();
        }
    }

    pub fn set_priority_bias(&mut self, id: EmitterId, bias: i32) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.snapshot.priority_bias == bias {
                return;
            }
            node.snapshot.priority_bias = bias;
            node.snapshot.version += 1;
            node.publish();
        }
    }
}

/// Off-audio-thread handle to a single emitter.
#[derive(Clone)]
pub struct EmitterHandle {
    id: EmitterId,
    marshaller: MarshallerHandle,
    resolver: Arc<Resolver>,
    published: Arc<ArcSwap<EmitterSnapshot>>,
}

impl EmitterHandle {
    pub(crate) fn new(id: EmitterId, marshaller: MarshallerHandle, resolver: Arc<Resolver>, published: Arc<ArcSwap<EmitterSnapshot>>) -> Self {
        Self { id, marshaller, resolver, published }
    }

    pub fn id(&self) -> EmitterId {
        self.id
    }

    pub fn snapshot(&self) -> EmitterSnapshot {
        **self.published.load()
    }

    pub fn set_transform(&self, position: [f32; 3], velocity: [f32; 3]) {
        let id = self.id;
        self.marshaller
            .defer("emitter.set_transform", move |state| state.emitters.set_transform(id, position, velocity));
    }

    pub fn set_bus_override(&self, bus: Option<BusId>) {
        let id = self.id;
        self.marshaller
            .defer("emitter.set_bus_override", move |state| state.emitters.set_bus_override(id, bus));
    }

    pub fn set_priority_bias(&self, bias: i32) {
        let id = self.id;
        self.marshaller
            .defer("emitter.set_priority_bias", move |state| state.emitters.set_priority_bias(id, bias));
    }

    /// Create a voice bound to `generator` and attach it to this emitter in
    /// the same deferred action, so no other tick can observe it unattached.
    pub fn attach_voice(&self, generator: GeneratorId, bus: Option<BusId>) -> Reply<Option<VoiceHandle>> {
        let emitter_id = self.id;
        let for_handle = self.marshaller.clone();
        self.marshaller.defer_with_reply("emitter.attach_voice", move |state| {
            let voice_id = state.spawn_voice(generator, bus, false)?;
            state.with_voice(voice_id, |v, _ctx| v.attach_to_emitter(Some(emitter_id)));
            let published = state.voices[&voice_id].published_handle();
            Some(VoiceHandle::new(voice_id, for_handle, published))
        })
    }

    /// Resolve `uri` and play it as a one-shot voice attached to this
    /// emitter. Fire-and-forget; a resolution failure is logged, not
    /// surfaced to this caller.
    pub fn play_one_shot(&self, uri: impl Into<String>, bus: Option<BusId>) {
        let uri = uri.into();
        let emitter_id = self.id;
        let resolver = self.resolver.clone();
        let marshaller = self.marshaller.clone();
        self.marshaller.defer("emitter.play_one_shot", move |state| {
            let mut ctx = ProviderCtx { generators: &mut state.generators, backend: state.backend.as_mut(), marshaller };
            let Some(generator) = resolver.resolve(&uri, &mut ctx) else {
                tracing::warn!(uri, "one-shot resource could not be resolved");
                return;
            };
            let Some(voice_id) = state.spawn_voice(generator, bus, true) else {
                return;
            };
            state.one_shots.insert(voice_id);
            state.with_voice(voice_id, |v, ctx| {
                v.attach_to_emitter(Some(emitter_id));
                v.play(ctx);
            });
        });
    }
}
