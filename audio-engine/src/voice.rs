//! Voice state machine and per-tick update.

use std::sync::Arc;

use arc_swap::ArcSwap;
use audio_backend::{AudioBackend, SourceHandle, SourceParam};

use crate::bus::BusTree;
use crate::emitter::EmitterTable;
use crate::generator::{GeneratorKind, GeneratorTable};
use crate::ids::{BusId, EmitterId, GeneratorId, VoiceId};
use crate::marshaller::MarshallerHandle;
use crate::pool::SourcePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Stopped,
    PlayingPhysical,
    PausedPhysical,
    PlayingVirtual,
    PausedVirtual,
    Disposed,
}

impl VoiceState {
    pub fn is_physical(self) -> bool {
        matches!(self, VoiceState::PlayingPhysical | VoiceState::PausedPhysical)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VoiceState::Disposed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixMode {
    Direct,
    Relative,
    Spatialized,
}

/// Bitset of parameter categories pending re-commit to the backend
/// (the dirty-flag bitset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyFlags(u16);

impl DirtyFlags {
    pub const GAIN: u16 = 1 << 0;
    pub const PITCH: u16 = 1 << 1;
    pub const TRANSFORM: u16 = 1 << 2;
    pub const LOOPING: u16 = 1 << 3;
    pub const MIX_MODE: u16 = 1 << 4;
    pub const ATTENUATION: u16 = 1 << 5;
    pub const PRIORITY: u16 = 1 << 6;
    pub const ALL: u16 = Self::GAIN
        | Self::PITCH
        | Self::TRANSFORM
        | Self::LOOPING
        | Self::MIX_MODE
        | Self::ATTENUATION
        | Self::PRIORITY;

    pub fn set(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn has(&self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Last values actually committed to the backend, for the ±0.001 hysteresis
/// on scalar float writes. Not applied to vectors or bools.
#[derive(Debug, Clone, Copy)]
struct AppliedCache {
    gain: f32,
    pitch: f32,
    rolloff_factor: f32,
    reference_distance: f32,
    max_distance: f32,
}

impl Default for AppliedCache {
    fn default() -> Self {
        Self { gain: f32::NAN, pitch: f32::NAN, rolloff_factor: f32::NAN, reference_distance: f32::NAN, max_distance: f32::NAN }
    }
}

const HYSTERESIS: f32 = 0.001;

fn within_hysteresis(last: f32, next: f32) -> bool {
    last.is_finite() && (last - next).abs() <= HYSTERESIS
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSnapshot {
    pub state: VoiceState,
    pub logical_time: f32,
    pub effective_priority: i32,
    pub gain: f32,
    pub pitch: f32,
}

/// Everything needed to run a voice's per-tick algorithm, borrowed for the
/// duration of one call. Audio-thread-only.
pub(crate) struct VoiceCtx<'a> {
    pub buses: &'a BusTree,
    pub emitters: &'a EmitterTable,
    pub generators: &'a mut GeneratorTable,
    pub pool: &'a mut SourcePool,
    pub backend: &'a mut dyn AudioBackend,
}

pub struct Voice {
    id: VoiceId,
    generator: GeneratorId,
    bus: BusId,
    emitter: Option<EmitterId>,

    gain: f32,
    pitch: f32,
    position: [f32; 3],
    velocity: [f32; 3],
    looping: bool,
    rolloff_factor: f32,
    reference_distance: f32,
    max_distance: f32,
    priority: i32,
    mix_mode: MixMode,

    effective_priority: i32,
    is_one_shot: bool,
    logical_time: f32,
    last_bus_version: u64,
    last_emitter_version: u64,
    dirty: DirtyFlags,
    applied: AppliedCache,
    source: Option<SourceHandle>,
    state: VoiceState,

    published: Arc<ArcSwap<VoiceSnapshot>>,
}

impl Voice {
    pub(crate) fn new(id: VoiceId, generator: GeneratorId, bus: BusId, is_one_shot: bool) -> Self {
        let snapshot = VoiceSnapshot { state: VoiceState::Stopped, logical_time: 0.0, effective_priority: 0, gain: 1.0, pitch: 1.0 };
        Self {
            id,
            generator,
            bus,
            emitter: None,
            gain: 1.0,
            pitch: 1.0,
            position: [0.0; 3],
            velocity: [0.0; 3],
            looping: false,
            rolloff_factor: 1.0,
            reference_distance: 1.0,
            max_distance: 0.0,
            priority: 0,
            mix_mode: MixMode::Spatialized,
            effective_priority: 0,
            is_one_shot,
            logical_time: 0.0,
            last_bus_version: 0,
            last_emitter_version: 0,
            dirty: DirtyFlags::default(),
            applied: AppliedCache::default(),
            source: None,
            state: VoiceState::Stopped,
            published: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn generator(&self) -> GeneratorId {
        self.generator
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_one_shot(&self) -> bool {
        self.is_one_shot
    }

    pub fn is_physical(&self) -> bool {
        self.state.is_physical()
    }

    pub fn source(&self) -> Option<SourceHandle> {
        self.source
    }

    pub fn logical_time(&self) -> f32 {
        self.logical_time
    }

    pub(crate) fn effective_priority_for_scheduling(&self) -> i32 {
        self.effective_priority
    }

    pub fn published_handle(&self) -> Arc<ArcSwap<VoiceSnapshot>> {
        self.published.clone()
    }

    fn publish(&self) {
        self.published.store(Arc::new(VoiceSnapshot {
            state: self.state,
            logical_time: self.logical_time,
            effective_priority: self.effective_priority,
            gain: self.gain,
            pitch: self.pitch,
        }));
    }

    // ---- setters (audio-thread only; called from deferred marshaller actions) ----

    pub fn set_gain(&mut self, value: f32) {
        self.gain = value.max(0.0);
        self.dirty.set(DirtyFlags::GAIN);
        self.publish();
    }

    pub fn set_pitch(&mut self, value: f32) {
        self.pitch = value.max(f32::MIN_POSITIVE);
        self.dirty.set(DirtyFlags::PITCH);
        self.publish();
    }

    pub fn set_looping(&mut self, value: bool) {
        self.looping = value;
        self.dirty.set(DirtyFlags::LOOPING);
        self.publish();
    }

    pub fn set_position(&mut self, value: [f32; 3]) {
        self.position = value;
        self.dirty.set(DirtyFlags::TRANSFORM);
        self.publish();
    }

    pub fn set_velocity(&mut self, value: [f32; 3]) {
        self.velocity = value;
        self.dirty.set(DirtyFlags::TRANSFORM);
        self.publish();
    }

    pub fn set_transform(&mut self, position: [f32; 3], velocity: [f32; 3]) {
        self.position = position;
        self.velocity = velocity;
        self.dirty.set(DirtyFlags::TRANSFORM);
        self.publish();
    }

    pub fn set_priority(&mut self, value: i32) {
        self.priority = value;
        self.dirty.set(DirtyFlags::PRIORITY);
        self.publish();
    }

    pub fn set_rolloff_factor(&mut self, value: f32) {
        self.rolloff_factor = value.max(0.0);
        self.dirty.set(DirtyFlags::ATTENUATION);
        self.publish();
    }

    pub fn set_reference_distance(&mut self, value: f32) {
        self.reference_distance = value.max(0.0);
        self.dirty.set(DirtyFlags::ATTENUATION);
        self.publish();
    }

    pub fn set_max_distance(&mut self, value: f32) {
        self.max_distance = value.max(0.0);
        self.dirty.set(DirtyFlags::ATTENUATION);
        self.publish();
    }

    pub fn set_mix_mode(&mut self, value: MixMode) {
        self.mix_mode = value;
        self.dirty.set(DirtyFlags::MIX_MODE);
        self.publish();
    }

    pub fn attach_to_emitter(&mut self, emitter: Option<EmitterId>) {
        self.emitter = emitter;
        self.dirty.set(DirtyFlags::TRANSFORM | DirtyFlags::PRIORITY);
        self.publish();
    }

    // ---- state machine ----

    pub fn play(&mut self, ctx: &mut VoiceCtx) {
        match self.state {
            VoiceState::Stopped => match ctx.pool.rent() {
                Some(source) => {
                    self.source = Some(source);
                    self.state = VoiceState::PlayingPhysical;
                    self.hydrate(ctx);
                }
                None => self.state = VoiceState::PlayingVirtual,
            },
            VoiceState::PausedPhysical => {
                if let Some(source) = self.source {
                    if ctx.backend.source_state(source).is_ok() {
                        if let Err(err) = ctx.backend.play(source) {
                            tracing::warn!(voice = ?self.id, error = %err, "backend play failed");
                        }
                        self.state = VoiceState::PlayingPhysical;
                    } else {
                        self.source = None;
                        self.state = VoiceState::PlayingVirtual;
                    }
                } else {
                    self.state = VoiceState::PlayingVirtual;
                }
            }
            VoiceState::PausedVirtual => self.state = VoiceState::PlayingVirtual,
            VoiceState::PlayingPhysical | VoiceState::PlayingVirtual | VoiceState::Disposed => {}
        }
        self.publish();
    }

    pub fn pause(&mut self, ctx: &mut VoiceCtx) {
        match self.state {
            VoiceState::PlayingPhysical => {
                if let Some(source) = self.source {
                    if ctx.backend.source_state(source).is_ok() {
                        if let Err(err) = ctx.backend.pause(source) {
                            tracing::warn!(voice = ?self.id, error = %err, "backend pause failed");
                        }
                        self.state = VoiceState::PausedPhysical;
                    } else {
                        self.source = None;
                        self.state = VoiceState::PausedVirtual;
                    }
                }
            }
            VoiceState::PlayingVirtual => self.state = VoiceState::PausedVirtual,
            _ => {}
        }
        self.publish();
    }

    pub fn stop(&mut self, ctx: &mut VoiceCtx) {
        if matches!(self.state, VoiceState::Stopped | VoiceState::Disposed) {
            return;
        }
        self.release_source(ctx);
        self.logical_time = 0.0;
        self.seek_generator(ctx, 0.0);
        self.state = VoiceState::Stopped;
        self.publish();
    }

    pub fn rewind(&mut self, ctx: &mut VoiceCtx) {
        if self.state == VoiceState::Disposed {
            return;
        }
        self.logical_time = 0.0;
        if let Some(source) = self.source {
            if let Err(err) = ctx.backend.rewind(source) {
                tracing::warn!(voice = ?self.id, error = %err, "backend rewind failed");
            }
        }
        self.seek_generator(ctx, 0.0);
        self.publish();
    }

    pub fn dispose(&mut self, ctx: &mut VoiceCtx) {
        if self.state == VoiceState::Disposed {
            return;
        }
        self.release_source(ctx);
        if let Err(err) = ctx.generators.release(self.generator, ctx.backend) {
            tracing::warn!(voice = ?self.id, error = %err, "backend error releasing generator");
        }
        self.state = VoiceState::Disposed;
        self.publish();
    }

    // ---- scheduler-driven transitions ----

    pub(crate) fn promote(&mut self, ctx: &mut VoiceCtx) -> bool {
        let target_playing = match self.state {
            VoiceState::PlayingVirtual => true,
            VoiceState::PausedVirtual => false,
            _ => return false,
        };
        let Some(source) = ctx.pool.rent() else { return false };
        self.source = Some(source);
        self.state = if target_playing { VoiceState::PlayingPhysical } else { VoiceState::PausedPhysical };
        self.hydrate(ctx);
        if !target_playing {
            if let Err(err) = ctx.backend.pause(source) {
                tracing::warn!(voice = ?self.id, error = %err, "backend pause failed during promotion");
            }
        }
        self.publish();
        true
    }

    fn demote(&mut self, ctx: &mut VoiceCtx) {
        if let Some(source) = self.source {
            if let Ok(playhead) = ctx.backend.playhead_seconds(source) {
                self.logical_time = playhead;
            }
        }
        let target = match self.state {
            VoiceState::PlayingPhysical => VoiceState::PlayingVirtual,
            VoiceState::PausedPhysical => VoiceState::PausedVirtual,
            other => other,
        };
        self.release_source(ctx);
        self.state = target;
        self.publish();
    }

    // ---- per-tick update ----

    pub(crate) fn tick(&mut self, dt: f32, ctx: &mut VoiceCtx) {
        if matches!(self.state, VoiceState::Stopped | VoiceState::Disposed) {
            return;
        }

        if self.state == VoiceState::PlayingVirtual {
            let pitch = self.pitch * ctx.buses.snapshot(self.bus).map(|s| s.effective_pitch).unwrap_or(1.0);
            self.logical_time += dt * pitch;
            self.apply_natural_completion(ctx);
            self.publish();
            return;
        }

        if self.state.is_physical() {
            let is_streaming = matches!(
                ctx.generators.get(self.generator).map(|e| &e.kind),
                Some(GeneratorKind::Streaming(_))
            );
            if is_streaming {
                self.pump_streaming(ctx);
            } else if self.state == VoiceState::PlayingPhysical {
                if let Some(source) = self.source {
                    if ctx.backend.source_state(source) == Ok(audio_backend::SourceState::Stopped) && !self.looping {
                        self.stop(ctx);
                        return;
                    }
                }
            }
        }

        let bus_version = ctx.buses.snapshot(self.bus).map(|s| s.version).unwrap_or(self.last_bus_version);
        if bus_version != self.last_bus_version {
            self.dirty.set(DirtyFlags::GAIN | DirtyFlags::PITCH | DirtyFlags::PRIORITY);
            self.last_bus_version = bus_version;
        }
        if let Some(emitter) = self.emitter {
            let emitter_version = ctx.emitters.snapshot(emitter).map(|s| s.version).unwrap_or(self.last_emitter_version);
            if emitter_version != self.last_emitter_version {
                self.dirty.set(DirtyFlags::TRANSFORM | DirtyFlags::PRIORITY);
                self.last_emitter_version = emitter_version;
            }
        }

        if self.dirty.any() {
            self.apply_dirty(ctx, false);
            self.dirty.clear();
        }
        self.publish();
    }

    fn apply_natural_completion(&mut self, ctx: &mut VoiceCtx) {
        let duration = ctx.generators.get(self.generator).and_then(|e| e.duration_secs);
        let Some(duration) = duration else { return };
        if self.logical_time >= duration {
            if self.looping {
                self.logical_time %= duration.max(f32::MIN_POSITIVE);
            } else {
                self.logical_time = duration;
                self.state = VoiceState::Stopped;
            }
        }
    }

    fn pump_streaming(&mut self, ctx: &mut VoiceCtx) {
        let Some(source) = self.source else { return };
        let Some(entry) = ctx.generators.get(self.generator) else { return };
        let GeneratorKind::Streaming(_) = &entry.kind else { return };

        // Step 1: reclaim processed buffers into `free`.
        if let Ok(processed) = ctx.backend.unqueue_processed_buffers(source, usize::MAX) {
            if let Some(entry) = ctx.generators.get(self.generator) {
                if let GeneratorKind::Streaming(s) = &entry.kind {
                    for buf in processed {
                        s.push_free(buf);
                    }
                }
            }
        }

        // Step 2: queue everything ready.
        loop {
            let popped = match ctx.generators.get(self.generator).map(|e| &e.kind) {
                Some(GeneratorKind::Streaming(s)) => s.pop_filled(),
                _ => None,
            };
            let Some(buf) = popped else { break };
            if let Err(err) = ctx.backend.queue_buffer(source, buf) {
                tracing::warn!(voice = ?self.id, error = %err, "failed to queue streaming buffer");
                break;
            }
        }

        // Step 3: underrun / end-of-stream handling.
        let backend_playing = ctx.backend.source_state(source) == Ok(audio_backend::SourceState::Playing);
        if self.state == VoiceState::PlayingPhysical && !backend_playing {
            let queued = ctx.backend.queued_buffer_count(source).unwrap_or(0);
            if queued > 0 {
                if let Err(err) = ctx.backend.play(source) {
                    tracing::warn!(voice = ?self.id, error = %err, "failed to restart source after underrun");
                }
                return;
            }
            let end_of_stream = matches!(ctx.generators.get(self.generator).map(|e| &e.kind), Some(GeneratorKind::Streaming(s)) if s.end_of_stream());
            if end_of_stream {
                if self.looping {
                    self.logical_time = 0.0;
                    self.seek_generator(ctx, 0.0);
                } else {
                    self.stop(ctx);
                }
            }
        }
    }

    fn seek_generator(&mut self, ctx: &mut VoiceCtx, timestamp_secs: f32) {
        if let Some(entry) = ctx.generators.get(self.generator) {
            if let GeneratorKind::Streaming(s) = &entry.kind {
                if s.seekable() {
                    if let Err(err) = s.seek(timestamp_secs) {
                        tracing::warn!(voice = ?self.id, error = %err, "streaming seek failed");
                    }
                }
            }
        }
    }

    // ---- hydration / disconnection ----

    fn hydrate(&mut self, ctx: &mut VoiceCtx) {
        self.dirty = DirtyFlags(DirtyFlags::ALL);
        self.apply_dirty(ctx, true);

        let Some(source) = self.source else { return };
        let kind_is_streaming = matches!(ctx.generators.get(self.generator).map(|e| &e.kind), Some(GeneratorKind::Streaming(_)));
        if kind_is_streaming {
            loop {
                let popped = match ctx.generators.get(self.generator).map(|e| &e.kind) {
                    Some(GeneratorKind::Streaming(s)) => s.pop_filled(),
                    _ => None,
                };
                let Some(buf) = popped else { break };
                if let Err(err) = ctx.backend.queue_buffer(source, buf) {
                    tracing::warn!(voice = ?self.id, error = %err, "failed to queue buffer during hydration");
                    break;
                }
            }
        } else if let Some(entry) = ctx.generators.get(self.generator) {
            if let GeneratorKind::Static(s) = &entry.kind {
                if let Err(err) = ctx.backend.set_source_buffer(source, Some(s.buffer)) {
                    tracing::warn!(voice = ?self.id, error = %err, "failed to attach static buffer");
                }
            }
        }

        if self.logical_time > 0.0 {
            if let Err(err) = ctx.backend.seek_seconds(source, self.logical_time) {
                tracing::warn!(voice = ?self.id, error = %err, "failed to seek on hydration");
            }
        }
        if self.state == VoiceState::PlayingPhysical {
            if let Err(err) = ctx.backend.play(source) {
                tracing::warn!(voice = ?self.id, error = %err, "failed to start source on hydration");
            }
        }
        self.dirty.clear();
    }

    fn release_source(&mut self, ctx: &mut VoiceCtx) {
        let Some(source) = self.source.take() else { return };
        if let Err(err) = ctx.backend.stop(source) {
            tracing::warn!(voice = ?self.id, error = %err, "backend stop failed on release");
        }
        match ctx.generators.get(self.generator).map(|e| &e.kind) {
            Some(GeneratorKind::Static(_)) => {
                let _ = ctx.backend.set_source_buffer(source, None);
            }
            Some(GeneratorKind::Streaming(_)) => {
                if let Ok(remaining) = ctx.backend.clear_queue(source) {
                    if let Some(entry) = ctx.generators.get(self.generator) {
                        if let GeneratorKind::Streaming(s) = &entry.kind {
                            for buf in remaining {
                                s.push_free(buf);
                            }
                        }
                    }
                }
            }
            None => {}
        }
        ctx.pool.release(source);
    }

    fn apply_dirty(&mut self, ctx: &mut VoiceCtx, force: bool) {
        let bus = ctx.buses.snapshot(self.bus).unwrap_or(crate::bus::BusSnapshot {
            effective_gain: 1.0,
            effective_pitch: 1.0,
            effective_priority_bias: 0,
            effective_muted: false,
            version: self.last_bus_version,
        });
        let emitter = self.emitter.and_then(|id| ctx.emitters.snapshot(id));

        if self.dirty.has(DirtyFlags::PRIORITY) || force {
            self.effective_priority = self.priority + emitter.map(|e| e.priority_bias).unwrap_or(0) + bus.effective_priority_bias;
        }

        let Some(source) = self.source else { return };

        if self.dirty.has(DirtyFlags::GAIN) || force {
            let value = self.gain * bus.effective_gain;
            if force || !within_hysteresis(self.applied.gain, value) {
                if let Err(err) = ctx.backend.set_source_param(source, SourceParam::Gain(value)) {
                    tracing::warn!(voice = ?self.id, error = %err, "failed to commit gain");
                } else {
                    self.applied.gain = value;
                }
            }
        }

        if self.dirty.has(DirtyFlags::PITCH) || force {
            let value = self.pitch * bus.effective_pitch;
            if force || !within_hysteresis(self.applied.pitch, value) {
                if let Err(err) = ctx.backend.set_source_param(source, SourceParam::Pitch(value)) {
                    tracing::warn!(voice = ?self.id, error = %err, "failed to commit pitch");
                } else {
                    self.applied.pitch = value;
                }
            }
        }

        if self.dirty.has(DirtyFlags::TRANSFORM) || force {
            let (emitter_pos, emitter_vel) = emitter.map(|e| (e.position, e.velocity)).unwrap_or(([0.0; 3], [0.0; 3]));
            let world_pos = add3(emitter_pos, self.position);
            let world_vel = add3(emitter_vel, self.velocity);
            if let Err(err) = ctx.backend.set_source_param(source, SourceParam::Position(world_pos)) {
                tracing::warn!(voice = ?self.id, error = %err, "failed to commit position");
            }
            if let Err(err) = ctx.backend.set_source_param(source, SourceParam::Velocity(world_vel)) {
                tracing::warn!(voice = ?self.id, error = %err, "failed to commit velocity");
            }
        }

        if self.dirty.has(DirtyFlags::LOOPING) || force {
            if let Err(err) = ctx.backend.set_source_param(source, SourceParam::Looping(self.looping)) {
                tracing::warn!(voice = ?self.id, error = %err, "failed to commit looping");
            }
        }

        if self.dirty.has(DirtyFlags::MIX_MODE) || force {
            let (spatialized, relative, direct) = match self.mix_mode {
                MixMode::Direct => (false, false, true),
                MixMode::Relative => (true, true, false),
                MixMode::Spatialized => (true, false, false),
            };
            for param in [
                SourceParam::SpatializationEnabled(spatialized),
                SourceParam::RelativeToListener(relative),
                SourceParam::DirectChannels(direct),
            ] {
                if let Err(err) = ctx.backend.set_source_param(source, param) {
                    tracing::warn!(voice = ?self.id, error = %err, "failed to commit mix mode");
                }
            }
        }

        if self.dirty.has(DirtyFlags::ATTENUATION) || force {
            if force || !within_hysteresis(self.applied.rolloff_factor, self.rolloff_factor) {
                if ctx.backend.set_source_param(source, SourceParam::RolloffFactor(self.rolloff_factor)).is_ok() {
                    self.applied.rolloff_factor = self.rolloff_factor;
                }
            }
            if force || !within_hysteresis(self.applied.reference_distance, self.reference_distance) {
                if ctx.backend.set_source_param(source, SourceParam::ReferenceDistance(self.reference_distance)).is_ok() {
                    self.applied.reference_distance = self.reference_distance;
                }
            }
            if self.max_distance > 0.0 && (force || !within_hysteresis(self.applied.max_distance, self.max_distance)) {
                if ctx.backend.set_source_param(source, SourceParam::MaxDistance(self.max_distance)).is_ok() {
                    self.applied.max_distance = self.max_distance;
                }
            }
        }
    }
}

fn add3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Off-audio-thread handle to a single voice.
#[derive(Clone)]
pub struct VoiceHandle {
    id: VoiceId,
    marshaller: MarshallerHandle,
    published: Arc<ArcSwap<VoiceSnapshot>>,
}

impl VoiceHandle {
    pub(crate) fn new(id: VoiceId, marshaller: MarshallerHandle, published: Arc<ArcSwap<VoiceSnapshot>>) -> Self {
        Self { id, marshaller, published }
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        **self.published.load()
    }

    pub fn set_gain(&self, value: f32) {
        let id = self.id;
        self.marshaller.defer("voice.set_gain", move |state| state.with_voice(id, |v, _ctx| v.set_gain(value)));
    }

    pub fn set_pitch(&self, value: f32) {
        let id = self.id;
        self.marshaller.defer("voice.set_pitch", move |state| state.with_voice(id, |v, _ctx| v.set_pitch(value)));
    }

    pub fn set_looping(&self, value: bool) {
        let id = self.id;
        self.marshaller.defer("voice.set_looping", move |state| state.with_voice(id, |v, _ctx| v.set_looping(value)));
    }

    pub fn set_position(&self, value: [f32; 3]) {
        let id = self.id;
        self.marshaller.defer("voice.set_position", move |state| state.with_voice(id, |v, _ctx| v.set_position(value)));
    }

    pub fn set_velocity(&self, value: [f32; 3]) {
        let id = self.id;
        self.marshaller.defer("voice.set_velocity", move |state| state.with_voice(id, |v, _ctx| v.set_velocity(value)));
    }

    pub fn set_transform(&self, position: [f32; 3], velocity: [f32; 3]) {
        let id = self.id;
        self.marshaller
            .defer("voice.set_transform", move |state| state.with_voice(id, |v, _ctx| v.set_transform(position, velocity)));
    }

    pub fn set_priority(&self, value: i32) {
        let id = self.id;
        self.marshaller.defer("voice.set_priority", move |state| state.with_voice(id, |v, _ctx| v.set_priority(value)));
    }

    pub fn set_rolloff_factor(&self, value: f32) {
        let id = self.id;
        self.marshaller
            .defer("voice.set_rolloff_factor", move |state| state.with_voice(id, |v, _ctx| v.set_rolloff_factor(value)));
    }

    pub fn set_reference_distance(&self, value: f32) {
        let id = self.id;
        self.marshaller
            .defer("voice.set_reference_distance", move |state| state.with_voice(id, |v, _ctx| v.set_reference_distance(value)));
    }

    pub fn set_max_distance(&self, value: f32) {
        let id = self.id;
        self.marshaller
            .defer("voice.set_max_distance", move |state| state.with_voice(id, |v, _ctx| v.set_max_distance(value)));
    }

    pub fn set_mix_mode(&self, value: MixMode) {
        let id = self.id;
        self.marshaller.defer("voice.set_mix_mode", move |state| state.with_voice(id, |v, _ctx| v.set_mix_mode(value)));
    }

    pub fn attach_to_emitter(&self, emitter: Option<EmitterId>) {
        let id = self.id;
        self.marshaller
            .defer("voice.attach_to_emitter", move |state| state.with_voice(id, |v, _ctx| v.attach_to_emitter(emitter)));
    }

    pub fn play(&self) {
        let id = self.id;
        self.marshaller.defer("voice.play", move |state| state.with_voice(id, |v, ctx| v.play(ctx)));
    }

    pub fn pause(&self) {
        let id = self.id;
        self.marshaller.defer("voice.pause", move |state| state.with_voice(id, |v, ctx| v.pause(ctx)));
    }

    pub fn stop(&self) {
        let id = self.id;
        self.marshaller.defer("voice.stop", move |state| state.with_voice(id, |v, ctx| v.stop(ctx)));
    }

    pub fn rewind(&self) {
        let id = self.id;
        self.marshaller.defer("voice.rewind", move |state| state.with_voice(id, |v, ctx| v.rewind(ctx)));
    }

    pub fn dispose(&self) {
        let id = self.id;
        self.marshaller.defer("voice.dispose", move |state| state.with_voice(id, |v, ctx| v.dispose(ctx)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusTree;
    use crate::emitter::EmitterTable;
    use crate::generator::static_gen::StaticGenerator;
    use crate::generator::GeneratorTable;
    use crate::ids::IdAllocator;
    use audio_backend::mock::MockBackend;
    use audio_backend::{PcmFormat, SampleEncoding};

    fn fmt() -> PcmFormat {
        PcmFormat { channels: 1, sample_rate: 10, bits_per_sample: 32, encoding: SampleEncoding::Float }
    }

    struct Fixture {
        buses: BusTree,
        emitters: EmitterTable,
        generators: GeneratorTable,
        pool: SourcePool,
        backend: MockBackend,
    }

    impl Fixture {
        fn new(pool_capacity: usize) -> Self {
            let mut backend = MockBackend::new(pool_capacity);
            let pool = SourcePool::new(pool_capacity, &mut backend).unwrap();
            Self { buses: BusTree::new(), emitters: EmitterTable::default(), generators: GeneratorTable::default(), pool, backend }
        }

        fn ctx(&mut self) -> VoiceCtx<'_> {
            VoiceCtx { buses: &self.buses, emitters: &self.emitters, generators: &mut self.generators, pool: &mut self.pool, backend: &mut self.backend }
        }

        fn one_second_static_generator(&mut self) -> GeneratorId {
            let pcm = vec![0u8; 10 * 4];
            let buffer = self.backend.create_buffer(fmt(), &pcm).unwrap();
            self.generators.insert_static(fmt(), StaticGenerator::new(buffer), Some(1.0))
        }
    }

    fn new_voice(generator: GeneratorId, bus: BusId) -> Voice {
        Voice::new(VoiceId(IdAllocator::default().next()), generator, bus, false)
    }

    #[test]
    fn play_from_stopped_rents_source_and_goes_physical() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingPhysical);
        assert!(voice.source().is_some());
    }

    #[test]
    fn play_virtualizes_when_pool_exhausted() {
        let mut f = Fixture::new(0);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingVirtual);
        assert!(voice.source().is_none());
    }

    #[test]
    fn pause_then_play_resumes_physical() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        voice.pause(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PausedPhysical);
        voice.play(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingPhysical);
    }

    #[test]
    fn stop_releases_source_and_resets_time() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        voice.tick(0.3, &mut f.ctx());
        voice.stop(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::Stopped);
        assert_eq!(voice.logical_time(), 0.0);
        assert!(voice.source().is_none());
        assert_eq!(f.pool.rented(), 0);
    }

    #[test]
    fn idempotent_operations_are_no_ops() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        let source_before = voice.source();
        voice.play(&mut f.ctx());
        assert_eq!(voice.source(), source_before);
        voice.dispose(&mut f.ctx());
        voice.dispose(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::Disposed);
        voice.play(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::Disposed);
    }

    #[test]
    fn virtual_voice_advances_and_completes_naturally() {
        let mut f = Fixture::new(0);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingVirtual);
        voice.tick(0.6, &mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingVirtual);
        voice.tick(0.6, &mut f.ctx());
        assert_eq!(voice.state(), VoiceState::Stopped);
    }

    #[test]
    fn virtual_voice_loops_modulo_duration() {
        let mut f = Fixture::new(0);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.set_looping(true);
        voice.play(&mut f.ctx());
        voice.tick(1.3, &mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingVirtual);
        assert!((voice.logical_time() - 0.3).abs() < 1e-5);
    }

    #[test]
    fn promotion_hydrates_and_commits_gain_and_pitch() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        f.buses.set_local_gain(f.buses.master(), 0.5);
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.set_gain(0.8);
        voice.play(&mut f.ctx());
        let source = voice.source().unwrap();
        let params = f.backend.params(source).unwrap();
        assert!((params.gain - 0.4).abs() < 1e-5);
    }

    #[test]
    fn hysteresis_skips_subpixel_gain_rewrite() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        let source = voice.source().unwrap();
        f.backend.drain_param_writes(source);
        voice.set_gain(1.0 + 0.0001);
        voice.tick(0.01, &mut f.ctx());
        assert!(f.backend.drain_param_writes(source).is_empty());
        voice.set_gain(1.5);
        voice.tick(0.01, &mut f.ctx());
        assert!(!f.backend.drain_param_writes(source).is_empty());
    }

    #[test]
    fn demote_captures_playhead_and_releases_source() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        let source = voice.source().unwrap();
        f.backend.advance(source, 0.4);
        voice.demote(&mut f.ctx());
        assert_eq!(voice.state(), VoiceState::PlayingVirtual);
        assert!(voice.source().is_none());
        assert!((voice.logical_time() - 0.4).abs() < 1e-5);
        assert_eq!(f.pool.rented(), 0);
    }

    #[test]
    fn promote_rehydrates_a_virtual_voice() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let mut voice = new_voice(gen, master);
        voice.play(&mut f.ctx());
        let source = voice.source().unwrap();
        f.backend.advance(source, 0.4);
        voice.demote(&mut f.ctx());
        assert!(voice.promote(&mut f.ctx()));
        assert_eq!(voice.state(), VoiceState::PlayingPhysical);
        let new_source = voice.source().unwrap();
        assert!((f.backend.playhead_seconds(new_source).unwrap() - 0.4).abs() < 1e-5);
    }

    #[test]
    fn emitter_move_writes_world_position_exactly_once() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let master = f.buses.master();
        let emitter = f.emitters.create();
        let mut voice = new_voice(gen, master);
        voice.attach_to_emitter(Some(emitter));
        voice.set_position([1.0, 0.0, 0.0]);
        voice.play(&mut f.ctx());
        let source = voice.source().unwrap();
        f.backend.drain_param_writes(source);

        f.emitters.set_transform(emitter, [10.0, 0.0, 0.0], [0.0, 0.0, 0.0]);
        voice.tick(0.01, &mut f.ctx());

        let writes = f.backend.drain_param_writes(source);
        let positions: Vec<_> = writes
            .iter()
            .filter_map(|p| match p {
                SourceParam::Position(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![[11.0, 0.0, 0.0]]);
    }

    #[test]
    fn effective_priority_sums_local_emitter_and_bus() {
        let mut f = Fixture::new(1);
        let gen = f.one_second_static_generator();
        let sfx = f.buses.resolve_or_create("/sfx");
        f.buses.set_local_priority_bias(sfx, 2);
        let emitter = f.emitters.create();
        f.emitters.set_priority_bias(emitter, 3);

        let mut voice = new_voice(gen, sfx);
        voice.attach_to_emitter(Some(emitter));
        voice.set_priority(5);
        voice.play(&mut f.ctx());

        assert_eq!(voice.effective_priority_for_scheduling(), 5 + 3 + 2);
    }
}
