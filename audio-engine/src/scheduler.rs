//! Virtualization scheduler and one-shot reaping.
//!
//! Promote-only: a virtual voice is given a source whenever the pool has
//! capacity, but an already-physical voice is never evicted to make room
//! for a higher-priority virtual one.

use std::collections::HashMap;

use crate::ids::VoiceId;
use crate::voice::{Voice, VoiceCtx, VoiceState};

/// Attempt to promote every virtual voice, highest effective priority
/// first, until the pool is exhausted.
pub(crate) fn run_virtualization_pass(voices: &mut HashMap<VoiceId, Voice>, ctx_builder: &mut dyn FnMut() -> VoiceCtx<'_>) {
    let mut candidates: Vec<VoiceId> = voices
        .values()
        .filter(|v| matches!(v.state(), VoiceState::PlayingVirtual | VoiceState::PausedVirtual))
        .map(Voice::id)
        .collect();
    candidates.sort_by_key(|id| std::cmp::Reverse(voices[id].effective_priority_for_scheduling()));

    for id in candidates {
        let mut ctx = ctx_builder();
        if ctx.pool.available() == 0 {
            break;
        }
        if let Some(voice) = voices.get_mut(&id) {
            voice.promote(&mut ctx);
        }
    }
}

/// Dispose every one-shot voice that reached `Stopped` this tick.
pub(crate) fn reap_one_shots(voices: &mut HashMap<VoiceId, Voice>, one_shots: &mut std::collections::HashSet<VoiceId>, ctx_builder: &mut dyn FnMut() -> VoiceCtx<'_>) {
    let finished: Vec<VoiceId> = one_shots
        .iter()
        .copied()
        .filter(|id| voices.get(id).map_or(true, |v| v.state() == VoiceState::Stopped))
        .collect();

    for id in finished {
        one_shots.remove(&id);
        if let Some(voice) = voices.get_mut(&id) {
            let mut ctx = ctx_builder();
            voice.dispose(&mut ctx);
        }
        voices.remove(&id);
    }
}
