//! The audio-thread marshaller: the only way a non-audio thread may touch engine state.
//!
//! Actions are tagged closures rather than a boxed `dyn FnOnce` alone, or a
//! hand-enumerated command struct per mutation: the label gives tests and
//! logs something to assert/print on without needing one enum variant per
//! setter (bus/emitter/voice between them have several dozen).

use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::engine::EngineState;
use crate::error::EngineError;

pub(crate) struct Command {
    label: &'static str,
    action: Box<dyn FnOnce(&mut EngineState) + Send>,
}

/// Owned by the engine; only `drain` is ever called, and only from the
/// audio thread.
pub struct Marshaller {
    sender: Sender<Command>,
    receiver: Receiver<Command>,
}

impl Marshaller {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn handle(&self) -> MarshallerHandle {
        MarshallerHandle {
            sender: self.sender.clone(),
        }
    }

    /// Drain every command currently enqueued, FIFO. A command enqueued
    /// reentrantly from inside an action body may or may not be picked up
    /// by this same call; either way it's harmless, since commands within
    /// one drain run in enqueue order regardless. The guarantee the engine
    /// actually relies on (reentrant effects aren't observed until the
    /// tick's *second* drain) comes from `tick` only calling `drain` at its
    /// two fixed points, never mid-loop over voices.
    pub(crate) fn drain(&self, state: &mut EngineState) {
        while let Ok(cmd) = self.receiver.try_recv() {
            let label = cmd.label;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (cmd.action)(state)));
            if let Err(payload) = outcome {
                let msg = panic_message(&payload);
                tracing::error!(action = label, error = %msg, "marshaller action panicked");
            }
        }
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Cloneable, `Send + Sync` submission side of the marshaller. Every public
/// handle type (`BusHandle`, `EmitterHandle`, `VoiceHandle`, ...) holds one
/// of these.
#[derive(Clone)]
pub struct MarshallerHandle {
    sender: Sender<Command>,
}

impl MarshallerHandle {
    /// Fire-and-forget: enqueue `action` and return immediately. Panics
    /// inside `action` are caught and logged; they never propagate to the
    /// caller (the fire-and-forget form has no caller to tell).
    pub fn defer(&self, label: &'static str, action: impl FnOnce(&mut EngineState) + Send + 'static) {
        if self.sender.send(Command { label, action: Box::new(action) }).is_err() {
            tracing::warn!(action = label, "marshaller dropped: engine is gone");
        }
    }

    /// Completion-signaling: enqueue `action` and return a [`Reply`] that
    /// resolves once a tick has processed it. A panic inside `action` is
    /// delivered to the waiter as [`EngineError::ActionFailed`], never
    /// logged silently — there's a caller here to tell, unlike [`Self::defer`].
    pub fn defer_with_reply<T: Send + 'static>(
        &self,
        label: &'static str,
        action: impl FnOnce(&mut EngineState) -> T + Send + 'static,
    ) -> Reply<T> {
        let (tx, rx) = bounded(1);
        self.defer(label, move |state| {
            let _ = tx.send(action(state));
        });
        Reply { receiver: rx }
    }
}

/// A pending completion-signaling request. Dropping it without calling
/// [`Reply::wait`] simply discards the eventual result.
pub struct Reply<T> {
    receiver: Receiver<T>,
}

impl<T> Reply<T> {
    /// Block the calling thread until the action has been fully processed
    /// by a tick.
    pub fn wait(self) -> Result<T, EngineError> {
        self.receiver.recv().map_err(|_| EngineError::ActionFailed("action panicked or engine was dropped".into()))
    }

    /// Non-blocking poll, for callers on the audio thread itself (which
    /// must never block on its own drain).
    pub fn try_wait(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}
