//! World-space listener transform.

use audio_backend::ListenerOrientation;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerState {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub orientation: ListenerOrientation,
    dirty: bool,
}

impl Default for ListenerState {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            velocity: [0.0, 0.0, 0.0],
            orientation: ListenerOrientation { forward: [0.0, 0.0, -1.0], up: [0.0, 1.0, 0.0] },
            dirty: false,
        }
    }
}

impl ListenerState {
    pub fn set_position(&mut self, position: [f32; 3]) {
        self.position = position;
        self.dirty = true;
    }

    pub fn set_velocity(&mut self, velocity: [f32; 3]) {
        self.velocity = velocity;
        self.dirty = true;
    }

    pub fn set_orientation(&mut self, orientation: ListenerOrientation) {
        self.orientation = orientation;
        self.dirty = true;
    }

    /// Apply to the backend once per tick, only if something changed.
    pub fn apply(&mut self, backend: &mut dyn audio_backend::AudioBackend) -> Result<(), audio_backend::BackendError> {
        if !self.dirty {
            return Ok(());
        }
        backend.set_listener_position(self.position)?;
        backend.set_listener_velocity(self.velocity)?;
        backend.set_listener_orientation(self.orientation)?;
        self.dirty = false;
        Ok(())
    }
}
