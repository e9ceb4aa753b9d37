//! Fixed-capacity free-list of backend source handles.

use std::collections::VecDeque;

use audio_backend::{AudioBackend, BackendError, SourceHandle};

pub struct SourcePool {
    capacity: usize,
    free: VecDeque<SourceHandle>,
    rented: usize,
}

impl SourcePool {
    /// Eagerly create `capacity` backend sources up front so renting never
    /// has to round-trip to the backend on the hot path.
    pub fn new(capacity: usize, backend: &mut dyn AudioBackend) -> Result<Self, BackendError> {
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(backend.create_source()?);
        }
        Ok(Self { capacity, free, rented: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rented(&self) -> usize {
        self.rented
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Rent a source, or `None` if the pool is exhausted. Never preempts an
    /// already-rented source to make room (promote-only virtualization).
    pub fn rent(&mut self) -> Option<SourceHandle> {
        let handle = self.free.pop_front()?;
        self.rented += 1;
        Some(handle)
    }

    pub fn release(&mut self, handle: SourceHandle) {
        self.rented = self.rented.saturating_sub(1);
        self.free.push_back(handle);
    }
}
