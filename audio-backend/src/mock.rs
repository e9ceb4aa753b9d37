//! A backend good enough to drive the engine deterministically in tests.
//!
//! Real OpenAL-family drivers advance source playheads on their own
//! real-time thread; this one only advances when a test calls [`MockBackend::advance`],
//! which simulates the device consuming `dt` seconds of whatever is queued
//! on a source (static buffer or streaming queue), including underrun
//! (state flips to `Stopped` when a playing streaming source runs its
//! queue dry — exactly what a real device would report).

use std::collections::{HashMap, VecDeque};

use crate::{
    AudioBackend, BackendError, BufferHandle, ListenerOrientation, PcmFormat, SampleEncoding,
    SourceHandle, SourceParam, SourceState,
};

struct MockBuffer {
    format: PcmFormat,
    duration_secs: f32,
}

struct QueuedBuffer {
    handle: BufferHandle,
    duration_secs: f32,
    processed: bool,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct SourceParams {
    pub gain: f32,
    pub pitch: f32,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub looping: bool,
    pub direct_channels: bool,
    pub spatialization_enabled: bool,
    pub relative_to_listener: bool,
    pub rolloff_factor: f32,
    pub reference_distance: f32,
    pub max_distance: f32,
}

struct MockSource {
    state: SourceState,
    static_buffer: Option<BufferHandle>,
    queue: VecDeque<QueuedBuffer>,
    playhead: f32,
    params: SourceParams,
}

impl Default for MockSource {
    fn default() -> Self {
        Self {
            state: SourceState::Initial,
            static_buffer: None,
            queue: VecDeque::new(),
            playhead: 0.0,
            params: SourceParams {
                gain: 1.0,
                pitch: 1.0,
                ..Default::default()
            },
        }
    }
}

/// A mock backend with a fixed-capacity source pool, suitable for both
/// unit tests and as the default backend when no platform driver is wired
/// up (see the crate's non-goals around concrete driver bindings).
pub struct MockBackend {
    capacity: usize,
    next_source_id: u32,
    next_buffer_id: u32,
    sources: HashMap<SourceHandle, MockSource>,
    buffers: HashMap<BufferHandle, MockBuffer>,
    listener_position: [f32; 3],
    listener_velocity: [f32; 3],
    listener_orientation: ListenerOrientation,
    param_log: Vec<(SourceHandle, SourceParam)>,
}

impl MockBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_source_id: 1,
            next_buffer_id: 1,
            sources: HashMap::new(),
            buffers: HashMap::new(),
            listener_position: [0.0; 3],
            listener_velocity: [0.0; 3],
            listener_orientation: ListenerOrientation {
                forward: [0.0, 0.0, -1.0],
                up: [0.0, 1.0, 0.0],
            },
            param_log: Vec::new(),
        }
    }

    /// Simulate the device consuming `dt` seconds of playback on `source`.
    /// No-op if the source is not `Playing`.
    pub fn advance(&mut self, source: SourceHandle, dt: f32) {
        let Some(src) = self.sources.get_mut(&source) else {
            return;
        };
        if src.state != SourceState::Playing {
            return;
        }
        if let Some(buf) = src.static_buffer {
            let duration = self.buffers.get(&buf).map(|b| b.duration_secs).unwrap_or(0.0);
            src.playhead += dt;
            if duration > 0.0 && src.playhead >= duration {
                if src.params.looping {
                    src.playhead %= duration;
                } else {
                    src.playhead = duration;
                    src.state = SourceState::Stopped;
                }
            }
            return;
        }
        let mut remaining = dt;
        while remaining > 0.0 {
            let Some(front) = src.queue.front_mut() else {
                src.state = SourceState::Stopped;
                break;
            };
            let avail = front.duration_secs - src.playhead;
            if remaining < avail {
                src.playhead += remaining;
                remaining = 0.0;
            } else {
                remaining -= avail;
                front.processed = true;
                src.queue.pop_front();
                src.playhead = 0.0;
                if src.queue.is_empty() {
                    src.state = SourceState::Stopped;
                    break;
                }
            }
        }
    }

    pub fn params(&self, source: SourceHandle) -> Option<SourceParams> {
        self.sources.get(&source).map(|s| s.params)
    }

    /// Drain the log of parameter writes made since the last drain. Tests
    /// use this to assert a value was committed exactly once per tick.
    pub fn drain_param_writes(&mut self, source: SourceHandle) -> Vec<SourceParam> {
        let mut out = Vec::new();
        self.param_log.retain(|(s, p)| {
            if *s == source {
                out.push(*p);
                false
            } else {
                true
            }
        });
        out
    }

    fn get_source_mut(&mut self, source: SourceHandle) -> Result<&mut MockSource, BackendError> {
        self.sources.get_mut(&source).ok_or(BackendError::UnknownSource(source))
    }

    fn get_buffer(&self, buffer: BufferHandle) -> Result<&MockBuffer, BackendError> {
        self.buffers.get(&buffer).ok_or(BackendError::UnknownBuffer(buffer))
    }
}

fn bytes_to_duration(format: PcmFormat, pcm_len: usize) -> f32 {
    let bytes_per_sample = (format.bits_per_sample / 8).max(1) as usize;
    let frame_bytes = bytes_per_sample * format.channels.max(1) as usize;
    if frame_bytes == 0 || format.sample_rate == 0 {
        return 0.0;
    }
    let frames = pcm_len / frame_bytes;
    frames as f32 / format.sample_rate as f32
}

impl AudioBackend for MockBackend {
    fn create_source(&mut self) -> Result<SourceHandle, BackendError> {
        if self.sources.len() >= self.capacity {
            return Err(BackendError::SourcePoolExhausted);
        }
        let handle = SourceHandle(self.next_source_id);
        self.next_source_id += 1;
        self.sources.insert(handle, MockSource::default());
        tracing::debug!(?handle, "mock backend: source created");
        Ok(handle)
    }

    fn destroy_source(&mut self, source: SourceHandle) -> Result<(), BackendError> {
        self.sources
            .remove(&source)
            .map(|_| ())
            .ok_or(BackendError::UnknownSource(source))
    }

    fn create_buffer(&mut self, format: PcmFormat, pcm: &[u8]) -> Result<BufferHandle, BackendError> {
        if format.encoding != SampleEncoding::Float && format.encoding != SampleEncoding::IntegerPcm {
            return Err(BackendError::Unsupported("unknown encoding".into()));
        }
        let handle = BufferHandle(self.next_buffer_id);
        self.next_buffer_id += 1;
        let duration_secs = bytes_to_duration(format, pcm.len());
        self.buffers.insert(handle, MockBuffer { format, duration_secs });
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
        self.buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or(BackendError::UnknownBuffer(buffer))
    }

    fn rebuffer(&mut self, buffer: BufferHandle, format: PcmFormat, pcm: &[u8]) -> Result<(), BackendError> {
        let duration_secs = bytes_to_duration(format, pcm.len());
        let slot = self.buffers.get_mut(&buffer).ok_or(BackendError::UnknownBuffer(buffer))?;
        slot.format = format;
        slot.duration_secs = duration_secs;
        Ok(())
    }

    fn set_source_buffer(&mut self, source: SourceHandle, buffer: Option<BufferHandle>) -> Result<(), BackendError> {
        if let Some(b) = buffer {
            self.get_buffer(b)?;
        }
        let src = self.get_source_mut(source)?;
        src.static_buffer = buffer;
        src.playhead = 0.0;
        Ok(())
    }

    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<(), BackendError> {
        let duration_secs = self.get_buffer(buffer)?.duration_secs;
        let src = self.get_source_mut(source)?;
        src.queue.push_back(QueuedBuffer {
            handle: buffer,
            duration_secs,
            processed: false,
        });
        Ok(())
    }

    fn unqueue_processed_buffers(&mut self, source: SourceHandle, max: usize) -> Result<Vec<BufferHandle>, BackendError> {
        let src = self.get_source_mut(source)?;
        let mut out = Vec::new();
        while out.len() < max {
            match src.queue.front() {
                Some(q) if q.processed => {
                    out.push(src.queue.pop_front().unwrap().handle);
                }
                _ => break,
            }
        }
        Ok(out)
    }

    fn queued_buffer_count(&self, source: SourceHandle) -> Result<usize, BackendError> {
        self.sources
            .get(&source)
            .map(|s| s.queue.len())
            .ok_or(BackendError::UnknownSource(source))
    }

    fn clear_queue(&mut self, source: SourceHandle) -> Result<Vec<BufferHandle>, BackendError> {
        let src = self.get_source_mut(source)?;
        let drained = src.queue.drain(..).map(|q| q.handle).collect();
        src.playhead = 0.0;
        Ok(drained)
    }

    fn set_source_param(&mut self, source: SourceHandle, param: SourceParam) -> Result<(), BackendError> {
        let src = self.get_source_mut(source)?;
        match param {
            SourceParam::Gain(v) => src.params.gain = v,
            SourceParam::Pitch(v) => src.params.pitch = v,
            SourceParam::Position(v) => src.params.position = v,
            SourceParam::Velocity(v) => src.params.velocity = v,
            SourceParam::Looping(v) => src.params.looping = v,
            SourceParam::DirectChannels(v) => src.params.direct_channels = v,
            SourceParam::SpatializationEnabled(v) => src.params.spatialization_enabled = v,
            SourceParam::RelativeToListener(v) => src.params.relative_to_listener = v,
            SourceParam::RolloffFactor(v) => src.params.rolloff_factor = v,
            SourceParam::ReferenceDistance(v) => src.params.reference_distance = v,
            SourceParam::MaxDistance(v) => src.params.max_distance = v,
        }
        self.param_log.push((source, param));
        Ok(())
    }

    fn play(&mut self, source: SourceHandle) -> Result<(), BackendError> {
        self.get_source_mut(source)?.state = SourceState::Playing;
        Ok(())
    }

    fn pause(&mut self, source: SourceHandle) -> Result<(), BackendError> {
        self.get_source_mut(source)?.state = SourceState::Paused;
        Ok(())
    }

    fn stop(&mut self, source: SourceHandle) -> Result<(), BackendError> {
        let src = self.get_source_mut(source)?;
        src.state = SourceState::Stopped;
        src.playhead = 0.0;
        Ok(())
    }

    fn rewind(&mut self, source: SourceHandle) -> Result<(), BackendError> {
        let src = self.get_source_mut(source)?;
        src.playhead = 0.0;
        for q in src.queue.iter_mut() {
            q.processed = false;
        }
        Ok(())
    }

    fn source_state(&self, source: SourceHandle) -> Result<SourceState, BackendError> {
        self.sources
            .get(&source)
            .map(|s| s.state)
            .ok_or(BackendError::UnknownSource(source))
    }

    fn playhead_seconds(&self, source: SourceHandle) -> Result<f32, BackendError> {
        self.sources
            .get(&source)
            .map(|s| s.playhead)
            .ok_or(BackendError::UnknownSource(source))
    }

    fn seek_seconds(&mut self, source: SourceHandle, seconds: f32) -> Result<(), BackendError> {
        self.get_source_mut(source)?.playhead = seconds;
        Ok(())
    }

    fn set_listener_position(&mut self, position: [f32; 3]) -> Result<(), BackendError> {
        self.listener_position = position;
        Ok(())
    }

    fn set_listener_velocity(&mut self, velocity: [f32; 3]) -> Result<(), BackendError> {
        self.listener_velocity = velocity;
        Ok(())
    }

    fn set_listener_orientation(&mut self, orientation: ListenerOrientation) -> Result<(), BackendError> {
        self.listener_orientation = orientation;
        Ok(())
    }

    fn source_capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> PcmFormat {
        PcmFormat {
            channels: 1,
            sample_rate: 10,
            bits_per_sample: 32,
            encoding: SampleEncoding::Float,
        }
    }

    #[test]
    fn pool_exhaustion_returns_error() {
        let mut backend = MockBackend::new(1);
        let _s1 = backend.create_source().unwrap();
        let err = backend.create_source().unwrap_err();
        assert!(matches!(err, BackendError::SourcePoolExhausted));
    }

    #[test]
    fn static_buffer_reaches_stopped_after_duration() {
        let mut backend = MockBackend::new(1);
        let source = backend.create_source().unwrap();
        // 10 frames @ 10Hz mono f32 = 1.0s
        let pcm = vec![0u8; 10 * 4];
        let buffer = backend.create_buffer(fmt(), &pcm).unwrap();
        backend.set_source_buffer(source, Some(buffer)).unwrap();
        backend.play(source).unwrap();
        backend.advance(source, 0.5);
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Playing);
        backend.advance(source, 0.6);
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Stopped);
    }

    #[test]
    fn streaming_queue_underrun_stops_source() {
        let mut backend = MockBackend::new(1);
        let source = backend.create_source().unwrap();
        let pcm = vec![0u8; 10 * 4];
        let buffer = backend.create_buffer(fmt(), &pcm).unwrap();
        backend.queue_buffer(source, buffer).unwrap();
        backend.play(source).unwrap();
        backend.advance(source, 2.0);
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Stopped);
        assert_eq!(backend.queued_buffer_count(source).unwrap(), 0);
    }

    #[test]
    fn clear_queue_drains_regardless_of_processed_state() {
        let mut backend = MockBackend::new(1);
        let source = backend.create_source().unwrap();
        let buffer = backend.create_buffer(fmt(), &[0u8; 40]).unwrap();
        backend.queue_buffer(source, buffer).unwrap();
        backend.queue_buffer(source, buffer).unwrap();
        let drained = backend.clear_queue(source).unwrap();
        assert_eq!(drained, vec![buffer, buffer]);
        assert_eq!(backend.queued_buffer_count(source).unwrap(), 0);
    }

    #[test]
    fn rebuffer_changes_duration_in_place() {
        let mut backend = MockBackend::new(1);
        let pcm_short = vec![0u8; 5 * 4];
        let buffer = backend.create_buffer(fmt(), &pcm_short).unwrap();
        assert_eq!(backend.buffers.get(&buffer).unwrap().duration_secs, 0.5);
        let pcm_long = vec![0u8; 10 * 4];
        backend.rebuffer(buffer, fmt(), &pcm_long).unwrap();
        assert_eq!(backend.buffers.get(&buffer).unwrap().duration_secs, 1.0);
    }

    #[test]
    fn param_writes_are_logged_and_drainable() {
        let mut backend = MockBackend::new(1);
        let source = backend.create_source().unwrap();
        backend.set_source_param(source, SourceParam::Gain(0.5)).unwrap();
        let writes = backend.drain_param_writes(source);
        assert_eq!(writes, vec![SourceParam::Gain(0.5)]);
        assert!(backend.drain_param_writes(source).is_empty());
    }
}
