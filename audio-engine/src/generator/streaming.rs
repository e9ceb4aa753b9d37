//! Streaming generator: a ring of N backend buffers fed by a background
//! decode worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use audio_backend::{BufferHandle, PcmFormat};
use audio_decoder::{Decoder, DecoderError};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::ids::GeneratorId;
use crate::marshaller::MarshallerHandle;

/// Gate the background producer waits on. Only ever held briefly, around a
/// seek — day-to-day production runs regardless of whether the owning voice
/// is paused, so buffers are ready the instant it resumes.
struct PauseGate {
    paused: Mutex<bool>,
    cvar: Condvar,
}

pub struct StreamingGenerator {
    format: PcmFormat,
    buffers: Vec<BufferHandle>,
    free: Arc<ArrayQueue<BufferHandle>>,
    filled: Arc<ArrayQueue<BufferHandle>>,
    end_of_stream: Arc<AtomicBool>,
    looping: Arc<AtomicBool>,
    seekable: bool,
    gate: Arc<PauseGate>,
    cancel: Arc<AtomicBool>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    worker: Option<JoinHandle<()>>,
}

impl StreamingGenerator {
    /// Spawn the background producer and return the generator handle that
    /// owns `buffers` (all pre-created, empty, backend buffer handles).
    pub fn spawn(
        id: GeneratorId,
        format: PcmFormat,
        buffers: Vec<BufferHandle>,
        chunk_frames: usize,
        looping: bool,
        seekable: bool,
        decoder: Box<dyn Decoder>,
        marshaller: MarshallerHandle,
    ) -> Self {
        let free = Arc::new(ArrayQueue::new(buffers.len()));
        for &b in &buffers {
            let _ = free.push(b);
        }
        let filled = Arc::new(ArrayQueue::new(buffers.len()));
        let end_of_stream = Arc::new(AtomicBool::new(false));
        let looping = Arc::new(AtomicBool::new(looping));
        let gate = Arc::new(PauseGate { paused: Mutex::new(false), cvar: Condvar::new() });
        let cancel = Arc::new(AtomicBool::new(false));
        let decoder = Arc::new(Mutex::new(decoder));

        let worker = {
            let free = free.clone();
            let filled = filled.clone();
            let end_of_stream = end_of_stream.clone();
            let looping = looping.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            let decoder = decoder.clone();
            thread::Builder::new()
                .name(format!("audio-stream-{}", id.0))
                .spawn(move || {
                    producer_loop(id, format, chunk_frames, free, filled, end_of_stream, looping, gate, cancel, decoder, marshaller)
                })
                .expect("failed to spawn streaming decode thread")
        };

        Self {
            format,
            buffers,
            free,
            filled,
            end_of_stream,
            looping,
            seekable,
            gate,
            cancel,
            decoder,
            worker: Some(worker),
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn buffers(&self) -> &[BufferHandle] {
        &self.buffers
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn filled_len(&self) -> usize {
        self.filled.len()
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    pub fn clear_end_of_stream(&self) {
        self.end_of_stream.store(false, Ordering::Release);
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, value: bool) {
        self.looping.store(value, Ordering::Release);
    }

    pub fn seekable(&self) -> bool {
        self.seekable
    }

    /// Pump step 1: return a buffer to `free` after the backend reports it
    /// consumed.
    pub fn push_free(&self, handle: BufferHandle) {
        let _ = self.free.push(handle);
    }

    /// Pump step 2: pop the oldest ready buffer to queue on the source.
    pub fn pop_filled(&self) -> Option<BufferHandle> {
        self.filled.pop()
    }

    /// Called from the audio thread by the producer's marshaled upload job.
    pub(crate) fn push_filled(&self, handle: BufferHandle) {
        let _ = self.filled.push(handle);
    }

    /// Pause the producer, drain `filled` back to `free`, clear end-of-stream,
    /// seek the decoder, resume. Fails outright on a non-seekable stream.
    pub fn seek(&self, timestamp_secs: f32) -> Result<(), DecoderError> {
        if !self.seekable {
            return Err(DecoderError::SeekUnsupported);
        }
        *self.gate.paused.lock() = true;
        while let Some(h) = self.filled.pop() {
            let _ = self.free.push(h);
        }
        self.end_of_stream.store(false, Ordering::Release);
        let result = self.decoder.lock().seek(timestamp_secs);
        *self.gate.paused.lock() = false;
        self.gate.cvar.notify_all();
        result
    }
}

impl Drop for StreamingGenerator {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        *self.gate.paused.lock() = false;
        self.gate.cvar.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn producer_loop(
    id: GeneratorId,
    format: PcmFormat,
    chunk_frames: usize,
    free: Arc<ArrayQueue<BufferHandle>>,
    filled: Arc<ArrayQueue<BufferHandle>>,
    end_of_stream: Arc<AtomicBool>,
    looping: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
    cancel: Arc<AtomicBool>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    marshaller: MarshallerHandle,
) {
    let bytes_per_frame = (format.bits_per_sample / 8).max(1) as usize * format.channels.max(1) as usize;

    while !cancel.load(Ordering::Acquire) {
        {
            let mut paused = gate.paused.lock();
            while *paused && !cancel.load(Ordering::Acquire) {
                gate.cvar.wait(&mut paused);
            }
        }
        if cancel.load(Ordering::Acquire) {
            break;
        }

        let Some(handle) = free.pop() else {
            thread::sleep(Duration::from_millis(2));
            continue;
        };

        let mut chunk = vec![0u8; chunk_frames * bytes_per_frame];
        let decoded = decoder.lock().decode(chunk_frames, &mut chunk);

        match decoded {
            Ok(0) => {
                if looping.load(Ordering::Acquire) && decoder.lock().seek(0.0).is_ok() {
                    let _ = free.push(handle);
                    continue;
                }
                let _ = free.push(handle);
                end_of_stream.store(true, Ordering::Release);
            }
            Ok(frames) => {
                chunk.truncate(frames * bytes_per_frame);
                marshaller.defer("generator.stream_fill", move |state| {
                    state.fill_streaming_buffer(id, handle, &chunk, format);
                });
            }
            Err(err) => {
                tracing::warn!(generator = ?id, error = %err, "streaming decode failed; marking end of stream");
                let _ = free.push(handle);
                end_of_stream.store(true, Ordering::Release);
            }
        }
    }
}
