use std::time::Duration;

use crate::{Decoder, DecoderError, DecoderInfo, Encoding};

/// A deterministic decoder for tests: produces `total_frames` worth of
/// silence (or `None` for an effectively-infinite source), optionally
/// sleeping before each call to simulate a decoder whose latency exceeds a
/// single engine tick.
pub struct MockDecoder {
    info: DecoderInfo,
    total_frames: Option<u64>,
    cursor: u64,
    artificial_latency: Option<Duration>,
}

impl MockDecoder {
    pub fn new(sample_rate: u32, channels: u16, total_frames: Option<u64>, can_seek: bool) -> Self {
        let total_duration_secs = total_frames.map(|f| f as f32 / sample_rate as f32);
        Self {
            info: DecoderInfo {
                channels,
                sample_rate,
                bits_per_sample: 32,
                encoding: Encoding::Float,
                can_seek,
                total_duration_secs,
            },
            total_frames,
            cursor: 0,
            artificial_latency: None,
        }
    }

    /// Make every `decode` call block for `latency` before producing data,
    /// simulating a slow decoder for underrun-recovery tests.
    pub fn with_artificial_latency(mut self, latency: Duration) -> Self {
        self.artificial_latency = Some(latency);
        self
    }
}

impl Decoder for MockDecoder {
    fn info(&self) -> DecoderInfo {
        self.info
    }

    fn decode(&mut self, max_frames: usize, out: &mut [u8]) -> Result<usize, DecoderError> {
        if let Some(latency) = self.artificial_latency {
            std::thread::sleep(latency);
        }
        let remaining = match self.total_frames {
            Some(total) => total.saturating_sub(self.cursor),
            None => u64::MAX,
        };
        let frame_bytes = self.info.bytes_per_frame();
        let capacity_frames = (out.len() / frame_bytes).min(max_frames);
        let n = remaining.min(capacity_frames as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        for byte in out.iter_mut().take(n * frame_bytes) {
            *byte = 0;
        }
        self.cursor += n as u64;
        Ok(n)
    }

    fn seek(&mut self, timestamp_secs: f32) -> Result<(), DecoderError> {
        if !self.info.can_seek {
            return Err(DecoderError::SeekUnsupported);
        }
        self.cursor = (timestamp_secs.max(0.0) * self.info.sample_rate as f32) as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_zero_frames_at_end_of_stream() {
        let mut dec = MockDecoder::new(10, 1, Some(5), true);
        let mut buf = vec![0u8; 100 * dec.info().bytes_per_frame()];
        let n1 = dec.decode(100, &mut buf).unwrap();
        assert_eq!(n1, 5);
        let n2 = dec.decode(100, &mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn seek_resets_cursor() {
        let mut dec = MockDecoder::new(10, 1, Some(5), true);
        let mut buf = vec![0u8; 100 * dec.info().bytes_per_frame()];
        let _ = dec.decode(100, &mut buf).unwrap();
        assert_eq!(dec.decode(100, &mut buf).unwrap(), 0);
        dec.seek(0.0).unwrap();
        assert_eq!(dec.decode(100, &mut buf).unwrap(), 5);
    }

    #[test]
    fn seek_fails_when_unsupported() {
        let mut dec = MockDecoder::new(10, 1, Some(5), false);
        assert!(matches!(dec.seek(0.0), Err(DecoderError::SeekUnsupported)));
    }
}
