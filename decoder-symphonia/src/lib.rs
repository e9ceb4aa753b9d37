//! A real [`audio_decoder::Decoder`] backed by `symphonia` (+ `rubato` for
//! resampling to the engine's target rate).
//!
//! Decoders are an external collaborator, not part of the voice/bus/mix
//! graph core, but a trait with no real implementation isn't a complete
//! workspace, so this is the one real decoder the tests can drive.

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use audio_decoder::{Decoder, DecoderError, DecoderInfo, Encoding};
use rubato::Resampler;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    native_channels: usize,
    native_sample_rate: u32,
    info: DecoderInfo,
    /// Interleaved f32 samples at `info.sample_rate`, ready to serve.
    pending: VecDeque<f32>,
    resampler: Option<rubato::SincFixedIn<f32>>,
    resampler_ratio: Option<f64>,
    eof: bool,
}

impl SymphoniaDecoder {
    /// Open `path`, optionally resampling to `target_sample_rate` (the
    /// engine's mix rate) if the file's native rate differs.
    pub fn open(path: &Path, target_sample_rate: Option<u32>) -> Result<Self, DecoderError> {
        let file = File::open(path).map_err(|e| DecoderError::Failed(format!("open: {e}")))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| DecoderError::Failed(format!("probe: {e}")))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecoderError::Failed("no decodable track".into()))?
            .clone();

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecoderError::Failed(format!("make decoder: {e}")))?;

        let native_sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
        let native_channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(2);
        let target_sample_rate = target_sample_rate.unwrap_or(native_sample_rate);
        let can_seek = track.codec_params.n_frames.is_some();
        let total_duration_secs = track
            .codec_params
            .n_frames
            .map(|n| n as f32 / native_sample_rate as f32);

        Ok(Self {
            format,
            decoder,
            track_id: track.id,
            native_channels,
            native_sample_rate,
            info: DecoderInfo {
                channels: native_channels as u16,
                sample_rate: target_sample_rate,
                bits_per_sample: 32,
                encoding: Encoding::Float,
                can_seek,
                total_duration_secs,
            },
            pending: VecDeque::new(),
            resampler: None,
            resampler_ratio: None,
            eof: false,
        })
    }

    /// Decode and resample one packet's worth of audio into `self.pending`.
    /// Returns `false` once the underlying format reader is exhausted.
    fn pull_packet(&mut self) -> bool {
        let packet = loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => break packet,
                Ok(_) => continue,
                Err(_) => return false,
            }
        };

        let audio_buf = match self.decoder.decode(&packet) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(error = %e, "symphonia decode error, treating as end of stream");
                return false;
            }
        };

        let spec = *audio_buf.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(audio_buf);
        let interleaved = sample_buf.samples();

        if spec.rate == self.info.sample_rate {
            self.pending.extend(interleaved.iter().copied());
            return true;
        }

        let ratio = self.info.sample_rate as f64 / spec.rate as f64;
        let channels = self.native_channels;
        let frames = interleaved.len() / channels.max(1);
        let planar = to_planar(interleaved, channels);
        self.ensure_resampler(ratio, channels, frames.max(1));

        if let Some(resampler) = self.resampler.as_mut() {
            let refs: Vec<&[f32]> = planar.iter().map(|c| c.as_slice()).collect();
            match resampler.process(&refs, None) {
                Ok(outputs) if !outputs.is_empty() => {
                    self.pending.extend(interleave(&outputs, channels));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "rubato resample error, dropping packet");
                }
            }
        }
        true
    }

    fn ensure_resampler(&mut self, ratio: f64, channels: usize, chunk_frames: usize) {
        let recreate = match self.resampler_ratio {
            Some(r) => (r - ratio).abs() > 1e-8,
            None => true,
        };
        if !recreate {
            return;
        }
        use rubato::{SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 32,
            window: WindowFunction::BlackmanHarris2,
        };
        self.resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_frames.max(1024), channels).ok();
        self.resampler_ratio = Some(ratio);
    }
}

fn to_planar(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels.max(1);
    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for f in 0..frames {
        for (ch, plane) in planar.iter_mut().enumerate() {
            plane.push(samples[f * channels + ch]);
        }
    }
    planar
}

fn interleave(outputs: &[Vec<f32>], channels: usize) -> Vec<f32> {
    if outputs.is_empty() {
        return Vec::new();
    }
    let out_frames = outputs[0].len();
    let mut interleaved = vec![0.0f32; out_frames * channels];
    for f in 0..out_frames {
        for ch in 0..channels {
            interleaved[f * channels + ch] = outputs[ch][f];
        }
    }
    interleaved
}

impl Decoder for SymphoniaDecoder {
    fn info(&self) -> DecoderInfo {
        self.info
    }

    fn decode(&mut self, max_frames: usize, out: &mut [u8]) -> Result<usize, DecoderError> {
        let channels = self.info.channels as usize;
        while self.pending.len() < max_frames * channels && !self.eof {
            if !self.pull_packet() {
                self.eof = true;
            }
        }

        let available_frames = self.pending.len() / channels;
        let n = available_frames.min(max_frames);
        if n == 0 {
            return Ok(0);
        }

        let sample_count = n * channels;
        for (i, sample) in self.pending.drain(..sample_count).enumerate() {
            let bytes = sample.to_le_bytes();
            out[i * 4..i * 4 + 4].copy_from_slice(&bytes);
        }
        Ok(n)
    }

    fn seek(&mut self, timestamp_secs: f32) -> Result<(), DecoderError> {
        if !self.info.can_seek {
            return Err(DecoderError::SeekUnsupported);
        }
        self.pending.clear();
        self.eof = false;
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(timestamp_secs.max(0.0) as f64),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| DecoderError::Failed(format!("seek: {e}")))?;
        self.decoder.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_missing_file() {
        let result = SymphoniaDecoder::open(Path::new("/nonexistent/does-not-exist.wav"), None);
        assert!(result.is_err());
    }

    #[test]
    fn open_decodes_a_minimal_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_minimal_wav(&path, 10, 1);

        let mut decoder = SymphoniaDecoder::open(&path, None).unwrap();
        let info = decoder.info();
        assert_eq!(info.sample_rate, 10);
        assert_eq!(info.channels, 1);

        let mut out = vec![0u8; 1024 * info.bytes_per_frame()];
        let n = decoder.decode(1024, &mut out).unwrap();
        assert!(n > 0);
    }

    fn write_minimal_wav(path: &Path, sample_rate: u32, channels: u16) {
        use std::io::Write;
        let frames: u32 = 10;
        let bits_per_sample: u16 = 16;
        let block_align = channels * bits_per_sample / 8;
        let byte_rate = sample_rate * block_align as u32;
        let data_len = frames * block_align as u32;

        let mut f = File::create(path).unwrap();
        f.write_all(b"RIFF").unwrap();
        f.write_all(&(36 + data_len).to_le_bytes()).unwrap();
        f.write_all(b"WAVE").unwrap();
        f.write_all(b"fmt ").unwrap();
        f.write_all(&16u32.to_le_bytes()).unwrap();
        f.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
        f.write_all(&channels.to_le_bytes()).unwrap();
        f.write_all(&sample_rate.to_le_bytes()).unwrap();
        f.write_all(&byte_rate.to_le_bytes()).unwrap();
        f.write_all(&block_align.to_le_bytes()).unwrap();
        f.write_all(&bits_per_sample.to_le_bytes()).unwrap();
        f.write_all(b"data").unwrap();
        f.write_all(&data_len.to_le_bytes()).unwrap();
        f.write_all(&vec![0u8; data_len as usize]).unwrap();
    }
}
