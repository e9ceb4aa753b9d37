//! Streaming underrun recovery: a streaming voice whose
//! decoder is slower than real time must keep retrying rather than stall
//! forever or tear itself down — it should still make it to
//! `PlayingPhysical` once enough chunks have landed.

use std::path::Path;
use std::time::Duration;

use audio_backend::mock::MockBackend;
use audio_decoder::mock::MockDecoder;
use audio_decoder::{Decoder, DecoderError};
use audio_engine::file_provider::FileProvider;
use audio_engine::{Engine, EngineConfig, VoiceState};

fn write_fixture(dir: &Path, name: &str) {
    let path = dir.join(name);
    std::fs::write(&path, b"not real audio, the mock decoder ignores the bytes").unwrap();
}

#[test]
fn slow_decoder_never_tears_the_voice_down_and_eventually_plays() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), "theme.ogg");

    let provider = FileProvider::new(
        vec![dir.path().to_path_buf()],
        |_path, _target_rate| -> Result<Box<dyn Decoder>, DecoderError> {
            Ok(Box::new(MockDecoder::new(10, 1, Some(64), true).with_artificial_latency(Duration::from_millis(5))))
        },
        3,
        4,
    );

    let mut engine = Engine::new(EngineConfig { streaming_buffer_count: 3, streaming_chunk_frames: 4, ..EngineConfig::default() }, Box::new(MockBackend::new(1)));
    engine.resolver().register("stream", Box::new(provider));

    let gen = engine.resolve("stream:theme.ogg").expect("streaming provider must resolve the fixture file");

    let voice = engine.create_voice(gen, None).unwrap();
    voice.play();

    let mut saw_physical = false;
    for _ in 0..100 {
        engine.tick(0.02);
        let state = voice.snapshot().state;
        assert!(state != VoiceState::Disposed, "a slow decoder must never tear the voice down on its own");
        if state == VoiceState::PlayingPhysical {
            saw_physical = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(saw_physical, "at least one decoded chunk should have made it onto the source within 2 seconds of ticking");
}
