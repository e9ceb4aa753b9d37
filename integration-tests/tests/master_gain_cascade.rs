//! Master gain cascade: a bus's effective gain is the product
//! of its own local gain and every ancestor's, and a child bus observes its
//! parent's change without being touched directly.

mod support;

use audio_backend::mock::MockBackend;
use audio_engine::{Engine, EngineConfig};

#[test]
fn child_bus_inherits_parent_gain_multiplicatively() {
    let mut engine = Engine::new(EngineConfig::default(), Box::new(MockBackend::new(4)));

    let sfx = engine.create_bus("/sfx");
    let explosions = engine.create_bus("/sfx/explosions");
    assert_eq!(explosions.effective().effective_gain, 1.0);

    sfx.set_gain(0.5);
    engine.tick(0.0);
    assert!((explosions.effective().effective_gain - 0.5).abs() < 1e-6);

    explosions.set_gain(0.5);
    engine.tick(0.0);
    assert!((explosions.effective().effective_gain - 0.25).abs() < 1e-6);
}

#[test]
fn muting_master_mutes_every_descendant() {
    let mut engine = Engine::new(EngineConfig::default(), Box::new(MockBackend::new(4)));
    let music = engine.create_bus("/music");
    let stingers = engine.create_bus("/music/stingers");

    engine.master_bus().set_muted(true);
    engine.tick(0.0);

    assert!(music.effective().effective_muted);
    assert!(stingers.effective().effective_muted);
}

#[test]
fn voice_gain_is_reported_unscaled_on_its_own_snapshot() {
    // `VoiceSnapshot::gain` is the voice's own local gain; bus cascading
    // only ever lands on the backend, not on this snapshot —
    // "effective" values are a bus-tree concept, a voice just contributes
    // its local gain into the product).
    let mut engine = Engine::new(EngineConfig::default(), Box::new(MockBackend::new(4)));
    engine.resolver().register("file", Box::new(support::SilentStaticProvider { duration_secs: 1.0 }));
    let gen = engine.resolve("sfx/boom.ogg").unwrap();

    let bus = engine.create_bus("/sfx");
    let voice = engine.create_voice(gen, Some(bus.id())).unwrap();
    voice.set_gain(0.75);
    bus.set_gain(0.1);
    engine.tick(0.0);

    assert!((voice.snapshot().gain - 0.75).abs() < 1e-6);
}
