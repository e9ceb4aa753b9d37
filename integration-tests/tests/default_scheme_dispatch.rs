//! Default-scheme dispatch: a bare path (no `scheme:` prefix)
//! resolves through the engine's configured default scheme, exercised here
//! through the full `EngineHandle` → marshaller → `Resolver` → `Provider`
//! path rather than `Engine::resolve`'s same-thread shortcut.

mod support;

use audio_backend::mock::MockBackend;
use audio_engine::{Engine, EngineConfig};

#[test]
fn bare_path_is_dispatched_to_the_default_scheme_provider() {
    let mut engine = Engine::new(EngineConfig { default_scheme: "file".into(), ..EngineConfig::default() }, Box::new(MockBackend::new(4)));
    let handle = engine.handle();
    handle.resolver().register("file", Box::new(support::SilentStaticProvider { duration_secs: 1.0 }));

    let reply = handle.resolve("music/theme.ogg");
    assert!(reply.try_wait().is_none(), "nothing processes the request until a tick drains it");
    engine.tick(0.0);
    assert!(reply.wait().unwrap().is_some());
}

#[test]
fn explicit_unregistered_scheme_resolves_to_none() {
    let mut engine = Engine::new(EngineConfig::default(), Box::new(MockBackend::new(4)));
    engine.resolver().register("file", Box::new(support::SilentStaticProvider { duration_secs: 1.0 }));

    assert!(engine.resolve("http://example.com/theme.ogg").is_none());
}
