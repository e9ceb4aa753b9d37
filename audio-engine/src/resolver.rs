//! URI-based resource resolution.

use std::collections::HashMap;

use audio_backend::AudioBackend;
use parking_lot::Mutex;

use crate::generator::GeneratorTable;
use crate::ids::GeneratorId;
use crate::marshaller::MarshallerHandle;

/// A resolved URI: scheme plus everything after the first `:` (leading
/// slashes included, exactly as typed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUri {
    pub scheme: String,
    pub path: String,
}

/// Everything a provider needs to construct a generator: somewhere to
/// register it, the backend to upload buffers to, and a marshaller handle
/// for any background worker it spawns (streaming).
pub struct ProviderCtx<'a> {
    pub generators: &'a mut GeneratorTable,
    pub backend: &'a mut dyn AudioBackend,
    pub marshaller: MarshallerHandle,
}

/// Answers a resolution request with either a ready generator or nothing
/// (a failed lookup yields a null result rather than an error).
pub trait Provider: Send {
    fn resolve(&mut self, uri: &ResolvedUri, ctx: &mut ProviderCtx) -> Option<GeneratorId>;
}

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'
}

/// Detect a leading `[A-Za-z0-9+\-.]+:` scheme prefix. Returns `(scheme,
/// rest)` if found.
fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let colon = input.find(':')?;
    let (candidate, rest) = input.split_at(colon);
    if candidate.is_empty() || !candidate.chars().all(is_scheme_char) {
        return None;
    }
    Some((candidate, &rest[1..]))
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Parse `input` into a scheme + path, synthesizing a scheme from
/// `default_scheme` when `input` is a bare path.
pub fn parse_uri(input: &str, default_scheme: &str) -> ResolvedUri {
    match split_scheme(input) {
        Some((scheme, rest)) => ResolvedUri { scheme: scheme.to_ascii_lowercase(), path: rest.to_string() },
        None => ResolvedUri { scheme: default_scheme.to_ascii_lowercase(), path: format!("///{}", normalize_path(input)) },
    }
}

/// Scheme → provider registry. Case-insensitive; last registration for a
/// given scheme wins.
#[derive(Default)]
pub struct Resolver {
    providers: Mutex<HashMap<String, Box<dyn Provider>>>,
    default_scheme: Mutex<String>,
}

impl Resolver {
    pub fn new(default_scheme: impl Into<String>) -> Self {
        Self { providers: Mutex::new(HashMap::new()), default_scheme: Mutex::new(default_scheme.into()) }
    }

    pub fn register(&self, scheme: impl Into<String>, provider: Box<dyn Provider>) {
        self.providers.lock().insert(scheme.into().to_ascii_lowercase(), provider);
    }

    pub fn set_default_scheme(&self, scheme: impl Into<String>) {
        *self.default_scheme.lock() = scheme.into();
    }

    /// Resolve `input` to a `GeneratorId`, or `None` if there's no matching
    /// provider or the provider itself produced nothing.
    pub fn resolve(&self, input: &str, ctx: &mut ProviderCtx) -> Option<GeneratorId> {
        let default_scheme = self.default_scheme.lock().clone();
        let uri = parse_uri(input, &default_scheme);
        let mut providers = self.providers.lock();
        let provider = providers.get_mut(&uri.scheme)?;
        provider.resolve(&uri, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshaller::Marshaller;
    use audio_backend::mock::MockBackend;

    struct RecordingProvider {
        last_uri: Option<ResolvedUri>,
    }

    impl Provider for RecordingProvider {
        fn resolve(&mut self, uri: &ResolvedUri, _ctx: &mut ProviderCtx) -> Option<GeneratorId> {
            self.last_uri = Some(uri.clone());
            None
        }
    }

    fn test_ctx<'a>(generators: &'a mut GeneratorTable, backend: &'a mut MockBackend, marshaller: &Marshaller) -> ProviderCtx<'a> {
        ProviderCtx { generators, backend, marshaller: marshaller.handle() }
    }

    #[test]
    fn bare_path_gets_default_scheme_and_normalized_path() {
        let uri = parse_uri("sfx/boom.ogg", "file");
        assert_eq!(uri.scheme, "file");
        assert_eq!(format!("{}:{}", uri.scheme, uri.path), "file:///sfx/boom.ogg");
    }

    #[test]
    fn explicit_scheme_is_respected_case_insensitively() {
        let uri = parse_uri("STREAM:///music/theme.ogg", "file");
        assert_eq!(uri.scheme, "stream");
        assert_eq!(uri.path, "///music/theme.ogg");
    }

    #[test]
    fn backslashes_and_leading_slash_are_normalized_for_bare_paths() {
        let uri = parse_uri("\\sfx\\boom.ogg", "file");
        assert_eq!(format!("{}:{}", uri.scheme, uri.path), "file:///sfx/boom.ogg");
    }

    #[test]
    fn last_registration_for_a_scheme_wins() {
        let resolver = Resolver::new("file");
        resolver.register("file", Box::new(RecordingProvider { last_uri: None }));
        resolver.register("FILE", Box::new(RecordingProvider { last_uri: None }));
        let mut generators = GeneratorTable::default();
        let mut backend = MockBackend::new(1);
        let marshaller = Marshaller::new();
        let mut ctx = test_ctx(&mut generators, &mut backend, &marshaller);
        assert!(resolver.resolve("a.ogg", &mut ctx).is_none());
    }

    #[test]
    fn unregistered_scheme_resolves_to_none() {
        let resolver = Resolver::new("file");
        let mut generators = GeneratorTable::default();
        let mut backend = MockBackend::new(1);
        let marshaller = Marshaller::new();
        let mut ctx = test_ctx(&mut generators, &mut backend, &marshaller);
        assert!(resolver.resolve("nope://x", &mut ctx).is_none());
    }

    #[test]
    fn default_scheme_dispatch_scenario() {
        struct CapturingProvider(Option<ResolvedUri>);
        impl Provider for CapturingProvider {
            fn resolve(&mut self, uri: &ResolvedUri, _ctx: &mut ProviderCtx) -> Option<GeneratorId> {
                self.0 = Some(uri.clone());
                None
            }
        }
        let resolver = Resolver::new("file");
        resolver.register("file", Box::new(CapturingProvider(None)));
        let mut generators = GeneratorTable::default();
        let mut backend = MockBackend::new(1);
        let marshaller = Marshaller::new();
        let mut ctx = test_ctx(&mut generators, &mut backend, &marshaller);
        resolver.resolve("sfx/boom.ogg", &mut ctx);
        let uri = parse_uri("sfx/boom.ogg", "file");
        assert_eq!(format!("{}:{}", uri.scheme, uri.path), "file:///sfx/boom.ogg");
    }
}
