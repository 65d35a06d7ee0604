use crate::reference::Reference;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifetime assumed for bearer tokens whose response carries no `expires_in`.
///
/// The distribution token spec says clients should assume 60 seconds.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// A token granted during the OAuth2-like workflow for OCI registries.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum RegistryToken {
    Token {
        token: String,
        expires_in: Option<u64>,
    },
    AccessToken {
        access_token: String,
        expires_in: Option<u64>,
    },
}

#[derive(Clone)]
pub(crate) enum RegistryTokenType {
    Bearer(RegistryToken),
    Basic(String, String),
}

impl RegistryToken {
    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token())
    }

    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token, .. } => token,
            RegistryToken::AccessToken { access_token, .. } => access_token,
        }
    }

    fn lifetime(&self) -> Duration {
        let expires_in = match self {
            RegistryToken::Token { expires_in, .. } => expires_in,
            RegistryToken::AccessToken { expires_in, .. } => expires_in,
        };
        expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME)
    }
}

/// Pull credentials per upstream repository.
///
/// The gateway only ever reads from upstreams, so unlike a general purpose
/// client there is a single scope per repository.
#[derive(Default)]
pub(crate) struct TokenCache {
    // (registry, repository) -> (token, expiration)
    tokens: BTreeMap<(String, String), (RegistryTokenType, Option<Instant>)>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        TokenCache {
            tokens: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, reference: &Reference, token: RegistryTokenType) {
        let expiration = match token {
            RegistryTokenType::Basic(_, _) => None,
            RegistryTokenType::Bearer(ref t) => Some(Instant::now() + t.lifetime()),
        };
        let registry = reference.resolve_registry().to_string();
        let repository = reference.repository().to_string();
        debug!(%registry, %repository, ?expiration, "Inserting token");
        self.tokens
            .insert((registry, repository), (token, expiration));
    }

    pub(crate) fn get(&self, reference: &Reference) -> Option<&RegistryTokenType> {
        let key = (
            reference.resolve_registry().to_string(),
            reference.repository().to_string(),
        );
        match self.tokens.get(&key) {
            Some((_, Some(expiration))) if Instant::now() >= *expiration => {
                debug!(registry = %key.0, repository = %key.1, miss = false, expired = true, "Fetching token");
                None
            }
            Some((token, _)) => {
                debug!(registry = %key.0, repository = %key.1, miss = false, expired = false, "Fetching token");
                Some(token)
            }
            None => {
                debug!(registry = %key.0, repository = %key.1, miss = true, "Fetching token");
                None
            }
        }
    }

    pub(crate) fn contains_key(&self, reference: &Reference) -> bool {
        self.get(reference).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn tokens_are_scoped_per_repository() {
        let mut cache = TokenCache::new();
        let app = Reference::try_from("quay.io/user/app").unwrap();
        let other = Reference::try_from("quay.io/user/other").unwrap();
        cache.insert(
            &app,
            RegistryTokenType::Bearer(RegistryToken::Token {
                token: "abc".to_owned(),
                expires_in: Some(300),
            }),
        );
        assert!(cache.contains_key(&app));
        assert!(!cache.contains_key(&other));
    }

    #[test]
    fn expired_tokens_are_ignored() {
        let mut cache = TokenCache::new();
        let app = Reference::try_from("quay.io/user/app").unwrap();
        cache.insert(
            &app,
            RegistryTokenType::Bearer(RegistryToken::AccessToken {
                access_token: "abc".to_owned(),
                expires_in: Some(0),
            }),
        );
        assert!(!cache.contains_key(&app));
    }

    #[test]
    fn basic_credentials_never_expire() {
        let mut cache = TokenCache::new();
        let app = Reference::try_from("docker.io/library/busybox").unwrap();
        cache.insert(
            &app,
            RegistryTokenType::Basic("user".to_owned(), "secret".to_owned()),
        );
        let hub = Reference::try_from("index.docker.io/library/busybox").unwrap();
        assert!(cache.contains_key(&hub));
    }
}
