//! Remembers which upstream repository served a given digest.
use std::num::NonZeroUsize;

use lru::LruCache;
use oci_distribution::Reference;
use parking_lot::Mutex;
use tracing::trace;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Where a piece of content can be fetched from upstream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RepositoryLocation {
    /// Registry host, with port if any
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Whether transport security may be skipped for this registry
    pub insecure: bool,
}

impl RepositoryLocation {
    /// The location an origin reference points at.
    pub fn from_reference(reference: &Reference, insecure: bool) -> Self {
        RepositoryLocation {
            registry: reference.registry().to_owned(),
            repository: reference.repository().to_owned(),
            insecure,
        }
    }

    /// A reference to `digest` within this location.
    pub fn reference(&self, digest: &Digest) -> Reference {
        Reference::with_digest(&self.registry, &self.repository, digest.as_str())
    }
}

impl std::fmt::Display for RepositoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// A bounded, least recently used map from digest to [`RepositoryLocation`].
///
/// Both lookups and insertions refresh an entry. Entries never expire on
/// their own. The cache synchronizes internally and never waits on I/O, so
/// one instance is shared by every repository the gateway serves.
pub struct DigestRepositoryCache {
    entries: Mutex<LruCache<Digest, RepositoryLocation>>,
}

impl DigestRepositoryCache {
    /// Create a cache holding at most `capacity` digests.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or(Error::InvalidCapacity(capacity))?;
        Ok(DigestRepositoryCache {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Look up the location remembered for `digest`.
    pub fn get(&self, digest: &Digest) -> Option<RepositoryLocation> {
        let location = self.entries.lock().get(digest).cloned();
        trace!(%digest, hit = location.is_some(), "Digest cache lookup");
        location
    }

    /// Remember `location` for `digest`, evicting the least recently used
    /// entry if the cache is full. The last writer wins.
    pub fn put(&self, digest: Digest, location: RepositoryLocation) {
        trace!(%digest, %location, "Remembering digest location");
        self.entries.lock().put(digest, location);
    }

    /// The number of digests currently remembered.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The maximum number of digests remembered.
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn digest(n: usize) -> Digest {
        Digest::new_unchecked(format!("sha256:{:064x}", n))
    }

    fn location(repository: &str) -> RepositoryLocation {
        RepositoryLocation {
            registry: "quay.io".to_owned(),
            repository: repository.to_owned(),
            insecure: false,
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            DigestRepositoryCache::new(0),
            Err(Error::InvalidCapacity(0))
        ));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = DigestRepositoryCache::new(3).unwrap();
        for n in 0..3 {
            cache.put(digest(n), location("user/app"));
        }
        // Touch the oldest entry so the second one becomes the eviction victim.
        assert!(cache.get(&digest(0)).is_some());
        cache.put(digest(3), location("user/app"));

        assert_eq!(3, cache.len());
        assert!(cache.get(&digest(1)).is_none());
        for n in &[0, 2, 3] {
            assert!(cache.get(&digest(*n)).is_some(), "digest {} evicted", n);
        }
    }

    #[test]
    fn capacity_plus_one_drops_only_the_first() {
        let cache = DigestRepositoryCache::new(10).unwrap();
        for n in 0..11 {
            cache.put(digest(n), location("user/app"));
        }
        assert!(cache.get(&digest(0)).is_none());
        for n in 1..11 {
            assert!(cache.get(&digest(n)).is_some());
        }
    }

    #[test]
    fn updates_refresh_recency_and_last_writer_wins() {
        let cache = DigestRepositoryCache::new(2).unwrap();
        cache.put(digest(0), location("user/one"));
        cache.put(digest(1), location("user/app"));
        cache.put(digest(0), location("user/two"));
        cache.put(digest(2), location("user/app"));

        assert_eq!(Some(location("user/two")), cache.get(&digest(0)));
        assert!(cache.get(&digest(1)).is_none());
    }

    #[test]
    fn location_round_trips_through_a_reference() {
        let origin = Reference::try_from("127.0.0.1:5000/user/app@sha256:abcd").unwrap();
        let loc = RepositoryLocation::from_reference(&origin, true);
        assert_eq!("127.0.0.1:5000/user/app", loc.to_string());
        assert_eq!(origin, loc.reference(&Digest::new_unchecked("sha256:abcd")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_writers_and_readers() {
        let cache = Arc::new(DigestRepositoryCache::new(64).unwrap());
        let tasks = (0..8).map(|t| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for n in 0..32 {
                    cache.put(digest(n), location(&format!("user/app{}", t)));
                    cache.get(&digest(n));
                }
            })
        });
        for task in tasks.collect::<Vec<_>>() {
            task.await.unwrap();
        }
        assert_eq!(32, cache.len());
        assert_eq!(64, cache.capacity());
    }
}
