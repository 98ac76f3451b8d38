//! Resolution of model identifiers to public keys.
//!
//! The registry itself is an external collaborator reached through the
//! [`KeyRegistry`] trait. [`KeyRegistryClient`] wraps it with the lookup
//! policy used during verification:
//!
//! - the all-zero sentinel and unknown identifiers both mean "not registered"
//! - transient call failures are retried with jittered exponential backoff
//! - resolved keys are cached for the lifetime of the client, write-once per
//!   identifier

pub mod memory;
pub mod rpc;

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::RegistryCallError;
use crate::signature::PUBLIC_KEY_LEN;

pub use memory::InMemoryRegistry;
pub use rpc::{RegistryDeployment, RpcRegistry};

/// Raw 32-byte value held by the registry for an identifier.
pub type RegistryKey = [u8; PUBLIC_KEY_LEN];

/// Reserved value meaning "no key registered".
pub const SENTINEL_KEY: RegistryKey = [0u8; PUBLIC_KEY_LEN];

/// Append-only mapping from model identifier to public key.
pub trait KeyRegistry: Send + Sync {
    /// Read-only lookup. Unknown identifiers may be reported either as
    /// [`RegistryCallError::NotFound`] or as [`SENTINEL_KEY`].
    fn resolve_key(&self, identifier: &str) -> Result<RegistryKey, RegistryCallError>;

    fn publish_key(
        &self,
        identifier: &str,
        public_key: &RegistryKey,
    ) -> Result<(), RegistryCallError>;
}

/// Classified result of a key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    Key(RegistryKey),
    NotRegistered,
    /// The registry could not be asked. Says nothing about the identifier.
    Unavailable(String),
}

pub struct KeyRegistryClient {
    registry: Arc<dyn KeyRegistry>,
    retry: RetryPolicy,
    cache: RwLock<HashMap<String, RegistryKey>>,
}

impl KeyRegistryClient {
    pub fn new(registry: Arc<dyn KeyRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            retry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, identifier: &str) -> KeyResolution {
        if let Some(key) = self.cache.read().get(identifier) {
            debug!(identifier, "registry cache hit");
            return KeyResolution::Key(*key);
        }

        match self.call_with_retry(identifier) {
            Ok(key) if key == SENTINEL_KEY => {
                debug!(identifier, "registry returned sentinel key");
                KeyResolution::NotRegistered
            }
            Ok(key) => {
                // First observed key wins; the registry is append-only.
                let mut cache = self.cache.write();
                let cached = *cache.entry(identifier.to_string()).or_insert(key);
                KeyResolution::Key(cached)
            }
            Err(RegistryCallError::NotFound) => {
                debug!(identifier, "identifier unknown to registry");
                KeyResolution::NotRegistered
            }
            Err(e) => KeyResolution::Unavailable(e.to_string()),
        }
    }

    /// Publish a key through the underlying registry. Not retried.
    pub fn publish(
        &self,
        identifier: &str,
        public_key: &RegistryKey,
    ) -> Result<(), RegistryCallError> {
        self.registry.publish_key(identifier, public_key)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    fn call_with_retry(&self, identifier: &str) -> Result<RegistryKey, RegistryCallError> {
        let mut retries = 0;
        let max_retries = self.retry.max_retries;

        loop {
            match self.registry.resolve_key(identifier) {
                Ok(key) => return Ok(key),
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;

                    let ceiling = self.retry.backoff_ceiling(retries);
                    let jittered_ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
                    let backoff = Duration::from_millis(jittered_ms);

                    warn!(
                        error = %e,
                        identifier,
                        retry = retries,
                        max_retries,
                        backoff_ms = backoff.as_millis(),
                        "retrying registry lookup"
                    );

                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for KeyRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistryClient")
            .field("retry", &self.retry)
            .field("cached", &self.cached_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry whose lookups fail a fixed number of times first.
    struct FlakyRegistry {
        failures: usize,
        error: RegistryCallError,
        key: RegistryKey,
        calls: AtomicUsize,
    }

    impl FlakyRegistry {
        fn new(failures: usize, error: RegistryCallError) -> Self {
            Self {
                failures,
                error,
                key: [9u8; 32],
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl KeyRegistry for FlakyRegistry {
        fn resolve_key(&self, _identifier: &str) -> Result<RegistryKey, RegistryCallError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(self.key)
            }
        }

        fn publish_key(&self, _: &str, _: &RegistryKey) -> Result<(), RegistryCallError> {
            Ok(())
        }
    }

    fn no_wait(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::none()
        }
    }

    #[test]
    fn test_sentinel_is_not_registered() {
        let registry = InMemoryRegistry::new().with_entry("cam1", SENTINEL_KEY);
        let client = KeyRegistryClient::new(Arc::new(registry), no_wait(0));
        assert_eq!(client.resolve("cam1"), KeyResolution::NotRegistered);
        assert_eq!(client.cached_len(), 0);
    }

    #[test]
    fn test_unknown_identifier_is_not_registered() {
        let client = KeyRegistryClient::new(Arc::new(InMemoryRegistry::new()), no_wait(0));
        assert_eq!(client.resolve("missing"), KeyResolution::NotRegistered);
    }

    #[test]
    fn test_retries_transient_failures() {
        let registry = Arc::new(FlakyRegistry::new(2, RegistryCallError::Timeout));
        let client = KeyRegistryClient::new(registry.clone(), no_wait(3));
        assert_eq!(client.resolve("cam1"), KeyResolution::Key([9u8; 32]));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timeout_exhausts_retries() {
        let registry = Arc::new(FlakyRegistry::new(usize::MAX, RegistryCallError::Timeout));
        let client = KeyRegistryClient::new(registry.clone(), no_wait(2));
        assert!(matches!(
            client.resolve("cam1"),
            KeyResolution::Unavailable(_)
        ));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_revert_is_not_retried() {
        let registry = Arc::new(FlakyRegistry::new(
            usize::MAX,
            RegistryCallError::Reverted("bad call".to_string()),
        ));
        let client = KeyRegistryClient::new(registry.clone(), no_wait(5));
        assert!(matches!(
            client.resolve("cam1"),
            KeyResolution::Unavailable(_)
        ));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolved_key_is_cached() {
        let registry = Arc::new(FlakyRegistry::new(0, RegistryCallError::Timeout));
        let client = KeyRegistryClient::new(registry.clone(), no_wait(0));
        assert_eq!(client.resolve("cam1"), KeyResolution::Key([9u8; 32]));
        assert_eq!(client.resolve("cam1"), KeyResolution::Key([9u8; 32]));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.cached_len(), 1);
    }

    #[test]
    fn test_concurrent_resolution_keeps_cache_consistent() {
        let registry = Arc::new(FlakyRegistry::new(0, RegistryCallError::Timeout));
        let client = Arc::new(KeyRegistryClient::new(registry.clone(), no_wait(0)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || client.resolve("cam1"))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), KeyResolution::Key([9u8; 32]));
        }

        assert_eq!(client.cached_len(), 1);
        let calls = registry.calls.load(Ordering::SeqCst);
        assert!((1..=8).contains(&calls));
    }

    #[test]
    fn test_publish_then_resolve() {
        let client = KeyRegistryClient::new(Arc::new(InMemoryRegistry::new()), no_wait(0));
        client.publish("cam2", &[3u8; 32]).unwrap();
        assert_eq!(client.resolve("cam2"), KeyResolution::Key([3u8; 32]));
    }
}
