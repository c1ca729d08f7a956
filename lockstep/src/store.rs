//! The rendezvous store the caller hands a group, and the adapter that
//! presents it to the transport.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use lockstep_transport::TransportError;

use crate::error::{Error, Result};

/// Key/value store used for group rendezvous.
///
/// Anything shared by every peer works: the bundled [`HashStore`] for
/// in-process groups, or a caller-provided implementation backed by a file
/// system or a network service.
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: &[u8]);

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Blocks until every key exists, bounded by the store's own default
    /// timeout.
    fn wait(&self, keys: &[String]) -> Result<()>;

    /// Blocks until every key exists, bounded by `timeout`.
    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()>;
}

const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// An in-process map-and-condvar store.
pub struct HashStore {
    state: Mutex<HashMap<String, Vec<u8>>>,
    cv: Condvar,
    default_timeout: Duration,
}

impl HashStore {
    pub fn new() -> HashStore {
        HashStore::with_default_timeout(DEFAULT_WAIT)
    }

    /// The timeout applied to [`Store::wait`] calls without an explicit one.
    pub fn with_default_timeout(default_timeout: Duration) -> HashStore {
        HashStore {
            state: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            default_timeout,
        }
    }
}

impl Default for HashStore {
    fn default() -> HashStore {
        HashStore::new()
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        self.cv.notify_all();
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Transport(TransportError::Store(format!("no such key: {}", key))))
    }

    fn wait(&self, keys: &[String]) -> Result<()> {
        self.wait_timeout(keys, self.default_timeout)
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if keys.iter().all(|key| state.contains_key(key)) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Transport(TransportError::Timeout(timeout)));
            }
            let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

/// Presents an engine-facing [`Store`] to the transport rendezvous.
///
/// The conversion is interface-deep only: keys and bytes pass through, error
/// types are mapped, and a wait without an explicit timeout falls back to
/// the store's own default.
pub(crate) struct StoreAdapter {
    store: Arc<dyn Store>,
}

impl StoreAdapter {
    pub(crate) fn new(store: Arc<dyn Store>) -> StoreAdapter {
        StoreAdapter { store }
    }
}

fn to_transport(error: Error) -> TransportError {
    match error {
        Error::Transport(inner) => inner,
        other => TransportError::Store(other.to_string()),
    }
}

impl lockstep_transport::Store for StoreAdapter {
    fn set(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), TransportError> {
        self.store.set(key, &value);
        Ok(())
    }

    fn get(&self, key: &str) -> std::result::Result<Vec<u8>, TransportError> {
        self.store.get(key).map_err(to_transport)
    }

    fn wait(
        &self,
        keys: &[String],
        timeout: Option<Duration>,
    ) -> std::result::Result<(), TransportError> {
        match timeout {
            Some(timeout) => self.store.wait_timeout(keys, timeout),
            None => self.store.wait(keys),
        }
        .map_err(to_transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_then_get_round_trips() {
        let store = HashStore::new();
        store.set("a", b"hello");
        assert_eq!(store.get("a").unwrap(), b"hello");
        assert!(store.get("b").is_err());
    }

    #[test]
    fn wait_sees_keys_published_later() {
        let store = Arc::new(HashStore::new());
        let publisher = Arc::clone(&store);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.set("late", b"x");
        });
        store
            .wait_timeout(&["late".to_string()], Duration::from_secs(1))
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let store = HashStore::with_default_timeout(Duration::from_millis(20));
        let err = store.wait(&["missing".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Timeout(_))
        ));
    }

    #[test]
    fn adapter_preserves_timeout_kind() {
        let store: Arc<dyn Store> = Arc::new(HashStore::new());
        let adapter = StoreAdapter::new(store);
        let err = lockstep_transport::Store::wait(
            &adapter,
            &["missing".to_string()],
            Some(Duration::from_millis(20)),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn adapter_falls_back_to_the_store_default() {
        let store: Arc<dyn Store> =
            Arc::new(HashStore::with_default_timeout(Duration::from_millis(20)));
        let adapter = StoreAdapter::new(store);
        let err = lockstep_transport::Store::wait(&adapter, &["missing".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
