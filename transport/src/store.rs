use std::time::Duration;

use crate::error::TransportError;

/// Key/value store interface consumed by the rendezvous.
///
/// The transport only needs three verbs; anything that can publish bytes
/// under a key and block until a set of keys exists can back a connect.
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), TransportError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, TransportError>;

    /// Blocks until every key in `keys` exists. `None` asks the store to
    /// apply its own default timeout.
    fn wait(&self, keys: &[String], timeout: Option<Duration>) -> Result<(), TransportError>;
}
