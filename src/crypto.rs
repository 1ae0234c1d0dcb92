// ABOUTME: Per-address payload keys: messages to or from a registered number are encrypted
// ABOUTME: The cipher is supplied by the caller through the PayloadKey trait; no key means clear text

use crate::error::SmsResult;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Symmetric cipher bound to one peer address
pub trait PayloadKey: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> SmsResult<Bytes>;

    fn decrypt(&self, ciphertext: &[u8]) -> SmsResult<Bytes>;
}

/// Keys indexed by phone number
///
/// Numbers are normalized by dropping a leading `+` and any spaces, so
/// `"+30 697 000"` and `"30697000"` share a key.
#[derive(Default)]
pub struct KeyManager {
    keys: RwLock<HashMap<String, Arc<dyn PayloadKey>>>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("keys", &self.len())
            .finish()
    }
}

fn normalize(address: &str) -> String {
    address
        .trim_start_matches('+')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_key(&self, address: &str, key: impl PayloadKey + 'static) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize(address), Arc::new(key));
    }

    /// Remove a key; returns whether one was registered
    pub fn unregister_key(&self, address: &str) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&normalize(address))
            .is_some()
    }

    pub fn get_key(&self, address: &str) -> Option<Arc<dyn PayloadKey>> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize(address))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encrypt for `address`; `None` when no key is registered
    pub fn encrypt(&self, address: &str, plaintext: &[u8]) -> SmsResult<Option<Bytes>> {
        self.get_key(address)
            .map(|key| key.encrypt(plaintext))
            .transpose()
    }

    /// Decrypt from `address`; `None` when no key is registered
    pub fn decrypt(&self, address: &str, ciphertext: &[u8]) -> SmsResult<Option<Bytes>> {
        self.get_key(address)
            .map(|key| key.decrypt(ciphertext))
            .transpose()
    }
}
