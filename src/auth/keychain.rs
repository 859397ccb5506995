//! Platform keychain storage
//!
//! Backs [`SecureStore`] with the OS credential store through `keyring`:
//! Keychain Access on macOS, Credential Manager on Windows and the kernel
//! keyring on Linux. Each store key becomes one keychain entry under a
//! shared service name.

use keyring::Entry;
use tracing::debug;

use super::store::SecureStore;
use crate::error::Error;
use crate::Result;

/// Service name entries are filed under
pub const DEFAULT_SERVICE: &str = "realm-sso";

/// Keychain-backed store, one entry per key
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key)
            .map_err(|e| Error::Storage(format!("Failed to open keychain entry {}: {}", key, e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl SecureStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        debug!(service = %self.service, key = %key, "Reading keychain entry");
        read_entry(&self.entry(key)?, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        debug!(service = %self.service, key = %key, "Writing keychain entry");
        write_entry(&self.entry(key)?, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        debug!(service = %self.service, key = %key, "Deleting keychain entry");
        delete_entry(&self.entry(key)?, key)
    }
}

fn read_entry(entry: &Entry, key: &str) -> Result<Option<String>> {
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(Error::Storage(format!("Failed to read keychain entry {}: {}", key, e))),
    }
}

fn write_entry(entry: &Entry, key: &str, value: &str) -> Result<()> {
    entry
        .set_password(value)
        .map_err(|e| Error::Storage(format!("Failed to write keychain entry {}: {}", key, e)))
}

// Missing entries count as already deleted
fn delete_entry(entry: &Entry, key: &str) -> Result<()> {
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(Error::Storage(format!("Failed to delete keychain entry {}: {}", key, e))),
    }
}
