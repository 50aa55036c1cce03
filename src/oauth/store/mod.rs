//! Credential store: a small key-value contract with interchangeable backends.
//!
//! [`KvStore`] is what a backend implements (process memory or Valkey).
//! [`SecureStore`] sits on top and is what the authorization server talks to:
//! it serializes records as JSON, seals them with the [`TokenCipher`] when a key
//! is configured, and retries idempotent lookups on transient failures.
//!
//! Per-key atomicity (single-use codes, refresh rotation) comes from the
//! backend primitives [`KvStore::put_if_absent`] and [`KvStore::take`].

mod memory;
#[cfg(feature = "valkey")]
mod valkey;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use memory::MemoryStore;
#[cfg(feature = "valkey")]
pub use valkey::ValkeyStore;

use super::encryption::{EncryptionError, TokenCipher};
use crate::config::{StorageBackend, StorageConfig};
use crate::failsafe::{RetryPolicy, with_retry};

/// Credential store failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Backend could not be reached (transient)
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    /// Backend operation timed out (transient)
    #[error("credential store operation timed out")]
    Timeout,
    /// Backend rejected the operation
    #[error("credential store error: {0}")]
    Backend(String),
    /// Record could not be (de)serialized
    #[error("credential store serialization error: {0}")]
    Serialization(String),
    /// Record could not be sealed or opened
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

impl StorageError {
    /// Whether retrying the same idempotent operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Key-value contract every credential store backend implements.
///
/// Values are opaque bytes; a `None` TTL means the key does not expire.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Insert or overwrite `key`
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Insert `key` only if it does not exist; returns whether it was written
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, StorageError>;

    /// Read `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically read and delete `key`
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete `key`; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Whether `key` exists
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Backend name for logs and health output
    fn backend_name(&self) -> &'static str;
}

/// Build the configured backend
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn KvStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "valkey")]
        StorageBackend::Valkey => Ok(Arc::new(ValkeyStore::connect(&config.valkey).await?)),
        #[cfg(not(feature = "valkey"))]
        StorageBackend::Valkey => Err(StorageError::Backend(
            "valkey backend requested but the `valkey` feature is not compiled in".to_string(),
        )),
    }
}

/// Typed, encrypting facade over a [`KvStore`]
#[derive(Clone)]
pub struct SecureStore {
    kv: Arc<dyn KvStore>,
    cipher: Option<TokenCipher>,
    lookup_retry: RetryPolicy,
}

impl SecureStore {
    /// Wrap a backend; `cipher == None` stores plaintext JSON (degraded mode)
    pub fn new(kv: Arc<dyn KvStore>, cipher: Option<TokenCipher>) -> Self {
        Self {
            kv,
            cipher,
            lookup_retry: RetryPolicy::storage_lookup(),
        }
    }

    /// Override the lookup retry policy
    #[must_use]
    pub fn with_lookup_retry(mut self, policy: RetryPolicy) -> Self {
        self.lookup_retry = policy;
        self
    }

    /// Whether payloads are sealed before reaching the backend
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Backend name
    pub fn backend_name(&self) -> &'static str {
        self.kv.backend_name()
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StorageError> {
        let json = serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        match &self.cipher {
            Some(cipher) => Ok(cipher.seal(&json)?),
            None => Ok(json),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StorageError> {
        let json = match &self.cipher {
            Some(cipher) => cipher.open(bytes)?,
            None => bytes.to_vec(),
        };
        serde_json::from_slice(&json).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Store a record
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), StorageError> {
        let bytes = self.encode(value)?;
        self.kv.put(key, bytes, ttl).await
    }

    /// Store a record unless the key exists
    pub async fn put_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let bytes = self.encode(value)?;
        self.kv.put_if_absent(key, bytes, ttl).await
    }

    /// Read a record, retrying transient failures
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let bytes = with_retry(
            &self.lookup_retry,
            "store.get",
            || self.kv.get(key),
            StorageError::is_transient,
        )
        .await?;
        bytes.map(|b| self.decode(&b)).transpose()
    }

    /// Read and delete a record in one step
    pub async fn take<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let bytes = self.kv.take(key).await?;
        bytes.map(|b| self.decode(&b)).transpose()
    }

    /// Delete a record
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.kv.delete(key).await
    }

    /// Whether a record exists, retrying transient failures
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        with_retry(
            &self.lookup_retry,
            "store.exists",
            || self.kv.exists(key),
            StorageError::is_transient,
        )
        .await
    }
}
