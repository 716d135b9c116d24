//! `Dragonfly` (Redis-compatible) networked cache tier.
//!
//! Payloads are stored as plain string values under their cache key.
//!
//! # Commands
//!
//! | Operation | Command |
//! |-----------|---------|
//! | lookup | `GET key` |
//! | populate, never expires | `SET key payload` |
//! | populate, concrete TTL | `SET key payload PX <ms>` |
//! | invalidate key | `DEL key` |
//! | invalidate prefix | `SCAN MATCH <prefix>*` pages, then `DEL` in batches |

use fred::prelude::*;
use fred::types::{Expiration, Key};
use futures::TryStreamExt;

use crate::cache::ttl::Ttl;
use crate::error::DbError;

/// Keys requested per `SCAN` page.
const SCAN_PAGE_SIZE: u32 = 500;

/// Keys deleted per `DEL` during prefix invalidation.
const DELETE_BATCH_SIZE: usize = 500;

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct DragonflyCache {
    client: Client,
}

impl DragonflyCache {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    /// Read the payload at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the read fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let value: Option<String> = self.client.get(key).await?;
        Ok(value.map(String::into_bytes))
    }

    /// Store `payload` at `key` with the given TTL.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::CacheUnavailable`] if the payload is not UTF-8.
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn set(&self, key: &str, payload: &[u8], ttl: Ttl) -> Result<(), DbError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| DbError::CacheUnavailable(format!("payload for `{key}` is not UTF-8: {e}")))?;
        let expire = ttl.as_millis().map(|ms| Expiration::PX(ms.max(1)));
        let _: () = self.client.set(key, text, expire, None, false).await?;
        Ok(())
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        let _: i64 = self.client.del(key).await?;
        Ok(())
    }

    /// Delete every key starting with `prefix`. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if a scan or delete fails. Keys
    /// deleted before the failure stay deleted.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, DbError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut scan = std::pin::pin!(self.client.scan_buffered(pattern, Some(SCAN_PAGE_SIZE), None));

        let mut batch: Vec<Key> = Vec::with_capacity(DELETE_BATCH_SIZE);
        let mut deleted: usize = 0;
        while let Some(key) = scan.try_next().await? {
            batch.push(key);
            if batch.len() >= DELETE_BATCH_SIZE {
                deleted = deleted.saturating_add(self.delete_batch(std::mem::take(&mut batch)).await?);
            }
        }
        if !batch.is_empty() {
            deleted = deleted.saturating_add(self.delete_batch(batch).await?);
        }

        tracing::debug!(prefix, deleted, "Deleted Dragonfly keys by prefix");
        Ok(deleted)
    }

    async fn delete_batch(&self, keys: Vec<Key>) -> Result<usize, DbError> {
        let removed: i64 = self.client.del(keys).await?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the quit command fails.
    pub async fn quit(&self) -> Result<(), DbError> {
        self.client.quit().await?;
        tracing::info!("Dragonfly connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for DragonflyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DragonflyCache").finish_non_exhaustive()
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
