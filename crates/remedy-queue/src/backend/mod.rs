//! List/hash primitives the queue store is built from.
//!
//! Every method is a single atomic operation on the backing store. Lists follow Redis
//! semantics: `lpush` adds at the head, `blmove` pops from the tail of the source and
//! pushes onto the head of the destination, so push/move gives FIFO order.

mod memory;
mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Field/value pairs written into a hash record
pub type Fields = [(String, String)];

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn lpush(&self, key: &str, value: &str) -> Result<()>;

    /// Move the tail element of `source` onto the head of `destination`, waiting up to
    /// `timeout` for one to appear.
    async fn blmove(&self, source: &str, destination: &str, timeout: Duration) -> Result<Option<String>>;

    /// Whole list, head first
    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    /// Remove up to `count` occurrences of `value` starting from the head.
    /// Returns the number removed.
    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Returns true when the key existed
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hset(&self, key: &str, fields: &Fields) -> Result<()>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Returns false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Push onto `list` and write the tracking record with a TTL, as one unit
    async fn push_tracked(&self, list: &str, value: &str, record: &str, fields: &Fields, ttl: Duration) -> Result<()>;

    /// Remove one occurrence of `value` from `processing` and, only if one was removed, push
    /// it onto `target`, merge `fields` into `record` and reset the record TTL, as one unit.
    ///
    /// Returns whether the message was moved.
    async fn requeue(
        &self,
        processing: &str,
        target: &str,
        value: &str,
        record: &str,
        fields: &Fields,
        ttl: Duration,
    ) -> Result<bool>;
}
