use super::{Fields, QueueBackend};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Idle blocking connections kept for reuse
const MAX_IDLE_BLOCKING: usize = 64;

/// KEYS: processing, target, record. ARGV: value, ttl, then field/value pairs.
/// Pushes only when the processing entry was still there.
const REQUEUE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    if #ARGV > 2 then
        redis.call('HSET', KEYS[3], unpack(ARGV, 3))
    end
    redis.call('EXPIRE', KEYS[3], ARGV[2])
    return 1
end
return 0
";

/// Redis-backed queue primitives.
///
/// Regular commands share one reconnecting [`ConnectionManager`]. `BLMOVE` parks its
/// connection for the whole wait, so blocking calls check out a dedicated connection
/// from a small pool instead of stalling the shared one.
pub struct RedisBackend {
    client: Client,
    manager: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    requeue_script: Script,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;

        Ok(RedisBackend {
            client,
            manager,
            blocking: Mutex::new(Vec::new()),
            requeue_script: Script::new(REQUEUE_SCRIPT),
        })
    }

    async fn checkout(&self) -> Result<MultiplexedConnection> {
        let idle = self.blocking.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening dedicated Redis connection for blocking moves");
                Ok(self.client.get_multiplexed_async_connection().await?)
            }
        }
    }

    fn release(&self, conn: MultiplexedConnection) {
        let mut pool = self.blocking.lock();
        if pool.len() < MAX_IDLE_BLOCKING {
            pool.push(conn);
        }
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn blmove(&self, source: &str, destination: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.checkout().await?;
        let moved: redis::RedisResult<Option<String>> = redis::cmd("BLMOVE")
            .arg(source)
            .arg(destination)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await;

        // a failed connection is dropped rather than returned to the pool
        match moved {
            Ok(value) => {
                self.release(conn);
                Ok(value)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let values: Vec<String> = redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let removed: usize = redis::cmd("LREM").arg(key).arg(count).arg(value).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn hset(&self, key: &str, fields: &Fields) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("HSET").arg(key).arg(fields).query_async(&mut conn).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        let record: HashMap<String, String> = redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(record)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let applied: i64 = redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs()).query_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_tracked(&self, list: &str, value: &str, record: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LPUSH").arg(list).arg(value).ignore()
            .cmd("HSET").arg(record).arg(fields).ignore()
            .cmd("EXPIRE").arg(record).arg(ttl.as_secs()).ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(
        &self,
        processing: &str,
        target: &str,
        value: &str,
        record: &str,
        fields: &Fields,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.manager.clone();
        let mut invocation = self.requeue_script.prepare_invoke();
        invocation
            .key(processing)
            .key(target)
            .key(record)
            .arg(value)
            .arg(ttl.as_secs().max(1));
        for (field, field_value) in fields {
            invocation.arg(field).arg(field_value);
        }
        let moved: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(moved == 1)
    }
}
