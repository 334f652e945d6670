use super::{Fields, QueueBackend};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    expiry: HashMap<String, Instant>,
}

impl State {
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key) {
            if *deadline <= Instant::now() {
                self.expiry.remove(key);
                self.lists.remove(key);
                self.hashes.remove(key);
                self.strings.remove(key);
            }
        }
    }

    fn contains(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.lists.contains_key(key) || self.hashes.contains_key(key) || self.strings.contains_key(key)
    }

    fn push(&mut self, key: &str, value: &str) {
        self.purge_if_expired(key);
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn move_one(&mut self, source: &str, destination: &str) -> Option<String> {
        self.purge_if_expired(source);
        let list = self.lists.get_mut(source)?;
        let value = list.pop_back()?;
        if list.is_empty() {
            self.lists.remove(source);
        }
        self.push(destination, &value);
        Some(value)
    }

    fn remove(&mut self, key: &str, count: usize, value: &str) -> usize {
        self.purge_if_expired(key);
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };

        let mut removed = 0;
        let mut kept = VecDeque::with_capacity(list.len());
        for item in list.drain(..) {
            if item == value && (count == 0 || removed < count) {
                removed += 1;
            } else {
                kept.push_back(item);
            }
        }
        *list = kept;
        if list.is_empty() {
            self.lists.remove(key);
        }
        removed
    }

    fn merge(&mut self, key: &str, fields: &Fields) {
        self.purge_if_expired(key);
        let record = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
    }
}

/// In-process backend with Redis list semantics, used by tests and single-node setups
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().push(key, value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blmove(&self, source: &str, destination: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            // register before checking so a push between check and wait is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.state.lock().move_one(source, destination) {
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(self.state.lock().move_one(source, destination));
            }
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize> {
        Ok(self.state.lock().remove(key, count, value))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let existed = state.contains(key);
        state.lists.remove(key);
        state.hashes.remove(key);
        state.strings.remove(key);
        state.expiry.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().contains(key))
    }

    async fn hset(&self, key: &str, fields: &Fields) -> Result<()> {
        self.state.lock().merge(key, fields);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.contains(key) {
            return Ok(false);
        }
        state.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.strings.insert(key.to_string(), value.to_string());
        state.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn push_tracked(&self, list: &str, value: &str, record: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.push(list, value);
            state.merge(record, fields);
            state.expiry.insert(record.to_string(), Instant::now() + ttl);
        }
        self.pushed.notify_waiters();
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
        {
            let mut state = self.state.lock();
            if state.remove(processing, 1, value) != 1 {
                return Ok(false);
            }
            state.push(target, value);
            state.merge(record, fields);
            state.expiry.insert(record.to_string(), Instant::now() + ttl);
        }
        self.pushed.notify_waiters();
        Ok(true)
    }
}
