//! Process-local [`CoordinationStore`] built on parking_lot mutexes and
//! tokio broadcast channels.
//!
//! TTLs are enforced lazily: expired entries are dropped when read. Pub/sub
//! fan-out uses one broadcast sender per channel; a publish with no
//! subscribers is a successful no-op, as in any fire-and-forget bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::CoordinationStore;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-memory coordination backend. Cheap to clone handles via `Arc`.
pub struct MemoryStore {
    strings: Mutex<HashMap<String, Entry>>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    hashes: Mutex<HashMap<String, (HashMap<String, String>, Option<Instant>)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            strings: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut strings = self.strings.lock();
        match strings.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings.lock().insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.strings.lock().insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.lock().remove(key);
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut strings = self.strings.lock();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match strings.get(key) {
                Some(entry) if entry.live() => Some(entry.value.clone()),
                Some(_) => {
                    strings.remove(key);
                    None
                }
                None => None,
            };
            out.push(value);
        }
        Ok(out)
    }

    async fn queue_push(&self, queue: &str, value: &str) -> Result<()> {
        self.queues
            .lock()
            .entry(queue.to_owned())
            .or_default()
            .push_back(value.to_owned());
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn queue_peek(&self, queue: &str) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .and_then(|q| q.front().cloned()))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.lock().get(queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<()> {
        self.sets
            .lock()
            .entry(set.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        if let Some(s) = self.sets.lock().get_mut(set) {
            s.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .lock()
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_card(&self, set: &str) -> Result<usize> {
        Ok(self.sets.lock().get(set).map(|s| s.len()).unwrap_or(0))
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        let mut hashes = self.hashes.lock();
        let (map, expiry) = hashes
            .entry(key.to_owned())
            .or_insert_with(|| (HashMap::new(), None));
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        *expiry = expires_at;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut hashes = self.hashes.lock();
        match hashes.get(key) {
            Some((map, expiry)) => {
                let live = expiry.map(|t| Instant::now() < t).unwrap_or(true);
                if live {
                    Ok(Some(map.clone()))
                } else {
                    hashes.remove(key);
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let sender = self.sender_for(channel);
        // send() errs only when there are no receivers; that is not a
        // failure for a broadcast bus.
        Ok(sender.send(payload.to_owned()).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender_for(channel).subscribe()
    }

    async fn acquire_lock(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let key = format!("lock:{resource}");
        let mut strings = self.strings.lock();
        if let Some(entry) = strings.get(&key) {
            if entry.live() {
                return Ok(false);
            }
        }
        strings.insert(
            key,
            Entry {
                value: holder.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, resource: &str) -> Result<()> {
        self.strings.lock().remove(&format!("lock:{resource}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strings_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let store = MemoryStore::new();
        store.queue_push("q", "a").await.unwrap();
        store.queue_push("q", "b").await.unwrap();

        assert_eq!(store.queue_peek("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.queue_len("q").await.unwrap(), 2);
        assert_eq!(store.queue_pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.queue_pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.queue_pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sets_deduplicate() {
        let store = MemoryStore::new();
        store.set_add("s", "x").await.unwrap();
        store.set_add("s", "x").await.unwrap();
        store.set_add("s", "y").await.unwrap();
        assert_eq!(store.set_card("s").await.unwrap(), 2);

        store.set_remove("s", "x").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["y".to_owned()]);
    }

    #[tokio::test]
    async fn get_many_preserves_input_order() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.set("c", "3").await.unwrap();

        let values = store
            .get_many(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_owned()), None, Some("3".to_owned())]
        );
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("events:test");

        let delivered = store.publish("events:test", "hello").await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        let delivered = store.publish("events:nobody", "hello").await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_ttl() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_lock("sched", "p1", Duration::from_millis(30))
            .await
            .unwrap());
        assert!(!store
            .acquire_lock("sched", "p2", Duration::from_millis(30))
            .await
            .unwrap());

        // Expired lock can be re-acquired.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store
            .acquire_lock("sched", "p2", Duration::from_millis(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn released_lock_is_reacquirable() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_lock("roll", "p1", Duration::from_secs(10))
            .await
            .unwrap());
        store.release_lock("roll").await.unwrap();
        assert!(store
            .acquire_lock("roll", "p2", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn hash_honours_ttl() {
        let store = MemoryStore::new();
        store
            .hash_set_all(
                "h",
                &[("cpu".into(), "20".into())],
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        assert!(store.hash_get_all("h").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.hash_get_all("h").await.unwrap().is_none());
    }
}
