use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use mailroom_kv_backend::{
    KvBackend, KvError, KvResult, Priority, queue_active_key, queue_owner_key,
};
use tokio::time::Instant;

use crate::MemoryBackend;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(Vec<(String, f64)>),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Key-value state of the memory backend. Expired keys are dropped lazily on access.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<String, Entry>,
}

impl KvStore {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn entry_or(&mut self, key: &str, empty: Value) -> &mut Entry {
        self.live(key);
        self.entries.entry(key.to_string()).or_insert(Entry {
            value: empty,
            expires_at: None,
        })
    }

    fn set_ttl(&mut self, key: &str, ttl: Option<Duration>) {
        if let (Some(ttl), Some(entry)) = (ttl, self.entries.get_mut(key)) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn get_str(&mut self, key: &str) -> KvResult<Option<String>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list(&mut self, key: &str) -> KvResult<&mut VecDeque<String>> {
        match &mut self.entry_or(key, Value::List(VecDeque::new())).value {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset(&mut self, key: &str) -> KvResult<&mut Vec<(String, f64)>> {
        match &mut self.entry_or(key, Value::ZSet(Vec::new())).value {
            Value::ZSet(members) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    fn hash(&mut self, key: &str) -> KvResult<&mut BTreeMap<String, String>> {
        match &mut self.entry_or(key, Value::Hash(BTreeMap::new())).value {
            Value::Hash(fields) => Ok(fields),
            _ => Err(wrong_type(key)),
        }
    }

    fn members(&mut self, key: &str) -> KvResult<&mut BTreeSet<String>> {
        match &mut self.entry_or(key, Value::Set(BTreeSet::new())).value {
            Value::Set(members) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    fn list_len(&mut self, key: &str) -> KvResult<usize> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Drop collections left empty by a pop or trim.
    fn prune(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn zincr(&mut self, key: &str, member: &str, by: f64) -> KvResult<f64> {
        let members = self.zset(key)?;
        let score = match members.iter().position(|(m, _)| m == member) {
            Some(i) => {
                members[i].1 += by;
                members[i].1
            }
            None => {
                members.push((member.to_string(), by));
                by
            }
        };
        sort_scores(members);
        Ok(score)
    }
}

fn wrong_type(key: &str) -> KvError {
    KvError::Malformed {
        key: key.to_string(),
        reason: "wrong value type".to_string(),
    }
}

fn sort_scores(members: &mut [(String, f64)]) {
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
}

impl MemoryBackend {
    fn kv<R>(&self, op: &'static str, f: impl FnOnce(&mut KvStore) -> KvResult<R>) -> KvResult<R> {
        if self.is_failing(op) {
            return Err(KvError::Injected(op));
        }
        let mut kv = self.kv.lock().expect("kv poisoned");
        f(&mut kv)
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryBackend {
    fn clone_box(&self) -> Box<dyn KvBackend> {
        Box::new(self.clone())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        self.kv("set_nx", |kv| {
            if kv.live(key).is_some() {
                return Ok(false);
            }
            kv.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.kv("set", |kv| {
            kv.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.kv("get", |kv| kv.get_str(key))
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.kv("del", |kv| {
            kv.entries.remove(key);
            Ok(())
        })
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> KvResult<bool> {
        self.kv("delete_if_equals", |kv| {
            if kv.get_str(key)?.as_deref() == Some(value) {
                kv.entries.remove(key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        self.kv("expire_if_equals", |kv| {
            if kv.get_str(key)?.as_deref() == Some(value) {
                kv.set_ttl(key, Some(ttl));
                return Ok(true);
            }
            Ok(false)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        self.kv("expire", |kv| {
            if kv.live(key).is_some() {
                kv.set_ttl(key, Some(ttl));
            }
            Ok(())
        })
    }

    async fn incr_by(&self, key: &str, by: i64, ttl: Option<Duration>) -> KvResult<i64> {
        self.kv("incr_by", |kv| {
            let current = match kv.get_str(key)? {
                Some(raw) => raw.parse::<i64>().map_err(|err| KvError::Malformed {
                    key: key.to_string(),
                    reason: err.to_string(),
                })?,
                None => 0,
            };
            let next = current + by;
            let expires_at = kv.live(key).and_then(|e| e.expires_at);
            kv.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(next.to_string()),
                    expires_at,
                },
            );
            kv.set_ttl(key, ttl);
            Ok(next)
        })
    }

    async fn list_push(&self, key: &str, value: &str, front: bool) -> KvResult<()> {
        self.kv("list_push", |kv| {
            let list = kv.list(key)?;
            if front {
                list.push_front(value.to_string());
            } else {
                list.push_back(value.to_string());
            }
            Ok(())
        })
    }

    async fn list_pop(&self, key: &str) -> KvResult<Option<String>> {
        self.kv("list_pop", |kv| {
            if kv.live(key).is_none() {
                return Ok(None);
            }
            let popped = kv.list(key)?.pop_front();
            kv.prune(key);
            Ok(popped)
        })
    }

    async fn list_len(&self, key: &str) -> KvResult<usize> {
        self.kv("list_len", |kv| kv.list_len(key))
    }

    async fn list_range(&self, key: &str) -> KvResult<Vec<String>> {
        self.kv("list_range", |kv| match kv.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zset_add_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        ttl: Duration,
    ) -> KvResult<()> {
        self.kv("zset_add_capped", |kv| {
            let members = kv.zset(key)?;
            members.retain(|(m, _)| m != member);
            members.push((member.to_string(), score));
            sort_scores(members);
            let excess = members.len().saturating_sub(cap);
            members.drain(..excess);
            kv.prune(key);
            kv.set_ttl(key, Some(ttl));
            Ok(())
        })
    }

    async fn zset_members(&self, key: &str) -> KvResult<Vec<(String, f64)>> {
        self.kv("zset_members", |kv| match kv.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(members)) => Ok(members.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        by: i64,
        ttl: Option<Duration>,
    ) -> KvResult<i64> {
        self.kv("hash_incr", |kv| {
            let fields = kv.hash(key)?;
            let current = match fields.get(field) {
                Some(raw) => raw.parse::<i64>().map_err(|err| KvError::Malformed {
                    key: format!("{key}.{field}"),
                    reason: err.to_string(),
                })?,
                None => 0,
            };
            let next = current + by;
            fields.insert(field.to_string(), next.to_string());
            kv.set_ttl(key, ttl);
            Ok(next)
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
        self.kv("hash_set", |kv| {
            kv.hash(key)?.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<BTreeMap<String, String>> {
        self.kv("hash_get_all", |kv| match kv.live(key).map(|e| &e.value) {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.kv("set_add", |kv| {
            kv.members(key)?.insert(member.to_string());
            kv.set_ttl(key, ttl);
            Ok(())
        })
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        self.kv("set_members", |kv| match kv.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn queue_push(
        &self,
        queue: &str,
        owner: &str,
        task: &str,
        priority: Priority,
    ) -> KvResult<()> {
        self.kv("queue_push", |kv| {
            kv.list(&queue_owner_key(queue, owner, priority))?
                .push_back(task.to_string());
            kv.zincr(&queue_active_key(queue), owner, 0.0)?;
            Ok(())
        })
    }

    async fn queue_pop(&self, queue: &str) -> KvResult<Option<(String, String)>> {
        self.kv("queue_pop", |kv| {
            let active_key = queue_active_key(queue);
            let owners: Vec<String> = match kv.live(&active_key).map(|e| &e.value) {
                Some(Value::ZSet(members)) => members.iter().map(|(m, _)| m.clone()).collect(),
                Some(_) => return Err(wrong_type(&active_key)),
                None => return Ok(None),
            };
            for owner in owners {
                for priority in [Priority::High, Priority::Default] {
                    let key = queue_owner_key(queue, &owner, priority);
                    if kv.list_len(&key)? == 0 {
                        continue;
                    }
                    let task = kv.list(&key)?.pop_front();
                    kv.prune(&key);
                    if let Some(task) = task {
                        kv.zincr(&active_key, &owner, 1.0)?;
                        return Ok(Some((owner, task)));
                    }
                }
            }
            Ok(None)
        })
    }

    async fn queue_done(&self, queue: &str, owner: &str) -> KvResult<()> {
        self.kv("queue_done", |kv| {
            let active_key = queue_active_key(queue);
            let active = kv.zincr(&active_key, owner, -1.0)?;
            let waiting = kv.list_len(&queue_owner_key(queue, owner, Priority::High))?
                + kv.list_len(&queue_owner_key(queue, owner, Priority::Default))?;
            if active <= 0.0 && waiting == 0 {
                kv.zset(&active_key)?.retain(|(m, _)| m != owner);
                kv.prune(&active_key);
            }
            Ok(())
        })
    }

    async fn queue_size(&self, queue: &str) -> KvResult<usize> {
        self.kv("queue_size", |kv| {
            let active_key = queue_active_key(queue);
            let owners: Vec<String> = match kv.live(&active_key).map(|e| &e.value) {
                Some(Value::ZSet(members)) => members.iter().map(|(m, _)| m.clone()).collect(),
                _ => return Ok(0),
            };
            let mut size = 0;
            for owner in owners {
                size += kv.list_len(&queue_owner_key(queue, &owner, Priority::High))?;
                size += kv.list_len(&queue_owner_key(queue, &owner, Priority::Default))?;
            }
            Ok(size)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_and_expiry() {
        let kv = MemoryBackend::new();
        assert!(kv.set_nx("lock", "a", Duration::from_millis(20)).await.unwrap());
        assert!(!kv.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_and_delete() {
        let kv = MemoryBackend::new();
        kv.set("k", "v1", None).await.unwrap();
        assert!(!kv.delete_if_equals("k", "other").await.unwrap());
        assert!(kv.delete_if_equals("k", "v1").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn capped_zset_keeps_highest_scores() {
        let kv = MemoryBackend::new();
        for i in 0..5 {
            kv.zset_add_capped("recent", &format!("m{i}"), i as f64, 3, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let members: Vec<String> = kv
            .zset_members("recent")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn fair_queue_alternates_owners() {
        let kv = MemoryBackend::new();
        for i in 0..3 {
            kv.queue_push("batch", "1", &format!("a{i}"), Priority::Default)
                .await
                .unwrap();
        }
        kv.queue_push("batch", "2", "b0", Priority::Default)
            .await
            .unwrap();
        assert_eq!(kv.queue_size("batch").await.unwrap(), 4);

        let (first, _) = kv.queue_pop("batch").await.unwrap().unwrap();
        let (second, _) = kv.queue_pop("batch").await.unwrap().unwrap();
        assert_ne!(first, second);

        // owner 2 has nothing left, so owner 1 gets served even while busy
        let (third, task) = kv.queue_pop("batch").await.unwrap().unwrap();
        assert_eq!(third, "1");
        assert_eq!(task, "a1");
    }

    #[tokio::test]
    async fn fair_queue_serves_high_priority_first() {
        let kv = MemoryBackend::new();
        kv.queue_push("realtime", "1", "low", Priority::Default)
            .await
            .unwrap();
        kv.queue_push("realtime", "1", "high", Priority::High)
            .await
            .unwrap();
        let (_, task) = kv.queue_pop("realtime").await.unwrap().unwrap();
        assert_eq!(task, "high");
    }

    #[tokio::test]
    async fn queue_done_forgets_idle_owner() {
        let kv = MemoryBackend::new();
        kv.queue_push("batch", "7", "t", Priority::Default)
            .await
            .unwrap();
        kv.queue_pop("batch").await.unwrap();
        kv.queue_done("batch", "7").await.unwrap();
        assert!(kv.zset_members("batch:active").await.unwrap().is_empty());
        assert_eq!(kv.queue_pop("batch").await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_kv_failure() {
        let kv = MemoryBackend::new();
        kv.fail_op("queue_pop");
        assert!(matches!(
            kv.queue_pop("batch").await,
            Err(KvError::Injected("queue_pop"))
        ));
    }
}
