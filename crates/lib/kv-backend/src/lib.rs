//! The shared key-value store the mailroom core uses for locks, task queues,
//! capped recent-activity sets and counters.
//!
//! Besides plain primitives the trait carries a fair queue: tasks are pushed
//! per owner (an org) and popped from whichever owner currently has the fewest
//! tasks in flight, so one busy org can't starve the rest.

use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv store error: {0}")]
    Store(String),

    /// Injected by test backends.
    #[error("injected kv failure in {0}")]
    Injected(&'static str),

    #[error("malformed value for {key}: {reason}")]
    Malformed { key: String, reason: String },
}

pub type KvResult<T> = Result<T, KvError>;

/// Whether a queued task jumps ahead of an owner's normal tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Default,
    High,
}

#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    fn clone_box(&self) -> Box<dyn KvBackend>;

    /// Set `key` only if it doesn't exist. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn del(&self, key: &str) -> KvResult<()>;
    /// Delete `key` only if it holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> KvResult<bool>;
    /// Reset the TTL of `key` only if it holds `value`.
    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;
    async fn incr_by(&self, key: &str, by: i64, ttl: Option<Duration>) -> KvResult<i64>;

    async fn list_push(&self, key: &str, value: &str, front: bool) -> KvResult<()>;
    /// Pop from the front of the list.
    async fn list_pop(&self, key: &str) -> KvResult<Option<String>>;
    async fn list_len(&self, key: &str) -> KvResult<usize>;
    async fn list_range(&self, key: &str) -> KvResult<Vec<String>>;

    /// Add a scored member, then trim the set to its `cap` highest scores.
    async fn zset_add_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        ttl: Duration,
    ) -> KvResult<()>;
    /// Members with scores, lowest score first.
    async fn zset_members(&self, key: &str) -> KvResult<Vec<(String, f64)>>;

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        by: i64,
        ttl: Option<Duration>,
    ) -> KvResult<i64>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> KvResult<()>;
    async fn hash_get_all(&self, key: &str) -> KvResult<BTreeMap<String, String>>;

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> KvResult<()>;
    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;

    /// Push a task for `owner` onto the fair queue `queue`.
    async fn queue_push(
        &self,
        queue: &str,
        owner: &str,
        task: &str,
        priority: Priority,
    ) -> KvResult<()>;
    /// Pop the next task from the owner with the fewest tasks in flight.
    /// The popped task counts as in flight until [`KvBackend::queue_done`].
    async fn queue_pop(&self, queue: &str) -> KvResult<Option<(String, String)>>;
    async fn queue_done(&self, queue: &str, owner: &str) -> KvResult<()>;
    /// Number of tasks waiting in the queue across all owners.
    async fn queue_size(&self, queue: &str) -> KvResult<usize>;
}

impl Clone for Box<dyn KvBackend> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Key of the sorted set tracking in-flight counts per owner.
pub fn queue_active_key(queue: &str) -> String {
    format!("{queue}:active")
}

/// Key of an owner's task list at the given priority.
pub fn queue_owner_key(queue: &str, owner: &str, priority: Priority) -> String {
    match priority {
        Priority::High => format!("{queue}:{owner}/1"),
        Priority::Default => format!("{queue}:{owner}/0"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys() {
        assert_eq!(queue_active_key("realtime"), "realtime:active");
        assert_eq!(queue_owner_key("batch", "12", Priority::High), "batch:12/1");
        assert_eq!(queue_owner_key("batch", "12", Priority::Default), "batch:12/0");
    }
}
