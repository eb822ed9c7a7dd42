//! Per-contact locks in the KV store.
//!
//! A held lock is a [`ContactLock`] guard. While it lives a heartbeat task
//! keeps extending the lock's TTL, so a slow commit never loses the lock
//! underneath it. Dropping the guard stops the heartbeat and releases the lock.

use std::time::Duration;

use tokio::time::Instant;

use mailroom_kv_backend::{KvBackend, KvResult};
use mailroom_models::ContactID;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::Runtime;

/// How long a contact task waits for a contact lock.
pub const TASK_LOCK_WAIT: Duration = Duration::from_secs(10);
/// How long a flow start waits for each contact lock.
pub const START_LOCK_WAIT: Duration = Duration::from_secs(60);

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub fn contact_lock_key(contact_id: ContactID) -> String {
    format!("lock:contact:{contact_id}")
}

pub struct ContactLock {
    contact_id: ContactID,
    key: String,
    value: String,
    kv: Box<dyn KvBackend>,
    stop: CancellationToken,
    released: bool,
}

impl ContactLock {
    pub fn contact_id(&self) -> ContactID {
        self.contact_id
    }

    /// Release the lock now rather than on drop.
    pub async fn release(mut self) {
        self.stop.cancel();
        self.released = true;
        if let Err(err) = self.kv.delete_if_equals(&self.key, &self.value).await {
            warn!(contact_id = %self.contact_id, error = %err, "failed to release contact lock");
        }
    }
}

impl Drop for ContactLock {
    fn drop(&mut self) {
        self.stop.cancel();
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let kv = self.kv.clone();
        let key = std::mem::take(&mut self.key);
        let value = std::mem::take(&mut self.value);
        handle.spawn(async move {
            if let Err(err) = kv.delete_if_equals(&key, &value).await {
                warn!(key, error = %err, "failed to release contact lock");
            }
        });
    }
}

/// Try to lock a contact, waiting up to `wait` for a current holder to let go.
pub async fn lock_contact(
    rt: &Runtime,
    contact_id: ContactID,
    wait: Duration,
) -> KvResult<Option<ContactLock>> {
    lock_until(rt, contact_id, Instant::now() + wait).await
}

/// Lock several contacts. All of them share one deadline; contacts that
/// couldn't be locked in time are returned as skipped.
pub async fn lock_contacts(
    rt: &Runtime,
    contact_ids: &[ContactID],
    wait: Duration,
) -> KvResult<(Vec<ContactLock>, Vec<ContactID>)> {
    let deadline = Instant::now() + wait;
    let mut locks = Vec::with_capacity(contact_ids.len());
    let mut skipped = Vec::new();
    for &contact_id in contact_ids {
        match lock_until(rt, contact_id, deadline).await? {
            Some(lock) => locks.push(lock),
            None => skipped.push(contact_id),
        }
    }
    if !skipped.is_empty() {
        debug!(skipped = skipped.len(), "contacts skipped as locked");
    }
    Ok((locks, skipped))
}

async fn lock_until(
    rt: &Runtime,
    contact_id: ContactID,
    deadline: Instant,
) -> KvResult<Option<ContactLock>> {
    let key = contact_lock_key(contact_id);
    let value = uuid::Uuid::new_v4().to_string();
    let ttl = rt.config.contact_lock_ttl;

    loop {
        if rt.kv.set_nx(&key, &value, ttl).await? {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
    }

    let stop = CancellationToken::new();
    spawn_lock_heartbeat(
        rt.kv.clone(),
        key.clone(),
        value.clone(),
        ttl,
        stop.clone().cancelled_owned(),
    );
    Ok(Some(ContactLock {
        contact_id,
        key,
        value,
        kv: rt.kv.clone(),
        stop,
        released: false,
    }))
}

/// Extend the lock's TTL every third of a TTL until stopped or the lock is lost.
fn spawn_lock_heartbeat(
    kv: Box<dyn KvBackend>,
    key: String,
    value: String,
    ttl: Duration,
    stop: tokio_util::sync::WaitForCancellationFutureOwned,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stop = std::pin::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(ttl / 3) => {}
            };
            match kv.expire_if_equals(&key, &value, ttl).await {
                Ok(true) => debug!(key, "contact lock extended"),
                Ok(false) => {
                    warn!(key, "contact lock lost before release");
                    break;
                }
                Err(err) => warn!(key, error = %err, "failed to extend contact lock"),
            }
        }
    })
}
