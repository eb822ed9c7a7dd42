//! Redis implementation of [`KvBackend`].
//!
//! Compare-and-set operations and the fair queue run as Lua scripts so each
//! call is atomic on the server.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use mailroom_kv_backend::{KvBackend, KvError, KvResult, Priority, queue_active_key, queue_owner_key};
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};
use tracing::debug;

static DELETE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#,
    )
});

static EXPIRE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#,
    )
});

static ZSET_ADD_CAPPED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
redis.call("ZREMRANGEBYRANK", KEYS[1], 0, -(tonumber(ARGV[3]) + 1))
redis.call("PEXPIRE", KEYS[1], ARGV[4])
return 1
"#,
    )
});

// KEYS[1] active set, ARGV[1] queue name
static QUEUE_POP: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local owners = redis.call("ZRANGE", KEYS[1], 0, -1)
for _, owner in ipairs(owners) do
    for _, suffix in ipairs({"/1", "/0"}) do
        local task = redis.call("LPOP", ARGV[1] .. ":" .. owner .. suffix)
        if task then
            redis.call("ZINCRBY", KEYS[1], 1, owner)
            return {owner, task}
        end
    end
end
return false
"#,
    )
});

// KEYS[1] active set, KEYS[2] high list, KEYS[3] default list, ARGV[1] owner
static QUEUE_DONE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local active = tonumber(redis.call("ZINCRBY", KEYS[1], -1, ARGV[1]))
if active <= 0 and redis.call("LLEN", KEYS[2]) == 0 and redis.call("LLEN", KEYS[3]) == 0 then
    redis.call("ZREM", KEYS[1], ARGV[1])
end
return 1
"#,
    )
});

// KEYS[1] active set, ARGV[1] queue name
static QUEUE_SIZE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local size = 0
for _, owner in ipairs(redis.call("ZRANGE", KEYS[1], 0, -1)) do
    size = size + redis.call("LLEN", ARGV[1] .. ":" .. owner .. "/1")
    size = size + redis.call("LLEN", ARGV[1] .. ":" .. owner .. "/0")
end
return size
"#,
    )
});

fn store_err(err: RedisError) -> KvError {
    KvError::Store(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Key-value backend over a multiplexed redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        debug!("connected to redis");
        Ok(Self::new(conn))
    }

    /// Fails when the server can't be reached.
    pub async fn ping(&self) -> KvResult<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn pexpire(&self, key: &str, ttl: Option<Duration>) -> KvResult<()> {
        if let Some(ttl) = ttl {
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(millis(ttl))
                .query_async(&mut self.conn.clone())
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KvBackend for RedisBackend {
    fn clone_box(&self) -> Box<dyn KvBackend> {
        Box::new(self.clone())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> KvResult<bool> {
        let deleted: i64 = DELETE_IF_EQUALS
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let renewed: i64 = EXPIRE_IF_EQUALS
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(renewed == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        self.pexpire(key, Some(ttl)).await
    }

    async fn incr_by(&self, key: &str, by: i64, ttl: Option<Duration>) -> KvResult<i64> {
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        self.pexpire(key, ttl).await?;
        Ok(value)
    }

    async fn list_push(&self, key: &str, value: &str, front: bool) -> KvResult<()> {
        let _: i64 = redis::cmd(if front { "LPUSH" } else { "RPUSH" })
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> KvResult<Option<String>> {
        redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }

    async fn list_len(&self, key: &str) -> KvResult<usize> {
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }

    async fn list_range(&self, key: &str) -> KvResult<Vec<String>> {
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }

    async fn zset_add_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        ttl: Duration,
    ) -> KvResult<()> {
        let _: i64 = ZSET_ADD_CAPPED
            .key(key)
            .arg(member)
            .arg(score)
            .arg(cap)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn zset_members(&self, key: &str) -> KvResult<Vec<(String, f64)>> {
        redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        by: i64,
        ttl: Option<Duration>,
    ) -> KvResult<i64> {
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        self.pexpire(key, ttl).await?;
        Ok(value)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<BTreeMap<String, String>> {
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> KvResult<()> {
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        self.pexpire(key, ttl).await
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        members.sort();
        Ok(members)
    }

    async fn queue_push(
        &self,
        queue: &str,
        owner: &str,
        task: &str,
        priority: Priority,
    ) -> KvResult<()> {
        let _: (i64, f64) = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(queue_owner_key(queue, owner, priority))
            .arg(task)
            .cmd("ZINCRBY")
            .arg(queue_active_key(queue))
            .arg(0)
            .arg(owner)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> KvResult<Option<(String, String)>> {
        let popped: Option<(String, String)> = QUEUE_POP
            .key(queue_active_key(queue))
            .arg(queue)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(popped)
    }

    async fn queue_done(&self, queue: &str, owner: &str) -> KvResult<()> {
        let _: i64 = QUEUE_DONE
            .key(queue_active_key(queue))
            .key(queue_owner_key(queue, owner, Priority::High))
            .key(queue_owner_key(queue, owner, Priority::Default))
            .arg(owner)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> KvResult<usize> {
        QUEUE_SIZE
            .key(queue_active_key(queue))
            .arg(queue)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(store_err)
    }
}
