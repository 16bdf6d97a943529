//! Redis implementation of the atomic store contract.
//!
//! Ordinary commands go through a [`ConnectionManager`] (which reconnects
//! automatically). Blocking pops hold their connection for the whole wait, so
//! they use dedicated multiplexed connections drawn from a small idle pool;
//! a worker parked on `BRPOPLPUSH` never delays another worker's commands.
//!
//! Guarded transactions run as one Lua script. Redis does not undo the writes
//! of a script that fails halfway, which only happens on a wrong-type key.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};

use super::{AtomicStore, StoreCommand, Transaction};
use crate::error::StoreError;

/// Idle blocking connections kept around between pops.
const MAX_IDLE_BLOCKING_CONNECTIONS: usize = 16;

/// Shortest wait sent to `BRPOPLPUSH`, where 0 would mean "forever".
const MIN_BLOCK_TIMEOUT_SECS: f64 = 0.01;

const EXEC_IF_REMOVED_LUA: &str = include_str!("lua/exec_if_removed.lua");

/// Redis-backed [`AtomicStore`].
pub struct RedisStore {
    client: redis::Client,
    redis: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    exec_if_removed_script: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            exec_if_removed_script: Script::new(EXEC_IF_REMOVED_LUA),
        })
    }

    fn idle_blocking(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.blocking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn acquire_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self.idle_blocking().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::Connection(e.to_string())),
        }
    }

    fn release_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle_blocking();
        if idle.len() < MAX_IDLE_BLOCKING_CONNECTIONS {
            idle.push(conn);
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Timeout argument for `BRPOPLPUSH`, in fractional seconds.
fn block_timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLOCK_TIMEOUT_SECS)
}

/// Command name and arguments after the key, as fed to the guarded script.
fn script_command(command: &StoreCommand) -> (&'static str, Vec<String>) {
    match command {
        StoreCommand::LPush { value, .. } => ("LPUSH", vec![value.clone()]),
        StoreCommand::LRem { value, count, .. } => ("LREM", vec![count.to_string(), value.clone()]),
        StoreCommand::Set { value, .. } => ("SET", vec![value.clone()]),
        StoreCommand::SetEx { ttl, .. } if ttl.is_zero() => ("DEL", Vec::new()),
        StoreCommand::SetEx { value, ttl, .. } => {
            ("PSETEX", vec![ttl_millis(*ttl).to_string(), value.clone()])
        }
        StoreCommand::Incr { .. } => ("INCR", Vec::new()),
        StoreCommand::Del { .. } => ("DEL", Vec::new()),
    }
}

fn map_exec_error(err: redis::RedisError) -> StoreError {
    if err.kind() == redis::ErrorKind::ExecAbortError {
        StoreError::TransactionAborted
    } else {
        StoreError::Redis(err)
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn lpush(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lpush::<_, _, usize>(list, value).await?)
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn
            .rpoplpush::<_, _, Option<String>>(source, destination)
            .await?)
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.acquire_blocking().await?;
        // BRPOPLPUSH treats 0 as "wait forever"; the contract always bounds the wait.
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(block_timeout_secs(timeout))
            .query_async(&mut conn)
            .await?;

        self.release_blocking(conn);
        Ok(result)
    }

    async fn lrem(&self, list: &str, value: &str, count: i64) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn
            .lrem::<_, _, usize>(list, count as isize, value)
            .await?)
    }

    async fn lrange(
        &self,
        list: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lrange::<_, Vec<String>>(list, start, stop).await?)
    }

    async fn llen(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen::<_, usize>(list).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        if ttl.is_zero() {
            // PSETEX rejects a zero expiry; an already-expired key is an absent key.
            conn.del::<_, ()>(key).await?;
            return Ok(());
        }
        redis::cmd("PSETEX")
            .arg(key)
            .arg(ttl_millis(ttl))
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.incr::<_, _, i64>(key, 1).await?)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exec(&self, tx: Transaction) -> Result<(), StoreError> {
        if tx.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in tx {
            match command {
                StoreCommand::LPush { list, value } => pipe.lpush(list, value),
                StoreCommand::LRem { list, value, count } => {
                    pipe.lrem(list, count as isize, value)
                }
                StoreCommand::Set { key, value } => pipe.set(key, value),
                StoreCommand::SetEx { key, ttl, .. } if ttl.is_zero() => pipe.del(key),
                StoreCommand::SetEx { key, value, ttl } => pipe
                    .cmd("PSETEX")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .arg(value),
                StoreCommand::Incr { key } => pipe.incr(key, 1),
                StoreCommand::Del { key } => pipe.del(key),
            }
            .ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_exec_error)
    }

    async fn exec_if_removed(
        &self,
        list: &str,
        value: &str,
        count: i64,
        tx: Transaction,
    ) -> Result<bool, StoreError> {
        let mut invocation = self.exec_if_removed_script.prepare_invoke();
        invocation.key(list).arg(count).arg(value);
        for command in tx.commands() {
            let (name, args) = script_command(command);
            invocation.key(command.key()).arg(name).arg(args.len());
            for arg in args {
                invocation.arg(arg);
            }
        }

        let mut conn = self.redis.clone();
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed > 0)
    }
}
