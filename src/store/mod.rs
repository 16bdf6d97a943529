//! Atomic list/key-value store contract.
//!
//! The queue engine never talks to a database directly. It depends on this
//! narrow contract, modelled on the Redis list and string commands:
//!
//! - list push/pop/move/remove/range
//! - string keys with an optional time-to-live
//! - integer counters
//! - multi-command transactions with all-or-nothing semantics
//! - transactions guarded by a list removal, for moves that must not
//!   resurrect an identifier someone else already took
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! single-process deployments, and [`RedisStore`] for shared deployments.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// A single command that can be batched into a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCommand {
    LPush { list: String, value: String },
    LRem { list: String, value: String, count: i64 },
    Set { key: String, value: String },
    SetEx { key: String, value: String, ttl: Duration },
    Incr { key: String },
    Del { key: String },
}

impl StoreCommand {
    /// Key touched by the command.
    pub fn key(&self) -> &str {
        match self {
            StoreCommand::LPush { list, .. } | StoreCommand::LRem { list, .. } => list,
            StoreCommand::Set { key, .. }
            | StoreCommand::SetEx { key, .. }
            | StoreCommand::Incr { key }
            | StoreCommand::Del { key } => key,
        }
    }
}

/// Ordered batch of commands executed atomically by [`AtomicStore::exec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<StoreCommand>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lpush(mut self, list: impl Into<String>, value: impl Into<String>) -> Self {
        self.commands.push(StoreCommand::LPush {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn lrem(mut self, list: impl Into<String>, value: impl Into<String>, count: i64) -> Self {
        self.commands.push(StoreCommand::LRem {
            list: list.into(),
            value: value.into(),
            count,
        });
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.commands.push(StoreCommand::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_ex(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(StoreCommand::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn incr(mut self, key: impl Into<String>) -> Self {
        self.commands.push(StoreCommand::Incr { key: key.into() });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.commands.push(StoreCommand::Del { key: key.into() });
        self
    }

    pub fn commands(&self) -> &[StoreCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl IntoIterator for Transaction {
    type Item = StoreCommand;
    type IntoIter = std::vec::IntoIter<StoreCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// Shared store offering atomic list and key operations.
///
/// Lists follow Redis semantics: `lpush` adds at the head, pops take from the
/// tail, so a list used with `lpush` + `rpoplpush` is FIFO. Negative range
/// indices count from the tail (`-1` is the last element).
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Pushes `value` at the head of `list`, returning the new length.
    async fn lpush(&self, list: &str, value: &str) -> Result<usize, StoreError>;

    /// Atomically pops the tail of `source` and pushes it at the head of `destination`.
    async fn rpoplpush(&self, source: &str, destination: &str)
        -> Result<Option<String>, StoreError>;

    /// Blocking form of [`rpoplpush`](Self::rpoplpush).
    ///
    /// Suspends until an element is available or `timeout` elapses, in which
    /// case `None` is returned. Implementations must not spin on the store.
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Removes up to `count` occurrences of `value` (0 = all, negative = from the tail).
    async fn lrem(&self, list: &str, value: &str, count: i64) -> Result<usize, StoreError>;

    async fn lrange(&self, list: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    async fn llen(&self, list: &str) -> Result<usize, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Sets `key` with a time-to-live. A zero `ttl` leaves the key absent.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Increments the integer at `key` (missing keys count as 0).
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Executes every command of `tx` atomically.
    ///
    /// Either all commands take effect or none do; in the latter case the
    /// implementation returns [`StoreError::TransactionAborted`] or the
    /// underlying transport error.
    async fn exec(&self, tx: Transaction) -> Result<(), StoreError>;

    /// Removes up to `count` occurrences of `value` from `list` and, only if
    /// at least one was removed, executes `tx` in the same atomic step.
    ///
    /// Returns `false` when `value` was not in `list`; nothing is changed then.
    async fn exec_if_removed(
        &self,
        list: &str,
        value: &str,
        count: i64,
        tx: Transaction,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder_keeps_order() {
        let tx = Transaction::new()
            .lrem("queue:processing", "a", -1)
            .lpush("queue:pending:medium", "a")
            .incr("retry:a");

        assert_eq!(tx.len(), 3);
        let keys: Vec<&str> = tx.commands().iter().map(StoreCommand::key).collect();
        assert_eq!(keys, ["queue:processing", "queue:pending:medium", "retry:a"]);
    }

    #[test]
    fn test_empty_transaction() {
        let tx = Transaction::new();
        assert!(tx.is_empty());
        assert_eq!(tx.into_iter().count(), 0);
    }
}
