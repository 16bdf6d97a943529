//! In-process implementation of the atomic store contract.
//!
//! All state lives behind a single mutex, so every command (and every
//! transaction) is serialized. Blocked `brpoplpush` callers park on a
//! [`Notify`] that is signalled on every push instead of polling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AtomicStore, StoreCommand, Transaction};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, StringEntry>,
}

/// Saved value of one key, used to roll a failed transaction back.
enum Snapshot {
    List(String, Option<VecDeque<String>>),
    String(String, Option<StringEntry>),
}

impl State {
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>, StoreError> {
        if self.live_string(key).is_some() {
            return Err(StoreError::WrongType {
                key: key.to_string(),
            });
        }
        Ok(self.lists.entry(key.to_string()).or_default())
    }

    fn list(&mut self, key: &str) -> Result<Option<&VecDeque<String>>, StoreError> {
        if self.live_string(key).is_some() {
            return Err(StoreError::WrongType {
                key: key.to_string(),
            });
        }
        Ok(self.lists.get(key))
    }

    /// Empty lists do not exist, as in Redis.
    fn prune(&mut self, key: &str) {
        if self.lists.get(key).is_some_and(VecDeque::is_empty) {
            self.lists.remove(key);
        }
    }

    fn lpush(&mut self, list: &str, value: &str) -> Result<usize, StoreError> {
        let entries = self.list_mut(list)?;
        entries.push_front(value.to_string());
        Ok(entries.len())
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        // Validate the destination before mutating the source.
        if self.live_string(destination).is_some() {
            return Err(StoreError::WrongType {
                key: destination.to_string(),
            });
        }
        let popped = match self.lists.get_mut(source) {
            Some(entries) => entries.pop_back(),
            None => {
                self.list(source)?;
                None
            }
        };
        self.prune(source);

        if let Some(value) = &popped {
            self.list_mut(destination)?.push_front(value.clone());
        }
        Ok(popped)
    }

    fn lrem(&mut self, list: &str, value: &str, count: i64) -> Result<usize, StoreError> {
        let Some(entries) = self.list(list)?.cloned() else {
            return Ok(0);
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0;
        let kept: VecDeque<String> = if count >= 0 {
            entries
                .into_iter()
                .filter(|entry| {
                    if removed < limit && entry == value {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                })
                .collect()
        } else {
            let mut kept: VecDeque<String> = entries
                .into_iter()
                .rev()
                .filter(|entry| {
                    if removed < limit && entry == value {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                })
                .collect();
            kept.make_contiguous().reverse();
            kept
        };

        self.lists.insert(list.to_string(), kept);
        self.prune(list);
        Ok(removed)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.lists.remove(key);
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn incr(&mut self, key: &str) -> Result<i64, StoreError> {
        if self.lists.contains_key(key) {
            return Err(StoreError::WrongType {
                key: key.to_string(),
            });
        }
        let current = match self.live_string(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?,
            None => 0,
        };
        let expires_at = self.strings.get(key).and_then(|e| e.expires_at);
        let next = current + 1;
        self.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn del(&mut self, key: &str) {
        self.lists.remove(key);
        self.strings.remove(key);
    }

    fn apply(&mut self, command: &StoreCommand) -> Result<(), StoreError> {
        match command {
            StoreCommand::LPush { list, value } => self.lpush(list, value).map(|_| ()),
            StoreCommand::LRem { list, value, count } => self.lrem(list, value, *count).map(|_| ()),
            StoreCommand::Set { key, value } => {
                self.set(key, value, None);
                Ok(())
            }
            StoreCommand::SetEx { key, value, ttl } => {
                self.set(key, value, Some(*ttl));
                Ok(())
            }
            StoreCommand::Incr { key } => self.incr(key).map(|_| ()),
            StoreCommand::Del { key } => {
                self.del(key);
                Ok(())
            }
        }
    }

    fn snapshot(&self, keys: &HashSet<&str>) -> Vec<Snapshot> {
        keys.iter()
            .flat_map(|key| {
                [
                    Snapshot::List(key.to_string(), self.lists.get(*key).cloned()),
                    Snapshot::String(key.to_string(), self.strings.get(*key).cloned()),
                ]
            })
            .collect()
    }

    fn restore(&mut self, snapshots: Vec<Snapshot>) {
        for snapshot in snapshots {
            match snapshot {
                Snapshot::List(key, Some(entries)) => {
                    self.lists.insert(key, entries);
                }
                Snapshot::List(key, None) => {
                    self.lists.remove(&key);
                }
                Snapshot::String(key, Some(entry)) => {
                    self.strings.insert(key, entry);
                }
                Snapshot::String(key, None) => {
                    self.strings.remove(&key);
                }
            }
        }
    }
}

/// Thread-safe, in-process [`AtomicStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave a half-applied command
        // behind, so the poisoned state is still consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn lpush(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let len = self.state().lpush(list, value)?;
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>, StoreError> {
        let popped = self.state().rpoplpush(source, destination)?;
        if popped.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(popped)
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push racing with the
            // check still wakes this caller.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.rpoplpush(source, destination).await? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lrem(&self, list: &str, value: &str, count: i64) -> Result<usize, StoreError> {
        self.state().lrem(list, value, count)
    }

    async fn lrange(
        &self,
        list: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.state();
        let Some(entries) = state.list(list)? else {
            return Ok(Vec::new());
        };

        let len = entries.len() as isize;
        let normalize = |index: isize| if index < 0 { len + index } else { index };
        let start = normalize(start).max(0);
        let stop = normalize(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(entries
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.state().list(list)?.map_or(0, VecDeque::len))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.state().set(key, value, None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.state().set(key, value, Some(ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state();
        if state.lists.contains_key(key) {
            return Err(StoreError::WrongType {
                key: key.to_string(),
            });
        }
        Ok(state.live_string(key).map(|entry| entry.value.clone()))
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.state().incr(key)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.state().del(key);
        Ok(())
    }

    async fn exec(&self, tx: Transaction) -> Result<(), StoreError> {
        self.apply_guarded(None, &tx).map(|_| ())
    }

    async fn exec_if_removed(
        &self,
        list: &str,
        value: &str,
        count: i64,
        tx: Transaction,
    ) -> Result<bool, StoreError> {
        self.apply_guarded(Some((list, value, count)), &tx)
    }
}

impl MemoryStore {
    /// Runs `tx` under one lock, after an optional `(list, value, count)`
    /// removal that must succeed for anything to change.
    fn apply_guarded(
        &self,
        guard: Option<(&str, &str, i64)>,
        tx: &Transaction,
    ) -> Result<bool, StoreError> {
        let pushes = tx
            .commands()
            .iter()
            .any(|command| matches!(command, StoreCommand::LPush { .. }));

        {
            let mut state = self.state();
            let mut keys: HashSet<&str> = tx.commands().iter().map(StoreCommand::key).collect();
            if let Some((list, _, _)) = guard {
                keys.insert(list);
            }
            let snapshots = state.snapshot(&keys);

            if let Some((list, value, count)) = guard {
                if state.lrem(list, value, count)? == 0 {
                    return Ok(false);
                }
            }

            for command in tx.commands() {
                if let Err(err) = state.apply(command) {
                    tracing::debug!(key = command.key(), error = %err, "Rolling back transaction");
                    state.restore(snapshots);
                    return Err(StoreError::TransactionAborted);
                }
            }
        }

        if pushes {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lpush_rpoplpush_is_fifo() {
        let store = MemoryStore::new();
        store.lpush("src", "a").await.unwrap();
        store.lpush("src", "b").await.unwrap();

        assert_eq!(store.rpoplpush("src", "dst").await.unwrap(), Some("a".into()));
        assert_eq!(store.rpoplpush("src", "dst").await.unwrap(), Some("b".into()));
        assert_eq!(store.rpoplpush("src", "dst").await.unwrap(), None);
        assert_eq!(store.lrange("dst", 0, -1).await.unwrap(), vec!["b", "a"]);
        assert_eq!(store.llen("src").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lrem_directions() {
        let store = MemoryStore::new();
        for value in ["x", "y", "x", "x"] {
            store.lpush("list", value).await.unwrap();
        }
        // list is now [x, x, y, x]
        assert_eq!(store.lrem("list", "x", -1).await.unwrap(), 1);
        assert_eq!(store.lrange("list", 0, -1).await.unwrap(), vec!["x", "x", "y"]);

        assert_eq!(store.lrem("list", "x", 1).await.unwrap(), 1);
        assert_eq!(store.lrange("list", 0, -1).await.unwrap(), vec!["x", "y"]);

        assert_eq!(store.lrem("list", "x", 0).await.unwrap(), 1);
        assert_eq!(store.lrem("missing", "x", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lrange_bounds() {
        let store = MemoryStore::new();
        for value in ["c", "b", "a"] {
            store.lpush("list", value).await.unwrap();
        }
        assert_eq!(store.lrange("list", 0, 1).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.lrange("list", -2, -1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.lrange("list", 5, 10).await.unwrap(), Vec::<String>::new());
        assert_eq!(store.lrange("list", 0, 100).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_set_ex_expiry() {
        let store = MemoryStore::new();
        store.set_ex("lock:a", "", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("lock:a").await.unwrap(), None);

        store.set_ex("lock:b", "", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("lock:b").await.unwrap(), Some(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires_after_ttl() {
        let store = MemoryStore::new();
        store.set_ex("lock:a", "1", Duration::from_secs(5)).await.unwrap();
        assert!(store.get("lock:a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("lock:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_and_wrong_type() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("retry:a").await.unwrap(), 1);
        assert_eq!(store.incr("retry:a").await.unwrap(), 2);

        store.lpush("list", "a").await.unwrap();
        assert!(matches!(
            store.incr("list").await,
            Err(StoreError::WrongType { .. })
        ));

        store.set("text", "abc").await.unwrap();
        assert!(matches!(
            store.incr("text").await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_exec_applies_all_commands() {
        let store = MemoryStore::new();
        store.lpush("processing", "a").await.unwrap();
        store.set_ex("lock:a", "", Duration::from_secs(60)).await.unwrap();

        let tx = Transaction::new()
            .lrem("processing", "a", -1)
            .del("lock:a")
            .lpush("pending", "a")
            .incr("retry:a");
        store.exec(tx).await.unwrap();

        assert_eq!(store.llen("processing").await.unwrap(), 0);
        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert_eq!(store.lrange("pending", 0, -1).await.unwrap(), vec!["a"]);
        assert_eq!(store.get("retry:a").await.unwrap(), Some("1".into()));
    }

    #[tokio::test]
    async fn test_exec_rolls_back_on_failure() {
        let store = MemoryStore::new();
        store.lpush("processing", "a").await.unwrap();
        store.set("text", "not a number").await.unwrap();

        let tx = Transaction::new()
            .lrem("processing", "a", -1)
            .lpush("pending", "a")
            .incr("text");
        let result = store.exec(tx).await;

        assert!(matches!(result, Err(StoreError::TransactionAborted)));
        assert_eq!(store.lrange("processing", 0, -1).await.unwrap(), vec!["a"]);
        assert_eq!(store.llen("pending").await.unwrap(), 0);
        assert_eq!(store.get("text").await.unwrap(), Some("not a number".into()));
    }

    #[tokio::test]
    async fn test_exec_if_removed_skips_when_value_absent() {
        let store = MemoryStore::new();
        store.lpush("processing", "b").await.unwrap();

        let tx = Transaction::new().lpush("pending", "a").incr("retry:a");
        let applied = store.exec_if_removed("processing", "a", -1, tx).await.unwrap();

        assert!(!applied);
        assert_eq!(store.llen("pending").await.unwrap(), 0);
        assert_eq!(store.get("retry:a").await.unwrap(), None);
        assert_eq!(store.lrange("processing", 0, -1).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_exec_if_removed_moves_value() {
        let store = MemoryStore::new();
        store.lpush("processing", "a").await.unwrap();

        let tx = Transaction::new().lpush("pending", "a").incr("retry:a");
        assert!(store.exec_if_removed("processing", "a", -1, tx).await.unwrap());

        assert_eq!(store.llen("processing").await.unwrap(), 0);
        assert_eq!(store.lrange("pending", 0, -1).await.unwrap(), vec!["a"]);
        assert_eq!(store.get("retry:a").await.unwrap(), Some("1".into()));
    }

    #[tokio::test]
    async fn test_exec_if_removed_rolls_back_removal() {
        let store = MemoryStore::new();
        store.lpush("processing", "a").await.unwrap();
        store.set("text", "not a number").await.unwrap();

        let tx = Transaction::new().lpush("pending", "a").incr("text");
        let result = store.exec_if_removed("processing", "a", -1, tx).await;

        assert!(matches!(result, Err(StoreError::TransactionAborted)));
        assert_eq!(store.lrange("processing", 0, -1).await.unwrap(), vec!["a"]);
        assert_eq!(store.llen("pending").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_brpoplpush_times_out_when_empty() {
        let store = MemoryStore::new();
        let popped = store
            .brpoplpush("src", "dst", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_brpoplpush_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .brpoplpush("src", "dst", Duration::from_secs(10))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.lpush("src", "job").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped, Some("job".to_string()));
        assert_eq!(store.lrange("dst", 0, -1).await.unwrap(), vec!["job"]);
    }
}
