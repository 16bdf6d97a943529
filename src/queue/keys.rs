//! Store key naming.
//!
//! Keys are colon-joined segments and are shared with every process using
//! the same store, so their layout must stay stable:
//!
//! - `queue:pending:<priority>`, `queue:processing`, `queue:delayed`
//! - `lock:<identifier>`, `retry:<identifier>`, `job:<identifier>`

use std::fmt;

use crate::job::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKey<'a> {
    Pending(Priority),
    Processing,
    Delayed,
    /// Lease marker; its absence means the job expired.
    Lock(&'a str),
    Retry(&'a str),
    /// Encoded envelope record.
    Job(&'a str),
}

impl QueueKey<'_> {
    fn components(&self) -> Vec<&str> {
        match *self {
            QueueKey::Pending(priority) => vec!["queue", "pending", priority.as_str()],
            QueueKey::Processing => vec!["queue", "processing"],
            QueueKey::Delayed => vec!["queue", "delayed"],
            QueueKey::Lock(id) => vec!["lock", id],
            QueueKey::Retry(id) => vec!["retry", id],
            QueueKey::Job(id) => vec!["job", id],
        }
    }
}

impl fmt::Display for QueueKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.components().join(":"))
    }
}

impl From<QueueKey<'_>> for String {
    fn from(key: QueueKey<'_>) -> Self {
        key.to_string()
    }
}
