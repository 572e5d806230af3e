//! Roles and member selection.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apm_core::hash::bucket_for;

/// Strategy picking one member of a role for a message.
#[derive(Debug, Clone)]
pub enum Selector {
    /// `fnv1a(key) % members`. A pure function of the key and the sorted
    /// member list, so every node routes a key to the same member.
    HashCode,
    /// Rotates through the members; the cursor is shared by clones.
    RoundRobin(Arc<AtomicUsize>),
}

impl Selector {
    #[must_use]
    pub fn hash_code() -> Self {
        Self::HashCode
    }

    /// Round-robin selector starting at a random member, so that nodes do
    /// not all begin with the first one.
    #[must_use]
    pub fn round_robin() -> Self {
        Self::RoundRobin(Arc::new(AtomicUsize::new(rand::random::<u32>() as usize)))
    }

    /// Picks the member for `key`, or `None` when `members` is empty.
    #[must_use]
    pub fn select<'a, T>(&self, members: &'a [T], key: &str) -> Option<&'a T> {
        if members.is_empty() {
            return None;
        }
        let index = match self {
            Self::HashCode => bucket_for(key, members.len())?,
            Self::RoundRobin(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % members.len(),
        };
        members.get(index)
    }
}

/// Logical worker type: a name plus the selector used to pick one of its
/// members. Identical on every node.
#[derive(Debug, Clone)]
pub struct Role {
    name: Arc<str>,
    selector: Selector,
}

impl Role {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, selector: Selector) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
