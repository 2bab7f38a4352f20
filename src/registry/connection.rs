//! Connection record
//!
//! One accepted push channel: its id, its fixed category and the owned
//! transport handle.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast group tag chosen by the embedding application
///
/// Any small closed enum qualifies; the registry only compares tags for equality.
pub trait Category: Copy + Eq + fmt::Debug + Send + Sync + 'static {}

impl<T> Category for T where T: Copy + Eq + fmt::Debug + Send + Sync + 'static {}

/// Unique identifier of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live, registered connection
pub struct Connection<H, C> {
    id: ConnectionId,
    category: C,
    handle: H,
    opened_at: Instant,
}

impl<H, C: Category> Connection<H, C> {
    pub(crate) fn new(id: ConnectionId, category: C, handle: H) -> Self {
        Self {
            id,
            category,
            handle,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn category(&self) -> C {
        self.category
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// How long the connection has been registered
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Give up the record, keeping only the handle for release
    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

impl<H, C: fmt::Debug> fmt::Debug for Connection<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}
