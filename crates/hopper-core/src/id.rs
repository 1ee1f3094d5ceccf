//! Resource identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id the broker hands out to every accepted connection. UUIDv7, so ids
/// sort by connection time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier the broker assigns to a connected worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("worker-{_0}")]
pub struct WorkerId(pub ResourceId);

impl WorkerId {
    pub fn new() -> Self {
        Self(ResourceId::new())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier the broker assigns to a connected client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("client-{_0}")]
pub struct ClientId(pub ResourceId);

impl ClientId {
    pub fn new() -> Self {
        Self(ResourceId::new())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// A client-chosen tag for one submission. Responses echo it back so the
/// client can correlate them without waiting for the broker's handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct ClientJobId(pub u32);
