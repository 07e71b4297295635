//! Remote protocol surface
//!
//! The engine consumes three black-box capabilities of the hosted mailbox
//! platform: the directory protocol (user discovery and group expansion),
//! the incremental change protocol, and the push-event protocol. Concrete
//! transports are injected as trait objects; nothing in this crate speaks a
//! wire format.

pub mod discovery;
pub mod push;
pub mod sync;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend partition serving a mailbox: endpoint plus grouping key.
/// Mailboxes sharing an affinity can be subscribed together on one
/// streaming connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub endpoint: String,
    pub grouping_key: String,
}

/// Kind of change reported by the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Modified,
    NewMail,
    Deleted,
    Moved,
    Copied,
    FreeBusy,
}

/// One raw change event, push- or sync-sourced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub folder: String,
    pub item_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}
