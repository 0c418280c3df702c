//! Member-map primitives.
//!
//! Both presence maps share the same conflict-resolution rule: a mutation
//! only takes effect when the incoming message supersedes the stored one
//! per [`PresenceMessage::is_newer_than`]. The returned `updated` flag
//! drives event emission; the optional error carries a non-fatal id-parse
//! failure for the channel error emitter.

use crate::error::ErrorInfo;
use crate::proto::{PresenceAction, PresenceMessage};
use std::collections::HashMap;

/// Key of a member in the public map: connection id concatenated with
/// client id, so one (connection, client) pair holds at most one entry.
pub(crate) fn member_key(msg: &PresenceMessage) -> String {
    format!("{}{}", msg.connection_id, msg.client_id)
}

/// Insert `incoming` under `key` unless the stored entry is at least as
/// new. Returns whether the map changed.
pub(crate) fn add_member(
    map: &mut HashMap<String, PresenceMessage>,
    key: &str,
    incoming: PresenceMessage,
) -> (bool, Option<ErrorInfo>) {
    let Some(existing) = map.get(key) else {
        map.insert(key.to_string(), incoming);
        return (true, None);
    };
    let (newer, err) = incoming.is_newer_than(existing);
    if newer {
        map.insert(key.to_string(), incoming);
        (true, err)
    } else {
        (false, err)
    }
}

/// Remove the entry under `key` if `incoming` supersedes it.
///
/// With `tombstone` set (the public map) the entry is replaced by an
/// `Absent` copy of `incoming` instead of being deleted, so later-arriving
/// stale messages still have an ordering baseline. Tombstones are invisible
/// to queries and are dropped at sync end.
///
/// Returns `updated` only when an entry was displaced and it was not
/// already `Absent`, so that Absent-to-Leave transitions do not emit
/// spurious leaves.
pub(crate) fn remove_member(
    map: &mut HashMap<String, PresenceMessage>,
    key: &str,
    incoming: &PresenceMessage,
    tombstone: bool,
) -> (bool, Option<ErrorInfo>) {
    let Some(existing) = map.get(key) else {
        return (false, None);
    };
    let (newer, err) = incoming.is_newer_than(existing);
    if !newer {
        return (false, err);
    }
    let was_absent = existing.action == PresenceAction::Absent;
    if tombstone {
        let mut marker = incoming.clone();
        marker.action = PresenceAction::Absent;
        map.insert(key.to_string(), marker);
    } else {
        map.remove(key);
    }
    (!was_absent, err)
}
