//! Presence tracking for realtime channels.
//!
//! Each channel carries a presence set: the server's authoritative list of
//! (connection, client) pairs currently announced on it. This module keeps
//! a local replica of that set, synchronized through the multi-message SYNC
//! protocol, and lets the local endpoint announce its own presence.
//!
//! # Architecture
//!
//! - **Member map**: the server-synced view, keyed by connection id +
//!   client id. Conflicts between messages for the same member resolve by
//!   server-assigned message id.
//! - **Internal member map**: entries this connection originated, keyed by
//!   client id. Survives connection suspension and automatically re-enters
//!   after a fresh attach, preserving message ids so the server can
//!   de-duplicate.
//! - **Sync controller**: drives `Initial -> InProgress -> Complete`;
//!   members that the server does not reaffirm during a sync are
//!   synthesized as having left. Callers of
//!   [`RealtimePresence::get`] block until the first sync settles.
//!
//! # Subscribing
//!
//! ```ignore
//! let sub = channel
//!     .presence
//!     .subscribe(PresenceAction::Enter, |member| {
//!         println!("{} entered", member.client_id);
//!     })
//!     .await?;
//! // ...
//! sub.unsubscribe();
//! ```

mod map;
mod realtime;
mod sync;

pub use realtime::{PresenceGetOptions, RealtimePresence};
pub use sync::SyncState;
