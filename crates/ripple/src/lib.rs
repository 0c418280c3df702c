//! # Ripple - realtime pub/sub client library
//!
//! Ripple is the client side of a realtime publish/subscribe messaging
//! protocol: named channels with an attachment lifecycle, a per-channel
//! presence set kept in sync with the server, and a pluggable transport.
//!
//! # Overview
//!
//! - **Channels**: a [`channel::RealtimeChannel`] couples the channel
//!   lifecycle state machine with its presence set and routes inbound
//!   protocol frames to both.
//! - **Presence**: [`presence::RealtimePresence`] tracks who is announced
//!   on a channel, synchronizes with the server through the multi-message
//!   SYNC protocol, dispatches presence events to subscribers, and
//!   publishes enter/update/leave actions for the local endpoint.
//! - **Transport**: the [`channel::Transport`] trait is the seam to the
//!   wire; acknowledgements flow back inbound as protocol frames.
//!
//! # Quick start
//!
//! ```ignore
//! use ripple::prelude::*;
//!
//! let channel = RealtimeChannel::new(
//!     ChannelOptions::new("rooms:lobby").client_id("alice"),
//!     transport,
//! );
//!
//! // Announce ourselves and watch who else is here.
//! channel.presence.enter(None).await?;
//! let members = channel.presence.get().await?;
//! ```

#![deny(missing_docs)]

/// Client-side realtime channels and the transport seam.
pub mod channel;

/// Generic multi-key event emitter.
pub mod emitter;

/// Error type and protocol error codes.
pub mod error;

/// Presence tracking for realtime channels.
pub mod presence;

/// Wire data model for the realtime protocol.
pub mod proto;

pub use channel::{
    ChannelCore, ChannelEvent, ChannelOptions, ChannelState, ChannelStateChange, RealtimeChannel,
    Transport,
};
pub use emitter::{EventEmitter, Subscription};
pub use error::{codes, ErrorInfo};
pub use presence::{PresenceGetOptions, RealtimePresence, SyncState};
pub use proto::{Flags, PresenceAction, PresenceMessage, ProtocolAction, ProtocolMessage};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ripple::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{
        ChannelEvent, ChannelOptions, ChannelState, ChannelStateChange, RealtimeChannel, Transport,
    };
    pub use crate::emitter::Subscription;
    pub use crate::error::{codes, ErrorInfo};
    pub use crate::presence::{PresenceGetOptions, RealtimePresence};
    pub use crate::proto::{
        Flags, PresenceAction, PresenceMessage, ProtocolAction, ProtocolMessage,
    };
}
