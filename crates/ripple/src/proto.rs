//! Wire data model for the realtime protocol.
//!
//! A connection exchanges [`ProtocolMessage`] frames with the server. Frames
//! addressed to a channel carry zero or more [`PresenceMessage`] entries,
//! which are the atomic units of presence state.
//!
//! Presence entries are ordered by their server-assigned message id of the
//! form `<connectionId>:<msgSerial>:<index>`; see
//! [`PresenceMessage::is_newer_than`].

use crate::error::{codes, ErrorInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

// =============================================================================
// Frame-level types
// =============================================================================

/// Action of a protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolAction {
    /// Client requests channel attachment.
    Attach,
    /// Server confirms channel attachment.
    Attached,
    /// Client requests channel detachment.
    Detach,
    /// Server confirms channel detachment.
    Detached,
    /// Presence state for a channel.
    Presence,
    /// One message of a presence SYNC sequence.
    Sync,
    /// Acknowledges queued sends, oldest first.
    Ack,
    /// Rejects queued sends, oldest first.
    Nack,
    /// A channel error; the channel moves to the failed state.
    Error,
}

/// Bit flags carried by a protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(u32);

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags(0);
    /// The attached channel has a presence set that will be synced.
    pub const HAS_PRESENCE: Flags = Flags(1 << 0);
    /// The attach resumed an existing session.
    pub const RESUMED: Flags = Flags(1 << 1);

    /// Returns true if every bit of `other` is set in `self`.
    pub fn has(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// A single protocol frame exchanged with the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// Frame action.
    pub action: ProtocolAction,
    /// Name of the channel the frame belongs to.
    #[serde(default)]
    pub channel: String,
    /// Channel serial. For SYNC frames the suffix after the first `:` is the
    /// sync cursor; an empty suffix terminates the sync sequence.
    #[serde(default)]
    pub channel_serial: String,
    /// Server timestamp in milliseconds; fills unset entry timestamps.
    #[serde(default)]
    pub timestamp: i64,
    /// Number of sends acknowledged by an `Ack`/`Nack` frame.
    #[serde(default)]
    pub count: usize,
    /// Frame flags.
    #[serde(default)]
    pub flags: Flags,
    /// Presence entries carried by `Presence` and `Sync` frames.
    #[serde(default)]
    pub presence: Vec<PresenceMessage>,
    /// Error details for `Nack`, `Detached` and `Error` frames.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl ProtocolMessage {
    /// Create an empty frame with the given action for a channel.
    pub fn new(action: ProtocolAction, channel: impl Into<String>) -> Self {
        Self {
            action,
            channel: channel.into(),
            channel_serial: String::new(),
            timestamp: 0,
            count: 0,
            flags: Flags::NONE,
            presence: Vec::new(),
            error: None,
        }
    }

    /// Set the channel serial.
    pub fn with_channel_serial(mut self, serial: impl Into<String>) -> Self {
        self.channel_serial = serial.into();
        self
    }

    /// Set the frame flags.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the frame timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the ack count.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Attach presence entries to the frame.
    pub fn with_presence(mut self, presence: Vec<PresenceMessage>) -> Self {
        self.presence = presence;
        self
    }

    /// Set the frame error.
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// The sync cursor portion of the channel serial: the substring after
    /// the first `:`. Empty means the frame terminates the sync sequence.
    pub fn sync_serial(&self) -> &str {
        match self.channel_serial.split_once(':') {
            Some((_, serial)) => serial,
            None => "",
        }
    }
}

// =============================================================================
// Presence entries
// =============================================================================

/// Action announced by a presence entry. Ordered by wire value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    /// The member is not present. Used for member-map tombstones left
    /// behind by leaves; never announced by clients.
    #[default]
    Absent,
    /// The member is present.
    Present,
    /// The member entered the presence set.
    Enter,
    /// The member left the presence set.
    Leave,
    /// The member updated its presence data.
    Update,
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        };
        f.write_str(name)
    }
}

/// The atomic unit of presence state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    /// Message identifier assigned by the server, of the form
    /// `<connectionId>:<msgSerial>:<index>`. Empty for locally constructed
    /// leave notifications.
    #[serde(default)]
    pub id: String,
    /// What this entry announces.
    #[serde(default)]
    pub action: PresenceAction,
    /// The identity the presence applies to.
    #[serde(default)]
    pub client_id: String,
    /// Identifier of the connection that originated the message.
    #[serde(default)]
    pub connection_id: String,
    /// Milliseconds since the epoch. `0` means unset; it is filled from the
    /// enclosing protocol frame on receipt.
    #[serde(default)]
    pub timestamp: i64,
    /// Opaque payload.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PresenceMessage {
    /// True if the server produced this message itself rather than relaying
    /// a client-originated one. Synthesized messages carry an id that is not
    /// prefixed by their connection id.
    pub fn is_server_synthesized(&self) -> bool {
        !self.id.starts_with(&self.connection_id)
    }

    /// Split the message id into its `(connectionId, msgSerial, index)`
    /// parts.
    fn parse_id(&self) -> Result<(&str, i64, i64), ErrorInfo> {
        let parts: Vec<&str> = self.id.split(':').collect();
        if parts.len() != 3 {
            return Err(ErrorInfo::new(
                codes::PRESENCE_BAD_MESSAGE_ID,
                format!("parsing presence message id \"{}\": expected <connectionId>:<msgSerial>:<index>", self.id),
            ));
        }
        let serial: i64 = parts[1].parse().map_err(|_| {
            ErrorInfo::new(
                codes::PRESENCE_BAD_MESSAGE_ID,
                format!("parsing presence message serial \"{}\"", parts[1]),
            )
        })?;
        let index: i64 = parts[2].parse().map_err(|_| {
            ErrorInfo::new(
                codes::PRESENCE_BAD_MESSAGE_ID,
                format!("parsing presence message index \"{}\"", parts[2]),
            )
        })?;
        Ok((parts[0], serial, index))
    }

    /// Decide whether `self` supersedes `other` for the same member.
    ///
    /// Ordering follows the server-assigned message id: `msgSerial` first,
    /// then `index`, compared as integers; equal ids are not newer. When
    /// either id is empty or malformed the comparison falls back to the
    /// timestamps and the parse failure is returned alongside the verdict.
    /// The error is advisory only and must not abort processing.
    pub fn is_newer_than(&self, other: &PresenceMessage) -> (bool, Option<ErrorInfo>) {
        match (self.parse_id(), other.parse_id()) {
            (Ok((_, serial_a, index_a)), Ok((_, serial_b, index_b))) => {
                if serial_a == serial_b {
                    (index_a > index_b, None)
                } else {
                    (serial_a > serial_b, None)
                }
            }
            (Err(err), _) | (_, Err(err)) => (self.timestamp > other.timestamp, Some(err)),
        }
    }
}
