//! Client-side realtime channels.
//!
//! A [`RealtimeChannel`] is the client's view of a named pub/sub topic. It
//! couples the channel lifecycle state machine ([`ChannelCore`]) with the
//! channel's presence set ([`RealtimePresence`]), and routes inbound
//! protocol frames to both.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Transport                             │
//! │   (WebSocket, TCP, in-memory test double)                   │
//! │                                                             │
//! │   - Delivers outbound frames to the server                  │
//! │   - Inbound frames are fed to RealtimeChannel::handle_frame │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RealtimeChannel                          │
//! │                                                             │
//! │   - Routes Attached/Detached/Error to the state machine     │
//! │   - Routes Presence/Sync to the presence subsystem          │
//! │   - Resolves Ack/Nack against the pending-send queue        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The channel core owns the pending-send queue: every outbound frame that
//! expects an acknowledgement occupies one slot, and `Ack`/`Nack` frames
//! resolve slots oldest-first. When the channel detaches, fails or is
//! suspended, all queued sends are failed at once.

use crate::emitter::{EventEmitter, Subscription};
use crate::error::{codes, ErrorInfo};
use crate::presence::RealtimePresence;
use crate::proto::{Flags, ProtocolAction, ProtocolMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};

// =============================================================================
// Channel state
// =============================================================================

/// Lifecycle state of a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// The channel has been created but never attached.
    Initialized,
    /// An attach has been requested and is awaiting confirmation.
    Attaching,
    /// The channel is attached; messages and presence flow.
    Attached,
    /// A detach has been requested and is awaiting confirmation.
    Detaching,
    /// The channel is detached.
    Detached,
    /// The connection is suspended; the channel will reattach when it
    /// recovers.
    Suspended,
    /// The channel failed and will not recover without an explicit attach.
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Event key for channel notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// The channel transitioned into the given state.
    StateChanged(ChannelState),
    /// The channel stayed in its state but its conditions changed, e.g.
    /// an automatic presence re-entry failed after a resumed attach.
    Update,
}

/// A channel state-change or update notification.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    /// State after the transition.
    pub current: ChannelState,
    /// State before the transition.
    pub previous: ChannelState,
    /// The event that produced this notification.
    pub event: ChannelEvent,
    /// The error that caused the transition, if any.
    pub reason: Option<ErrorInfo>,
    /// True if the attach resumed an existing session.
    pub resumed: bool,
}

// =============================================================================
// Transport
// =============================================================================

/// Outbound frame sink backing a channel.
///
/// Implementations deliver frames to the server. Acknowledgements are not
/// part of this trait; they flow back inbound as `Ack`/`Nack` frames through
/// [`RealtimeChannel::handle_frame`]. An error from [`Transport::send`]
/// means the frame never left the client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery.
    async fn send(&self, msg: ProtocolMessage) -> Result<(), ErrorInfo>;
}

/// Receiver resolved exactly once with the acknowledgement outcome of a
/// queued send.
pub(crate) type AckWaiter = oneshot::Receiver<Result<(), ErrorInfo>>;

#[derive(Default)]
struct PendingQueue {
    waiting: Mutex<Waiting>,
}

#[derive(Default)]
struct Waiting {
    next_id: u64,
    entries: VecDeque<(u64, oneshot::Sender<Result<(), ErrorInfo>>)>,
}

impl PendingQueue {
    /// Register a waiter, returning its id so a failed handoff to the
    /// transport can withdraw it.
    fn push(&self, tx: oneshot::Sender<Result<(), ErrorInfo>>) -> u64 {
        let mut waiting = self.waiting.lock().unwrap();
        let id = waiting.next_id;
        waiting.next_id += 1;
        waiting.entries.push_back((id, tx));
        id
    }

    /// Drop the waiter registered under `id`, if it is still queued.
    fn withdraw(&self, id: u64) {
        let mut waiting = self.waiting.lock().unwrap();
        waiting.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Resolve up to `count` queued sends, oldest first.
    fn resolve(&self, count: usize, result: Result<(), ErrorInfo>) {
        let mut waiting = self.waiting.lock().unwrap();
        for _ in 0..count {
            match waiting.entries.pop_front() {
                // A closed receiver means the caller stopped waiting.
                Some((_, tx)) => {
                    let _ = tx.send(result.clone());
                }
                None => break,
            }
        }
    }

    fn fail_all(&self, err: &ErrorInfo) {
        let mut waiting = self.waiting.lock().unwrap();
        for (_, tx) in waiting.entries.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

// =============================================================================
// Channel core
// =============================================================================

/// Configuration for creating a realtime channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Channel name.
    pub name: String,
    /// Authenticated client identity, if the credentials carry one.
    pub client_id: Option<String>,
}

impl ChannelOptions {
    /// Create options for the named channel.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_id: None,
        }
    }

    /// Set the authenticated client identity.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// The channel state machine surface consumed by the presence subsystem.
///
/// Holds the channel's lifecycle state, the transport handle, the
/// pending-send queue and the channel-level emitters. The presence
/// subsystem keeps a non-owning reference to its core; the core never
/// points back at presence.
pub struct ChannelCore {
    name: String,
    client_id: Option<String>,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ChannelState>,
    connection_id: Mutex<String>,
    queue: PendingQueue,
    state_emitter: EventEmitter<ChannelEvent, ChannelStateChange>,
    error_emitter: EventEmitter<(), ErrorInfo>,
}

impl ChannelCore {
    fn new(options: ChannelOptions, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Initialized);
        Arc::new(Self {
            name: options.name,
            client_id: options.client_id,
            transport,
            state_tx,
            connection_id: Mutex::new(String::new()),
            queue: PendingQueue::default(),
            state_emitter: EventEmitter::new(),
            error_emitter: EventEmitter::new(),
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The authenticated client identity, if any.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Identifier of the current transport connection. Changes across
    /// reconnects.
    pub fn connection_id(&self) -> String {
        self.connection_id.lock().unwrap().clone()
    }

    pub(crate) fn set_connection_id(&self, id: impl Into<String>) {
        *self.connection_id.lock().unwrap() = id.into();
    }

    /// Register a handler for the given channel event.
    pub fn on(
        &self,
        event: ChannelEvent,
        handler: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.state_emitter.on(event, handler)
    }

    /// Register a handler for non-fatal errors surfaced by the channel,
    /// such as presence message-id parse failures.
    pub fn on_error(&self, handler: impl Fn(&ErrorInfo) + Send + Sync + 'static) -> Subscription {
        self.error_emitter.on((), handler)
    }

    /// Attach the channel, idempotently.
    ///
    /// Resolves once the channel reaches `Attached`, or with an error when
    /// the attempt settles in any other terminal state. Dropping the future
    /// abandons the wait but not the attach itself; the channel may still
    /// become attached afterwards.
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        let mut state_rx = self.state_tx.subscribe();
        let state = *state_rx.borrow_and_update();
        match state {
            ChannelState::Attached => return Ok(()),
            ChannelState::Initialized
            | ChannelState::Detached
            | ChannelState::Suspended
            | ChannelState::Failed => self.start_attach().await?,
            ChannelState::Attaching | ChannelState::Detaching => {}
        }

        let settled = state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    ChannelState::Attached
                        | ChannelState::Detached
                        | ChannelState::Suspended
                        | ChannelState::Failed
                )
            })
            .await
            .map(|state| *state);
        match settled {
            Ok(ChannelState::Attached) => Ok(()),
            Ok(state) => Err(ErrorInfo::new(
                codes::CHANNEL_OPERATION_FAILED,
                format!("attach failed (channel state: {state})"),
            )),
            // The sender lives on self; closure means the channel was
            // dropped out from under the waiter.
            Err(_) => Err(ErrorInfo::new(
                codes::CHANNEL_OPERATION_FAILED,
                "channel dropped while attaching",
            )),
        }
    }

    /// Begin an attach without waiting for it to settle.
    pub(crate) async fn start_attach(&self) -> Result<(), ErrorInfo> {
        self.set_state(ChannelState::Attaching, None, false);
        let frame = ProtocolMessage::new(ProtocolAction::Attach, &self.name);
        self.transport.send(frame).await
    }

    fn set_state(&self, next: ChannelState, reason: Option<ErrorInfo>, resumed: bool) {
        let previous = self.state_tx.send_replace(next);
        if previous == next {
            return;
        }
        tracing::debug!(
            channel = %self.name,
            previous = %previous,
            current = %next,
            "channel state changed"
        );
        let change = ChannelStateChange {
            current: next,
            previous,
            event: ChannelEvent::StateChanged(next),
            reason,
            resumed,
        };
        self.state_emitter.emit(&change.event, &change);
    }

    /// Emit a channel `Update` notification without changing state.
    pub(crate) fn emit_update(&self, reason: ErrorInfo, resumed: bool) {
        let current = self.state();
        let change = ChannelStateChange {
            current,
            previous: current,
            event: ChannelEvent::Update,
            reason: Some(reason),
            resumed,
        };
        self.state_emitter.emit(&ChannelEvent::Update, &change);
    }

    /// Surface a non-fatal error to error listeners.
    pub(crate) fn emit_error(&self, err: ErrorInfo) {
        tracing::warn!(channel = %self.name, code = err.code, error = %err, "non-fatal channel error");
        self.error_emitter.emit(&(), &err);
    }

    /// Send a frame that expects an acknowledgement. The returned waiter
    /// resolves exactly once with the ack outcome.
    ///
    /// The waiter is queued before the frame reaches the transport, so an
    /// acknowledgement arriving on another task cannot race past it.
    pub(crate) async fn send_with_ack(&self, msg: ProtocolMessage) -> Result<AckWaiter, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        let id = self.queue.push(tx);
        if let Err(err) = self.transport.send(msg).await {
            // The frame never left the client; its slot must not consume a
            // future acknowledgement.
            self.queue.withdraw(id);
            return Err(err);
        }
        Ok(rx)
    }

    /// Fail every queued send with `err`.
    pub(crate) fn fail_queued(&self, err: &ErrorInfo) {
        self.queue.fail_all(err);
    }
}

// =============================================================================
// Realtime channel
// =============================================================================

/// A realtime channel: the lifecycle core plus its presence set.
pub struct RealtimeChannel {
    core: Arc<ChannelCore>,
    /// Presence set of this channel.
    pub presence: Arc<RealtimePresence>,
}

impl RealtimeChannel {
    /// Create a channel bound to the given transport.
    pub fn new(options: ChannelOptions, transport: Arc<dyn Transport>) -> Self {
        let core = ChannelCore::new(options, transport);
        let presence = RealtimePresence::new(Arc::clone(&core));
        Self { core, presence }
    }

    /// The channel core.
    pub fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    /// Attach the channel. See [`ChannelCore::attach`].
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        self.core.attach().await
    }

    /// Update the connection id after the transport (re)connects.
    pub fn set_connection_id(&self, id: impl Into<String>) {
        self.core.set_connection_id(id);
    }

    /// Notify the channel that its connection was suspended. Queued sends
    /// fail; internally tracked presence members are preserved so they can
    /// re-enter on the next fresh attach.
    pub fn notify_suspended(&self, err: ErrorInfo) {
        self.core.set_state(ChannelState::Suspended, Some(err.clone()), false);
        self.presence.on_suspended(err);
    }

    /// Route an inbound protocol frame to the channel.
    ///
    /// Must be called from within a tokio runtime: a fresh attach may spawn
    /// presence re-entry tasks.
    pub fn handle_frame(&self, msg: ProtocolMessage) {
        match msg.action {
            ProtocolAction::Attached => {
                let resumed = msg.flags.has(Flags::RESUMED);
                self.core.set_state(ChannelState::Attached, None, resumed);
                self.presence.clone().on_attach(&msg, !resumed);
            }
            ProtocolAction::Detached => {
                let err = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, "channel detached")
                });
                self.core
                    .set_state(ChannelState::Detached, Some(err.clone()), false);
                self.presence.on_detached_or_failed(err);
            }
            ProtocolAction::Error => {
                let err = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, "channel failed")
                });
                self.core
                    .set_state(ChannelState::Failed, Some(err.clone()), false);
                self.presence.on_detached_or_failed(err);
            }
            ProtocolAction::Presence => {
                self.presence.process_incoming(&msg, "");
            }
            ProtocolAction::Sync => {
                let serial = msg.sync_serial().to_string();
                self.presence.process_incoming(&msg, &serial);
            }
            ProtocolAction::Ack => {
                self.core.queue.resolve(msg.count.max(1), Ok(()));
            }
            ProtocolAction::Nack => {
                let err = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, "send rejected")
                });
                self.core.queue.resolve(msg.count.max(1), Err(err));
            }
            ProtocolAction::Attach | ProtocolAction::Detach => {
                tracing::debug!(
                    channel = %self.core.name,
                    action = ?msg.action,
                    "ignoring outbound-only frame"
                );
            }
        }
    }
}
