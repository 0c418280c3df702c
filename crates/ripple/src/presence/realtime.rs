//! The presence set of a realtime channel.

use super::map::{add_member, member_key, remove_member};
use super::sync::{SyncGate, SyncState};
use crate::channel::{ChannelCore, ChannelState};
use crate::emitter::{EventEmitter, Subscription};
use crate::error::{codes, ErrorInfo};
use crate::proto::{unix_millis, Flags, PresenceAction, PresenceMessage, ProtocolAction, ProtocolMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Options for [`RealtimePresence::get_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct PresenceGetOptions {
    wait_for_sync: bool,
}

impl Default for PresenceGetOptions {
    fn default() -> Self {
        Self { wait_for_sync: true }
    }
}

impl PresenceGetOptions {
    /// Whether to wait for an in-flight presence sync to complete before
    /// returning. Defaults to `true`; pass `false` to return the current
    /// member list immediately after the channel attaches.
    pub fn wait_for_sync(mut self, wait: bool) -> Self {
        self.wait_for_sync = wait;
        self
    }
}

/// Mutable presence state. Everything here is guarded by one mutex, which
/// is never held across an await point, an event emission or a transport
/// call.
struct PresenceState {
    /// Server-synced member set, keyed by connection id + client id.
    /// Stored entries carry action `Present`, or `Absent` for tombstones
    /// left behind by leaves; tombstones are invisible to queries and are
    /// dropped at sync end.
    members: HashMap<String, PresenceMessage>,
    /// Locally originated members, keyed by client id alone. Preserved
    /// across reconnects to drive automatic re-entry.
    internal_members: HashMap<String, PresenceMessage>,
    /// Members believed present at sync start and not yet reaffirmed.
    /// Whatever remains at sync end is treated as having silently left.
    residual: HashMap<String, PresenceMessage>,
    sync_state: SyncState,
    /// Sync cursor of the in-progress sync sequence.
    sync_serial: String,
    /// The local identity's last announced action.
    local_action: PresenceAction,
    /// The local identity's last announced payload.
    local_data: Option<Value>,
}

/// Presence map of a single realtime channel.
///
/// Tracks the members announced as present on the channel, keeps the set
/// synchronized with the server via the multi-message SYNC protocol, and
/// publishes the local endpoint's presence actions. Owned by its channel;
/// holds a non-owning reference upward.
///
/// # Example
///
/// ```ignore
/// let channel = RealtimeChannel::new(
///     ChannelOptions::new("rooms:lobby").client_id("alice"),
///     transport,
/// );
///
/// channel.presence.enter(Some(json!({"status": "online"}))).await?;
///
/// for member in channel.presence.get().await? {
///     println!("{} is present", member.client_id);
/// }
/// ```
pub struct RealtimePresence {
    channel: Arc<ChannelCore>,
    emitter: EventEmitter<PresenceAction, PresenceMessage>,
    state: Mutex<PresenceState>,
    gate: SyncGate,
}

impl RealtimePresence {
    pub(crate) fn new(channel: Arc<ChannelCore>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            emitter: EventEmitter::new(),
            state: Mutex::new(PresenceState {
                members: HashMap::new(),
                internal_members: HashMap::new(),
                residual: HashMap::new(),
                sync_state: SyncState::Initial,
                sync_serial: String::new(),
                local_action: PresenceAction::Absent,
                local_data: None,
            }),
            // Held from construction: Get(wait_for_sync) callers block until
            // the channel attaches and its first sync settles.
            gate: SyncGate::new(),
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// True once the initial SYNC has completed for the members present on
    /// the channel.
    pub fn sync_complete(&self) -> bool {
        self.state.lock().unwrap().sync_state == SyncState::Complete
    }

    /// Retrieve the members currently present on the channel.
    ///
    /// Implicitly attaches the channel and waits for the presence sync to
    /// complete, so the returned snapshot is consistent with the server
    /// view. Dropping the future abandons the wait; the attach carries on
    /// in the background and the channel may eventually attach anyway.
    pub async fn get(&self) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        self.get_with_options(PresenceGetOptions::default()).await
    }

    /// [`RealtimePresence::get`] with options.
    pub async fn get_with_options(
        &self,
        options: PresenceGetOptions,
    ) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        self.channel.attach().await?;
        if options.wait_for_sync {
            self.gate.wait().await;
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .members
            .values()
            .filter(|member| member.action != PresenceAction::Absent)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler called for each received presence message whose
    /// action matches `action`, then attach the channel.
    ///
    /// The handler is registered before the attach begins, so any event
    /// delivered after registration reaches it. If the attach fails the
    /// handler is deregistered and the error returned.
    pub async fn subscribe(
        &self,
        action: PresenceAction,
        handler: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> Result<Subscription, ErrorInfo> {
        let subscription = self.emitter.on(action, handler);
        match self.channel.attach().await {
            Ok(()) => Ok(subscription),
            Err(err) => {
                subscription.unsubscribe();
                Err(err)
            }
        }
    }

    /// Register a handler called for every received presence message, then
    /// attach the channel. See [`RealtimePresence::subscribe`].
    pub async fn subscribe_all(
        &self,
        handler: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> Result<Subscription, ErrorInfo> {
        let subscription = self.emitter.on_all(handler);
        match self.channel.attach().await {
            Ok(()) => Ok(subscription),
            Err(err) => {
                subscription.unsubscribe();
                Err(err)
            }
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Announce the authenticated client as present, with an optional
    /// payload.
    ///
    /// Fails with code 91000 when the connection has no client id, and with
    /// 91001 when the channel state cannot carry presence. Dropping the
    /// future abandons the wait for acknowledgement but does not revoke the
    /// send; the server may still process it.
    pub async fn enter(&self, data: Option<Value>) -> Result<(), ErrorInfo> {
        let client_id = self.authed_client_id()?;
        self.enter_client_with_id(client_id, data, String::new())
            .await
    }

    /// Announce an updated payload for the authenticated client. If the
    /// client has not entered the presence set yet this behaves as
    /// [`RealtimePresence::enter`].
    ///
    /// Cancellation semantics as [`RealtimePresence::enter`].
    pub async fn update(&self, data: Option<Value>) -> Result<(), ErrorInfo> {
        let client_id = self.authed_client_id()?;
        self.update_client(&client_id, data).await
    }

    /// Announce the authenticated client leaving the channel, with an
    /// optional payload.
    ///
    /// Cancellation semantics as [`RealtimePresence::enter`].
    pub async fn leave(&self, data: Option<Value>) -> Result<(), ErrorInfo> {
        let client_id = self.authed_client_id()?;
        self.leave_client(&client_id, data).await
    }

    /// Announce presence of an explicit `client_id`, letting a single
    /// connection publish presence on behalf of any number of clients.
    pub async fn enter_client(
        &self,
        client_id: &str,
        data: Option<Value>,
    ) -> Result<(), ErrorInfo> {
        self.enter_client_with_id(client_id.to_string(), data, String::new())
            .await
    }

    /// Announce an updated payload for an explicit `client_id`. Behaves as
    /// [`RealtimePresence::enter_client`] when the local endpoint has not
    /// entered yet.
    pub async fn update_client(
        &self,
        client_id: &str,
        data: Option<Value>,
    ) -> Result<(), ErrorInfo> {
        let enter_fallback = {
            let mut state = self.state.lock().unwrap();
            if state.local_action == PresenceAction::Enter {
                state.local_data = data.clone();
                None
            } else {
                // Update before enter degenerates to enter, reusing the
                // previously cached payload when none is given.
                Some(state.local_data.clone())
            }
        };
        if let Some(old_data) = enter_fallback {
            return self
                .enter_client_with_id(client_id.to_string(), data.or(old_data), String::new())
                .await;
        }

        let msg = PresenceMessage {
            action: PresenceAction::Update,
            client_id: client_id.to_string(),
            data,
            ..Default::default()
        };
        self.send_presence(msg).await
    }

    /// Announce an explicit `client_id` leaving the channel.
    pub async fn leave_client(
        &self,
        client_id: &str,
        data: Option<Value>,
    ) -> Result<(), ErrorInfo> {
        {
            let mut state = self.state.lock().unwrap();
            if state.local_data.is_none() {
                state.local_data = data.clone();
            }
        }
        let msg = PresenceMessage {
            action: PresenceAction::Leave,
            client_id: client_id.to_string(),
            data,
            ..Default::default()
        };
        self.send_presence(msg).await
    }

    /// Enter with an explicit message id, used when replaying internal
    /// members after a fresh attach so the server can de-duplicate
    /// retries.
    async fn enter_client_with_id(
        &self,
        client_id: String,
        data: Option<Value>,
        msg_id: String,
    ) -> Result<(), ErrorInfo> {
        {
            let mut state = self.state.lock().unwrap();
            state.local_action = PresenceAction::Enter;
            state.local_data = data.clone();
        }
        let msg = PresenceMessage {
            id: msg_id,
            action: PresenceAction::Enter,
            client_id,
            data,
            ..Default::default()
        };
        self.send_presence(msg).await
    }

    fn authed_client_id(&self) -> Result<String, ErrorInfo> {
        match self.channel.client_id() {
            Some(client_id) if !client_id.is_empty() => Ok(client_id.to_string()),
            _ => Err(ErrorInfo::new(
                codes::PRESENCE_NO_CLIENT_ID,
                "unable to enter presence channel (no client id)",
            )),
        }
    }

    fn verify_channel_state(&self) -> Result<(), ErrorInfo> {
        match self.channel.state() {
            state @ (ChannelState::Detaching
            | ChannelState::Detached
            | ChannelState::Failed
            | ChannelState::Suspended) => Err(ErrorInfo::new(
                codes::PRESENCE_BAD_CHANNEL_STATE,
                format!("unable to enter presence channel (invalid channel state: {state})"),
            )),
            _ => Ok(()),
        }
    }

    async fn send_presence(&self, msg: PresenceMessage) -> Result<(), ErrorInfo> {
        self.verify_channel_state()?;
        if self.channel.state() == ChannelState::Initialized {
            self.channel.start_attach().await?;
        }
        let frame = ProtocolMessage::new(ProtocolAction::Presence, self.channel.name())
            .with_presence(vec![msg]);
        let ack = self.channel.send_with_ack(frame).await?;
        match ack.await {
            Ok(result) => result,
            Err(_) => Err(ErrorInfo::new(
                codes::CHANNEL_OPERATION_FAILED,
                "connection closed before acknowledgement",
            )),
        }
    }

    // =========================================================================
    // Sync controller
    // =========================================================================

    fn sync_start(&self, state: &mut PresenceState, serial: &str) {
        match state.sync_state {
            SyncState::InProgress => return,
            // Re-entering a sync after completion blocks waiters again; on
            // the channel's initial sync they are blocked already.
            SyncState::Complete => self.gate.hold(),
            SyncState::Initial => {}
        }
        tracing::debug!(
            channel = %self.channel.name(),
            serial = %serial,
            previous_serial = %state.sync_serial,
            members = state.members.len(),
            "presence sync started"
        );
        state.sync_serial = serial.to_string();
        state.sync_state = SyncState::InProgress;
        state.residual = state.members.clone();
    }

    /// End the in-progress sync. Returns the synthetic leave notifications
    /// for members that were never reaffirmed, to be emitted after the
    /// state lock is released.
    fn sync_end(&self, state: &mut PresenceState) -> Vec<PresenceMessage> {
        if state.sync_state != SyncState::InProgress {
            return Vec::new();
        }
        let residual = std::mem::take(&mut state.residual);
        let leaves = Self::leave_members(state, residual);
        state
            .members
            .retain(|_, member| member.action != PresenceAction::Absent);
        state.sync_state = SyncState::Complete;
        self.gate.release();
        tracing::debug!(
            channel = %self.channel.name(),
            members = state.members.len(),
            left = leaves.len(),
            "presence sync complete"
        );
        leaves
    }

    /// Remove `members` from the member set and turn them into synthetic
    /// leave notifications: action `Leave`, id cleared, timestamp now.
    /// Tombstones are removed but produce no notification; those members
    /// already left.
    fn leave_members(
        state: &mut PresenceState,
        members: HashMap<String, PresenceMessage>,
    ) -> Vec<PresenceMessage> {
        let now = unix_millis();
        let mut leaves = Vec::with_capacity(members.len());
        for (key, mut member) in members {
            state.members.remove(&key);
            if member.action == PresenceAction::Absent {
                continue;
            }
            member.action = PresenceAction::Leave;
            member.id = String::new();
            member.timestamp = now;
            leaves.push(member);
        }
        leaves
    }

    // =========================================================================
    // Inbound processing
    // =========================================================================

    /// Apply an inbound `Presence` or `Sync` frame.
    ///
    /// `sync_serial` is the frame's sync cursor: nonempty for sync
    /// continuation frames, empty for plain presence frames and for the
    /// sync terminator. Events are emitted after the state lock is
    /// released, in wire order, filtered to entries that changed the
    /// member set, each carrying its original action.
    pub(crate) fn process_incoming(&self, proto: &ProtocolMessage, sync_serial: &str) {
        let mut entries = proto.presence.clone();
        for entry in &mut entries {
            if entry.timestamp == 0 {
                entry.timestamp = proto.timestamp;
            }
        }
        let connection_id = self.channel.connection_id();

        let mut updated_entries = Vec::with_capacity(entries.len());
        let mut residual_leaves = Vec::new();
        let mut errors = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !sync_serial.is_empty() {
                self.sync_start(&mut state, sync_serial);
            }

            // Internal member set: only entries originated by this
            // connection, keyed by client id alone.
            for entry in &entries {
                if entry.connection_id != connection_id {
                    continue;
                }
                match entry.action {
                    PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                        let mut stored = entry.clone();
                        stored.action = PresenceAction::Present;
                        let (_, err) =
                            add_member(&mut state.internal_members, &entry.client_id, stored);
                        errors.extend(err);
                    }
                    PresenceAction::Leave => {
                        // Leaves the server synthesized on its own must not
                        // wipe local intent; the member re-enters on the
                        // next fresh attach.
                        if !entry.is_server_synthesized() {
                            let (_, err) = remove_member(
                                &mut state.internal_members,
                                &entry.client_id,
                                entry,
                                false,
                            );
                            errors.extend(err);
                        }
                    }
                    PresenceAction::Absent => {}
                }
            }

            // Public member set.
            for entry in &entries {
                let key = member_key(entry);
                let updated = match entry.action {
                    PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                        state.residual.remove(&key);
                        let mut stored = entry.clone();
                        stored.action = PresenceAction::Present;
                        let (updated, err) = add_member(&mut state.members, &key, stored);
                        errors.extend(err);
                        updated
                    }
                    PresenceAction::Leave => {
                        let (updated, err) = remove_member(&mut state.members, &key, entry, true);
                        errors.extend(err);
                        updated
                    }
                    PresenceAction::Absent => false,
                };
                if updated {
                    updated_entries.push(entry.clone());
                }
            }

            if sync_serial.is_empty() {
                residual_leaves = self.sync_end(&mut state);
            }
        }

        for err in errors {
            self.channel.emit_error(err);
        }
        for leave in &residual_leaves {
            self.emitter.emit(&PresenceAction::Leave, leave);
        }
        for entry in &updated_entries {
            self.emitter.emit(&entry.action, entry);
        }
    }

    // =========================================================================
    // Lifecycle hooks
    // =========================================================================

    /// Handle the channel becoming attached.
    ///
    /// On a fresh (non-resumed) attach, every internal member re-enters
    /// with its preserved message id; a failed re-entry is non-fatal and
    /// surfaces as a channel `Update` notification with reason 91004. Then
    /// either a sync starts (attach carries the presence flag) or every
    /// known member is synthesized as having left.
    pub(crate) fn on_attach(self: Arc<Self>, proto: &ProtocolMessage, is_new_attach: bool) {
        let serial = proto.sync_serial().to_string();
        let mut reentries = Vec::new();
        let mut leaves = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if is_new_attach {
                reentries = state.internal_members.values().cloned().collect();
            }
            if proto.flags.has(Flags::HAS_PRESENCE) {
                self.sync_start(&mut state, &serial);
            } else {
                // No presence on the channel: everything we knew has left.
                let members = state.members.clone();
                leaves = Self::leave_members(&mut state, members);
                if state.sync_state == SyncState::Initial {
                    state.sync_state = SyncState::Complete;
                    self.gate.release();
                }
            }
        }

        for leave in &leaves {
            self.emitter.emit(&PresenceAction::Leave, leave);
        }

        for member in reentries {
            let presence = Arc::clone(&self);
            tokio::spawn(async move {
                let result = presence
                    .enter_client_with_id(
                        member.client_id.clone(),
                        member.data.clone(),
                        member.id.clone(),
                    )
                    .await;
                if let Err(err) = result {
                    tracing::error!(
                        client_id = %member.client_id,
                        id = %member.id,
                        error = %err,
                        "automatic presence re-entry failed"
                    );
                    presence.channel.emit_update(
                        ErrorInfo::new(
                            codes::PRESENCE_REENTRY_FAILED,
                            format!(
                                "unable to re-enter presence channel for {}: {}",
                                member.client_id, err
                            ),
                        ),
                        true,
                    );
                }
            });
        }
    }

    /// Handle the channel detaching or failing: the presence set is gone
    /// and queued sends cannot complete.
    pub(crate) fn on_detached_or_failed(&self, err: ErrorInfo) {
        {
            let mut state = self.state.lock().unwrap();
            state.members.clear();
            state.internal_members.clear();
        }
        self.channel.fail_queued(&err);
    }

    /// Handle the connection being suspended. Queued sends fail, but the
    /// internal member set is preserved so it can replay on the next fresh
    /// attach.
    pub(crate) fn on_suspended(&self, err: ErrorInfo) {
        self.channel.fail_queued(&err);
    }
}
