//! End-to-end presence tests driven through a recording transport.
//!
//! The tests feed protocol frames to [`RealtimeChannel::handle_frame`] the
//! way a connection would, and observe the member set, the emitted events
//! and the frames the presence subsystem sends.

use async_trait::async_trait;
use ripple::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const CHANNEL: &str = "rooms:lobby";
const CONN_ID: &str = "local";

struct MockTransport {
    sent: Mutex<Vec<ProtocolMessage>>,
    reject: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
        })
    }

    fn sent_presence(&self) -> Vec<ProtocolMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.action == ProtocolAction::Presence)
            .cloned()
            .collect()
    }

    fn reject_sends(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, msg: ProtocolMessage) -> Result<(), ErrorInfo> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ErrorInfo::new(80003, "connection closed"));
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

fn new_channel(client_id: Option<&str>) -> (RealtimeChannel, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let mut options = ChannelOptions::new(CHANNEL);
    if let Some(client_id) = client_id {
        options = options.client_id(client_id);
    }
    let channel = RealtimeChannel::new(options, transport.clone());
    channel.set_connection_id(CONN_ID);
    (channel, transport)
}

fn entry(action: PresenceAction, connection_id: &str, client_id: &str, id: &str) -> PresenceMessage {
    PresenceMessage {
        id: id.to_string(),
        action,
        client_id: client_id.to_string(),
        connection_id: connection_id.to_string(),
        timestamp: 0,
        data: None,
    }
}

fn attached(flags: Flags, channel_serial: &str) -> ProtocolMessage {
    ProtocolMessage::new(ProtocolAction::Attached, CHANNEL)
        .with_flags(flags)
        .with_channel_serial(channel_serial)
}

fn sync(channel_serial: &str, presence: Vec<PresenceMessage>) -> ProtocolMessage {
    ProtocolMessage::new(ProtocolAction::Sync, CHANNEL)
        .with_channel_serial(channel_serial)
        .with_presence(presence)
        .with_timestamp(1_000)
}

fn presence_frame(presence: Vec<PresenceMessage>) -> ProtocolMessage {
    ProtocolMessage::new(ProtocolAction::Presence, CHANNEL)
        .with_presence(presence)
        .with_timestamp(1_000)
}

fn ack(count: usize) -> ProtocolMessage {
    ProtocolMessage::new(ProtocolAction::Ack, CHANNEL).with_count(count)
}

type Events = Arc<Mutex<Vec<PresenceMessage>>>;

async fn collect_all(presence: &RealtimePresence) -> Events {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    presence
        .subscribe_all(move |msg| sink.lock().unwrap().push(msg.clone()))
        .await
        .expect("subscribe_all");
    events
}

fn event_summary(events: &Events) -> Vec<(PresenceAction, String)> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|msg| (msg.action, msg.client_id.clone()))
        .collect()
}

// =============================================================================
// Sync protocol
// =============================================================================

#[tokio::test]
async fn fresh_attach_syncs_two_members() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:xyz"));
    let events = collect_all(&channel.presence).await;

    channel.handle_frame(sync(
        "abc:xyz",
        vec![
            entry(PresenceAction::Enter, "c1", "alice", "c1:1:0"),
            entry(PresenceAction::Enter, "c1", "bob", "c1:1:1"),
        ],
    ));
    assert!(!channel.presence.sync_complete());

    channel.handle_frame(sync("abc:", vec![]));
    assert!(channel.presence.sync_complete());

    let members = channel.presence.get().await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members
        .iter()
        .all(|member| member.action == PresenceAction::Present));

    assert_eq!(
        event_summary(&events),
        vec![
            (PresenceAction::Enter, "alice".to_string()),
            (PresenceAction::Enter, "bob".to_string()),
        ]
    );
}

#[tokio::test]
async fn member_missing_from_resync_is_synthesized_as_leave() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:s1"));
    channel.handle_frame(sync(
        "abc:s1",
        vec![
            entry(PresenceAction::Enter, "c1", "alice", "c1:1:0"),
            entry(PresenceAction::Enter, "c1", "bob", "c1:1:1"),
        ],
    ));
    channel.handle_frame(sync("abc:", vec![]));
    assert_eq!(channel.presence.get().await.unwrap().len(), 2);

    let events = collect_all(&channel.presence).await;

    // A new attach re-syncs, and the server only reaffirms alice.
    channel.handle_frame(attached(
        Flags::HAS_PRESENCE | Flags::RESUMED,
        "abc:s2",
    ));
    channel.handle_frame(sync(
        "abc:s2",
        vec![entry(PresenceAction::Enter, "c1", "alice", "c1:2:0")],
    ));
    channel.handle_frame(sync("abc:", vec![]));

    let members = channel.presence.get().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].client_id, "alice");

    let events = events.lock().unwrap();
    let leave = events
        .iter()
        .find(|msg| msg.action == PresenceAction::Leave)
        .expect("synthetic leave for bob");
    assert_eq!(leave.client_id, "bob");
    assert!(leave.id.is_empty());
    assert!(leave.timestamp > 0);
}

#[tokio::test]
async fn newer_leave_wins_and_stale_message_is_ignored() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:s1"));
    channel.handle_frame(sync(
        "abc:s1",
        vec![entry(PresenceAction::Enter, "c1", "alice", "c1:4:9")],
    ));
    channel.handle_frame(sync("abc:", vec![]));

    let events = collect_all(&channel.presence).await;

    channel.handle_frame(presence_frame(vec![entry(
        PresenceAction::Leave,
        "c1",
        "alice",
        "c1:5:0",
    )]));
    assert_eq!(
        event_summary(&events),
        vec![(PresenceAction::Leave, "alice".to_string())]
    );
    assert!(channel.presence.get().await.unwrap().is_empty());

    // A delayed message from before the leave must not resurrect the member.
    channel.handle_frame(presence_frame(vec![entry(
        PresenceAction::Present,
        "c1",
        "alice",
        "c1:3:0",
    )]));
    assert_eq!(events.lock().unwrap().len(), 1);
    assert!(channel.presence.get().await.unwrap().is_empty());
}

#[tokio::test]
async fn attach_without_presence_flag_drains_members() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:s1"));
    channel.handle_frame(sync(
        "abc:s1",
        vec![
            entry(PresenceAction::Enter, "c1", "alice", "c1:1:0"),
            entry(PresenceAction::Enter, "c1", "bob", "c1:1:1"),
        ],
    ));
    channel.handle_frame(sync("abc:", vec![]));

    let events = collect_all(&channel.presence).await;

    channel.handle_frame(attached(Flags::RESUMED, ""));

    let mut left: Vec<(PresenceAction, String)> = event_summary(&events);
    left.sort();
    assert_eq!(
        left,
        vec![
            (PresenceAction::Leave, "alice".to_string()),
            (PresenceAction::Leave, "bob".to_string()),
        ]
    );
    assert!(channel.presence.get().await.unwrap().is_empty());
}

#[tokio::test]
async fn get_blocks_until_attach_and_sync_complete() {
    let (channel, _transport) = new_channel(None);

    let presence = channel.presence.clone();
    let get_task = tokio::spawn(async move { presence.get().await });

    sleep(Duration::from_millis(50)).await;
    assert!(!get_task.is_finished());

    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:s1"));
    sleep(Duration::from_millis(50)).await;
    assert!(!get_task.is_finished());

    channel.handle_frame(sync(
        "abc:s1",
        vec![entry(PresenceAction::Enter, "c1", "alice", "c1:1:0")],
    ));
    channel.handle_frame(sync("abc:", vec![]));

    let members = timeout(Duration::from_secs(1), get_task)
        .await
        .expect("get should resolve once the sync completes")
        .unwrap()
        .unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].client_id, "alice");
}

#[tokio::test]
async fn cancelled_get_leaves_state_untouched() {
    let (channel, _transport) = new_channel(None);

    let cancelled = timeout(Duration::from_millis(50), channel.presence.get()).await;
    assert!(cancelled.is_err());
    assert!(!channel.presence.sync_complete());

    // The subsystem still works after the caller gave up.
    channel.handle_frame(attached(Flags::NONE, ""));
    assert!(channel.presence.sync_complete());
    assert!(channel.presence.get().await.unwrap().is_empty());
}

#[tokio::test]
async fn get_without_waiting_returns_partial_set() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:s1"));
    channel.handle_frame(sync(
        "abc:s1",
        vec![entry(PresenceAction::Enter, "c1", "alice", "c1:1:0")],
    ));

    // The sync never finishes, but the caller opted out of waiting.
    let members = channel
        .presence
        .get_with_options(PresenceGetOptions::default().wait_for_sync(false))
        .await
        .unwrap();
    assert_eq!(members.len(), 1);
    assert!(!channel.presence.sync_complete());
}

// =============================================================================
// Publishing
// =============================================================================

#[tokio::test]
async fn enter_sends_presence_frame_and_waits_for_ack() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));

    let presence = channel.presence.clone();
    let enter_task =
        tokio::spawn(async move { presence.enter(Some(json!({"status": "online"}))).await });

    sleep(Duration::from_millis(50)).await;
    assert!(!enter_task.is_finished());

    let frames = transport.sent_presence();
    assert_eq!(frames.len(), 1);
    let msg = &frames[0].presence[0];
    assert_eq!(msg.action, PresenceAction::Enter);
    assert_eq!(msg.client_id, "alice");
    assert_eq!(msg.data, Some(json!({"status": "online"})));

    channel.handle_frame(ack(1));
    timeout(Duration::from_secs(1), enter_task)
        .await
        .expect("enter should resolve on ack")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn enter_without_client_id_is_rejected() {
    let (channel, _transport) = new_channel(None);
    let err = channel.presence.enter(None).await.unwrap_err();
    assert_eq!(err.code, codes::PRESENCE_NO_CLIENT_ID);
}

#[tokio::test]
async fn presence_send_is_rejected_in_invalid_channel_states() {
    let (channel, _transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    channel.notify_suspended(ErrorInfo::new(80002, "connection suspended"));

    let err = channel.presence.enter(None).await.unwrap_err();
    assert_eq!(err.code, codes::PRESENCE_BAD_CHANNEL_STATE);
}

#[tokio::test]
async fn nack_propagates_to_the_caller() {
    let (channel, _transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));

    let presence = channel.presence.clone();
    let enter_task = tokio::spawn(async move { presence.enter(None).await });
    sleep(Duration::from_millis(20)).await;

    channel.handle_frame(
        ProtocolMessage::new(ProtocolAction::Nack, CHANNEL)
            .with_count(1)
            .with_error(ErrorInfo::new(40160, "permission denied")),
    );

    let err = timeout(Duration::from_secs(1), enter_task)
        .await
        .expect("enter should resolve on nack")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, 40160);
}

#[tokio::test]
async fn update_before_enter_degenerates_to_enter() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));

    let presence = channel.presence.clone();
    let update_task = tokio::spawn(async move { presence.update(Some(json!({"k": 2}))).await });
    sleep(Duration::from_millis(20)).await;
    channel.handle_frame(ack(1));
    update_task.await.unwrap().unwrap();

    let frames = transport.sent_presence();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].presence[0].action, PresenceAction::Enter);
    assert_eq!(frames[0].presence[0].data, Some(json!({"k": 2})));

    // The local endpoint is entered now, so a second update really updates.
    let presence = channel.presence.clone();
    let update_task = tokio::spawn(async move { presence.update(Some(json!({"k": 3}))).await });
    sleep(Duration::from_millis(20)).await;
    channel.handle_frame(ack(1));
    update_task.await.unwrap().unwrap();

    let frames = transport.sent_presence();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].presence[0].action, PresenceAction::Update);
}

#[tokio::test]
async fn leave_adopts_provided_data_when_none_cached() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));

    let presence = channel.presence.clone();
    let leave_task = tokio::spawn(async move { presence.leave(Some(json!("goodbye"))).await });
    sleep(Duration::from_millis(20)).await;
    channel.handle_frame(ack(1));
    leave_task.await.unwrap().unwrap();

    let frames = transport.sent_presence();
    assert_eq!(frames[0].presence[0].action, PresenceAction::Leave);
    assert_eq!(frames[0].presence[0].data, Some(json!("goodbye")));
}

#[tokio::test]
async fn enter_from_initialized_kicks_attach() {
    let (channel, transport) = new_channel(Some("alice"));

    let presence = channel.presence.clone();
    let enter_task = tokio::spawn(async move { presence.enter(None).await });
    sleep(Duration::from_millis(20)).await;

    let sent = transport.sent.lock().unwrap().clone();
    assert_eq!(sent[0].action, ProtocolAction::Attach);
    assert_eq!(sent[1].action, ProtocolAction::Presence);
    drop(sent);

    channel.handle_frame(attached(Flags::NONE, ""));
    channel.handle_frame(ack(1));
    timeout(Duration::from_secs(1), enter_task)
        .await
        .expect("enter should resolve once attached and acked")
        .unwrap()
        .unwrap();
}

// =============================================================================
// Internal members and re-entry
// =============================================================================

/// Drive a full enter + server echo so the internal member map holds the
/// local client with the given message id.
async fn enter_and_echo(channel: &RealtimeChannel, data: serde_json::Value, echo_id: &str) {
    let presence = channel.presence.clone();
    let data_clone = data.clone();
    let enter_task = tokio::spawn(async move { presence.enter(Some(data_clone)).await });
    sleep(Duration::from_millis(20)).await;
    channel.handle_frame(ack(1));
    enter_task.await.unwrap().unwrap();

    let mut echo = entry(PresenceAction::Enter, CONN_ID, "alice", echo_id);
    echo.data = Some(data);
    channel.handle_frame(presence_frame(vec![echo]));
}

#[tokio::test]
async fn internal_member_reenters_after_fresh_attach() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    // The connection drops and the channel reattaches without a resume.
    channel.handle_frame(attached(Flags::NONE, ""));
    sleep(Duration::from_millis(50)).await;

    let frames = transport.sent_presence();
    assert_eq!(frames.len(), 2, "exactly one re-entry per internal member");
    let reentry = &frames[1].presence[0];
    assert_eq!(reentry.action, PresenceAction::Enter);
    assert_eq!(reentry.client_id, "alice");
    assert_eq!(reentry.data, Some(json!({"k": 1})));
    assert_eq!(
        reentry.id, "local:5:0",
        "the preserved message id lets the server de-duplicate"
    );
}

#[tokio::test]
async fn failed_reentry_emits_channel_update_with_reason_91004() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    let updates: Arc<Mutex<Vec<ChannelStateChange>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let _sub = channel.core().on(ChannelEvent::Update, move |change| {
        sink.lock().unwrap().push(change.clone());
    });

    transport.reject_sends();
    channel.handle_frame(attached(Flags::NONE, ""));
    sleep(Duration::from_millis(50)).await;

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    let reason = updates[0].reason.as_ref().expect("update carries a reason");
    assert_eq!(reason.code, codes::PRESENCE_REENTRY_FAILED);
    assert!(updates[0].resumed);
}

#[tokio::test]
async fn resumed_attach_does_not_reenter() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    channel.handle_frame(attached(Flags::RESUMED, ""));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.sent_presence().len(), 1);
}

#[tokio::test]
async fn explicit_leave_clears_internal_member() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    // Leave, ack, and the server relays the client-originated leave back.
    let presence = channel.presence.clone();
    let leave_task = tokio::spawn(async move { presence.leave(None).await });
    sleep(Duration::from_millis(20)).await;
    channel.handle_frame(ack(1));
    leave_task.await.unwrap().unwrap();
    channel.handle_frame(presence_frame(vec![entry(
        PresenceAction::Leave,
        CONN_ID,
        "alice",
        "local:6:0",
    )]));

    // A fresh attach replays nothing: the round trip removed the member.
    channel.handle_frame(attached(Flags::NONE, ""));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_presence().len(), 2);
}

#[tokio::test]
async fn server_synthesized_leave_preserves_internal_member() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    // The server expires the member on its own: the leave's id is not
    // prefixed by the connection id.
    channel.handle_frame(presence_frame(vec![entry(
        PresenceAction::Leave,
        CONN_ID,
        "alice",
        "server:9:0",
    )]));
    assert!(channel.presence.get().await.unwrap().is_empty());

    // Local intent survives, so a fresh attach re-enters.
    channel.handle_frame(attached(Flags::NONE, ""));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_presence().len(), 2);
    assert_eq!(transport.sent_presence()[1].presence[0].client_id, "alice");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn detach_clears_both_maps() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::HAS_PRESENCE, "abc:s1"));
    channel.handle_frame(sync(
        "abc:s1",
        vec![entry(PresenceAction::Enter, "c1", "bob", "c1:1:0")],
    ));
    channel.handle_frame(sync("abc:", vec![]));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    let events = collect_all(&channel.presence).await;
    channel.handle_frame(ProtocolMessage::new(ProtocolAction::Detached, CHANNEL));

    // Reattach without presence: nothing to drain, nothing to replay.
    channel.handle_frame(attached(Flags::RESUMED, ""));
    sleep(Duration::from_millis(50)).await;
    assert!(events.lock().unwrap().is_empty());
    assert!(channel.presence.get().await.unwrap().is_empty());
    assert_eq!(transport.sent_presence().len(), 1);
}

#[tokio::test]
async fn suspension_fails_queued_sends_but_keeps_internal_members() {
    let (channel, transport) = new_channel(Some("alice"));
    channel.handle_frame(attached(Flags::NONE, ""));
    enter_and_echo(&channel, json!({"k": 1}), "local:5:0").await;

    // A second update is in flight when the connection suspends.
    let presence = channel.presence.clone();
    let update_task = tokio::spawn(async move { presence.update(Some(json!({"k": 2}))).await });
    sleep(Duration::from_millis(20)).await;

    channel.notify_suspended(ErrorInfo::new(80002, "connection suspended"));
    let err = timeout(Duration::from_secs(1), update_task)
        .await
        .expect("queued send should fail on suspension")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, 80002);

    // Recovery: a fresh attach still replays the internal member.
    channel.handle_frame(attached(Flags::NONE, ""));
    sleep(Duration::from_millis(50)).await;
    let frames = transport.sent_presence();
    let last = frames.last().unwrap();
    assert_eq!(last.presence[0].action, PresenceAction::Enter);
    assert_eq!(last.presence[0].id, "local:5:0");
}

#[tokio::test]
async fn subscription_handles_deregister() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::NONE, ""));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let sub = channel
        .presence
        .subscribe(PresenceAction::Enter, move |msg| {
            sink.lock().unwrap().push(msg.clone());
        })
        .await
        .unwrap();

    channel.handle_frame(presence_frame(vec![entry(
        PresenceAction::Enter,
        "c1",
        "alice",
        "c1:1:0",
    )]));
    assert_eq!(events.lock().unwrap().len(), 1);

    sub.unsubscribe();
    channel.handle_frame(presence_frame(vec![entry(
        PresenceAction::Enter,
        "c1",
        "bob",
        "c1:1:1",
    )]));
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn id_parse_failures_are_surfaced_and_processing_continues() {
    let (channel, _transport) = new_channel(None);
    channel.handle_frame(attached(Flags::NONE, ""));

    let errors: Arc<Mutex<Vec<ErrorInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let _sub = channel.core().on_error(move |err| {
        sink.lock().unwrap().push(err.clone());
    });

    let mut first = entry(PresenceAction::Enter, "c1", "alice", "not-an-id");
    first.timestamp = 100;
    channel.handle_frame(presence_frame(vec![first]));

    // Timestamp fallback: a later malformed message still supersedes.
    let mut second = entry(PresenceAction::Update, "c1", "alice", "also-bad");
    second.timestamp = 200;
    channel.handle_frame(presence_frame(vec![second]));

    assert_eq!(errors.lock().unwrap().len(), 1);
    let members = channel.presence.get().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].timestamp, 200);
}
