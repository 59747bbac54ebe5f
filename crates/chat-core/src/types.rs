use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric room identifier issued by the server.
pub type RoomId = u64;

/// Numeric user identifier issued by the server.
pub type UserId = u64;

/// Server-assigned, stable message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation token, unique per send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(String);

impl ClientToken {
    /// Generate a fresh token. The UUID suffix keeps tokens unique even when
    /// two sends share a millisecond.
    pub fn generate(now_ms: i64) -> Self {
        Self(format!("client-{now_ms}-{}", Uuid::new_v4().simple()))
    }

    /// Wrap a token echoed back by the server.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message category as carried in the `type` field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Regular user-authored chat message.
    #[default]
    #[serde(rename = "message")]
    UserMessage,
    /// Server-originated notice.
    #[serde(rename = "system")]
    SystemNotice,
    /// A user entered the room.
    #[serde(rename = "join")]
    Join,
    /// A user left the room.
    #[serde(rename = "leave")]
    Leave,
}

impl MessageKind {
    /// System, join and leave messages share the system-event dedup path.
    pub fn is_system(self) -> bool {
        !matches!(self, Self::UserMessage)
    }

    /// Stable label used in system-event ledger keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "message",
            Self::SystemNotice => "system",
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }
}

/// Normalized message, either authoritative or locally pending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server id; `None` until the message is confirmed.
    pub id: Option<MessageId>,
    /// Correlation token for messages sent from this session.
    pub client_token: Option<ClientToken>,
    /// Raw text before rendering.
    pub content: String,
    /// Origin time in milliseconds since Unix epoch.
    pub timestamp_ms: i64,
    /// Author id when known (system notices may have none).
    pub author_id: Option<UserId>,
    /// Display name of the author.
    pub author_name: String,
    /// Author color hint.
    pub color: Option<String>,
    /// Author badge text.
    pub badge: Option<String>,
    /// Message category.
    pub kind: MessageKind,
    /// `true` until reconciled with an authoritative echo.
    pub pending: bool,
    /// Terminal deletion flag.
    pub deleted: bool,
}

impl Message {
    /// Build the optimistic local copy of an outgoing message.
    pub fn pending(
        token: ClientToken,
        content: impl Into<String>,
        sent_at_ms: i64,
        author: &LocalUser,
    ) -> Self {
        Self {
            id: None,
            client_token: Some(token),
            content: content.into(),
            timestamp_ms: sent_at_ms,
            author_id: Some(author.id),
            author_name: author.name.clone(),
            color: author.color.clone(),
            badge: author.badge.clone(),
            kind: MessageKind::UserMessage,
            pending: true,
            deleted: false,
        }
    }

    /// Text shown for the message body. Join/leave notices carry no content
    /// of their own, so the text is derived from the actor.
    pub fn display_text(&self) -> String {
        match self.kind {
            MessageKind::Join => format!("{} joined the room", self.author_name),
            MessageKind::Leave => format!("{} left the room", self.author_name),
            MessageKind::UserMessage | MessageKind::SystemNotice => self.content.clone(),
        }
    }
}

/// Identity and presentation metadata of the local user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalUser {
    pub id: UserId,
    pub name: String,
    pub color: Option<String>,
    pub badge: Option<String>,
}

/// Room permission level as reported by the page bootstrap data.
///
/// Only gates local affordances; the server enforces the real policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomPermission {
    /// `su`: may send and delete any message.
    Owner,
    /// `777`: may send and delete own messages.
    Member,
    /// Anything else: view only.
    ReadOnly,
}

impl RoomPermission {
    /// Parse the server permission code.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "su" => Self::Owner,
            "777" => Self::Member,
            _ => Self::ReadOnly,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, Self::Owner | Self::Member)
    }

    pub fn can_delete(self, author_id: Option<UserId>, local_user_id: UserId) -> bool {
        match self {
            Self::Owner => true,
            Self::Member => author_id == Some(local_user_id),
            Self::ReadOnly => false,
        }
    }
}

/// Live channel lifecycle state reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel is open.
    Disconnected,
    /// A channel is being opened or re-opened.
    Connecting,
    /// Channel is open and the room was joined.
    Connected,
    /// Push mode is abandoned; HTTP polling drives updates for the rest of the session.
    DegradedPolling,
    /// A connection error was reported; fallback to polling is pending.
    Error,
}

/// Message payload as it appears on the wire (push, ack and REST).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireMessage {
    pub id: Option<MessageId>,
    pub client_id: Option<String>,
    pub content: Option<String>,
    /// Legacy alias of `content` used by some server paths.
    pub message: Option<String>,
    /// ISO-8601 timestamp; naive values are UTC.
    pub timestamp: Option<String>,
    pub user_id: Option<UserId>,
    pub username: Option<String>,
    pub nickname: Option<String>,
    pub color: Option<String>,
    pub badge: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MessageKind>,
}

/// Join/leave presence payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub username: String,
    pub nickname: Option<String>,
    pub timestamp: Option<String>,
}

/// Online roster entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RosterUser {
    pub id: UserId,
    pub username: String,
    pub nickname: Option<String>,
    pub color: Option<String>,
    pub badge: Option<String>,
}

/// Acknowledgement returned for a channel `send_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SendAckPayload {
    pub success: bool,
    pub data: Option<WireMessage>,
    pub message: Option<String>,
}

/// Payload of the outbound `send_message` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessagePayload {
    pub room_id: RoomId,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_answer: Option<String>,
}

/// Events received from the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Transport connected.
    Connected,
    /// Transport lost.
    Disconnected {
        reason: String,
        /// `true` when the server closed the session deliberately.
        server_initiated: bool,
    },
    /// Transport reported a connection error.
    ConnectError { message: String },
    /// New message broadcast to the room.
    Message(WireMessage),
    /// Existing message content changed.
    MessageUpdated(WireMessage),
    /// Message removed on the server.
    MessageDeleted { id: MessageId },
    /// Current roster of the room.
    OnlineUsers { users: Vec<RosterUser> },
    UserJoin(PresenceEvent),
    UserLeave(PresenceEvent),
    /// The server rejected an operation for lack of permission.
    PermissionDenied { message: Option<String> },
    /// Generic server-side refusal (bad captcha, oversized message, ...).
    ServerError { message: String },
    /// The server wants a captcha answer before accepting the last send.
    RequireCaptcha {
        captcha_id: String,
        question: Option<String>,
    },
    /// Acknowledgement of an earlier `send_message` carrying `client_id`.
    SendAck {
        client_id: String,
        ack: SendAckPayload,
    },
}

/// Commands sent over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelCommand {
    Join { room: RoomId },
    SendMessage(SendMessagePayload),
    GetOnlineUsers { room_id: RoomId },
    HeartbeatChat { room_id: RoomId },
}

impl ChannelCommand {
    /// Event name used on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::SendMessage(_) => "send_message",
            Self::GetOnlineUsers { .. } => "get_online_users",
            Self::HeartbeatChat { .. } => "heartbeat_chat",
        }
    }
}

/// Which history page to request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PageSelector {
    /// Newest page (`page=last`).
    Last,
    /// Zero-based page number.
    Page(u32),
    /// Legacy offset addressing.
    Offset(u32),
}

/// Parameters of one history request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryQuery {
    pub selector: PageSelector,
    pub limit: u16,
}

/// History response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryPage {
    pub messages: Vec<WireMessage>,
    pub page: Option<u32>,
    pub total_pages: Option<u32>,
    pub has_more: Option<bool>,
}

/// Online-count response body used while polling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OnlineSnapshot {
    pub count: u64,
    pub users: Option<Vec<RosterUser>>,
}

/// Identity of a view node: the server id once known, the client token before.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKey {
    Id(MessageId),
    Token(ClientToken),
    /// Locally generated notice without server identity (join/leave).
    Notice(u64),
}

/// Interaction affordances attached to a node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Affordances {
    pub can_delete: bool,
    pub can_quote: bool,
}

/// One rendered message in the view model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineNode {
    pub key: NodeKey,
    pub message: Message,
    /// Markup produced by the content renderer.
    pub rendered: String,
    /// Styled as the local user's message.
    pub is_own: bool,
    pub affordances: Affordances,
}

/// Incremental view operation emitted to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineOp {
    /// Append node at the bottom.
    Append(TimelineNode),
    /// Insert an older page above everything, in display order.
    Prepend(Vec<TimelineNode>),
    /// Reuse the pending node keyed by `from`, now identified by `node.key`.
    Promote { from: ClientToken, node: TimelineNode },
    /// Remove a pending node superseded by an existing confirmed node.
    Retract { token: ClientToken },
    /// Replace the content of an existing node in place.
    Update(TimelineNode),
    /// Clear content and show the removed notice.
    MarkDeleted { id: MessageId },
    /// Clear all nodes.
    Clear,
}

/// Scroll instruction accompanying timeline changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScrollDirective {
    /// Stick to the newest message.
    Bottom,
    /// Keep the previously topmost message at the same visual offset.
    PreserveTopAnchor,
}

/// Severity of a status line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Roster summary shown to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterSnapshot {
    pub count: usize,
    pub users: Vec<RosterUser>,
}

/// Frontend commands accepted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a message composed by the user.
    SendMessage { content: String },
    /// Load the page before the oldest loaded one.
    LoadOlder,
    /// Delete a confirmed message.
    DeleteMessage { id: MessageId },
    /// Answer a pending captcha challenge.
    AnswerCaptcha { captcha_id: String, answer: String },
    /// Drop all pending sends (for example on navigation).
    ClearPending,
    /// Tear the session down.
    Leave,
}

/// Events emitted by the session runtime to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ViewEvent {
    /// Connection lifecycle transition.
    ConnectionChanged { state: ConnectionState },
    /// User-visible status line.
    Status { level: StatusLevel, text: String },
    /// Ordered view operations.
    TimelineDelta { ops: Vec<TimelineOp> },
    /// Scroll instruction.
    Scroll(ScrollDirective),
    /// Whether the "load older" affordance should be offered.
    HistoryAvailability { has_more: bool },
    /// Roster update.
    Roster(RosterSnapshot),
    /// Captcha prompt.
    CaptchaRequired { captcha_id: String, question: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_within_one_millisecond() {
        let a = ClientToken::generate(1_700_000_000_000);
        let b = ClientToken::generate(1_700_000_000_000);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client-1700000000000-"));
    }

    #[test]
    fn permission_codes_gate_affordances() {
        assert!(RoomPermission::from_code("su").can_delete(Some(9), 1));
        assert!(RoomPermission::from_code("777").can_delete(Some(1), 1));
        assert!(!RoomPermission::from_code("777").can_delete(Some(9), 1));
        assert!(!RoomPermission::from_code("Null").can_send());
    }

    #[test]
    fn wire_message_accepts_sparse_payloads() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"id": 7, "content": "hi", "type": "join"}"#)
                .expect("sparse payload should parse");
        assert_eq!(msg.id, Some(MessageId(7)));
        assert_eq!(msg.kind, Some(MessageKind::Join));
        assert_eq!(msg.user_id, None);
    }

    #[test]
    fn join_notice_text_is_derived_from_author() {
        let author = LocalUser {
            id: 3,
            name: "mika".into(),
            color: None,
            badge: None,
        };
        let mut msg = Message::pending(ClientToken::from_raw("t"), "", 0, &author);
        msg.kind = MessageKind::Join;
        assert_eq!(msg.display_text(), "mika joined the room");
    }
}
