//! Core of a room chat client: message model, delivery reconciliation and
//! the connection lifecycle, shared between the session runtime and frontends.
//!
//! Everything here is synchronous and owned by a single session task; the
//! async runtime lives in `chat-runtime`.

/// Async command/event channel primitives.
pub mod channel;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Content/time fingerprints and calendar-date comparison.
pub mod fingerprint;
/// Bounded dedup ledgers and the status-line throttle.
pub mod ledger;
/// Wire payload normalization (messages, presence, send acknowledgements).
pub mod normalization;
/// Backward history pagination.
pub mod pager;
/// Optimistic sends awaiting their authoritative echo.
pub mod pending;
/// Snapshot folding and deletion detection for the polling fallback.
pub mod polling;
/// Decide-then-apply reconciliation of incoming messages.
pub mod reconcile;
/// Content rendering seam.
pub mod render;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Live channel connection state machine.
pub mod state_machine;
/// Bounded timeline view model.
pub mod timeline;
/// Wire, command and view-event types.
pub mod types;

pub use channel::{SessionChannelError, SessionChannels, ViewEventStream};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use ledger::{ProcessedIdLedger, StatusThrottle, SystemEventLedger};
pub use normalization::{SendOutcome, normalize_send_ack, normalize_wire_message};
pub use pager::{HistoryPager, PageLanding, bounded_page_limit};
pub use pending::{PendingSendRegistry, LIVE_MATCH_TOLERANCE, POLL_MATCH_TOLERANCE};
pub use reconcile::{Decision, HistoryPlacement, Origin, ReconciliationEngine};
pub use render::{ContentRenderer, PlainTextRenderer};
pub use retry::RetryPolicy;
pub use state_machine::{ConnectionAction, ConnectionInput, ConnectionStateMachine};
pub use timeline::{PromoteOutcome, Timeline, TimelineError};
pub use types::{
    Affordances, ChannelCommand, ChannelEvent, ClientToken, ConnectionState, HistoryPage,
    HistoryQuery, LocalUser, Message, MessageId, MessageKind, NodeKey, OnlineSnapshot,
    PageSelector, PresenceEvent, RoomId, RoomPermission, RosterSnapshot, RosterUser,
    ScrollDirective, SendAckPayload, SendMessagePayload, SessionCommand, StatusLevel,
    TimelineNode, TimelineOp, UserId, ViewEvent, WireMessage,
};
