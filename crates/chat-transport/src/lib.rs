//! Transport seams for the room chat session: the live event channel and the
//! REST API, an in-memory fake server implementing both, and feature-gated
//! network implementations.

use async_trait::async_trait;
use chat_core::{
    ChatError, ChatErrorCategory, ChannelCommand, ChannelEvent, HistoryPage, HistoryQuery,
    MessageId, OnlineSnapshot, RoomId, classify_http_status,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// JSON envelope codec shared by websocket-style transports.
pub mod envelope;
/// In-memory server used by tests and offline demos.
pub mod memory;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{ConnectMode, InMemoryChatServer};

#[cfg(feature = "http")]
pub use http::HttpChatApi;
#[cfg(feature = "websocket")]
pub use websocket::WsConnector;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel cannot be constructed at all.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("unexpected status: {status} body={body}")]
    Status { status: u16, body: String },
    /// The server answered `success: false`.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("malformed payload: {0}")]
    Protocol(String),
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        let message = err.to_string();
        match err {
            TransportError::Unavailable(_) => {
                ChatError::new(ChatErrorCategory::Transport, "transport_unavailable", message)
            }
            TransportError::Network(_) => {
                ChatError::new(ChatErrorCategory::Transport, "network_error", message)
            }
            TransportError::Status { status, .. } => {
                ChatError::new(classify_http_status(status), "http_status", message)
            }
            TransportError::Rejected(reason) => {
                ChatError::new(ChatErrorCategory::Permission, "request_rejected", reason)
            }
            TransportError::Protocol(_) => {
                ChatError::new(ChatErrorCategory::Protocol, "malformed_payload", message)
            }
        }
    }
}

/// One live channel instance.
///
/// `inbound` yields `ChannelEvent::Connected` once the channel is up, then
/// room events until a `Disconnected` or `ConnectError`. Dropping the link
/// closes the channel.
#[derive(Debug)]
pub struct RealtimeLink {
    pub outbound: mpsc::Sender<ChannelCommand>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
    shutdown: CancellationToken,
}

impl RealtimeLink {
    pub fn new(
        outbound: mpsc::Sender<ChannelCommand>,
        inbound: mpsc::Receiver<ChannelEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
        }
    }

    /// Queue a command. Fails only when the channel task is gone.
    pub fn try_send(&self, command: ChannelCommand) -> Result<(), TransportError> {
        self.outbound
            .try_send(command)
            .map_err(|err| TransportError::Network(format!("channel closed: {err}")))
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RealtimeLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens live channel instances.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Construct a new channel. Connection progress is reported through the
    /// returned link; an error here means the channel cannot exist at all.
    async fn connect(&self) -> Result<RealtimeLink, TransportError>;
}

/// REST endpoints of the chat server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history(
        &self,
        room_id: RoomId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, TransportError>;

    async fn send(&self, room_id: RoomId, content: &str) -> Result<(), TransportError>;

    async fn delete(&self, room_id: RoomId, id: MessageId) -> Result<(), TransportError>;

    async fn online_count(&self, room_id: RoomId) -> Result<OnlineSnapshot, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_transport_errors_to_chat_categories() {
        let err: ChatError = TransportError::Status {
            status: 403,
            body: "forbidden".into(),
        }
        .into();
        assert_eq!(err.category, ChatErrorCategory::Permission);
        assert_eq!(err.code, "http_status");

        let err: ChatError = TransportError::Network("reset".into()).into();
        assert!(err.is_recoverable());

        let err: ChatError = TransportError::Protocol("bad json".into()).into();
        assert_eq!(err.category, ChatErrorCategory::Protocol);
    }

    #[test]
    fn dropping_link_cancels_shutdown_token() {
        let (outbound, _outbound_rx) = mpsc::channel(1);
        let (_inbound_tx, inbound) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let link = RealtimeLink::new(outbound, inbound, shutdown.clone());

        drop(link);
        assert!(shutdown.is_cancelled());
    }
}
