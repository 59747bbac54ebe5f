use std::collections::HashMap;

use async_trait::async_trait;
use chat_core::{ChannelCommand, ChannelEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    RealtimeConnector, RealtimeLink, TransportError,
    envelope::{InboundFrame, decode_frame, decode_send_ack, encode_command},
};

const LINK_BUFFER: usize = 128;

/// Live channel over a websocket carrying JSON `{"event", "data"}` frames.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    session_cookie: Option<String>,
}

impl WsConnector {
    /// `url` must use the `ws` or `wss` scheme.
    pub fn new(url: Url) -> Result<Self, TransportError> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self {
                url,
                session_cookie: None,
            }),
            other => Err(TransportError::Unavailable(format!(
                "unsupported websocket scheme: {other}"
            ))),
        }
    }

    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into());
        self
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(&self) -> Result<RealtimeLink, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        if let Some(cookie) = &self.session_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|err| TransportError::Unavailable(format!("invalid cookie: {err}")))?;
            request.headers_mut().insert(header::COOKIE, value);
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_BUFFER);
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();

        tokio::spawn(async move {
            let stream = tokio::select! {
                _ = stop.cancelled() => return,
                result = connect_async(request) => result,
            };
            match stream {
                Ok((stream, _)) => {
                    info!("websocket connected");
                    let _ = inbound_tx.send(ChannelEvent::Connected).await;
                    run_link(stream, outbound_rx, inbound_tx, stop).await;
                }
                Err(err) => {
                    warn!(error = %err, "websocket connect failed");
                    let _ = inbound_tx
                        .send(ChannelEvent::ConnectError {
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(RealtimeLink::new(outbound_tx, inbound_rx, shutdown))
    }
}

/// Matches ack replies back to the `client_id` of the send that asked for them.
#[derive(Debug, Default)]
struct AckTracker {
    next: u64,
    waiting: HashMap<u64, String>,
}

impl AckTracker {
    fn track(&mut self, command: &ChannelCommand) -> Option<u64> {
        let ChannelCommand::SendMessage(payload) = command else {
            return None;
        };
        let client_id = payload.client_id.clone()?;
        self.next += 1;
        self.waiting.insert(self.next, client_id);
        Some(self.next)
    }

    fn resolve(&mut self, ack: u64) -> Option<String> {
        self.waiting.remove(&ack)
    }
}

async fn run_link<S>(
    stream: S,
    mut outbound: mpsc::Receiver<ChannelCommand>,
    inbound: mpsc::Sender<ChannelEvent>,
    stop: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut writer, mut reader) = stream.split();
    let mut acks = AckTracker::default();

    let disconnect = loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = writer.send(Message::Close(None)).await;
                return;
            }
            command = outbound.recv() => {
                let Some(command) = command else {
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                };
                let ack = acks.track(&command);
                let frame = match encode_command(&command, ack) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "dropping unencodable command");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(frame)).await {
                    break (err.to_string(), false);
                }
            }
            frame = reader.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(close))) => {
                        let reason = close
                            .map(|c| c.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "io server disconnect".to_owned());
                        break (reason, true);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break (err.to_string(), false),
                    None => break ("transport close".to_owned(), false),
                };
                let event = match decode_frame(&text) {
                    Ok(InboundFrame::Event(event)) => event,
                    Ok(InboundFrame::Ack { ack, data }) => {
                        let Some(client_id) = acks.resolve(ack) else {
                            continue;
                        };
                        match decode_send_ack(client_id, data) {
                            Ok(event) => event,
                            Err(err) => {
                                debug!(error = %err, "malformed ack payload");
                                continue;
                            }
                        }
                    }
                    Ok(InboundFrame::Ignored(name)) => {
                        debug!(event = %name, "ignoring event");
                        continue;
                    }
                    Err(err) => {
                        debug!(error = %err, "malformed frame");
                        continue;
                    }
                };
                let server_initiated = matches!(
                    event,
                    ChannelEvent::Disconnected { server_initiated: true, .. }
                );
                if inbound.send(event).await.is_err() || server_initiated {
                    return;
                }
            }
        }
    };

    let (reason, server_initiated) = disconnect;
    info!(%reason, server_initiated, "websocket closed");
    let _ = inbound
        .send(ChannelEvent::Disconnected {
            reason,
            server_initiated,
        })
        .await;
}
