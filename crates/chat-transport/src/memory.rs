use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chat_core::{
    ChannelCommand, ChannelEvent, HistoryPage, HistoryQuery, MessageId, OnlineSnapshot,
    PageSelector, RoomId, RosterUser, SendAckPayload, SendMessagePayload, UserId, WireMessage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ChatApi, RealtimeConnector, RealtimeLink, TransportError};

const LINK_BUFFER: usize = 64;

/// How the fake server answers the next `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Open the link and report `Connected`.
    Accept,
    /// Refuse to construct a link.
    Unavailable(String),
    /// Open the link but report `ConnectError`.
    Error(String),
}

#[derive(Debug, Clone)]
struct StoredCaptcha {
    answer: String,
    content: String,
    client_id: Option<String>,
}

#[derive(Debug)]
struct ServerState {
    room_id: RoomId,
    member: RosterUser,
    messages: Vec<WireMessage>,
    next_id: u64,
    links: Vec<mpsc::Sender<ChannelEvent>>,
    online: Vec<RosterUser>,
    connect_mode: ConnectMode,
    http_failure: bool,
    captcha_question: Option<(String, String)>,
    rejection: Option<String>,
    captchas: HashMap<String, StoredCaptcha>,
    next_captcha: u64,
    commands: Vec<ChannelCommand>,
}

/// Single-room chat server held in memory.
///
/// Implements both [`RealtimeConnector`] and [`ChatApi`], so a session can be
/// driven end to end without a network. Every link and REST call acts as
/// `member`.
#[derive(Clone)]
pub struct InMemoryChatServer {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryChatServer {
    pub fn new(room_id: RoomId, member: RosterUser) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                room_id,
                member,
                messages: Vec::new(),
                next_id: 1,
                links: Vec::new(),
                online: Vec::new(),
                connect_mode: ConnectMode::Accept,
                http_failure: false,
                captcha_question: None,
                rejection: None,
                captchas: HashMap::new(),
                next_captcha: 1,
                commands: Vec::new(),
            })),
        }
    }

    pub fn set_connect_mode(&self, mode: ConnectMode) -> Result<(), TransportError> {
        self.lock()?.connect_mode = mode;
        Ok(())
    }

    /// Make every REST call fail with a network error.
    pub fn set_http_failure(&self, failing: bool) -> Result<(), TransportError> {
        self.lock()?.http_failure = failing;
        Ok(())
    }

    /// Challenge the next channel send that carries no captcha answer.
    pub fn require_captcha_on_next_send(
        &self,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.lock()?.captcha_question = Some((question.into(), answer.into()));
        Ok(())
    }

    /// Refuse the next channel send with a failed acknowledgement.
    pub fn reject_next_send(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.lock()?.rejection = Some(reason.into());
        Ok(())
    }

    /// Post a message as another user and broadcast it.
    pub fn inject_message(
        &self,
        author: &RosterUser,
        content: impl Into<String>,
    ) -> Result<MessageId, TransportError> {
        let mut state = self.lock()?;
        let wire = state.store(author.clone(), content.into());
        let id = wire.id.unwrap_or(MessageId(0));
        state.broadcast(ChannelEvent::Message(wire));
        Ok(id)
    }

    /// Delete a message out of band and broadcast the deletion.
    pub fn remove_message(&self, id: MessageId) -> Result<bool, TransportError> {
        let mut state = self.lock()?;
        let removed = state.remove(id);
        if removed {
            state.broadcast(ChannelEvent::MessageDeleted { id });
        }
        Ok(removed)
    }

    /// Broadcast a presence event to every link.
    pub fn announce(&self, event: ChannelEvent) -> Result<(), TransportError> {
        self.lock()?.broadcast(event);
        Ok(())
    }

    /// Disconnect every open link.
    pub fn drop_links(&self, server_initiated: bool) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let reason = if server_initiated {
            "io server disconnect"
        } else {
            "transport close"
        };
        state.broadcast(ChannelEvent::Disconnected {
            reason: reason.to_owned(),
            server_initiated,
        });
        state.links.clear();
        Ok(())
    }

    pub fn messages(&self) -> Result<Vec<WireMessage>, TransportError> {
        Ok(self.lock()?.messages.clone())
    }

    /// Channel commands received so far, in order.
    pub fn commands(&self) -> Result<Vec<ChannelCommand>, TransportError> {
        Ok(self.lock()?.commands.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Unavailable("poisoned lock".to_owned()))
    }

    fn handle_command(
        &self,
        command: ChannelCommand,
        reply: &mpsc::Sender<ChannelEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.commands.push(command.clone());
        match command {
            ChannelCommand::Join { room } => {
                if room == state.room_id && !state.online.iter().any(|u| u.id == state.member.id) {
                    let member = state.member.clone();
                    state.online.push(member);
                }
            }
            ChannelCommand::GetOnlineUsers { .. } => {
                let users = state.online.clone();
                let _ = reply.try_send(ChannelEvent::OnlineUsers { users });
            }
            ChannelCommand::HeartbeatChat { .. } => {}
            ChannelCommand::SendMessage(payload) => state.accept_send(payload, reply),
        }
        Ok(())
    }
}

impl ServerState {
    fn store(&mut self, author: RosterUser, content: String) -> WireMessage {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        let wire = WireMessage {
            id: Some(id),
            content: Some(content),
            user_id: Some(author.id),
            username: Some(author.username),
            nickname: author.nickname,
            color: author.color,
            badge: author.badge,
            ..Default::default()
        };
        self.messages.push(wire.clone());
        wire
    }

    fn remove(&mut self, id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|msg| msg.id != Some(id));
        before != self.messages.len()
    }

    fn broadcast(&mut self, event: ChannelEvent) {
        self.links.retain(|link| !link.is_closed());
        for link in &self.links {
            let _ = link.try_send(event.clone());
        }
    }

    fn accept_send(&mut self, payload: SendMessagePayload, reply: &mpsc::Sender<ChannelEvent>) {
        let mut content = payload.message.trim().to_owned();
        let mut client_id = payload.client_id.clone();

        if let Some(reason) = self.rejection.take() {
            if let Some(client_id) = client_id {
                let _ = reply.try_send(ChannelEvent::SendAck {
                    client_id,
                    ack: SendAckPayload {
                        success: false,
                        data: None,
                        message: Some(reason),
                    },
                });
            }
            return;
        }

        match payload.captcha_id {
            None => {
                if let Some((question, answer)) = self.captcha_question.take() {
                    let captcha_id = format!("cap-{}", self.next_captcha);
                    self.next_captcha += 1;
                    self.captchas.insert(
                        captcha_id.clone(),
                        StoredCaptcha {
                            answer,
                            content,
                            client_id,
                        },
                    );
                    let _ = reply.try_send(ChannelEvent::RequireCaptcha {
                        captcha_id,
                        question: Some(question),
                    });
                    return;
                }
            }
            Some(captcha_id) => {
                let Some(stored) = self.captchas.remove(&captcha_id) else {
                    let _ = reply.try_send(ChannelEvent::ServerError {
                        message: "captcha is invalid or expired".to_owned(),
                    });
                    return;
                };
                if payload.captcha_answer.as_deref().map(str::trim) != Some(stored.answer.as_str()) {
                    let _ = reply.try_send(ChannelEvent::ServerError {
                        message: "wrong captcha answer".to_owned(),
                    });
                    return;
                }
                content = stored.content;
                client_id = stored.client_id.or(client_id);
            }
        }

        if content.is_empty() {
            let _ = reply.try_send(ChannelEvent::ServerError {
                message: "invalid parameters".to_owned(),
            });
            return;
        }

        let member_id = self.member.id;
        if let Some(merged) = self.merge_duplicate(member_id, &content) {
            let mut update = merged;
            update.client_id = client_id.clone();
            debug!(id = ?update.id, "merged duplicate send");
            self.broadcast(ChannelEvent::MessageUpdated(update.clone()));
            if let Some(client_id) = client_id {
                let _ = reply.try_send(ChannelEvent::SendAck {
                    client_id,
                    ack: SendAckPayload {
                        success: true,
                        data: Some(update),
                        message: None,
                    },
                });
            }
            return;
        }

        let member = self.member.clone();
        let mut wire = self.store(member, content);
        wire.client_id = client_id.clone();
        self.broadcast(ChannelEvent::Message(wire.clone()));
        if let Some(client_id) = client_id {
            let _ = reply.try_send(ChannelEvent::SendAck {
                client_id,
                ack: SendAckPayload {
                    success: true,
                    data: Some(wire),
                    message: None,
                },
            });
        }
    }

    /// Fold a repeat of the author's last message into `content*n`.
    fn merge_duplicate(&mut self, author: UserId, content: &str) -> Option<WireMessage> {
        let last = self
            .messages
            .iter_mut()
            .rev()
            .find(|msg| msg.user_id == Some(author))?;
        let current = last.content.clone().unwrap_or_default();
        let (base, count) = current
            .rsplit_once('*')
            .filter(|(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|(base, n)| Some((base, n.parse::<u32>().ok()?)))
            .unwrap_or((current.as_str(), 1));
        if base != content {
            return None;
        }
        last.content = Some(format!("{content}*{}", count + 1));
        Some(last.clone())
    }

    fn page(&self, query: HistoryQuery) -> HistoryPage {
        let limit = usize::from(query.limit.clamp(1, 100));
        let total = self.messages.len();
        let total_pages = if total == 0 { 1 } else { total.div_ceil(limit) };

        let (start, page) = match query.selector {
            PageSelector::Offset(offset) => (offset as usize, None),
            PageSelector::Last => {
                let page = total_pages - 1;
                (page * limit, Some(page as u32))
            }
            PageSelector::Page(n) => {
                let page = (n as usize).min(total_pages - 1);
                (page * limit, Some(page as u32))
            }
        };
        let messages = self
            .messages
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect();

        HistoryPage {
            messages,
            page,
            total_pages: page.map(|_| total_pages as u32),
            has_more: None,
        }
    }
}

#[async_trait]
impl RealtimeConnector for InMemoryChatServer {
    async fn connect(&self) -> Result<RealtimeLink, TransportError> {
        let mode = self.lock()?.connect_mode.clone();
        if let ConnectMode::Unavailable(reason) = mode {
            return Err(TransportError::Unavailable(reason));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ChannelCommand>(LINK_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ChannelEvent>(LINK_BUFFER);
        let shutdown = CancellationToken::new();

        match mode {
            ConnectMode::Error(message) => {
                let _ = inbound_tx.try_send(ChannelEvent::ConnectError { message });
            }
            _ => {
                let _ = inbound_tx.try_send(ChannelEvent::Connected);
                self.lock()?.links.push(inbound_tx.clone());
            }
        }

        let server = self.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    command = outbound_rx.recv() => {
                        let Some(command) = command else { break };
                        if let Err(err) = server.handle_command(command, &inbound_tx) {
                            debug!(error = %err, "in-memory server dropped command");
                        }
                    }
                }
            }
        });

        Ok(RealtimeLink::new(outbound_tx, inbound_rx, shutdown))
    }
}

#[async_trait]
impl ChatApi for InMemoryChatServer {
    async fn history(
        &self,
        _room_id: RoomId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, TransportError> {
        let state = self.lock()?;
        if state.http_failure {
            return Err(TransportError::Network("connection refused".to_owned()));
        }
        Ok(state.page(query))
    }

    async fn send(&self, _room_id: RoomId, content: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if state.http_failure {
            return Err(TransportError::Network("connection refused".to_owned()));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(TransportError::Status {
                status: 400,
                body: "invalid parameters".to_owned(),
            });
        }
        let member = state.member.clone();
        let wire = state.store(member, content.to_owned());
        state.broadcast(ChannelEvent::Message(wire));
        Ok(())
    }

    async fn delete(&self, _room_id: RoomId, id: MessageId) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if state.http_failure {
            return Err(TransportError::Network("connection refused".to_owned()));
        }
        if !state.remove(id) {
            return Err(TransportError::Status {
                status: 404,
                body: "message not found".to_owned(),
            });
        }
        state.broadcast(ChannelEvent::MessageDeleted { id });
        Ok(())
    }

    async fn online_count(&self, _room_id: RoomId) -> Result<OnlineSnapshot, TransportError> {
        let state = self.lock()?;
        if state.http_failure {
            return Err(TransportError::Network("connection refused".to_owned()));
        }
        Ok(OnlineSnapshot {
            count: state.online.len() as u64,
            users: Some(state.online.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn member() -> RosterUser {
        RosterUser {
            id: 1,
            username: "alice".into(),
            ..Default::default()
        }
    }

    fn other() -> RosterUser {
        RosterUser {
            id: 2,
            username: "bob".into(),
            ..Default::default()
        }
    }

    async fn next(link: &mut RealtimeLink) -> ChannelEvent {
        timeout(Duration::from_secs(2), link.inbound.recv())
            .await
            .expect("event should arrive")
            .expect("link should be open")
    }

    fn send(message: &str, client_id: &str) -> ChannelCommand {
        ChannelCommand::SendMessage(SendMessagePayload {
            room_id: 1,
            message: message.into(),
            client_id: Some(client_id.into()),
            captcha_id: None,
            captcha_answer: None,
        })
    }

    #[tokio::test]
    async fn echoes_send_with_client_id_and_acks() {
        let server = InMemoryChatServer::new(1, member());
        let mut link = server.connect().await.expect("connect should work");
        assert_eq!(next(&mut link).await, ChannelEvent::Connected);

        link.try_send(send("hello", "client-1")).expect("send should queue");

        match next(&mut link).await {
            ChannelEvent::Message(wire) => {
                assert_eq!(wire.client_id.as_deref(), Some("client-1"));
                assert_eq!(wire.content.as_deref(), Some("hello"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next(&mut link).await {
            ChannelEvent::SendAck { client_id, ack } => {
                assert_eq!(client_id, "client-1");
                assert!(ack.success);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn merges_repeated_send_into_update() {
        let server = InMemoryChatServer::new(1, member());
        let mut link = server.connect().await.expect("connect should work");
        next(&mut link).await;

        link.try_send(send("hello", "c1")).expect("queue");
        next(&mut link).await;
        next(&mut link).await;
        link.try_send(send("hello", "c2")).expect("queue");

        match next(&mut link).await {
            ChannelEvent::MessageUpdated(wire) => {
                assert_eq!(wire.content.as_deref(), Some("hello*2"));
                assert_eq!(wire.client_id.as_deref(), Some("c2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(server.messages().expect("messages").len(), 1);
    }

    #[tokio::test]
    async fn captcha_holds_send_until_answered() {
        let server = InMemoryChatServer::new(1, member());
        server
            .require_captcha_on_next_send("3+4 = ?", "7")
            .expect("configure captcha");
        let mut link = server.connect().await.expect("connect should work");
        next(&mut link).await;

        link.try_send(send("gated", "c1")).expect("queue");
        let captcha_id = match next(&mut link).await {
            ChannelEvent::RequireCaptcha { captcha_id, .. } => captcha_id,
            other => panic!("unexpected event: {other:?}"),
        };
        assert!(server.messages().expect("messages").is_empty());

        link.try_send(ChannelCommand::SendMessage(SendMessagePayload {
            room_id: 1,
            message: "gated".into(),
            client_id: Some("c1".into()),
            captcha_id: Some(captcha_id),
            captcha_answer: Some("7".into()),
        }))
        .expect("queue");

        match next(&mut link).await {
            ChannelEvent::Message(wire) => assert_eq!(wire.client_id.as_deref(), Some("c1")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_mode_refuses_construction() {
        let server = InMemoryChatServer::new(1, member());
        server
            .set_connect_mode(ConnectMode::Unavailable("no websocket".into()))
            .expect("configure");
        let err = server.connect().await.expect_err("construction must fail");
        assert_eq!(err, TransportError::Unavailable("no websocket".into()));
    }

    #[tokio::test]
    async fn pages_history_oldest_first() {
        let server = InMemoryChatServer::new(1, member());
        for n in 0..5 {
            server
                .inject_message(&other(), format!("m{n}"))
                .expect("inject");
        }

        let last = server
            .history(
                1,
                HistoryQuery {
                    selector: PageSelector::Last,
                    limit: 2,
                },
            )
            .await
            .expect("history should work");
        assert_eq!(last.page, Some(2));
        assert_eq!(last.total_pages, Some(3));
        assert_eq!(last.messages.len(), 1);

        let first = server
            .history(
                1,
                HistoryQuery {
                    selector: PageSelector::Page(0),
                    limit: 2,
                },
            )
            .await
            .expect("history should work");
        assert_eq!(first.messages[0].content.as_deref(), Some("m0"));
    }

    #[tokio::test]
    async fn http_failure_surfaces_network_error() {
        let server = InMemoryChatServer::new(1, member());
        server.set_http_failure(true).expect("configure");
        let err = server
            .online_count(1)
            .await
            .expect_err("request should fail");
        assert!(matches!(err, TransportError::Network(_)));
    }
}
