//! Async session runtime: one tokio task per room session owning the
//! reconciliation engine, timeline, pager and connection state machine.

use std::{future::Future, sync::Arc, time::Duration};

use chat_core::{
    ChannelCommand, ChannelEvent, ChatError, ClientToken, ConnectionAction, ConnectionInput,
    ConnectionState, ConnectionStateMachine, ContentRenderer, HistoryPage, HistoryPager,
    HistoryQuery, LocalUser, MessageId, MessageKind, NodeKey, OnlineSnapshot, RetryPolicy, RoomId,
    RoomPermission, RosterSnapshot, ScrollDirective, SendMessagePayload, SendOutcome,
    SessionChannelError, SessionChannels, SessionCommand, StatusLevel, StatusThrottle, Timeline,
    TimelineOp, UserId, ViewEvent, ViewEventStream, normalize_send_ack, normalize_wire_message,
    normalization::{normalize_presence, status_from_error},
    pager::{DEFAULT_PAGE_SIZE, PagerRequest},
    polling::{DEFAULT_POLL_INTERVAL, DEFAULT_ROSTER_POLL_INTERVAL, apply_snapshot},
    reconcile::{HistoryPlacement, Origin, ReconciliationEngine},
    state_machine::{DEFAULT_FALLBACK_DELAY, DEFAULT_MAX_RECONNECT_ATTEMPTS},
};
use chat_transport::{ChatApi, RealtimeConnector, RealtimeLink, TransportError};
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const DEFAULT_TIMELINE_MAX_ITEMS: usize = 500;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LIVE_ROSTER_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
const RESULT_BUFFER: usize = 64;

/// Timer and sizing knobs of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTuning {
    pub heartbeat_interval: Duration,
    pub live_roster_interval: Duration,
    pub poll_interval: Duration,
    pub roster_poll_interval: Duration,
    pub reconnect: RetryPolicy,
    pub max_reconnect_attempts: u32,
    pub fallback_delay: Duration,
    pub page_size: u16,
    pub timeline_max_items: usize,
    /// Forget pending sends older than this. Disabled when `None`.
    pub pending_ttl: Option<Duration>,
    pub status_window_ms: i64,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            live_roster_interval: DEFAULT_LIVE_ROSTER_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            roster_poll_interval: DEFAULT_ROSTER_POLL_INTERVAL,
            reconnect: RetryPolicy::fixed(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            fallback_delay: DEFAULT_FALLBACK_DELAY,
            page_size: DEFAULT_PAGE_SIZE,
            timeline_max_items: DEFAULT_TIMELINE_MAX_ITEMS,
            pending_ttl: None,
            status_window_ms: StatusThrottle::DEFAULT_WINDOW_MS,
        }
    }
}

/// Everything a session needs to know about its room and user.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: RoomId,
    pub local_user: LocalUser,
    pub permission: RoomPermission,
    pub followed_user_ids: Vec<UserId>,
    pub tuning: SessionTuning,
}

impl SessionConfig {
    pub fn new(room_id: RoomId, local_user: LocalUser, permission: RoomPermission) -> Self {
        Self {
            room_id,
            local_user,
            permission,
            followed_user_ids: Vec::new(),
            tuning: SessionTuning::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    channels: SessionChannels,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> ViewEventStream {
        self.channels.subscribe()
    }
}

/// Start a room session on the current tokio runtime.
///
/// Without a `connector` the session goes straight to polling. Subscribe
/// before yielding to the runtime to observe the first events.
pub fn spawn_session(
    config: SessionConfig,
    connector: Option<Arc<dyn RealtimeConnector>>,
    api: Arc<dyn ChatApi>,
    renderer: Arc<dyn ContentRenderer>,
) -> SessionHandle {
    let (channels, command_rx) = SessionChannels::new(64, 512);
    let session = RoomSession::new(config, connector, api, renderer, channels.clone(), command_rx);
    tokio::spawn(async move {
        session.run().await;
    });

    SessionHandle { channels }
}

/// Completion of a request started on a spawned task.
enum TaskResult {
    Connected {
        generation: u64,
        result: Result<RealtimeLink, TransportError>,
    },
    History(Result<HistoryPage, TransportError>),
    Poll(Result<HistoryPage, TransportError>),
    Roster(Result<OnlineSnapshot, TransportError>),
    Deleted {
        id: MessageId,
        result: Result<(), TransportError>,
    },
    HttpSend {
        token: ClientToken,
        result: Result<(), TransportError>,
    },
}

struct RoomSession {
    room_id: RoomId,
    tuning: SessionTuning,
    channels: SessionChannels,
    command_rx: mpsc::Receiver<SessionCommand>,
    results_tx: mpsc::Sender<TaskResult>,
    results_rx: mpsc::Receiver<TaskResult>,
    connector: Option<Arc<dyn RealtimeConnector>>,
    api: Arc<dyn ChatApi>,
    renderer: Arc<dyn ContentRenderer>,
    state_machine: ConnectionStateMachine,
    engine: ReconciliationEngine,
    timeline: Timeline,
    pager: HistoryPager,
    throttle: StatusThrottle,
    link: Option<RealtimeLink>,
    heartbeat: Option<Interval>,
    live_roster: Option<Interval>,
    poll: Option<Interval>,
    roster_poll: Option<Interval>,
    prune: Option<Interval>,
    reconnect_at: Option<Instant>,
    fallback_at: Option<Instant>,
    poll_in_flight: bool,
    shutdown: CancellationToken,
}

impl RoomSession {
    fn new(
        config: SessionConfig,
        connector: Option<Arc<dyn RealtimeConnector>>,
        api: Arc<dyn ChatApi>,
        renderer: Arc<dyn ContentRenderer>,
        channels: SessionChannels,
        command_rx: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_BUFFER);
        let tuning = config.tuning;
        Self {
            room_id: config.room_id,
            channels,
            command_rx,
            results_tx,
            results_rx,
            connector,
            api,
            renderer,
            state_machine: ConnectionStateMachine::new(
                tuning.reconnect,
                tuning.max_reconnect_attempts,
                tuning.fallback_delay,
            ),
            engine: ReconciliationEngine::new(
                config.local_user,
                config.permission,
                config.followed_user_ids,
            ),
            timeline: Timeline::new(tuning.timeline_max_items),
            pager: HistoryPager::new(tuning.page_size),
            throttle: StatusThrottle::new(tuning.status_window_ms),
            link: None,
            heartbeat: None,
            live_roster: None,
            poll: None,
            roster_poll: None,
            prune: tuning.pending_ttl.map(repeating),
            reconnect_at: None,
            fallback_at: None,
            poll_in_flight: false,
            shutdown: CancellationToken::new(),
            tuning,
        }
    }

    async fn run(mut self) {
        info!(room_id = self.room_id, "room session started");
        self.load_initial_history();

        let opening = if self.connector.is_some() {
            ConnectionInput::ConnectRequested
        } else {
            ConnectionInput::ChannelUnavailable {
                reason: "no live channel configured".to_owned(),
            }
        };
        self.drive(opening);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::Leave) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                event = next_channel_event(&mut self.link) => self.handle_channel_event(event),
                Some(result) = self.results_rx.recv() => self.handle_result(result),
                _ = tick(&mut self.heartbeat) => {
                    self.send_on_link(ChannelCommand::HeartbeatChat { room_id: self.room_id });
                }
                _ = tick(&mut self.live_roster) => {
                    self.send_on_link(ChannelCommand::GetOnlineUsers { room_id: self.room_id });
                }
                _ = tick(&mut self.poll) => self.poll_messages(),
                _ = tick(&mut self.roster_poll) => self.poll_roster(),
                _ = tick(&mut self.prune) => self.prune_pending(),
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.drive(ConnectionInput::ReconnectElapsed);
                }
                _ = sleep_until(self.fallback_at) => {
                    self.fallback_at = None;
                    self.drive(ConnectionInput::FallbackElapsed);
                }
            }
        }

        self.drive(ConnectionInput::Shutdown);
        self.engine.clear_pending();
        self.link = None;
        self.shutdown.cancel();
        info!(room_id = self.room_id, "room session stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendMessage { content } => self.send_message(&content),
            SessionCommand::LoadOlder => self.load_older_history(),
            SessionCommand::DeleteMessage { id } => self.delete_message(id),
            SessionCommand::AnswerCaptcha { captcha_id, answer } => {
                self.answer_captcha(captcha_id, answer)
            }
            SessionCommand::ClearPending => {
                let cleared = self.engine.clear_pending();
                debug!(count = cleared.len(), "cleared pending sends");
            }
            SessionCommand::Leave => {}
        }
    }

    fn send_message(&mut self, content: &str) {
        let local = match self.engine.begin_send(
            content,
            now_ms(),
            &mut self.timeline,
            self.renderer.as_ref(),
        ) {
            Ok(local) => local,
            Err(err) => {
                self.surface_error(&err);
                return;
            }
        };
        debug!(client_token = %local.token, "optimistic send");
        self.emit_ops(vec![local.op]);
        self.channels.emit(ViewEvent::Scroll(ScrollDirective::Bottom));

        let live = self.state_machine.state() == ConnectionState::Connected && self.link.is_some();
        if live {
            self.send_on_link(ChannelCommand::SendMessage(SendMessagePayload {
                room_id: self.room_id,
                message: local.content,
                client_id: Some(local.token.as_str().to_owned()),
                captcha_id: None,
                captcha_answer: None,
            }));
            return;
        }

        // No live channel: post over HTTP and let the next echo or poll promote it.
        let api = self.api.clone();
        let room_id = self.room_id;
        let token = local.token;
        let content = local.content;
        self.spawn_request(async move {
            let result = api.send(room_id, &content).await;
            TaskResult::HttpSend { token, result }
        });
    }

    fn answer_captcha(&mut self, captcha_id: String, answer: String) {
        let Some((token, content)) = self.engine.latest_pending() else {
            self.surface(StatusLevel::Warning, "No message is waiting for a captcha");
            return;
        };
        if self.link.is_none() {
            self.surface(StatusLevel::Error, "Captcha needs a live connection");
            return;
        }
        debug!(client_token = %token, "answering captcha");
        self.send_on_link(ChannelCommand::SendMessage(SendMessagePayload {
            room_id: self.room_id,
            message: content,
            client_id: Some(token.as_str().to_owned()),
            captcha_id: Some(captcha_id),
            captcha_answer: Some(answer.trim().to_owned()),
        }));
    }

    fn delete_message(&mut self, id: MessageId) {
        let author = self
            .timeline
            .get(&NodeKey::Id(id))
            .and_then(|node| node.message.author_id);
        let permission = self.engine.permission();
        if !permission.can_delete(author, self.engine.local_user().id) {
            self.surface(StatusLevel::Error, "You cannot delete this message");
            return;
        }

        let api = self.api.clone();
        let room_id = self.room_id;
        self.spawn_request(async move {
            let result = api.delete(room_id, id).await;
            TaskResult::Deleted { id, result }
        });
    }

    fn load_initial_history(&mut self) {
        if let Some(query) = self.pager.load_initial() {
            self.fetch_history(query);
        }
    }

    fn load_older_history(&mut self) {
        match self.pager.load_older() {
            Some(query) => self.fetch_history(query),
            None => trace!(in_flight = ?self.pager.in_flight(), "no older page to load"),
        }
    }

    fn fetch_history(&self, query: HistoryQuery) {
        let api = self.api.clone();
        let room_id = self.room_id;
        self.spawn_request(async move { TaskResult::History(api.history(room_id, query).await) });
    }

    fn poll_messages(&mut self) {
        if self.poll_in_flight {
            return;
        }
        self.poll_in_flight = true;
        let api = self.api.clone();
        let room_id = self.room_id;
        let query = HistoryQuery {
            selector: chat_core::PageSelector::Last,
            limit: self.tuning.page_size,
        };
        self.spawn_request(async move { TaskResult::Poll(api.history(room_id, query).await) });
    }

    fn poll_roster(&self) {
        let api = self.api.clone();
        let room_id = self.room_id;
        self.spawn_request(async move { TaskResult::Roster(api.online_count(room_id).await) });
    }

    fn prune_pending(&mut self) {
        let Some(ttl) = self.tuning.pending_ttl else {
            return;
        };
        let pruned = self.engine.prune_pending(now_ms(), ttl);
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "expired pending sends");
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        trace!(?event, "channel event");
        match event {
            ChannelEvent::Connected => self.drive(ConnectionInput::ChannelConnected),
            ChannelEvent::Disconnected {
                reason,
                server_initiated,
            } => {
                self.link = None;
                self.drive(ConnectionInput::ChannelDisconnected {
                    reason,
                    server_initiated,
                });
            }
            ChannelEvent::ConnectError { message } => {
                self.link = None;
                self.drive(ConnectionInput::ConnectError { message });
            }
            ChannelEvent::Message(wire) => {
                let msg = normalize_wire_message(&wire, now_ms());
                let ops = self.engine.reconcile(
                    msg,
                    Origin::Live,
                    &mut self.timeline,
                    self.renderer.as_ref(),
                );
                self.emit_new_messages(ops);
            }
            ChannelEvent::MessageUpdated(wire) => {
                let msg = normalize_wire_message(&wire, now_ms());
                let ops =
                    self.engine
                        .apply_update(msg, &mut self.timeline, self.renderer.as_ref());
                self.emit_ops(ops);
            }
            ChannelEvent::MessageDeleted { id } => {
                let ops = self.engine.apply_delete(id, &mut self.timeline);
                self.emit_ops(ops);
            }
            ChannelEvent::OnlineUsers { users } => {
                self.channels.emit(ViewEvent::Roster(RosterSnapshot {
                    count: users.len(),
                    users,
                }));
            }
            ChannelEvent::UserJoin(presence) => self.handle_presence(presence, MessageKind::Join),
            ChannelEvent::UserLeave(presence) => self.handle_presence(presence, MessageKind::Leave),
            ChannelEvent::PermissionDenied { message } => {
                let text = message.unwrap_or_else(|| "Permission denied".to_owned());
                self.surface(StatusLevel::Error, &text);
            }
            ChannelEvent::ServerError { message } => self.surface(StatusLevel::Error, &message),
            ChannelEvent::RequireCaptcha {
                captcha_id,
                question,
            } => {
                info!(%captcha_id, "captcha required");
                self.channels.emit(ViewEvent::CaptchaRequired {
                    captcha_id,
                    question: question.unwrap_or_else(|| "Please answer the captcha".to_owned()),
                });
            }
            ChannelEvent::SendAck { client_id, ack } => {
                let token = ClientToken::from_raw(client_id);
                match normalize_send_ack(&token, &ack, now_ms()) {
                    SendOutcome::Confirmed(msg) => {
                        let ops = self.engine.reconcile_ack(
                            msg,
                            &mut self.timeline,
                            self.renderer.as_ref(),
                        );
                        self.emit_ops(ops);
                    }
                    SendOutcome::Accepted => {}
                    // A failed ack is final for that send, so it is abandoned.
                    // Captcha challenges arrive as `RequireCaptcha` instead and
                    // keep the send pending.
                    SendOutcome::Rejected(err) => {
                        warn!(client_token = %token, code = %err.code, "send rejected");
                        let ops = self.engine.abandon_send(&token, &mut self.timeline);
                        self.emit_ops(ops);
                        self.surface_error(&err);
                    }
                }
            }
        }
    }

    fn handle_presence(&mut self, presence: chat_core::PresenceEvent, kind: MessageKind) {
        let notice = normalize_presence(&presence, kind, now_ms());
        let ops = self.engine.reconcile(
            notice,
            Origin::Live,
            &mut self.timeline,
            self.renderer.as_ref(),
        );
        self.emit_new_messages(ops);
    }

    fn handle_result(&mut self, result: TaskResult) {
        match result {
            TaskResult::Connected { generation, result } => {
                if generation != self.state_machine.channel_generation() {
                    debug!(generation, "dropping stale channel");
                    return;
                }
                match result {
                    Ok(link) => self.link = Some(link),
                    Err(TransportError::Unavailable(reason)) => {
                        self.drive(ConnectionInput::ChannelUnavailable { reason })
                    }
                    Err(err) => self.drive(ConnectionInput::ConnectError {
                        message: err.to_string(),
                    }),
                }
            }
            TaskResult::History(result) => self.land_history(result),
            TaskResult::Poll(result) => {
                self.poll_in_flight = false;
                if self.state_machine.state() != ConnectionState::DegradedPolling {
                    return;
                }
                match result {
                    Ok(page) => {
                        let now = now_ms();
                        let snapshot = page
                            .messages
                            .iter()
                            .map(|wire| normalize_wire_message(wire, now))
                            .collect();
                        let outcome = apply_snapshot(
                            &mut self.engine,
                            &mut self.timeline,
                            self.renderer.as_ref(),
                            snapshot,
                        );
                        self.emit_ops(outcome.ops);
                        if outcome.new_messages {
                            self.channels.emit(ViewEvent::Scroll(ScrollDirective::Bottom));
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "poll failed");
                        self.surface_error(&ChatError::from(err));
                    }
                }
            }
            TaskResult::Roster(result) => match result {
                Ok(snapshot) => {
                    let users = snapshot.users.unwrap_or_default();
                    self.channels.emit(ViewEvent::Roster(RosterSnapshot {
                        count: usize::try_from(snapshot.count).unwrap_or(users.len()),
                        users,
                    }));
                }
                Err(err) => debug!(error = %err, "roster poll failed"),
            },
            TaskResult::Deleted { id, result } => match result {
                Ok(()) => {
                    let ops = self.engine.apply_delete(id, &mut self.timeline);
                    self.emit_ops(ops);
                }
                Err(err) => {
                    warn!(%id, error = %err, "delete failed");
                    self.surface_error(&ChatError::from(err));
                }
            },
            TaskResult::HttpSend { token, result } => {
                if let Err(err) = result {
                    warn!(client_token = %token, error = %err, "http send failed");
                    let ops = self.engine.abandon_send(&token, &mut self.timeline);
                    self.emit_ops(ops);
                    self.surface_error(&ChatError::from(err));
                }
            }
        }
    }

    fn land_history(&mut self, result: Result<HistoryPage, TransportError>) {
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                let older = matches!(self.pager.in_flight(), Some(PagerRequest::Older { .. }));
                self.pager.fail();
                warn!(older, error = %err, "history load failed");
                self.surface_error(&ChatError::from(err));
                self.channels.emit(ViewEvent::HistoryAvailability {
                    has_more: self.pager.has_more(),
                });
                return;
            }
        };

        let Some(landing) = self.pager.complete(&page) else {
            return;
        };
        let now = now_ms();
        let messages = page
            .messages
            .iter()
            .map(|wire| normalize_wire_message(wire, now))
            .collect();
        let ops = self.engine.ingest_history(
            messages,
            landing.placement,
            &mut self.timeline,
            self.renderer.as_ref(),
        );
        debug!(
            placement = ?landing.placement,
            count = ops.len(),
            has_more = landing.has_more,
            "history page landed"
        );
        self.emit_ops(ops);
        self.channels.emit(ViewEvent::Scroll(landing.scroll));
        self.channels.emit(ViewEvent::HistoryAvailability {
            has_more: landing.has_more,
        });
        if landing.placement == HistoryPlacement::Older {
            trace!(page = ?self.pager.current_page(), "older page prepended");
        }
    }

    /// Feed the state machine and carry out what it asks for.
    fn drive(&mut self, input: ConnectionInput) {
        match self.state_machine.apply(&input) {
            Ok(actions) => {
                for action in actions {
                    self.perform(action);
                }
            }
            Err(err) => debug!(?input, code = %err.code, "ignored connection input"),
        }
    }

    fn perform(&mut self, action: ConnectionAction) {
        match action {
            ConnectionAction::StateChanged(state) => {
                info!(room_id = self.room_id, ?state, "connection state changed");
                self.channels.emit(ViewEvent::ConnectionChanged { state });
            }
            ConnectionAction::OpenChannel => self.open_channel(),
            ConnectionAction::JoinRoom => {
                self.send_on_link(ChannelCommand::Join { room: self.room_id })
            }
            ConnectionAction::RequestRoster => {
                self.send_on_link(ChannelCommand::GetOnlineUsers {
                    room_id: self.room_id,
                })
            }
            ConnectionAction::StartHeartbeat => {
                self.heartbeat = Some(delayed(self.tuning.heartbeat_interval));
                self.live_roster = Some(delayed(self.tuning.live_roster_interval));
            }
            ConnectionAction::StopHeartbeat => {
                self.heartbeat = None;
                self.live_roster = None;
            }
            ConnectionAction::ScheduleReconnect(delay) => {
                self.link = None;
                self.reconnect_at = Some(Instant::now() + delay);
            }
            ConnectionAction::ScheduleFallback(delay) => {
                self.fallback_at = Some(Instant::now() + delay);
            }
            ConnectionAction::StartPolling => {
                self.link = None;
                self.reconnect_at = None;
                self.fallback_at = None;
                self.poll = Some(repeating(self.tuning.poll_interval));
                self.roster_poll = Some(repeating(self.tuning.roster_poll_interval));
            }
            ConnectionAction::Surface { level, text } => self.surface(level, &text),
        }
    }

    fn open_channel(&mut self) {
        self.link = None;
        let Some(connector) = self.connector.clone() else {
            self.drive(ConnectionInput::ChannelUnavailable {
                reason: "no live channel configured".to_owned(),
            });
            return;
        };
        let generation = self.state_machine.channel_generation();
        debug!(generation, "opening live channel");
        self.spawn_request(async move {
            TaskResult::Connected {
                generation,
                result: connector.connect().await,
            }
        });
    }

    fn send_on_link(&self, command: ChannelCommand) {
        let Some(link) = &self.link else {
            trace!(event = command.event_name(), "no live channel, dropping command");
            return;
        };
        if let Err(err) = link.try_send(command) {
            debug!(error = %err, "live channel refused command");
        }
    }

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let results_tx = self.results_tx.clone();
        let stop = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                result = request => {
                    let _ = results_tx.send(result).await;
                }
            }
        });
    }

    fn emit_ops(&self, ops: Vec<TimelineOp>) {
        self.channels.emit_delta(ops);
    }

    fn emit_new_messages(&self, ops: Vec<TimelineOp>) {
        let appended = ops
            .iter()
            .any(|op| matches!(op, TimelineOp::Append(_) | TimelineOp::Promote { .. }));
        self.emit_ops(ops);
        if appended {
            self.channels.emit(ViewEvent::Scroll(ScrollDirective::Bottom));
        }
    }

    fn surface(&mut self, level: StatusLevel, text: &str) {
        if self.throttle.admit(text, now_ms()) {
            self.channels.emit(ViewEvent::Status {
                level,
                text: text.to_owned(),
            });
        } else {
            trace!(%text, "status throttled");
        }
    }

    fn surface_error(&mut self, err: &ChatError) {
        if let ViewEvent::Status { level, text } = status_from_error(err) {
            self.surface(level, &text);
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Interval whose first tick fires immediately.
fn repeating(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Interval whose first tick fires after one period.
fn delayed(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next event from the live channel. A channel task that vanished reads as a
/// transport loss.
async fn next_channel_event(link: &mut Option<RealtimeLink>) -> ChannelEvent {
    let Some(active) = link else {
        return std::future::pending().await;
    };
    match active.inbound.recv().await {
        Some(event) => event,
        None => ChannelEvent::Disconnected {
            reason: "transport close".to_owned(),
            server_initiated: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::{PlainTextRenderer, RosterUser};
    use chat_transport::{ConnectMode, InMemoryChatServer};
    use tokio::time::timeout;

    const ROOM: RoomId = 7;

    fn alice() -> LocalUser {
        LocalUser {
            id: 1,
            name: "alice".into(),
            color: None,
            badge: None,
        }
    }

    fn alice_roster() -> RosterUser {
        RosterUser {
            id: 1,
            username: "alice".into(),
            ..Default::default()
        }
    }

    fn bob() -> RosterUser {
        RosterUser {
            id: 2,
            username: "bob".into(),
            ..Default::default()
        }
    }

    fn server() -> InMemoryChatServer {
        InMemoryChatServer::new(ROOM, alice_roster())
    }

    fn start(server: &InMemoryChatServer, permission: RoomPermission, live: bool) -> SessionHandle {
        let connector: Option<Arc<dyn RealtimeConnector>> = if live {
            Some(Arc::new(server.clone()))
        } else {
            None
        };
        spawn_session(
            SessionConfig::new(ROOM, alice(), permission),
            connector,
            Arc::new(server.clone()),
            Arc::new(PlainTextRenderer),
        )
    }

    async fn wait_for(
        events: &mut ViewEventStream,
        mut matches: impl FnMut(&ViewEvent) -> bool,
    ) -> ViewEvent {
        timeout(Duration::from_secs(120), async {
            loop {
                let event = events.recv().await.expect("session should keep emitting");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event should arrive")
    }

    async fn wait_for_state(events: &mut ViewEventStream, state: ConnectionState) {
        wait_for(events, |event| {
            matches!(event, ViewEvent::ConnectionChanged { state: s } if *s == state)
        })
        .await;
    }

    fn has_op(event: &ViewEvent, pred: impl Fn(&TimelineOp) -> bool) -> bool {
        matches!(event, ViewEvent::TimelineDelta { ops } if ops.iter().any(pred))
    }

    #[tokio::test(start_paused = true)]
    async fn live_send_is_promoted_in_place() {
        let server = server();
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "hello".into(),
            })
            .await
            .expect("send should queue");

        let appended = wait_for(&mut events, |event| {
            has_op(event, |op| matches!(op, TimelineOp::Append(node) if node.message.pending))
        })
        .await;
        let ViewEvent::TimelineDelta { ops } = appended else {
            unreachable!()
        };
        let TimelineOp::Append(pending) = &ops[0] else {
            panic!("expected append");
        };
        let NodeKey::Token(token) = pending.key.clone() else {
            panic!("pending node should be keyed by token");
        };

        let promoted = wait_for(&mut events, |event| {
            has_op(event, |op| matches!(op, TimelineOp::Promote { .. }))
        })
        .await;
        let ViewEvent::TimelineDelta { ops } = promoted else {
            unreachable!()
        };
        match &ops[0] {
            TimelineOp::Promote { from, node } => {
                assert_eq!(from, &token);
                assert_eq!(node.key, NodeKey::Id(MessageId(1)));
                assert!(!node.message.pending);
                assert!(node.is_own);
            }
            other => panic!("unexpected op: {other:?}"),
        }
        assert_eq!(server.messages().expect("messages").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn joins_once_and_requests_roster_on_connect() {
        let server = server();
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();

        let roster = wait_for(&mut events, |event| matches!(event, ViewEvent::Roster(_))).await;
        assert_eq!(
            roster,
            ViewEvent::Roster(RosterSnapshot {
                count: 1,
                users: vec![alice_roster()],
            })
        );
        let commands = server.commands().expect("commands");
        let joins = commands
            .iter()
            .filter(|cmd| matches!(cmd, ChannelCommand::Join { .. }))
            .count();
        assert_eq!(joins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_channel_degrades_and_polls() {
        let server = server();
        let handle = start(&server, RoomPermission::Member, false);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::DegradedPolling).await;

        let id = server.inject_message(&bob(), "from bob").expect("inject");
        wait_for(&mut events, |event| {
            has_op(event, |op| {
                matches!(op, TimelineOp::Append(node) if node.key == NodeKey::Id(id))
            })
        })
        .await;

        server.remove_message(id).expect("remove");
        wait_for(&mut events, |event| {
            has_op(event, |op| matches!(op, TimelineOp::MarkDeleted { id: gone } if *gone == id))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_connector_degrades_immediately() {
        let server = server();
        server
            .set_connect_mode(ConnectMode::Unavailable("blocked".into()))
            .expect("configure");
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();

        let seen = wait_for(&mut events, |event| {
            matches!(
                event,
                ViewEvent::ConnectionChanged {
                    state: ConnectionState::DegradedPolling | ConnectionState::Error
                }
            )
        })
        .await;
        assert_eq!(
            seen,
            ViewEvent::ConnectionChanged {
                state: ConnectionState::DegradedPolling
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_error_falls_back_to_polling() {
        let server = server();
        server
            .set_connect_mode(ConnectMode::Error("handshake failed".into()))
            .expect("configure");
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();

        wait_for_state(&mut events, ConnectionState::Error).await;
        wait_for_state(&mut events, ConnectionState::DegradedPolling).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "over http".into(),
            })
            .await
            .expect("send should queue");
        wait_for(&mut events, |event| {
            has_op(event, |op| {
                matches!(op, TimelineOp::Promote { node, .. } if node.message.content == "over http")
            })
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_reconnects_and_rejoins() {
        let server = server();
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        server.drop_links(false).expect("drop");
        wait_for_state(&mut events, ConnectionState::Connecting).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        // Let the join reach the server.
        wait_for(&mut events, |event| matches!(event, ViewEvent::Roster(_))).await;
        let joins = server
            .commands()
            .expect("commands")
            .iter()
            .filter(|cmd| matches!(cmd, ChannelCommand::Join { .. }))
            .count();
        assert_eq!(joins, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_disconnect_stays_disconnected() {
        let server = server();
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        server.drop_links(true).expect("drop");
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
        let status = wait_for(&mut events, |event| {
            matches!(event, ViewEvent::Status { level: StatusLevel::Warning, .. })
        })
        .await;
        assert!(matches!(
            status,
            ViewEvent::Status { ref text, .. } if text.contains("Disconnected by server")
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let joins = server
            .commands()
            .expect("commands")
            .iter()
            .filter(|cmd| matches!(cmd, ChannelCommand::Join { .. }))
            .count();
        assert_eq!(joins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_answer_resends_pending_content() {
        let server = server();
        server
            .require_captcha_on_next_send("3+4 = ?", "7")
            .expect("configure");
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "gated".into(),
            })
            .await
            .expect("send should queue");
        let prompt = wait_for(&mut events, |event| {
            matches!(event, ViewEvent::CaptchaRequired { .. })
        })
        .await;
        let ViewEvent::CaptchaRequired {
            captcha_id,
            question,
        } = prompt
        else {
            unreachable!()
        };
        assert_eq!(question, "3+4 = ?");

        handle
            .send(SessionCommand::AnswerCaptcha {
                captcha_id,
                answer: " 7 ".into(),
            })
            .await
            .expect("answer should queue");
        wait_for(&mut events, |event| {
            has_op(event, |op| {
                matches!(op, TimelineOp::Promote { node, .. } if node.message.content == "gated")
            })
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_ack_abandons_the_send() {
        let server = server();
        server
            .reject_next_send("you are muted")
            .expect("server state");
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "let me talk".into(),
            })
            .await
            .expect("send should queue");

        wait_for(&mut events, |event| {
            has_op(event, |op| matches!(op, TimelineOp::Retract { .. }))
        })
        .await;
        let status = wait_for(&mut events, |event| {
            matches!(event, ViewEvent::Status { text, .. } if text.contains("muted"))
        })
        .await;
        assert!(matches!(status, ViewEvent::Status { level: StatusLevel::Error, .. }));
        assert!(server.messages().expect("messages").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_send_surfaces_status() {
        let server = server();
        let handle = start(&server, RoomPermission::ReadOnly, true);
        let mut events = handle.subscribe();

        handle
            .send(SessionCommand::SendMessage {
                content: "nope".into(),
            })
            .await
            .expect("send should queue");
        let status = wait_for(&mut events, |event| {
            matches!(event, ViewEvent::Status { level: StatusLevel::Error, .. })
        })
        .await;
        assert!(matches!(status, ViewEvent::Status { ref text, .. } if text.contains("read-only")));
        assert!(server.messages().expect("messages").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pages_backwards_through_history() {
        let server = server();
        for n in 0..120 {
            server
                .inject_message(&bob(), format!("m{n}"))
                .expect("inject");
        }
        let handle = start(&server, RoomPermission::Member, false);
        let mut events = handle.subscribe();

        let initial = wait_for(&mut events, |event| {
            matches!(event, ViewEvent::TimelineDelta { .. })
        })
        .await;
        let ViewEvent::TimelineDelta { ops } = initial else {
            unreachable!()
        };
        assert_eq!(ops.len(), 20);
        assert_eq!(
            wait_for(&mut events, |event| matches!(
                event,
                ViewEvent::HistoryAvailability { .. }
            ))
            .await,
            ViewEvent::HistoryAvailability { has_more: true }
        );

        handle.send(SessionCommand::LoadOlder).await.expect("queue");
        let older = wait_for(&mut events, |event| {
            has_op(event, |op| matches!(op, TimelineOp::Prepend(_)))
        })
        .await;
        let ViewEvent::TimelineDelta { ops } = older else {
            unreachable!()
        };
        let TimelineOp::Prepend(nodes) = &ops[0] else {
            panic!("expected prepend");
        };
        assert_eq!(nodes.len(), 50);
        assert_eq!(nodes[0].message.content, "m50");
        assert_eq!(
            wait_for(&mut events, |event| matches!(event, ViewEvent::Scroll(_))).await,
            ViewEvent::Scroll(ScrollDirective::PreserveTopAnchor)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_marks_own_message_deleted() {
        let server = server();
        let handle = start(&server, RoomPermission::Member, true);
        let mut events = handle.subscribe();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "oops".into(),
            })
            .await
            .expect("send should queue");
        wait_for(&mut events, |event| {
            has_op(event, |op| matches!(op, TimelineOp::Promote { .. }))
        })
        .await;

        handle
            .send(SessionCommand::DeleteMessage { id: MessageId(1) })
            .await
            .expect("delete should queue");
        wait_for(&mut events, |event| {
            has_op(event, |op| {
                matches!(op, TimelineOp::MarkDeleted { id } if *id == MessageId(1))
            })
        })
        .await;
        assert!(server.messages().expect("messages").is_empty());
    }
}
