use std::{collections::HashSet, time::Duration};

use tracing::{debug, trace};

use crate::{
    error::{ChatError, ChatErrorCategory},
    ledger::{ProcessedIdLedger, SystemEventLedger},
    pending::{LIVE_MATCH_TOLERANCE, POLL_MATCH_TOLERANCE, PendingSendRegistry},
    render::ContentRenderer,
    timeline::{PromoteOutcome, Timeline},
    types::{
        Affordances, ClientToken, LocalUser, Message, MessageId, MessageKind, NodeKey,
        RoomPermission, TimelineNode, TimelineOp, UserId,
    },
};

/// Where a message entered the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Live channel broadcast.
    Live,
    /// Acknowledgement of our own send.
    Ack,
    /// Polling snapshot.
    Poll,
    /// History page.
    History,
}

impl Origin {
    /// Pending-match tolerance for messages from this origin.
    pub fn tolerance(self) -> Duration {
        match self {
            Self::Live | Self::Ack => LIVE_MATCH_TOLERANCE,
            Self::Poll | Self::History => POLL_MATCH_TOLERANCE,
        }
    }
}

/// Why an incoming message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    AlreadyProcessed,
    /// Live broadcast of our own message with no pending entry left.
    SelfEcho,
    /// Join/leave of a user the local user does not follow.
    NotFollowed,
    DuplicateSystemEvent,
}

/// Outcome of the decide step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Discard(DiscardReason),
    /// Reuse the pending node for `token`.
    Promote { token: ClientToken },
    /// Render a fresh node.
    RenderNew { record_system_event: bool },
}

/// Where a history page goes in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPlacement {
    /// Newest page, appended in order.
    Initial,
    /// Older page, prepended above everything.
    Older,
}

/// Result of starting a local send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSend {
    pub token: ClientToken,
    pub content: String,
    pub sent_at_ms: i64,
    pub op: TimelineOp,
}

/// Owns every dedup registry of one room session and converges the timeline
/// to one node per message.
#[derive(Debug)]
pub struct ReconciliationEngine {
    local_user: LocalUser,
    permission: RoomPermission,
    followed: HashSet<UserId>,
    processed: ProcessedIdLedger,
    deleted: ProcessedIdLedger,
    system_events: SystemEventLedger,
    pending: PendingSendRegistry,
    next_notice: u64,
}

impl ReconciliationEngine {
    pub fn new(
        local_user: LocalUser,
        permission: RoomPermission,
        followed: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            local_user,
            permission,
            followed: followed.into_iter().collect(),
            processed: ProcessedIdLedger::default(),
            deleted: ProcessedIdLedger::default(),
            system_events: SystemEventLedger::default(),
            pending: PendingSendRegistry::new(),
            next_notice: 0,
        }
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.local_user
    }

    pub fn permission(&self) -> RoomPermission {
        self.permission
    }

    pub fn pending(&self) -> &PendingSendRegistry {
        &self.pending
    }

    pub fn processed(&self) -> &ProcessedIdLedger {
        &self.processed
    }

    pub fn set_followed(&mut self, followed: impl IntoIterator<Item = UserId>) {
        self.followed = followed.into_iter().collect();
    }

    /// Register an optimistic send and render its pending node.
    pub fn begin_send(
        &mut self,
        content: &str,
        now_ms: i64,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Result<LocalSend, ChatError> {
        if !self.permission.can_send() {
            return Err(ChatError::new(
                ChatErrorCategory::Permission,
                "read_only",
                "this room is read-only for you",
            ));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "empty_message",
                "message is empty",
            ));
        }

        let token = ClientToken::generate(now_ms);
        self.pending.register(token.clone(), content, now_ms);
        let message = Message::pending(token.clone(), content, now_ms, &self.local_user);
        let node = TimelineNode {
            key: NodeKey::Token(token.clone()),
            rendered: renderer.render(content),
            message,
            is_own: true,
            affordances: Affordances::default(),
        };
        let op = timeline.append(node).map_err(|err| {
            ChatError::new(ChatErrorCategory::Internal, "duplicate_token", err.to_string())
        })?;

        Ok(LocalSend {
            token,
            content: content.to_owned(),
            sent_at_ms: now_ms,
            op,
        })
    }

    /// Drop a send the server refused for good.
    pub fn abandon_send(&mut self, token: &ClientToken, timeline: &mut Timeline) -> Vec<TimelineOp> {
        self.pending.resolve(token);
        timeline.retract(token).into_iter().collect()
    }

    /// Most recent pending send, used to attach a captcha answer.
    pub fn latest_pending(&self) -> Option<(ClientToken, String)> {
        let token = self.pending.latest()?;
        let entry = self.pending.get(token)?;
        Some((token.clone(), entry.content.clone()))
    }

    /// Forget every pending send. Their nodes stay as they are.
    pub fn clear_pending(&mut self) -> Vec<ClientToken> {
        self.pending.clear()
    }

    /// Forget pending sends older than `ttl`.
    pub fn prune_pending(&mut self, now_ms: i64, ttl: Duration) -> Vec<ClientToken> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.pending.prune_older_than(now_ms.saturating_sub(ttl_ms))
    }

    /// Classify an incoming message without mutating anything.
    pub fn decide(&self, msg: &Message, origin: Origin) -> Decision {
        if let Some(id) = msg.id
            && self.processed.has(id)
        {
            // A known id can still settle the send that produced it.
            return match &msg.client_token {
                Some(token) if self.pending.contains(token) => Decision::Promote {
                    token: token.clone(),
                },
                _ => Decision::Discard(DiscardReason::AlreadyProcessed),
            };
        }

        let own = msg.author_id == Some(self.local_user.id);
        let pending_candidate = msg.id.is_some()
            && msg.kind == MessageKind::UserMessage
            && (own || msg.client_token.is_some() || origin == Origin::Ack);
        if pending_candidate
            && let Some(found) = self.pending.find_best_match(msg, origin.tolerance())
        {
            return Decision::Promote { token: found.token };
        }

        if origin == Origin::Live && own {
            return Decision::Discard(DiscardReason::SelfEcho);
        }

        let replay = origin == Origin::History;
        if !replay
            && matches!(msg.kind, MessageKind::Join | MessageKind::Leave)
            && !msg
                .author_id
                .is_some_and(|author| self.followed.contains(&author))
        {
            return Decision::Discard(DiscardReason::NotFollowed);
        }

        if !replay
            && msg.kind.is_system()
            && self
                .system_events
                .contains(msg.kind, msg.author_id, msg.timestamp_ms)
        {
            return Decision::Discard(DiscardReason::DuplicateSystemEvent);
        }

        Decision::RenderNew {
            record_system_event: !replay && msg.kind.is_system(),
        }
    }

    /// Carry out a decision against the timeline.
    pub fn apply(
        &mut self,
        msg: Message,
        decision: Decision,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        match decision {
            Decision::Discard(reason) => {
                trace!(id = ?msg.id, ?reason, "discarding message");
                Vec::new()
            }
            Decision::Promote { token } => self.promote(token, msg, timeline, renderer),
            Decision::RenderNew {
                record_system_event,
            } => {
                if record_system_event {
                    self.system_events
                        .should_suppress(msg.kind, msg.author_id, msg.timestamp_ms);
                }
                self.render_new(msg, timeline, renderer)
            }
        }
    }

    /// Decide and apply in one step.
    pub fn reconcile(
        &mut self,
        msg: Message,
        origin: Origin,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        let decision = self.decide(&msg, origin);
        self.apply(msg, decision, timeline, renderer)
    }

    /// Reconcile a send acknowledgement. Acks may carry little more than the
    /// id, so missing fields come from the pending entry and the local user.
    pub fn reconcile_ack(
        &mut self,
        mut msg: Message,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        if msg.content.is_empty()
            && let Some(entry) = msg
                .client_token
                .as_ref()
                .and_then(|token| self.pending.get(token))
        {
            msg.content = entry.content.clone();
        }
        if msg.author_id.is_none() {
            msg.author_id = Some(self.local_user.id);
        }
        if msg.author_name.is_empty() {
            msg.author_name = self.local_user.name.clone();
            msg.color = self.local_user.color.clone();
            msg.badge = self.local_user.badge.clone();
        }
        self.reconcile(msg, Origin::Ack, timeline, renderer)
    }

    /// Handle `message_updated`.
    pub fn apply_update(
        &mut self,
        msg: Message,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        let Some(id) = msg.id else {
            return Vec::new();
        };

        if let Some(token) = msg.client_token.clone()
            && self.pending.contains(&token)
        {
            let content = msg.content.clone();
            let rendered = renderer.render(&msg.display_text());
            let mut ops = self.promote(token, msg, timeline, renderer);
            if ops.iter().any(|op| matches!(op, TimelineOp::Retract { .. }))
                && let Ok(Some(update)) = timeline.update_content(id, content, rendered)
            {
                ops.push(update);
            }
            return ops;
        }

        if timeline.contains(&NodeKey::Id(id)) {
            let rendered = renderer.render(&msg.display_text());
            return match timeline.update_content(id, msg.content, rendered) {
                Ok(op) => op.into_iter().collect(),
                Err(err) => {
                    debug!(%id, error = %err, "update target vanished");
                    Vec::new()
                }
            };
        }

        if self.processed.has(id) {
            return Vec::new();
        }
        self.render_new(msg, timeline, renderer)
    }

    /// Handle `message_deleted`. A late echo of the same id stays hidden.
    pub fn apply_delete(&mut self, id: MessageId, timeline: &mut Timeline) -> Vec<TimelineOp> {
        self.processed.add(id);
        self.deleted.add(id);
        timeline.mark_deleted(id).into_iter().collect()
    }

    /// Render a history page and pre-register its ids.
    ///
    /// The newest page may already hold a send that is still pending; that
    /// send is promoted instead of rendered twice.
    pub fn ingest_history(
        &mut self,
        messages: Vec<Message>,
        placement: HistoryPlacement,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        let mut ops = Vec::new();
        let mut nodes = Vec::with_capacity(messages.len());
        for msg in messages {
            if let Some(id) = msg.id {
                if self.processed.has(id) && timeline.contains(&NodeKey::Id(id)) {
                    continue;
                }
                if placement == HistoryPlacement::Initial
                    && msg.kind == MessageKind::UserMessage
                    && msg.author_id == Some(self.local_user.id)
                    && let Some(found) = self.pending.find_best_match(&msg, Origin::History.tolerance())
                {
                    ops.extend(self.promote(found.token, msg, timeline, renderer));
                    continue;
                }
                self.processed.add(id);
                if timeline.contains(&NodeKey::Id(id)) {
                    continue;
                }
            }
            nodes.push(self.build_node(msg, renderer));
        }

        match placement {
            HistoryPlacement::Older => ops.extend(timeline.prepend(nodes)),
            HistoryPlacement::Initial => {
                ops.extend(nodes.into_iter().filter_map(|node| timeline.append(node).ok()))
            }
        }
        ops
    }

    fn promote(
        &mut self,
        token: ClientToken,
        msg: Message,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        self.pending.resolve(&token);
        if let Some(id) = msg.id {
            self.processed.add(id);
        }

        let deleted = msg.id.is_some_and(|id| self.deleted.has(id));
        let mut node = self.build_node(msg.clone(), renderer);
        node.message.deleted = deleted;
        match timeline.promote(&token, node) {
            PromoteOutcome::Promoted(op) | PromoteOutcome::Retracted(op) => vec![op],
            PromoteOutcome::Deleted(op) => {
                debug!(client_token = %token, "message was deleted before its echo");
                vec![op]
            }
            PromoteOutcome::Missing if deleted => Vec::new(),
            PromoteOutcome::Missing => {
                debug!(client_token = %token, "pending node is gone, rendering echo as new");
                self.render_new(msg, timeline, renderer)
            }
        }
    }

    fn render_new(
        &mut self,
        msg: Message,
        timeline: &mut Timeline,
        renderer: &dyn ContentRenderer,
    ) -> Vec<TimelineOp> {
        if let Some(id) = msg.id {
            self.processed.add(id);
        }
        let node = self.build_node(msg, renderer);
        match timeline.append(node) {
            Ok(op) => vec![op],
            Err(err) => {
                debug!(error = %err, "message already displayed");
                Vec::new()
            }
        }
    }

    fn build_node(&mut self, msg: Message, renderer: &dyn ContentRenderer) -> TimelineNode {
        let key = match (msg.id, &msg.client_token) {
            (Some(id), _) => NodeKey::Id(id),
            (None, Some(token)) => NodeKey::Token(token.clone()),
            (None, None) => {
                self.next_notice += 1;
                NodeKey::Notice(self.next_notice)
            }
        };
        let is_user_message = msg.kind == MessageKind::UserMessage;
        let is_own = is_user_message && msg.author_id == Some(self.local_user.id);
        let affordances = Affordances {
            can_delete: is_user_message
                && msg.id.is_some()
                && self.permission.can_delete(msg.author_id, self.local_user.id),
            can_quote: is_user_message && msg.id.is_some(),
        };

        TimelineNode {
            key,
            rendered: renderer.render(&msg.display_text()),
            message: Message {
                pending: false,
                ..msg
            },
            is_own,
            affordances,
        }
    }
}
