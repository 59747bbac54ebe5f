//! Console view-state reducer for `chat-cli`.

use std::collections::HashSet;

use chat_core::{
    ConnectionState, MessageId, MessageKind, NodeKey, RosterSnapshot, StatusLevel, TimelineNode,
    TimelineOp, ViewEvent,
};
use tracing::{debug, trace};

const DEFAULT_STATUS: &str = "Idle";

/// One transcript row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: Option<MessageId>,
    pub sender: String,
    pub body: String,
    pub is_own: bool,
    pub pending: bool,
    pub deleted: bool,
    pub notice: bool,
}

/// Full view snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSnapshot {
    pub messages: Vec<MessageView>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub has_more: bool,
    pub online_count: usize,
    pub captcha: Option<(String, String)>,
}

/// Mirrors the session's timeline from its deltas and keeps the status line.
#[derive(Debug, Clone)]
pub struct ConsoleState {
    timeline_max_items: usize,
    nodes: Vec<TimelineNode>,
    older_rows: usize,
    status_text: String,
    error_text: Option<String>,
    has_more: bool,
    roster: RosterSnapshot,
    captcha: Option<(String, String)>,
}

impl ConsoleState {
    pub fn new(timeline_max_items: usize) -> Self {
        Self {
            timeline_max_items: timeline_max_items.max(1),
            nodes: Vec::new(),
            older_rows: 0,
            status_text: DEFAULT_STATUS.to_owned(),
            error_text: None,
            has_more: false,
            roster: RosterSnapshot::default(),
            captcha: None,
        }
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        ConsoleSnapshot {
            messages: self.nodes.iter().map(message_view).collect(),
            status_text: self.status_text.clone(),
            error_text: self.error_text.clone(),
            has_more: self.has_more,
            online_count: self.roster.count,
            captcha: self.captcha.clone(),
        }
    }

    /// Captcha prompt awaiting an answer.
    pub fn pending_captcha(&self) -> Option<&str> {
        self.captcha.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn clear_captcha(&mut self) {
        self.captcha = None;
    }

    /// Apply one session event and return the lines worth printing.
    pub fn handle_view_event(&mut self, event: ViewEvent) -> Vec<String> {
        match event {
            ViewEvent::ConnectionChanged { state } => {
                self.status_text = connection_label(state).to_owned();
                vec![format!("-- {}", self.status_text)]
            }
            ViewEvent::Status { level, text } => {
                if level == StatusLevel::Error {
                    self.error_text = Some(text.clone());
                }
                vec![format!("{} {text}", level_marker(level))]
            }
            ViewEvent::TimelineDelta { ops } => {
                trace!(op_count = ops.len(), "received timeline delta");
                let lines = ops.iter().flat_map(describe_op).collect();
                for op in &ops {
                    match op {
                        TimelineOp::Prepend(page) => self.older_rows += page.len(),
                        TimelineOp::Clear => self.older_rows = 0,
                        _ => {}
                    }
                }
                apply_delta_lenient(&mut self.nodes, &ops);
                self.older_rows = self.older_rows.min(self.nodes.len());
                self.nodes = dedupe_and_trim(
                    std::mem::take(&mut self.nodes),
                    self.older_rows,
                    self.timeline_max_items,
                );
                lines
            }
            ViewEvent::Scroll(_) => Vec::new(),
            ViewEvent::HistoryAvailability { has_more } => {
                self.has_more = has_more;
                if has_more {
                    vec!["-- older messages available (/older)".to_owned()]
                } else {
                    Vec::new()
                }
            }
            ViewEvent::Roster(roster) => {
                let changed = roster.count != self.roster.count;
                self.roster = roster;
                if changed {
                    vec![format!("-- {} online", self.roster.count)]
                } else {
                    Vec::new()
                }
            }
            ViewEvent::CaptchaRequired {
                captcha_id,
                question,
            } => {
                debug!(%captcha_id, "captcha prompt");
                let line = format!("?? captcha {captcha_id}: {question} (/captcha <answer>)");
                self.captcha = Some((captcha_id, question));
                vec![line]
            }
        }
    }
}

fn message_view(node: &TimelineNode) -> MessageView {
    let message = &node.message;
    MessageView {
        id: message.id,
        sender: message.author_name.clone(),
        body: if message.deleted {
            "[message deleted]".to_owned()
        } else {
            message.display_text()
        },
        is_own: node.is_own,
        pending: message.pending,
        deleted: message.deleted,
        notice: message.kind != MessageKind::UserMessage,
    }
}

/// Single transcript line for a message.
pub fn format_line(view: &MessageView) -> String {
    if view.notice {
        return format!("   * {}", view.body);
    }
    let id = view
        .id
        .map(|id| format!("#{id}"))
        .unwrap_or_else(|| "#…".to_owned());
    let marker = if view.pending { " (sending)" } else { "" };
    let sender = if view.is_own { "me" } else { view.sender.as_str() };
    format!("{id:>6} {sender}: {}{marker}", view.body)
}

fn describe_op(op: &TimelineOp) -> Vec<String> {
    match op {
        TimelineOp::Append(node) => vec![format_line(&message_view(node))],
        TimelineOp::Prepend(nodes) => {
            let mut lines = vec![format!("-- {} older messages", nodes.len())];
            lines.extend(nodes.iter().map(|node| format_line(&message_view(node))));
            lines
        }
        TimelineOp::Promote { node, .. } => match node.message.id {
            Some(id) => vec![format!("   sent as #{id}")],
            None => Vec::new(),
        },
        TimelineOp::Retract { .. } => Vec::new(),
        TimelineOp::Update(node) => vec![format!("{} (edited)", format_line(&message_view(node)))],
        TimelineOp::MarkDeleted { id } => vec![format!("   #{id} was deleted")],
        TimelineOp::Clear => vec!["-- timeline cleared".to_owned()],
    }
}

fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "Disconnected",
        ConnectionState::Connecting => "Connecting",
        ConnectionState::Connected => "Connected",
        ConnectionState::DegradedPolling => "Polling",
        ConnectionState::Error => "Connection error",
    }
}

fn level_marker(level: StatusLevel) -> &'static str {
    match level {
        StatusLevel::Info => "--",
        StatusLevel::Warning => "!!",
        StatusLevel::Error => "xx",
    }
}

fn apply_delta_lenient(nodes: &mut Vec<TimelineNode>, ops: &[TimelineOp]) {
    for op in ops {
        match op {
            TimelineOp::Append(node) => nodes.push(node.clone()),
            TimelineOp::Prepend(page) => {
                nodes.splice(0..0, page.iter().cloned());
            }
            TimelineOp::Promote { from, node } => {
                let pending = NodeKey::Token(from.clone());
                match nodes.iter_mut().find(|existing| existing.key == pending) {
                    Some(existing) => *existing = node.clone(),
                    None => nodes.push(node.clone()),
                }
            }
            TimelineOp::Retract { token } => {
                let pending = NodeKey::Token(token.clone());
                nodes.retain(|existing| existing.key != pending);
            }
            TimelineOp::Update(node) => {
                if let Some(existing) = nodes.iter_mut().find(|existing| existing.key == node.key) {
                    *existing = node.clone();
                }
            }
            TimelineOp::MarkDeleted { id } => {
                let key = NodeKey::Id(*id);
                if let Some(existing) = nodes.iter_mut().find(|existing| existing.key == key) {
                    existing.message.deleted = true;
                    existing.message.content.clear();
                    existing.rendered.clear();
                }
            }
            TimelineOp::Clear => nodes.clear(),
        }
    }
}

/// Keep the latest instance of each key and cap the rows below the
/// `older_rows` loaded from history.
fn dedupe_and_trim(
    nodes: Vec<TimelineNode>,
    older_rows: usize,
    max_items: usize,
) -> Vec<TimelineNode> {
    let mut seen = HashSet::new();
    let mut reversed = Vec::with_capacity(nodes.len());

    for node in nodes.into_iter().rev() {
        if seen.insert(node.key.clone()) {
            reversed.push(node);
        }
    }

    reversed.reverse();
    let older_rows = older_rows.min(reversed.len());
    let live = reversed.len() - older_rows;
    if live > max_items {
        let excess = live - max_items;
        reversed.drain(older_rows..older_rows + excess);
    }
    reversed
}
