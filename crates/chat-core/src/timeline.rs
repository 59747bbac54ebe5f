use thiserror::Error;

use crate::types::{ClientToken, MessageId, NodeKey, TimelineNode, TimelineOp};

/// Errors raised by timeline mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// A node with the same key is already displayed.
    #[error("timeline already holds a node for {0:?}")]
    DuplicateKey(NodeKey),
    /// An operation referenced a node that is not displayed.
    #[error("timeline node {0:?} was not found")]
    MissingNode(NodeKey),
}

/// What happened to a pending node when its echo arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The pending node now carries the authoritative id.
    Promoted(TimelineOp),
    /// The id already had its own node, so the pending node was removed.
    Retracted(TimelineOp),
    /// The id was deleted before its echo; the pending node was re-keyed and
    /// marked deleted.
    Deleted(TimelineOp),
    /// No pending node with that token is displayed any more.
    Missing,
}

/// Bounded, ordered view model with at most one node per key.
///
/// Nodes from older pages sit in a block at the top that is never trimmed.
/// The cap applies to the nodes below it.
#[derive(Debug, Clone)]
pub struct Timeline {
    nodes: Vec<TimelineNode>,
    max_items: usize,
    older: usize,
}

impl Timeline {
    /// Create a timeline with an item cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            nodes: Vec::new(),
            max_items: max_items.max(1),
            older: 0,
        }
    }

    /// Nodes in display order, oldest first.
    pub fn nodes(&self) -> &[TimelineNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&TimelineNode> {
        self.position(key).map(|idx| &self.nodes[idx])
    }

    /// Topmost displayed node, used as the scroll anchor for prepends.
    pub fn first(&self) -> Option<&TimelineNode> {
        self.nodes.first()
    }

    /// Append a node at the bottom. Trims the oldest non-history nodes past
    /// the cap.
    pub fn append(&mut self, node: TimelineNode) -> Result<TimelineOp, TimelineError> {
        if self.contains(&node.key) {
            return Err(TimelineError::DuplicateKey(node.key));
        }
        self.nodes.push(node.clone());
        self.trim_to_max();
        Ok(TimelineOp::Append(node))
    }

    /// Insert an older page above the current nodes.
    ///
    /// Nodes already displayed are skipped. Prepended nodes are exempt from
    /// trimming until the timeline is cleared.
    pub fn prepend(&mut self, page: Vec<TimelineNode>) -> Option<TimelineOp> {
        let fresh: Vec<TimelineNode> = page
            .into_iter()
            .filter(|node| !self.contains(&node.key))
            .collect();
        if fresh.is_empty() {
            return None;
        }
        self.nodes.splice(0..0, fresh.iter().cloned());
        self.older += fresh.len();
        Some(TimelineOp::Prepend(fresh))
    }

    /// Move the pending node for `token` to the authoritative `node`, keeping
    /// its position.
    pub fn promote(&mut self, token: &ClientToken, node: TimelineNode) -> PromoteOutcome {
        let Some(idx) = self.position(&NodeKey::Token(token.clone())) else {
            return PromoteOutcome::Missing;
        };
        let NodeKey::Id(id) = node.key else {
            return PromoteOutcome::Missing;
        };

        if self.contains(&node.key) {
            self.remove_at(idx);
            return PromoteOutcome::Retracted(TimelineOp::Retract {
                token: token.clone(),
            });
        }

        let slot = &mut self.nodes[idx];
        let deleted = node.message.deleted;
        *slot = node;
        slot.message.id = Some(id);
        slot.message.client_token = Some(token.clone());
        slot.message.pending = false;
        if deleted {
            slot.message.content.clear();
            slot.rendered.clear();
            slot.affordances = Default::default();
        }

        let op = TimelineOp::Promote {
            from: token.clone(),
            node: slot.clone(),
        };
        if deleted {
            PromoteOutcome::Deleted(op)
        } else {
            PromoteOutcome::Promoted(op)
        }
    }

    /// Remove a pending node that will never be confirmed.
    pub fn retract(&mut self, token: &ClientToken) -> Option<TimelineOp> {
        let idx = self.position(&NodeKey::Token(token.clone()))?;
        self.remove_at(idx);
        Some(TimelineOp::Retract {
            token: token.clone(),
        })
    }

    /// Replace the content of a confirmed node. Deleted nodes stay deleted.
    pub fn update_content(
        &mut self,
        id: MessageId,
        content: String,
        rendered: String,
    ) -> Result<Option<TimelineOp>, TimelineError> {
        let key = NodeKey::Id(id);
        let idx = self
            .position(&key)
            .ok_or(TimelineError::MissingNode(key))?;
        let node = &mut self.nodes[idx];
        if node.message.deleted {
            return Ok(None);
        }
        node.message.content = content;
        node.rendered = rendered;
        Ok(Some(TimelineOp::Update(node.clone())))
    }

    /// Mark a node deleted and clear its content. Idempotent.
    pub fn mark_deleted(&mut self, id: MessageId) -> Option<TimelineOp> {
        let idx = self.position(&NodeKey::Id(id))?;
        let node = &mut self.nodes[idx];
        if node.message.deleted {
            return None;
        }
        node.message.deleted = true;
        node.message.content.clear();
        node.rendered.clear();
        node.affordances = Default::default();
        Some(TimelineOp::MarkDeleted { id })
    }

    /// Ids of confirmed, non-deleted nodes in display order.
    pub fn confirmed_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.nodes.iter().filter_map(|node| match node.key {
            NodeKey::Id(id) if !node.message.deleted && !node.message.pending => Some(id),
            _ => None,
        })
    }

    /// Remove every node.
    pub fn clear(&mut self) -> TimelineOp {
        self.nodes.clear();
        self.older = 0;
        TimelineOp::Clear
    }

    fn position(&self, key: &NodeKey) -> Option<usize> {
        self.nodes.iter().position(|node| &node.key == key)
    }

    fn remove_at(&mut self, idx: usize) {
        self.nodes.remove(idx);
        if idx < self.older {
            self.older -= 1;
        }
    }

    fn trim_to_max(&mut self) {
        let live = self.nodes.len() - self.older;
        if live <= self.max_items {
            return;
        }

        let excess = live - self.max_items;
        self.nodes.drain(self.older..self.older + excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Affordances, LocalUser, Message};

    fn user() -> LocalUser {
        LocalUser {
            id: 1,
            name: "alice".into(),
            color: None,
            badge: None,
        }
    }

    fn confirmed(id: u64, content: &str) -> TimelineNode {
        let mut message = Message::pending(ClientToken::from_raw("x"), content, 0, &user());
        message.client_token = None;
        message.id = Some(MessageId(id));
        message.pending = false;
        TimelineNode {
            key: NodeKey::Id(MessageId(id)),
            rendered: content.to_owned(),
            message,
            is_own: false,
            affordances: Affordances::default(),
        }
    }

    fn pending(token: &str, content: &str) -> TimelineNode {
        let token = ClientToken::from_raw(token);
        TimelineNode {
            key: NodeKey::Token(token.clone()),
            message: Message::pending(token, content, 0, &user()),
            rendered: content.to_owned(),
            is_own: true,
            affordances: Affordances::default(),
        }
    }

    #[test]
    fn rejects_duplicate_keys() {
        let mut timeline = Timeline::new(10);
        timeline.append(confirmed(1, "a")).expect("first append");
        let err = timeline
            .append(confirmed(1, "a"))
            .expect_err("second append must fail");
        assert_eq!(err, TimelineError::DuplicateKey(NodeKey::Id(MessageId(1))));
    }

    #[test]
    fn promotes_pending_node_in_place() {
        let mut timeline = Timeline::new(10);
        timeline.append(confirmed(1, "before")).expect("append");
        timeline.append(pending("t", "hello")).expect("append");

        let mut echo = confirmed(42, "hello");
        echo.rendered = "<p>hello</p>".into();
        let outcome = timeline.promote(&ClientToken::from_raw("t"), echo);
        assert!(matches!(outcome, PromoteOutcome::Promoted(_)));
        assert_eq!(timeline.len(), 2);

        let node = timeline
            .get(&NodeKey::Id(MessageId(42)))
            .expect("promoted node should exist");
        assert!(!node.message.pending);
        assert_eq!(node.rendered, "<p>hello</p>");
        assert_eq!(timeline.nodes()[1].key, NodeKey::Id(MessageId(42)));
    }

    #[test]
    fn retracts_pending_when_id_already_displayed() {
        let mut timeline = Timeline::new(10);
        timeline.append(pending("t", "hello")).expect("append");
        timeline.append(confirmed(42, "hello")).expect("append");

        let outcome = timeline.promote(&ClientToken::from_raw("t"), confirmed(42, "hello"));
        assert!(matches!(outcome, PromoteOutcome::Retracted(_)));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn missing_pending_node_is_reported() {
        let mut timeline = Timeline::new(10);
        let outcome = timeline.promote(&ClientToken::from_raw("gone"), confirmed(1, "x"));
        assert_eq!(outcome, PromoteOutcome::Missing);
    }

    #[test]
    fn deletion_is_sticky() {
        let mut timeline = Timeline::new(10);
        timeline.append(confirmed(5, "secret")).expect("append");

        assert!(timeline.mark_deleted(MessageId(5)).is_some());
        assert!(timeline.mark_deleted(MessageId(5)).is_none());

        let update = timeline
            .update_content(MessageId(5), "restored".into(), "restored".into())
            .expect("node exists");
        assert!(update.is_none());
        let node = timeline
            .get(&NodeKey::Id(MessageId(5)))
            .expect("node should exist");
        assert!(node.message.deleted);
        assert!(node.message.content.is_empty());
        assert_eq!(timeline.confirmed_ids().count(), 0);
    }

    #[test]
    fn prepend_skips_overlap_and_keeps_order() {
        let mut timeline = Timeline::new(10);
        timeline.append(confirmed(3, "c")).expect("append");

        let op = timeline
            .prepend(vec![confirmed(1, "a"), confirmed(2, "b"), confirmed(3, "c")])
            .expect("fresh nodes");
        match op {
            TimelineOp::Prepend(nodes) => assert_eq!(nodes.len(), 2),
            other => panic!("unexpected op: {other:?}"),
        }
        let ids: Vec<MessageId> = timeline.confirmed_ids().collect();
        assert_eq!(ids, vec![MessageId(1), MessageId(2), MessageId(3)]);
    }

    #[test]
    fn trims_oldest_when_over_max_items() {
        let mut timeline = Timeline::new(2);
        for id in 1..=3 {
            timeline.append(confirmed(id, "x")).expect("append");
        }

        let ids: Vec<MessageId> = timeline.confirmed_ids().collect();
        assert_eq!(ids, vec![MessageId(2), MessageId(3)]);
    }

    #[test]
    fn append_after_older_page_keeps_that_page() {
        let mut timeline = Timeline::new(5);
        for id in 10..15 {
            timeline.append(confirmed(id, "live")).expect("append");
        }
        timeline
            .prepend((5..10).map(|id| confirmed(id, "older")).collect())
            .expect("fresh page");

        timeline.append(confirmed(20, "new")).expect("append");

        let ids: Vec<u64> = timeline.confirmed_ids().map(|id| id.0).collect();
        assert_eq!(ids, vec![5, 6, 7, 8, 9, 11, 12, 13, 14, 20]);

        timeline.clear();
        for id in 30..37 {
            timeline.append(confirmed(id, "x")).expect("append");
        }
        assert_eq!(timeline.len(), 5);
    }

    #[test]
    fn deleted_echo_rekeys_pending_node_as_deleted() {
        let mut timeline = Timeline::new(10);
        timeline.append(pending("t", "hello")).expect("append");

        let mut echo = confirmed(42, "hello");
        echo.message.deleted = true;
        let outcome = timeline.promote(&ClientToken::from_raw("t"), echo);
        assert!(matches!(outcome, PromoteOutcome::Deleted(_)));

        let node = timeline
            .get(&NodeKey::Id(MessageId(42)))
            .expect("re-keyed node");
        assert!(node.message.deleted);
        assert!(!node.message.pending);
        assert!(node.message.content.is_empty());
        assert!(node.rendered.is_empty());
    }
}
