use std::{collections::HashSet, time::Duration};

use crate::{
    reconcile::{Origin, ReconciliationEngine},
    render::ContentRenderer,
    timeline::Timeline,
    types::{Message, MessageId, TimelineOp},
};

/// Interval between message snapshots while degraded.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Interval between roster refreshes while degraded.
pub const DEFAULT_ROSTER_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Result of folding one snapshot into the timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub ops: Vec<TimelineOp>,
    /// Whether any new node was appended or promoted.
    pub new_messages: bool,
}

/// Confirmed ids that are displayed but missing from the snapshot.
///
/// The snapshot is the newest window only, so ids older than its oldest
/// entry are out of range and kept. An empty snapshot means the room has no
/// messages left. Pending nodes never take part.
pub fn deleted_since_snapshot(timeline: &Timeline, snapshot_ids: &[MessageId]) -> Vec<MessageId> {
    let present: HashSet<MessageId> = snapshot_ids.iter().copied().collect();
    let floor = snapshot_ids.iter().copied().min();

    timeline
        .confirmed_ids()
        .filter(|id| floor.is_none_or(|floor| *id >= floor))
        .filter(|id| !present.contains(id))
        .collect()
}

/// Reconcile a poll snapshot, then mark vanished messages deleted.
pub fn apply_snapshot(
    engine: &mut ReconciliationEngine,
    timeline: &mut Timeline,
    renderer: &dyn ContentRenderer,
    snapshot: Vec<Message>,
) -> PollOutcome {
    let snapshot_ids: Vec<MessageId> = snapshot.iter().filter_map(|msg| msg.id).collect();

    let mut outcome = PollOutcome::default();
    for msg in snapshot {
        let ops = engine.reconcile(msg, Origin::Poll, timeline, renderer);
        outcome.new_messages |= ops
            .iter()
            .any(|op| matches!(op, TimelineOp::Append(_) | TimelineOp::Promote { .. }));
        outcome.ops.extend(ops);
    }

    for id in deleted_since_snapshot(timeline, &snapshot_ids) {
        outcome.ops.extend(engine.apply_delete(id, timeline));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        render::PlainTextRenderer,
        types::{LocalUser, MessageKind, NodeKey, RoomPermission},
    };

    const T0: i64 = 1_700_000_000_000;

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(
            LocalUser {
                id: 1,
                name: "alice".into(),
                color: None,
                badge: None,
            },
            RoomPermission::Member,
            [],
        )
    }

    fn msg(id: u64, author: u64, content: &str, ts: i64) -> Message {
        Message {
            id: Some(MessageId(id)),
            client_token: None,
            content: content.into(),
            timestamp_ms: ts,
            author_id: Some(author),
            author_name: format!("user{author}"),
            color: None,
            badge: None,
            kind: MessageKind::UserMessage,
            pending: false,
            deleted: false,
        }
    }

    #[test]
    fn polling_alone_renders_and_promotes() {
        let mut engine = engine();
        let mut timeline = Timeline::new(100);
        engine
            .begin_send("poll me", T0, &mut timeline, &PlainTextRenderer)
            .expect("send should start");

        let outcome = apply_snapshot(
            &mut engine,
            &mut timeline,
            &PlainTextRenderer,
            vec![msg(1, 2, "hey", T0 - 1_000), msg(2, 1, "poll me", T0 + 20_000)],
        );

        assert!(outcome.new_messages);
        assert_eq!(timeline.len(), 2);
        assert!(engine.pending().is_empty());
        assert!(timeline.contains(&NodeKey::Id(MessageId(2))));
    }

    #[test]
    fn vanished_messages_are_marked_deleted() {
        let mut engine = engine();
        let mut timeline = Timeline::new(100);
        apply_snapshot(
            &mut engine,
            &mut timeline,
            &PlainTextRenderer,
            vec![msg(5, 2, "a", T0), msg(6, 2, "b", T0), msg(7, 2, "c", T0)],
        );

        let outcome = apply_snapshot(
            &mut engine,
            &mut timeline,
            &PlainTextRenderer,
            vec![msg(5, 2, "a", T0), msg(7, 2, "c", T0)],
        );

        assert_eq!(outcome.ops, vec![TimelineOp::MarkDeleted { id: MessageId(6) }]);
        assert!(!outcome.new_messages);
    }

    #[test]
    fn ids_older_than_window_and_pending_nodes_are_kept() {
        let mut engine = engine();
        let mut timeline = Timeline::new(100);
        apply_snapshot(
            &mut engine,
            &mut timeline,
            &PlainTextRenderer,
            vec![msg(1, 2, "old", T0), msg(50, 2, "new", T0)],
        );
        engine
            .begin_send("unconfirmed", T0, &mut timeline, &PlainTextRenderer)
            .expect("send should start");

        let deleted = deleted_since_snapshot(&timeline, &[MessageId(50), MessageId(51)]);
        assert!(deleted.is_empty());
    }

    #[test]
    fn empty_snapshot_deletes_everything_confirmed() {
        let mut engine = engine();
        let mut timeline = Timeline::new(100);
        apply_snapshot(
            &mut engine,
            &mut timeline,
            &PlainTextRenderer,
            vec![msg(3, 2, "x", T0)],
        );

        assert_eq!(deleted_since_snapshot(&timeline, &[]), vec![MessageId(3)]);
    }
}
