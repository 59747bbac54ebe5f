use std::{collections::HashMap, time::Duration};

use crate::{
    fingerprint::{content_fingerprint, same_utc_date},
    types::{ClientToken, Message},
};

/// Tolerance used for live pushes and send acknowledgements.
pub const LIVE_MATCH_TOLERANCE: Duration = Duration::from_secs(15);
/// Tolerance used for poll snapshots, which lag behind the send.
pub const POLL_MATCH_TOLERANCE: Duration = Duration::from_secs(30);

/// One optimistic send awaiting its authoritative echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub content: String,
    pub sent_at_ms: i64,
    seq: u64,
}

/// Rule that produced a pending match, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    ClientToken,
    ContentWithinWindow,
    Fingerprint,
}

/// Result of a successful pending lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMatch {
    pub token: ClientToken,
    pub rule: MatchRule,
}

/// Registry of locally sent messages that have not been reconciled yet.
#[derive(Debug, Default)]
pub struct PendingSendRegistry {
    entries: HashMap<ClientToken, PendingEntry>,
    next_seq: u64,
}

impl PendingSendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new send. Re-registering a token replaces its entry.
    pub fn register(&mut self, token: ClientToken, content: impl Into<String>, sent_at_ms: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            token,
            PendingEntry {
                content: content.into(),
                sent_at_ms,
                seq,
            },
        );
    }

    /// Remove and return the entry for `token`.
    pub fn resolve(&mut self, token: &ClientToken) -> Option<PendingEntry> {
        self.entries.remove(token)
    }

    pub fn get(&self, token: &ClientToken) -> Option<&PendingEntry> {
        self.entries.get(token)
    }

    pub fn contains(&self, token: &ClientToken) -> bool {
        self.entries.contains_key(token)
    }

    /// Find the pending send that `msg` most likely confirms.
    ///
    /// Rules are tried strongest first; within a rule the most recently sent
    /// entry wins, then the most recently registered. Never mutates.
    pub fn find_best_match(&self, msg: &Message, tolerance: Duration) -> Option<PendingMatch> {
        if let Some(token) = &msg.client_token
            && self.entries.contains_key(token)
        {
            return Some(PendingMatch {
                token: token.clone(),
                rule: MatchRule::ClientToken,
            });
        }

        let tolerance_ms = i64::try_from(tolerance.as_millis()).unwrap_or(i64::MAX);
        let by_content = self.newest_where(|entry| {
            entry.content == msg.content
                && ((entry.sent_at_ms - msg.timestamp_ms).abs() < tolerance_ms
                    || same_utc_date(entry.sent_at_ms, msg.timestamp_ms))
        });
        if let Some(token) = by_content {
            return Some(PendingMatch {
                token,
                rule: MatchRule::ContentWithinWindow,
            });
        }

        let wanted = content_fingerprint(&msg.content, msg.timestamp_ms);
        self.newest_where(|entry| content_fingerprint(&entry.content, entry.sent_at_ms) == wanted)
            .map(|token| PendingMatch {
                token,
                rule: MatchRule::Fingerprint,
            })
    }

    /// Most recently sent pending token.
    pub fn latest(&self) -> Option<&ClientToken> {
        self.entries
            .iter()
            .max_by_key(|(_, entry)| (entry.sent_at_ms, entry.seq))
            .map(|(token, _)| token)
    }

    /// Drop every entry, returning the dropped tokens.
    pub fn clear(&mut self) -> Vec<ClientToken> {
        self.entries.drain().map(|(token, _)| token).collect()
    }

    /// Drop entries sent before `cutoff_ms`, returning the dropped tokens.
    pub fn prune_older_than(&mut self, cutoff_ms: i64) -> Vec<ClientToken> {
        let expired: Vec<ClientToken> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.sent_at_ms < cutoff_ms)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            self.entries.remove(token);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn newest_where(&self, predicate: impl Fn(&PendingEntry) -> bool) -> Option<ClientToken> {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .max_by_key(|(_, entry)| (entry.sent_at_ms, entry.seq))
            .map(|(token, _)| token.clone())
    }
}
