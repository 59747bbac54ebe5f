use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
};

use crate::types::{MessageId, MessageKind, UserId};

/// Insertion-ordered set that evicts a fixed batch of its oldest keys once it
/// grows past `cap`.
#[derive(Debug, Clone)]
struct BoundedKeySet<K> {
    order: VecDeque<K>,
    members: HashSet<K>,
    cap: usize,
    evict: usize,
}

impl<K: Clone + Eq + Hash> BoundedKeySet<K> {
    fn new(cap: usize, evict: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            cap: cap.max(1),
            evict: evict.clamp(1, cap.max(1)),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    /// Returns `false` when the key was already present.
    fn insert(&mut self, key: K) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        self.trim();
        true
    }

    fn trim(&mut self) {
        if self.order.len() <= self.cap {
            return;
        }
        for _ in 0..self.evict {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.members.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Server ids that have already been rendered or pre-registered.
#[derive(Debug, Clone)]
pub struct ProcessedIdLedger {
    ids: BoundedKeySet<MessageId>,
}

impl ProcessedIdLedger {
    pub const DEFAULT_CAP: usize = 1_000;
    pub const DEFAULT_EVICT: usize = 200;

    pub fn new(cap: usize, evict: usize) -> Self {
        Self {
            ids: BoundedKeySet::new(cap, evict),
        }
    }

    pub fn has(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    /// Record `id`. Trims the oldest batch once the cap is exceeded.
    pub fn add(&mut self, id: MessageId) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.len() == 0
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

impl Default for ProcessedIdLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP, Self::DEFAULT_EVICT)
    }
}

/// Dedup key for system notices: kind, actor and minute bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemEventKey {
    kind: MessageKind,
    actor_id: Option<UserId>,
    minute_bucket: i64,
}

impl SystemEventKey {
    pub fn new(kind: MessageKind, actor_id: Option<UserId>, timestamp_ms: i64) -> Self {
        Self {
            kind,
            actor_id,
            minute_bucket: timestamp_ms.div_euclid(60_000),
        }
    }
}

/// Suppresses repeated join/leave/system notices inside a one-minute bucket.
#[derive(Debug, Clone)]
pub struct SystemEventLedger {
    keys: BoundedKeySet<SystemEventKey>,
}

impl SystemEventLedger {
    pub const DEFAULT_CAP: usize = 100;
    pub const DEFAULT_EVICT: usize = 20;

    pub fn new(cap: usize, evict: usize) -> Self {
        Self {
            keys: BoundedKeySet::new(cap, evict),
        }
    }

    /// Lookup without recording.
    pub fn contains(&self, kind: MessageKind, actor_id: Option<UserId>, timestamp_ms: i64) -> bool {
        self.keys
            .contains(&SystemEventKey::new(kind, actor_id, timestamp_ms))
    }

    /// Look the event up and record it. Returns `true` when an equivalent
    /// event was already seen.
    pub fn should_suppress(
        &mut self,
        kind: MessageKind,
        actor_id: Option<UserId>,
        timestamp_ms: i64,
    ) -> bool {
        !self
            .keys
            .insert(SystemEventKey::new(kind, actor_id, timestamp_ms))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.len() == 0
    }
}

impl Default for SystemEventLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP, Self::DEFAULT_EVICT)
    }
}

/// Suppresses an identical status line shown again within a short window.
#[derive(Debug, Clone)]
pub struct StatusThrottle {
    window_ms: i64,
    last_shown: HashMap<String, i64>,
}

impl StatusThrottle {
    pub const KEY_CHARS: usize = 50;
    pub const DEFAULT_WINDOW_MS: i64 = 5_000;

    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            last_shown: HashMap::new(),
        }
    }

    /// Returns `true` when `text` may be shown at `now_ms`, recording it.
    pub fn admit(&mut self, text: &str, now_ms: i64) -> bool {
        let key: String = text.chars().take(Self::KEY_CHARS).collect();
        if let Some(&shown_at) = self.last_shown.get(&key)
            && now_ms - shown_at < self.window_ms
        {
            return false;
        }
        let window_ms = self.window_ms;
        self.last_shown.retain(|_, shown_at| now_ms - *shown_at < window_ms);
        self.last_shown.insert(key, now_ms);
        true
    }
}

impl Default for StatusThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_MS)
    }
}
