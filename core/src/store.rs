//! In-memory conversation model: message sequences, summaries, presence, selection.
//!
//! Pure state, no I/O. Every mutation returns the [`Change`] slices it touched so
//! the session can notify subscribers; an empty list means nothing changed.
use crate::types::{Change, ConversationSummary, Message, Origin, SelectionState};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub struct ConversationStore {
    identity: String,
    reconcile_window: chrono::Duration,
    /// Loaded (or push-populated) sequences, timestamp ascending
    conversations: HashMap<String, Vec<Message>>,
    summaries: HashMap<String, ConversationSummary>,
    /// Peers with a summary, newest `last_timestamp` first
    recency: Vec<String>,
    presence: BTreeSet<String>,
    selection: SelectionState,
}

impl ConversationStore {
    pub fn new(identity: impl Into<String>, reconcile_window: Duration) -> Self {
        Self {
            identity: identity.into(),
            reconcile_window: chrono::Duration::from_std(reconcile_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            conversations: HashMap::new(),
            summaries: HashMap::new(),
            recency: Vec::new(),
            presence: BTreeSet::new(),
            selection: SelectionState::default(),
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Locally known messages with `peer`, timestamp ascending
    pub fn messages(&self, peer: &str) -> &[Message] {
        self.conversations
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_sequence(&self, peer: &str) -> bool {
        self.conversations.contains_key(peer)
    }

    /// Conversation summaries, most recent first
    pub fn summaries(&self) -> impl Iterator<Item = &ConversationSummary> + '_ {
        self.recency.iter().filter_map(|p| self.summaries.get(p))
    }

    pub fn summary(&self, peer: &str) -> Option<&ConversationSummary> {
        self.summaries.get(peer)
    }

    pub fn presence(&self) -> &BTreeSet<String> {
        &self.presence
    }

    pub fn is_online(&self, peer: &str) -> bool {
        self.presence.contains(peer)
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn selected_peer(&self) -> Option<&str> {
        self.selection.selected_peer.as_deref()
    }

    /// Message that started as the optimistic entry `local_id`
    pub fn find_local(&self, local_id: Uuid) -> Option<&Message> {
        self.locate(local_id)
            .and_then(|(peer, idx)| self.conversations.get(&peer).map(|seq| &seq[idx]))
    }

    // ─── Mutations ───────────────────────────────────────────────────────────

    /// Apply a message delivered by the push channel (or any confirmed source)
    pub fn apply_incoming_message(&mut self, msg: Message) -> Vec<Change> {
        if msg.sender != self.identity && msg.receiver != self.identity {
            warn!(
                sender = %msg.sender,
                receiver = %msg.receiver,
                "dropping message that does not involve this session"
            );
            return Vec::new();
        }
        let peer = msg.peer_of(&self.identity).to_string();
        let from_me = msg.sender == self.identity;
        let unread = !from_me && !self.is_selected(&peer);
        let window = self.reconcile_window;
        let seq = self.conversations.entry(peer.clone()).or_default();

        if let Some(id) = msg.id {
            if seq.iter().any(|m| m.id == Some(id)) {
                trace!(%peer, id, "duplicate message ignored");
                return Vec::new();
            }
        }

        if from_me {
            if let Some(idx) = find_optimistic_match(seq, &msg, window) {
                let replaced_ts = seq[idx].timestamp;
                let local_id = seq[idx].local_id;
                debug!(%peer, ?local_id, "optimistic entry reconciled");
                replace_entry(seq, idx, confirmed(msg, local_id));
                let mut changes = vec![Change::Messages { peer: peer.clone() }];
                if self.summarize_tail(&peer, replaced_ts) {
                    changes.push(Change::Summaries);
                }
                return changes;
            }
        }

        let duplicate = msg.id.is_none()
            && seq
                .iter()
                .any(|m| m.origin != Origin::LocalOptimistic && same_record(m, &msg));
        if duplicate {
            trace!(%peer, "duplicate message ignored");
            return Vec::new();
        }

        let (content, timestamp) = (msg.content.clone(), msg.timestamp);
        insert_ordered(seq, msg);
        self.touch_summary(&peer, content, timestamp, unread);
        vec![Change::Messages { peer }, Change::Summaries]
    }

    /// Replace the online set wholesale
    pub fn apply_presence_snapshot(&mut self, peers: Vec<String>) -> Vec<Change> {
        let next: BTreeSet<String> = peers
            .into_iter()
            .filter(|p| *p != self.identity)
            .collect();
        if next == self.presence {
            return Vec::new();
        }
        self.presence = next;
        vec![Change::Presence]
    }

    /// Apply a history fetch result tagged with the generation it was issued under
    pub fn apply_history_loaded(
        &mut self,
        peer: &str,
        mut messages: Vec<Message>,
        generation: u64,
    ) -> Vec<Change> {
        if generation != self.selection.fetch_generation || !self.is_selected(peer) {
            debug!(
                %peer,
                generation,
                current = self.selection.fetch_generation,
                "stale history result dropped"
            );
            return Vec::new();
        }

        messages.sort_by_key(|m| m.timestamp);
        let local = self.conversations.remove(peer).unwrap_or_default();
        let mut merged = messages;
        let mut kept = 0usize;
        for m in local {
            if merged.iter().any(|f| same_identity(f, &m)) {
                continue;
            }
            if m.origin == Origin::LocalOptimistic {
                if let Some(idx) = find_unclaimed_confirmation(&merged, &m, self.reconcile_window) {
                    merged[idx].local_id = m.local_id;
                    continue;
                }
            }
            insert_ordered(&mut merged, m);
            kept += 1;
        }
        debug!(%peer, generation, total = merged.len(), kept, "history applied");

        let mut changes = vec![Change::Messages { peer: peer.to_string() }];
        // An empty conversation keeps neither a sequence nor a summary
        let Some((content, timestamp)) = merged.last().map(|m| (m.content.clone(), m.timestamp)) else {
            return changes;
        };
        self.conversations.insert(peer.to_string(), merged);
        if self.touch_summary(peer, content, timestamp, false) {
            changes.push(Change::Summaries);
        }
        changes
    }

    /// Merge the summary list fetched at bootstrap; never regresses a newer local entry
    pub fn apply_summaries(&mut self, fetched: Vec<ConversationSummary>) -> Vec<Change> {
        let mut changed = false;
        for s in fetched {
            if s.peer == self.identity {
                continue;
            }
            let peer = s.peer.clone();
            let unread = s.unread && !self.is_selected(&peer);
            changed |= self.touch_summary(&peer, s.last_message_preview, s.last_timestamp, unread);
        }
        if changed {
            vec![Change::Summaries]
        } else {
            Vec::new()
        }
    }

    /// Select `peer`, bump the fetch generation and clear its unread flag
    pub fn select_peer(&mut self, peer: &str) -> (u64, Vec<Change>) {
        self.selection.selected_peer = Some(peer.to_string());
        self.selection.fetch_generation += 1;

        let mut changes = vec![Change::Selection];
        if let Some(summary) = self.summaries.get_mut(peer) {
            if summary.unread {
                summary.unread = false;
                changes.push(Change::Summaries);
            }
        }
        (self.selection.fetch_generation, changes)
    }

    /// Show an outgoing message before the service confirms it
    pub fn record_optimistic_send(
        &mut self,
        peer: &str,
        content: &str,
        local_timestamp: DateTime<Utc>,
    ) -> (Uuid, Vec<Change>) {
        let local_id = Uuid::new_v4();
        let msg = Message::optimistic(local_id, self.identity.clone(), peer, content, local_timestamp);
        let seq = self.conversations.entry(peer.to_string()).or_default();
        insert_ordered(seq, msg);
        self.touch_summary(peer, content.to_string(), local_timestamp, false);
        (
            local_id,
            vec![Change::Messages { peer: peer.to_string() }, Change::Summaries],
        )
    }

    /// Reconcile the optimistic entry `local_id` with the message the service created
    pub fn apply_send_confirmed(&mut self, local_id: Uuid, msg: Message) -> Vec<Change> {
        let Some((peer, idx)) = self.locate(local_id) else {
            return self.apply_incoming_message(Message {
                local_id: Some(local_id),
                ..msg
            });
        };
        let seq = match self.conversations.get_mut(&peer) {
            Some(seq) => seq,
            None => return Vec::new(),
        };

        if seq[idx].origin != Origin::LocalOptimistic {
            // Already reconciled through the push echo or a history load
            return Vec::new();
        }
        if let Some(id) = msg.id {
            if let Some(dup) = seq.iter().position(|m| m.id == Some(id)) {
                // The confirmation arrived first and was inserted on its own
                seq[dup].local_id = Some(local_id);
                let removed = seq.remove(idx);
                let mut changes = vec![Change::Messages { peer: peer.clone() }];
                if self.summarize_tail(&peer, removed.timestamp) {
                    changes.push(Change::Summaries);
                }
                return changes;
            }
        }

        let replaced_ts = seq[idx].timestamp;
        replace_entry(seq, idx, confirmed(msg, Some(local_id)));
        let mut changes = vec![Change::Messages { peer: peer.clone() }];
        if self.summarize_tail(&peer, replaced_ts) {
            changes.push(Change::Summaries);
        }
        changes
    }

    /// Keep a failed send visible, flagged as failed
    pub fn mark_send_failed(&mut self, local_id: Uuid) -> Vec<Change> {
        let Some((peer, idx)) = self.locate(local_id) else {
            return Vec::new();
        };
        match self.conversations.get_mut(&peer) {
            Some(seq) if seq[idx].origin == Origin::LocalOptimistic && !seq[idx].failed => {
                seq[idx].failed = true;
                vec![Change::Messages { peer }]
            }
            _ => Vec::new(),
        }
    }

    /// Flip a failed entry back to pending; returns the entry to re-send
    pub fn mark_send_retrying(&mut self, local_id: Uuid) -> Option<(Message, Vec<Change>)> {
        let (peer, idx) = self.locate(local_id)?;
        let seq = self.conversations.get_mut(&peer)?;
        let entry = &mut seq[idx];
        if entry.origin != Origin::LocalOptimistic || !entry.failed {
            return None;
        }
        entry.failed = false;
        Some((entry.clone(), vec![Change::Messages { peer }]))
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn is_selected(&self, peer: &str) -> bool {
        self.selection.selected_peer.as_deref() == Some(peer)
    }

    fn locate(&self, local_id: Uuid) -> Option<(String, usize)> {
        self.conversations.iter().find_map(|(peer, seq)| {
            seq.iter()
                .position(|m| m.local_id == Some(local_id))
                .map(|idx| (peer.clone(), idx))
        })
    }

    /// Point the summary at the sequence tail after the entry stamped `replaced`
    /// was reconciled or removed. A summary newer than both is left alone.
    fn summarize_tail(&mut self, peer: &str, replaced: DateTime<Utc>) -> bool {
        let Some((preview, timestamp)) = self
            .conversations
            .get(peer)
            .and_then(|seq| seq.last())
            .map(|m| (m.content.clone(), m.timestamp))
        else {
            return false;
        };
        match self.summaries.get_mut(peer) {
            Some(summary) if summary.last_timestamp == replaced || timestamp >= summary.last_timestamp => {
                if summary.last_timestamp == timestamp && summary.last_message_preview == preview {
                    return false;
                }
                summary.last_message_preview = preview;
                summary.last_timestamp = timestamp;
                self.reposition(peer);
                true
            }
            Some(_) => false,
            None => self.touch_summary(peer, preview, timestamp, false),
        }
    }

    /// Create or update `peer`'s summary and keep `recency` ordered
    fn touch_summary(
        &mut self,
        peer: &str,
        preview: String,
        timestamp: DateTime<Utc>,
        unread: bool,
    ) -> bool {
        match self.summaries.get_mut(peer) {
            Some(summary) => {
                let newer = timestamp >= summary.last_timestamp;
                if !newer && (!unread || summary.unread) {
                    return false;
                }
                if newer {
                    summary.last_message_preview = preview;
                    summary.last_timestamp = timestamp;
                }
                summary.unread |= unread;
            }
            None => {
                self.summaries.insert(
                    peer.to_string(),
                    ConversationSummary {
                        peer: peer.to_string(),
                        last_message_preview: preview,
                        last_timestamp: timestamp,
                        unread,
                    },
                );
            }
        }
        self.reposition(peer);
        true
    }

    fn reposition(&mut self, peer: &str) {
        let Some(ts) = self.summaries.get(peer).map(|s| s.last_timestamp) else {
            return;
        };
        self.recency.retain(|p| p != peer);
        let summaries = &self.summaries;
        let idx = self
            .recency
            .partition_point(|p| summaries.get(p).is_some_and(|s| s.last_timestamp > ts));
        self.recency.insert(idx, peer.to_string());
    }
}

/// Insert after every entry with a timestamp <= the new one (ties keep arrival order)
fn insert_ordered(seq: &mut Vec<Message>, msg: Message) {
    let idx = seq.partition_point(|m| m.timestamp <= msg.timestamp);
    seq.insert(idx, msg);
}

/// Swap entry `idx` for `msg`; re-slots it only if the server timestamp moved it
fn replace_entry(seq: &mut Vec<Message>, idx: usize, msg: Message) {
    let fits = seq[..idx].last().map_or(true, |m| m.timestamp <= msg.timestamp)
        && seq.get(idx + 1).map_or(true, |m| msg.timestamp <= m.timestamp);
    if fits {
        seq[idx] = msg;
    } else {
        seq.remove(idx);
        insert_ordered(seq, msg);
    }
}

fn confirmed(msg: Message, local_id: Option<Uuid>) -> Message {
    Message {
        local_id,
        origin: Origin::Confirmed,
        failed: false,
        ..msg
    }
}

fn same_record(a: &Message, b: &Message) -> bool {
    a.sender == b.sender
        && a.receiver == b.receiver
        && a.content == b.content
        && a.timestamp == b.timestamp
}

/// Two records describe the same logical message
fn same_identity(a: &Message, b: &Message) -> bool {
    match (a.id, b.id) {
        (Some(x), Some(y)) => x == y,
        _ => {
            a.origin != Origin::LocalOptimistic
                && b.origin != Origin::LocalOptimistic
                && same_record(a, b)
        }
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: chrono::Duration) -> bool {
    (a - b).abs() <= window
}

/// Outstanding optimistic entry the confirmed `msg` stands for; pending entries win over failed ones
fn find_optimistic_match(seq: &[Message], msg: &Message, window: chrono::Duration) -> Option<usize> {
    seq.iter()
        .enumerate()
        .filter(|(_, m)| {
            m.origin == Origin::LocalOptimistic
                && m.receiver == msg.receiver
                && m.content == msg.content
                && within(m.timestamp, msg.timestamp, window)
        })
        .min_by_key(|(idx, m)| (m.failed, *idx))
        .map(|(idx, _)| idx)
}

/// Fetched confirmation of an optimistic entry that no other entry has claimed yet
fn find_unclaimed_confirmation(
    fetched: &[Message],
    optimistic: &Message,
    window: chrono::Duration,
) -> Option<usize> {
    fetched.iter().position(|f| {
        f.local_id.is_none()
            && f.sender == optimistic.sender
            && f.receiver == optimistic.receiver
            && f.content == optimistic.content
            && within(f.timestamp, optimistic.timestamp, window)
    })
}
