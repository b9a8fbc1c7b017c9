//! Conversation Reconciler
//!
//! Owns the canonical message list for one conversation and merges three
//! overlapping sources into it: provisional user messages inserted before the
//! server has seen them, streaming assistant updates, and history snapshots
//! that may land before, during or after either.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::event::InboundEvent;
use crate::types::{EventKey, Message, Role};

/// What `apply` did with one message update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Same message id and timestamp was already processed; nothing changed.
    Duplicate,
    /// Appended as a new entry.
    Inserted,
    /// Overwrote an existing entry in place.
    Updated,
    /// Replaced the provisional entry `local_id` with the server's version.
    ResolvedProvisional { local_id: String },
    /// Held until the optimistic insert for `local_id` commits.
    Deferred { local_id: String },
    /// Partial update for a message that is already complete.
    IgnoredStale,
}

/// What `optimistic_insert` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A provisional entry is visible and waits for its echo.
    Provisional,
    /// The echo had already arrived and was merged into the new entry.
    MergedEarlyEcho { message_id: String },
}

/// What routing one inbound envelope did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    Applied(ApplyOutcome),
    HistoryLoaded { added: usize },
    Cancelled { found: bool },
    /// Control event with no effect on the message list.
    NoChange,
}

/// Provisional ids waiting for their authoritative echo.
#[derive(Debug, Default)]
struct PendingProvisional {
    /// Local ids in insertion order.
    queue: VecDeque<String>,
    /// Echoes that arrived before their provisional entry was in the list,
    /// keyed by the local id they belong to.
    early: HashMap<String, Message>,
}

impl PendingProvisional {
    fn clear(&mut self) {
        self.queue.clear();
        self.early.clear();
    }

    fn dequeue(&mut self, local_id: &str) {
        self.queue.retain(|id| id != local_id);
    }
}

/// Message updates already processed, for dropping re-deliveries.
#[derive(Debug, Default)]
struct SeenEvents {
    keys: HashSet<EventKey>,
}

impl SeenEvents {
    /// Records `key`; returns false if it had been seen before.
    fn insert(&mut self, key: EventKey) -> bool {
        self.keys.insert(key)
    }

    fn reset<I: IntoIterator<Item = EventKey>>(&mut self, keys: I) {
        self.keys.clear();
        self.keys.extend(keys);
    }

    fn clear(&mut self) {
        self.keys.clear();
    }
}

/// The canonical, ordered, duplicate-free message list of one conversation.
///
/// Each instance is independent, so several conversations can be reconciled
/// side by side without sharing state.
#[derive(Debug, Default)]
pub struct Reconciler {
    messages: Vec<Message>,
    pending: PendingProvisional,
    seen: SeenEvents,
    version: u64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current list, in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// An immutable copy of the current list for readers on other tasks.
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::from(self.messages.as_slice())
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.message_id == message_id)
    }

    /// Number of provisional ids still waiting for their echo.
    pub fn pending_count(&self) -> usize {
        self.pending.queue.len()
    }

    pub fn is_pending(&self, local_id: &str) -> bool {
        self.pending.queue.iter().any(|id| id == local_id)
    }

    /// Queue `local_id` ahead of its optimistic insert.
    ///
    /// An echo that arrives between `reserve` and `optimistic_insert` is held
    /// back and merged when the insert runs.
    pub fn reserve(&mut self, local_id: impl Into<String>) {
        let local_id = local_id.into();
        if !self.is_pending(&local_id) {
            self.pending.queue.push_back(local_id);
        }
    }

    /// Show a user message immediately, before the server acknowledges it.
    pub fn optimistic_insert(
        &mut self,
        local_id: impl Into<String>,
        content: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> InsertOutcome {
        let local_id = local_id.into();
        let content = content.into();
        let user_id = user_id.into();

        if let Some(mut echo) = self.pending.early.remove(&local_id) {
            self.pending.dequeue(&local_id);
            echo.is_complete = true;
            let message_id = echo.message_id.clone();
            debug!(local_id = %local_id, message_id = %message_id, "merged early echo into optimistic insert");
            match self.position(&message_id) {
                Some(idx) => self.messages[idx] = echo,
                None => self.messages.push(echo),
            }
            self.bump();
            return InsertOutcome::MergedEarlyEcho { message_id };
        }

        if !self.is_pending(&local_id) {
            self.pending.queue.push_back(local_id.clone());
        }
        if self.position(&local_id).is_none() {
            self.messages
                .push(Message::provisional(local_id, content, session_id, user_id));
            self.bump();
        }
        InsertOutcome::Provisional
    }

    /// Apply one authoritative message update.
    pub fn apply(&mut self, message: Message) -> ApplyOutcome {
        if !self.seen.insert(message.key()) {
            trace!(message_id = %message.message_id, timestamp = message.timestamp, "dropping re-delivered event");
            return ApplyOutcome::Duplicate;
        }

        let outcome = match (message.role, message.is_complete) {
            (Role::User, _) => self.apply_user(message),
            (Role::Assistant, true) => self.apply_final(message),
            (Role::Assistant, false) => self.apply_partial(message),
        };
        if !matches!(
            outcome,
            ApplyOutcome::Deferred { .. } | ApplyOutcome::IgnoredStale
        ) {
            self.bump();
        }
        outcome
    }

    fn apply_user(&mut self, mut message: Message) -> ApplyOutcome {
        message.is_complete = true;

        if let Some(idx) = self.position(&message.message_id) {
            self.messages[idx] = message;
            return ApplyOutcome::Updated;
        }

        let held = self
            .pending
            .early
            .iter()
            .find(|(_, echo)| echo.message_id == message.message_id)
            .map(|(local_id, _)| local_id.clone());
        if let Some(local_id) = held {
            self.pending.early.insert(local_id.clone(), message);
            return ApplyOutcome::Deferred { local_id };
        }

        if self.pending.queue.is_empty() {
            debug!(message_id = %message.message_id, "user message with no pending provisional entry");
            self.messages.push(message);
            return ApplyOutcome::Inserted;
        }

        let visible = self
            .pending
            .queue
            .iter()
            .enumerate()
            .find_map(|(qi, id)| self.position(id).map(|li| (qi, li)));

        if let Some((qi, li)) = visible {
            if let Some(local_id) = self.pending.queue.remove(qi) {
                debug!(local_id = %local_id, message_id = %message.message_id, "resolved provisional message");
                self.messages[li] = message;
                return ApplyOutcome::ResolvedProvisional { local_id };
            }
        }

        // The provisional entry has been queued but is not in the list yet.
        let waiting = self
            .pending
            .queue
            .iter()
            .find(|id| !self.pending.early.contains_key(*id))
            .cloned();
        match waiting {
            Some(local_id) => {
                debug!(local_id = %local_id, message_id = %message.message_id, "echo arrived before its optimistic insert");
                self.pending.early.insert(local_id.clone(), message);
                ApplyOutcome::Deferred { local_id }
            }
            None => {
                self.messages.push(message);
                ApplyOutcome::Inserted
            }
        }
    }

    fn apply_final(&mut self, message: Message) -> ApplyOutcome {
        match self.position(&message.message_id) {
            Some(idx) => {
                self.messages[idx] = message;
                ApplyOutcome::Updated
            }
            None => {
                debug!(message_id = %message.message_id, "completion for unknown message, appending");
                self.messages.push(message);
                ApplyOutcome::Inserted
            }
        }
    }

    fn apply_partial(&mut self, message: Message) -> ApplyOutcome {
        let Some(idx) = self.position(&message.message_id) else {
            self.messages.push(message);
            return ApplyOutcome::Inserted;
        };

        let existing = &mut self.messages[idx];
        if existing.is_complete {
            debug!(message_id = %message.message_id, "chunk after completion ignored");
            return ApplyOutcome::IgnoredStale;
        }
        // Content is cumulative server-side; replace, never append.
        existing.content = message.content;
        existing.chunk = message.chunk;
        existing.timestamp = message.timestamp;
        ApplyOutcome::Updated
    }

    /// Terminal update for a reply the user stopped.
    pub fn mark_cancelled(&mut self, message_id: &str) -> bool {
        match self.position(message_id) {
            Some(idx) => {
                if !self.messages[idx].is_complete {
                    self.messages[idx].is_complete = true;
                    self.bump();
                }
                true
            }
            None => false,
        }
    }

    /// Merge a history snapshot. Returns how many entries it added.
    ///
    /// Messages already reconciled from the live stream are kept as they are.
    /// Loading history is a consistency checkpoint: pending provisional state
    /// is dropped and the seen set is rebuilt from the visible list.
    pub fn load_history(&mut self, batch: Vec<Message>) -> usize {
        let batch = collapse_by_id(batch);

        let added = if self.messages.is_empty() {
            let added = batch.len();
            self.messages = batch;
            added
        } else {
            let present: HashSet<String> =
                self.messages.iter().map(|m| m.message_id.clone()).collect();
            let before = self.messages.len();
            self.messages
                .extend(batch.into_iter().filter(|m| !present.contains(&m.message_id)));
            self.messages.sort_by_key(|m| m.timestamp);
            self.messages.len() - before
        };

        self.pending.clear();
        self.seen.reset(self.messages.iter().map(Message::key));
        self.bump();
        debug!(added, total = self.messages.len(), "history loaded");
        added
    }

    /// Route one inbound envelope.
    pub fn apply_event(&mut self, event: InboundEvent) -> EventEffect {
        match event {
            InboundEvent::History { messages } => EventEffect::HistoryLoaded {
                added: self.load_history(messages),
            },
            InboundEvent::Message { data } | InboundEvent::Chunk { data } => {
                EventEffect::Applied(self.apply(data))
            }
            InboundEvent::Complete { mut data } => {
                data.is_complete = true;
                EventEffect::Applied(self.apply(data))
            }
            InboundEvent::Cancelled { message_id } => EventEffect::Cancelled {
                found: self.mark_cancelled(&message_id),
            },
            _ => EventEffect::NoChange,
        }
    }

    /// Forget everything; used when the session is reset.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending.clear();
        self.seen.clear();
        self.bump();
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.message_id == message_id)
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}

/// One entry per message id; the newest timestamp wins, at the position where
/// the id first appeared.
fn collapse_by_id(batch: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(batch.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for message in batch {
        match index.get(&message.message_id) {
            Some(&i) => {
                if message.timestamp >= out[i].timestamp {
                    out[i] = message;
                }
            }
            None => {
                index.insert(message.message_id.clone(), out.len());
                out.push(message);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, content: &str, ts: i64) -> Message {
        Message {
            message_id: id.to_string(),
            session_id: "s".to_string(),
            user_id: "u".to_string(),
            role: Role::User,
            content: content.to_string(),
            chunk: None,
            timestamp: ts,
            is_complete: true,
        }
    }

    fn assistant(id: &str, content: &str, ts: i64, complete: bool) -> Message {
        Message {
            message_id: id.to_string(),
            session_id: "s".to_string(),
            user_id: "u".to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            chunk: Some(content.to_string()),
            timestamp: ts,
            is_complete: complete,
        }
    }

    fn ids(r: &Reconciler) -> Vec<&str> {
        r.messages().iter().map(|m| m.message_id.as_str()).collect()
    }

    #[test]
    fn applying_same_event_twice_is_idempotent() {
        let mut r = Reconciler::new();
        let event = assistant("a1", "Hello", 10, false);

        assert_eq!(r.apply(event.clone()), ApplyOutcome::Inserted);
        let once = r.messages().to_vec();
        let version = r.version();

        assert_eq!(r.apply(event), ApplyOutcome::Duplicate);
        assert_eq!(r.messages(), once.as_slice());
        assert_eq!(r.version(), version);
    }

    #[test]
    fn optimistic_insert_is_resolved_by_echo() {
        let mut r = Reconciler::new();
        assert_eq!(
            r.optimistic_insert("temp_1", "hi", "s", "u"),
            InsertOutcome::Provisional
        );
        assert_eq!(ids(&r), vec!["temp_1"]);
        assert!(r.messages()[0].is_complete);
        assert!(r.is_pending("temp_1"));

        let outcome = r.apply(user("srv_1", "hi", 100));
        assert_eq!(
            outcome,
            ApplyOutcome::ResolvedProvisional {
                local_id: "temp_1".to_string()
            }
        );
        assert_eq!(ids(&r), vec!["srv_1"]);
        assert_eq!(r.messages()[0].content, "hi");
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn resolution_keeps_list_position() {
        let mut r = Reconciler::new();
        r.apply(user("srv_0", "earlier", 1));
        r.apply(assistant("a0", "reply", 2, true));
        r.optimistic_insert("temp_1", "second", "s", "u");
        r.apply(assistant("a_other", "streaming", 3, false));

        r.apply(user("srv_1", "second", 4));
        assert_eq!(ids(&r), vec!["srv_0", "a0", "srv_1", "a_other"]);
    }

    #[test]
    fn echoes_resolve_provisionals_in_fifo_order() {
        let mut r = Reconciler::new();
        r.optimistic_insert("temp_1", "one", "s", "u");
        r.optimistic_insert("temp_2", "two", "s", "u");

        r.apply(user("srv_1", "one", 10));
        r.apply(user("srv_2", "two", 20));
        assert_eq!(ids(&r), vec!["srv_1", "srv_2"]);
        assert_eq!(r.messages()[1].content, "two");
    }

    #[test]
    fn echo_before_optimistic_commit_is_deferred() {
        let mut r = Reconciler::new();
        r.reserve("temp_1");

        let outcome = r.apply(user("srv_1", "hi", 100));
        assert_eq!(
            outcome,
            ApplyOutcome::Deferred {
                local_id: "temp_1".to_string()
            }
        );
        assert!(r.is_empty());

        let inserted = r.optimistic_insert("temp_1", "hi", "s", "u");
        assert_eq!(
            inserted,
            InsertOutcome::MergedEarlyEcho {
                message_id: "srv_1".to_string()
            }
        );
        assert_eq!(ids(&r), vec!["srv_1"]);
        assert_eq!(r.messages()[0].content, "hi");
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn second_early_echo_is_not_lost() {
        let mut r = Reconciler::new();
        r.reserve("temp_1");
        r.apply(user("srv_1", "one", 1));
        r.apply(user("srv_2", "two", 2));

        assert_eq!(ids(&r), vec!["srv_2"]);
        r.optimistic_insert("temp_1", "one", "s", "u");
        assert_eq!(ids(&r), vec!["srv_2", "srv_1"]);
    }

    #[test]
    fn earlier_message_with_same_text_does_not_hide_new_send() {
        let mut r = Reconciler::new();
        assert_eq!(r.apply(user("srv_other", "ok", 1)), ApplyOutcome::Inserted);
        r.apply(assistant("a1", "sure", 2, true));

        assert_eq!(
            r.optimistic_insert("temp_1", "ok", "s", "u"),
            InsertOutcome::Provisional
        );
        assert_eq!(ids(&r), vec!["srv_other", "a1", "temp_1"]);
        assert!(r.is_pending("temp_1"));

        r.apply(user("srv_1", "ok", 3));
        assert_eq!(ids(&r), vec!["srv_other", "a1", "srv_1"]);
        assert_eq!(r.messages().iter().filter(|m| m.content == "ok").count(), 2);
    }

    #[test]
    fn unrelated_user_message_is_appended() {
        let mut r = Reconciler::new();
        r.apply(user("other_device", "from elsewhere", 5));
        r.optimistic_insert("temp_1", "mine", "s", "u");
        assert_eq!(ids(&r), vec!["other_device", "temp_1"]);
    }

    #[test]
    fn repeated_user_message_updates_in_place() {
        let mut r = Reconciler::new();
        r.apply(user("srv_1", "draft", 1));
        assert_eq!(r.apply(user("srv_1", "final", 2)), ApplyOutcome::Updated);
        assert_eq!(r.len(), 1);
        assert_eq!(r.messages()[0].content, "final");
    }

    #[test]
    fn user_messages_are_always_complete() {
        let mut r = Reconciler::new();
        let mut msg = user("srv_1", "hi", 1);
        msg.is_complete = false;
        r.apply(msg);
        assert!(r.messages()[0].is_complete);
    }

    #[test]
    fn streaming_content_is_replaced_not_accumulated() {
        let mut r = Reconciler::new();
        r.apply(assistant("a1", "Hel", 1, false));
        r.apply(assistant("a1", "Hello", 2, false));
        assert!(!r.messages()[0].is_complete);
        r.apply(assistant("a1", "Hello world", 3, true));

        assert_eq!(r.len(), 1);
        assert_eq!(r.messages()[0].content, "Hello world");
        assert!(r.messages()[0].is_complete);
    }

    #[test]
    fn chunk_after_completion_is_ignored() {
        let mut r = Reconciler::new();
        r.apply(assistant("a1", "Hello world", 3, true));
        assert_eq!(
            r.apply(assistant("a1", "Hello", 2, false)),
            ApplyOutcome::IgnoredStale
        );
        assert!(r.messages()[0].is_complete);
        assert_eq!(r.messages()[0].content, "Hello world");
    }

    #[test]
    fn completion_for_unknown_id_is_appended() {
        let mut r = Reconciler::new();
        assert_eq!(
            r.apply(assistant("a9", "orphan", 1, true)),
            ApplyOutcome::Inserted
        );
        assert_eq!(ids(&r), vec!["a9"]);
    }

    #[test]
    fn history_merge_dedupes_and_sorts() {
        let mut r = Reconciler::new();
        r.apply(user("m10", "live ten", 10));
        r.apply(assistant("m30", "live thirty", 30, true));

        let added = r.load_history(vec![
            user("m5", "five", 5),
            user("m10", "history ten", 10),
            assistant("m20", "twenty", 20, true),
        ]);

        assert_eq!(added, 2);
        let timestamps: Vec<i64> = r.messages().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![5, 10, 20, 30]);
        assert_eq!(r.get("m10").unwrap().content, "live ten");
    }

    #[test]
    fn history_into_empty_list_is_adopted_verbatim() {
        let mut r = Reconciler::new();
        r.load_history(vec![user("b", "second", 20), user("a", "first", 10)]);
        assert_eq!(ids(&r), vec!["b", "a"]);

        // Keys from the batch are registered as seen.
        assert_eq!(r.apply(user("a", "first", 10)), ApplyOutcome::Duplicate);
    }

    #[test]
    fn history_collapses_repeated_ids() {
        let mut r = Reconciler::new();
        r.load_history(vec![
            assistant("a1", "chunk1 chunk2", 2, false),
            assistant("a1", "chunk1", 1, false),
            assistant("a1", "chunk1 chunk2 chunk3", 3, false),
        ]);
        assert_eq!(r.len(), 1);
        assert_eq!(r.messages()[0].content, "chunk1 chunk2 chunk3");
    }

    #[test]
    fn history_is_a_checkpoint() {
        let mut r = Reconciler::new();
        r.apply(assistant("a1", "Hel", 1, false));
        r.optimistic_insert("temp_1", "hi", "s", "u");
        r.reserve("temp_2");

        r.load_history(vec![assistant("a1", "Hello", 2, false)]);
        assert_eq!(r.pending_count(), 0);
        // The provisional entry stays visible as the best available copy.
        assert!(r.get("temp_1").is_some());

        // Live updates keep flowing after the checkpoint.
        assert_eq!(
            r.apply(assistant("a1", "Hello!", 5, false)),
            ApplyOutcome::Updated
        );
        assert_eq!(r.get("a1").unwrap().content, "Hello!");
    }

    #[test]
    fn cancel_completes_streaming_reply() {
        let mut r = Reconciler::new();
        r.apply(assistant("a1", "partial", 1, false));
        assert!(r.mark_cancelled("a1"));
        assert!(r.messages()[0].is_complete);
        assert_eq!(r.messages()[0].content, "partial");
        assert!(!r.mark_cancelled("missing"));
    }

    #[test]
    fn apply_event_routes_envelopes() {
        let mut r = Reconciler::new();
        let effect = r.apply_event(InboundEvent::Complete {
            data: assistant("a1", "done", 1, false),
        });
        assert_eq!(effect, EventEffect::Applied(ApplyOutcome::Inserted));
        assert!(r.messages()[0].is_complete);

        let effect = r.apply_event(InboundEvent::Cancelled {
            message_id: "a1".to_string(),
        });
        assert_eq!(effect, EventEffect::Cancelled { found: true });

        let effect = r.apply_event(InboundEvent::History {
            messages: vec![user("u0", "older", 0)],
        });
        assert_eq!(effect, EventEffect::HistoryLoaded { added: 1 });
        assert_eq!(ids(&r), vec!["u0", "a1"]);

        assert_eq!(r.apply_event(InboundEvent::Pong), EventEffect::NoChange);
    }

    #[test]
    fn clear_resets_everything() {
        let mut r = Reconciler::new();
        r.optimistic_insert("temp_1", "hi", "s", "u");
        r.apply(assistant("a1", "x", 1, true));
        r.clear();

        assert!(r.is_empty());
        assert_eq!(r.pending_count(), 0);
        assert_eq!(
            r.apply(assistant("a1", "x", 1, true)),
            ApplyOutcome::Inserted
        );
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let mut r = Reconciler::new();
        r.apply(user("srv_1", "hi", 1));
        let snap = r.snapshot();
        r.apply(user("srv_2", "there", 2));
        assert_eq!(snap.len(), 1);
        assert_eq!(r.len(), 2);
    }
}
