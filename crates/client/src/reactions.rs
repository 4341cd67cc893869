//! Per-message reactions with an optimistic overlay.
//!
//! The server's last snapshot is stored on the [`Message`]; local changes not
//! yet confirmed live in an overlay of [`PendingReaction`]s keyed by message
//! id. A user has at most one active reaction per message.

use std::collections::{BTreeMap, HashMap};

use parley_shared::{
    topics, GroupId, MessageId, ReactionAction, ReactionRequest, ReactionSnapshot, UserId,
};
use thiserror::Error;

use crate::connection::FrameSink;
use crate::sync::Message;

/// One local change waiting for the server's snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReaction {
    Add(String),
    Remove(String),
    /// Admin removal of every reaction on the message.
    RemoveAll,
}

/// The state of a toggle, as applied locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionTransition {
    Added(String),
    Removed(String),
    Replaced { from: String, to: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReactionError {
    #[error("message {0} is not loaded")]
    UnknownMessage(MessageId),
    #[error("message has not been confirmed by the server yet")]
    Unconfirmed,
    #[error("emoji must not be empty")]
    EmptyEmoji,
    #[error("not connected; the reaction change was rolled back")]
    NotConnected,
}

/// Reactions as they should be displayed right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionView {
    /// Effective counts; emojis at zero are absent.
    pub counts: BTreeMap<String, u32>,
    pub total: u32,
    pub mine: Option<String>,
}

#[derive(Debug)]
pub struct ReactionState {
    user_id: UserId,
    overlays: HashMap<MessageId, Vec<PendingReaction>>,
}

/// How to take back one overlay step.
enum Undo {
    Pop,
    Restore(PendingReaction),
}

/// Append `next`, or drop the last entry when `next` exactly cancels it.
fn push_or_cancel(overlay: &mut Vec<PendingReaction>, next: PendingReaction) -> Undo {
    let cancels = match (overlay.last(), &next) {
        (Some(PendingReaction::Add(a)), PendingReaction::Remove(b))
        | (Some(PendingReaction::Remove(a)), PendingReaction::Add(b)) => a == b,
        _ => false,
    };
    match overlay.pop() {
        Some(last) if cancels => Undo::Restore(last),
        last => {
            overlay.extend(last);
            overlay.push(next);
            Undo::Pop
        }
    }
}

impl ReactionState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            overlays: HashMap::new(),
        }
    }

    pub fn pending(&self, message_id: MessageId) -> &[PendingReaction] {
        self.overlays
            .get(&message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// React with `emoji`, un-react if it is already ours, or swap our
    /// current reaction for it.
    ///
    /// The overlay is updated before anything is sent. A refused frame rolls
    /// back its own overlay entry; for a replace whose remove frame went out
    /// but whose add did not, the remove stays pending. A step that exactly
    /// undoes the last pending entry cancels it instead of growing the overlay.
    pub fn toggle_reaction<S: FrameSink>(
        &mut self,
        sink: &S,
        group_id: GroupId,
        message: &Message,
        emoji: &str,
    ) -> Result<ReactionTransition, ReactionError> {
        let message_id = message.id.ok_or(ReactionError::Unconfirmed)?;
        if emoji.trim().is_empty() {
            return Err(ReactionError::EmptyEmoji);
        }

        let transition = match self.mine(message) {
            Some(current) if current == emoji => ReactionTransition::Removed(current),
            Some(current) => ReactionTransition::Replaced {
                from: current,
                to: emoji.to_string(),
            },
            None => ReactionTransition::Added(emoji.to_string()),
        };

        let steps: Vec<(PendingReaction, ReactionAction, String)> = match &transition {
            ReactionTransition::Added(e) => {
                vec![(PendingReaction::Add(e.clone()), ReactionAction::React, e.clone())]
            }
            ReactionTransition::Removed(e) => vec![(
                PendingReaction::Remove(e.clone()),
                ReactionAction::RemoveReaction,
                e.clone(),
            )],
            ReactionTransition::Replaced { from, to } => vec![
                (
                    PendingReaction::Remove(from.clone()),
                    ReactionAction::RemoveReaction,
                    from.clone(),
                ),
                (PendingReaction::Add(to.clone()), ReactionAction::React, to.clone()),
            ],
        };

        // Both halves of a replace land in the overlay before either frame
        let overlay = self.overlays.entry(message_id).or_default();
        let undo: Vec<Undo> = steps
            .iter()
            .map(|(pending, _, _)| push_or_cancel(overlay, pending.clone()))
            .collect();

        let destination = topics::group_react(group_id);
        for (sent, (_, action, emoji)) in steps.into_iter().enumerate() {
            let request = ReactionRequest {
                group_id,
                message_id,
                reaction: Some(emoji),
                action,
            };
            if !sink.send_json(&destination, &request) {
                for step in undo.into_iter().skip(sent).rev() {
                    match step {
                        Undo::Pop => {
                            overlay.pop();
                        }
                        Undo::Restore(cancelled) => overlay.push(cancelled),
                    }
                }
                if overlay.is_empty() {
                    self.overlays.remove(&message_id);
                }
                tracing::warn!("Reaction on message {} not sent, rolled back", message_id);
                return Err(ReactionError::NotConnected);
            }
        }
        Ok(transition)
    }

    /// Remove every reaction on a message (moderators only; the server
    /// enforces the permission).
    pub fn remove_all<S: FrameSink>(
        &mut self,
        sink: &S,
        group_id: GroupId,
        message_id: MessageId,
    ) -> Result<(), ReactionError> {
        let overlay = self.overlays.entry(message_id).or_default();
        overlay.push(PendingReaction::RemoveAll);

        let request = ReactionRequest {
            group_id,
            message_id,
            reaction: None,
            action: ReactionAction::RemoveAllReactions,
        };
        if sink.send_json(&topics::group_react(group_id), &request) {
            return Ok(());
        }
        overlay.pop();
        if overlay.is_empty() {
            self.overlays.remove(&message_id);
        }
        Err(ReactionError::NotConnected)
    }

    /// Our reaction on `message`, preferring the overlay over the snapshot.
    pub fn mine(&self, message: &Message) -> Option<String> {
        let overlay = message.id.map(|id| self.pending(id)).unwrap_or_default();
        match overlay.last() {
            Some(PendingReaction::Add(emoji)) => Some(emoji.clone()),
            Some(PendingReaction::Remove(_) | PendingReaction::RemoveAll) => None,
            None => message
                .reactions
                .iter()
                .find(|r| r.user_id == self.user_id)
                .map(|r| r.emoji.clone()),
        }
    }

    /// Snapshot plus overlay, each count clamped at zero.
    pub fn view(&self, message: &Message) -> ReactionView {
        let overlay = message.id.map(|id| self.pending(id)).unwrap_or_default();
        if overlay.is_empty() {
            let counts: BTreeMap<String, u32> = message
                .reaction_counts
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(e, n)| (e.clone(), *n))
                .collect();
            return ReactionView {
                counts,
                total: message.total_reaction_count,
                mine: self.mine(message),
            };
        }

        // Everything before the last RemoveAll is superseded by it
        let (mut counts, ops): (BTreeMap<String, i64>, &[PendingReaction]) =
            match overlay.iter().rposition(|p| *p == PendingReaction::RemoveAll) {
                Some(pos) => (BTreeMap::new(), &overlay[pos + 1..]),
                None => (
                    message
                        .reaction_counts
                        .iter()
                        .map(|(e, n)| (e.clone(), i64::from(*n)))
                        .collect(),
                    overlay,
                ),
            };
        for op in ops {
            match op {
                PendingReaction::Add(e) => *counts.entry(e.clone()).or_default() += 1,
                PendingReaction::Remove(e) => *counts.entry(e.clone()).or_default() -= 1,
                PendingReaction::RemoveAll => {}
            }
        }

        let counts: BTreeMap<String, u32> = counts
            .into_iter()
            .filter_map(|(e, n)| u32::try_from(n).ok().filter(|n| *n > 0).map(|n| (e, n)))
            .collect();
        ReactionView {
            total: counts.values().sum(),
            counts,
            mine: self.mine(message),
        }
    }

    /// Take the server's reaction state for `message` and drop the overlay.
    ///
    /// Exception: when the overlay ends in a replace and the snapshot shows
    /// the old reaction gone but the new one not yet applied, the pending add
    /// is kept so the message never shows us as not reacting.
    pub fn apply_snapshot(&mut self, message: &mut Message, snapshot: ReactionSnapshot) -> bool {
        if message.id != Some(snapshot.message_id) {
            tracing::warn!(
                "Snapshot for message {} applied to {:?}",
                snapshot.message_id,
                message.id
            );
            return false;
        }

        let overlay = self.overlays.remove(&snapshot.message_id).unwrap_or_default();
        let ours = snapshot
            .reactions
            .iter()
            .find(|r| r.user_id == self.user_id)
            .map(|r| r.emoji.as_str());

        if let [.., PendingReaction::Remove(from), PendingReaction::Add(to)] = overlay.as_slice() {
            if from != to && ours != Some(from.as_str()) && ours != Some(to.as_str()) {
                tracing::debug!("Keeping pending {} on message {}", to, snapshot.message_id);
                self.overlays
                    .insert(snapshot.message_id, vec![PendingReaction::Add(to.clone())]);
            }
        }

        message.reactions = snapshot.reactions;
        message.reaction_counts = snapshot.reaction_counts;
        message.total_reaction_count = snapshot.total_reaction_count;
        true
    }

    /// Forget overlays, e.g. when the owning conversation is evicted.
    pub fn forget(&mut self, message_id: MessageId) {
        self.overlays.remove(&message_id);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::Utc;
    use parley_shared::{MessageType, ReactionEntry, SenderInfo};
    use proptest::prelude::*;
    use serde_json::Value;

    use super::*;

    const ME: UserId = 1;

    /// Accepts the first `budget` frames, then refuses.
    struct Sink {
        budget: RefCell<usize>,
        sent: RefCell<Vec<Value>>,
    }

    impl Sink {
        fn accepting(budget: usize) -> Self {
            Self {
                budget: RefCell::new(budget),
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl FrameSink for Sink {
        fn send_frame(&self, destination: &str, payload: &Value) -> bool {
            assert_eq!(destination, "/app/group/3/react");
            let mut budget = self.budget.borrow_mut();
            if *budget == 0 {
                return false;
            }
            *budget -= 1;
            self.sent.borrow_mut().push(payload.clone());
            true
        }
    }

    fn message(id: MessageId, counts: &[(&str, u32)], reactions: &[(UserId, &str)]) -> Message {
        let reaction_counts: BTreeMap<String, u32> =
            counts.iter().map(|(e, n)| (e.to_string(), *n)).collect();
        Message {
            id: Some(id),
            temp_id: None,
            content: "hi".into(),
            sender: SenderInfo {
                id: 2,
                username: "bo".into(),
                display_name: None,
                avatar_url: None,
            },
            created_at: Utc::now(),
            message_type: MessageType::Text,
            reactions: reactions
                .iter()
                .map(|(user_id, e)| ReactionEntry {
                    user_id: *user_id,
                    emoji: e.to_string(),
                })
                .collect(),
            total_reaction_count: reaction_counts.values().sum(),
            reaction_counts,
            is_optimistic: false,
        }
    }

    fn snapshot(id: MessageId, counts: &[(&str, u32)], reactions: &[(UserId, &str)]) -> ReactionSnapshot {
        let m = message(id, counts, reactions);
        ReactionSnapshot {
            message_id: id,
            reactions: m.reactions,
            reaction_counts: m.reaction_counts,
            total_reaction_count: m.total_reaction_count,
        }
    }

    fn counts(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(e, n)| (e.to_string(), *n)).collect()
    }

    #[test]
    fn add_is_visible_until_snapshot_confirms() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let mut msg = message(7, &[("❤️", 3)], &[(2, "❤️"), (3, "❤️"), (4, "❤️")]);

        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "❤️"),
            Ok(ReactionTransition::Added("❤️".into()))
        );
        let view = state.view(&msg);
        assert_eq!(view.counts, counts(&[("❤️", 4)]));
        assert_eq!(view.total, 4);
        assert_eq!(view.mine.as_deref(), Some("❤️"));
        assert_eq!(sink.sent.borrow()[0]["action"], "react");

        let confirmed = snapshot(7, &[("❤️", 4)], &[(2, "❤️"), (3, "❤️"), (4, "❤️"), (ME, "❤️")]);
        assert!(state.apply_snapshot(&mut msg, confirmed));
        assert!(state.pending(7).is_empty());
        assert_eq!(state.view(&msg).counts, counts(&[("❤️", 4)]));
        assert_eq!(state.view(&msg).mine.as_deref(), Some("❤️"));
    }

    #[test]
    fn replace_applies_both_halves_at_once() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let msg = message(9, &[("👍", 2)], &[(ME, "👍"), (5, "👍")]);

        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "❤️"),
            Ok(ReactionTransition::Replaced {
                from: "👍".into(),
                to: "❤️".into()
            })
        );
        let view = state.view(&msg);
        assert_eq!(view.counts, counts(&[("❤️", 1), ("👍", 1)]));
        assert_eq!(view.mine.as_deref(), Some("❤️"));

        let sent = sink.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["action"], "remove_reaction");
        assert_eq!(sent[0]["reaction"], "👍");
        assert_eq!(sent[1]["action"], "react");
        assert_eq!(sent[1]["reaction"], "❤️");
    }

    #[test]
    fn toggling_own_reaction_removes_it() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let msg = message(4, &[("🔥", 1)], &[(ME, "🔥")]);

        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "🔥"),
            Ok(ReactionTransition::Removed("🔥".into()))
        );
        let view = state.view(&msg);
        assert!(view.counts.is_empty());
        assert_eq!(view.total, 0);
        assert_eq!(view.mine, None);
    }

    #[test]
    fn counts_never_go_negative() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        // Snapshot says we reacted but the count already dropped to zero
        let msg = message(4, &[("🔥", 0)], &[(ME, "🔥")]);
        state.toggle_reaction(&sink, 3, &msg, "🔥").unwrap();
        assert!(state.view(&msg).counts.is_empty());
    }

    #[test]
    fn pending_add_survives_a_half_applied_replace() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let mut msg = message(9, &[("👍", 2)], &[(ME, "👍"), (5, "👍")]);
        state.toggle_reaction(&sink, 3, &msg, "❤️").unwrap();

        state.apply_snapshot(&mut msg, snapshot(9, &[("👍", 1)], &[(5, "👍")]));
        assert_eq!(state.pending(9), &[PendingReaction::Add("❤️".into())]);
        let view = state.view(&msg);
        assert_eq!(view.counts, counts(&[("❤️", 1), ("👍", 1)]));
        assert_eq!(view.mine.as_deref(), Some("❤️"));

        state.apply_snapshot(&mut msg, snapshot(9, &[("❤️", 1), ("👍", 1)], &[(5, "👍"), (ME, "❤️")]));
        assert!(state.pending(9).is_empty());
        assert_eq!(state.view(&msg).mine.as_deref(), Some("❤️"));
    }

    #[test]
    fn snapshot_for_another_message_is_refused() {
        let mut state = ReactionState::new(ME);
        let mut msg = message(1, &[], &[]);
        assert!(!state.apply_snapshot(&mut msg, snapshot(2, &[("👍", 1)], &[(5, "👍")])));
        assert!(msg.reaction_counts.is_empty());
    }

    #[test]
    fn refused_send_rolls_back() {
        let sink = Sink::accepting(0);
        let mut state = ReactionState::new(ME);
        let msg = message(7, &[("❤️", 3)], &[]);
        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "❤️"),
            Err(ReactionError::NotConnected)
        );
        assert!(state.pending(7).is_empty());
        assert_eq!(state.view(&msg).counts, counts(&[("❤️", 3)]));
    }

    #[test]
    fn replace_with_refused_add_keeps_the_sent_remove() {
        let sink = Sink::accepting(1);
        let mut state = ReactionState::new(ME);
        let msg = message(9, &[("👍", 2)], &[(ME, "👍"), (5, "👍")]);
        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "❤️"),
            Err(ReactionError::NotConnected)
        );
        assert_eq!(state.pending(9), &[PendingReaction::Remove("👍".into())]);
        assert_eq!(state.view(&msg).mine, None);
    }

    #[test]
    fn repeated_toggles_cancel_in_the_overlay() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let msg = message(4, &[("👍", 1)], &[(5, "👍")]);

        for _ in 0..50 {
            state.toggle_reaction(&sink, 3, &msg, "👍").unwrap();
            assert_eq!(state.pending(4), &[PendingReaction::Add("👍".into())]);
            state.toggle_reaction(&sink, 3, &msg, "👍").unwrap();
            assert!(state.pending(4).is_empty());
        }
        assert_eq!(sink.sent.borrow().len(), 100);

        state.toggle_reaction(&sink, 3, &msg, "👍").unwrap();
        state.toggle_reaction(&sink, 3, &msg, "❤️").unwrap();
        assert_eq!(state.pending(4), &[PendingReaction::Add("❤️".into())]);
        assert_eq!(state.view(&msg).counts, counts(&[("❤️", 1), ("👍", 1)]));
    }

    #[test]
    fn refused_cancel_restores_the_pending_entry() {
        let sink = Sink::accepting(1);
        let mut state = ReactionState::new(ME);
        let msg = message(4, &[], &[]);

        state.toggle_reaction(&sink, 3, &msg, "👍").unwrap();
        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "👍"),
            Err(ReactionError::NotConnected)
        );
        assert_eq!(state.pending(4), &[PendingReaction::Add("👍".into())]);
        assert_eq!(state.view(&msg).mine.as_deref(), Some("👍"));
    }

    #[test]
    fn unconfirmed_messages_cannot_be_reacted_to() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let mut msg = message(1, &[], &[]);
        msg.id = None;
        assert_eq!(
            state.toggle_reaction(&sink, 3, &msg, "👍"),
            Err(ReactionError::Unconfirmed)
        );
    }

    #[test]
    fn remove_all_hides_everything_until_snapshot() {
        let sink = Sink::accepting(usize::MAX);
        let mut state = ReactionState::new(ME);
        let mut msg = message(5, &[("👍", 2), ("😂", 1)], &[(ME, "👍"), (6, "👍"), (7, "😂")]);

        state.remove_all(&sink, 3, 5).unwrap();
        assert_eq!(sink.sent.borrow()[0]["action"], "remove_all_reactions");
        assert!(sink.sent.borrow()[0].get("reaction").is_none());
        assert_eq!(state.view(&msg), ReactionView::default());

        state.apply_snapshot(&mut msg, snapshot(5, &[], &[]));
        assert!(state.pending(5).is_empty());
    }

    proptest! {
        #[test]
        fn effective_count_is_clamped_sum(
            server in 0u32..5,
            toggles in prop::collection::vec(prop::sample::select(vec!["👍", "❤️", "😂"]), 0..12)
        ) {
            let sink = Sink::accepting(usize::MAX);
            let mut state = ReactionState::new(ME);
            let msg = message(1, &[("👍", server)], &[]);
            for emoji in toggles {
                state.toggle_reaction(&sink, 3, &msg, emoji).unwrap();
            }

            let mut expected: BTreeMap<String, i64> = BTreeMap::new();
            expected.insert("👍".into(), i64::from(server));
            for op in state.pending(1) {
                match op {
                    PendingReaction::Add(e) => *expected.entry(e.clone()).or_default() += 1,
                    PendingReaction::Remove(e) => *expected.entry(e.clone()).or_default() -= 1,
                    PendingReaction::RemoveAll => unreachable!(),
                }
            }

            let view = state.view(&msg);
            for (emoji, delta) in expected {
                let shown = view.counts.get(&emoji).copied().unwrap_or(0);
                prop_assert_eq!(i64::from(shown), delta.max(0));
            }
            prop_assert_eq!(view.total, view.counts.values().sum::<u32>());
            prop_assert!(view.counts.values().all(|n| *n > 0));
        }
    }
}
