//! Conversation transcript and turn accumulation.
//!
//! A [`ConversationContext`] holds the committed history plus at most one
//! pending turn. The pending turn buffers text per participant and commits
//! once every participant has marked its part complete, or is discarded with
//! [`ConversationContext::abort_turn`]. Only the owning session mutates it.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ContextOptions, ConversationOptions};
use crate::conversation::types::{
    CompletionReason, ParticipantInfo, ParticipantRole, SessionId, TurnId,
};
use crate::error::{Result, SessionError};

/// One participant's contribution to a committed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub participant_id: String,
    pub participant_name: String,
    pub role: ParticipantRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set for messages taken from a turn that has not committed yet.
    pub partial: bool,
}

/// A committed (or, in projections, pending) exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionTurn {
    pub turn_id: TurnId,
    pub participant_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub messages: Vec<ChatMessage>,
    pub interrupted: bool,
    pub reason: CompletionReason,
}

impl InteractionTurn {
    /// Text contributed by `participant_id`, if any.
    pub fn text_of(&self, participant_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.participant_id == participant_id)
            .map(|m| m.text.as_str())
    }
}

#[derive(Debug)]
struct PendingTurn {
    turn_id: TurnId,
    participant_ids: Vec<String>,
    started_at: DateTime<Utc>,
    buffers: HashMap<String, String>,
    completed: HashSet<String>,
    interrupted: bool,
}

/// Message role in a generator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of a generator request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequestMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Everything a generator needs to produce the assistant's reply for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub messages: Vec<ChatRequestMessage>,
}

impl ChatRequest {
    /// Content of the most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Serialize)]
struct RequestMetadata<'a> {
    topics: &'a [String],
    context: Option<&'a str>,
}

/// Transcript state owned by one session.
#[derive(Debug)]
pub struct ConversationContext {
    options: ContextOptions,
    participants: HashMap<String, ParticipantInfo>,
    history: VecDeque<InteractionTurn>,
    pending: Option<PendingTurn>,
    topics: Vec<String>,
    current_context: Option<String>,
}

impl ConversationContext {
    pub fn new(options: ContextOptions, conversation: &ConversationOptions) -> Self {
        let mut topics = options.topics.clone();
        for topic in &conversation.initial_topics {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        Self {
            options,
            participants: HashMap::new(),
            history: VecDeque::new(),
            pending: None,
            topics,
            current_context: conversation.initial_context.clone(),
        }
    }

    /// Register (or replace) a participant.
    pub fn register_participant(&mut self, participant: ParticipantInfo) {
        self.participants.insert(participant.id.clone(), participant);
    }

    pub fn participant(&self, id: &str) -> Option<&ParticipantInfo> {
        self.participants.get(id)
    }

    pub fn set_topics(&mut self, topics: Vec<String>) {
        self.topics = topics;
    }

    pub fn set_current_context(&mut self, context: Option<String>) {
        self.current_context = context;
    }

    /// Open a pending turn for the given participants.
    ///
    /// # Errors
    ///
    /// Fails if a turn is already pending or a participant is unknown.
    pub fn start_turn(&mut self, turn_id: TurnId, participant_ids: &[&str]) -> Result<()> {
        if let Some(pending) = &self.pending {
            return Err(SessionError::Context(format!(
                "turn {} is still pending",
                pending.turn_id
            )));
        }
        if let Some(unknown) = participant_ids
            .iter()
            .find(|id| !self.participants.contains_key(**id))
        {
            return Err(SessionError::Context(format!(
                "unknown participant '{unknown}'"
            )));
        }
        self.pending = Some(PendingTurn {
            turn_id,
            participant_ids: participant_ids.iter().map(|id| (*id).to_owned()).collect(),
            started_at: Utc::now(),
            buffers: HashMap::new(),
            completed: HashSet::new(),
            interrupted: false,
        });
        Ok(())
    }

    /// Append text to a participant's buffer in the pending turn.
    ///
    /// # Errors
    ///
    /// Fails if no turn is pending or the participant is not part of it.
    pub fn append_to_turn(&mut self, participant_id: &str, text: &str) -> Result<()> {
        let pending = self.pending_for(participant_id)?;
        pending
            .buffers
            .entry(participant_id.to_owned())
            .or_default()
            .push_str(text);
        Ok(())
    }

    /// Mark a participant's part complete. Commits the turn once every part is.
    ///
    /// Returns `true` if this call committed the turn.
    ///
    /// # Errors
    ///
    /// Fails if no turn is pending or the participant is not part of it.
    pub fn complete_turn_part(&mut self, participant_id: &str, interrupted: bool) -> Result<bool> {
        let pending = self.pending_for(participant_id)?;
        pending.completed.insert(participant_id.to_owned());
        pending.interrupted |= interrupted;
        let all_done = pending
            .participant_ids
            .iter()
            .all(|id| pending.completed.contains(id));
        if !all_done {
            return Ok(false);
        }
        let reason = if pending.interrupted {
            CompletionReason::Cancelled
        } else {
            CompletionReason::Completed
        };
        self.commit_pending(reason);
        Ok(true)
    }

    /// Whether `participant_id` has completed its part of the pending turn.
    pub fn is_part_complete(&self, participant_id: &str) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.completed.contains(participant_id))
    }

    /// Commit whatever the pending turn holds, regardless of completion flags.
    ///
    /// Anything other than [`CompletionReason::Completed`] marks the turn interrupted.
    /// Returns `true` if a turn was pending.
    pub fn close_turn(&mut self, reason: CompletionReason) -> bool {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.interrupted |= reason != CompletionReason::Completed;
                self.commit_pending(reason);
                true
            }
            None => false,
        }
    }

    /// Flag an already committed turn as interrupted.
    ///
    /// Used when the reply was fully generated (and committed) but the user
    /// cut playback short. Returns `false` if the turn is not in history.
    pub fn mark_interrupted(&mut self, turn_id: TurnId) -> bool {
        match self.history.iter_mut().rev().find(|t| t.turn_id == turn_id) {
            Some(turn) => {
                turn.interrupted = true;
                turn.reason = CompletionReason::Cancelled;
                true
            }
            None => false,
        }
    }

    /// Discard the pending turn without committing it.
    pub fn abort_turn(&mut self) -> Option<TurnId> {
        self.pending.take().map(|p| p.turn_id)
    }

    pub fn pending_turn_id(&self) -> Option<TurnId> {
        self.pending.as_ref().map(|p| p.turn_id)
    }

    /// Buffered text for a participant in the pending turn.
    pub fn pending_text(&self, participant_id: &str) -> Option<&str> {
        self.pending
            .as_ref()
            .and_then(|p| p.buffers.get(participant_id))
            .map(String::as_str)
    }

    /// Committed turns, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &InteractionTurn> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Committed history followed by a snapshot of the pending turn, if any.
    pub fn projected_history(&self) -> Vec<InteractionTurn> {
        let mut turns: Vec<_> = self.history.iter().cloned().collect();
        if let Some(pending) = &self.pending {
            turns.push(InteractionTurn {
                turn_id: pending.turn_id,
                participant_ids: pending.participant_ids.clone(),
                started_at: pending.started_at,
                ended_at: None,
                messages: self.messages_of(pending, true),
                interrupted: pending.interrupted,
                reason: CompletionReason::Completed,
            });
        }
        turns
    }

    /// Build the generator request for `turn_id` from the projected history.
    pub fn build_request(&self, session_id: SessionId, turn_id: TurnId) -> ChatRequest {
        let mut messages = Vec::new();
        if !self.options.system_prompt.is_empty() {
            messages.push(ChatRequestMessage {
                role: ChatRole::System,
                content: self.options.system_prompt.clone(),
            });
        }

        let metadata = RequestMetadata {
            topics: &self.topics,
            context: self.current_context.as_deref(),
        };
        if let Ok(content) = serde_json::to_string(&metadata) {
            messages.push(ChatRequestMessage {
                role: ChatRole::User,
                content,
            });
        }

        for turn in self.projected_history() {
            for message in turn.messages {
                let request_message = match message.role {
                    ParticipantRole::Assistant => ChatRequestMessage {
                        role: ChatRole::Assistant,
                        content: message.text,
                    },
                    ParticipantRole::Human => ChatRequestMessage {
                        role: ChatRole::User,
                        content: format!("[{}]{}", message.participant_name, message.text),
                    },
                };
                messages.push(request_message);
            }
        }

        ChatRequest {
            session_id,
            turn_id,
            messages,
        }
    }

    fn pending_for(&mut self, participant_id: &str) -> Result<&mut PendingTurn> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| SessionError::Context("no turn in progress".to_owned()))?;
        if !pending.participant_ids.iter().any(|id| id == participant_id) {
            return Err(SessionError::Context(format!(
                "participant '{participant_id}' is not part of turn {}",
                pending.turn_id
            )));
        }
        Ok(pending)
    }

    fn messages_of(&self, pending: &PendingTurn, partial: bool) -> Vec<ChatMessage> {
        let now = Utc::now();
        pending
            .participant_ids
            .iter()
            .filter_map(|id| {
                let text = pending.buffers.get(id)?;
                if text.trim().is_empty() {
                    return None;
                }
                let participant = self.participants.get(id)?;
                Some(ChatMessage {
                    message_id: Uuid::new_v4(),
                    participant_id: id.clone(),
                    participant_name: participant.name.clone(),
                    role: participant.role,
                    text: text.clone(),
                    timestamp: now,
                    partial,
                })
            })
            .collect()
    }

    fn commit_pending(&mut self, reason: CompletionReason) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let messages = self.messages_of(&pending, false);
        if messages.is_empty() {
            return;
        }
        self.history.push_back(InteractionTurn {
            turn_id: pending.turn_id,
            participant_ids: pending.participant_ids,
            started_at: pending.started_at,
            ended_at: Some(Utc::now()),
            messages,
            interrupted: pending.interrupted,
            reason,
        });
        let max = self.options.max_history_turns;
        while max > 0 && self.history.len() > max {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn context() -> ConversationContext {
        let mut ctx = ConversationContext::new(ContextOptions::default(), &ConversationOptions::default());
        ctx.register_participant(ParticipantInfo::human("user", "Sam"));
        ctx.register_participant(ParticipantInfo::assistant("assistant", "Assistant"));
        ctx
    }

    #[test]
    fn turn_commits_once_every_part_is_complete() {
        let mut ctx = context();
        let turn = TurnId::new();
        ctx.start_turn(turn, &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "hello").unwrap();
        assert!(!ctx.complete_turn_part("user", false).unwrap());
        for chunk in ["a", "b", "c"] {
            ctx.append_to_turn("assistant", chunk).unwrap();
        }
        assert_eq!(ctx.pending_text("assistant"), Some("abc"));
        assert!(ctx.complete_turn_part("assistant", false).unwrap());

        let committed: Vec<_> = ctx.history().collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].turn_id, turn);
        assert_eq!(committed[0].text_of("user"), Some("hello"));
        assert_eq!(committed[0].text_of("assistant"), Some("abc"));
        assert!(!committed[0].interrupted);
        assert!(ctx.pending_turn_id().is_none());
    }

    #[test]
    fn interrupted_part_flags_the_turn() {
        let mut ctx = context();
        ctx.start_turn(TurnId::new(), &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "tell me a story").unwrap();
        ctx.complete_turn_part("user", false).unwrap();
        ctx.append_to_turn("assistant", "Once upon").unwrap();
        ctx.complete_turn_part("assistant", true).unwrap();

        let turn = ctx.history().next().unwrap();
        assert!(turn.interrupted);
        assert_eq!(turn.reason, CompletionReason::Cancelled);
        assert_eq!(turn.text_of("assistant"), Some("Once upon"));
    }

    #[test]
    fn whitespace_messages_are_skipped_and_empty_turns_dropped() {
        let mut ctx = context();
        ctx.start_turn(TurnId::new(), &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "   ").unwrap();
        ctx.complete_turn_part("user", false).unwrap();
        ctx.complete_turn_part("assistant", false).unwrap();
        assert_eq!(ctx.history_len(), 0);
    }

    #[test]
    fn abort_discards_pending_text() {
        let mut ctx = context();
        let turn = TurnId::new();
        ctx.start_turn(turn, &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "hi").unwrap();
        assert_eq!(ctx.abort_turn(), Some(turn));
        assert_eq!(ctx.abort_turn(), None);
        assert_eq!(ctx.history_len(), 0);
        assert!(ctx.pending_text("user").is_none());
    }

    #[test]
    fn mark_interrupted_flags_committed_turn() {
        let mut ctx = context();
        let turn = TurnId::new();
        ctx.start_turn(turn, &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "hi").unwrap();
        ctx.complete_turn_part("user", false).unwrap();
        ctx.append_to_turn("assistant", "Hello there").unwrap();
        ctx.complete_turn_part("assistant", false).unwrap();

        assert!(ctx.mark_interrupted(turn));
        assert!(!ctx.mark_interrupted(TurnId::new()));
        let committed = ctx.history().next().unwrap();
        assert!(committed.interrupted);
        assert_eq!(committed.reason, CompletionReason::Cancelled);
    }

    #[test]
    fn close_turn_commits_with_reason() {
        let mut ctx = context();
        ctx.start_turn(TurnId::new(), &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "hi").unwrap();
        assert!(ctx.close_turn(CompletionReason::Error));
        assert!(!ctx.close_turn(CompletionReason::Error));

        let turn = ctx.history().next().unwrap();
        assert_eq!(turn.reason, CompletionReason::Error);
        assert!(turn.interrupted);
    }

    #[test]
    fn start_turn_rejects_unknown_participant_and_double_start() {
        let mut ctx = context();
        let err = ctx.start_turn(TurnId::new(), &["user", "ghost"]).unwrap_err();
        assert!(matches!(err, SessionError::Context(_)));

        ctx.start_turn(TurnId::new(), &["user", "assistant"]).unwrap();
        assert!(ctx.start_turn(TurnId::new(), &["user"]).is_err());
    }

    #[test]
    fn append_requires_active_turn_and_member() {
        let mut ctx = context();
        assert!(ctx.append_to_turn("user", "x").is_err());
        ctx.register_participant(ParticipantInfo::human("guest", "Guest"));
        ctx.start_turn(TurnId::new(), &["user", "assistant"]).unwrap();
        assert!(ctx.append_to_turn("guest", "x").is_err());
    }

    #[test]
    fn history_is_capped_at_max_turns() {
        let options = ContextOptions {
            max_history_turns: 2,
            ..ContextOptions::default()
        };
        let mut ctx = ConversationContext::new(options, &ConversationOptions::default());
        ctx.register_participant(ParticipantInfo::human("user", "Sam"));
        let mut ids = Vec::new();
        for i in 0..3 {
            let turn = TurnId::new();
            ids.push(turn);
            ctx.start_turn(turn, &["user"]).unwrap();
            ctx.append_to_turn("user", &format!("message {i}")).unwrap();
            ctx.complete_turn_part("user", false).unwrap();
        }
        let kept: Vec<_> = ctx.history().map(|t| t.turn_id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }

    #[test]
    fn zero_max_turns_keeps_everything() {
        let options = ContextOptions {
            max_history_turns: 0,
            ..ContextOptions::default()
        };
        let mut ctx = ConversationContext::new(options, &ConversationOptions::default());
        ctx.register_participant(ParticipantInfo::human("user", "Sam"));
        for _ in 0..150 {
            ctx.start_turn(TurnId::new(), &["user"]).unwrap();
            ctx.append_to_turn("user", "x").unwrap();
            ctx.complete_turn_part("user", false).unwrap();
        }
        assert_eq!(ctx.history_len(), 150);
    }

    #[test]
    fn projected_history_includes_pending_snapshot() {
        let mut ctx = context();
        ctx.start_turn(TurnId::new(), &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "what time is it").unwrap();
        let projected = ctx.projected_history();
        assert_eq!(projected.len(), 1);
        assert!(projected[0].messages[0].partial);
        assert_eq!(ctx.history_len(), 0);
    }

    #[test]
    fn request_has_system_metadata_and_prefixed_user_text() {
        let conversation = ConversationOptions {
            initial_topics: vec!["travel".to_owned()],
            initial_context: Some("at the airport".to_owned()),
            ..ConversationOptions::default()
        };
        let mut ctx = ConversationContext::new(ContextOptions::default(), &conversation);
        ctx.register_participant(ParticipantInfo::human("user", "Sam"));
        ctx.register_participant(ParticipantInfo::assistant("assistant", "Assistant"));

        let first = TurnId::new();
        ctx.start_turn(first, &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "hi").unwrap();
        ctx.complete_turn_part("user", false).unwrap();
        ctx.append_to_turn("assistant", "Hello!").unwrap();
        ctx.complete_turn_part("assistant", false).unwrap();

        let second = TurnId::new();
        ctx.start_turn(second, &["user", "assistant"]).unwrap();
        ctx.append_to_turn("user", "where is gate 4").unwrap();
        ctx.complete_turn_part("user", false).unwrap();

        let session = SessionId::new();
        let request = ctx.build_request(session, second);
        assert_eq!(request.turn_id, second);
        assert_eq!(request.messages[0].role, ChatRole::System);

        let metadata: serde_json::Value =
            serde_json::from_str(&request.messages[1].content).expect("metadata is json");
        assert_eq!(metadata["topics"][0], "travel");
        assert_eq!(metadata["context"], "at the airport");

        let rest: Vec<_> = request.messages[2..]
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            rest,
            vec![
                (ChatRole::User, "[Sam]hi"),
                (ChatRole::Assistant, "Hello!"),
                (ChatRole::User, "[Sam]where is gate 4"),
            ]
        );
        assert_eq!(request.last_user_message(), Some("[Sam]where is gate 4"));
    }
}
