//! Shared chat-transcript plumbing for the LLM-backed handlers.
//!
//! All model-backed variants present the same view of the conversation:
//! recent completed messages as alternating turns, then one user turn
//! carrying the trigger and whatever arrived alongside it in the batch.

use super::HandlerMessage;
use crate::domain_types::AgentName;

/// Speaker role in a chat transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// The agent itself.
    Assistant,
    /// Anyone else on the bus.
    User,
}

impl ChatRole {
    /// Wire name used by the chat APIs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::User => "user",
        }
    }
}

/// One turn of a chat transcript.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// Who is speaking.
    pub role: ChatRole,
    /// What they said.
    pub content: String,
}

/// Builds the transcript handed to a chat API: history first, oldest to
/// newest, then a final user turn with the trigger and batch context.
/// Messages from other senders are prefixed with the sender name so the
/// model can tell participants apart.
#[must_use]
pub fn build_transcript(
    agent: &AgentName,
    trigger: &HandlerMessage,
    batch: &[HandlerMessage],
    history: &[HandlerMessage],
) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(history.len() + 1);
    for message in history {
        let role = if message.sender == agent.as_str() {
            ChatRole::Assistant
        } else {
            ChatRole::User
        };
        let content = match role {
            ChatRole::Assistant => message.content.clone(),
            ChatRole::User => format!("{}: {}", message.sender, message.content),
        };
        turns.push(ChatTurn { role, content });
    }

    let mut prompt = format!("{}: {}", trigger.sender, trigger.content);
    if !batch.is_empty() {
        prompt.push_str("\n\nAlso waiting in this batch:");
        for message in batch {
            prompt.push_str(&format!("\n- {}: {}", message.sender, message.content));
        }
    }
    turns.push(ChatTurn {
        role: ChatRole::User,
        content: prompt,
    });
    turns
}

/// Collapses consecutive same-role turns, which the Anthropic messages API
/// rejects, by joining their contents.
#[must_use]
pub fn merge_consecutive_roles(turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
    let mut merged: Vec<ChatTurn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match merged.last_mut() {
            Some(last) if last.role == turn.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&turn.content);
            }
            _ => merged.push(turn),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, sender: &str, content: &str) -> HandlerMessage {
        HandlerMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn own_messages_become_assistant_turns() {
        let agent = AgentName::try_new("alpha".to_string()).unwrap();
        let history = vec![msg("h1", "bob", "hi"), msg("h2", "alpha", "hello bob")];
        let turns = build_transcript(&agent, &msg("t", "bob", "how are you"), &[], &history);

        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, ChatRole::User);
        assert_eq!(turns[0].content, "bob: hi");
        assert_eq!(turns[1].role, ChatRole::Assistant);
        assert_eq!(turns[1].content, "hello bob");
        assert_eq!(turns[2].role, ChatRole::User);
    }

    #[test]
    fn batch_context_rides_in_the_final_turn() {
        let agent = AgentName::try_new("alpha".to_string()).unwrap();
        let batch = vec![msg("b1", "carol", "me too"), msg("b2", "dave", "same here")];
        let turns = build_transcript(&agent, &msg("t", "bob", "question"), &batch, &[]);

        assert_eq!(turns.len(), 1);
        let prompt = &turns[0].content;
        assert!(prompt.starts_with("bob: question"));
        assert!(prompt.contains("carol: me too"));
        assert!(prompt.contains("dave: same here"));
    }

    #[test]
    fn consecutive_user_turns_merge() {
        let turns = vec![
            ChatTurn { role: ChatRole::User, content: "one".into() },
            ChatTurn { role: ChatRole::User, content: "two".into() },
            ChatTurn { role: ChatRole::Assistant, content: "reply".into() },
        ];
        let merged = merge_consecutive_roles(turns);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "one\n\ntwo");
    }
}
