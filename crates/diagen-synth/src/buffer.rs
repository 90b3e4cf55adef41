//! Token-bounded conversation buffer

use std::collections::VecDeque;
use std::sync::Arc;

use diagen_ai::{Message, Role, TokenEstimator, Vendor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serializable state of a [`ConversationBuffer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    pub max_tokens: usize,
    pub current_tokens: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    tokens: usize,
}

/// Ordered messages bounded by a token budget.
///
/// `current_tokens` always equals the sum of the retained messages' token
/// counts. Oldest whole messages are evicted until the total fits, except that
/// the last remaining message is never evicted even when it alone exceeds the
/// budget.
pub struct ConversationBuffer {
    estimator: Arc<dyn TokenEstimator>,
    vendor: Vendor,
    max_tokens: usize,
    current_tokens: usize,
    entries: VecDeque<Entry>,
    human_label: String,
    ai_label: String,
}

impl std::fmt::Debug for ConversationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationBuffer")
            .field("vendor", &self.vendor)
            .field("max_tokens", &self.max_tokens)
            .field("current_tokens", &self.current_tokens)
            .field("messages", &self.entries.len())
            .finish()
    }
}

impl ConversationBuffer {
    /// Create an empty buffer. Fails when `max_tokens` is zero.
    pub fn new(
        max_tokens: usize,
        estimator: Arc<dyn TokenEstimator>,
        vendor: Vendor,
    ) -> Result<Self> {
        if max_tokens == 0 {
            return Err(Error::InvalidConfig(
                "conversation buffer needs a budget of at least one token".into(),
            ));
        }
        Ok(Self {
            estimator,
            vendor,
            max_tokens,
            current_tokens: 0,
            entries: VecDeque::new(),
            human_label: "Human".into(),
            ai_label: "AI".into(),
        })
    }

    /// Override the labels used by [`Self::to_display_string`]
    pub fn with_labels(mut self, human: impl Into<String>, ai: impl Into<String>) -> Self {
        self.human_label = human.into();
        self.ai_label = ai.into();
        self
    }

    /// Rebuild a buffer from a snapshot.
    ///
    /// Token counts are re-estimated and eviction re-applied, so the stored
    /// `current_tokens` is informational only.
    pub fn restore(
        snapshot: BufferSnapshot,
        estimator: Arc<dyn TokenEstimator>,
        vendor: Vendor,
    ) -> Result<Self> {
        let mut buffer = Self::new(snapshot.max_tokens, estimator, vendor)?;
        buffer.append_all(snapshot.messages)?;
        Ok(buffer)
    }

    /// Append a message, evicting from the front to stay within budget.
    ///
    /// On estimation failure the buffer is left unchanged.
    pub fn append(&mut self, message: Message) -> Result<()> {
        let tokens = self.estimator.estimate(&message.content, self.vendor)?;

        self.current_tokens += tokens;
        self.entries.push_back(Entry { message, tokens });

        while self.current_tokens > self.max_tokens && self.entries.len() > 1 {
            if let Some(evicted) = self.entries.pop_front() {
                self.current_tokens -= evicted.tokens;
                tracing::debug!(
                    role = evicted.message.role.as_str(),
                    tokens = evicted.tokens,
                    current_tokens = self.current_tokens,
                    max_tokens = self.max_tokens,
                    "evicted message from conversation buffer"
                );
            }
        }

        Ok(())
    }

    /// Append several messages in order
    pub fn append_all(&mut self, messages: impl IntoIterator<Item = Message>) -> Result<()> {
        for message in messages {
            self.append(message)?;
        }
        Ok(())
    }

    /// Retained messages, oldest first
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Render the conversation as `label: content` lines
    pub fn to_display_string(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                let label = match e.message.role {
                    Role::User => &self.human_label,
                    _ => &self.ai_label,
                };
                format!("{}: {}", label, e.message.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Capture the buffer state
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            max_tokens: self.max_tokens,
            current_tokens: self.current_tokens,
            messages: self.messages(),
        }
    }

    pub fn current_tokens(&self) -> usize {
        self.current_tokens
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Tokens left before eviction kicks in (zero when over budget)
    pub fn remaining_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.current_tokens)
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagen_ai::HeuristicEstimator;

    /// One token per character, no overhead.
    struct CharEstimator;

    impl TokenEstimator for CharEstimator {
        fn estimate(&self, text: &str, _vendor: Vendor) -> diagen_ai::Result<usize> {
            Ok(text.chars().count())
        }
    }

    struct FailingEstimator;

    impl TokenEstimator for FailingEstimator {
        fn estimate(&self, text: &str, _vendor: Vendor) -> diagen_ai::Result<usize> {
            if text.contains("boom") {
                Err(diagen_ai::Error::TokenEstimation("tokenizer crashed".into()))
            } else {
                Ok(1)
            }
        }
    }

    fn buffer(max: usize) -> ConversationBuffer {
        ConversationBuffer::new(max, Arc::new(CharEstimator), Vendor::OpenAI).unwrap()
    }

    fn assert_invariant(buf: &ConversationBuffer) {
        let sum: usize = buf.messages().iter().map(|m| m.content.chars().count()).sum();
        assert_eq!(buf.current_tokens(), sum);
        assert!(buf.current_tokens() <= buf.max_tokens() || buf.len() == 1);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = ConversationBuffer::new(0, Arc::new(CharEstimator), Vendor::OpenAI).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_evicts_oldest_whole_messages() {
        let mut buf = buffer(10);
        buf.append(Message::system("aaaa")).unwrap();
        buf.append(Message::user("bbbb")).unwrap();
        assert_eq!(buf.current_tokens(), 8);

        buf.append(Message::assistant("cccc")).unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.messages()[0].content, "bbbb");
        assert_eq!(buf.current_tokens(), 8);
        assert_invariant(&buf);
    }

    #[test]
    fn test_invariant_holds_after_every_append() {
        let mut buf = buffer(25);
        for i in 0..40 {
            let content = "x".repeat(i % 9 + 1);
            let msg = if i % 2 == 0 {
                Message::user(content)
            } else {
                Message::assistant(content)
            };
            buf.append(msg).unwrap();
            assert_invariant(&buf);
        }
    }

    #[test]
    fn test_oversized_single_message_is_retained() {
        let mut buf = buffer(5);
        buf.append(Message::user("short")).unwrap();
        buf.append(Message::user("this is far too long")).unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.current_tokens(), 20);
        assert_eq!(buf.remaining_tokens(), 0);
        assert_invariant(&buf);
    }

    #[test]
    fn test_estimation_failure_leaves_buffer_unchanged() {
        let mut buf =
            ConversationBuffer::new(10, Arc::new(FailingEstimator), Vendor::Anthropic).unwrap();
        buf.append(Message::user("fine")).unwrap();
        let err = buf.append(Message::user("boom")).unwrap_err();
        assert!(matches!(err, Error::TokenEstimation(_)));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.current_tokens(), 1);
    }

    #[test]
    fn test_display_string_labels() {
        let mut buf = buffer(100);
        buf.append_all([
            Message::system("be helpful"),
            Message::user("draw"),
            Message::assistant("ok"),
        ])
        .unwrap();
        assert_eq!(buf.to_display_string(), "AI: be helpful\nHuman: draw\nAI: ok");

        let buf = buf.with_labels("User", "Bot");
        assert_eq!(buf.to_display_string(), "Bot: be helpful\nUser: draw\nBot: ok");
    }

    #[test]
    fn test_snapshot_restore_reapplies_budget() {
        let mut buf = buffer(100);
        buf.append_all([Message::user("aaaa"), Message::assistant("bbbbbb")])
            .unwrap();
        let mut snapshot = buf.snapshot();
        assert_eq!(snapshot.current_tokens, 10);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"maxTokens\":100"));

        snapshot.max_tokens = 7;
        snapshot.current_tokens = 0;
        let restored =
            ConversationBuffer::restore(snapshot, Arc::new(CharEstimator), Vendor::OpenAI).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.current_tokens(), 6);
    }

    #[test]
    fn test_works_with_heuristic_estimator() {
        let mut buf =
            ConversationBuffer::new(50, Arc::new(HeuristicEstimator::default()), Vendor::OpenAI)
                .unwrap();
        for _ in 0..20 {
            buf.append(Message::user("flowchart TD\nA-->B")).unwrap();
        }
        assert!(buf.current_tokens() <= 50);
        assert!(buf.len() < 20);
    }
}
