use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One prior conversation turn supplied by the caller.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "User"),
            MessageRole::Assistant => write!(f, "Assistant"),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

/// Rejects turns with blank content.
pub fn validate_history(history: &[Message]) -> Result<(), AppError> {
    if let Some(position) = history
        .iter()
        .position(|message| message.content.trim().is_empty())
    {
        return Err(AppError::Validation(format!(
            "history entry {position} has empty content"
        )));
    }
    Ok(())
}

/// Formats the most recent `max_turns` messages as role-tagged lines.
pub fn format_history(history: &[Message], max_turns: usize) -> String {
    let start = history.len().saturating_sub(max_turns);
    history
        .iter()
        .skip(start)
        .map(|msg| format!("{msg}"))
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_display() {
        assert_eq!(format!("{}", MessageRole::User), "User");
        assert_eq!(format!("{}", MessageRole::Assistant), "Assistant");
    }

    #[test]
    fn test_message_display() {
        let message = Message::user("Hello world");
        assert_eq!(format!("{message}"), "User: Hello world");
    }

    #[test]
    fn test_format_history() {
        let messages = vec![Message::user("Hello"), Message::assistant("Hi there!")];
        assert_eq!(format_history(&messages, 10), "User: Hello\nAssistant: Hi there!");
    }

    #[test]
    fn format_history_keeps_only_recent_turns() {
        let messages: Vec<Message> = (0..12).map(|i| Message::user(format!("turn {i}"))).collect();
        let formatted = format_history(&messages, 10);

        assert_eq!(formatted.lines().count(), 10);
        assert!(formatted.starts_with("User: turn 2"));
        assert!(formatted.ends_with("User: turn 11"));
    }

    #[test]
    fn roles_deserialize_lowercase() {
        let message: Message =
            serde_json::from_str(r#"{"role":"assistant","content":"ok"}"#).expect("parse");
        assert_eq!(message.role, MessageRole::Assistant);
        assert!(serde_json::from_str::<Message>(r#"{"role":"system","content":"x"}"#).is_err());
    }

    #[test]
    fn blank_history_content_is_rejected() {
        assert!(validate_history(&[Message::user("fine")]).is_ok());
        let err = validate_history(&[Message::user("fine"), Message::assistant("  ")])
            .expect_err("blank turn");
        assert!(err.to_string().contains("entry 1"));
    }
}
