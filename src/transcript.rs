use anyhow::{bail, Context};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message, in the shape the chat endpoint expects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Conversation history sent with every turn.
///
/// Always starts with exactly one system message and only grows by whole
/// exchanges, so a turn is either fully present or absent.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self { messages: vec![Message::system(system_prompt)] }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of completed user/assistant exchanges.
    pub fn turns(&self) -> usize {
        (self.messages.len() - 1) / 2
    }

    /// The history plus a not-yet-committed user message, as sent to the service.
    pub fn with_pending(&self, pending: &Message) -> Vec<Message> {
        let mut request = Vec::with_capacity(self.messages.len() + 1);
        request.extend_from_slice(&self.messages);
        request.push(pending.clone());
        request
    }

    pub fn push_exchange(&mut self, user: Message, assistant: Message) {
        debug_assert_eq!(user.role, Role::User);
        debug_assert_eq!(assistant.role, Role::Assistant);
        self.messages.push(user);
        self.messages.push(assistant);
    }
}

/// Read the system prompt once at startup.
pub fn load_system_prompt(path: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read system prompt from `{}`", path.display()))?;
    let prompt = raw.trim();
    if prompt.is_empty() {
        bail!("system prompt file `{}` is empty", path.display());
    }
    info!(
        "system prompt loaded from '{}' ({} characters)",
        path.display(),
        prompt.chars().count()
    );
    Ok(prompt.to_string())
}
