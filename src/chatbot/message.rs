//! Stored conversation records and per-user settings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Temperature used when a user has not chosen one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Bot => "bot",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "bot" => Ok(Role::Bot),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A file handle returned by the completion API's upload endpoint.
///
/// Treated as opaque: replayed from history exactly as it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_content: Option<String>,
}

/// One recorded message in a user's conversation log.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: i64,
    pub user_id: i64,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub role: Role,
    pub content: String,
    /// Model selected when the turn was recorded.
    pub bot_name: String,
    pub attachments: Vec<Attachment>,
}

/// A turn about to be appended to the history.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub user_id: i64,
    pub role: Role,
    pub content: String,
    pub bot_name: String,
    pub attachments: Vec<Attachment>,
}

impl NewTurn {
    pub fn new(user_id: i64, role: Role, content: impl Into<String>, bot_name: impl Into<String>) -> Self {
        Self {
            user_id,
            role,
            content: content.into(),
            bot_name: bot_name.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Per-user model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPreference {
    pub bot_name: String,
    pub system_prompt: String,
    pub temperature: f64,
}

impl UserPreference {
    /// Settings for a user who never changed anything.
    pub fn defaults(bot_name: impl Into<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
            system_prompt: String::new(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Partial preference change; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceUpdate {
    pub bot_name: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

impl PreferenceUpdate {
    pub fn bot_name(name: impl Into<String>) -> Self {
        Self { bot_name: Some(name.into()), ..Self::default() }
    }

    pub fn system_prompt(prompt: impl Into<String>) -> Self {
        Self { system_prompt: Some(prompt.into()), ..Self::default() }
    }

    pub fn temperature(temperature: f64) -> Self {
        Self { temperature: Some(temperature), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.bot_name.is_none() && self.system_prompt.is_none() && self.temperature.is_none()
    }
}

/// A pending per-user expectation, consumed by the next free-text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The user pressed "custom model" and the next text is a bot name.
    AwaitingBotName,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingBotName => "awaiting_bot_name",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_bot_name" => Some(SessionState::AwaitingBotName),
            _ => None,
        }
    }
}
