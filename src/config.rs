use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use teloxide::types::ChatId;

use crate::chatbot::database::DEFAULT_HISTORY_LIMIT;
use crate::chatbot::split::TELEGRAM_MESSAGE_LIMIT;
use crate::poe::{DEFAULT_BOT_URL, DEFAULT_UPLOAD_URL};

pub const DEFAULT_BOT: &str = "Claude-3.7-Sonnet";
pub const DEFAULT_AVAILABLE_BOTS: [&str; 4] = ["Claude-3.7-Sonnet", "GPT-4o", "GPT-4.1", "Claude-3.5-Sonnet"];
pub const DEFAULT_DATABASE_URL: &str = "sqlite://user_data.db";
const DEFAULT_CHUNK_DELAY_MS: u64 = 500;

/// System prompt stored by `/start`.
pub const DEFAULT_START_SYSTEM_PROMPT: &str = "\
You are a friendly, conversational assistant who speaks naturally like a real person.
Keep your responses casual, warm, and engaging.
Use a relaxed tone with occasional humor when appropriate.
Don't be overly formal or robotic - it's okay to use contractions, simple language, and shorter sentences.
Ask follow-up questions to show interest in the conversation. Avoid long explanations unless specifically requested.
Your goal is to make the conversation feel like chatting with a helpful friend rather than interacting with a machine.";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("TELEGRAM_TOKEN appears invalid (expected format: 123456789:ABCdefGHI...)")]
    InvalidToken,
    #[error("{key} must be a number, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be true or false, got '{value}'")]
    InvalidBool { key: &'static str, value: String },
    #[error("config validation error: {0}")]
    Validation(String),
}

pub struct Config {
    pub telegram_token: String,
    /// Empty when unset; completions then fail with an apology.
    pub poe_api_key: String,
    /// Public base URL; the webhook is registered at `{webhook_url}/webhook`.
    pub webhook_url: Option<String>,
    pub database_url: String,
    pub default_bot: String,
    /// Models offered by `/select_bot`.
    pub available_bots: Vec<String>,
    pub authorization: bool,
    /// Lowercase usernames without the leading `@`.
    pub authorized_users: HashSet<String>,
    pub message_limit: usize,
    pub history_limit: usize,
    /// Pause between the chunks of a multi-message reply.
    pub chunk_delay: Duration,
    pub start_system_prompt: String,
    pub poe_api_url: String,
    pub poe_upload_url: String,
    pub log_dir: PathBuf,
    /// Chat that receives WARN/ERROR logs.
    pub log_chat_id: Option<ChatId>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_token = get("TELEGRAM_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_TOKEN"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_valid = match telegram_token.split_once(':') {
            Some((id, secret)) => id.parse::<u64>().is_ok() && !secret.is_empty() && !secret.contains(':'),
            None => false,
        };
        if !token_valid {
            return Err(ConfigError::InvalidToken);
        }

        let default_bot = get("DEFAULT_BOT").unwrap_or_else(|| DEFAULT_BOT.to_string());
        let mut available_bots = match get("AVAILABLE_BOTS") {
            Some(list) => split_list(&list),
            None => DEFAULT_AVAILABLE_BOTS.iter().map(|s| s.to_string()).collect(),
        };
        if !available_bots.contains(&default_bot) {
            available_bots.insert(0, default_bot.clone());
        }

        let authorization = match get("AUTHORIZATION") {
            Some(value) => parse_bool("AUTHORIZATION", &value)?,
            None => false,
        };
        let authorized_users = get("AUTHORIZED_USERS")
            .map(|list| {
                split_list(&list)
                    .into_iter()
                    .map(|u| u.trim_start_matches('@').to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let message_limit = parse_number(&get, "TELEGRAM_MESSAGE_LIMIT", TELEGRAM_MESSAGE_LIMIT as u64)? as usize;
        if message_limit == 0 {
            return Err(ConfigError::Validation("TELEGRAM_MESSAGE_LIMIT must be positive".into()));
        }
        let history_limit = parse_number(&get, "HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT as u64)? as usize;
        let chunk_delay = Duration::from_millis(parse_number(&get, "CHUNK_DELAY_MS", DEFAULT_CHUNK_DELAY_MS)?);

        let log_chat_id = match get("LOG_CHAT_ID") {
            Some(value) => Some(ChatId(value.parse::<i64>().map_err(|_| ConfigError::InvalidNumber {
                key: "LOG_CHAT_ID",
                value,
            })?)),
            None => None,
        };

        Ok(Self {
            telegram_token,
            poe_api_key: get("POE_API_KEY").unwrap_or_default(),
            webhook_url: get("WEBHOOK_URL").map(|u| u.trim_end_matches('/').to_string()),
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            default_bot,
            available_bots,
            authorization,
            authorized_users,
            message_limit,
            history_limit,
            chunk_delay,
            start_system_prompt: get("START_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_START_SYSTEM_PROMPT.to_string()),
            poe_api_url: get("POE_API_URL").unwrap_or_else(|| DEFAULT_BOT_URL.to_string()),
            poe_upload_url: get("POE_UPLOAD_URL").unwrap_or_else(|| DEFAULT_UPLOAD_URL.to_string()),
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs")),
            log_chat_id,
        })
    }

    /// Whether a sender may talk to the bot.
    pub fn is_authorized(&self, username: Option<&str>) -> bool {
        if !self.authorization {
            return true;
        }
        username
            .map(|u| self.authorized_users.contains(&u.trim_start_matches('@').to_lowercase()))
            .unwrap_or(false)
    }

    /// Full URL Telegram should deliver updates to.
    pub fn webhook_endpoint(&self) -> Option<String> {
        self.webhook_url.as_ref().map(|base| format!("{base}/webhook"))
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { key, value: value.to_string() }),
    }
}

fn parse_number<G>(get: &G, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}
