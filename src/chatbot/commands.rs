//! Slash commands, model-picker callbacks and the pending custom-model prompt.
//!
//! Handlers only touch the database and return a [`Reply`]; sending it is
//! left to the Telegram layer.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

use crate::chatbot::database::{Database, StoreError};
use crate::chatbot::message::{PreferenceUpdate, SessionState, UserPreference, DEFAULT_TEMPERATURE};
use crate::config::Config;

pub const BOT_CALLBACK_PREFIX: &str = "bot_";
pub const CUSTOM_BOT_CALLBACK: &str = "custom_bot";

pub const UNAUTHORIZED_REPLY: &str = "You are not authorized to use this bot.";
pub const GENERIC_ERROR_REPLY: &str = "Sorry, something went wrong while processing your request. Please try again later.";

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Available commands:")]
pub enum Command {
    #[command(description = "Start the bot")]
    Start,
    #[command(description = "Show this help message")]
    Help,
    #[command(description = "Choose which AI model to use (or type your own)")]
    SelectBot,
    #[command(description = "Show your current settings")]
    Settings,
    #[command(description = "Set a custom system prompt (\"clear\" removes it)")]
    SetSystemPrompt(String),
    #[command(description = "Set the temperature (0.0 - 1.0)")]
    SetTemperature(String),
    #[command(description = "Clear your conversation history")]
    ClearHistory,
}

/// Text to send back, optionally with an inline keyboard.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), keyboard: None }
    }
}

/// A pressed button of the model picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    SelectBot(String),
    CustomBot,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        if data == CUSTOM_BOT_CALLBACK {
            return Some(Self::CustomBot);
        }
        data.strip_prefix(BOT_CALLBACK_PREFIX)
            .filter(|name| !name.is_empty())
            .map(|name| Self::SelectBot(name.to_string()))
    }
}

/// Run one command for `user_id`.
pub fn execute(
    db: &Database,
    config: &Config,
    user_id: i64,
    username: Option<&str>,
    command: Command,
) -> Result<Reply, StoreError> {
    match command {
        Command::Start => start(db, config, user_id, username),
        Command::Help => Ok(help()),
        Command::SelectBot => Ok(select_bot(config)),
        Command::Settings => settings(db, user_id),
        Command::SetSystemPrompt(args) => set_system_prompt(db, user_id, &args),
        Command::SetTemperature(args) => set_temperature(db, user_id, &args),
        Command::ClearHistory => clear_history(db, user_id),
    }
}

/// Reset the user's settings to the configured defaults and greet them.
///
/// The reset happens before the authorization check.
pub fn start(db: &Database, config: &Config, user_id: i64, username: Option<&str>) -> Result<Reply, StoreError> {
    let preference = UserPreference {
        bot_name: config.default_bot.clone(),
        system_prompt: config.start_system_prompt.clone(),
        temperature: DEFAULT_TEMPERATURE,
    };
    db.reset_preference(user_id, &preference)?;

    if !config.is_authorized(username) {
        info!("Rejected /start from unauthorized user {user_id} ({username:?})");
        return Ok(Reply::text(UNAUTHORIZED_REPLY));
    }

    Ok(Reply::text(format!(
        "Hello! I'm a bot that connects to Poe AI models. Currently using: {}\n\n\
         You can change the AI model with /select_bot",
        preference.bot_name
    )))
}

pub fn help() -> Reply {
    Reply::text(format!(
        "Just send me a message and I'll forward it to the selected AI model. \
         Photos and files are passed along too, as long as they have a caption.\n\n{}",
        Command::descriptions()
    ))
}

pub fn select_bot(config: &Config) -> Reply {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = config
        .available_bots
        .iter()
        .map(|name| vec![InlineKeyboardButton::callback(name.clone(), format!("{BOT_CALLBACK_PREFIX}{name}"))])
        .collect();
    rows.push(vec![InlineKeyboardButton::callback("Other model...", CUSTOM_BOT_CALLBACK)]);

    Reply {
        text: "Select an AI model:".to_string(),
        keyboard: Some(InlineKeyboardMarkup::new(rows)),
    }
}

pub fn settings(db: &Database, user_id: i64) -> Result<Reply, StoreError> {
    let preference = db.get_preference(user_id)?;
    let prompt = if preference.system_prompt.is_empty() {
        "Not set"
    } else {
        preference.system_prompt.as_str()
    };

    Ok(Reply::text(format!(
        "Your current settings:\n\nAI Model: {}\nTemperature: {}\nSystem Prompt: {}",
        preference.bot_name,
        format_temperature(preference.temperature),
        prompt
    )))
}

pub fn set_system_prompt(db: &Database, user_id: i64, args: &str) -> Result<Reply, StoreError> {
    let prompt = args.trim();
    if prompt.is_empty() {
        return Ok(Reply::text(
            "Please provide a system prompt after the command.\n\
             Example: /set_system_prompt You are a helpful assistant.\n\
             Use /set_system_prompt clear to remove it.",
        ));
    }

    if prompt.eq_ignore_ascii_case("clear") {
        db.update_preference(user_id, &PreferenceUpdate::system_prompt(""))?;
        return Ok(Reply::text("System prompt cleared."));
    }

    db.update_preference(user_id, &PreferenceUpdate::system_prompt(prompt))?;
    Ok(Reply::text(format!("System prompt set to: {prompt}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureError {
    Missing,
    NotANumber,
    OutOfRange,
}

/// Parse the first argument as a temperature in `[0.0, 1.0]`.
pub fn parse_temperature(args: &str) -> Result<f64, TemperatureError> {
    let arg = args.split_whitespace().next().ok_or(TemperatureError::Missing)?;
    let value: f64 = arg.parse().map_err(|_| TemperatureError::NotANumber)?;
    if !value.is_finite() {
        return Err(TemperatureError::NotANumber);
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(TemperatureError::OutOfRange);
    }
    Ok(value)
}

pub fn set_temperature(db: &Database, user_id: i64, args: &str) -> Result<Reply, StoreError> {
    let reply = match parse_temperature(args) {
        Ok(value) => {
            db.update_preference(user_id, &PreferenceUpdate::temperature(value))?;
            format!("Temperature set to: {}", format_temperature(value))
        }
        Err(TemperatureError::Missing) => {
            "Please provide a temperature value between 0.0 and 1.0.\nExample: /set_temperature 0.7".to_string()
        }
        Err(TemperatureError::NotANumber) => "Please provide a valid number between 0.0 and 1.0.".to_string(),
        Err(TemperatureError::OutOfRange) => "Temperature must be between 0.0 and 1.0.".to_string(),
    };
    Ok(Reply::text(reply))
}

pub fn clear_history(db: &Database, user_id: i64) -> Result<Reply, StoreError> {
    let removed = db.clear_history(user_id)?;
    info!("Cleared {removed} history turns for user {user_id}");
    Ok(Reply::text("Your conversation history has been cleared."))
}

/// Apply a model-picker button press; returns the text that replaces the
/// picker message.
pub fn handle_callback(db: &Database, user_id: i64, action: CallbackAction) -> Result<String, StoreError> {
    match action {
        CallbackAction::SelectBot(name) => {
            db.update_preference(user_id, &model_switch(&name))?;
            // a listed model supersedes an unanswered "other model" prompt
            db.take_session(user_id)?;
            Ok(format!("Selected AI model: {name}"))
        }
        CallbackAction::CustomBot => {
            db.set_session(user_id, SessionState::AwaitingBotName)?;
            Ok("Send me the name of the Poe model you want to use (for example: Gemini-2.5-Pro).".to_string())
        }
    }
}

/// Consume a pending session state, if any, using `text` as the answer.
///
/// Returns `None` when nothing was pending and the text should go to the bot.
pub fn consume_session(db: &Database, user_id: i64, text: &str) -> Result<Option<Reply>, StoreError> {
    match db.take_session(user_id)? {
        None => Ok(None),
        Some(SessionState::AwaitingBotName) => {
            let name = text.trim();
            if name.is_empty() {
                return Ok(Some(Reply::text("Model name can't be empty. Use /select_bot to try again.")));
            }
            db.update_preference(user_id, &model_switch(name))?;
            Ok(Some(Reply::text(format!("Selected AI model: {name}"))))
        }
    }
}

/// Like [`consume_session`], but a store failure becomes the generic error
/// reply so the message is never relayed with a session still pending.
pub fn session_reply(db: &Database, user_id: i64, text: &str) -> Option<Reply> {
    match consume_session(db, user_id, text) {
        Ok(reply) => reply,
        Err(e) => {
            error!("Failed to read session for user {user_id}: {e}");
            Some(Reply::text(GENERIC_ERROR_REPLY))
        }
    }
}

/// Switching models starts from an empty prompt and the default temperature.
fn model_switch(name: &str) -> PreferenceUpdate {
    PreferenceUpdate {
        bot_name: Some(name.to_string()),
        system_prompt: Some(String::new()),
        temperature: Some(DEFAULT_TEMPERATURE),
    }
}

/// Render like `0.7` or `1.0`, never `1`.
fn format_temperature(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}
