//! Chatbot module - relays Telegram messages to Poe bots.

pub mod commands;
pub mod database;
pub mod gateway;
pub mod message;
pub mod split;
pub mod telegram;

pub use commands::{Command, Reply};
pub use database::Database;
pub use gateway::{CompletionGateway, RemoteFile, UserInput};
pub use telegram::TelegramClient;
