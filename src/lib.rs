pub mod chatbot;
pub mod config;
pub mod poe;
pub mod telegram_log;
