//! Telegram client using teloxide.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InlineKeyboardMarkup, MessageId};
use tracing::{debug, warn};

use crate::chatbot::commands::Reply;
use crate::chatbot::gateway::RemoteFile;
use crate::chatbot::split::split_message;

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
    message_limit: usize,
    chunk_delay: Duration,
}

impl TelegramClient {
    pub fn new(bot: Bot, message_limit: usize, chunk_delay: Duration) -> Self {
        Self { bot, message_limit, chunk_delay }
    }

    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<MessageId, String> {
        let mut request = self.bot.send_message(chat_id, text);
        if let Some(markup) = keyboard {
            request = request.reply_markup(markup);
        }

        request.await.map(|msg| msg.id).map_err(|e| {
            let msg = format!("Failed to send: {e}");
            warn!("{}", msg);
            msg
        })
    }

    pub async fn send_reply(&self, chat_id: ChatId, reply: Reply) -> Result<(), String> {
        match reply.keyboard {
            Some(keyboard) => self.send_message(chat_id, &reply.text, Some(keyboard)).await.map(|_| ()),
            None => self.send_long(chat_id, &reply.text).await,
        }
    }

    /// Send text of any length as consecutive messages, pausing between them.
    pub async fn send_long(&self, chat_id: ChatId, text: &str) -> Result<(), String> {
        let chunks: Vec<String> = split_message(text, self.message_limit)
            .into_iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .collect();

        if chunks.is_empty() {
            warn!("Not sending empty message to chat {}", chat_id);
            return Ok(());
        }

        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.chunk_delay).await;
            }
            self.send_message(chat_id, chunk, None).await?;
        }

        if total > 1 {
            debug!("Sent {} chunks to chat {}", total, chat_id);
        }
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: ChatId) {
        if let Err(e) = self.bot.send_chat_action(chat_id, ChatAction::Typing).await {
            debug!("Failed to send typing action: {e}");
        }
    }

    pub async fn edit_message(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), String> {
        self.bot
            .edit_message_text(chat_id, message_id, text)
            .await
            .map_err(|e| {
                let msg = format!("Failed to edit message: {e}");
                warn!("{}", msg);
                msg
            })?;

        Ok(())
    }

    pub async fn answer_callback(&self, query: &CallbackQuery) {
        if let Err(e) = self.bot.answer_callback_query(query.id.clone()).await {
            warn!("Failed to answer callback query: {e}");
        }
    }

    /// Resolve a file the user sent to its direct download URL.
    ///
    /// The URL embeds the bot token, so it must only be handed to trusted
    /// services. Without a `name`, the last segment of the file path is used.
    pub async fn remote_file(&self, file_id: FileId, name: Option<String>) -> Result<RemoteFile, String> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| format!("Failed to get file: {e}"))?;

        let url = format!(
            "{}/file/bot{}/{}",
            self.bot.api_url().as_str().trim_end_matches('/'),
            self.bot.token(),
            file.path
        );
        let name = name.unwrap_or_else(|| file.path.rsplit('/').next().unwrap_or(&file.path).to_string());

        Ok(RemoteFile { url, name })
    }
}
