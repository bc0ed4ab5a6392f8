//! Turns a user message into a bot query, collects the streamed answer and
//! records both sides of the exchange.

use std::sync::Arc;

use futures_util::TryStreamExt;
use tracing::{error, info};

use crate::chatbot::database::{Database, StoreError};
use crate::chatbot::message::{Attachment, ConversationTurn, NewTurn, Role};
use crate::poe::{self, CompletionApi, ProtocolMessage, QueryRequest, ResponseEvent, ResponseStream};

const APOLOGY_PREFIX: &str = "Sorry, I encountered an error";

/// A file the user sent, reachable by URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub url: String,
    pub name: String,
}

/// What the user sent: text (or a caption) plus any files.
#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub text: String,
    pub files: Vec<RemoteFile>,
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), files: Vec::new() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Poe(#[from] poe::Error),
    #[error("Could not find message text, please attach a caption when sending a file/photo")]
    MissingText,
}

/// Text shown to the user when a response could not be produced.
pub fn apology(error: &GatewayError) -> String {
    format!("{APOLOGY_PREFIX}: {error}")
}

pub struct CompletionGateway {
    api: Arc<dyn CompletionApi>,
    history_limit: usize,
}

impl CompletionGateway {
    pub fn new(api: Arc<dyn CompletionApi>, history_limit: usize) -> Self {
        Self { api, history_limit }
    }

    /// Get the bot's reply to `input`. Never fails: errors become an apology.
    pub async fn respond(&self, db: &Database, user_id: i64, input: UserInput) -> String {
        match self.try_respond(db, user_id, input).await {
            Ok(response) => response,
            Err(e) => {
                if !matches!(e, GatewayError::MissingText) {
                    error!("Error getting response from Poe for user {user_id}: {e}");
                }
                apology(&e)
            }
        }
    }

    /// Query the user's selected bot and record the exchange.
    ///
    /// Nothing is written to the history unless the whole response arrived.
    pub async fn try_respond(&self, db: &Database, user_id: i64, input: UserInput) -> Result<String, GatewayError> {
        if input.text.trim().is_empty() {
            return Err(GatewayError::MissingText);
        }

        let preference = db.get_preference(user_id)?;

        let mut attachments = Vec::with_capacity(input.files.len());
        for file in &input.files {
            attachments.push(self.api.upload_file(&file.url, &file.name).await?);
        }

        let history = db.recent_turns(user_id, self.history_limit)?;
        let request = QueryRequest {
            bot_name: preference.bot_name.clone(),
            messages: build_messages(user_id, &preference.system_prompt, &history, &input.text, attachments.clone()),
            temperature: preference.temperature,
        };

        info!(
            "Querying {} for user {user_id} ({} history turns, {} attachments)",
            request.bot_name,
            history.len(),
            attachments.len()
        );

        let stream = self.api.stream_response(&request).await?;
        let response = collect_response(stream).await?;

        db.append_turn(&NewTurn::new(user_id, Role::User, input.text, &preference.bot_name).with_attachments(attachments))?;
        db.append_turn(&NewTurn::new(user_id, Role::Bot, &response, &preference.bot_name))?;

        Ok(response)
    }
}

/// Build the query: optional system prompt, replayed history, then the new
/// user message carrying the sender id and fresh attachments.
pub fn build_messages(
    user_id: i64,
    system_prompt: &str,
    history: &[ConversationTurn],
    text: &str,
    attachments: Vec<Attachment>,
) -> Vec<ProtocolMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    if !system_prompt.trim().is_empty() {
        messages.push(ProtocolMessage::new(Role::System, system_prompt));
    }

    messages.extend(history.iter().map(|turn| {
        ProtocolMessage::new(turn.role, turn.content.clone()).with_attachments(turn.attachments.clone())
    }));

    messages.push(
        ProtocolMessage::new(Role::User, text)
            .with_sender(user_id.to_string())
            .with_attachments(attachments),
    );

    messages
}

/// Fold streamed events into the final response text.
pub async fn collect_response(stream: ResponseStream) -> Result<String, poe::Error> {
    stream
        .try_fold(String::new(), |mut acc, event| async move {
            match event {
                ResponseEvent::Text(text) => acc.push_str(&text),
                ResponseEvent::Replace(text) => acc = text,
            }
            Ok(acc)
        })
        .await
}
