//! Poe bot API client: streamed bot queries and file uploads.
//!
//! Bot responses arrive as server-sent events. `text` events carry partial
//! output, `replace_response` replaces everything sent so far, `done` ends
//! the response and `error` aborts it.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{CannotCloneRequestError, Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chatbot::message::{Attachment, Role};

pub const DEFAULT_BOT_URL: &str = "https://api.poe.com/bot";
pub const DEFAULT_UPLOAD_URL: &str = "https://www.quora.com/poe_api/file_upload_3RD_PARTY_POST";

const PROTOCOL_VERSION: &str = "1.2";
const CONTENT_TYPE_MARKDOWN: &str = "text/markdown";

/// One message of a bot query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolMessage {
    pub role: Role,
    pub content: String,
    pub content_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl ProtocolMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            content_type: CONTENT_TYPE_MARKDOWN,
            sender_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A complete request for one bot response.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub bot_name: String,
    pub messages: Vec<ProtocolMessage>,
    pub temperature: f64,
}

/// Partial output of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// Append to the output so far.
    Text(String),
    /// Discard the output so far and start over with this text.
    Replace(String),
}

pub type ResponseStream = BoxStream<'static, Result<ResponseEvent, Error>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status}: {body}")]
    Api { status: reqwest::StatusCode, body: String },
    #[error("event stream error: {0}")]
    Stream(#[from] reqwest_eventsource::Error),
    #[error("request cannot be streamed: {0}")]
    Request(#[from] CannotCloneRequestError),
    #[error("bot error: {0}")]
    Bot(String),
    #[error("POE_API_KEY is not configured")]
    MissingApiKey,
}

/// The completion service as seen by the gateway.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    /// Start a bot response. Dropping the stream closes the connection.
    async fn stream_response(&self, request: &QueryRequest) -> Result<ResponseStream, Error>;

    /// Let the service fetch a file by URL; returns a handle for later queries.
    async fn upload_file(&self, download_url: &str, file_name: &str) -> Result<Attachment, Error>;
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    query: &'a [ProtocolMessage],
    user_id: &'static str,
    conversation_id: &'static str,
    message_id: &'static str,
    temperature: f64,
}

#[derive(Deserialize)]
struct UploadResponse {
    attachment_url: String,
    mime_type: String,
}

#[derive(Deserialize)]
struct TextPayload {
    #[serde(default)]
    text: String,
}

pub struct PoeClient {
    api_key: String,
    bot_url: String,
    upload_url: String,
    http: reqwest::Client,
}

impl PoeClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_urls(api_key, DEFAULT_BOT_URL.to_string(), DEFAULT_UPLOAD_URL.to_string())
    }

    pub fn with_base_urls(api_key: String, bot_url: String, upload_url: String) -> Self {
        Self {
            api_key,
            bot_url: bot_url.trim_end_matches('/').to_string(),
            upload_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionApi for PoeClient {
    async fn stream_response(&self, request: &QueryRequest) -> Result<ResponseStream, Error> {
        if self.api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }

        let body = ApiRequest {
            version: PROTOCOL_VERSION,
            kind: "query",
            query: &request.messages,
            user_id: "",
            conversation_id: "",
            message_id: "",
            temperature: request.temperature,
        };

        let url = format!("{}/{}", self.bot_url, request.bot_name);
        debug!("Querying {url} with {} message(s)", request.messages.len());

        let mut source = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .eventsource()?;
        // No reconnects: a dropped connection ends the response
        source.set_retry_policy(Box::new(Never));

        // The first item tells whether the server accepted the request
        let first = match source.next().await {
            Some(Ok(event)) => Some(Ok(event)),
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                source.close();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Api { status, body });
            }
            Some(Err(err)) => {
                source.close();
                return Err(err.into());
            }
            None => None,
        };

        Ok(decode_events(stream::iter(first).chain(source)))
    }

    async fn upload_file(&self, download_url: &str, file_name: &str) -> Result<Attachment, Error> {
        if self.api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }

        let response = self
            .http
            .post(&self.upload_url)
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .form(&[("download_url", download_url), ("download_filename", file_name)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body });
        }

        let uploaded: UploadResponse = response.json().await?;
        debug!("Uploaded {file_name} as {}", uploaded.attachment_url);

        Ok(Attachment {
            url: uploaded.attachment_url,
            content_type: uploaded.mime_type,
            name: file_name.to_string(),
            parsed_content: None,
        })
    }
}

enum Step {
    Emit(ResponseEvent),
    Fail(Error),
    Done,
    Skip,
}

fn payload_text(data: &str) -> String {
    serde_json::from_str::<TextPayload>(data)
        .map(|payload| payload.text)
        .unwrap_or_else(|_| data.to_string())
}

fn interpret(event: &str, data: &str) -> Step {
    match event {
        "text" => Step::Emit(ResponseEvent::Text(payload_text(data))),
        "replace_response" => Step::Emit(ResponseEvent::Replace(payload_text(data))),
        "done" => Step::Done,
        "error" => Step::Fail(Error::Bot(payload_text(data))),
        other => {
            debug!("Ignoring {other} event");
            Step::Skip
        }
    }
}

/// Turn server-sent events into bot response events.
///
/// Ends at `done`, at an `error` event (after yielding it) or when the
/// server closes the body.
pub(crate) fn decode_events<S>(source: S) -> ResponseStream
where
    S: Stream<Item = Result<Event, reqwest_eventsource::Error>> + Send + 'static,
{
    stream::unfold(Some(source.boxed()), |source| async move {
        let mut source = source?;
        loop {
            match source.next().await? {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => match interpret(&message.event, &message.data) {
                    Step::Emit(event) => return Some((Ok(event), Some(source))),
                    Step::Fail(err) => return Some((Err(err), None)),
                    Step::Done => return None,
                    Step::Skip => continue,
                },
                Err(reqwest_eventsource::Error::StreamEnded) => return None,
                Err(err) => return Some((Err(err.into()), None)),
            }
        }
    })
    .boxed()
}
