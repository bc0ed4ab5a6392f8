//! Poe client against a mock HTTP server.

use futures_util::StreamExt;
use mockito::Matcher;
use serde_json::json;

use poe_telegram::chatbot::gateway::collect_response;
use poe_telegram::chatbot::message::Role;
use poe_telegram::poe::{CompletionApi, Error, PoeClient, ProtocolMessage, QueryRequest, ResponseEvent};

fn client(server: &mockito::Server, api_key: &str) -> PoeClient {
    PoeClient::with_base_urls(
        api_key.to_string(),
        format!("{}/bot", server.url()),
        format!("{}/upload", server.url()),
    )
}

fn request() -> QueryRequest {
    QueryRequest {
        bot_name: "GPT-4o".to_string(),
        messages: vec![
            ProtocolMessage::new(Role::System, "Be brief."),
            ProtocolMessage::new(Role::User, "Hi").with_sender("42"),
        ],
        temperature: 0.3,
    }
}

const SSE_BODY: &str = "event: meta\n\
data: {\"content_type\": \"text/markdown\"}\n\n\
event: text\n\
data: {\"text\": \"Hel\"}\n\n\
: keep-alive\n\n\
event: text\n\
data: {\"text\": \"lo!\"}\n\n\
event: done\n\
data: {}\n\n\
event: text\n\
data: {\"text\": \"ignored\"}\n\n";

#[tokio::test]
async fn streams_text_events_until_done() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/bot/GPT-4o")
        .match_header("authorization", "Bearer secret")
        .match_body(Matcher::PartialJson(json!({
            "version": "1.2",
            "type": "query",
            "temperature": 0.3,
            "query": [
                {"role": "system", "content": "Be brief.", "content_type": "text/markdown", "attachments": []},
                {"role": "user", "content": "Hi", "content_type": "text/markdown", "sender_id": "42", "attachments": []}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_BODY)
        .create_async()
        .await;

    let stream = client(&server, "secret").stream_response(&request()).await.unwrap();
    let response = collect_response(stream).await.unwrap();

    assert_eq!(response, "Hello!");
    mock.assert_async().await;
}

#[tokio::test]
async fn replace_response_event_is_surfaced() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/bot/GPT-4o")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("event: text\ndata: {\"text\": \"a\"}\n\nevent: replace_response\ndata: {\"text\": \"b\"}\n\n")
        .create_async()
        .await;

    let stream = client(&server, "secret").stream_response(&request()).await.unwrap();
    let events: Vec<ResponseEvent> = stream.map(|e| e.unwrap()).collect().await;

    assert_eq!(events, vec![ResponseEvent::Text("a".into()), ResponseEvent::Replace("b".into())]);
}

#[tokio::test]
async fn error_event_fails_the_stream() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/bot/GPT-4o")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("event: text\ndata: {\"text\": \"partial\"}\n\nevent: error\ndata: {\"text\": \"rate limited\", \"allow_retry\": true}\n\n")
        .create_async()
        .await;

    let stream = client(&server, "secret").stream_response(&request()).await.unwrap();
    let err = collect_response(stream).await.unwrap_err();

    assert!(matches!(err, Error::Bot(ref msg) if msg == "rate limited"), "got {err:?}");
}

#[tokio::test]
async fn http_error_status_is_reported() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/bot/GPT-4o")
        .with_status(401)
        .with_body("invalid api key")
        .create_async()
        .await;

    let result = client(&server, "wrong").stream_response(&request()).await;

    match result {
        Err(Error::Api { status, body }) => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(body, "invalid api key");
        }
        Err(other) => panic!("expected API error, got {other:?}"),
        Ok(_) => panic!("expected API error, got a stream"),
    }
}

#[tokio::test]
async fn missing_api_key_skips_the_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let client = client(&server, "");
    assert!(matches!(client.stream_response(&request()).await, Err(Error::MissingApiKey)));
    assert!(matches!(client.upload_file("https://x/y.png", "y.png").await, Err(Error::MissingApiKey)));

    mock.assert_async().await;
}

#[tokio::test]
async fn upload_returns_attachment() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/upload")
        .match_header("authorization", "secret")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("download_url".into(), "https://files.example/cat.jpg".into()),
            Matcher::UrlEncoded("download_filename".into(), "cat.jpg".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"attachment_url": "https://pfst.cf2.poecdn.net/base/image/abc", "mime_type": "image/jpeg"}"#)
        .create_async()
        .await;

    let attachment = client(&server, "secret")
        .upload_file("https://files.example/cat.jpg", "cat.jpg")
        .await
        .unwrap();

    assert_eq!(attachment.url, "https://pfst.cf2.poecdn.net/base/image/abc");
    assert_eq!(attachment.content_type, "image/jpeg");
    assert_eq!(attachment.name, "cat.jpg");
    mock.assert_async().await;
}
