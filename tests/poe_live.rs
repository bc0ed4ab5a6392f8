//! Live test against the Poe API.
//!
//! Requires POE_API_KEY. Run with: cargo test --features integ_test --test poe_live

#[cfg(feature = "integ_test")]
mod tests {
    use poe_telegram::chatbot::gateway::collect_response;
    use poe_telegram::chatbot::message::Role;
    use poe_telegram::poe::{CompletionApi, PoeClient, ProtocolMessage, QueryRequest};

    #[tokio::test]
    async fn test_short_answer_from_default_bot() {
        let Ok(api_key) = std::env::var("POE_API_KEY") else {
            eprintln!("Skipping test: POE_API_KEY not set");
            return;
        };
        let bot_name = std::env::var("POE_TEST_BOT").unwrap_or_else(|_| "GPT-4o".to_string());

        let client = PoeClient::new(api_key);
        let request = QueryRequest {
            bot_name,
            messages: vec![ProtocolMessage::new(Role::User, "Reply with the single word: pong").with_sender("1")],
            temperature: 0.0,
        };

        let stream = client.stream_response(&request).await.expect("request should be accepted");
        let response = collect_response(stream).await.expect("stream should complete");
        assert!(response.to_lowercase().contains("pong"), "unexpected response: {response}");
    }
}
