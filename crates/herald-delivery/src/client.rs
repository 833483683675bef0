//! HTTP transport for chat-bot style messaging APIs.
//!
//! Sends each message as `POST {api_url}/bot{token}/sendMessage` with a JSON
//! body and maps the reply onto [`DeliveryError`] so the queue can log and
//! retry it. The bot token is part of the URL, so URLs are never logged and
//! reqwest errors are stripped of theirs.

use std::{future::Future, pin::Pin, time::Duration};

use herald_core::models::Recipient;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    transport::{DeliveryReceipt, OutboundMessage, Transport},
};

/// Retry hint used when a 429 reply carries none.
const DEFAULT_RETRY_AFTER: u64 = 60;

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 1024;

/// Configuration for the bot API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the bot API.
    pub api_url: String,
    /// Bot token; required.
    pub bot_token: String,
    /// Timeout for a single request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("herald/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    retry_after: Option<u64>,
}

/// Transport that talks to a bot API over HTTPS.
#[derive(Debug, Clone)]
pub struct BotApiTransport {
    client: reqwest::Client,
    endpoint: String,
    config: ClientConfig,
}

impl BotApiTransport {
    /// Creates a transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the token is empty or the HTTP client
    /// cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(DeliveryError::configuration("bot token is required"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        let endpoint =
            format!("{}/bot{}/sendMessage", config.api_url.trim_end_matches('/'), config.bot_token);

        Ok(Self { client, endpoint, config })
    }

    async fn send(&self, message: OutboundMessage) -> Result<DeliveryReceipt> {
        let body = request_body(&message);

        let response = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                let e = e.without_url();
                tracing::warn!(error = %e, "request to bot API failed");
                if e.is_timeout() {
                    return Err(DeliveryError::timeout(self.config.timeout));
                }
                if e.is_connect() {
                    return Err(DeliveryError::network(format!("connection failed: {e}")));
                }
                return Err(DeliveryError::network(e.to_string()));
            },
        };

        let status = response.status().as_u16();
        let header_retry_after = retry_after_from_headers(response.headers());
        let text = response
            .text()
            .await
            .unwrap_or_else(|e| format!("[failed to read response body: {}]", e.without_url()));
        let reply = serde_json::from_str::<ApiReply>(&text).ok();

        tracing::debug!(status, "bot API replied");
        map_reply(status, reply, header_retry_after, &text)
    }
}

impl Transport for BotApiTransport {
    fn deliver(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + '_>> {
        let span = info_span!(
            "bot_api_send",
            notification_id = %message.notification_id,
            attempt = message.attempt_number,
        );
        Box::pin(self.send(message).instrument(span))
    }
}

/// Builds the `sendMessage` JSON body.
fn request_body(message: &OutboundMessage) -> Value {
    let chat_id = match &message.recipient {
        Recipient::Channel(id) => json!(id),
        Recipient::Handle(handle) => json!(format!("@{handle}")),
    };

    let options = &message.content.options;
    let mut body = Map::new();
    for (key, value) in &options.extra {
        body.insert(key.clone(), value.clone());
    }
    body.insert("chat_id".to_string(), chat_id);
    body.insert("text".to_string(), json!(message.content.text));
    if let Some(mode) = options.parse_mode {
        body.insert("parse_mode".to_string(), json!(mode.as_str()));
    }
    if options.disable_notification {
        body.insert("disable_notification".to_string(), json!(true));
    }
    if options.disable_web_page_preview {
        body.insert("disable_web_page_preview".to_string(), json!(true));
    }
    Value::Object(body)
}

fn map_reply(
    status: u16,
    reply: Option<ApiReply>,
    header_retry_after: Option<u64>,
    raw: &str,
) -> Result<DeliveryReceipt> {
    let description = reply
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| truncate(raw));

    match status {
        200..=299 => match reply {
            Some(ApiReply { ok: true, result, .. }) => Ok(DeliveryReceipt {
                message_ref: result.map(|sent| sent.message_id.to_string()),
            }),
            _ => Err(DeliveryError::rejected(status, description)),
        },
        429 => {
            let retry_after = reply
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after)
                .or(header_retry_after)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            Err(DeliveryError::rate_limited(retry_after))
        },
        400..=499 => Err(DeliveryError::rejected(status, description)),
        500..=599 => Err(DeliveryError::server_error(status, truncate(raw))),
        _ => Err(DeliveryError::internal(format!("unexpected HTTP status {status}"))),
    }
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

#[cfg(test)]
mod tests {
    use herald_core::models::{
        NewNotification, NotificationRecord, ParseMode, Recipient, RenderOptions,
    };
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    const TOKEN: &str = "123:abc";

    fn transport(server: &MockServer) -> BotApiTransport {
        BotApiTransport::new(ClientConfig {
            api_url: server.uri(),
            bot_token: TOKEN.to_string(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    fn message(recipient: Recipient) -> OutboundMessage {
        let record = NotificationRecord::from_request(
            NewNotification::new(recipient, "*Balance* updated").render_options(RenderOptions {
                parse_mode: Some(ParseMode::MarkdownV2),
                disable_notification: true,
                ..RenderOptions::default()
            }),
            3,
            chrono::Utc::now(),
        )
        .unwrap();
        OutboundMessage::from(&record)
    }

    fn send_message_path() -> String {
        format!("/bot{TOKEN}/sendMessage")
    }

    #[test]
    fn token_is_required() {
        let result = BotApiTransport::new(ClientConfig::default());
        assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })));
    }

    #[tokio::test]
    async fn successful_send_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path(send_message_path()))
            .and(matchers::body_partial_json(json!({
                "chat_id": 42,
                "text": "*Balance* updated",
                "parse_mode": "MarkdownV2",
                "disable_notification": true,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true, "result": {"message_id": 777}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let receipt = transport(&server).deliver(message(Recipient::channel(42))).await.unwrap();

        assert_eq!(receipt.message_ref.as_deref(), Some("777"));
    }

    #[tokio::test]
    async fn handles_are_sent_with_at_prefix() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::body_partial_json(json!({"chat_id": "@ops_desk"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let recipient = Recipient::handle("ops_desk").unwrap();
        assert!(transport(&server).deliver(message(recipient)).await.is_ok());
    }

    #[tokio::test]
    async fn client_errors_become_rejections() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: chat not found",
            })))
            .mount(&server)
            .await;

        let error = transport(&server).deliver(message(Recipient::channel(1))).await.unwrap_err();

        assert_eq!(error, DeliveryError::rejected(400, "Bad Request: chat not found"));
    }

    #[tokio::test]
    async fn too_many_requests_carries_retry_hint() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "description": "Too Many Requests: retry after 17",
                "parameters": {"retry_after": 17},
            })))
            .mount(&server)
            .await;

        let error = transport(&server).deliver(message(Recipient::channel(1))).await.unwrap_err();

        assert_eq!(error.retry_after_seconds(), Some(17));
    }

    #[tokio::test]
    async fn retry_after_header_is_a_fallback() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .append_header("Retry-After", "9")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let error = transport(&server).deliver(message(Recipient::channel(1))).await.unwrap_err();

        assert_eq!(error, DeliveryError::rate_limited(9));
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let error = transport(&server).deliver(message(Recipient::channel(1))).await.unwrap_err();

        assert_eq!(error, DeliveryError::server_error(502, "Bad Gateway"));
    }

    #[tokio::test]
    async fn ok_false_on_success_status_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "description": "message is too long"})),
            )
            .mount(&server)
            .await;

        let error = transport(&server).deliver(message(Recipient::channel(1))).await.unwrap_err();

        assert_eq!(error, DeliveryError::rejected(200, "message is too long"));
    }

    #[tokio::test]
    async fn slow_api_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = BotApiTransport::new(ClientConfig {
            api_url: server.uri(),
            bot_token: TOKEN.to_string(),
            timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        })
        .unwrap();

        let error = transport.deliver(message(Recipient::channel(1))).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Timeout { .. }));
    }

    #[test]
    fn extra_options_never_override_core_fields() {
        let mut outbound = message(Recipient::channel(3));
        outbound.content.options.extra.insert("chat_id".to_string(), json!(999));
        outbound.content.options.extra.insert("protect_content".to_string(), json!(true));

        let body = request_body(&outbound);

        assert_eq!(body["chat_id"], json!(3));
        assert_eq!(body["protect_content"], json!(true));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(5_000);
        assert!(truncate(&body).ends_with("... (truncated)"));
        assert_eq!(truncate("short"), "short");
    }
}
