//! Protocol client for the OpenAI realtime API: a direct WebSocket handshake
//! authenticated with a bearer credential, then a session-update exchange
//! before any conversation traffic.

use super::{Dialer, ERROR_SENTINEL, ProtocolClient, Transport, WsDialer};
use crate::config::SessionConfig;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

pub const REALTIME_BASE_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
pub const DEFAULT_VOICE: &str = "alloy";

mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(tag = "type")]
    pub(super) enum ClientEvent {
        #[serde(rename = "session.update")]
        SessionUpdate { session: Session },
        #[serde(rename = "conversation.item.create")]
        ConversationItemCreate { item: Item },
        #[serde(rename = "response.create")]
        ResponseCreate { response: ResponseRequest },
    }

    #[derive(Serialize)]
    pub(super) struct Session {
        /// Always serialized as an explicit `null`: server-side turn
        /// detection is off for scripted text exchanges.
        pub turn_detection: Option<()>,
        pub voice: String,
        pub instructions: String,
        pub modalities: Vec<String>,
        pub temperature: f32,
    }

    #[derive(Serialize)]
    pub(super) struct Item {
        pub r#type: &'static str,
        pub role: &'static str,
        pub content: Vec<ContentPart>,
    }

    #[derive(Serialize)]
    pub(super) struct ContentPart {
        pub r#type: &'static str,
        pub text: String,
    }

    #[derive(Serialize)]
    pub(super) struct ResponseRequest {
        pub modalities: Vec<String>,
    }

    /// Server events this client acts on. Everything else lands in
    /// `Unobserved` and is logged and dropped.
    #[derive(Deserialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ServerEvent {
        #[serde(rename = "session.updated")]
        SessionUpdated,
        #[serde(rename = "response.done")]
        ResponseDone { response: ResponsePayload },
        #[serde(rename = "error")]
        Error { error: ErrorPayload },
        #[serde(other)]
        Unobserved,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ResponsePayload {
        #[serde(default)]
        pub status: String,
        #[serde(default)]
        pub output: Vec<OutputItem>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct OutputItem {
        #[serde(default)]
        pub content: Vec<OutputContent>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct OutputContent {
        pub text: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ErrorPayload {
        #[serde(default)]
        pub message: String,
    }
}

pub struct OpenAiRealtimeClient {
    api_key: String,
    session: SessionConfig,
    dialer: Box<dyn Dialer>,
    transport: Option<Box<dyn Transport>>,
    session_configured: bool,
}

impl OpenAiRealtimeClient {
    pub fn new(api_key: String, session: SessionConfig) -> Self {
        Self::with_dialer(api_key, session, Box::new(WsDialer))
    }

    pub fn with_dialer(api_key: String, session: SessionConfig, dialer: Box<dyn Dialer>) -> Self {
        Self {
            api_key,
            session,
            dialer,
            transport: None,
            session_configured: false,
        }
    }
}

#[async_trait]
impl ProtocolClient for OpenAiRealtimeClient {
    async fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        info!("opening websocket connection to OpenAI");
        let url = format!("{}?model={}", REALTIME_BASE_URL, self.session.model);
        let headers = [
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("Content-Type", "application/json".to_string()),
            ("OpenAI-Beta", "realtime=v1".to_string()),
        ];
        self.transport = Some(self.dialer.dial(&url, &headers).await?);
        Ok(())
    }

    async fn configure_session(&mut self) -> Result<()> {
        if self.session_configured {
            info!("OpenAI session already up-to-date");
            return Ok(());
        }
        let transport = self
            .transport
            .as_mut()
            .context("configure_session called before connect")?;

        let update = wire::ClientEvent::SessionUpdate {
            session: wire::Session {
                turn_detection: None,
                voice: self.session.voice.clone(),
                instructions: self.session.instructions.clone(),
                modalities: vec!["text".to_string()],
                temperature: 0.7,
            },
        };
        transport.send_frame(serde_json::to_string(&update)?).await?;

        // Wait for the acknowledgment before letting any message through.
        loop {
            let Some(frame) = transport.next_frame().await? else {
                bail!("connection closed while waiting for session acknowledgment");
            };
            match serde_json::from_str::<wire::ServerEvent>(&frame) {
                Ok(wire::ServerEvent::SessionUpdated) => {
                    debug!(frame = %frame, "session update acknowledged");
                    break;
                }
                Ok(wire::ServerEvent::Error { error }) => {
                    bail!("session update error: {}", error.message);
                }
                Ok(_) => debug!(frame = %frame, "ignoring event while awaiting session ack"),
                Err(e) => debug!(error = %e, "discarding undecodable frame during session setup"),
            }
        }
        self.session_configured = true;
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<String> {
        info!(message = text, "sending message to OpenAI");
        let transport = self
            .transport
            .as_mut()
            .context("send_message called before connect")?;

        let item = wire::ClientEvent::ConversationItemCreate {
            item: wire::Item {
                r#type: "message",
                role: "user",
                content: vec![wire::ContentPart {
                    r#type: "input_text",
                    text: text.to_string(),
                }],
            },
        };
        let request = wire::ClientEvent::ResponseCreate {
            response: wire::ResponseRequest {
                modalities: vec!["text".to_string()],
            },
        };
        transport.send_frame(serde_json::to_string(&item)?).await?;
        transport.send_frame(serde_json::to_string(&request)?).await?;

        loop {
            let Some(frame) = transport.next_frame().await? else {
                // Closure ends the exchange; the caller decides what a missing
                // response means for the conversation.
                warn!("OpenAI websocket closed mid-exchange");
                return Ok(String::new());
            };
            match serde_json::from_str::<wire::ServerEvent>(&frame) {
                Ok(wire::ServerEvent::ResponseDone { response }) => {
                    if response.status == "completed" {
                        let text = response
                            .output
                            .into_iter()
                            .next()
                            .and_then(|item| item.content.into_iter().next())
                            .and_then(|part| part.text)
                            .context("completed response.done carried no output text")?;
                        info!(response = %text, "response from OpenAI");
                        return Ok(text);
                    }
                    warn!(status = %response.status, "OpenAI reported a failed response");
                    return Ok(ERROR_SENTINEL.to_string());
                }
                Ok(wire::ServerEvent::Error { error }) => {
                    bail!("OpenAI realtime API error: {}", error.message);
                }
                Ok(_) => debug!(frame = %frame, "ignoring unobserved event"),
                Err(e) => debug!(error = %e, "discarding undecodable frame"),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            info!("closing websocket connection to OpenAI");
            transport.close().await?;
            self.session_configured = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::provider::testing::{ScriptedDialer, ScriptedTransport};
    use serde_json::{Value, json};

    fn client_with_script(
        incoming: Vec<String>,
    ) -> (
        OpenAiRealtimeClient,
        std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    ) {
        let (transport, sent) = ScriptedTransport::new(incoming);
        let dialer = ScriptedDialer::new(vec![Box::new(transport)]);
        let client = OpenAiRealtimeClient::with_dialer(
            "test-key".to_string(),
            SessionConfig::new(ProviderKind::OpenAI).with_instructions("Be helpful."),
            Box::new(dialer),
        );
        (client, sent)
    }

    fn session_updated() -> String {
        json!({"type": "session.updated"}).to_string()
    }

    #[tokio::test]
    async fn configure_session_sends_one_update_and_waits_for_ack() {
        let (mut client, sent) = client_with_script(vec![
            json!({"type": "rate_limits.updated"}).to_string(),
            session_updated(),
        ]);
        client.connect().await.unwrap();
        client.configure_session().await.unwrap();
        // A second call within the same connection is a no-op.
        client.configure_session().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["type"], "session.update");
        assert!(frame["session"]["turn_detection"].is_null());
        assert_eq!(frame["session"]["voice"], "alloy");
        assert_eq!(frame["session"]["instructions"], "Be helpful.");
        assert_eq!(frame["session"]["modalities"], json!(["text"]));
        assert_eq!(frame["session"]["temperature"], json!(0.7));
    }

    #[tokio::test]
    async fn configure_session_surfaces_provider_error() {
        let (mut client, _sent) = client_with_script(vec![
            json!({"type": "error", "error": {"message": "bad voice"}}).to_string(),
        ]);
        client.connect().await.unwrap();
        let err = client.configure_session().await.unwrap_err();
        assert!(err.to_string().contains("bad voice"));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (transport, _sent) = ScriptedTransport::new(vec![]);
        let dialer = ScriptedDialer::new(vec![Box::new(transport)]);
        let dialed = dialer.dialed.clone();
        let mut client = OpenAiRealtimeClient::with_dialer(
            "test-key".to_string(),
            SessionConfig::new(ProviderKind::OpenAI),
            Box::new(dialer),
        );

        client.connect().await.unwrap();
        client.connect().await.unwrap();

        let dialed = dialed.lock().unwrap();
        assert_eq!(dialed.len(), 1);
        assert_eq!(
            dialed[0],
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
        );
    }

    #[tokio::test]
    async fn send_message_returns_completed_response_text() {
        let (mut client, sent) = client_with_script(vec![
            session_updated(),
            json!({"type": "response.output_text.delta", "delta": "he"}).to_string(),
            json!({
                "type": "response.done",
                "response": {
                    "status": "completed",
                    "output": [{"content": [{"text": "hello"}]}]
                }
            })
            .to_string(),
        ]);
        client.connect().await.unwrap();
        client.configure_session().await.unwrap();

        let response = client.send_message("hi").await.unwrap();
        assert_eq!(response, "hello");

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let item: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(item["type"], "conversation.item.create");
        assert_eq!(item["item"]["type"], "message");
        assert_eq!(item["item"]["role"], "user");
        assert_eq!(item["item"]["content"][0]["type"], "input_text");
        assert_eq!(item["item"]["content"][0]["text"], "hi");
        let request: Value = serde_json::from_str(&sent[2]).unwrap();
        assert_eq!(request["type"], "response.create");
        assert_eq!(request["response"]["modalities"], json!(["text"]));
    }

    #[tokio::test]
    async fn send_message_maps_failed_status_to_sentinel() {
        let (mut client, _sent) = client_with_script(vec![
            session_updated(),
            json!({"type": "response.done", "response": {"status": "failed", "output": []}})
                .to_string(),
        ]);
        client.connect().await.unwrap();
        client.configure_session().await.unwrap();

        let response = client.send_message("hi").await.unwrap();
        assert_eq!(response, ERROR_SENTINEL);
    }

    #[tokio::test]
    async fn send_message_raises_on_error_event() {
        let (mut client, _sent) = client_with_script(vec![
            session_updated(),
            json!({"type": "error", "error": {"message": "server exploded"}}).to_string(),
        ]);
        client.connect().await.unwrap();
        client.configure_session().await.unwrap();

        let err = client.send_message("hi").await.unwrap_err();
        assert!(err.to_string().contains("server exploded"));
    }

    #[tokio::test]
    async fn send_message_returns_empty_on_closure_without_terminal_event() {
        let (mut client, _sent) = client_with_script(vec![
            session_updated(),
            json!({"type": "response.created"}).to_string(),
        ]);
        client.connect().await.unwrap();
        client.configure_session().await.unwrap();

        let response = client.send_message("hi").await.unwrap();
        assert_eq!(response, "");
    }

    #[tokio::test]
    async fn reconnect_reapplies_session_configuration() {
        let (first, _first_sent) = ScriptedTransport::new(vec![session_updated()]);
        let (second, second_sent) = ScriptedTransport::new(vec![session_updated()]);
        let dialer = ScriptedDialer::new(vec![Box::new(first), Box::new(second)]);
        let dialed = dialer.dialed.clone();
        let mut client = OpenAiRealtimeClient::with_dialer(
            "test-key".to_string(),
            SessionConfig::new(ProviderKind::OpenAI),
            Box::new(dialer),
        );

        client.connect().await.unwrap();
        client.configure_session().await.unwrap();
        client.disconnect().await.unwrap();
        // Disconnecting twice is safe.
        client.disconnect().await.unwrap();

        client.connect().await.unwrap();
        client.configure_session().await.unwrap();

        assert_eq!(dialed.lock().unwrap().len(), 2);
        let second_sent = second_sent.lock().unwrap();
        assert_eq!(second_sent.len(), 1);
        let frame: Value = serde_json::from_str(&second_sent[0]).unwrap();
        assert_eq!(frame["type"], "session.update");
    }
}
