//! Protocol client for Ultravox: session parameters go out in a REST
//! call-creation request, which yields a one-time join URL for the WebSocket
//! leg. There is no separate configuration handshake on the stream.

use super::{Dialer, ProtocolClient, Transport, WsDialer};
use crate::config::{FirstSpeaker, SessionConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const API_BASE_URL: &str = "https://api.ultravox.ai";
pub const DEFAULT_MODEL: &str = "fixie-ai/ultravox";
pub const DEFAULT_VOICE: &str = "Mark";

// Transport-level hints for the call-creation body. The text-only session
// never streams audio, but the API requires a medium descriptor.
const INPUT_SAMPLE_RATE: u32 = 48_000;
const OUTPUT_SAMPLE_RATE: u32 = 48_000;
const CLIENT_BUFFER_SIZE_MS: u32 = 30_000;

/// Body of the call-creation request.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub system_prompt: String,
    pub model: String,
    pub voice: String,
    pub medium: CallMedium,
    pub first_speaker: FirstSpeaker,
}

#[derive(Serialize, Debug)]
pub struct CallMedium {
    #[serde(rename = "serverWebSocket")]
    pub server_web_socket: ServerWebSocketMedium,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerWebSocketMedium {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub client_buffer_size_ms: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallResponse {
    pub join_url: String,
}

/// The REST side of the protocol. Stubbed out in tests.
#[async_trait]
pub trait CallApi: Send + Sync {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<CreateCallResponse>;
}

pub struct HttpCallApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCallApi {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: API_BASE_URL.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl CallApi for HttpCallApi {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<CreateCallResponse> {
        let url = format!("{}/api/calls", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .context("Ultravox call creation request failed")?
            .error_for_status()
            .context("Ultravox rejected the call creation request")?;
        response
            .json()
            .await
            .context("Ultravox call creation returned an unexpected body")
    }
}

mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(tag = "type")]
    pub(super) enum ClientEvent {
        #[serde(rename = "set_output_medium")]
        SetOutputMedium { medium: &'static str },
        #[serde(rename = "input_text_message")]
        InputTextMessage { text: String },
    }

    /// Only `transcript` frames are acted on; anything else is logged and
    /// dropped.
    #[derive(Deserialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ServerEvent {
        #[serde(rename = "transcript")]
        Transcript {
            #[serde(rename = "final", default)]
            is_final: bool,
            #[serde(default)]
            text: String,
        },
        #[serde(other)]
        Unobserved,
    }
}

pub struct UltravoxClient {
    session: SessionConfig,
    call_api: Box<dyn CallApi>,
    dialer: Box<dyn Dialer>,
    transport: Option<Box<dyn Transport>>,
}

impl UltravoxClient {
    pub fn new(api_key: String, session: SessionConfig) -> Self {
        Self::with_backends(session, Box::new(HttpCallApi::new(api_key)), Box::new(WsDialer))
    }

    pub fn with_backends(
        session: SessionConfig,
        call_api: Box<dyn CallApi>,
        dialer: Box<dyn Dialer>,
    ) -> Self {
        Self {
            session,
            call_api,
            dialer,
            transport: None,
        }
    }
}

#[async_trait]
impl ProtocolClient for UltravoxClient {
    async fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let request = CreateCallRequest {
            system_prompt: self.session.instructions.clone(),
            model: self.session.model.clone(),
            voice: self.session.voice.clone(),
            medium: CallMedium {
                server_web_socket: ServerWebSocketMedium {
                    input_sample_rate: INPUT_SAMPLE_RATE,
                    output_sample_rate: OUTPUT_SAMPLE_RATE,
                    client_buffer_size_ms: CLIENT_BUFFER_SIZE_MS,
                },
            },
            first_speaker: self.session.first_speaker,
        };
        let call = self.call_api.create_call(&request).await?;

        info!(join_url = %call.join_url, "opening websocket connection to Ultravox");
        let mut transport = self.dialer.dial(&call.join_url, &[]).await?;

        let set_medium = wire::ClientEvent::SetOutputMedium { medium: "text" };
        transport
            .send_frame(serde_json::to_string(&set_medium)?)
            .await?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn configure_session(&mut self) -> Result<()> {
        // Session parameters were already fixed at call creation.
        debug!("Ultravox session is configured at call creation; nothing to do");
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<String> {
        info!(message = text, "sending message to Ultravox");
        let transport = self
            .transport
            .as_mut()
            .context("send_message called before connect")?;

        let message = wire::ClientEvent::InputTextMessage {
            text: text.to_string(),
        };
        transport.send_frame(serde_json::to_string(&message)?).await?;

        loop {
            let Some(frame) = transport.next_frame().await? else {
                warn!("Ultravox websocket closed mid-exchange");
                return Ok(String::new());
            };
            match serde_json::from_str::<wire::ServerEvent>(&frame) {
                Ok(wire::ServerEvent::Transcript { is_final, text }) => {
                    debug!(is_final, transcript = %text, "transcript frame from Ultravox");
                    // Non-final transcripts are already cumulative on the
                    // provider side; only the final one is the answer.
                    if is_final {
                        info!(response = %text, "response from Ultravox");
                        return Ok(text);
                    }
                }
                Ok(wire::ServerEvent::Unobserved) => {
                    debug!(frame = %frame, "ignoring unobserved event");
                }
                Err(e) => error!(error = %e, "failed to decode Ultravox frame"),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            info!("closing websocket connection to Ultravox");
            transport.close().await?;
        }
        Ok(())
    }
}
