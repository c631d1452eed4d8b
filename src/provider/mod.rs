//! Protocol clients for the supported realtime voice providers, and the
//! transport seam they share.

pub mod openai;
pub mod ultravox;

use crate::config::{ProviderKind, SessionConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::debug;

/// Fixed placeholder returned when a provider completes an exchange but marks
/// it failed. A bad turn stays visible in the transcript instead of aborting
/// the whole test case.
pub const ERROR_SENTINEL: &str = "<Error>";

/// One provider's wire protocol over a duplex stream.
///
/// The four operations are always driven in the same order: `connect`,
/// `configure_session`, any number of `send_message` round-trips, then
/// `disconnect`. `connect` and `disconnect` are idempotent;
/// `configure_session` applies the session parameters at most once per
/// connection.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Establishes the provider connection. A no-op when already connected.
    async fn connect(&mut self) -> Result<()>;

    /// Applies the session parameters to the live connection. A no-op on
    /// repeat calls until the connection is torn down.
    async fn configure_session(&mut self) -> Result<()>;

    /// Performs one full request/response exchange and returns the provider's
    /// response text, or [`ERROR_SENTINEL`] when the provider reported a
    /// failed completion.
    async fn send_message(&mut self, text: &str) -> Result<String>;

    /// Tears the connection down. Safe to call repeatedly, including when no
    /// connection was ever established.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Builds the protocol client for the given provider.
pub fn build_client(
    kind: ProviderKind,
    session: SessionConfig,
    api_key: String,
) -> Box<dyn ProtocolClient> {
    match kind {
        ProviderKind::OpenAI => Box::new(openai::OpenAiRealtimeClient::new(api_key, session)),
        ProviderKind::Ultravox => Box::new(ultravox::UltravoxClient::new(api_key, session)),
    }
}

/// A duplex text-frame transport.
///
/// Production code uses the tungstenite-backed [`WsTransport`]; tests swap in
/// scripted in-memory transports.
#[async_trait]
pub trait Transport: Send {
    async fn send_frame(&mut self, frame: String) -> Result<()>;

    /// The next text frame from the peer, or `None` once the peer has closed
    /// the stream.
    async fn next_frame(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports at a given URL with optional handshake headers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<Box<dyn Transport>>;
}

/// Dials WebSocket endpoints with `tokio-tungstenite`.
///
/// No client-initiated pings are sent; the connection sits silent between
/// exchanges and the provider is expected to tolerate idle periods.
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<Box<dyn Transport>> {
        let mut request = url
            .into_client_request()
            .context("invalid websocket endpoint URL")?;
        for (name, value) in headers {
            request.headers_mut().insert(*name, value.parse()?);
        }
        let (stream, _) = connect_async(request)
            .await
            .context("failed to open websocket connection")?;
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        self.stream.send(WsMessage::Text(frame)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => return Ok(Some(text)),
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "peer closed the websocket");
                    return Ok(None);
                }
                // Control and binary frames carry nothing for a text session.
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        // Closing an already-closed stream is not an error worth surfacing.
        let _ = self.stream.close(None).await;
        Ok(())
    }
}
