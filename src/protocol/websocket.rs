//! Persistent WebSocket session transport

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::audio::AudioFrame;
use crate::config::NetworkConfig;
use crate::protocol::{EventSender, HELLO_TIMEOUT, ProtocolEvent, SessionProtocol, message};
use crate::{Error, Result};

/// Transport kind declared in the hello handshake
const TRANSPORT: &str = "websocket";

/// WebSocket-backed session transport.
///
/// A fresh connection, writer task, and reader task are created per
/// `connect` attempt; the handshake signal is single-use and never
/// survives a reconnect.
pub struct WebSocketProtocol {
    config: NetworkConfig,
    events: EventSender,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketProtocol {
    /// Create a transport; `events` is the controller's event channel,
    /// fixed before any connection is attempted
    #[must_use]
    pub fn new(config: NetworkConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_request(&self) -> Result<tungstenite::handshake::client::Request> {
        let mut request = self
            .config
            .websocket_url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(token) = &self.config.access_token {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| Error::Transport(e.to_string()))?,
            );
        }
        headers.insert("Protocol-Version", HeaderValue::from_static("1"));
        headers.insert(
            "Device-Id",
            HeaderValue::from_str(&self.config.device_id)
                .map_err(|e| Error::Transport(e.to_string()))?,
        );
        headers.insert(
            "Client-Id",
            HeaderValue::from_str(&self.config.client_id)
                .map_err(|e| Error::Transport(e.to_string()))?,
        );

        Ok(request)
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SessionProtocol for WebSocketProtocol {
    async fn connect(&mut self) -> bool {
        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                self.emit(ProtocolEvent::NetworkError(format!("bad endpoint: {e}")));
                return false;
            }
        };

        let (stream, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                self.emit(ProtocolEvent::NetworkError(format!(
                    "unable to connect to server: {e}"
                )));
                return false;
            }
        };

        let (mut sink, source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (hello_tx, hello_rx) = oneshot::channel::<()>();

        let writer_events = self.events.clone();
        let writer_connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(error = %e, "websocket send failed");
                    if writer_connected.swap(false, Ordering::AcqRel) {
                        let _ = writer_events
                            .send(ProtocolEvent::NetworkError(format!("send failed: {e}")));
                    }
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(read_loop(
            source,
            self.events.clone(),
            Arc::clone(&self.connected),
            hello_tx,
        ));

        self.outbound = Some(out_tx);

        let hello = message::client_hello(TRANSPORT).to_string();
        self.send_text(hello).await;

        match tokio::time::timeout(HELLO_TIMEOUT, hello_rx).await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::Release);
                tracing::info!(url = %self.config.websocket_url, "connected to server");
                true
            }
            _ => {
                self.outbound = None;
                self.emit(ProtocolEvent::NetworkError(
                    "timeout waiting for server hello".to_string(),
                ));
                false
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.outbound.is_some() && self.connected.load(Ordering::Acquire)
    }

    async fn close_audio_channel(&mut self) {
        if let Some(out) = self.outbound.take() {
            let _ = out.send(Message::Close(None));
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            self.emit(ProtocolEvent::AudioChannelClosed);
        }
    }

    async fn send_audio(&mut self, frame: AudioFrame) {
        if !self.is_audio_channel_opened() {
            return;
        }
        if let Some(out) = &self.outbound {
            if out.send(Message::Binary(frame.into_bytes())).is_err() {
                self.emit(ProtocolEvent::NetworkError(
                    "failed to send audio frame".to_string(),
                ));
            }
        }
    }

    async fn send_text(&mut self, text: String) {
        let Some(out) = &self.outbound else { return };
        if out.send(Message::Text(text)).is_err() {
            tracing::error!("websocket writer gone, closing channel");
            self.close_audio_channel().await;
            self.emit(ProtocolEvent::NetworkError("client closed".to_string()));
        }
    }
}

type WsSource = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Inbound dispatch loop: binary payloads become audio events, text
/// payloads are decoded and routed by type. The server hello is consumed
/// here to fulfill the handshake signal.
async fn read_loop(
    mut source: WsSource,
    events: EventSender,
    connected: Arc<AtomicBool>,
    hello_tx: oneshot::Sender<()>,
) {
    let mut hello_tx = Some(hello_tx);

    while let Some(next) = source.next().await {
        match next {
            Ok(Message::Text(text)) => match message::parse_server_event(&text) {
                Ok(message::ServerEvent::Hello(hello)) => {
                    if hello.transport != TRANSPORT {
                        tracing::error!(
                            transport = %hello.transport,
                            "unsupported transport in server hello"
                        );
                        continue;
                    }
                    if let Some(tx) = hello_tx.take() {
                        let _ = tx.send(());
                        let _ = events.send(ProtocolEvent::AudioChannelOpened);
                    }
                }
                Ok(event) => {
                    let _ = events.send(ProtocolEvent::Incoming(event));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed message");
                }
            },
            Ok(Message::Binary(data)) => {
                let _ = events.send(ProtocolEvent::IncomingAudio(AudioFrame::new(data)));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(
                    tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
                ),
            ) => break,
            Err(e) => {
                if connected.swap(false, Ordering::AcqRel) {
                    let _ =
                        events.send(ProtocolEvent::NetworkError(format!("connection error: {e}")));
                }
                return;
            }
        }
    }

    tracing::info!("websocket connection closed");
    if connected.swap(false, Ordering::AcqRel) {
        let _ = events.send(ProtocolEvent::AudioChannelClosed);
    }
}
