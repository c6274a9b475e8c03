//! MQTT pub/sub session transport
//!
//! Structured messages and audio frames travel on separate topics under a
//! shared prefix: the client publishes to `<prefix>/out/{events,audio}` and
//! subscribes to `<prefix>/in/{events,audio}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::oneshot;

use crate::audio::AudioFrame;
use crate::config::MqttConfig;
use crate::protocol::{EventSender, HELLO_TIMEOUT, ProtocolEvent, SessionProtocol, message};

const TRANSPORT: &str = "mqtt";

/// MQTT-backed session transport
pub struct MqttProtocol {
    config: MqttConfig,
    events: EventSender,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl MqttProtocol {
    #[must_use]
    pub fn new(config: MqttConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.config.topic_prefix)
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SessionProtocol for MqttProtocol {
    async fn connect(&mut self) -> bool {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);

        let subscriptions = [self.topic("in/events"), self.topic("in/audio")];
        for topic in &subscriptions {
            if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                self.emit(ProtocolEvent::NetworkError(format!(
                    "subscribe failed: {e}"
                )));
                return false;
            }
        }

        let (hello_tx, hello_rx) = oneshot::channel::<()>();
        self.closing.store(false, Ordering::Release);

        tokio::spawn(poll_loop(
            event_loop,
            self.events.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.closing),
            self.topic("in/events"),
            self.topic("in/audio"),
            hello_tx,
        ));

        self.client = Some(client);

        let hello = message::client_hello(TRANSPORT).to_string();
        self.send_text(hello).await;

        match tokio::time::timeout(HELLO_TIMEOUT, hello_rx).await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::Release);
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "connected to broker"
                );
                true
            }
            _ => {
                self.closing.store(true, Ordering::Release);
                if let Some(client) = self.client.take() {
                    let _ = client.disconnect().await;
                }
                self.emit(ProtocolEvent::NetworkError(
                    "timeout waiting for server hello".to_string(),
                ));
                false
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    async fn close_audio_channel(&mut self) {
        self.closing.store(true, Ordering::Release);
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            self.emit(ProtocolEvent::AudioChannelClosed);
        }
    }

    async fn send_audio(&mut self, frame: AudioFrame) {
        if !self.is_audio_channel_opened() {
            return;
        }
        let topic = self.topic("out/audio");
        if let Some(client) = &self.client {
            if let Err(e) = client
                .publish(topic, QoS::AtMostOnce, false, frame.into_bytes())
                .await
            {
                self.emit(ProtocolEvent::NetworkError(format!(
                    "failed to publish audio frame: {e}"
                )));
            }
        }
    }

    async fn send_text(&mut self, text: String) {
        let topic = self.topic("out/events");
        let Some(client) = &self.client else { return };
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, text).await {
            tracing::error!(error = %e, "publish failed, closing channel");
            self.close_audio_channel().await;
            self.emit(ProtocolEvent::NetworkError("client closed".to_string()));
        }
    }
}

/// Broker event loop: routes inbound publishes by topic and surfaces
/// connection loss exactly once
async fn poll_loop(
    mut event_loop: rumqttc::EventLoop,
    events: EventSender,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    events_topic: String,
    audio_topic: String,
    hello_tx: oneshot::Sender<()>,
) {
    let mut hello_tx = Some(hello_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == audio_topic {
                    let _ = events.send(ProtocolEvent::IncomingAudio(AudioFrame::new(
                        publish.payload.to_vec(),
                    )));
                } else if publish.topic == events_topic {
                    let Ok(text) = std::str::from_utf8(&publish.payload) else {
                        tracing::warn!(topic = %publish.topic, "dropping non-utf8 payload");
                        continue;
                    };
                    match message::parse_server_event(text) {
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
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    return;
                }
                if connected.swap(false, Ordering::AcqRel) {
                    let _ = events.send(ProtocolEvent::AudioChannelClosed);
                } else {
                    let _ =
                        events.send(ProtocolEvent::NetworkError(format!("broker error: {e}")));
                }
                return;
            }
        }
    }
}
