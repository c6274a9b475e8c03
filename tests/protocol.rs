//! WebSocket transport tests against an in-process server

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use chime::audio::AudioFrame;
use chime::config::NetworkConfig;
use chime::protocol::{self, ProtocolEvent, ServerEvent, SessionProtocol, TtsState, WebSocketProtocol};

fn test_config(addr: std::net::SocketAddr) -> NetworkConfig {
    NetworkConfig {
        websocket_url: format!("ws://{addr}"),
        access_token: Some("secret".to_string()),
        device_id: "aa:bb:cc:dd:ee:ff".to_string(),
        client_id: "test-client".to_string(),
    }
}

#[tokio::test]
async fn handshake_headers_and_traffic() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();

        let check_headers = |req: &Request, resp: Response| {
            let headers = req.headers();
            assert_eq!(headers["Authorization"], "Bearer secret");
            assert_eq!(headers["Protocol-Version"], "1");
            assert_eq!(headers["Device-Id"], "aa:bb:cc:dd:ee:ff");
            assert_eq!(headers["Client-Id"], "test-client");
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, check_headers)
            .await
            .unwrap();
        let (mut sink, mut source) = ws.split();

        // client hello opens the exchange
        let msg = source.next().await.unwrap().unwrap();
        let hello: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["transport"], "websocket");
        assert_eq!(hello["version"], 1);
        assert_eq!(hello["audio_params"]["format"], "opus");

        sink.send(Message::Text(
            r#"{"type":"hello","transport":"websocket","session_id":"s1"}"#.to_string(),
        ))
        .await
        .unwrap();

        // one structured event, one malformed payload, one audio frame
        sink.send(Message::Text(r#"{"type":"tts","state":"start"}"#.to_string()))
            .await
            .unwrap();
        sink.send(Message::Text("{not json".to_string())).await.unwrap();
        sink.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        // client uploads an audio frame
        let audio = source.next().await.unwrap().unwrap();
        match audio {
            Message::Binary(data) => assert_eq!(data, vec![9, 9]),
            other => panic!("expected binary frame, got {other:?}"),
        }

        sink.send(Message::Close(None)).await.unwrap();
    });

    let (tx, mut rx) = protocol::event_channel();
    let mut client = WebSocketProtocol::new(test_config(addr), tx);

    assert!(client.connect().await);
    assert!(client.is_audio_channel_opened());

    match rx.recv().await.unwrap() {
        ProtocolEvent::AudioChannelOpened => {}
        other => panic!("expected opened event, got {other:?}"),
    }
    match rx.recv().await.unwrap() {
        ProtocolEvent::Incoming(ServerEvent::Tts(tts)) => assert_eq!(tts.state, TtsState::Start),
        other => panic!("expected tts event, got {other:?}"),
    }
    // the malformed payload was dropped, audio comes straight through
    match rx.recv().await.unwrap() {
        ProtocolEvent::IncomingAudio(frame) => assert_eq!(frame.as_bytes(), &[1, 2, 3]),
        other => panic!("expected audio frame, got {other:?}"),
    }

    client.send_audio(AudioFrame::new(vec![9, 9])).await;

    match rx.recv().await.unwrap() {
        ProtocolEvent::AudioChannelClosed => {}
        other => panic!("expected closed event, got {other:?}"),
    }
    assert!(!client.is_audio_channel_opened());

    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_the_handshake() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (_sink, mut source) = ws.split();
        // swallow the client hello and never answer
        let _ = source.next().await;
        let _ = source.next().await;
    });

    let (tx, mut rx) = protocol::event_channel();
    let mut client = WebSocketProtocol::new(test_config(addr), tx);

    assert!(!client.connect().await);
    assert!(!client.is_audio_channel_opened());

    match rx.recv().await.unwrap() {
        ProtocolEvent::NetworkError(message) => assert!(message.contains("hello")),
        other => panic!("expected network error, got {other:?}"),
    }

    server.abort();
}

#[tokio::test(start_paused = true)]
async fn mismatched_transport_fails_the_handshake() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        let _ = source.next().await;
        // wrong transport kind must not complete the handshake
        sink.send(Message::Text(
            r#"{"type":"hello","transport":"mqtt"}"#.to_string(),
        ))
        .await
        .unwrap();
        let _ = source.next().await;
    });

    let (tx, mut rx) = protocol::event_channel();
    let mut client = WebSocketProtocol::new(test_config(addr), tx);

    assert!(!client.connect().await);

    match rx.recv().await.unwrap() {
        ProtocolEvent::NetworkError(message) => assert!(message.contains("hello")),
        other => panic!("expected network error, got {other:?}"),
    }

    server.abort();
}

#[tokio::test]
async fn unreachable_server_reports_an_error() {
    // a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, mut rx) = protocol::event_channel();
    let mut client = WebSocketProtocol::new(test_config(addr), tx);

    assert!(!client.connect().await);
    match rx.recv().await.unwrap() {
        ProtocolEvent::NetworkError(message) => assert!(message.contains("connect")),
        other => panic!("expected network error, got {other:?}"),
    }
}
