//! Device controller lifecycle tests over a mock transport

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_test::assert_ok;

use chime::audio::{AudioEngine, AudioFrame};
use chime::protocol::{
    self, AbortReason, EventSender, ListeningMode, ProtocolEvent, ServerEvent, SessionProtocol,
    TtsEvent, TtsState,
};
use chime::{Config, ControllerHandle, DeviceController, DeviceState, Display, NullRegistry};

/// Everything the controller sent through the transport
#[derive(Default)]
struct SentLog {
    texts: Vec<String>,
    audio_frames: usize,
}

/// In-memory transport: connects instantly (or refuses), records sends
struct MockProtocol {
    events: EventSender,
    accept: bool,
    opened: AtomicBool,
    close_calls: Arc<AtomicUsize>,
    sent: Arc<Mutex<SentLog>>,
}

impl MockProtocol {
    fn new(events: EventSender, accept: bool) -> Self {
        Self {
            events,
            accept,
            opened: AtomicBool::new(false),
            close_calls: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(SentLog::default())),
        }
    }
}

#[async_trait]
impl SessionProtocol for MockProtocol {
    async fn connect(&mut self) -> bool {
        if self.accept {
            self.opened.store(true, Ordering::Release);
            let _ = self.events.send(ProtocolEvent::AudioChannelOpened);
            true
        } else {
            let _ = self
                .events
                .send(ProtocolEvent::NetworkError("connection refused".to_string()));
            false
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    async fn close_audio_channel(&mut self) {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        if self.opened.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(ProtocolEvent::AudioChannelClosed);
        }
    }

    async fn send_audio(&mut self, _frame: AudioFrame) {
        self.sent.lock().unwrap().audio_frames += 1;
    }

    async fn send_text(&mut self, text: String) {
        self.sent.lock().unwrap().texts.push(text);
    }
}

/// Display that records everything it is shown
#[derive(Default, Clone)]
struct RecordingDisplay {
    statuses: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
    texts: Arc<Mutex<Vec<String>>>,
    codes: Arc<Mutex<Vec<String>>>,
}

impl Display for RecordingDisplay {
    fn set_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_string());
    }

    fn show_text(&self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }

    fn set_emotion(&self, _emotion: &str) {}

    fn show_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn show_verification_code(&self, code: &str) {
        self.codes.lock().unwrap().push(code.to_string());
    }
}

struct Fixture {
    controller: DeviceController,
    events: EventSender,
    sent: Arc<Mutex<SentLog>>,
    close_calls: Arc<AtomicUsize>,
    display: RecordingDisplay,
}

fn fixture(accept: bool) -> Fixture {
    let mut config = Config::default();
    config.wake_word.enabled = false;
    fixture_with(accept, config)
}

fn fixture_with(accept: bool, config: Config) -> Fixture {
    let (event_tx, event_rx) = protocol::event_channel();
    let mock = MockProtocol::new(event_tx.clone(), accept);
    let sent = Arc::clone(&mock.sent);
    let close_calls = Arc::clone(&mock.close_calls);
    let display = RecordingDisplay::default();

    let controller = DeviceController::new(
        config,
        AudioEngine::new().expect("codec init"),
        Box::new(mock),
        event_rx,
        Box::new(display.clone()),
        Box::new(NullRegistry),
    );

    Fixture {
        controller,
        events: event_tx,
        sent,
        close_calls,
        display,
    }
}

/// Poll the controller's state through the scheduler until it matches
async fn wait_for_state(handle: &ControllerHandle, want: DeviceState) {
    for _ in 0..300 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.schedule(move |c| {
            let _ = tx.send(c.state());
            Ok(())
        });
        if rx.await == Ok(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for state {want:?}");
}

/// Poll until at least `min` frames sit in the playback queue
async fn wait_for_queued(handle: &ControllerHandle, min: usize) {
    for _ in 0..300 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.schedule(move |c| {
            let _ = tx.send(c.queued_playback());
            Ok(())
        });
        if rx.await.map(|n| n >= min) == Ok(true) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {min} queued frames");
}

fn shutdown(handle: &ControllerHandle) {
    handle.schedule(|c| {
        c.shutdown();
        Ok(())
    });
}

fn messages_of_type(sent: &Arc<Mutex<SentLog>>, kind: &str) -> Vec<Value> {
    sent.lock()
        .unwrap()
        .texts
        .iter()
        .filter_map(|t| serde_json::from_str::<Value>(t).ok())
        .filter(|v| v["type"] == kind)
        .collect()
}

#[tokio::test]
async fn scheduler_runs_in_order_and_survives_errors() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();

    let log = Arc::new(Mutex::new(Vec::new()));

    let l = Arc::clone(&log);
    handle.schedule(move |_| {
        l.lock().unwrap().push(1);
        Ok(())
    });
    handle.schedule(|_| Err(chime::Error::Controller("task failure".to_string())));
    let l = Arc::clone(&log);
    handle.schedule(move |_| {
        l.lock().unwrap().push(2);
        Ok(())
    });
    shutdown(&handle);

    fx.controller.run().await;

    assert_eq!(*log.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn manual_listen_round_trip() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();
    let sent = Arc::clone(&fx.sent);

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                assert_eq!(c.state(), DeviceState::Idle);
                c.start_listening(ListeningMode::Manual);
                assert_eq!(c.state(), DeviceState::Connecting);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            // listen-start must precede everything else sent after open
            let listens = messages_of_type(&sent, "listen");
            assert_eq!(listens[0]["state"], "start");
            assert_eq!(listens[0]["mode"], "manual");

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Stop,
                text: None,
            })));
            // empty queue drains straight through the grace period
            wait_for_state(&handle, DeviceState::Idle).await;

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    // descriptors and states went out when the channel opened
    assert_eq!(messages_of_type(&fx.sent, "iot").len(), 2);
}

#[tokio::test]
async fn hands_free_round_restarts_after_speaking() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();
    let sent = Arc::clone(&fx.sent);

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.toggle_chat();
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Stop,
                text: None,
            })));
            // hands-free keeps the conversation going
            wait_for_state(&handle, DeviceState::Listening).await;

            let starts: Vec<Value> = messages_of_type(&sent, "listen")
                .into_iter()
                .filter(|v| v["state"] == "start")
                .collect();
            assert_eq!(starts.len(), 2);
            assert!(starts.iter().all(|v| v["mode"] == "auto"));

            // toggling while listening ends the conversation outright
            handle.schedule(|c| {
                c.toggle_chat();
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(100)).await;

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    // the round ends by tearing the channel down, not by a stop message
    assert!(fx.close_calls.load(Ordering::Acquire) >= 1);
    let stops: Vec<Value> = messages_of_type(&fx.sent, "listen")
        .into_iter()
        .filter(|v| v["state"] == "stop")
        .collect();
    assert!(stops.is_empty());
}

#[tokio::test]
async fn abort_sends_exactly_one_notification() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            // a second abort while one is in flight must be a no-op
            handle.schedule(|c| {
                c.abort_speaking(AbortReason::None);
                c.abort_speaking(AbortReason::None);
                assert_eq!(c.state(), DeviceState::Idle);
                Ok(())
            });
            handle.schedule(|c| {
                c.abort_speaking(AbortReason::None);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(200)).await;

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    assert_eq!(messages_of_type(&fx.sent, "abort").len(), 1);
}

#[tokio::test]
async fn wake_word_interrupts_speech() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let wake_tx = fx.controller.wake_sender();
    let events = fx.events.clone();

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            // stale speech frames that must never outlive the abort
            for _ in 0..4 {
                let _ = events.send(ProtocolEvent::IncomingAudio(AudioFrame::new(vec![0xAA; 8])));
            }

            wake_tx
                .send(chime::WakeWordEvent {
                    phrase: "hey chime".to_string(),
                })
                .unwrap();
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(200)).await;

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    let aborts = messages_of_type(&fx.sent, "abort");
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0]["reason"], "wake_word_detected");
}

#[tokio::test]
async fn manual_stop_sends_stop_and_idles() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            // the transition out of listening is synchronous
            handle.schedule(|c| {
                c.stop_listening();
                assert_eq!(c.state(), DeviceState::Idle);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(100)).await;

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    let stops: Vec<Value> = messages_of_type(&fx.sent, "listen")
        .into_iter()
        .filter(|v| v["state"] == "stop")
        .collect();
    assert_eq!(stops.len(), 1);
}

#[tokio::test]
async fn abort_clears_playback_queue_before_notifying() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            for _ in 0..4 {
                let _ = events.send(ProtocolEvent::IncomingAudio(AudioFrame::new(vec![0xAA; 8])));
            }
            wait_for_queued(&handle, 4).await;

            // the flush is synchronous, the notification is not
            handle.schedule(|c| {
                c.abort_speaking(AbortReason::WakeWordDetected);
                assert_eq!(c.queued_playback(), 0);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(150)).await;

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    assert_eq!(messages_of_type(&fx.sent, "abort").len(), 1);
}

#[tokio::test]
async fn state_observers_run_in_order_and_survive_failures() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();

    // a broken observer must not block the one registered after it
    fx.controller.add_state_observer(Box::new(|_: DeviceState| -> chime::Result<()> {
        Err(chime::Error::Controller("observer offline".to_string()))
    }));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    fx.controller
        .add_state_observer(Box::new(move |state: DeviceState| -> chime::Result<()> {
            log.lock().unwrap().push(state);
            Ok(())
        }));

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            // a repeated speech start while already speaking is a no-op
            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            tokio::time::sleep(Duration::from_millis(100)).await;

            let (tx, rx) = tokio::sync::oneshot::channel();
            handle.schedule(move |c| {
                let _ = tx.send(c.state());
                Ok(())
            });
            assert_eq!(rx.await.unwrap(), DeviceState::Speaking);

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    // no duplicate fan-out for the repeated speech start
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            DeviceState::Connecting,
            DeviceState::Listening,
            DeviceState::Speaking
        ]
    );
}

#[tokio::test]
async fn wake_word_abort_keeps_detector_paused_briefly() {
    let mut fx = fixture_with(true, Config::default());
    let handle = fx.controller.handle();
    let events = fx.events.clone();

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_wake_word();
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            // speaking resumes detection so a wake word can interrupt
            let (tx, rx) = tokio::sync::oneshot::channel();
            handle.schedule(move |c| {
                let _ = tx.send(c.is_wake_word_paused());
                Ok(())
            });
            assert_eq!(rx.await, Ok(false));

            // the abort's detector pause must survive the idle transition
            handle.schedule(|c| {
                c.abort_speaking(AbortReason::WakeWordDetected);
                assert!(c.is_wake_word_paused());
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Idle).await;

            // and lift again once the pause window has passed
            tokio::time::sleep(Duration::from_millis(400)).await;
            let (tx, rx) = tokio::sync::oneshot::channel();
            handle.schedule(move |c| {
                let _ = tx.send(c.is_wake_word_paused());
                Ok(())
            });
            assert_eq!(rx.await, Ok(false));

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);
}

#[tokio::test]
async fn failed_connection_returns_to_idle() {
    let mut fx = fixture(false);
    let handle = fx.controller.handle();
    let errors = Arc::clone(&fx.display.errors);

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    // one failure, one alert: the transport's report is the only one
    assert_eq!(errors.lock().unwrap().len(), 1);
    // nothing was sent on a channel that never opened
    assert!(messages_of_type(&fx.sent, "listen").is_empty());
}

#[tokio::test]
async fn network_error_while_speaking_drops_to_idle_and_closes() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();
    let close_calls = Arc::clone(&fx.close_calls);

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.schedule(|c| {
                c.toggle_chat();
                Ok(())
            });
            wait_for_state(&handle, DeviceState::Listening).await;

            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::Start,
                text: None,
            })));
            wait_for_state(&handle, DeviceState::Speaking).await;

            let _ = events.send(ProtocolEvent::NetworkError("read failed".to_string()));
            wait_for_state(&handle, DeviceState::Idle).await;
            tokio::time::sleep(Duration::from_millis(100)).await;

            // hands-free must not auto-restart after a failure
            let (tx, rx) = tokio::sync::oneshot::channel();
            handle.schedule(move |c| {
                let _ = tx.send(c.state());
                Ok(())
            });
            assert_eq!(rx.await.unwrap(), DeviceState::Idle);

            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    assert!(close_calls.load(Ordering::Acquire) >= 1);
    assert!(!fx.display.errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn transcripts_and_sentences_reach_the_display() {
    let mut fx = fixture(true);
    let handle = fx.controller.handle();
    let events = fx.events.clone();
    let texts = Arc::clone(&fx.display.texts);
    let codes = Arc::clone(&fx.display.codes);

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Stt {
                text: "turn on the lamp".to_string(),
            }));
            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::SentenceStart,
                text: Some("Sure, lamp coming on.".to_string()),
            })));
            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Tts(TtsEvent {
                state: TtsState::SentenceStart,
                text: Some("Your activation code is 654321.".to_string()),
            })));
            let _ = events.send(ProtocolEvent::Incoming(ServerEvent::Unknown));
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown(&handle);
        })
    };

    fx.controller.run().await;
    tokio_test::assert_ok!(driver.await);

    let texts = texts.lock().unwrap();
    assert_eq!(
        *texts,
        vec![
            "turn on the lamp".to_string(),
            "Sure, lamp coming on.".to_string(),
            "Your activation code is 654321.".to_string()
        ]
    );
    assert_eq!(*codes.lock().unwrap(), vec!["654321".to_string()]);
}
