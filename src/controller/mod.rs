//! Device controller: state machine and single-threaded scheduler
//!
//! All state mutation happens on one task running [`DeviceController::run`].
//! Anything that must touch the controller from elsewhere goes through
//! [`ControllerHandle::schedule`], which queues a closure for in-order
//! execution on that task. Slow work (opening channels, waiting for the
//! playback queue to drain) runs in spawned workers that report back the
//! same way, so a scheduled closure always re-reads current state instead
//! of trusting what was true when it was queued.

mod state;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub use state::DeviceState;

use crate::audio::{AudioEngine, StreamDirection};
use crate::config::Config;
use crate::display::Display;
use crate::iot::IotRegistry;
use crate::protocol::{
    AbortReason, EventReceiver, ListeningMode, ProtocolEvent, ServerEvent, SessionProtocol,
    TtsState,
};
use crate::wake_word::{WakeEventReceiver, WakeEventSender, WakeWordDetector, WakeWordEvent};
use crate::Result;

/// Bound on opening the audio channel for push-to-talk listening
const MANUAL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on opening the audio channel for hands-free conversation
const AUTO_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on closing the audio channel
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on delivering a single control message (abort, listen stop)
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Capture and playback pump cadence
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// A closure queued for execution on the controller task
pub type ScheduledTask = Box<dyn FnOnce(&mut DeviceController) -> Result<()> + Send>;

/// Notified after every committed state transition, in registration order.
///
/// An error is logged and never blocks the remaining observers.
pub trait StateObserver: Send {
    /// Called with the state just entered
    ///
    /// # Errors
    ///
    /// Returns error when the observer could not act on the change
    fn on_state_changed(&mut self, state: DeviceState) -> Result<()>;
}

impl<F> StateObserver for F
where
    F: FnMut(DeviceState) -> Result<()> + Send,
{
    fn on_state_changed(&mut self, state: DeviceState) -> Result<()> {
        self(state)
    }
}

/// Cloneable handle that queues work onto the controller task
#[derive(Clone)]
pub struct ControllerHandle {
    tasks: mpsc::UnboundedSender<ScheduledTask>,
}

impl ControllerHandle {
    /// Queue a closure; closures run in FIFO order, one at a time.
    ///
    /// Dropped silently if the controller has shut down.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut DeviceController) -> Result<()> + Send + 'static,
    {
        if self.tasks.send(Box::new(task)).is_err() {
            tracing::debug!("controller gone, task dropped");
        }
    }
}

type SharedProtocol = Arc<tokio::sync::Mutex<Box<dyn SessionProtocol>>>;

/// One unit of work for the run loop
enum Step {
    Task(ScheduledTask),
    Proto(ProtocolEvent),
    Wake(WakeWordEvent),
    InputTick,
    OutputTick,
    Closed,
}

/// Owns the audio engine, the transport, and the lifecycle state machine
pub struct DeviceController {
    state: DeviceState,
    config: Config,
    engine: AudioEngine,
    protocol: SharedProtocol,
    proto_events: EventReceiver,
    wake_events: WakeEventReceiver,
    wake_tx: WakeEventSender,
    tasks: mpsc::UnboundedReceiver<ScheduledTask>,
    handle: ControllerHandle,
    display: Box<dyn Display>,
    iot: Box<dyn IotRegistry>,
    observers: Vec<Box<dyn StateObserver>>,
    detector: Option<WakeWordDetector>,
    listening_mode: ListeningMode,
    keep_listening: bool,
    aborting: bool,
    in_transition: bool,
    running: bool,
}

impl DeviceController {
    /// Assemble a controller around an engine and a transport.
    ///
    /// `proto_events` must be the receiver paired with the sender the
    /// transport was built with.
    #[must_use]
    pub fn new(
        config: Config,
        engine: AudioEngine,
        protocol: Box<dyn SessionProtocol>,
        proto_events: EventReceiver,
        display: Box<dyn Display>,
        iot: Box<dyn IotRegistry>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_events) = mpsc::unbounded_channel();

        Self {
            state: DeviceState::Idle,
            config,
            engine,
            protocol: Arc::new(tokio::sync::Mutex::new(protocol)),
            proto_events,
            wake_events,
            wake_tx,
            tasks: task_rx,
            handle: ControllerHandle { tasks: task_tx },
            display,
            iot,
            observers: Vec::new(),
            detector: None,
            listening_mode: ListeningMode::Manual,
            keep_listening: false,
            aborting: false,
            in_transition: false,
            running: true,
        }
    }

    /// Handle for queueing work onto the controller task
    #[must_use]
    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// Sender feeding wake-word events into the run loop
    #[must_use]
    pub fn wake_sender(&self) -> WakeEventSender {
        self.wake_tx.clone()
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Register an observer notified after each state transition
    pub fn add_state_observer(&mut self, observer: Box<dyn StateObserver>) {
        self.observers.push(observer);
    }

    /// Frames waiting in the playback queue
    #[must_use]
    pub fn queued_playback(&self) -> usize {
        self.engine.playback_queue().len()
    }

    /// Whether wake-word detection is currently suppressed
    #[must_use]
    pub fn is_wake_word_paused(&self) -> bool {
        self.detector.as_ref().is_some_and(WakeWordDetector::is_paused)
    }

    /// Open the hardware audio streams
    ///
    /// # Errors
    ///
    /// Returns error if a device cannot be opened; the caller may keep
    /// running without audio
    pub fn initialize_audio(&mut self) -> Result<()> {
        self.engine.initialize()
    }

    /// Start wake-word detection over a capture tap.
    ///
    /// A detector that fails to start is disabled in the persisted
    /// configuration so the failure does not repeat on every launch.
    pub fn start_wake_word(&mut self) {
        if !self.config.wake_word.enabled {
            return;
        }

        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let started = WakeWordDetector::new(
            self.config.wake_word.wake_words.clone(),
            self.wake_tx.clone(),
        )
        .and_then(|mut detector| detector.start(tap_rx).map(|()| detector));

        match started {
            Ok(detector) => {
                self.engine.set_capture_tap(tap_tx);
                self.detector = Some(detector);
                tracing::info!("wake word detection active");
            }
            Err(e) => {
                tracing::error!(error = %e, "wake word detector failed to start, disabling");
                self.display.show_error("wake word unavailable, disabled");
                self.config.persist_wake_word_disabled();
            }
        }
    }

    /// Restart the detector if it is enabled but no longer running
    fn ensure_wake_word(&mut self) {
        if !self.config.wake_word.enabled {
            return;
        }
        if self.detector.as_ref().is_some_and(WakeWordDetector::is_running) {
            return;
        }
        if let Some(mut stale) = self.detector.take() {
            stale.stop();
        }
        self.start_wake_word();
    }

    /// Drive the controller until [`Self::shutdown`] is scheduled
    #[allow(clippy::future_not_send)]
    pub async fn run(&mut self) {
        self.display.set_status(self.state.status_text());

        let mut input_tick = tokio::time::interval(TICK_INTERVAL);
        let mut output_tick = tokio::time::interval(TICK_INTERVAL);
        input_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        output_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running {
            let step = tokio::select! {
                task = self.tasks.recv() => task.map_or(Step::Closed, Step::Task),
                event = self.proto_events.recv() => event.map_or(Step::Closed, Step::Proto),
                wake = self.wake_events.recv() => wake.map_or(Step::Closed, Step::Wake),
                _ = input_tick.tick() => Step::InputTick,
                _ = output_tick.tick() => Step::OutputTick,
            };

            match step {
                Step::Task(task) => {
                    // One failing task never takes down the loop
                    if let Err(e) = task(self) {
                        tracing::warn!(error = %e, "scheduled task failed");
                    }
                }
                Step::Proto(event) => self.handle_protocol_event(event),
                Step::Wake(wake) => self.handle_wake_word(&wake),
                Step::InputTick => self.pump_capture().await,
                Step::OutputTick => {
                    if self.engine.has_pending_playback() {
                        self.engine.drain_and_play();
                    }
                }
                Step::Closed => break,
            }
        }

        self.cleanup().await;
    }

    /// Begin a push-to-talk listening round, opening the channel first if
    /// needed. Invoked while speaking it becomes an abort request.
    pub fn start_listening(&mut self, mode: ListeningMode) {
        if self.state == DeviceState::Speaking {
            self.abort_speaking(AbortReason::None);
            return;
        }
        if self.state != DeviceState::Idle {
            tracing::debug!(state = ?self.state, "ignoring listen request");
            return;
        }

        self.listening_mode = mode;
        self.aborting = false;
        self.set_state(DeviceState::Connecting);
        self.spawn_open_then_listen(MANUAL_OPEN_TIMEOUT, None);
    }

    /// End the current listening round
    pub fn stop_listening(&mut self) {
        if self.state != DeviceState::Listening {
            return;
        }

        self.keep_listening = false;
        // Leave listening before notifying so no frame follows the stop
        self.set_state(DeviceState::Idle);

        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            let mut proto = protocol.lock().await;
            if tokio::time::timeout(SEND_TIMEOUT, proto.send_stop_listening())
                .await
                .is_err()
            {
                tracing::warn!("listen stop send timed out");
            }
        });
    }

    /// Toggle hands-free conversation: start it from idle, interrupt
    /// speech, or end a listening round
    pub fn toggle_chat(&mut self) {
        match self.state {
            DeviceState::Idle => {
                self.keep_listening = true;
                self.listening_mode = ListeningMode::AutoStop;
                self.aborting = false;
                self.set_state(DeviceState::Connecting);
                self.spawn_open_then_listen(AUTO_OPEN_TIMEOUT, None);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => {
                // Ending the conversation tears the channel down; idle is
                // entered immediately, the close runs bounded in the
                // background
                self.keep_listening = false;
                self.set_state(DeviceState::Idle);
                self.spawn_close_channel();
            }
            DeviceState::Connecting => {}
        }
    }

    /// Cut off in-flight speech.
    ///
    /// Idempotent while an abort is in flight: the queue is flushed
    /// synchronously, exactly one abort notification goes out, and the
    /// hands-free round restarts afterwards if one was active.
    pub fn abort_speaking(&mut self, reason: AbortReason) {
        if self.aborting {
            tracing::debug!("abort already in progress");
            return;
        }
        if self.state != DeviceState::Speaking {
            return;
        }

        self.aborting = true;
        self.engine.clear_queue();

        // Residual speaker output must not re-trigger the detector
        if let Some(detector) = &self.detector {
            let flag = detector.pause_flag();
            let pause = Duration::from_millis(self.config.audio.abort_detector_pause_ms);
            flag.store(true, Ordering::Release);
            tokio::spawn(async move {
                tokio::time::sleep(pause).await;
                flag.store(false, Ordering::Release);
            });
        }

        self.set_state(DeviceState::Idle);

        let protocol = Arc::clone(&self.protocol);
        let handle = self.handle.clone();
        let wake_interrupt = matches!(reason, AbortReason::WakeWordDetected);
        tokio::spawn(async move {
            let still_open;
            {
                let mut proto = protocol.lock().await;
                if tokio::time::timeout(SEND_TIMEOUT, proto.send_abort_speaking(reason))
                    .await
                    .is_err()
                {
                    tracing::warn!("abort notification timed out");
                }
                still_open = proto.is_audio_channel_opened();
            }
            handle.schedule(move |c| {
                c.aborting = false;
                // A wake-word interrupt resumes the hands-free round once
                // the abort has gone out, if the channel survived it
                if wake_interrupt
                    && still_open
                    && c.keep_listening
                    && c.state == DeviceState::Idle
                {
                    c.set_state(DeviceState::Connecting);
                    c.spawn_open_then_listen(AUTO_OPEN_TIMEOUT, None);
                }
                Ok(())
            });
        });
    }

    /// Stop the run loop; cleanup happens on the controller task
    pub fn shutdown(&mut self) {
        self.running = false;
    }

    fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::NetworkError(message) => {
                self.display.show_error(&message);
                self.keep_listening = false;
                self.aborting = false;
                // A connect attempt already reports its own failure; only a
                // channel that had left CONNECTING needs a proactive close
                let was_connecting = self.state == DeviceState::Connecting;
                if self.state != DeviceState::Idle {
                    self.set_state(DeviceState::Idle);
                }
                if !was_connecting {
                    self.spawn_close_channel();
                }
            }
            ProtocolEvent::IncomingAudio(frame) => {
                if self.state == DeviceState::Speaking {
                    self.engine.write_decoded_frame(frame);
                } else {
                    tracing::trace!("dropping audio frame outside speaking");
                }
            }
            ProtocolEvent::Incoming(event) => self.handle_server_event(event),
            ProtocolEvent::AudioChannelOpened => {
                self.engine.ensure_active();
                let descriptors = self.iot.descriptors();
                let states = self.iot.states();
                let protocol = Arc::clone(&self.protocol);
                tokio::spawn(async move {
                    let mut proto = protocol.lock().await;
                    proto.send_iot_descriptors(descriptors).await;
                    proto.send_iot_states(states).await;
                });
            }
            ProtocolEvent::AudioChannelClosed => {
                self.keep_listening = false;
                self.aborting = false;
                if self.state != DeviceState::Idle {
                    self.set_state(DeviceState::Idle);
                }
                self.ensure_wake_word();
            }
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Tts(tts) => match tts.state {
                TtsState::Start => {
                    self.aborting = false;
                    if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
                        // Anything still queued belongs to the previous round
                        self.engine.clear_queue();
                        if self.config.audio.force_input_reinit
                            && self.engine.is_initialized()
                            && let Err(e) =
                                self.engine.reinitialize_stream(StreamDirection::Input)
                        {
                            tracing::warn!(error = %e, "capture reinit failed, not speaking");
                            self.set_state(DeviceState::Idle);
                            return;
                        }
                        self.set_state(DeviceState::Speaking);
                    }
                }
                TtsState::Stop => self.spawn_drain_then_finish(),
                TtsState::SentenceStart => {
                    if let Some(text) = tts.text {
                        self.display.show_text(&text);
                        if let Some(code) = find_verification_code(&text) {
                            self.display.show_verification_code(&code);
                        }
                    }
                }
            },
            ServerEvent::Stt { text } => {
                if !text.is_empty() {
                    self.display.show_text(&text);
                }
            }
            ServerEvent::Llm { emotion } => {
                if let Some(emotion) = emotion {
                    self.display.set_emotion(&emotion);
                }
            }
            ServerEvent::Iot { commands } => self.handle_iot_commands(&commands),
            ServerEvent::Hello(_) => {
                tracing::debug!("unexpected hello after handshake");
            }
            ServerEvent::Unknown => {
                tracing::trace!("ignoring unknown message type");
            }
        }
    }

    fn handle_iot_commands(&mut self, commands: &[serde_json::Value]) {
        if commands.is_empty() {
            return;
        }

        for command in commands {
            if let Err(e) = self.iot.execute(command) {
                tracing::warn!(error = %e, "device command failed");
            }
        }

        let states = self.iot.states();
        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            protocol.lock().await.send_iot_states(states).await;
        });
    }

    fn handle_wake_word(&mut self, event: &WakeWordEvent) {
        match self.state {
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            DeviceState::Idle => {
                self.keep_listening = true;
                self.listening_mode = ListeningMode::AutoStop;
                self.aborting = false;
                self.set_state(DeviceState::Connecting);
                self.spawn_open_then_listen(AUTO_OPEN_TIMEOUT, Some(event.phrase.clone()));
            }
            DeviceState::Connecting | DeviceState::Listening => {
                tracing::trace!(state = ?self.state, "wake word ignored");
            }
        }
    }

    /// Apply a state change and its entry side effects.
    ///
    /// An entry side effect that triggers another change defers it to the
    /// scheduler, so transitions stay strictly sequential.
    fn set_state(&mut self, next: DeviceState) {
        if self.state == next {
            return;
        }
        if self.in_transition {
            self.handle.schedule(move |c| {
                c.set_state(next);
                Ok(())
            });
            return;
        }

        self.in_transition = true;
        let prev = self.state;
        self.state = next;
        tracing::info!(?prev, ?next, "device state changed");
        self.display.set_status(next.status_text());

        match next {
            DeviceState::Idle => {
                self.engine.resume_input();
                // An abort just paused the detector for a beat; resuming
                // here would cut that window short
                if !self.aborting
                    && let Some(detector) = &self.detector
                {
                    detector.resume();
                }
            }
            DeviceState::Connecting => {}
            DeviceState::Listening => {
                self.engine.clear_queue();
                if self.config.audio.force_input_reinit && self.engine.is_initialized() {
                    if let Err(e) = self.engine.reinitialize_stream(StreamDirection::Input) {
                        tracing::warn!(error = %e, "capture reinit failed");
                    }
                }
                self.engine.resume_input();
                // The detector would hear the user's own command
                if let Some(detector) = &self.detector {
                    detector.pause();
                }
            }
            DeviceState::Speaking => {
                self.engine.pause_input();
                if let Some(detector) = &self.detector {
                    detector.resume();
                }
            }
        }

        for observer in &mut self.observers {
            if let Err(e) = observer.on_state_changed(next) {
                tracing::warn!(error = %e, "state observer failed");
            }
        }

        self.in_transition = false;
    }

    /// Worker: open the audio channel, optionally announce a wake phrase,
    /// send the listen-start, then enter listening on the controller task.
    ///
    /// The listen-start goes out before the state flips so no audio frame
    /// can precede it.
    fn spawn_open_then_listen(&self, bound: Duration, announce: Option<String>) {
        let protocol = Arc::clone(&self.protocol);
        let handle = self.handle.clone();
        let mode = self.listening_mode;

        tokio::spawn(async move {
            let mut proto = protocol.lock().await;

            let (opened, timed_out) =
                match tokio::time::timeout(bound, proto.open_audio_channel()).await {
                    Ok(opened) => (opened, false),
                    Err(_) => (false, true),
                };

            if opened {
                if let Some(phrase) = announce {
                    proto.send_wake_word_detected(&phrase).await;
                }
                proto.send_start_listening(mode).await;
                drop(proto);
                handle.schedule(|c| {
                    c.enter_listening();
                    Ok(())
                });
            } else {
                drop(proto);
                handle.schedule(move |c| {
                    // The transport alerts on its own connect failures; a
                    // timed-out open is the one case with no other report
                    if timed_out {
                        c.display.show_error("connection timed out");
                    }
                    c.keep_listening = false;
                    if c.state == DeviceState::Connecting {
                        c.set_state(DeviceState::Idle);
                    }
                    Ok(())
                });
            }
        });
    }

    /// Enter listening, unless the world changed while the worker ran
    fn enter_listening(&mut self) {
        if !self.running || self.aborting || self.state == DeviceState::Listening {
            return;
        }
        self.set_state(DeviceState::Listening);
    }

    /// Worker: wait for the playback queue to drain, allow the staged PCM
    /// to reach the speaker, then finish the speaking round
    fn spawn_drain_then_finish(&self) {
        if self.state != DeviceState::Speaking {
            return;
        }

        let queue = self.engine.playback_queue();
        let handle = self.handle.clone();
        let poll = Duration::from_millis(self.config.audio.drain_poll_ms);
        let grace = Duration::from_millis(self.config.audio.drain_grace_ms);
        let max_attempts = self.config.audio.drain_max_attempts;

        tokio::spawn(async move {
            for _ in 0..max_attempts {
                if queue.is_empty() {
                    break;
                }
                tokio::time::sleep(poll).await;
            }
            tokio::time::sleep(grace).await;
            handle.schedule(|c| {
                c.finish_speaking();
                Ok(())
            });
        });
    }

    /// Leave speaking once playback has drained; restart the hands-free
    /// round when one is active
    fn finish_speaking(&mut self) {
        if self.state != DeviceState::Speaking {
            return;
        }

        if self.keep_listening {
            self.spawn_next_listen_round();
        } else {
            self.set_state(DeviceState::Idle);
        }
    }

    /// Worker: announce the next hands-free round on the open channel
    fn spawn_next_listen_round(&self) {
        let protocol = Arc::clone(&self.protocol);
        let handle = self.handle.clone();
        let mode = self.listening_mode;

        tokio::spawn(async move {
            protocol.lock().await.send_start_listening(mode).await;
            handle.schedule(|c| {
                c.enter_listening();
                Ok(())
            });
        });
    }

    fn spawn_close_channel(&self) {
        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            let mut proto = protocol.lock().await;
            if tokio::time::timeout(CLOSE_TIMEOUT, proto.close_audio_channel())
                .await
                .is_err()
            {
                tracing::warn!("channel close timed out");
            }
        });
    }

    /// Read, encode, and upload one capture frame while listening.
    ///
    /// The transport lock is only tried, never awaited: a frame captured
    /// while a worker holds the transport is stale by the time the lock
    /// frees, so it is dropped instead.
    async fn pump_capture(&mut self) {
        if self.state != DeviceState::Listening {
            return;
        }

        let Some(frame) = self.engine.read_encoded_frame() else {
            return;
        };

        match self.protocol.try_lock() {
            Ok(mut proto) => proto.send_audio(frame).await,
            Err(_) => tracing::trace!("transport busy, dropped capture frame"),
        }
    }

    async fn cleanup(&mut self) {
        tracing::info!("shutting down device controller");

        if let Some(mut detector) = self.detector.take() {
            detector.stop();
        }
        self.engine.clear_capture_tap();
        self.engine.close();

        let mut proto = self.protocol.lock().await;
        if tokio::time::timeout(CLOSE_TIMEOUT, proto.close_audio_channel())
            .await
            .is_err()
        {
            tracing::warn!("channel close timed out during shutdown");
        }
    }
}

/// Scan text for a run of six or more digits, as sent during device
/// activation
fn find_verification_code(text: &str) -> Option<String> {
    let mut run = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            run.push(ch);
        } else {
            if run.len() >= 6 {
                return Some(run);
            }
            run.clear();
        }
    }
    if run.len() >= 6 { Some(run) } else { None }
}
