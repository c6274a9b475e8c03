//! Wake word detection
//!
//! Watches the capture stream for a spoken trigger while the device is
//! otherwise idle or speaking. Detection is local energy-based voice
//! activity: a sustained speech segment followed by silence counts as the
//! first configured wake phrase.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::{Error, Result};

/// Minimum RMS energy to consider a window speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum speech length to trigger, in samples at 16 kHz
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Trailing silence that ends an utterance, in samples
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// A detected wake phrase
#[derive(Debug, Clone)]
pub struct WakeWordEvent {
    /// The phrase credited with the detection
    pub phrase: String,
}

/// Sender half of the wake-word event channel
pub type WakeEventSender = mpsc::UnboundedSender<WakeWordEvent>;

/// Receiver half of the wake-word event channel
pub type WakeEventReceiver = mpsc::UnboundedReceiver<WakeWordEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Listening,
}

/// Speech segment state machine over fixed sample windows
struct SegmentDetector {
    state: SegmentState,
    speech_samples: usize,
    silence_counter: usize,
}

impl SegmentDetector {
    const fn new() -> Self {
        Self {
            state: SegmentState::Idle,
            speech_samples: 0,
            silence_counter: 0,
        }
    }

    /// Feed one window; returns true when a complete speech segment ends
    fn process(&mut self, samples: &[f32]) -> bool {
        let energy = calculate_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            SegmentState::Idle => {
                if is_speech {
                    self.state = SegmentState::Listening;
                    self.speech_samples = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            SegmentState::Listening => {
                self.speech_samples += samples.len();

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter > SILENCE_SAMPLES
                    && self.speech_samples > MIN_SPEECH_SAMPLES + self.silence_counter
                {
                    tracing::debug!(samples = self.speech_samples, "speech segment complete");
                    self.reset();
                    return true;
                }

                // Too much silence without enough speech
                if self.silence_counter > SILENCE_SAMPLES * 2 {
                    self.reset();
                }
            }
        }

        false
    }

    fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.speech_samples = 0;
        self.silence_counter = 0;
    }
}

/// Runs segment detection over a capture tap and reports wake events
pub struct WakeWordDetector {
    wake_words: Vec<String>,
    events: WakeEventSender,
    paused: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WakeWordDetector {
    /// Create a detector; `events` delivers detections to the controller
    ///
    /// # Errors
    ///
    /// Returns error when no wake phrases are configured
    pub fn new(wake_words: Vec<String>, events: WakeEventSender) -> Result<Self> {
        let normalized: Vec<String> = wake_words
            .into_iter()
            .map(|w| w.to_lowercase().trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();

        if normalized.is_empty() {
            return Err(Error::WakeWord("no wake phrases configured".to_string()));
        }

        tracing::debug!(wake_words = ?normalized, "wake word detector initialized");

        Ok(Self {
            wake_words: normalized,
            events,
            paused: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    /// Begin consuming capture windows from `samples`.
    ///
    /// # Errors
    ///
    /// Returns error if the detector is already running
    pub fn start(&mut self, mut samples: mpsc::UnboundedReceiver<Vec<i16>>) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::WakeWord("detector already running".to_string()));
        }

        let phrase = self.wake_words[0].clone();
        let events = self.events.clone();
        let paused = Arc::clone(&self.paused);

        self.task = Some(tokio::spawn(async move {
            let mut detector = SegmentDetector::new();
            let mut window = Vec::with_capacity(1024);

            while let Some(pcm) = samples.recv().await {
                if paused.load(Ordering::Acquire) {
                    detector.reset();
                    continue;
                }

                window.clear();
                window.extend(pcm.iter().map(|&s| f32::from(s) / 32768.0));

                if detector.process(&window) {
                    tracing::info!(phrase, "wake word detected");
                    if events.send(WakeWordEvent {
                        phrase: phrase.clone(),
                    })
                    .is_err()
                    {
                        break;
                    }
                }
            }

            tracing::debug!("wake word tap closed, detector stopping");
        }));

        Ok(())
    }

    /// True while the detector task is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Suppress detections without tearing down the tap
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Whether detections are currently suppressed
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Resume detections after a pause
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Handle used to pause/resume from spawned work
    #[must_use]
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Stop the detector task
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// The configured wake phrases
    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// RMS energy of one sample window
#[allow(clippy::cast_precision_loss)]
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_energy(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_energy(&loud) > 0.4);
    }

    #[test]
    fn segment_completes_after_speech_then_silence() {
        let mut detector = SegmentDetector::new();
        let speech = vec![0.5f32; 960];
        let silence = vec![0.0f32; 960];

        // 0.36s of speech
        for _ in 0..6 {
            assert!(!detector.process(&speech));
        }

        // silence until the segment closes
        let mut fired = false;
        for _ in 0..12 {
            if detector.process(&silence) {
                fired = true;
                break;
            }
        }
        assert!(fired);
    }

    #[test]
    fn silence_alone_never_triggers() {
        let mut detector = SegmentDetector::new();
        let silence = vec![0.0f32; 960];
        for _ in 0..50 {
            assert!(!detector.process(&silence));
        }
    }

    #[test]
    fn rejects_empty_wake_word_list() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(WakeWordDetector::new(vec![], tx).is_err());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(WakeWordDetector::new(vec!["   ".to_string()], tx).is_err());
    }

    #[tokio::test]
    async fn detects_over_a_tap_and_respects_pause() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut detector =
            WakeWordDetector::new(vec!["Hey Chime".to_string()], event_tx).unwrap();
        assert_eq!(detector.wake_words(), ["hey chime"]);

        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        detector.start(tap_rx).unwrap();
        assert!(detector.is_running());

        // paused input produces nothing
        detector.pause();
        for _ in 0..10 {
            tap_tx.send(vec![16_000_i16; 960]).unwrap();
        }
        detector.resume();

        // speech then silence fires exactly one event
        for _ in 0..8 {
            tap_tx.send(vec![16_000_i16; 960]).unwrap();
        }
        for _ in 0..12 {
            tap_tx.send(vec![0_i16; 960]).unwrap();
        }

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), event_rx.recv())
            .await
            .expect("detection within timeout")
            .expect("channel open");
        assert_eq!(event.phrase, "hey chime");

        detector.stop();
    }
}
