//! Audio engine: hardware I/O, Opus codec, and the bounded playback queue
//!
//! Owns the microphone and speaker streams and keeps them isolated from
//! protocol and state concerns. Hardware errors are recovered locally by
//! stream reinitialization; codec errors discard single frames.

mod codec;
mod queue;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

pub use codec::{FrameDecoder, FrameEncoder};
pub use queue::PlaybackQueue;

use crate::{Error, Result};

/// Sample rate for capture (16 kHz speech)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate for playback (matches server TTS output)
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Channel count for both directions
pub const CHANNELS: u16 = 1;

/// Fixed frame duration in milliseconds
pub const FRAME_DURATION_MS: u32 = 60;

/// PCM samples per capture frame
pub const INPUT_FRAME_SIZE: usize = (INPUT_SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// PCM samples per playback frame
pub const OUTPUT_FRAME_SIZE: usize =
    (OUTPUT_SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Frames decoded per `drain_and_play` call
const PLAY_BATCH: usize = 5;

/// Capture backlog cap; beyond this the oldest samples are dropped
const CAPTURE_BUFFER_CAP: usize = INPUT_FRAME_SIZE * 50;

/// One fixed-duration unit of encoded audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Vec<u8>);

impl AudioFrame {
    /// Wrap encoded bytes as a frame
    #[must_use]
    pub const fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Encoded payload
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the frame, yielding its payload
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Which hardware stream an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Microphone capture
    Input,
    /// Speaker playback
    Output,
}

type SampleBuffer = Arc<Mutex<VecDeque<i16>>>;
type CaptureTap = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<i16>>>>>;

/// Owns the microphone and speaker handles, the Opus codec pair, and the
/// bounded playback queue.
///
/// Constructed without touching hardware; `initialize` opens the streams.
/// Not `Send`: lives on the controller thread, like the rest of the audio
/// path. The cpal callbacks only touch the shared sample buffers.
pub struct AudioEngine {
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    queue: Arc<PlaybackQueue>,
    capture_buf: SampleBuffer,
    playback_buf: SampleBuffer,
    capture_tap: CaptureTap,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    input_failed: Arc<AtomicBool>,
    output_failed: Arc<AtomicBool>,
    input_paused: AtomicBool,
    closing: bool,
}

impl AudioEngine {
    /// Create an engine with codec state but no open hardware streams
    ///
    /// # Errors
    ///
    /// Returns error if the Opus encoder or decoder cannot be constructed
    pub fn new() -> Result<Self> {
        Ok(Self {
            encoder: FrameEncoder::new()?,
            decoder: FrameDecoder::new()?,
            queue: Arc::new(PlaybackQueue::for_frame_duration(FRAME_DURATION_MS)),
            capture_buf: Arc::new(Mutex::new(VecDeque::new())),
            playback_buf: Arc::new(Mutex::new(VecDeque::new())),
            capture_tap: Arc::new(Mutex::new(None)),
            input_stream: None,
            output_stream: None,
            input_failed: Arc::new(AtomicBool::new(false)),
            output_failed: Arc::new(AtomicBool::new(false)),
            input_paused: AtomicBool::new(false),
            closing: false,
        })
    }

    /// Open both hardware streams at the fixed rates
    ///
    /// # Errors
    ///
    /// Returns error if either device cannot be opened; the caller surfaces
    /// this to the user and may continue without audio
    pub fn initialize(&mut self) -> Result<()> {
        self.input_stream = Some(self.build_input_stream()?);
        self.output_stream = Some(self.build_output_stream()?);

        tracing::info!(
            input_rate = INPUT_SAMPLE_RATE,
            output_rate = OUTPUT_SAMPLE_RATE,
            frame_ms = FRAME_DURATION_MS,
            "audio engine initialized"
        );
        Ok(())
    }

    /// Whether hardware streams have been opened
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.input_stream.is_some() && self.output_stream.is_some()
    }

    /// Handle to the playback queue, shared with drain workers
    #[must_use]
    pub fn playback_queue(&self) -> Arc<PlaybackQueue> {
        Arc::clone(&self.queue)
    }

    /// Read and encode one frame of captured audio.
    ///
    /// Returns `None` when input is paused, no stream is open, fewer than
    /// one frame of samples is buffered, or a hardware error forced a
    /// stream reset. Hardware errors never propagate to the caller.
    pub fn read_encoded_frame(&mut self) -> Option<AudioFrame> {
        if self.is_input_paused() {
            return None;
        }

        if self.input_failed.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.reinitialize_stream(StreamDirection::Input) {
                tracing::error!(error = %e, "input stream recovery failed");
            }
            return None;
        }

        self.input_stream.as_ref()?;

        let pcm: Vec<i16> = {
            let mut buf = lock(&self.capture_buf);

            // Drain backlog beyond two frames down to ~1.5 frames of
            // margin so capture latency stays bounded
            if buf.len() > INPUT_FRAME_SIZE * 2 {
                let keep = INPUT_FRAME_SIZE * 3 / 2;
                let excess = buf.len() - keep;
                buf.drain(..excess);
                tracing::debug!(skipped = excess, "dropped capture backlog");
            }

            if buf.len() < INPUT_FRAME_SIZE {
                return None;
            }
            buf.drain(..INPUT_FRAME_SIZE).collect()
        };

        if pcm.len() != INPUT_FRAME_SIZE {
            tracing::warn!(
                samples = pcm.len(),
                "abnormal capture window, resetting input stream"
            );
            if let Err(e) = self.reinitialize_stream(StreamDirection::Input) {
                tracing::error!(error = %e, "input stream reset failed");
            }
            return None;
        }

        match self.encoder.encode(&pcm) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(error = %e, "frame encode failed");
                None
            }
        }
    }

    /// Enqueue an inbound encoded frame for playback; never blocks
    pub fn write_decoded_frame(&self, frame: AudioFrame) {
        if self.queue.push(frame) {
            tracing::warn!("playback queue full, dropped oldest frame");
        }
    }

    /// Decode and stage up to a small batch of queued frames for playback.
    ///
    /// A decode failure discards only that frame; an output stream failure
    /// triggers reinitialization and never discards the queue.
    pub fn drain_and_play(&mut self) {
        if self.output_failed.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.reinitialize_stream(StreamDirection::Output) {
                tracing::error!(error = %e, "output stream recovery failed");
                return;
            }
        }

        // Without a speaker, staged PCM has no consumer; leave the frames
        // in the bounded queue instead
        if self.output_stream.is_none() {
            return;
        }

        for _ in 0..PLAY_BATCH {
            let Some(frame) = self.queue.pop() else { break };
            match self.decoder.decode(&frame) {
                Ok(pcm) => lock(&self.playback_buf).extend(pcm),
                Err(e) => tracing::warn!(error = %e, "discarding undecodable frame"),
            }
        }
    }

    /// Pause capture reads
    pub fn pause_input(&self) {
        self.input_paused.store(true, Ordering::Release);
        tracing::debug!("audio input paused");
    }

    /// Resume capture reads
    pub fn resume_input(&self) {
        self.input_paused.store(false, Ordering::Release);
        tracing::debug!("audio input resumed");
    }

    /// Whether capture reads are paused
    #[must_use]
    pub fn is_input_paused(&self) -> bool {
        self.input_paused.load(Ordering::Acquire)
    }

    /// Flush the playback queue and any staged PCM, used on abort so no
    /// stale audio plays past the abort instant
    pub fn clear_queue(&self) {
        let dropped = self.queue.clear();
        lock(&self.playback_buf).clear();
        if dropped > 0 {
            tracing::info!(dropped, "cleared playback queue");
        }
    }

    /// Whether any audio is still queued or staged for the speaker
    #[must_use]
    pub fn has_pending_playback(&self) -> bool {
        !self.queue.is_empty() || !lock(&self.playback_buf).is_empty()
    }

    /// Install a tap receiving copies of captured samples (wake word path)
    pub fn set_capture_tap(&self, tap: mpsc::UnboundedSender<Vec<i16>>) {
        *lock_tap(&self.capture_tap) = Some(tap);
    }

    /// Remove the capture tap
    pub fn clear_capture_tap(&self) {
        *lock_tap(&self.capture_tap) = None;
    }

    /// Stop, close, and reopen one direction's hardware stream, restarting
    /// it active. The universal recovery action for hardware errors.
    ///
    /// # Errors
    ///
    /// Returns error if the replacement stream cannot be opened
    pub fn reinitialize_stream(&mut self, direction: StreamDirection) -> Result<()> {
        if self.closing {
            return Ok(());
        }

        match direction {
            StreamDirection::Input => {
                drop(self.input_stream.take());
                lock(&self.capture_buf).clear();
                self.input_stream = Some(self.build_input_stream()?);
            }
            StreamDirection::Output => {
                drop(self.output_stream.take());
                self.output_stream = Some(self.build_output_stream()?);
            }
        }

        tracing::info!(?direction, "audio stream reinitialized");
        Ok(())
    }

    /// Reopen any stream that is missing, logging failures instead of
    /// propagating them; used when the audio channel opens
    pub fn ensure_active(&mut self) {
        if self.input_stream.is_none() {
            if let Err(e) = self.reinitialize_stream(StreamDirection::Input) {
                tracing::warn!(error = %e, "could not restart input stream");
            }
        }
        if self.output_stream.is_none() {
            if let Err(e) = self.reinitialize_stream(StreamDirection::Output) {
                tracing::warn!(error = %e, "could not restart output stream");
            }
        }
    }

    /// Idempotent ordered teardown: flush queue, close input, close
    /// output, release hardware handles
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        self.clear_queue();
        drop(self.input_stream.take());
        drop(self.output_stream.take());
        tracing::info!("audio engine closed");
    }

    fn build_input_stream(&self) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == CHANNELS
                    && c.min_sample_rate() <= SampleRate(INPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(INPUT_SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

        let config: StreamConfig = supported.with_sample_rate(SampleRate(INPUT_SAMPLE_RATE)).config();

        let buffer = Arc::clone(&self.capture_buf);
        let tap = Arc::clone(&self.capture_tap);
        let failed = Arc::clone(&self.input_failed);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|s| {
                            #[allow(clippy::cast_possible_truncation)]
                            let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                            v
                        })
                        .collect();

                    {
                        let mut tap_slot = lock_tap(&tap);
                        if let Some(sender) = tap_slot.as_ref() {
                            if sender.send(samples.clone()).is_err() {
                                *tap_slot = None;
                            }
                        }
                    }

                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend(samples);
                        while buf.len() > CAPTURE_BUFFER_CAP {
                            buf.pop_front();
                        }
                    }
                },
                {
                    let failed = Arc::clone(&failed);
                    move |err| {
                        tracing::error!(error = %err, "audio capture error");
                        failed.store(true, Ordering::Release);
                    }
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = INPUT_SAMPLE_RATE,
            "input stream opened"
        );
        Ok(stream)
    }

    fn build_output_stream(&self) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == CHANNELS
                    && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: stereo, duplicating the mono signal
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config: StreamConfig = supported
            .with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE))
            .config();
        let channels = config.channels as usize;

        let buffer = Arc::clone(&self.playback_buf);
        let failed = Arc::clone(&self.output_failed);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buf = lock(&buffer);
                    for frame in data.chunks_mut(channels) {
                        let sample = buf.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }
                },
                {
                    let failed = Arc::clone(&failed);
                    move |err| {
                        tracing::error!(error = %err, "audio playback error");
                        failed.store(true, Ordering::Release);
                    }
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = OUTPUT_SAMPLE_RATE,
            channels,
            "output stream opened"
        );
        Ok(stream)
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(buf: &Mutex<VecDeque<i16>>) -> std::sync::MutexGuard<'_, VecDeque<i16>> {
    buf.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_tap(
    tap: &Mutex<Option<mpsc::UnboundedSender<Vec<i16>>>>,
) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<i16>>>> {
    tap.lock().unwrap_or_else(PoisonError::into_inner)
}
