//! Opus frame encoder/decoder bound to the fixed capture and playback rates

use crate::audio::{AudioFrame, INPUT_FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_FRAME_SIZE, OUTPUT_SAMPLE_RATE};
use crate::{Error, Result};

/// Upper bound on a single encoded Opus frame
const MAX_PACKET_SIZE: usize = 4000;

/// Encodes fixed-size PCM capture windows into Opus frames
pub struct FrameEncoder {
    inner: opus::Encoder,
}

impl FrameEncoder {
    /// Create an encoder bound to the capture sample rate
    ///
    /// # Errors
    ///
    /// Returns error if libopus rejects the configuration
    pub fn new() -> Result<Self> {
        let inner = opus::Encoder::new(
            INPUT_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Audio,
        )
        .map_err(|e| Error::Codec(e.to_string()))?;

        Ok(Self { inner })
    }

    /// Encode exactly one frame of PCM samples.
    ///
    /// Partial frames are invalid input and rejected.
    ///
    /// # Errors
    ///
    /// Returns error on a short or long window, or on an encoder failure
    pub fn encode(&mut self, pcm: &[i16]) -> Result<AudioFrame> {
        if pcm.len() != INPUT_FRAME_SIZE {
            return Err(Error::Codec(format!(
                "expected {INPUT_FRAME_SIZE} samples, got {}",
                pcm.len()
            )));
        }

        let data = self
            .inner
            .encode_vec(pcm, MAX_PACKET_SIZE)
            .map_err(|e| Error::Codec(e.to_string()))?;

        Ok(AudioFrame::new(data))
    }
}

/// Decodes Opus frames into fixed-size PCM playback windows
pub struct FrameDecoder {
    inner: opus::Decoder,
}

impl FrameDecoder {
    /// Create a decoder bound to the playback sample rate
    ///
    /// # Errors
    ///
    /// Returns error if libopus rejects the configuration
    pub fn new() -> Result<Self> {
        let inner = opus::Decoder::new(OUTPUT_SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| Error::Codec(e.to_string()))?;

        Ok(Self { inner })
    }

    /// Decode one encoded frame into PCM samples
    ///
    /// # Errors
    ///
    /// Returns error on a corrupt frame; the caller discards it and
    /// continues with the next
    pub fn decode(&mut self, frame: &AudioFrame) -> Result<Vec<i16>> {
        let mut pcm = vec![0_i16; OUTPUT_FRAME_SIZE];
        let decoded = self
            .inner
            .decode(frame.as_bytes(), &mut pcm, false)
            .map_err(|e| Error::Codec(e.to_string()))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_partial_frames() {
        let mut encoder = FrameEncoder::new().unwrap();
        let short = vec![0_i16; INPUT_FRAME_SIZE - 1];
        assert!(encoder.encode(&short).is_err());

        let long = vec![0_i16; INPUT_FRAME_SIZE + 1];
        assert!(encoder.encode(&long).is_err());
    }

    #[test]
    fn encode_decode_one_frame() {
        let mut encoder = FrameEncoder::new().unwrap();
        let mut decoder = FrameDecoder::new().unwrap();

        let pcm = vec![0_i16; INPUT_FRAME_SIZE];
        let frame = encoder.encode(&pcm).unwrap();
        assert!(!frame.is_empty());

        let out = decoder.decode(&frame).unwrap();
        assert_eq!(out.len(), OUTPUT_FRAME_SIZE);
    }

    #[test]
    fn corrupt_frame_fails_decode() {
        let mut decoder = FrameDecoder::new().unwrap();
        let garbage = AudioFrame::new(vec![0xFF; 7]);
        assert!(decoder.decode(&garbage).is_err());
    }
}
