//! Audio codec support (Opus)

use crate::{Error, Result};

/// Audio frame duration in milliseconds (Opus standard)
pub const FRAME_DURATION_MS: u32 = 20;

/// RTP clock rate of the Opus payload
pub const OPUS_CLOCK_RATE: u32 = 48000;

/// Max Opus packet size
const MAX_PACKET_SIZE: usize = 4000;

/// Max frame size for Opus is 120ms @ 48kHz
const MAX_FRAME_SIZE: usize = 5760;

/// Audio codec configuration
#[derive(Debug, Clone)]
pub struct AudioCodecConfig {
    /// Sample rate in Hz (16000 for voice capture)
    pub sample_rate: u32,
    /// Bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioCodecConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bitrate: 32000,
        }
    }
}

impl AudioCodecConfig {
    /// Samples in one 20ms frame
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * FRAME_DURATION_MS / 1000) as usize
    }

    fn validate(&self) -> Result<()> {
        if ![8000, 12000, 16000, 24000, 48000].contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "Opus sample rate must be 8000, 12000, 16000, 24000 or 48000 Hz, got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Mono Opus encoder that re-frames arbitrary sample blocks into 20ms packets
pub struct AudioEncoder {
    config: AudioCodecConfig,
    encoder: opus::Encoder,
    pending: Vec<f32>,
}

// SAFETY: the encoder state is only touched through `&mut self`; the raw
// pointers inside are never shared between instances.
unsafe impl Send for AudioEncoder {}
unsafe impl Sync for AudioEncoder {}

impl AudioEncoder {
    pub fn new(config: AudioCodecConfig) -> Result<Self> {
        config.validate()?;

        let mut encoder = opus::Encoder::new(
            config.sample_rate,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| Error::EncodingError(format!("Failed to create Opus encoder: {:?}", e)))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| Error::EncodingError(format!("Failed to set bitrate: {:?}", e)))?;

        Ok(Self {
            pending: Vec::with_capacity(config.frame_size() * 2),
            config,
            encoder,
        })
    }

    pub fn config(&self) -> &AudioCodecConfig {
        &self.config
    }

    /// Buffer `samples` and encode every complete 20ms frame
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(samples);

        let frame_size = self.config.frame_size();
        let mut packets = Vec::new();
        let mut consumed = 0;

        while self.pending.len() - consumed >= frame_size {
            let frame = &self.pending[consumed..consumed + frame_size];
            let mut output = vec![0u8; MAX_PACKET_SIZE];
            let len = self
                .encoder
                .encode_float(frame, &mut output)
                .map_err(|e| Error::EncodingError(format!("Opus encoding failed: {}", e)))?;
            output.truncate(len);
            packets.push(output);
            consumed += frame_size;
        }

        self.pending.drain(..consumed);
        Ok(packets)
    }

    /// Samples waiting for a complete frame
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Mono Opus decoder
pub struct AudioDecoder {
    sample_rate: u32,
    decoder: opus::Decoder,
}

// SAFETY: see `AudioEncoder`.
unsafe impl Send for AudioDecoder {}
unsafe impl Sync for AudioDecoder {}

impl AudioDecoder {
    /// Create a decoder producing samples at `sample_rate`
    pub fn new(sample_rate: u32) -> Result<Self> {
        AudioCodecConfig {
            sample_rate,
            ..Default::default()
        }
        .validate()?;

        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)
            .map_err(|e| Error::EncodingError(format!("Failed to create Opus decoder: {:?}", e)))?;

        Ok(Self {
            sample_rate,
            decoder,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode one Opus packet (RTP payload)
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>> {
        let mut output = vec![0f32; MAX_FRAME_SIZE];
        let len = self
            .decoder
            .decode_float(payload, &mut output, false)
            .map_err(|e| Error::EncodingError(format!("Opus decoding failed: {:?}", e)))?;
        output.truncate(len);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(AudioCodecConfig::default().frame_size(), 320);
        let config = AudioCodecConfig {
            sample_rate: 48000,
            ..Default::default()
        };
        assert_eq!(config.frame_size(), 960);
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = AudioCodecConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(AudioEncoder::new(config).is_err());
        assert!(AudioDecoder::new(44100).is_err());
    }

    #[test]
    fn test_encoder_buffers_partial_frames() {
        let mut encoder = AudioEncoder::new(AudioCodecConfig::default()).unwrap();

        assert!(encoder.encode(&[0.0; 200]).unwrap().is_empty());
        assert_eq!(encoder.pending_samples(), 200);

        let packets = encoder.encode(&[0.0; 500]).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(encoder.pending_samples(), 60);
    }

    #[test]
    fn test_decode_encoded_frame() {
        let mut encoder = AudioEncoder::new(AudioCodecConfig::default()).unwrap();
        let mut decoder = AudioDecoder::new(16000).unwrap();

        let tone: Vec<f32> = (0..320)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        let packets = encoder.encode(&tone).unwrap();
        assert_eq!(packets.len(), 1);

        let decoded = decoder.decode(&packets[0]).unwrap();
        assert_eq!(decoded.len(), 320);
    }
}
