//! Stateless audio conversions
//!
//! PCM16 is little-endian, 16-bit signed, mono. Normalized samples are `f32`
//! in `[-1.0, 1.0]`.

use crate::error::CallResult;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Convert a single normalized sample to PCM16 by clamping and scaling by 32767
pub fn sample_to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * 32767.0) as i16
}

/// Convert a PCM16 sample to a normalized float
pub fn pcm16_to_sample(value: i16) -> f32 {
    value as f32 / 32768.0
}

/// Encode normalized samples as little-endian PCM16 bytes
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes to normalized samples
///
/// A trailing odd byte is ignored.
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Encode a binary buffer for the text control channel
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a text-channel payload back into bytes
pub fn decode_base64(text: &str) -> CallResult<Vec<u8>> {
    Ok(BASE64.decode(text.trim())?)
}

/// Duration in seconds of `sample_count` samples at `sample_rate`
pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}

/// Average interleaved channels down to mono
pub fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Simple linear resampling
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples[idx.min(samples.len() - 1)]
        };

        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_clamps_and_scales() {
        assert_eq!(sample_to_pcm16(0.0), 0);
        assert_eq!(sample_to_pcm16(1.0), 32767);
        assert_eq!(sample_to_pcm16(-1.0), -32767);
        assert_eq!(sample_to_pcm16(3.5), 32767);
        assert_eq!(sample_to_pcm16(-7.0), -32767);
        assert_eq!(sample_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn test_pcm16_bytes_are_little_endian() {
        let bytes = f32_to_pcm16_bytes(&[1.0, -1.0]);
        assert_eq!(bytes, vec![0xff, 0x7f, 0x01, 0x80]);
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        let samples = pcm16_bytes_to_f32(&[0x00, 0x40, 0x00, 0xc0, 0x12]);
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_base64_rejects_garbage() {
        assert!(decode_base64("***").is_err());
        assert_eq!(decode_base64(&encode_base64(&[1, 2, 3])).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_duration_calculation() {
        assert_eq!(duration_seconds(16000, 16000), 1.0);
        assert_eq!(duration_seconds(480, 24000), 0.02);
        assert_eq!(duration_seconds(10, 0), 0.0);
    }

    #[test]
    fn test_mix_to_mono() {
        let mono = mix_to_mono(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn test_resample() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let resampled = resample(&samples, 4, 2);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }
}
