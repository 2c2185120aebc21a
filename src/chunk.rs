//! Audio data chunk with metadata.

use std::time::Duration;

/// Bytes per 16-bit PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A discrete buffer of PCM audio passed between the engine and the transport.
///
/// `AudioChunk` is the unit handed from capture to the network and from the
/// network to render. It is immutable once built and owned by exactly one
/// party: handing it off moves it, the producer keeps nothing.
///
/// Audio is 16-bit signed little-endian PCM. A trailing odd byte (possible on
/// a truncated network frame) is carried along but ignored by the sample
/// helpers.
///
/// # Example
///
/// ```
/// use echo_link::AudioChunk;
/// use std::time::Duration;
///
/// let chunk = AudioChunk::new(vec![0u8; 3200], Duration::ZERO);
/// assert_eq!(chunk.duration(16000), Duration::from_millis(100));
/// assert_eq!(chunk.sample_count(), 1600);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    data: Vec<u8>,
    /// Time since the producing pipeline or connection started.
    pub timestamp: Duration,
    /// Whether the capture silence detector considered this chunk silent.
    pub is_silence: bool,
}

impl AudioChunk {
    /// Creates a chunk from raw PCM bytes.
    pub fn new(data: Vec<u8>, timestamp: Duration) -> Self {
        Self {
            data,
            timestamp,
            is_silence: false,
        }
    }

    /// Creates a chunk and tags it with the silence detector's verdict.
    pub fn with_silence(data: Vec<u8>, timestamp: Duration, is_silence: bool) -> Self {
        Self {
            data,
            timestamp,
            is_silence,
        }
    }

    /// Creates a chunk of `len` zero bytes.
    pub fn silence(len: usize, timestamp: Duration) -> Self {
        Self::with_silence(vec![0u8; len], timestamp, true)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the chunk and returns the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Returns the length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if this chunk contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the number of complete 16-bit samples.
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Iterates over the complete 16-bit samples.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        samples(&self.data)
    }

    /// Returns the playback duration of this chunk for mono audio at `sample_rate`.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / f64::from(sample_rate))
    }
}

/// Iterates over the complete little-endian 16-bit samples in `data`.
pub(crate) fn samples(data: &[u8]) -> impl Iterator<Item = i16> + '_ {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

/// Mean absolute sample magnitude, 0 for an empty buffer.
pub(crate) fn mean_magnitude(data: &[u8]) -> u32 {
    let count = data.len() / BYTES_PER_SAMPLE;
    if count == 0 {
        return 0;
    }
    let sum: u64 = samples(data)
        .map(|s| u64::from(s.unsigned_abs()))
        .sum();
    (sum / count as u64) as u32
}

/// RMS level over at most `window` samples, 0 for an empty buffer.
pub(crate) fn rms_level(data: &[u8], window: usize) -> u16 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for s in samples(data).take(window) {
        sum_squares += f64::from(s).powi(2);
        count += 1;
    }
    if count == 0 {
        return 0;
    }
    (sum_squares / count as f64).sqrt().min(f64::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_duration_16khz() {
        let chunk = AudioChunk::new(vec![0u8; 3200], Duration::ZERO);
        assert_eq!(chunk.duration(16000), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_sample_rate() {
        let chunk = AudioChunk::new(vec![0u8; 100], Duration::ZERO);
        assert_eq!(chunk.duration(0), Duration::ZERO);
    }

    #[test]
    fn test_samples_ignore_trailing_byte() {
        let mut data = pcm(&[1, -2, 300]);
        data.push(0x7f);
        let chunk = AudioChunk::new(data, Duration::ZERO);
        assert_eq!(chunk.len(), 7);
        assert_eq!(chunk.sample_count(), 3);
        assert_eq!(chunk.samples().collect::<Vec<_>>(), vec![1, -2, 300]);
    }

    #[test]
    fn test_silence_chunk() {
        let chunk = AudioChunk::silence(64, Duration::from_millis(5));
        assert!(chunk.is_silence);
        assert!(chunk.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = AudioChunk::new(vec![], Duration::ZERO);
        assert!(chunk.is_empty());
        assert_eq!(chunk.sample_count(), 0);
    }

    #[test]
    fn test_mean_magnitude() {
        assert_eq!(mean_magnitude(&pcm(&[100, -300, 0, 200])), 150);
        assert_eq!(mean_magnitude(&[]), 0);
        // i16::MIN has no positive counterpart; must not overflow
        assert_eq!(mean_magnitude(&pcm(&[i16::MIN])), 32768);
    }

    #[test]
    fn test_rms_level_window() {
        let data = pcm(&[1000, -1000, 1000, -1000, 30000]);
        assert_eq!(rms_level(&data, 4), 1000);
        assert_eq!(rms_level(&[], 512), 0);
    }
}
