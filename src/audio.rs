//! Audio seams and PCM16 wire helpers.
//!
//! Device access lives behind these traits; the orchestrator never touches
//! the OS audio stack itself. Frames are raw PCM16 little-endian bytes at the
//! remote service's sample rate.

use base64::Engine;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Sample rate the remote service expects for PCM16 audio in both directions.
pub const REALTIME_PCM16_SAMPLE_RATE: u32 = 24_000;

/// A local capture device (typically the microphone). Opening may prompt the
/// user for OS-level access and may fail.
pub trait AudioSource: Send {
    /// Opens the device and returns the stream of captured frames. Errors
    /// here abort the connect attempt as a media-acquisition failure.
    fn open(&mut self) -> anyhow::Result<mpsc::Receiver<Bytes>>;

    /// Stops capture and releases the device. Called once per connection
    /// during teardown.
    fn stop(&mut self);
}

/// A playback destination for remote audio. Writes are fire-and-forget.
pub trait AudioSink: Send + Sync {
    fn play(&self, frame: Bytes);
}

/// Encodes a PCM16 frame into the base64 form the wire protocol carries.
pub fn encode_pcm16_base64(frame: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(frame)
}

/// Decodes a base64 audio payload back into PCM16 bytes. Malformed payloads
/// decode to an empty frame rather than an error.
pub fn decode_base64_pcm16(payload: &str) -> Bytes {
    match base64::engine::general_purpose::STANDARD.decode(payload) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => {
            tracing::error!("failed to decode base64 audio payload");
            Bytes::new()
        }
    }
}
