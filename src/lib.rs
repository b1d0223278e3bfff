//! Firmware-side core for a LoRa-class handheld two-way radio: packet
//! framing, key agreement and AEAD, the audio jitter buffer, the session
//! state machine, the dial manager, and inbound/outbound dispatch.
//!
//! The crate owns no executor and no radio/codec peripheral. It exposes
//! `async fn`s that suspend at well-defined points (awaiting a transport
//! byte, awaiting an ACK, awaiting a mutex) and leaves scheduling,
//! interrupts, and DMA to the firmware that links this crate in — the
//! same division of labor the teacher draws between its `Interface`
//! trait and the SPI/DMA peripheral behind it.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod audio;
pub mod audio_hal;
pub mod crypto;
pub mod device_id;
pub mod dial;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod framing;
pub mod frequency;
pub mod persistence;
pub mod session;
pub mod transport;
pub mod worker;

use embassy_time::Duration;

/// Top-level tunables a firmware integrator sets once at boot. Grouped
/// the way the teacher's `Config` structs group per-peripheral settings,
/// with a `Default` that matches the values named in the operations
/// they govern.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct CoreConfig {
    /// Depth of the audio jitter buffer, in frames (`audio::RingBuffer`).
    pub jitter_depth: usize,
    /// `session::Session` inactivity watchdog period.
    pub inactivity_timeout: Duration,
    /// `crypto::CryptoContext::needs_refresh` packet-count threshold.
    pub key_refresh_packets: u64,
    /// `crypto::CryptoContext::needs_refresh` key-age threshold.
    pub key_refresh_age: Duration,
    /// `dispatcher::Dispatcher::send_reliable` backoff schedule, in ms,
    /// tried in order before giving up.
    pub ack_backoff_ms: [u64; 3],
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            jitter_depth: audio::DEFAULT_JITTER_DEPTH,
            inactivity_timeout: session::DEFAULT_INACTIVITY_TIMEOUT,
            key_refresh_packets: 1 << 24,
            key_refresh_age: Duration::from_secs(3600),
            ack_backoff_ms: dispatcher::ACK_BACKOFF_MS,
        }
    }
}
