//! The radio-transport seam. See spec §6 (external collaborators).
//!
//! Plays the same role the teacher's `spi_interface::InterfaceVariant`
//! trait plays for the SPI bus: the core never talks to a physical radio
//! peripheral directly, only through this trait, so it stays testable
//! off hardware.

use crate::error::TransportError;

/// §6: signal-quality readout a transport implementation exposes
/// alongside a received frame, for status reporting (msg_type STATUS_REPORT).
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct LinkQuality {
    pub rssi_dbm: i16,
    pub snr_db: i8,
}

/// §6: the boundary between this crate's protocol/session logic and
/// whatever radio peripheral actually moves bytes over the air. A real
/// firmware implements this over an SX126x/SX128x-class driver; tests
/// implement it over an in-memory queue.
pub trait RadioTransport {
    /// Sends one already-framed packet. Implementations should not
    /// retry; the dispatcher's ACK/backoff policy owns retry logic.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receives the next framed packet into `out`, returning the number
    /// of bytes written plus its link quality. Suspends the caller until
    /// a packet arrives (spec §5 suspension point).
    async fn receive(&mut self, out: &mut [u8]) -> Result<(usize, LinkQuality), TransportError>;

    /// Non-blocking channel-busy check, used before an unsolicited
    /// transmission (e.g. DISCOVERY_REQUEST) to avoid colliding with
    /// an in-progress exchange.
    fn channel_is_free(&self) -> bool;
}
