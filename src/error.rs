//! Per-component error taxonomy. See spec §7.
//!
//! Each component returns its own narrow error enum; `?` composes them the
//! way the teacher's `Interface` methods all return `Result<_, RadioError>`.
//! `CoreError` is only assembled at the dispatcher boundary, where a single
//! inbound event can originate from more than one component.

use crate::session::SessionState;

/// §4.1, §7. Framing/CRC errors. Always local; the dispatcher counts these
/// and drops the packet, they never reach the event stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum FramingError {
    ShortBuffer,
    BadMagic,
    BadVersion,
    LengthOverflow,
    CrcMismatch,
}

/// §4.2, §7. `AuthFailed` and `ReplayNonce` drop the packet and bump a
/// counter; `KeyExpired` triggers rekey; the rest are fatal for the session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum CryptoError {
    InvalidKey,
    NotAgreed,
    AuthFailed,
    ReplayNonce,
    KeyExpired,
    BufferSize,
}

/// §4.3. Ring buffer operations; both variants are recoverable (overrun
/// drops the incoming frame, underrun yields silence) and never surface
/// past the audio pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum AudioError {
    Full,
    Empty,
}

/// §4.4, §7. Surfaced on the session event stream; all tear down to IDLE.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum SessionError {
    Timeout,
    Rejected,
    WrongPassword,
    FrequencyFull,
    FrequencyClosed,
    PermissionDenied,
    LinkLoss,
    /// Attempted an operation illegal from the session's current state,
    /// e.g. a voice packet outside CONNECTED (§4.4).
    WrongState(SessionState),
}

/// §4.5, §7. Returned directly to the caller, never surfaced as an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum DialError {
    SlotUnconfigured,
    SlotLimitReached,
    InvalidSlot,
}

/// §4.6, §7. Retried per the ACK backoff policy; `LinkLoss` surfaces after
/// the final attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum TransportError {
    TxError,
    TxTimeout,
}

/// Union used only where a single call site can fail across components
/// (dispatcher inbound routing, session-worker teardown reporting).
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum CoreError {
    Framing(FramingError),
    Crypto(CryptoError),
    Audio(AudioError),
    Session(SessionError),
    Dial(DialError),
    Transport(TransportError),
}

impl From<FramingError> for CoreError {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}
impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}
impl From<AudioError> for CoreError {
    fn from(e: AudioError) -> Self {
        Self::Audio(e)
    }
}
impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}
impl From<DialError> for CoreError {
    fn from(e: DialError) -> Self {
        Self::Dial(e)
    }
}
impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
