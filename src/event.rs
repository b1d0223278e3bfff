//! Typed event/intent surface between the core and a UI/application task.
//! See spec §5 (concurrency model), SPEC_FULL.md ambient supplement.
//!
//! `embassy_sync::channel::Channel` plays the role the teacher's
//! `Status`/interrupt-flag readouts play: a narrow, polled or awaited
//! surface rather than a free-for-all shared struct.

use crate::dial::SlotInfo;
use crate::error::{CryptoError, DialError, SessionError};
use crate::session::{SessionState, SessionStats};
use crate::transport::LinkQuality;

/// Depth of the core -> UI event channel (SPEC_FULL.md ambient
/// supplement); sized generously against a burst of call-control
/// traffic, not voice (voice never goes through this channel).
pub const EVENT_CHANNEL_DEPTH: usize = 16;
pub const INTENT_CHANNEL_DEPTH: usize = 8;

/// Outbound notifications the core pushes as state changes (spec §5).
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum CoreEvent {
    SessionStateChanged {
        slot: usize,
        state: SessionState,
        peer_id: Option<[u8; 8]>,
        frequency_id: Option<u32>,
    },
    SessionEnded {
        slot: usize,
        stats: SessionStats,
    },
    SessionError {
        slot: usize,
        error: SessionError,
    },
    CryptoError(CryptoError),
    DiscoveryResult {
        peer_id: [u8; 8],
        link: LinkQuality,
    },
    DialSlotChanged(SlotInfo),
    /// §5: "`needs_refresh()` is polled; when true, a new ECDH handshake is
    /// initiated in-band." The worker has already called `begin_rekey()`
    /// by the time this fires; driving the actual handshake (generating a
    /// fresh keypair, exchanging `KEY_EXCHANGE` packets) is the
    /// session-owning caller's job, the same split `FrequencyJoinRequest`
    /// uses for admin decisions this crate surfaces but doesn't make.
    KeyRefreshNeeded {
        slot: usize,
    },
    KeyRotated {
        key_id: u32,
    },
    /// §4.4: "for approval-protected frequencies, the admin enqueues the
    /// request and surfaces an event; ACCEPT/REJECT is sent when the admin
    /// decides." One request at a time per slot is all a 15-slot dial
    /// wheel needs; a second request for the same slot before the first is
    /// resolved simply replaces it in the event stream (last-writer-wins),
    /// matching the "enqueue" language loosely rather than a bounded FIFO.
    FrequencyJoinRequest {
        slot: usize,
        frequency_id: u32,
        requester: [u8; 8],
    },
    FrequencyMembersChanged {
        slot: usize,
        frequency_id: u32,
        member_count: u16,
    },
}

/// Inbound requests a UI/application task sends into the core (spec §5,
/// SPEC_FULL.md ambient supplement).
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum UiIntent {
    DialRotate(i32),
    DialSetPosition(usize),
    DialConnect(usize),
    DialDisconnect(usize),
    AcceptIncomingCall,
    RejectIncomingCall,
    EndCall,
    StartDiscovery,
    SetDiscoveryVisible(bool),
    SetVolume(u8),
    SetMute(bool),
    ApproveFrequencyJoin { slot: usize, requester: [u8; 8] },
    RejectFrequencyJoin { slot: usize, requester: [u8; 8] },
}

pub type EventChannel = embassy_sync::channel::Channel<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    CoreEvent,
    EVENT_CHANNEL_DEPTH,
>;

pub type IntentChannel = embassy_sync::channel::Channel<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    UiIntent,
    INTENT_CHANNEL_DEPTH,
>;

/// §5 Open Question, resolved: whether a device advertises itself in
/// discovery responses is a toggle the core exposes via `UiIntent`
/// rather than an always-on behavior (SPEC_FULL.md ambient supplement,
/// see `dispatcher::Dispatcher::set_discovery_visibility`).
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum DiscoveryVisibility {
    Visible,
    Hidden,
}

impl Default for DiscoveryVisibility {
    fn default() -> Self {
        Self::Visible
    }
}
