//! Session state machine. See spec §3 (data model), §4.4 (operations,
//! invariants, edge cases).
//!
//! Mirrors the shape of the teacher's `Config`/`Status` split: state lives
//! in a small `Copy` enum, statistics live alongside in a plain struct, and
//! transitions are expressed as methods on `Session` that return a
//! component error rather than panicking.

use embassy_time::{Duration, Instant};
use subtle::ConstantTimeEq;

use crate::audio::RingBuffer;
use crate::crypto::CryptoContext;
use crate::error::SessionError;

/// §3: a frequency session distinguishes the device that created (or was
/// server-designated to administer) the frequency from one that merely
/// joined it. Calls are always symmetric and don't use this field.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Role {
    Client,
    Admin,
}

/// §4.4: 30s without a CALL_ACCEPT/CALL_REJECT tears the call down.
pub const WAITING_TIMEOUT: Duration = Duration::from_secs(30);

/// §4.4: inactivity watchdog for a CONNECTED session with no voice and no
/// control traffic.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// §3, §4.4. The four-state call lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum SessionState {
    Idle,
    Waiting,
    Incoming,
    Connected,
}

/// Monotonic session statistics (SPEC_FULL.md ambient supplement), read by
/// the dial manager's `slot_info`/`snapshot_all`.
#[derive(Clone, Copy, Default, Debug, defmt::Format)]
pub struct SessionStats {
    pub calls_initiated: u32,
    pub calls_received: u32,
    pub calls_completed: u32,
    pub calls_rejected: u32,
    pub calls_timed_out: u32,
    pub voice_frames_sent: u32,
    pub voice_frames_received: u32,
}

/// One peer-to-peer or frequency call session (spec §3).
pub struct Session {
    state: SessionState,
    peer_id: Option<[u8; 8]>,
    frequency_id: Option<u32>,
    role: Role,
    member_count: u16,
    muted: bool,
    is_audio_active: bool,
    created_at: Instant,
    state_entered_at: Instant,
    last_activity_at: Instant,
    inactivity_timeout: Duration,
    jitter_depth: usize,
    password: Option<[u8; 16]>,
    stats: SessionStats,
    /// §3: "each session owns its own crypto context and a pair of ring
    /// buffers (tx/rx)." Built lazily-looking but eagerly allocated, same
    /// as the teacher's per-peripheral `Config` structs: no session exists
    /// without its crypto and audio state already in place.
    crypto: CryptoContext,
    tx_ring: RingBuffer,
    rx_ring: RingBuffer,
}

impl Session {
    pub fn new(now: Instant) -> Self {
        Self::with_jitter_depth(now, crate::audio::DEFAULT_JITTER_DEPTH)
    }

    pub fn with_jitter_depth(now: Instant, jitter_depth: usize) -> Self {
        Self {
            state: SessionState::Idle,
            peer_id: None,
            frequency_id: None,
            role: Role::Client,
            member_count: 0,
            muted: false,
            is_audio_active: false,
            created_at: now,
            state_entered_at: now,
            last_activity_at: now,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            jitter_depth,
            password: None,
            stats: SessionStats::default(),
            crypto: CryptoContext::new(),
            tx_ring: RingBuffer::new(jitter_depth),
            rx_ring: RingBuffer::new(jitter_depth),
        }
    }

    /// Builds a session honoring a `CoreConfig`'s jitter depth, inactivity
    /// timeout, and key-refresh policy (SPEC_FULL.md ambient config
    /// section). The one production call site is the dispatcher's
    /// CALL_REQUEST handler; `new`/`with_jitter_depth` remain for tests and
    /// callers that don't need a full config.
    pub fn with_config(now: Instant, config: &crate::CoreConfig) -> Self {
        let mut session = Self::with_jitter_depth(now, config.jitter_depth);
        session.inactivity_timeout = config.inactivity_timeout;
        session
            .crypto
            .set_refresh_policy(config.key_refresh_packets, config.key_refresh_age);
        session
    }

    pub fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    pub fn crypto_mut(&mut self) -> &mut CryptoContext {
        &mut self.crypto
    }

    pub fn tx_ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.tx_ring
    }

    pub fn rx_ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.rx_ring
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn peer_id(&self) -> Option<[u8; 8]> {
        self.peer_id
    }

    pub fn frequency_id(&self) -> Option<u32> {
        self.frequency_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn member_count(&self) -> u16 {
        self.member_count
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_audio_active(&self) -> bool {
        self.is_audio_active
    }

    pub fn set_audio_active(&mut self, active: bool) {
        self.is_audio_active = active;
    }

    /// §4.4: "the admin flag is set only if we originated the frequency or
    /// received a server-side designation." Callers drive both paths
    /// through this single setter rather than inferring it from how the
    /// session was created.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// §4.4: "a frequency session tracks member count updates from
    /// FREQ_MEMBER_LIST messages."
    pub fn set_member_count(&mut self, count: u16) {
        self.member_count = count;
    }

    fn enter(&mut self, state: SessionState, now: Instant) {
        self.state = state;
        self.state_entered_at = now;
        self.last_activity_at = now;
    }

    /// §4.4: IDLE -> WAITING. Initiator places the outbound CALL_REQUEST.
    pub fn initiate_call(&mut self, peer_id: [u8; 8], now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::WrongState(self.state));
        }
        self.peer_id = Some(peer_id);
        self.frequency_id = None;
        self.enter(SessionState::Waiting, now);
        self.stats.calls_initiated += 1;
        Ok(())
    }

    /// §4.4: IDLE -> INCOMING. A CALL_REQUEST arrived from a peer.
    pub fn receive_call(&mut self, peer_id: [u8; 8], now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::WrongState(self.state));
        }
        self.peer_id = Some(peer_id);
        self.frequency_id = None;
        self.enter(SessionState::Incoming, now);
        self.stats.calls_received += 1;
        Ok(())
    }

    /// §4.4: INCOMING -> CONNECTED, local accept.
    pub fn accept(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Incoming {
            return Err(SessionError::WrongState(self.state));
        }
        self.enter(SessionState::Connected, now);
        Ok(())
    }

    /// §4.4: WAITING -> CONNECTED, peer accepted our request.
    pub fn on_call_accepted(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Waiting {
            return Err(SessionError::WrongState(self.state));
        }
        self.enter(SessionState::Connected, now);
        Ok(())
    }

    /// §4.4: WAITING/INCOMING -> IDLE, either side rejected.
    pub fn reject(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.state {
            SessionState::Waiting | SessionState::Incoming => {
                self.stats.calls_rejected += 1;
                self.teardown(now);
                Ok(())
            }
            other => Err(SessionError::WrongState(other)),
        }
    }

    /// §4.4: any non-idle state -> IDLE, normal hangup or CALL_END.
    pub fn end_call(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state == SessionState::Idle {
            return Err(SessionError::WrongState(self.state));
        }
        if self.state == SessionState::Connected {
            self.stats.calls_completed += 1;
        }
        self.teardown(now);
        Ok(())
    }

    /// §5 cancellation: "clears its crypto material, releases its audio
    /// buffer." A session slot is reused in place (see
    /// `SessionDirectory::find_free`) rather than dropped, so teardown
    /// resets crypto and ring-buffer state here instead of relying on
    /// `Drop`.
    fn teardown(&mut self, now: Instant) {
        self.peer_id = None;
        self.frequency_id = None;
        self.role = Role::Client;
        self.member_count = 0;
        self.muted = false;
        self.is_audio_active = false;
        self.password = None;
        let (refresh_packets, refresh_age) =
            (self.crypto.refresh_packet_threshold(), self.crypto.refresh_key_age());
        self.crypto = CryptoContext::new();
        self.crypto.set_refresh_policy(refresh_packets, refresh_age);
        self.tx_ring = RingBuffer::new(self.jitter_depth);
        self.rx_ring = RingBuffer::new(self.jitter_depth);
        self.enter(SessionState::Idle, now);
    }

    /// §4.4: joins a shared frequency directly into CONNECTED, bypassing
    /// the WAITING/INCOMING handshake (no single peer to accept/reject).
    pub fn join_frequency(&mut self, frequency_id: u32, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::WrongState(self.state));
        }
        self.frequency_id = Some(frequency_id);
        self.peer_id = None;
        self.role = Role::Client;
        self.member_count = 1;
        self.enter(SessionState::Connected, now);
        Ok(())
    }

    /// §4.4: originates a new frequency locally; the creator is always its
    /// admin (distinct from a server-side admin designation, which a
    /// caller applies afterward via `set_role`). `password` is `None` for
    /// an open frequency.
    pub fn create_frequency(
        &mut self,
        frequency_id: u32,
        password: Option<[u8; 16]>,
        now: Instant,
    ) -> Result<(), SessionError> {
        self.join_frequency(frequency_id, now)?;
        self.role = Role::Admin;
        self.password = password;
        Ok(())
    }

    pub fn password(&self) -> Option<&[u8; 16]> {
        self.password.as_ref()
    }

    /// §4.4: "on FREQ_JOIN_REQUEST with a password-protected frequency, the
    /// admin verifies the supplied password (constant-time equality) and
    /// replies with ACCEPT or REJECT (ErrWrongPassword)." Callers on the
    /// admin side invoke this before sending the accept/reject; it does
    /// not itself change session state. An open frequency (no password set)
    /// always verifies.
    pub fn verify_frequency_password(&self, supplied: &[u8]) -> Result<(), SessionError> {
        if self.role != Role::Admin {
            return Err(SessionError::PermissionDenied);
        }
        match &self.password {
            None => Ok(()),
            Some(expected) => {
                if bool::from(expected.ct_eq(supplied)) {
                    Ok(())
                } else {
                    Err(SessionError::WrongPassword)
                }
            }
        }
    }

    /// §4.4: voice frames are only legal while CONNECTED.
    pub fn note_voice_activity(&mut self, now: Instant, sent: bool) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::WrongState(self.state));
        }
        self.last_activity_at = now;
        if sent {
            self.stats.voice_frames_sent += 1;
        } else {
            self.stats.voice_frames_received += 1;
        }
        Ok(())
    }

    pub fn note_control_activity(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    /// §4.4: called periodically by the session worker task; returns the
    /// error to surface on the event stream (if any) and tears the session
    /// down to IDLE as a side effect.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<SessionError> {
        match self.state {
            SessionState::Waiting if now - self.state_entered_at >= WAITING_TIMEOUT => {
                self.stats.calls_timed_out += 1;
                self.teardown(now);
                Some(SessionError::Timeout)
            }
            SessionState::Connected if now - self.last_activity_at >= self.inactivity_timeout => {
                self.teardown(now);
                Some(SessionError::LinkLoss)
            }
            _ => None,
        }
    }

    pub fn set_inactivity_timeout(&mut self, timeout: Duration) {
        self.inactivity_timeout = timeout;
    }
}

/// §4.6: "Call/frequency control messages targeted at the local device are
/// matched to an existing session by peer id or by target-id in the
/// payload; if none exists... a new INCOMING session is created." This is
/// the lookup table the dispatcher matches against, indexed in parallel
/// with `dial::DialManager`'s slot array (slot `i`'s session, if any,
/// lives at `directory[i]`) so a session's index doubles as its owning
/// slot without a back-pointer (§9: "Back-references... modeled as a weak
/// index, never an owning pointer").
pub struct SessionDirectory {
    slots: [Option<Session>; crate::dial::SLOT_COUNT],
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            slots: [const { None }; crate::dial::SLOT_COUNT],
        }
    }

    pub fn get(&self, index: usize) -> Option<&Session> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Session> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// §4.5: binds a freshly-connected slot's session, replacing whatever
    /// was there before (the dial manager has already torn down any prior
    /// occupant per its own `save`/`clear` invariant).
    pub fn bind(&mut self, index: usize, session: Session) {
        if index < self.slots.len() {
            self.slots[index] = Some(session);
        }
    }

    pub fn release(&mut self, index: usize) -> Option<Session> {
        self.slots.get_mut(index).and_then(|slot| slot.take())
    }

    /// §4.6: "matched to an existing session by peer id."
    pub fn find_by_peer(&mut self, peer_id: &[u8; 8]) -> Option<(usize, &mut Session)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| matches!(s, Some(sess) if sess.peer_id().as_ref() == Some(peer_id)))
            .map(|(i, s)| (i, s.as_mut().unwrap()))
    }

    /// §4.6: "matched to an existing session by... target-id" for
    /// frequency traffic, where the target is the frequency id carried in
    /// the payload rather than the packet's `src_id`.
    pub fn find_by_frequency(&mut self, frequency_id: u32) -> Option<(usize, &mut Session)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| matches!(s, Some(sess) if sess.frequency_id() == Some(frequency_id)))
            .map(|(i, s)| (i, s.as_mut().unwrap()))
    }

    /// Any session currently in `state`, regardless of which frequency or
    /// peer it's bound to. Used by voice routing to find "the" active
    /// frequency session when the wire doesn't carry a frequency id
    /// directly (see `dispatcher::Dispatcher::route_voice`).
    pub fn find_by_frequency_state(&mut self, state: SessionState) -> Option<(usize, &mut Session)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| matches!(s, Some(sess) if sess.frequency_id().is_some() && sess.state() == state))
            .map(|(i, s)| (i, s.as_mut().unwrap()))
    }

    /// First unoccupied-or-idle slot, for spawning a new INCOMING session
    /// in response to an unsolicited request. Returns `None` if all 15
    /// slots hold a non-idle session (dial-manager's `SlotLimitReached`
    /// governs the same ceiling for explicit user-initiated `connect`).
    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| match s {
            None => true,
            Some(sess) => sess.state() == SessionState::Idle,
        })
    }
}
