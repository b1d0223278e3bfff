//! Inbound routing and reliable-send policy. See spec §3 (msg taxonomy),
//! §4.6 (ACK/retry operations), §5 (concurrency model).
//!
//! Owns the single `RadioTransport` handle the way the teacher's `Radio`
//! owns the single SPI bus: one dispatcher per physical radio, driven by
//! whatever task the firmware schedules it on.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::error::{CoreError, TransportError};
use crate::event::{CoreEvent, DiscoveryVisibility};
use crate::framing::{
    self, msg_type, CallTargetPayload, FreqJoinRequestPayload, FreqMemberListPayload, MsgClass,
    MAX_PACKET_SIZE,
};
use crate::session::{Role, Session, SessionDirectory, SessionState};
use crate::transport::RadioTransport;
use crate::CoreConfig;

/// §4.6: exponential backoff schedule for a message awaiting ACK, in
/// order of attempt. After the last entry elapses with no ACK, the send
/// fails with `TransportError::TxTimeout`. Also `CoreConfig::default`'s
/// `ack_backoff_ms`.
pub const ACK_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Counter-only visibility into packets dropped below the session/event
/// layer (spec §7: "routing failures below the session layer are
/// counter-only, never surfaced as events"). Read via `Dispatcher::stats`.
#[derive(Clone, Copy, Default, Debug, defmt::Format)]
pub struct ProtocolStats {
    /// Frame failed to parse: short buffer, bad magic, bad version, or a
    /// declared length that overruns the buffer.
    pub invalid_packets: u32,
    /// Frame parsed but its checksum didn't match.
    pub crc_mismatch: u32,
    /// Voice AEAD tag failed to authenticate.
    pub auth_failures: u32,
    /// Voice packet's nonce counter didn't exceed the replay watermark.
    pub replays: u32,
    /// Voice packet with no matching session, or a session not CONNECTED.
    pub voice_dropped: u32,
}

pub struct Dispatcher<T: RadioTransport> {
    transport: T,
    src_id: [u8; 8],
    config: CoreConfig,
    visibility: DiscoveryVisibility,
    /// Signaled by `handle_inbound` when an ACK for the currently
    /// outstanding reliable send arrives. A single in-flight reliable
    /// send at a time keeps this a plain `Signal` rather than a
    /// correlation table; §4.6 does not call for pipelined reliable
    /// sends.
    ack_signal: Signal<CriticalSectionRawMutex, ()>,
    stats: ProtocolStats,
}

impl<T: RadioTransport> Dispatcher<T> {
    pub fn new(transport: T, src_id: [u8; 8]) -> Self {
        Self::with_config(transport, src_id, CoreConfig::default())
    }

    pub fn with_config(transport: T, src_id: [u8; 8], config: CoreConfig) -> Self {
        Self {
            transport,
            src_id,
            config,
            visibility: DiscoveryVisibility::default(),
            ack_signal: Signal::new(),
            stats: ProtocolStats::default(),
        }
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    pub fn set_discovery_visibility(&mut self, visibility: DiscoveryVisibility) {
        self.visibility = visibility;
    }

    pub fn discovery_visibility(&self) -> DiscoveryVisibility {
        self.visibility
    }

    /// §4.1 + §6: frames and sends a packet with no retry; used for
    /// best-effort traffic (voice frames, PONG, unsolicited discovery
    /// responses) where the caller doesn't want backoff latency.
    pub async fn send_once(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), CoreError> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = framing::build(&mut buf, msg_type, &self.src_id, payload)?;
        self.transport.send(&buf[..len]).await?;
        Ok(())
    }

    /// §4.6: sends a packet and retries on the backoff schedule until an
    /// ACK is observed via `handle_inbound`, or the schedule is
    /// exhausted (`TransportError::TxTimeout`).
    pub async fn send_reliable(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), CoreError> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = framing::build(&mut buf, msg_type, &self.src_id, payload)?;

        self.ack_signal.reset();
        for &delay_ms in self.config.ack_backoff_ms.iter() {
            self.transport.send(&buf[..len]).await?;

            let wait = self.ack_signal.wait();
            let timeout = Timer::after(Duration::from_millis(delay_ms));
            match select(wait, timeout).await {
                Either::First(()) => return Ok(()),
                Either::Second(()) => continue,
            }
        }
        Err(CoreError::Transport(TransportError::TxTimeout))
    }

    /// §4.1, §4.6: parses and classifies one inbound frame, handling
    /// transport-level control traffic (ACK, PING, discovery) inline and
    /// routing call/frequency/voice traffic into `sessions` (spec: "routes
    /// by msg_type"). Returns `Ok(None)` for traffic fully handled here
    /// with nothing for the UI/application layer to react to.
    pub async fn handle_inbound(
        &mut self,
        buf: &[u8],
        sessions: &mut SessionDirectory,
        now: Instant,
    ) -> Result<Option<CoreEvent>, CoreError> {
        let parsed = match framing::parse(buf) {
            Ok(p) => p,
            Err(e) => {
                if e == crate::error::FramingError::CrcMismatch {
                    self.stats.crc_mismatch += 1;
                } else {
                    self.stats.invalid_packets += 1;
                }
                return Err(e.into());
            }
        };
        let header = parsed.header;

        match header.msg_type {
            msg_type::ACK => {
                self.ack_signal.signal(());
                Ok(None)
            }
            msg_type::PING => {
                self.send_once(msg_type::PONG, &[]).await?;
                Ok(None)
            }
            msg_type::PONG => Ok(None),
            msg_type::DISCOVERY_REQUEST => {
                if self.visibility == DiscoveryVisibility::Visible {
                    self.send_once(msg_type::DISCOVERY_RESPONSE, &self.src_id.clone())
                        .await?;
                }
                Ok(None)
            }
            msg_type::DISCOVERY_RESPONSE => Ok(Some(CoreEvent::DiscoveryResult {
                peer_id: header.src_id,
                link: crate::transport::LinkQuality { rssi_dbm: 0, snr_db: 0 },
            })),
            _ => match framing::classify(header.msg_type) {
                MsgClass::CallControl => Ok(self.route_call_control(header.msg_type, &header.src_id, parsed.payload, sessions, now)),
                MsgClass::FrequencyControl => {
                    Ok(self.route_frequency_control(header.msg_type, &header.src_id, parsed.payload, sessions, now))
                }
                MsgClass::Voice => Ok(self.route_voice(&header.src_id, parsed.payload, sessions, now)),
                _ => Ok(None),
            },
        }
    }

    /// §4.6: "matched to an existing session by peer id; if none exists
    /// and the message is a legitimate unsolicited request, a new INCOMING
    /// session is created."
    fn route_call_control(
        &self,
        msg_type: u8,
        src_id: &[u8; 8],
        payload: &[u8],
        sessions: &mut SessionDirectory,
        now: Instant,
    ) -> Option<CoreEvent> {
        match msg_type {
            msg_type::CALL_REQUEST => {
                let target = CallTargetPayload::decode(payload).ok()?;
                if target.target_id != self.src_id {
                    return None;
                }
                if sessions.find_by_peer(src_id).is_some() {
                    return None;
                }
                let slot = sessions.find_free()?;
                let mut session = Session::with_config(now, &self.config);
                session.receive_call(*src_id, now).ok()?;
                sessions.bind(slot, session);
                Some(CoreEvent::SessionStateChanged {
                    slot,
                    state: SessionState::Incoming,
                    peer_id: Some(*src_id),
                    frequency_id: None,
                })
            }
            msg_type::CALL_ACCEPT => {
                let (slot, session) = sessions.find_by_peer(src_id)?;
                session.on_call_accepted(now).ok()?;
                Some(CoreEvent::SessionStateChanged {
                    slot,
                    state: SessionState::Connected,
                    peer_id: Some(*src_id),
                    frequency_id: None,
                })
            }
            msg_type::CALL_REJECT => {
                let (slot, session) = sessions.find_by_peer(src_id)?;
                session.reject(now).ok()?;
                Some(CoreEvent::SessionError {
                    slot,
                    error: crate::error::SessionError::Rejected,
                })
            }
            msg_type::CALL_END => {
                let (slot, session) = sessions.find_by_peer(src_id)?;
                let stats = *session.stats();
                session.end_call(now).ok()?;
                Some(CoreEvent::SessionEnded { slot, stats })
            }
            _ => None,
        }
    }

    /// §4.4: frequency join/leave/kick/close and member-count updates.
    fn route_frequency_control(
        &self,
        msg_type: u8,
        src_id: &[u8; 8],
        payload: &[u8],
        sessions: &mut SessionDirectory,
        now: Instant,
    ) -> Option<CoreEvent> {
        match msg_type {
            msg_type::FREQ_CREATE => {
                let announce = crate::framing::FreqAnnouncePayload::decode(payload).ok()?;
                let frequency_id = framing::parse_decimal_id(&announce.frequency_id)?;
                let (slot, session) = sessions.find_by_frequency(frequency_id)?;
                if session.role() != Role::Admin {
                    return None;
                }
                let remote_created_at = Instant::from_millis(announce.created_at_ms as u64);
                if crate::frequency::remote_wins(session.created_at(), remote_created_at) {
                    let stats = *session.stats();
                    session.end_call(now).ok()?;
                    Some(CoreEvent::SessionEnded { slot, stats })
                } else {
                    None
                }
            }
            msg_type::FREQ_JOIN_REQUEST => {
                let req = FreqJoinRequestPayload::decode(payload).ok()?;
                let frequency_id = framing::parse_decimal_id(&req.frequency_id)?;
                let (slot, session) = sessions.find_by_frequency(frequency_id)?;
                if session.role() != Role::Admin {
                    return None;
                }
                // §4.4: a password-protected frequency is verified here and
                // rejected inline; an open frequency surfaces the request to
                // the admin for an explicit accept/reject decision.
                let supplied: &[u8] = req.password.as_ref().map_or(&[], |p| p.as_slice());
                if session.verify_frequency_password(supplied).is_err() {
                    return Some(CoreEvent::SessionError {
                        slot,
                        error: crate::error::SessionError::WrongPassword,
                    });
                }
                Some(CoreEvent::FrequencyJoinRequest {
                    slot,
                    frequency_id,
                    requester: *src_id,
                })
            }
            msg_type::FREQ_JOIN_ACCEPT => {
                let req = FreqJoinRequestPayload::decode(payload).ok()?;
                let frequency_id = framing::parse_decimal_id(&req.frequency_id)?;
                let (slot, session) = sessions.find_by_frequency(frequency_id)?;
                session.join_frequency(frequency_id, now).ok()?;
                Some(CoreEvent::SessionStateChanged {
                    slot,
                    state: SessionState::Connected,
                    peer_id: None,
                    frequency_id: Some(frequency_id),
                })
            }
            msg_type::FREQ_JOIN_REJECT => {
                let req = FreqJoinRequestPayload::decode(payload).ok()?;
                let frequency_id = framing::parse_decimal_id(&req.frequency_id)?;
                let (slot, _) = sessions.find_by_frequency(frequency_id)?;
                Some(CoreEvent::SessionError {
                    slot,
                    error: crate::error::SessionError::Rejected,
                })
            }
            msg_type::FREQ_LEAVE | msg_type::FREQ_KICK | msg_type::FREQ_CLOSE => {
                let req = FreqJoinRequestPayload::decode(payload).ok()?;
                let frequency_id = framing::parse_decimal_id(&req.frequency_id)?;
                let (slot, session) = sessions.find_by_frequency(frequency_id)?;
                let stats = *session.stats();
                session.end_call(now).ok()?;
                Some(CoreEvent::SessionEnded { slot, stats })
            }
            msg_type::FREQ_MEMBER_LIST => {
                let list = FreqMemberListPayload::decode(payload).ok()?;
                let frequency_id = framing::parse_decimal_id(&list.frequency_id)?;
                let (slot, session) = sessions.find_by_frequency(frequency_id)?;
                session.set_member_count(list.member_count);
                Some(CoreEvent::FrequencyMembersChanged {
                    slot,
                    frequency_id,
                    member_count: list.member_count,
                })
            }
            _ => None,
        }
    }

    /// §4.6: "Voice packets are routed to the session whose peer/frequency
    /// matches the source; dropped if no such session" — and §4.4: "Voice
    /// is accepted in CONNECTED only; in any other state voice packets are
    /// dropped with a counter." Decrypts the payload, decodes the voice
    /// frame header, and writes the audio into the matched session's rx
    /// ring. Every drop path (no session, wrong state, auth failure,
    /// replay, short decode) bumps `stats` and returns `None`, matching
    /// §7's propagation policy for routing failures below the session
    /// layer.
    fn route_voice(
        &mut self,
        src_id: &[u8; 8],
        payload: &[u8],
        sessions: &mut SessionDirectory,
        now: Instant,
    ) -> Option<CoreEvent> {
        let Some((_slot, session)) = sessions.find_by_peer(src_id).or_else(|| {
            // Frequency voice traffic carries the sender's device id, not
            // the frequency id, in `src_id`; fall back to the sole
            // CONNECTED frequency session, if any (§9: this crate does not
            // model simultaneous membership in more than one frequency per
            // device, consistent with one audio-active slot at a time).
            sessions.find_by_frequency_state(SessionState::Connected)
        }) else {
            self.stats.voice_dropped += 1;
            return None;
        };

        if session.note_voice_activity(now, false).is_err() {
            self.stats.voice_dropped += 1;
            return None;
        }

        let mut plaintext = [0u8; framing::MAX_PAYLOAD];
        let plaintext_len = match session.crypto_mut().decrypt(payload, src_id, &mut plaintext) {
            Ok(n) => n,
            Err(crate::error::CryptoError::ReplayNonce) => {
                self.stats.replays += 1;
                return None;
            }
            Err(_) => {
                self.stats.auth_failures += 1;
                return None;
            }
        };

        let Ok(header) = framing::VoiceFrameHeader::decode(&plaintext[..plaintext_len]) else {
            self.stats.invalid_packets += 1;
            return None;
        };
        let audio_start = framing::VOICE_FRAME_HEADER_SIZE;
        let audio_len = (header.length as usize).min(plaintext_len.saturating_sub(audio_start));

        let frame = crate::audio::AudioFrame {
            timestamp_ms: header.timestamp_ms,
            sequence: header.sequence,
            len: audio_len as u16,
            samples: {
                let mut samples = [0u8; crate::audio::FRAME_SAMPLE_CAPACITY];
                samples[..audio_len].copy_from_slice(&plaintext[audio_start..audio_start + audio_len]);
                samples
            },
            valid: true,
        };

        if session.rx_ring_mut().write_frame(frame).is_err() {
            self.stats.voice_dropped += 1;
        }

        None
    }

    /// §4.3/§4.6: drains one frame from `session`'s tx ring, frames it as a
    /// VOICE_FRAME, encrypts it, and sends it unacknowledged (voice is
    /// best-effort; §4.6 reserves ACK/backoff for call/frequency control).
    /// Returns `Ok(false)` if the tx ring had nothing queued.
    ///
    /// A full `audio::FRAME_SAMPLE_CAPACITY` (320-byte) frame plus the
    /// voice header and AEAD overhead does not fit under
    /// `framing::MAX_PAYLOAD`; the audio payload is truncated to whatever
    /// fits (`DESIGN.md`: wire size budget) rather than failing the send.
    pub async fn send_voice_frame(
        &mut self,
        session: &mut Session,
        now: Instant,
    ) -> Result<bool, CoreError> {
        const MAX_AUDIO_BYTES: usize =
            framing::MAX_PAYLOAD - crate::crypto::OVERHEAD - framing::VOICE_FRAME_HEADER_SIZE;

        let mut frame = crate::audio::AudioFrame::default();
        match session.tx_ring_mut().read(&mut frame) {
            Ok(()) => {}
            Err(crate::error::AudioError::Empty) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let audio_len = (frame.len as usize).min(MAX_AUDIO_BYTES);
        let mut plaintext = [0u8; framing::VOICE_FRAME_HEADER_SIZE + MAX_AUDIO_BYTES];
        let header = framing::VoiceFrameHeader {
            timestamp_ms: frame.timestamp_ms,
            sequence: frame.sequence,
            codec_id: 0,
            duration_ms: 20,
            length: audio_len as u16,
        };
        let hdr_len = header.encode(&mut plaintext)?;
        plaintext[hdr_len..hdr_len + audio_len].copy_from_slice(&frame.as_slice()[..audio_len]);
        let plaintext_len = hdr_len + audio_len;

        let mut ciphertext = [0u8; framing::MAX_PAYLOAD];
        let ct_len = session
            .crypto_mut()
            .encrypt(&plaintext[..plaintext_len], &self.src_id, &mut ciphertext)?;

        session.note_voice_activity(now, true)?;
        self.send_once(msg_type::VOICE_FRAME, &ciphertext[..ct_len]).await?;
        Ok(true)
    }

    /// §5: the dispatcher task realized as an inbound loop ("Protocol
    /// dispatcher... event-driven on RX") a caller-owned executor drives.
    /// Awaits the transport for the next frame, routes it, and forwards
    /// whatever `handle_inbound` surfaces onto `events`. Framing/crypto
    /// errors are counter-only (§7) and never stop the loop; a transport
    /// receive error is treated the same way, since the transport is an
    /// external collaborator whose own recovery policy is out of scope
    /// (§1).
    pub async fn run(
        &mut self,
        sessions: &mut SessionDirectory,
        events: &crate::event::EventChannel,
    ) -> ! {
        loop {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let Ok((len, _link)) = self.transport.receive(&mut buf).await else {
                continue;
            };
            if let Ok(Some(event)) = self
                .handle_inbound(&buf[..len], sessions, Instant::now())
                .await
            {
                events.send(event).await;
            }
        }
    }

    /// §4.1: acks any non-control message whose class requires one,
    /// matching the teacher's pattern of a tiny dedicated helper for a
    /// single, narrowly-scoped reply.
    pub async fn send_ack(&mut self) -> Result<(), CoreError> {
        self.send_once(msg_type::ACK, &[]).await
    }
}
