//! Packet framing codec. See spec §3 (wire format), §4.1 (build/parse), §6
//! (bit-exact wire contract).
//!
//! Pure and stateless: safe to call from multiple session workers
//! concurrently on disjoint buffers, same as the teacher's SPI command
//! builders operate on a caller-owned buffer with no shared state.

use crate::error::FramingError;

/// "WT", little-endian on the wire.
pub const MAGIC: u16 = 0x5754;
pub const VERSION: u8 = 1;

/// Header: magic(2) + version(1) + msg_type(1) + src_id(8) + payload_len(2)
/// + checksum(2).
pub const HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD: usize = 256 - HEADER_SIZE;
pub const MAX_PACKET_SIZE: usize = 256;

const HEADER_MAGIC: core::ops::Range<usize> = 0..2;
const HEADER_VERSION: usize = 2;
const HEADER_MSG_TYPE: usize = 3;
const HEADER_SRC_ID: core::ops::Range<usize> = 4..12;
const HEADER_PAYLOAD_LEN: core::ops::Range<usize> = 12..14;
const HEADER_CHECKSUM: core::ops::Range<usize> = 14..16;

/// Message kind taxonomy, grouped by nibble (spec §3).
pub mod msg_type {
    // Discovery: 0x01-0x04
    pub const DISCOVERY_REQUEST: u8 = 0x01;
    pub const DISCOVERY_RESPONSE: u8 = 0x02;

    // Call control: 0x10-0x15
    pub const CALL_REQUEST: u8 = 0x10;
    pub const CALL_ACCEPT: u8 = 0x11;
    pub const CALL_REJECT: u8 = 0x12;
    pub const CALL_END: u8 = 0x13;

    // Frequency control: 0x20-0x29
    pub const FREQ_CREATE: u8 = 0x20;
    pub const FREQ_JOIN_REQUEST: u8 = 0x21;
    pub const FREQ_JOIN_ACCEPT: u8 = 0x22;
    pub const FREQ_JOIN_REJECT: u8 = 0x23;
    pub const FREQ_LEAVE: u8 = 0x24;
    pub const FREQ_KICK: u8 = 0x25;
    pub const FREQ_CLOSE: u8 = 0x26;
    pub const FREQ_MEMBER_LIST: u8 = 0x27;

    // Voice: 0x30-0x34
    pub const VOICE_FRAME: u8 = 0x30;

    // Control/ack: 0x40-0x46
    pub const ACK: u8 = 0x40;
    pub const PING: u8 = 0x41;
    pub const PONG: u8 = 0x42;

    // Status: 0x50-0x52
    pub const STATUS_REPORT: u8 = 0x50;

    // Security: 0x60-0x62
    pub const KEY_EXCHANGE: u8 = 0x60;
}

/// Classifies a raw `msg_type` byte into its taxonomy group (spec §3).
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum MsgClass {
    Discovery,
    CallControl,
    FrequencyControl,
    Voice,
    ControlAck,
    Status,
    Security,
    Unknown,
}

pub fn classify(msg_type: u8) -> MsgClass {
    match msg_type {
        0x01..=0x04 => MsgClass::Discovery,
        0x10..=0x15 => MsgClass::CallControl,
        0x20..=0x29 => MsgClass::FrequencyControl,
        0x30..=0x34 => MsgClass::Voice,
        0x40..=0x46 => MsgClass::ControlAck,
        0x50..=0x52 => MsgClass::Status,
        0x60..=0x62 => MsgClass::Security,
        _ => MsgClass::Unknown,
    }
}

/// Voice frame body (spec §3): capture timestamp, sequence, codec id, frame
/// duration, and the raw audio bytes that follow. Default 20ms @ 8kHz
/// 16-bit mono frames are 320 bytes (see `audio::FRAME_SAMPLE_CAPACITY`).
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct VoiceFrameHeader {
    pub timestamp_ms: u32,
    pub sequence: u16,
    pub codec_id: u8,
    pub duration_ms: u8,
    pub length: u16,
}

pub const VOICE_FRAME_HEADER_SIZE: usize = 4 + 2 + 1 + 1 + 2;

impl VoiceFrameHeader {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, FramingError> {
        if out.len() < VOICE_FRAME_HEADER_SIZE {
            return Err(FramingError::ShortBuffer);
        }
        out[0..4].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        out[6] = self.codec_id;
        out[7] = self.duration_ms;
        out[8..10].copy_from_slice(&self.length.to_le_bytes());
        Ok(VOICE_FRAME_HEADER_SIZE)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < VOICE_FRAME_HEADER_SIZE {
            return Err(FramingError::ShortBuffer);
        }
        Ok(Self {
            timestamp_ms: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            sequence: u16::from_le_bytes([buf[4], buf[5]]),
            codec_id: buf[6],
            duration_ms: buf[7],
            length: u16::from_le_bytes([buf[8], buf[9]]),
        })
    }
}

/// §4.1: "CALL_REQUEST with src `12345678`, target `87654321`" — the
/// payload for every call-control message is just the 8 ASCII-digit
/// target id the packet's own `src_id` is being matched against.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct CallTargetPayload {
    pub target_id: [u8; 8],
}

impl CallTargetPayload {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, FramingError> {
        if out.len() < 8 {
            return Err(FramingError::ShortBuffer);
        }
        out[..8].copy_from_slice(&self.target_id);
        Ok(8)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < 8 {
            return Err(FramingError::ShortBuffer);
        }
        let mut target_id = [0u8; 8];
        target_id.copy_from_slice(&buf[..8]);
        Ok(Self { target_id })
    }
}

/// §3, §4.4: `FREQ_JOIN_REQUEST` payload — the 8-digit frequency id being
/// joined, plus an optional 16-byte password for protected frequencies.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct FreqJoinRequestPayload {
    pub frequency_id: [u8; 8],
    pub password: Option<[u8; 16]>,
}

impl FreqJoinRequestPayload {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, FramingError> {
        let needed = if self.password.is_some() { 24 } else { 8 };
        if out.len() < needed {
            return Err(FramingError::ShortBuffer);
        }
        out[..8].copy_from_slice(&self.frequency_id);
        if let Some(password) = self.password {
            out[8..24].copy_from_slice(&password);
        }
        Ok(needed)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < 8 {
            return Err(FramingError::ShortBuffer);
        }
        let mut frequency_id = [0u8; 8];
        frequency_id.copy_from_slice(&buf[..8]);
        let password = if buf.len() >= 24 {
            let mut p = [0u8; 16];
            p.copy_from_slice(&buf[8..24]);
            Some(p)
        } else {
            None
        };
        Ok(Self { frequency_id, password })
    }
}

/// `FREQ_CREATE` announcement payload: the new frequency id plus the
/// creator's local monotonic creation timestamp, carried so a peer that
/// independently created the same 8-digit id can apply the §4.4 tie-break
/// ("the one with the earlier creation-timestamp wins") without a
/// round-trip query.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct FreqAnnouncePayload {
    pub frequency_id: [u8; 8],
    pub created_at_ms: u32,
}

impl FreqAnnouncePayload {
    pub const LEN: usize = 12;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, FramingError> {
        if out.len() < Self::LEN {
            return Err(FramingError::ShortBuffer);
        }
        out[..8].copy_from_slice(&self.frequency_id);
        out[8..12].copy_from_slice(&self.created_at_ms.to_le_bytes());
        Ok(Self::LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < Self::LEN {
            return Err(FramingError::ShortBuffer);
        }
        let mut frequency_id = [0u8; 8];
        frequency_id.copy_from_slice(&buf[..8]);
        let created_at_ms = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self { frequency_id, created_at_ms })
    }
}

/// `FREQ_MEMBER_LIST` payload: frequency id plus the current member count
/// (spec §4.4: "a frequency session tracks member count updates"). The
/// full roster is a UI/out-of-scope concern (§1); the core only needs the
/// count.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct FreqMemberListPayload {
    pub frequency_id: [u8; 8],
    pub member_count: u16,
}

impl FreqMemberListPayload {
    pub const LEN: usize = 10;

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, FramingError> {
        if out.len() < Self::LEN {
            return Err(FramingError::ShortBuffer);
        }
        out[..8].copy_from_slice(&self.frequency_id);
        out[8..10].copy_from_slice(&self.member_count.to_le_bytes());
        Ok(Self::LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < Self::LEN {
            return Err(FramingError::ShortBuffer);
        }
        let mut frequency_id = [0u8; 8];
        frequency_id.copy_from_slice(&buf[..8]);
        let member_count = u16::from_le_bytes([buf[8], buf[9]]);
        Ok(Self { frequency_id, member_count })
    }
}

/// Parses an 8 ASCII-digit id (a device or frequency id as it travels on
/// the wire) into its decimal value.
pub fn parse_decimal_id(digits: &[u8; 8]) -> Option<u32> {
    let mut value: u32 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(value)
}

/// Parsed packet header, borrowed from the wire buffer that produced it.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct Header {
    pub msg_type: u8,
    pub src_id: [u8; 8],
    pub payload_len: u16,
}

/// Result of a successful `parse`: the header plus the payload's position
/// in the original buffer (a view, not a copy).
#[derive(Clone, Copy, Debug)]
pub struct Parsed<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

/// CRC-16/CCITT: polynomial 0x1021, initial 0xFFFF, no reflection, no final
/// XOR (spec §4.1). Table-driven, matching the teacher's preference for
/// precomputed constant tables over runtime bit-twiddling (`FREQ_CONST_6X`
/// and friends in `lib.rs`).
const fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = crc_table();

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        let idx = (((crc >> 8) ^ byte as u16) & 0xFF) as usize;
        crc = (crc << 8) ^ CRC_TABLE[idx];
    }
    crc
}

/// Build a frame into `out`, returning the number of bytes written.
/// Fails with `LengthOverflow` if the resulting packet would exceed
/// `MAX_PACKET_SIZE`. `out` must be at least `HEADER_SIZE + payload.len()`
/// long.
pub fn build(
    out: &mut [u8],
    msg_type: u8,
    src_id: &[u8; 8],
    payload: &[u8],
) -> Result<usize, FramingError> {
    let frame_len = HEADER_SIZE + payload.len();
    if payload.len() > MAX_PAYLOAD || frame_len > MAX_PACKET_SIZE {
        return Err(FramingError::LengthOverflow);
    }
    if out.len() < frame_len {
        return Err(FramingError::ShortBuffer);
    }

    out[HEADER_MAGIC].copy_from_slice(&MAGIC.to_le_bytes());
    out[HEADER_VERSION] = VERSION;
    out[HEADER_MSG_TYPE] = msg_type;
    out[HEADER_SRC_ID].copy_from_slice(src_id);
    out[HEADER_PAYLOAD_LEN].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    out[HEADER_CHECKSUM].copy_from_slice(&0u16.to_le_bytes());
    out[HEADER_SIZE..frame_len].copy_from_slice(payload);

    let checksum = crc16_ccitt(&out[..frame_len]);
    out[HEADER_CHECKSUM].copy_from_slice(&checksum.to_le_bytes());

    Ok(frame_len)
}

/// Parse and validate a frame. Rejects short buffers, bad magic/version,
/// a declared `payload_len` that overruns the buffer, and CRC mismatch
/// (spec §4.1).
pub fn parse(buf: &[u8]) -> Result<Parsed<'_>, FramingError> {
    if buf.len() < HEADER_SIZE {
        return Err(FramingError::ShortBuffer);
    }

    let magic = u16::from_le_bytes([buf[0], buf[1]]);
    if magic != MAGIC {
        return Err(FramingError::BadMagic);
    }

    if buf[HEADER_VERSION] != VERSION {
        return Err(FramingError::BadVersion);
    }

    let payload_len = u16::from_le_bytes([buf[HEADER_PAYLOAD_LEN][0], buf[HEADER_PAYLOAD_LEN][1]]);
    let payload_len_usize = payload_len as usize;
    if payload_len_usize > MAX_PAYLOAD || buf.len() < HEADER_SIZE + payload_len_usize {
        return Err(FramingError::LengthOverflow);
    }

    let received_checksum =
        u16::from_le_bytes([buf[HEADER_CHECKSUM][0], buf[HEADER_CHECKSUM][1]]);

    // Recompute CRC over header+payload with the checksum field zeroed.
    let frame_len = HEADER_SIZE + payload_len_usize;
    let mut scratch = [0u8; MAX_PACKET_SIZE];
    scratch[..frame_len].copy_from_slice(&buf[..frame_len]);
    scratch[HEADER_CHECKSUM].copy_from_slice(&0u16.to_le_bytes());
    let computed = crc16_ccitt(&scratch[..frame_len]);

    if computed != received_checksum {
        return Err(FramingError::CrcMismatch);
    }

    let mut src_id = [0u8; 8];
    src_id.copy_from_slice(&buf[HEADER_SRC_ID]);

    Ok(Parsed {
        header: Header {
            msg_type: buf[HEADER_MSG_TYPE],
            src_id,
            payload_len,
        },
        payload: &buf[HEADER_SIZE..frame_len],
    })
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn round_trip_call_request() {
        let src_id = *b"12345678";
        let target_id = *b"87654321";
        let mut buf = [0u8; MAX_PACKET_SIZE];

        let len = build(&mut buf, msg_type::CALL_REQUEST, &src_id, &target_id).unwrap();
        // header(16) + payload(8) = 24.
        assert_eq!(len, 24);
        assert_eq!(&buf[0..2], &[0x54, 0x57]);
        assert_eq!(buf[2], 1);
        assert_eq!(buf[3], 0x10);
        assert_eq!(&buf[12..14], &[0x08, 0x00]);

        let parsed = parse(&buf[..len]).unwrap();
        assert_eq!(parsed.header.msg_type, msg_type::CALL_REQUEST);
        assert_eq!(parsed.payload, &target_id);
    }

    #[test]
    fn crc_detects_single_byte_flip() {
        let src_id = *b"12345678";
        let payload = [1u8, 2, 3, 4];
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = build(&mut buf, msg_type::VOICE_FRAME, &src_id, &payload).unwrap();

        // Flip a payload byte (outside the checksum field).
        buf[HEADER_SIZE + 3] ^= 0xFF;

        assert_eq!(parse(&buf[..len]), Err(FramingError::CrcMismatch));
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 4];
        assert_eq!(parse(&buf), Err(FramingError::ShortBuffer));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0xAB;
        buf[1] = 0xCD;
        assert_eq!(parse(&buf), Err(FramingError::BadMagic));
    }

    #[test]
    fn rejects_bad_version() {
        let src_id = *b"12345678";
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = build(&mut buf, msg_type::PING, &src_id, &[]).unwrap();
        buf[HEADER_VERSION] = 9;
        // CRC was computed over version=1, so version-mismatch is detected
        // before CRC is even consulted.
        assert_eq!(parse(&buf[..len]), Err(FramingError::BadVersion));
    }

    #[test]
    fn rejects_payload_len_overrun() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        buf[HEADER_VERSION] = VERSION;
        buf[HEADER_PAYLOAD_LEN].copy_from_slice(&50u16.to_le_bytes());
        assert_eq!(parse(&buf), Err(FramingError::LengthOverflow));
    }

    #[test]
    fn build_rejects_oversized_payload() {
        let src_id = *b"12345678";
        let payload = std::vec![0u8; MAX_PAYLOAD + 1];
        let mut buf = [0u8; 512];
        assert_eq!(
            build(&mut buf, msg_type::VOICE_FRAME, &src_id, &payload),
            Err(FramingError::LengthOverflow)
        );
    }

    #[test]
    fn voice_frame_header_round_trip() {
        let hdr = VoiceFrameHeader {
            timestamp_ms: 123_456,
            sequence: 42,
            codec_id: 1,
            duration_ms: 20,
            length: 320,
        };
        let mut buf = [0u8; VOICE_FRAME_HEADER_SIZE];
        hdr.encode(&mut buf).unwrap();
        let decoded = VoiceFrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded.timestamp_ms, hdr.timestamp_ms);
        assert_eq!(decoded.sequence, hdr.sequence);
        assert_eq!(decoded.length, hdr.length);
    }

    #[test]
    fn freq_join_request_round_trips_with_and_without_password() {
        let mut buf = [0u8; 24];
        let req = FreqJoinRequestPayload {
            frequency_id: *b"12345678",
            password: Some(*b"0123456789abcdef"),
        };
        let n = req.encode(&mut buf).unwrap();
        assert_eq!(n, 24);
        let decoded = FreqJoinRequestPayload::decode(&buf[..n]).unwrap();
        assert_eq!(decoded.frequency_id, req.frequency_id);
        assert_eq!(decoded.password, req.password);

        let open = FreqJoinRequestPayload {
            frequency_id: *b"87654321",
            password: None,
        };
        let n = open.encode(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(FreqJoinRequestPayload::decode(&buf[..n]).unwrap().password, None);
    }

    #[test]
    fn parse_decimal_id_rejects_non_digits() {
        assert_eq!(parse_decimal_id(b"12345678"), Some(12_345_678));
        assert_eq!(parse_decimal_id(b"1234567x"), None);
    }

    #[test]
    fn classify_groups_match_spec_ranges() {
        assert_eq!(classify(msg_type::DISCOVERY_REQUEST), MsgClass::Discovery);
        assert_eq!(classify(msg_type::CALL_REQUEST), MsgClass::CallControl);
        assert_eq!(classify(msg_type::FREQ_JOIN_REQUEST), MsgClass::FrequencyControl);
        assert_eq!(classify(msg_type::VOICE_FRAME), MsgClass::Voice);
        assert_eq!(classify(msg_type::PING), MsgClass::ControlAck);
        assert_eq!(classify(msg_type::STATUS_REPORT), MsgClass::Status);
        assert_eq!(classify(msg_type::KEY_EXCHANGE), MsgClass::Security);
        assert_eq!(classify(0x0F), MsgClass::Unknown);
    }
}
