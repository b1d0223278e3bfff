//! Device identity: derivation from a hardware source, and HMAC auth
//! tokens. See spec §3 (data model), §4.7 (operations).
//!
//! Grounded the same way as `crypto.rs`: SHA-256 and HMAC from the
//! RustCrypto stack already pulled in for the AEAD and key-derivation
//! paths.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// §4.7: the device id is an 8-digit decimal number in this range.
pub const DEVICE_ID_MIN: u32 = 10_000_000;
pub const DEVICE_ID_MAX: u32 = 99_999_999;
const DEVICE_ID_RANGE: u32 = DEVICE_ID_MAX - DEVICE_ID_MIN + 1;

/// §4.7: sources the raw bytes a device id is derived from. Variants
/// cover the hardware unique-id sources a real board exposes; the
/// dispatcher/session layers never care which one produced the bytes.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum HardwareIdSource {
    Mcu96BitUid([u8; 12]),
    Efuse([u8; 16]),
    Provisioned([u8; 8]),
}

impl HardwareIdSource {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mcu96BitUid(b) => b,
            Self::Efuse(b) => b,
            Self::Provisioned(b) => b,
        }
    }
}

/// §4.7: SHA-256 the hardware-unique bytes, then reduce modulo the
/// 8-digit decimal range and offset into `[DEVICE_ID_MIN, DEVICE_ID_MAX]`.
pub fn derive_device_id(source: &HardwareIdSource) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(source.bytes());
    let digest = hasher.finalize();
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    DEVICE_ID_MIN + (raw % DEVICE_ID_RANGE)
}

/// §3: the persisted record pairing a derived id with the source it came
/// from, so a re-derivation can be checked for drift across firmware
/// upgrades.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct DeviceIdRecord {
    pub device_id: u32,
    pub source: HardwareIdSourceTag,
}

/// `defmt`/persistence-friendly tag, since `HardwareIdSource` carries
/// payload bytes we don't need to round-trip through storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum HardwareIdSourceTag {
    Mcu96BitUid,
    Efuse,
    Provisioned,
}

impl From<&HardwareIdSource> for HardwareIdSourceTag {
    fn from(source: &HardwareIdSource) -> Self {
        match source {
            HardwareIdSource::Mcu96BitUid(_) => Self::Mcu96BitUid,
            HardwareIdSource::Efuse(_) => Self::Efuse,
            HardwareIdSource::Provisioned(_) => Self::Provisioned,
        }
    }
}

impl DeviceIdRecord {
    pub fn new(source: &HardwareIdSource) -> Self {
        Self {
            device_id: derive_device_id(source),
            source: source.into(),
        }
    }
}

const SIG_HEX_LEN: usize = 16;
const MAX_TOKEN_LEN: usize = 8 + 1 + 20 + 1 + SIG_HEX_LEN;

/// §4.7: formats `ID.TIMESTAMP.SIG16HEX`, where SIG is the first 8 bytes
/// of HMAC-SHA256(auth_key, "ID.TIMESTAMP") rendered as lowercase hex.
/// Returns the number of bytes written into `out`.
pub fn generate_auth_token(
    device_id: u32,
    timestamp_s: u64,
    auth_key: &[u8],
    out: &mut heapless::String<MAX_TOKEN_LEN>,
) -> Result<(), CryptoError> {
    out.clear();
    write_decimal(out, device_id as u64);
    let _ = out.push('.');
    write_decimal(out, timestamp_s);

    let mut mac = HmacSha256::new_from_slice(auth_key).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(out.as_bytes());
    let tag = mac.finalize().into_bytes();

    let _ = out.push('.');
    for byte in &tag[..SIG_HEX_LEN / 2] {
        push_hex_byte(out, *byte);
    }
    Ok(())
}

/// §4.7: constant-time signature check plus caller-supplied max clock
/// skew, so a replayed token from outside the allowed window is rejected
/// even with a correct signature.
pub fn verify_auth_token(
    token: &str,
    auth_key: &[u8],
    now_s: u64,
    max_skew_s: u64,
) -> Result<u32, CryptoError> {
    let mut parts = token.split('.');
    let id_str = parts.next().ok_or(CryptoError::AuthFailed)?;
    let ts_str = parts.next().ok_or(CryptoError::AuthFailed)?;
    let sig_str = parts.next().ok_or(CryptoError::AuthFailed)?;
    if parts.next().is_some() {
        return Err(CryptoError::AuthFailed);
    }

    let device_id: u32 = id_str.parse().map_err(|_| CryptoError::AuthFailed)?;
    let timestamp_s: u64 = ts_str.parse().map_err(|_| CryptoError::AuthFailed)?;

    let skew = if now_s >= timestamp_s {
        now_s - timestamp_s
    } else {
        timestamp_s - now_s
    };
    if skew > max_skew_s {
        return Err(CryptoError::AuthFailed);
    }

    let mut expected: heapless::String<MAX_TOKEN_LEN> = heapless::String::new();
    generate_auth_token(device_id, timestamp_s, auth_key, &mut expected)?;
    let expected_sig = expected.rsplit('.').next().ok_or(CryptoError::AuthFailed)?;

    if !bool::from(sig_str.as_bytes().ct_eq(expected_sig.as_bytes())) {
        return Err(CryptoError::AuthFailed);
    }

    Ok(device_id)
}

fn write_decimal<const N: usize>(out: &mut heapless::String<N>, mut value: u64) {
    if value == 0 {
        let _ = out.push('0');
        return;
    }
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    while value > 0 {
        i -= 1;
        digits[i] = b'0' + (value % 10) as u8;
        value /= 10;
    }
    for &d in &digits[i..] {
        let _ = out.push(d as char);
    }
}

fn push_hex_byte<const N: usize>(out: &mut heapless::String<N>, byte: u8) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let _ = out.push(HEX[(byte >> 4) as usize] as char);
    let _ = out.push(HEX[(byte & 0x0F) as usize] as char);
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn device_id_is_in_range() {
        let id = derive_device_id(&HardwareIdSource::Mcu96BitUid([0x42; 12]));
        assert!(id >= DEVICE_ID_MIN && id <= DEVICE_ID_MAX);
    }

    #[test]
    fn device_id_is_deterministic() {
        let source = HardwareIdSource::Efuse([7; 16]);
        assert_eq!(derive_device_id(&source), derive_device_id(&source));
    }

    #[test]
    fn token_round_trip() {
        let key = b"auth-key-material";
        let mut token: heapless::String<MAX_TOKEN_LEN> = heapless::String::new();
        generate_auth_token(12_345_678, 1_000, key, &mut token).unwrap();
        let verified = verify_auth_token(&token, key, 1_010, 60).unwrap();
        assert_eq!(verified, 12_345_678);
    }

    #[test]
    fn token_rejected_outside_skew_window() {
        let key = b"auth-key-material";
        let mut token: heapless::String<MAX_TOKEN_LEN> = heapless::String::new();
        generate_auth_token(12_345_678, 1_000, key, &mut token).unwrap();
        assert_eq!(
            verify_auth_token(&token, key, 2_000, 60),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn token_rejected_with_wrong_key() {
        let mut token: heapless::String<MAX_TOKEN_LEN> = heapless::String::new();
        generate_auth_token(12_345_678, 1_000, b"key-a", &mut token).unwrap();
        assert_eq!(
            verify_auth_token(&token, b"key-b", 1_000, 60),
            Err(CryptoError::AuthFailed)
        );
    }
}
