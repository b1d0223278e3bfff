//! Frequency identifiers. See spec §3 (data model: "Frequency ID"), §4.4
//! (tie-break on colliding announcements).
//!
//! Mirrors `device_id.rs`'s range convention (same 8-digit decimal window)
//! but the generation discipline differs: a frequency id is ephemeral and
//! drawn uniform-random at creation, not derived from a stable hardware
//! source.

use rand_core::{CryptoRng, RngCore};

use crate::device_id::{DEVICE_ID_MAX, DEVICE_ID_MIN};

/// §3: "valid only while the frequency exists... Generated uniform-random
/// at creation." Shares its 8-digit decimal range with the device id.
pub const FREQUENCY_ID_MIN: u32 = DEVICE_ID_MIN;
pub const FREQUENCY_ID_MAX: u32 = DEVICE_ID_MAX;
const FREQUENCY_ID_RANGE: u32 = FREQUENCY_ID_MAX - FREQUENCY_ID_MIN + 1;

/// Draws a fresh frequency id from `rng`. Rejection-free: takes `u32 %
/// range` the same way `device_id::derive_device_id` reduces a hash
/// digest, at the cost of the same small modulo bias (negligible at this
/// range relative to the RNG's own entropy).
pub fn generate_frequency_id<R: RngCore + CryptoRng>(rng: &mut R) -> u32 {
    FREQUENCY_ID_MIN + (rng.next_u32() % FREQUENCY_ID_RANGE)
}

/// §4.4 tie-break: "the one with the earlier creation-timestamp wins
/// announcement precedence; joiners will attach to the earlier one."
/// Returns `true` if the remote announcement should be preferred over the
/// caller's own locally-created frequency of the same id.
///
/// Equal timestamps are resolved in favor of the existing local frequency
/// so a device never abandons its own announcement in a true tie.
pub fn remote_wins(local_created_at: embassy_time::Instant, remote_created_at: embassy_time::Instant) -> bool {
    remote_created_at < local_created_at
}
