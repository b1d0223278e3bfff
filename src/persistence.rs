//! Persisted-state contract. See spec §6 ("Persisted state": device-ID
//! record, dial-slot metadata), §4.5 ("saved slot metadata... is
//! serialized to nonvolatile storage; runtime state is never persisted").
//!
//! An external-collaborator trait, the same shape as
//! `transport::RadioTransport` and `audio_hal::AudioHal`: this crate
//! states the shape of what must survive a power cycle, never the
//! storage medium (SD/flash) itself (§1).

use crate::device_id::DeviceIdRecord;
use crate::dial::{ConnectionKind, SLOT_COUNT};

/// §6: "saved slot metadata (kind, code, name, password)" — the subset of
/// a `DialSlot` that outlives a power cycle. `SlotState`, `worker_active`,
/// and `last_error` are runtime-only (§4.5) and have no home here.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct DialSlotMeta {
    pub connection: ConnectionKind,
    pub label: [u8; 16],
    pub label_len: u8,
}

/// §6: "All stored under a single namespace; atomic update discipline is
/// the storage provider's responsibility." A real firmware implements
/// this over SD/flash; this crate only states the shape the dial manager
/// and device-id module need on either side of boot.
pub trait PersistenceStore {
    fn load_device_id(&mut self) -> Option<DeviceIdRecord>;
    fn save_device_id(&mut self, record: &DeviceIdRecord);

    /// §4.7: "On subsequent boots the persisted value is used verbatim
    /// (never recomputed)" — `load_device_id` returning `Some` is what
    /// lets a caller skip `derive_device_id` entirely.
    fn load_slots(&mut self) -> [Option<DialSlotMeta>; SLOT_COUNT];
    fn save_slot(&mut self, index: usize, meta: Option<&DialSlotMeta>);
}
