//! Per-slot session worker. See spec §5 (concurrency model: "Dial-slot
//! workers (≤15)"), §4.5 (`DialManager::connect` "spawns a worker bound to
//! slot i"), §5 cancellation ("the worker must observe the flag at each
//! suspension point... clear its crypto material, release its audio
//! buffer, then exit").
//!
//! One instance per occupied dial slot. A caller-owned executor spawns
//! `SessionWorker::run`, the same division of labor `dispatcher::Dispatcher`
//! and `audio::AudioPipeline` use: this crate never spawns its own tasks
//! (§1).

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::event::CoreEvent;
use crate::session::{Session, SessionState};

/// §5 cancellation: "sets a stop flag in the worker's control block; the
/// worker must observe the flag at each suspension point." Signaled by
/// `DialManager::disconnect`.
pub type StopSignal = Signal<CriticalSectionRawMutex, ()>;

/// §4.6: events the dispatcher routes to a specific slot's worker, rather
/// than the worker polling the transport directly — only the dispatcher
/// owns `RadioTransport::receive` (§5: "shared resources... serialized").
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum WorkerInbound {
    /// A control packet for this session was routed and already applied
    /// to it by the dispatcher; this is just an activity/liveness poke so
    /// the worker's inactivity watchdog sees it.
    ControlPacketRouted,
    AcceptRequested,
    RejectRequested,
    EndRequested,
}

const WORKER_INBOUND_DEPTH: usize = 4;
pub type WorkerInboundChannel =
    Channel<CriticalSectionRawMutex, WorkerInbound, WORKER_INBOUND_DEPTH>;

/// §5: the timer suspension-point family workers poll on — "timer expiry
/// (WAITING timeout, key-refresh check, inactivity watchdog)". Checking
/// every tick is simpler than computing the exact deadline and cheap at
/// this cadence (a handful of slots, not a hot loop).
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives one dial slot's session to completion: selects over the stop
/// signal, the slot's inbound-event channel, and a timeout poll tick —
/// exactly the three suspension-point families §5 names for dial-slot
/// workers.
pub struct SessionWorker<'a> {
    pub slot: usize,
    stop: &'a StopSignal,
    inbound: &'a WorkerInboundChannel,
}

impl<'a> SessionWorker<'a> {
    pub fn new(slot: usize, stop: &'a StopSignal, inbound: &'a WorkerInboundChannel) -> Self {
        Self { slot, stop, inbound }
    }

    /// Runs until `stop` is signaled (§5 cancellation) or the session
    /// tears itself down to IDLE (timeout, rejection, normal hangup).
    /// Returns the terminal event to surface, if any; non-terminal events
    /// (currently just a key-refresh request, §5) are forwarded onto
    /// `events` directly instead, since the worker keeps running after
    /// them.
    pub async fn run(
        &self,
        session: &mut Session,
        events: &crate::event::EventChannel,
    ) -> Option<CoreEvent> {
        loop {
            if session.state() == SessionState::Idle {
                return None;
            }

            let tick = Timer::after(TIMEOUT_POLL_INTERVAL);
            match select3(self.stop.wait(), self.inbound.receive(), tick).await {
                Either3::First(()) => {
                    // §5: "send an outbound disconnect message if still
                    // CONNECTED" is the dispatcher's job (it owns the send
                    // path); this worker's half is just tearing its own
                    // session state down to IDLE.
                    let _ = session.end_call(Instant::now());
                    return None;
                }
                Either3::Second(WorkerInbound::AcceptRequested) => {
                    let _ = session.accept(Instant::now());
                }
                Either3::Second(WorkerInbound::RejectRequested) => {
                    let _ = session.reject(Instant::now());
                }
                Either3::Second(WorkerInbound::EndRequested) => {
                    let _ = session.end_call(Instant::now());
                    return None;
                }
                Either3::Second(WorkerInbound::ControlPacketRouted) => {
                    session.note_control_activity(Instant::now());
                }
                Either3::Third(()) => {
                    if let Some(error) = session.poll_timeout(Instant::now()) {
                        return Some(CoreEvent::SessionError { slot: self.slot, error });
                    }
                    // §5 key lifecycle: "needs_refresh() is polled; when
                    // true, a new ECDH handshake is initiated in-band."
                    // `begin_rekey` guards against re-firing this every
                    // tick while the handshake the caller kicks off is
                    // still in flight.
                    if session.state() == SessionState::Connected
                        && session.crypto().needs_refresh()
                        && session.crypto_mut().begin_rekey().is_ok()
                    {
                        events
                            .send(CoreEvent::KeyRefreshNeeded { slot: self.slot })
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::error::SessionError;

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

    #[test]
    fn stop_signal_tears_down_a_connected_session() {
        let stop: StopSignal = Signal::new();
        let inbound: WorkerInboundChannel = Channel::new();
        let worker = SessionWorker::new(0, &stop, &inbound);

        let mut session = Session::new(Instant::from_millis(0));
        session.join_frequency(42, Instant::from_millis(0)).unwrap();
        stop.signal(());

        let events = crate::event::EventChannel::new();
        let event = block_on(worker.run(&mut session, &events));
        assert!(event.is_none());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn accept_requested_moves_incoming_to_connected_then_stops() {
        let stop: StopSignal = Signal::new();
        let inbound: WorkerInboundChannel = Channel::new();
        let worker = SessionWorker::new(1, &stop, &inbound);

        let mut session = Session::new(Instant::from_millis(0));
        session.receive_call(*b"PEERPEER", Instant::from_millis(0)).unwrap();

        block_on(inbound.send(WorkerInbound::AcceptRequested));
        block_on(inbound.send(WorkerInbound::EndRequested));

        let events = crate::event::EventChannel::new();
        let event = block_on(worker.run(&mut session, &events));
        assert!(event.is_none());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn reject_requested_returns_incoming_to_idle() {
        let stop: StopSignal = Signal::new();
        let inbound: WorkerInboundChannel = Channel::new();
        let worker = SessionWorker::new(2, &stop, &inbound);

        let mut session = Session::new(Instant::from_millis(0));
        session.receive_call(*b"PEERPEER", Instant::from_millis(0)).unwrap();
        block_on(inbound.send(WorkerInbound::RejectRequested));

        let events = crate::event::EventChannel::new();
        let event = block_on(worker.run(&mut session, &events));
        assert!(event.is_none());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn already_idle_session_returns_immediately() {
        let stop: StopSignal = Signal::new();
        let inbound: WorkerInboundChannel = Channel::new();
        let worker = SessionWorker::new(3, &stop, &inbound);
        let mut session = Session::new(Instant::from_millis(0));

        let events = crate::event::EventChannel::new();
        let event = block_on(worker.run(&mut session, &events));
        assert!(event.is_none());
    }

    #[test]
    #[ignore = "exercises the real timeout poll tick; slow under a host executor with no real timer driver"]
    fn waiting_timeout_surfaces_as_a_session_error() {
        let stop: StopSignal = Signal::new();
        let inbound: WorkerInboundChannel = Channel::new();
        let worker = SessionWorker::new(4, &stop, &inbound);

        let mut session = Session::new(Instant::from_millis(0));
        session.initiate_call(*b"PEERPEER", Instant::from_millis(0)).unwrap();

        let events = crate::event::EventChannel::new();
        let event = block_on(worker.run(&mut session, &events));
        match event {
            Some(CoreEvent::SessionError { slot: 4, error: SessionError::Timeout }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
