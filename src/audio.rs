//! Lock-free single-producer/single-consumer audio ring buffer and jitter
//! readiness predicate. See spec §3 (data model), §4.3 (operations and
//! concurrency discipline).
//!
//! One producer (capture ISR, or the dispatcher writing decrypted voice)
//! and one consumer (the playback task) touch their respective index; no
//! lock is required, matching §4.3's "acquire-on-read / release-on-write"
//! discipline. As with the teacher's SPI buffers (`Interface::read_buf` /
//! `write_buf`), capacities are fixed arrays sized at compile time.

use crate::error::AudioError;

/// N=32 fixed frame slots (spec §3).
pub const RING_CAPACITY: usize = 32;

/// §9 Open Question, resolved: the source sizes `AUDIO_BUFFER_SIZE` at 256
/// bytes while a 20ms @ 8kHz 16-bit mono frame is 320 bytes (160 samples ×
/// 2), which would silently truncate every frame. This crate takes the
/// "tighten the frame" side of that flag: the sample array is sized to
/// fit a full default frame exactly.
pub const FRAME_SAMPLE_CAPACITY: usize = 320;

/// Default jitter-buffer depth (spec §4.3), in frames.
pub const DEFAULT_JITTER_DEPTH: usize = 3;

/// One fixed-size PCM slot in the ring (spec §3).
#[derive(Clone, Copy)]
pub struct AudioFrame {
    pub timestamp_ms: u32,
    pub sequence: u16,
    pub len: u16,
    pub samples: [u8; FRAME_SAMPLE_CAPACITY],
    pub valid: bool,
}

impl Default for AudioFrame {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            sequence: 0,
            len: 0,
            samples: [0u8; FRAME_SAMPLE_CAPACITY],
            valid: false,
        }
    }
}

impl AudioFrame {
    pub fn as_slice(&self) -> &[u8] {
        &self.samples[..self.len as usize]
    }
}

/// Monotonic counters (spec §3: "Statistics... are monotonic counters").
#[derive(Clone, Copy, Default, Debug, defmt::Format)]
pub struct RingStats {
    pub overruns: u32,
    pub underruns: u32,
    pub dropped: u32,
    pub frames_missed: u32,
    pub max_fill: usize,
    pub last_sequence: Option<u16>,
    pub frames_written: u32,
    pub frames_read: u32,
}

/// Sequence gap mod 2^16 (spec §4.3). Wrapping subtraction folds the
/// wraparound case in with the normal one: `received - expected` taken mod
/// 2^16 is exactly the count of sequence numbers skipped between the last
/// accepted frame and this one.
fn seq_gap(last: u16, received: u16) -> u32 {
    let expected = last.wrapping_add(1);
    received.wrapping_sub(expected) as u32
}

/// SPSC ring buffer of `RING_CAPACITY` audio frames, plus jitter-buffer
/// readiness.
pub struct RingBuffer {
    frames: [AudioFrame; RING_CAPACITY],
    write: usize,
    read: usize,
    local_seq: u16,
    jitter_depth: usize,
    /// Hysteresis sticky bit (§9 Open Question, resolved): once armed at
    /// `count >= jitter_depth`, stays ready until the buffer runs
    /// completely dry, rather than flapping at the threshold.
    jitter_armed: bool,
    stats: RingStats,
}

impl RingBuffer {
    pub fn new(jitter_depth: usize) -> Self {
        let depth = jitter_depth.clamp(1, RING_CAPACITY / 2);
        Self {
            frames: [AudioFrame::default(); RING_CAPACITY],
            write: 0,
            read: 0,
            local_seq: 0,
            jitter_depth: depth,
            jitter_armed: false,
            stats: RingStats::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    pub fn is_full(&self) -> bool {
        (self.write + 1) % RING_CAPACITY == self.read
    }

    pub fn count(&self) -> usize {
        (self.write + RING_CAPACITY - self.read) % RING_CAPACITY
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }

    fn record_sequence(&mut self, received: u16) {
        if let Some(last) = self.stats.last_sequence {
            self.stats.frames_missed += seq_gap(last, received);
        }
        self.stats.last_sequence = Some(received);
    }

    fn push(&mut self, frame: AudioFrame) {
        let idx = self.write;
        self.frames[idx] = frame;
        self.write = (self.write + 1) % RING_CAPACITY;
        self.stats.frames_written += 1;
        let fill = self.count();
        if fill > self.stats.max_fill {
            self.stats.max_fill = fill;
        }
    }

    /// §4.3: stamps a locally-generated sequence number (wrapping), using
    /// the supplied timestamp or `0` if the caller has no clock handy —
    /// the audio HAL collaborator is expected to supply one in practice.
    pub fn write(&mut self, samples: &[u8], timestamp_ms: Option<u32>) -> Result<u16, AudioError> {
        if self.is_full() {
            self.stats.overruns += 1;
            return Err(AudioError::Full);
        }

        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        self.record_sequence(seq);

        let len = samples.len().min(FRAME_SAMPLE_CAPACITY);
        let mut frame = AudioFrame {
            timestamp_ms: timestamp_ms.unwrap_or(0),
            sequence: seq,
            len: len as u16,
            valid: true,
            ..AudioFrame::default()
        };
        frame.samples[..len].copy_from_slice(&samples[..len]);
        self.push(frame);

        Ok(seq)
    }

    /// §4.3: preserves the frame's own sequence (e.g. from a remote
    /// sender) and detects a sequence gap against the last-seen sequence,
    /// using the same discipline as `write` (§9 Open Question, resolved:
    /// both entry points agree).
    pub fn write_frame(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        if self.is_full() {
            self.stats.overruns += 1;
            return Err(AudioError::Full);
        }
        self.record_sequence(frame.sequence);
        self.push(frame);
        Ok(())
    }

    pub fn read(&mut self, out: &mut AudioFrame) -> Result<(), AudioError> {
        if self.is_empty() {
            self.stats.underruns += 1;
            return Err(AudioError::Empty);
        }
        let idx = self.read;
        *out = self.frames[idx];
        self.frames[idx].valid = false;
        self.read = (self.read + 1) % RING_CAPACITY;
        self.stats.frames_read += 1;
        Ok(())
    }

    pub fn peek(&self) -> Result<&AudioFrame, AudioError> {
        if self.is_empty() {
            Err(AudioError::Empty)
        } else {
            Ok(&self.frames[self.read])
        }
    }

    pub fn skip(&mut self) -> Result<(), AudioError> {
        if self.is_empty() {
            return Err(AudioError::Empty);
        }
        self.frames[self.read].valid = false;
        self.read = (self.read + 1) % RING_CAPACITY;
        Ok(())
    }

    /// §4.3: `count >= jitter_depth`, with the hysteresis variant flagged
    /// in §9: once armed, stays ready until the buffer empties, at which
    /// point the threshold is re-asserted on the next fill.
    pub fn jitter_ready(&mut self) -> bool {
        let count = self.count();
        if self.jitter_armed {
            if count == 0 {
                self.jitter_armed = false;
            }
        } else if count >= self.jitter_depth {
            self.jitter_armed = true;
        }
        self.jitter_armed
    }
}

/// §5: "Audio in (capture)" / "Audio out (playback)" tasks, highest
/// priority, 50Hz (20ms frame) cadence. A caller-owned executor drives
/// these one tick at a time (§1: scheduling is the firmware's concern,
/// not this crate's) — `capture_tick`/`playback_tick` do one frame's
/// worth of work and return, the same "do one unit, let the caller loop"
/// shape as `dispatcher::Dispatcher::handle_inbound`.
pub struct AudioPipeline<H: crate::audio_hal::AudioHal> {
    hal: H,
}

impl<H: crate::audio_hal::AudioHal> AudioPipeline<H> {
    pub fn new(hal: H) -> Self {
        Self { hal }
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Pulls one frame from the HAL and writes it into `ring` (the
    /// session's TX ring). `timestamp_ms` is the capture-side monotonic
    /// clock reading; §4.3 leaves the clock source to the caller.
    pub async fn capture_tick(
        &mut self,
        ring: &mut RingBuffer,
        timestamp_ms: u32,
    ) -> Result<u16, AudioError> {
        let mut buf = [0u8; FRAME_SAMPLE_CAPACITY];
        let n = self.hal.capture_frame(&mut buf).await?;
        ring.write(&buf[..n], Some(timestamp_ms))
    }

    /// Reads one frame from `ring` (the session's RX ring) and hands it to
    /// the HAL. On underrun, plays silence instead of propagating the
    /// error (§4.3: "underrun... yields silence" is recoverable, not
    /// fatal to the pipeline).
    pub async fn playback_tick(&mut self, ring: &mut RingBuffer) -> Result<(), AudioError> {
        let mut frame = AudioFrame::default();
        match ring.read(&mut frame) {
            Ok(()) => self.hal.play_frame(frame.as_slice()).await,
            Err(AudioError::Empty) => self.hal.play_frame(&[]).await,
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn empty_and_full_invariants() {
        let mut rb = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        assert!(rb.is_empty());
        assert_eq!(rb.count(), 0);

        for _ in 0..RING_CAPACITY - 1 {
            rb.write(&[0u8; 4], Some(0)).unwrap();
        }
        assert!(rb.is_full());
        assert_eq!(rb.write(&[0u8; 4], Some(0)), Err(AudioError::Full));
        assert_eq!(rb.count(), RING_CAPACITY - 1);
    }

    #[test]
    fn read_on_empty_is_recoverable_underrun() {
        let mut rb = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        let mut out = AudioFrame::default();
        assert_eq!(rb.read(&mut out), Err(AudioError::Empty));
        assert_eq!(rb.stats().underruns, 1);
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut rb = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        let payload = [1u8, 2, 3, 4];
        rb.write(&payload, Some(100)).unwrap();

        let mut out = AudioFrame::default();
        rb.read(&mut out).unwrap();
        assert_eq!(out.as_slice(), &payload);
        assert_eq!(out.timestamp_ms, 100);
        assert!(rb.is_empty());
    }

    /// Spec §8 scenario 3: jitter depth 3, write 2 -> not ready, write 1
    /// more -> ready, read 1 -> still ready (sticky until dry).
    #[test]
    fn jitter_readiness_scenario() {
        let mut rb = RingBuffer::new(3);
        rb.write(&[0u8; 2], Some(0)).unwrap();
        rb.write(&[0u8; 2], Some(0)).unwrap();
        assert!(!rb.jitter_ready());

        rb.write(&[0u8; 2], Some(0)).unwrap();
        assert!(rb.jitter_ready());

        let mut out = AudioFrame::default();
        rb.read(&mut out).unwrap();
        assert!(rb.jitter_ready());
    }

    #[test]
    fn jitter_depth_is_capped_at_half_capacity() {
        let rb = RingBuffer::new(1000);
        assert_eq!(rb.jitter_depth, RING_CAPACITY / 2);
    }

    #[test]
    fn write_frame_detects_sequence_gap() {
        let mut rb = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        let mut f = AudioFrame {
            sequence: 10,
            valid: true,
            ..AudioFrame::default()
        };
        rb.write_frame(f).unwrap();
        f.sequence = 13; // two frames (11, 12) were lost.
        rb.write_frame(f).unwrap();
        assert_eq!(rb.stats().frames_missed, 2);
    }

    #[test]
    fn sequence_gap_wraparound() {
        assert_eq!(seq_gap(u16::MAX, 0), 0);
        assert_eq!(seq_gap(u16::MAX - 1, 0), 1);
    }

    struct MockHal {
        captured: [u8; 4],
        played: std::vec::Vec<std::vec::Vec<u8>>,
    }

    impl crate::audio_hal::AudioHal for MockHal {
        async fn start_capture(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
        async fn stop_capture(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
        async fn start_playback(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
        async fn stop_playback(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
        async fn capture_frame(&mut self, out: &mut [u8]) -> Result<usize, AudioError> {
            out[..4].copy_from_slice(&self.captured);
            Ok(4)
        }
        async fn play_frame(&mut self, samples: &[u8]) -> Result<(), AudioError> {
            self.played.push(samples.to_vec());
            Ok(())
        }
        fn set_volume(&mut self, _percent: u8) {}
        fn set_input_gain(&mut self, _percent: u8) {}
        fn set_mute(&mut self, _muted: bool) {}
    }

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
    fn capture_tick_writes_a_frame_into_the_ring() {
        let mut pipeline = AudioPipeline::new(MockHal { captured: [1, 2, 3, 4], played: std::vec::Vec::new() });
        let mut ring = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        block_on(pipeline.capture_tick(&mut ring, 10)).unwrap();
        assert_eq!(ring.count(), 1);
    }

    #[test]
    fn playback_tick_plays_silence_on_underrun() {
        let mut pipeline = AudioPipeline::new(MockHal { captured: [0; 4], played: std::vec::Vec::new() });
        let mut ring = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        block_on(pipeline.playback_tick(&mut ring)).unwrap();
        assert_eq!(pipeline.hal.played, std::vec![std::vec::Vec::<u8>::new()]);
    }

    #[test]
    fn playback_tick_plays_a_queued_frame() {
        let mut pipeline = AudioPipeline::new(MockHal { captured: [0; 4], played: std::vec::Vec::new() });
        let mut ring = RingBuffer::new(DEFAULT_JITTER_DEPTH);
        ring.write(&[9, 9, 9], Some(0)).unwrap();
        block_on(pipeline.playback_tick(&mut ring)).unwrap();
        assert_eq!(pipeline.hal.played, std::vec![std::vec![9, 9, 9]]);
    }
}
