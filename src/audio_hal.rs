//! The audio-codec seam. See spec §6 (external collaborators), §4.3/§5
//! (capture/playback tasks realized on top of it, in `audio::AudioPipeline`).
//!
//! Same shape as `transport::RadioTransport`: this crate owns the ring
//! buffer and jitter policy, never a codec driver. §6 describes the HAL as
//! writing frames directly into a caller-supplied ring buffer; this crate
//! instead has `AudioPipeline` pull/push one frame per tick through
//! `capture_frame`/`play_frame`, the same async-call-instead-of-raw-pointer
//! seam `transport::RadioTransport` uses for RX (documented in `DESIGN.md`).
pub trait AudioHal {
    async fn start_capture(&mut self) -> Result<(), crate::error::AudioError>;
    async fn stop_capture(&mut self) -> Result<(), crate::error::AudioError>;
    async fn start_playback(&mut self) -> Result<(), crate::error::AudioError>;
    async fn stop_playback(&mut self) -> Result<(), crate::error::AudioError>;

    /// Pulls the next captured frame's raw bytes into `out`, returning the
    /// number of bytes written. Suspends until a frame is ready (spec §5
    /// suspension point, capture side).
    async fn capture_frame(&mut self, out: &mut [u8]) -> Result<usize, crate::error::AudioError>;

    /// Hands one frame of PCM to the DAC/codec for playback. An empty
    /// slice plays silence (§4.3: "underrun yields silence").
    async fn play_frame(&mut self, samples: &[u8]) -> Result<(), crate::error::AudioError>;

    /// 0-100 scale; implementations map this onto their own gain range.
    fn set_volume(&mut self, percent: u8);
    fn set_input_gain(&mut self, percent: u8);
    fn set_mute(&mut self, muted: bool);
}
