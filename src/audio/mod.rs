// src/audio/mod.rs - AudioOutput trait + cpal backend
use crate::error::Result;

/// Which pair of voices the synth sounder uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioType {
    /// Impact voices: click on mark, clack on space.
    Sounder,
    /// Oscillator voices: tone-on for mark, tone-off for space.
    Tone,
}

/// Platform-agnostic synth sounder interface.
///
/// Callers are responsible for edge-triggering: play_mark at the start of a
/// mark only when not already marked, play_space likewise, so back-to-back
/// marks do not stutter.
pub trait AudioOutput: Send {
    /// Start of a mark: click (sounder voice) or tone-on.
    fn play_mark(&mut self) -> Result<()>;
    /// Start of a space: clack (sounder voice) or silence.
    fn play_space(&mut self) -> Result<()>;
    fn set_volume(&mut self, vol: f32);
}

// ── cpal backend ─────────────────────────────────────────────────────────────
#[cfg(feature = "audio-cpal")]
mod cpal_backend;
#[cfg(feature = "audio-cpal")]
pub use cpal_backend::CpalAudio;

/// Null backend (no sound; used when audio is disabled or init fails).
pub struct NullAudio;
impl AudioOutput for NullAudio {
    fn play_mark(&mut self) -> Result<()> {
        Ok(())
    }
    fn play_space(&mut self) -> Result<()> {
        Ok(())
    }
    fn set_volume(&mut self, _vol: f32) {}
}

/// Factory: returns the best available backend.
pub fn create_audio(audio_type: AudioType, tone_hz: f32, volume: f32) -> Box<dyn AudioOutput> {
    #[cfg(feature = "audio-cpal")]
    {
        match CpalAudio::new(audio_type, tone_hz, volume) {
            Ok(a) => return Box::new(a),
            Err(e) => log::warn!("cpal init failed: {e}  ->  synth sounder disabled"),
        }
    }
    #[cfg(not(feature = "audio-cpal"))]
    let _ = (audio_type, tone_hz, volume);
    Box::new(NullAudio)
}
