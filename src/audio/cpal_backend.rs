// src/audio/cpal_backend.rs - cpal synth sounder (click/clack + tone voices)
use super::{AudioOutput, AudioType};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use std::sync::{Arc, Mutex};

/// Samples of a decaying impact transient at 48 kHz (about 60 ms).
const TRANSIENT_LEN: u32 = 2880;

#[derive(Clone, Copy, PartialEq)]
enum Transient {
    None,
    /// Armature striking the upper stop (start of mark).
    Click,
    /// Armature falling back (start of space).
    Clack,
}

struct SharedState {
    audio_type: AudioType,
    tone_on: bool,
    transient: Transient,
    transient_pos: u32,
    frequency: f32,
    volume: f32,
    phase: f32,
    sample_rate: f32,
}

pub struct CpalAudio {
    state: Arc<Mutex<SharedState>>,
    _stream: Stream,
}

// Stream is !Send on some platforms; wrap it
unsafe impl Send for CpalAudio {}

impl CpalAudio {
    pub fn new(audio_type: AudioType, tone_hz: f32, volume: f32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let sr = config.sample_rate().0 as f32;

        let state = Arc::new(Mutex::new(SharedState {
            audio_type,
            tone_on: false,
            transient: Transient::None,
            transient_pos: 0,
            frequency: tone_hz,
            volume,
            phase: 0.0,
            sample_rate: sr,
        }));

        let st = Arc::clone(&state);
        let stream = match config.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), st)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), st)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), st)?,
            _ => return Err(Error::Audio("unsupported sample format".into())),
        };
        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        Ok(Self {
            state,
            _stream: stream,
        })
    }
}

fn build_stream<S>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    state: Arc<Mutex<SharedState>>,
) -> Result<Stream>
where
    S: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let ch = config.channels as usize;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [S], _: &cpal::OutputCallbackInfo| {
                let mut s = state.lock().unwrap();
                let step = s.frequency / s.sample_rate;
                for frame in data.chunks_mut(ch) {
                    let sample = next_sample(&mut s, step);
                    let out = S::from_sample(sample);
                    for smp in frame.iter_mut() {
                        *smp = out;
                    }
                }
            },
            |e| log::error!("audio error: {e}"),
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

fn next_sample(s: &mut SharedState, step: f32) -> f32 {
    let mut v = 0.0f32;
    if s.tone_on {
        v += (s.phase * 2.0 * std::f32::consts::PI).sin() * s.volume;
        s.phase = (s.phase + step) % 1.0;
    } else {
        s.phase = 0.0;
    }
    if s.transient != Transient::None {
        // Impact voice: a short damped two-partial burst. The click is
        // brighter than the clack, like a real sounder's up/down strokes.
        let t = s.transient_pos as f32 / s.sample_rate;
        let (f1, f2) = match s.transient {
            Transient::Click => (2640.0, 1180.0),
            _ => (1860.0, 740.0),
        };
        let env = (-t * 90.0).exp();
        let burst = (t * f1 * 2.0 * std::f32::consts::PI).sin() * 0.6
            + (t * f2 * 2.0 * std::f32::consts::PI).sin() * 0.4;
        v += burst * env * s.volume;
        s.transient_pos += 1;
        if s.transient_pos >= TRANSIENT_LEN {
            s.transient = Transient::None;
            s.transient_pos = 0;
        }
    }
    v
}

impl AudioOutput for CpalAudio {
    fn play_mark(&mut self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        match s.audio_type {
            AudioType::Sounder => {
                s.transient = Transient::Click;
                s.transient_pos = 0;
            }
            AudioType::Tone => s.tone_on = true,
        }
        Ok(())
    }

    fn play_space(&mut self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        match s.audio_type {
            AudioType::Sounder => {
                s.transient = Transient::Clack;
                s.transient_pos = 0;
            }
            AudioType::Tone => s.tone_on = false,
        }
        Ok(())
    }

    fn set_volume(&mut self, vol: f32) {
        self.state.lock().unwrap().volume = vol;
    }
}
