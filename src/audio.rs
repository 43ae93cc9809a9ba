//! audio.rs
//!
//! This module owns sound output: one reference sample clip, a mixer of
//! pitch-shifted playback voices reading from that clip, and the CPAL stream
//! that pulls mixed audio to the sound card.
//!
//! ### How it works
//! - The `Mixer` sits behind an `Arc<Mutex<…>>` so that both the audio thread
//!   (rendering samples) and the playback thread (adding voices, moving their
//!   gains through fade envelopes) can share it safely.
//! - CPAL repeatedly calls our callback to fill audio buffers. In that
//!   callback we ask the mixer to `render()` into the buffer: each voice reads
//!   the clip at its own rate (that is the pitch shift) through linear
//!   interpolation, scaled by its current gain.
//! - Voice lifecycle lives elsewhere: the mixer only plays what it is told to
//!   and keeps a voice until it is explicitly removed.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};

/// The reference playback sample, folded to mono f32.
#[derive(Clone, Debug)]
pub struct Clip {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Clip {
    /// Load a WAV file and fold it down to mono.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader =
            hound::WavReader::open(path).with_context(|| format!("opening clip {:?}", path))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let raw: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .context("decoding float samples")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .context("decoding integer samples")?
            }
        };

        let samples = raw
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
        })
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Physical clip length in seconds, at normal playback rate.
    pub fn len_seconds(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Linearly interpolated sample at a fractional position; silence past the end.
    fn sample(&self, pos: f64) -> f32 {
        if pos < 0.0 {
            return 0.0;
        }
        let i = pos as usize;
        if i + 1 >= self.samples.len() {
            return self.samples.get(i).copied().unwrap_or(0.0);
        }
        let frac = (pos - i as f64) as f32;
        self.samples[i] * (1.0 - frac) + self.samples[i + 1] * frac
    }
}

/// Identifies one mixer voice, handed back on `add_voice`.
pub type VoiceId = u64;

struct MixVoice {
    id: VoiceId,
    /// Read position in clip samples
    pos: f64,
    /// Clip samples consumed per output frame
    step: f64,
    gain: f32,
}

/// Sums the live voices into output buffers.
pub struct Mixer {
    clip: Option<Arc<Clip>>,
    voices: Vec<MixVoice>,
    next_id: VoiceId,
    out_rate: u32,
}

pub type MixerHandle = Arc<Mutex<Mixer>>;

impl Mixer {
    pub fn new(out_rate: u32) -> Self {
        Self {
            clip: None,
            voices: Vec::new(),
            next_id: 0,
            out_rate,
        }
    }

    pub fn set_clip(&mut self, clip: Arc<Clip>) {
        self.clip = Some(clip);
    }

    pub fn clip(&self) -> Option<&Arc<Clip>> {
        self.clip.as_ref()
    }

    /// Start a voice reading the clip at `rate` times normal speed, gain 0.
    ///
    /// Returns `None` when no clip is loaded: there is nothing to play.
    pub fn add_voice(&mut self, rate: f64) -> Option<VoiceId> {
        let clip = self.clip.as_ref()?;
        let id = self.next_id;
        self.next_id += 1;
        self.voices.push(MixVoice {
            id,
            pos: 0.0,
            step: rate * f64::from(clip.sample_rate) / f64::from(self.out_rate),
            gain: 0.0,
        });
        Some(id)
    }

    pub fn set_gain(&mut self, id: VoiceId, gain: f32) {
        if let Some(v) = self.voices.iter_mut().find(|v| v.id == id) {
            v.gain = gain.clamp(0.0, 1.0);
        }
    }

    /// Stop a voice and release its slot.
    pub fn remove_voice(&mut self, id: VoiceId) {
        self.voices.retain(|v| v.id != id);
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Mix all voices into an interleaved output buffer.
    ///
    /// The clip is mono, so each mixed sample is written to every channel of
    /// its frame. Voices that have read past the clip end produce silence but
    /// stay registered until removed.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let Some(clip) = self.clip.clone() else {
            out.fill(0.0);
            return;
        };

        for frame in out.chunks_mut(channels) {
            let mut sum = 0.0f32;
            for voice in &mut self.voices {
                sum += clip.sample(voice.pos) * voice.gain;
                voice.pos += voice.step;
            }
            let sum = soft_clip(sum);
            frame.fill(sum);
        }
    }

    #[cfg(test)]
    pub(crate) fn voice_rates(&self) -> Vec<f64> {
        let clip_rate = self
            .clip
            .as_ref()
            .map(|c| f64::from(c.sample_rate))
            .unwrap_or(f64::from(self.out_rate));
        self.voices
            .iter()
            .map(|v| v.step * f64::from(self.out_rate) / clip_rate)
            .collect()
    }
}

/// Gentle tanh-shaped clipping above unity, so dense chords don't wrap.
fn soft_clip(sample: f32) -> f32 {
    if sample.abs() <= 1.0 {
        sample
    } else {
        sample.signum() * (1.0 + (sample.abs() - 1.0).tanh() * 0.5)
    }
}

/// The `Audio` struct bundles together everything needed for output:
/// - the shared mixer instance
/// - the CPAL audio stream driving the sound card
/// - the sample rate chosen by the audio device
pub struct Audio {
    pub mixer: MixerHandle,
    stream: Stream,
    pub sample_rate: u32,
}

impl Audio {
    /// Open the default audio device and wire its callback to a fresh mixer.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let dev = host
            .default_output_device()
            .context("no default output device")?;
        let cfg = dev.default_output_config().context("default_output_config")?;
        let sample_rate = cfg.sample_rate().0;
        let channels = cfg.channels() as usize;

        let mixer: MixerHandle = Arc::new(Mutex::new(Mixer::new(sample_rate)));

        // CPAL error handler for the stream
        let err_fn = |e| eprintln!("stream error: {e}");
        let fmt = cfg.sample_format();
        let stream_cfg = cfg.config();

        // Build an output stream. CPAL asks us to fill `out` each frame; we
        // forward that request to the mixer.
        let stream = match fmt {
            SampleFormat::I16 => dev.build_output_stream(
                &stream_cfg,
                {
                    let mixer = mixer.clone();
                    let mut scratch: Vec<f32> = Vec::new();
                    move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(out.len(), 0.0);
                        mixer.lock().unwrap().render(&mut scratch, channels);
                        for (dst, &src) in out.iter_mut().zip(&scratch) {
                            *dst = (src.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                        }
                    }
                },
                err_fn,
                None,
            )?,
            _ => dev.build_output_stream(
                &stream_cfg,
                {
                    let mixer = mixer.clone();
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        mixer.lock().unwrap().render(out, channels);
                    }
                },
                err_fn,
                None,
            )?,
        };

        Ok(Self {
            mixer,
            stream,
            sample_rate,
        })
    }

    /// Load the reference clip into the mixer.
    pub fn set_clip(&self, clip: Arc<Clip>) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.set_clip(clip);
        }
    }

    /// Start the audio stream (begins pushing audio to the system device).
    pub fn start(&self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }
}
