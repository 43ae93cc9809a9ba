//! voice.rs
//!
//! Voice lifecycle for triggered notes. Each voice is one independent playback
//! of the reference clip, transposed by resampling and shaped by a fade
//! envelope:
//!
//!   fade in (0 -> 1) -> hold for the playable duration -> fade out (-> 0)
//!
//! Envelopes advance cooperatively: the playback thread calls `tick(dt)` and
//! each call moves every live voice one step, pushing the resulting gain into
//! the mixer. The audio callback never touches envelope state.

use crate::audio::{Clip, MixerHandle, VoiceId};

/// Fade-in and fade-out window, seconds.
pub const DEFAULT_FADE: f64 = 0.05;
/// Voice pool bound; the oldest voice is stolen when the pool is full.
pub const DEFAULT_MAX_VOICES: usize = 64;
/// The reference clip is assumed tuned to this note (middle C).
pub const REFERENCE_PITCH: u8 = 60;

/// Equal-tempered playback-rate multiplier for a pitch, relative to the
/// reference sample: one semitone is a factor of 2^(1/12).
pub fn pitch_ratio(pitch: u8) -> f64 {
    2f64.powf((f64::from(pitch) - f64::from(REFERENCE_PITCH)) / 12.0)
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("no reference clip loaded")]
    NoClip,
}

/// Configuration shared by all voices.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Fade-in/out window in seconds
    pub fade: f64,
    /// Concurrent voice bound
    pub max_voices: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            fade: DEFAULT_FADE,
            max_voices: DEFAULT_MAX_VOICES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    FadeIn,
    Hold,
    FadeOut,
    Done,
}

/// Control state for one live playback voice.
struct Voice {
    id: VoiceId,
    pitch: u8,
    volume: f64,
    phase: Phase,
    /// Hold time left once the fade-in completes
    hold_remaining: f64,
    /// Volume captured when the fade-out began; the ramp down is linear from
    /// this value, reaching zero in exactly one fade window
    fade_from: f64,
}

/// Owns every live voice and walks their envelopes.
pub struct VoiceManager {
    mixer: MixerHandle,
    config: VoiceConfig,
    voices: Vec<Voice>,
}

impl VoiceManager {
    pub fn new(mixer: MixerHandle, config: VoiceConfig) -> Self {
        Self {
            mixer,
            config,
            voices: Vec::new(),
        }
    }

    /// Start an independent, self-terminating voice for a note.
    ///
    /// The audible length is bounded by the pitch-adjusted physical clip
    /// length: a transposed-up clip runs out of samples sooner, and playing
    /// past that point would be silence. Fails fast when no clip is loaded.
    pub fn trigger(&mut self, pitch: u8, duration: f64) -> Result<(), VoiceError> {
        let ratio = pitch_ratio(pitch);
        let (id, play_duration) = {
            let mut mixer = self.mixer.lock().unwrap();
            let clip_len = mixer
                .clip()
                .map(|clip| clip.len_seconds())
                .ok_or(VoiceError::NoClip)?;
            let play_duration = duration.max(0.0).min(clip_len / ratio);
            let id = mixer.add_voice(ratio).ok_or(VoiceError::NoClip)?;
            (id, play_duration)
        };

        if self.voices.len() >= self.config.max_voices.max(1) {
            let oldest = self.voices.remove(0);
            self.mixer.lock().unwrap().remove_voice(oldest.id);
        }

        self.voices.push(Voice {
            id,
            pitch,
            volume: 0.0,
            phase: Phase::FadeIn,
            hold_remaining: play_duration,
            fade_from: 0.0,
        });
        Ok(())
    }

    /// Advance every voice's envelope by `dt` seconds and sync mixer gains.
    ///
    /// Completed voices are stopped and released here, so teardown is
    /// reachable from any intermediate state just by ticking on.
    pub fn tick(&mut self, dt: f64) {
        let fade = self.config.fade;
        // If the audio side died, there are no gains left to move
        let Ok(mut mixer) = self.mixer.lock() else {
            return;
        };

        for voice in &mut self.voices {
            match voice.phase {
                Phase::FadeIn => {
                    voice.volume += dt / fade;
                    if voice.volume >= 1.0 {
                        voice.volume = 1.0;
                        if voice.hold_remaining > 0.0 {
                            voice.phase = Phase::Hold;
                        } else {
                            voice.fade_from = voice.volume;
                            voice.phase = Phase::FadeOut;
                        }
                    }
                }
                Phase::Hold => {
                    voice.hold_remaining -= dt;
                    if voice.hold_remaining <= 0.0 {
                        voice.fade_from = voice.volume;
                        voice.phase = Phase::FadeOut;
                    }
                }
                Phase::FadeOut => {
                    voice.volume -= voice.fade_from * dt / fade;
                    if voice.volume <= 0.0 {
                        voice.volume = 0.0;
                        voice.phase = Phase::Done;
                    }
                }
                Phase::Done => {}
            }
            mixer.set_gain(voice.id, voice.volume as f32);
        }

        for voice in self.voices.iter().filter(|v| v.phase == Phase::Done) {
            mixer.remove_voice(voice.id);
        }
        self.voices.retain(|v| v.phase != Phase::Done);
    }

    pub fn has_active(&self) -> bool {
        !self.voices.is_empty()
    }

    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Stop and release every voice immediately.
    pub fn clear(&mut self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            for voice in &self.voices {
                mixer.remove_voice(voice.id);
            }
        }
        self.voices.clear();
    }
}

impl Drop for VoiceManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Mixer;
    use std::sync::{Arc, Mutex};

    fn manager_with_clip(clip_secs: f64, config: VoiceConfig) -> VoiceManager {
        let rate = 1000u32;
        let samples = vec![0.1; (clip_secs * f64::from(rate)) as usize];
        let mut mixer = Mixer::new(rate);
        mixer.set_clip(Arc::new(Clip::from_samples(samples, rate)));
        VoiceManager::new(Arc::new(Mutex::new(mixer)), config)
    }

    #[test]
    fn pitch_ratio_octave_equivalence() {
        assert!((pitch_ratio(60) - 1.0).abs() < 1e-12);
        assert!((pitch_ratio(72) - 2.0).abs() < 1e-12);
        assert!((pitch_ratio(48) - 0.5).abs() < 1e-12);
        // A fourth above middle C, for good measure
        assert!((pitch_ratio(65) - 2f64.powf(5.0 / 12.0)).abs() < 1e-12);
    }

    #[test]
    fn play_duration_is_bounded_by_clip_length() {
        // 1 s clip at pitch 72 plays at double rate: at most 0.5 s of audio
        let mut mgr = manager_with_clip(1.0, VoiceConfig::default());
        mgr.trigger(72, 1000.0).unwrap();
        assert!((mgr.voices[0].hold_remaining - 0.5).abs() < 1e-9);

        // Short notes keep their own duration
        mgr.trigger(72, 0.2).unwrap();
        assert!((mgr.voices[1].hold_remaining - 0.2).abs() < 1e-9);
    }

    #[test]
    fn fade_in_is_monotone_and_tops_out_at_one() {
        let mut mgr = manager_with_clip(10.0, VoiceConfig::default());
        mgr.trigger(60, 5.0).unwrap();

        let mut last = 0.0;
        for _ in 0..10 {
            mgr.tick(0.01);
            let v = mgr.voices[0].volume;
            assert!(v >= last);
            last = v;
        }
        // 10 ticks of 10 ms through a 50 ms window: long since clamped
        assert_eq!(mgr.voices[0].volume, 1.0);
        assert_eq!(mgr.voices[0].phase, Phase::Hold);
    }

    #[test]
    fn fade_out_is_monotone_and_releases_voice() {
        let mut mgr = manager_with_clip(10.0, VoiceConfig::default());
        mgr.trigger(60, 0.1).unwrap();

        // Through fade-in (50 ms) and hold (100 ms)
        for _ in 0..16 {
            mgr.tick(0.01);
        }
        assert_eq!(mgr.voices[0].phase, Phase::FadeOut);

        let mut last = mgr.voices[0].volume;
        while mgr.has_active() {
            mgr.tick(0.01);
            if let Some(v) = mgr.voices.first() {
                assert!(v.volume <= last);
                last = v.volume;
            }
        }
        // Teardown released the mixer voice too
        assert_eq!(mgr.mixer.lock().unwrap().voice_count(), 0);
    }

    #[test]
    fn zero_duration_skips_the_hold_phase() {
        let mut mgr = manager_with_clip(10.0, VoiceConfig::default());
        mgr.trigger(60, 0.0).unwrap();

        let mut phases = Vec::new();
        while mgr.has_active() {
            mgr.tick(0.01);
            if let Some(v) = mgr.voices.first() {
                phases.push(v.phase);
            }
        }
        assert!(!phases.contains(&Phase::Hold));
        assert!(phases.contains(&Phase::FadeOut));
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        let mut mgr = manager_with_clip(10.0, VoiceConfig::default());
        mgr.trigger(60, -3.0).unwrap();
        assert_eq!(mgr.voices[0].hold_remaining, 0.0);
    }

    #[test]
    fn missing_clip_fails_fast() {
        let mixer = Arc::new(Mutex::new(Mixer::new(1000)));
        let mut mgr = VoiceManager::new(mixer, VoiceConfig::default());
        assert!(matches!(mgr.trigger(60, 1.0), Err(VoiceError::NoClip)));
        assert!(!mgr.has_active());
    }

    #[test]
    fn concurrent_voices_are_independent() {
        let mut mgr = manager_with_clip(10.0, VoiceConfig::default());
        mgr.trigger(60, 0.05).unwrap();
        mgr.trigger(67, 5.0).unwrap();
        assert_eq!(mgr.active(), 2);

        // Walk until the short voice dies; the long one must still be holding
        for _ in 0..30 {
            mgr.tick(0.01);
        }
        assert_eq!(mgr.active(), 1);
        assert_eq!(mgr.voices[0].pitch, 67);
        assert_eq!(mgr.voices[0].phase, Phase::Hold);
    }

    #[test]
    fn full_pool_steals_the_oldest_voice() {
        let config = VoiceConfig {
            max_voices: 2,
            ..VoiceConfig::default()
        };
        let mut mgr = manager_with_clip(10.0, config);
        mgr.trigger(60, 5.0).unwrap();
        mgr.trigger(64, 5.0).unwrap();
        mgr.trigger(67, 5.0).unwrap();

        assert_eq!(mgr.active(), 2);
        let pitches: Vec<u8> = mgr.voices.iter().map(|v| v.pitch).collect();
        assert_eq!(pitches, vec![64, 67]);
        assert_eq!(mgr.mixer.lock().unwrap().voice_count(), 2);
    }

    #[test]
    fn clear_releases_everything() {
        let mut mgr = manager_with_clip(10.0, VoiceConfig::default());
        mgr.trigger(60, 5.0).unwrap();
        mgr.trigger(64, 5.0).unwrap();
        mgr.clear();
        assert!(!mgr.has_active());
        assert_eq!(mgr.mixer.lock().unwrap().voice_count(), 0);
    }
}
