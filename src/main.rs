use anyhow::Result;
use clap::Parser;
use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

mod audio;
mod group;
mod player;
mod scene;
mod score;
mod voice;

use audio::{Audio, Clip};
use player::{PlayerConfig, SystemClock};
use scene::{standard_keyboard, KeyMap};
use score::{format_duration, Score};
use voice::VoiceConfig;

#[derive(Parser, Debug)]
struct Opt {
    /// Path to a Standard MIDI file
    midi: PathBuf,
    /// Path to the reference WAV sample, tuned to middle C (MIDI 60)
    clip: PathBuf,
    /// Falling-note speed, distance per second
    #[arg(long, default_value_t = 20.0)]
    fall_speed: f32,
    /// Spawn height above the key, distance
    #[arg(long, default_value_t = 10.0)]
    spawn_height: f32,
    /// Same-start grouping tolerance, seconds
    #[arg(long, default_value_t = group::DEFAULT_TOLERANCE)]
    tolerance: f64,
    /// Minimum wait between note groups, seconds
    #[arg(long, default_value_t = group::DEFAULT_MIN_WAIT)]
    min_wait: f64,
    /// Fade-in/out window, seconds
    #[arg(long, default_value_t = voice::DEFAULT_FADE)]
    fade: f64,
    /// Vertical position where falling notes despawn
    #[arg(long, default_value_t = -10.0)]
    floor: f32,
    /// Concurrent voice bound
    #[arg(long, default_value_t = voice::DEFAULT_MAX_VOICES)]
    max_voices: usize,
}

struct RawGuard;
impl RawGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}
impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    let score = Score::load(&opt.midi)?;
    println!("PPQ: {}", score.ppq);
    println!(
        "Initial tempo: {} µs/qn (~{:.1} BPM)",
        score.initial_us_per_qn,
        60_000_000.0 / score.initial_us_per_qn
    );
    println!("Notes parsed: {}", score.notes.len());
    println!("Estimated track length: {}", format_duration(score.length));

    // Key anchors are assembled once; every missing key warns here and is
    // skipped at spawn time
    let keys = KeyMap::from_anchors(&standard_keyboard());

    let audio = Audio::new()?;
    let clip = Arc::new(Clip::load(&opt.clip)?);
    println!(
        "Using clip: {} ({:.2} s)",
        opt.clip.display(),
        clip.len_seconds()
    );
    audio.set_clip(clip);
    audio.start()?;

    let config = PlayerConfig {
        fall_speed: opt.fall_speed,
        spawn_height: opt.spawn_height,
        tolerance: opt.tolerance,
        min_wait: opt.min_wait,
        floor: opt.floor,
        voice: VoiceConfig {
            fade: opt.fade,
            max_voices: opt.max_voices,
        },
    };
    let player = player::spawn(
        score.notes,
        keys,
        audio.mixer.clone(),
        config,
        SystemClock::new(),
    );

    // Raw mode to capture keys immediately
    let _raw = RawGuard::enter()?;
    println!("Controls: Space = pause/resume, Esc = stop");

    loop {
        // Quit once the song finishes by itself
        if player.is_finished() {
            println!("Playback finished.");
            break;
        }

        // Poll for key events with a short timeout
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(k) = event::read()? {
                match k.code {
                    KeyCode::Char(' ') => player.toggle(),
                    KeyCode::Esc => {
                        player.stop();
                        break;
                    }
                    KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => {
                        player.stop();
                        break;
                    }
                    _ => {}
                }
            }
        }
        // Small idle sleep to keep CPU down
        thread::sleep(Duration::from_millis(5));
    }

    Ok(())
}
