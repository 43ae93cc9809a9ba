//! player.rs
//!
//! Real-time playback: walks note groups in order, dispatching each group as
//! it comes due, and advances every cooperative task (voice envelopes, falling
//! notes) in between. The walk itself is a plain state machine (`Engine`)
//! stepped with explicit `now` values, so tests can drive it with a virtual
//! clock; the conductor thread wraps it with a wall clock, short sleeps, and
//! pause/stop handling.
//!
//! Dispatch is atomic per group: all of a group's notes spawn and trigger
//! within one step, and a teardown between steps abandons whole groups only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::MixerHandle;
use crate::group::{wait_between, Grouper, NoteGroup, DEFAULT_MIN_WAIT, DEFAULT_TOLERANCE};
use crate::scene::{KeyMap, Scene};
use crate::score::NoteEvent;
use crate::voice::{VoiceConfig, VoiceError, VoiceManager};

/// Everything tunable about playback.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Falling-note speed, distance per second
    pub fall_speed: f32,
    /// How far above its key a note spawns
    pub spawn_height: f32,
    /// Same-start grouping tolerance, seconds
    pub tolerance: f64,
    /// Minimum wait between groups, seconds
    pub min_wait: f64,
    /// Vertical position where falling notes despawn
    pub floor: f32,
    /// Voice envelope and pool settings
    pub voice: VoiceConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            fall_speed: 20.0,
            spawn_height: 10.0,
            tolerance: DEFAULT_TOLERANCE,
            min_wait: DEFAULT_MIN_WAIT,
            floor: -10.0,
            voice: VoiceConfig::default(),
        }
    }
}

/// Playback time source, seconds since playback start.
pub trait Clock: Send {
    fn now(&self) -> f64;
}

/// Wall clock anchored at construction.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// The scheduling core: group walking plus per-tick advancement of voices and
/// falling notes. All state is owned here and only touched through `step`.
pub(crate) struct Engine {
    groups: std::iter::Peekable<Grouper<std::vec::IntoIter<NoteEvent>>>,
    keys: KeyMap,
    scene: Scene,
    voices: VoiceManager,
    config: PlayerConfig,
    /// When the next pending group is due; the first group fires at start
    due: f64,
    last_now: f64,
}

impl Engine {
    pub fn new(notes: Vec<NoteEvent>, keys: KeyMap, mixer: MixerHandle, config: PlayerConfig) -> Self {
        Self {
            groups: Grouper::new(notes.into_iter(), config.tolerance).peekable(),
            keys,
            scene: Scene::new(config.floor),
            voices: VoiceManager::new(mixer, config.voice.clone()),
            config,
            due: 0.0,
            last_now: 0.0,
        }
    }

    /// Advance playback to `now`. Returns `Ok(true)` while work remains.
    pub fn step(&mut self, now: f64) -> Result<bool, VoiceError> {
        let dt = (now - self.last_now).max(0.0);
        self.last_now = now;

        // Dispatch everything that has come due; each group is dispatched
        // whole before the walk moves on
        while now >= self.due {
            let Some(group) = self.groups.next() else {
                break;
            };
            self.dispatch(&group)?;
            match self.groups.peek() {
                Some(next) => self.due += wait_between(&group, next, self.config.min_wait),
                None => break,
            }
        }

        self.voices.tick(dt);
        self.scene.tick(dt);

        Ok(self.groups.peek().is_some() || self.voices.has_active() || !self.scene.is_empty())
    }

    fn dispatch(&mut self, group: &NoteGroup) -> Result<(), VoiceError> {
        for note in &group.notes {
            // A pitch without an anchor was already warned about at key map
            // build; it just has no visual
            if let Some(pos) = self.keys.get(note.pitch) {
                self.scene
                    .spawn(note.pitch, pos, self.config.spawn_height, self.config.fall_speed);
            }
            self.voices.trigger(note.pitch, note.duration)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn scene(&self) -> &Scene {
        &self.scene
    }

    #[cfg(test)]
    pub(crate) fn voices(&self) -> &VoiceManager {
        &self.voices
    }
}

/// Handle to a running playback thread.
pub struct Player {
    paused: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    finished: Arc<AtomicBool>,
}

impl Player {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn toggle(&self) {
        let now = self.paused.load(Ordering::SeqCst);
        self.paused.store(!now, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Tick granularity of the conductor loop. Bounds scheduling jitter and sets
/// the fade envelope resolution; well under the minimum group wait.
const TICK: Duration = Duration::from_millis(2);

/// Spawn the conductor thread that drives an `Engine` against a clock.
///
/// Pausing freezes logical time: wall time spent paused is subtracted before
/// stepping, so the walk resumes exactly where it left off. Stopping (or an
/// unplayable voice) abandons the remaining groups; dropping the engine
/// releases any voices still sounding.
pub fn spawn(
    notes: Vec<NoteEvent>,
    keys: KeyMap,
    mixer: MixerHandle,
    config: PlayerConfig,
    clock: impl Clock + 'static,
) -> Player {
    let paused = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let paused_t = paused.clone();
    let finished_t = finished.clone();

    thread::spawn(move || {
        let mut engine = Engine::new(notes, keys, mixer, config);
        let mut paused_since: Option<f64> = None;
        let mut paused_total = 0.0f64;

        'play: loop {
            // Stop request?
            if stop_rx.try_recv().is_ok() {
                break 'play;
            }

            // Handle pausing: don't advance logical time while paused
            if paused_t.load(Ordering::SeqCst) {
                if paused_since.is_none() {
                    paused_since = Some(clock.now());
                }
                thread::sleep(Duration::from_millis(10));
                continue;
            } else if let Some(since) = paused_since.take() {
                paused_total += clock.now() - since;
            }

            let now = clock.now() - paused_total;
            match engine.step(now) {
                Ok(true) => {}
                Ok(false) => break 'play,
                Err(e) => {
                    eprintln!("playback error: {e}");
                    break 'play;
                }
            }

            thread::sleep(TICK);
        }

        finished_t.store(true, Ordering::SeqCst);
    });

    Player {
        paused,
        stop_tx,
        finished,
    }
}
