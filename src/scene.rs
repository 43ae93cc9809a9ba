//! scene.rs
//!
//! The spatial side of playback: a read-only map from pitch to key position,
//! built once from named anchors, and the falling note actors spawned above
//! those keys. Actors translate downward at constant speed and despawn when
//! they cross the floor.

use std::collections::HashMap;

/// Lowest key of a standard 88-key keyboard (A0).
pub const LOW_KEY: u8 = 21;
/// Highest key (C8).
pub const HIGH_KEY: u8 = 108;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pos {
    pub x: f32,
    pub y: f32,
}

/// A named position in the scene, e.g. `Key_60` over middle C.
#[derive(Clone, Debug)]
pub struct Anchor {
    pub name: String,
    pub pos: Pos,
}

/// The standard 88 key anchors, one unit apart along the x axis.
pub fn standard_keyboard() -> Vec<Anchor> {
    (LOW_KEY..=HIGH_KEY)
        .map(|key| Anchor {
            name: format!("Key_{key}"),
            pos: Pos {
                x: f32::from(key - LOW_KEY),
                y: 0.0,
            },
        })
        .collect()
}

/// Read-only pitch -> position lookup, assembled once at startup.
///
/// Anchors are matched by the `Key_<pitch>` naming convention. A pitch with no
/// matching anchor is logged and left out; notes at that pitch still sound,
/// they just have nowhere to spawn a visual.
pub struct KeyMap {
    keys: HashMap<u8, Pos>,
}

impl KeyMap {
    pub fn from_anchors<'a>(anchors: impl IntoIterator<Item = &'a Anchor>) -> Self {
        let by_name: HashMap<&str, Pos> = anchors
            .into_iter()
            .map(|a| (a.name.as_str(), a.pos))
            .collect();

        let mut keys = HashMap::new();
        for key in LOW_KEY..=HIGH_KEY {
            let name = format!("Key_{key}");
            match by_name.get(name.as_str()) {
                Some(&pos) => {
                    keys.insert(key, pos);
                }
                None => eprintln!("warning: {name} not found in the scene"),
            }
        }

        Self { keys }
    }

    pub fn get(&self, pitch: u8) -> Option<Pos> {
        self.keys.get(&pitch).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// One falling note: spawned above its key, translated down every tick.
#[derive(Clone, Copy, Debug)]
pub struct FallingNote {
    pub pitch: u8,
    pub pos: Pos,
    /// Distance per second, downward
    pub fall_speed: f32,
}

/// Holds the live falling notes and despawns them past the floor.
pub struct Scene {
    notes: Vec<FallingNote>,
    floor: f32,
}

impl Scene {
    pub fn new(floor: f32) -> Self {
        Self {
            notes: Vec::new(),
            floor,
        }
    }

    /// Spawn a note actor above the given key position.
    pub fn spawn(&mut self, pitch: u8, key_pos: Pos, spawn_height: f32, fall_speed: f32) {
        self.notes.push(FallingNote {
            pitch,
            pos: Pos {
                x: key_pos.x,
                y: key_pos.y + spawn_height,
            },
            fall_speed,
        });
    }

    /// Advance every actor by `dt` seconds and drop the ones past the floor.
    pub fn tick(&mut self, dt: f64) {
        let floor = self.floor;
        for note in &mut self.notes {
            note.pos.y -= note.fall_speed * dt as f32;
        }
        self.notes.retain(|n| n.pos.y >= floor);
    }

    pub fn notes(&self) -> &[FallingNote] {
        &self.notes
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}
