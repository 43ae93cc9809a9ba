//! group.rs
//!
//! Clusters notes that start at (nearly) the same time into groups, so the
//! scheduler can walk group-to-group instead of note-to-note. Membership is
//! anchored to the *first* note of the pending group: a long run of notes each
//! within tolerance of its neighbor can still split once it drifts past the
//! anchor. That is an accepted approximation, not a clustering guarantee.

use crate::score::NoteEvent;

/// Two starts closer than this are "the same time".
pub const DEFAULT_TOLERANCE: f64 = 0.01;
/// Smallest gap the scheduler will wait between groups.
pub const DEFAULT_MIN_WAIT: f64 = 0.01;

/// Notes sharing a start time, within tolerance of the anchor.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteGroup {
    /// Start time of the group's first note
    pub anchor: f64,
    /// Members, in source order
    pub notes: Vec<NoteEvent>,
}

/// Lazy iterator adapter turning a time-ordered note sequence into groups.
pub struct Grouper<I: Iterator<Item = NoteEvent>> {
    source: I,
    tolerance: f64,
    pending: Vec<NoteEvent>,
    anchor: f64,
}

impl<I: Iterator<Item = NoteEvent>> Grouper<I> {
    pub fn new(source: I, tolerance: f64) -> Self {
        Self {
            source,
            tolerance,
            pending: Vec::new(),
            anchor: 0.0,
        }
    }

    fn flush(&mut self) -> NoteGroup {
        NoteGroup {
            anchor: self.anchor,
            notes: std::mem::take(&mut self.pending),
        }
    }
}

impl<I: Iterator<Item = NoteEvent>> Iterator for Grouper<I> {
    type Item = NoteGroup;

    fn next(&mut self) -> Option<NoteGroup> {
        loop {
            match self.source.next() {
                Some(note) => {
                    if self.pending.is_empty() {
                        self.anchor = note.start;
                        self.pending.push(note);
                    } else if (note.start - self.anchor).abs() < self.tolerance {
                        self.pending.push(note);
                    } else {
                        let group = self.flush();
                        self.anchor = note.start;
                        self.pending.push(note);
                        return Some(group);
                    }
                }
                None => {
                    if self.pending.is_empty() {
                        return None;
                    }
                    return Some(self.flush());
                }
            }
        }
    }
}

/// Real-time gap the scheduler sleeps between two consecutive groups.
///
/// Clamped so the walk always makes forward progress, even when source data
/// is denser than the tolerance or out of order.
pub fn wait_between(prev: &NoteGroup, next: &NoteGroup, min_wait: f64) -> f64 {
    (next.anchor - prev.anchor).max(min_wait)
}
