//! score.rs
//!
//! This module parses a Standard MIDI File (SMF) into a flat, time-ordered list
//! of notes. Instead of leaving events in their original tracks and tick-based
//! timing, we resolve every note against the file's tempo map and express it as
//! `(pitch, start seconds, duration seconds)`, which is what the playback
//! scheduler wants to consume.
//!
//! ### Quick primer on MIDI timing
//! - MIDI describes music, not audio: a file is tracks of events like
//!   "Note On", "Note Off" and "Set Tempo", each offset by a delta in "ticks".
//! - Ticks only become wall-clock time through the header's pulses-per-quarter-
//!   note (PPQ) and whatever tempo is in effect at that tick. Tempo events can
//!   appear anywhere, in any track, and apply to the whole file.
//!
//! This module takes care of:
//!  - Building one merged tempo map from all tracks (tick -> seconds)
//!  - Pairing NoteOn with its matching NoteOff (velocity-0 NoteOn counts as off)
//!  - Flattening all tracks into a single chronological note list

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

/// Tempo in effect before any tempo event: 500,000 µs per quarter note (120 BPM).
const DEFAULT_US_PER_QN: f64 = 500_000.0;

/// One note with its timing fully resolved to seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteEvent {
    /// MIDI note number (60 = middle C)
    pub pitch: u8,
    /// Absolute start time in seconds from the beginning of the file
    pub start: f64,
    /// Length in seconds
    pub duration: f64,
}

/// The full parsed result of a MIDI file.
pub struct Score {
    /// All notes from all tracks and channels, ordered by start time
    pub notes: Vec<NoteEvent>,
    /// Pulses per quarter note (from the header)
    pub ppq: f64,
    /// First tempo found in the file, or the 120 BPM default
    pub initial_us_per_qn: f64,
    /// End of the last note, in seconds
    pub length: f64,
}

/// Merged tick -> seconds mapping built from every tempo event in the file.
///
/// Each entry records the tick a tempo takes effect, the tempo itself, and the
/// precomputed absolute time of that tick, so conversion is a binary search
/// plus one linear extrapolation.
struct TempoMap {
    ppq: f64,
    /// (tick, µs per quarter note, seconds at tick); first entry is tick 0
    changes: Vec<(u64, f64, f64)>,
    /// First tempo event in the file, if any
    first_tempo: Option<f64>,
}

impl TempoMap {
    fn build(smf: &Smf<'_>) -> Self {
        let ppq = match smf.header.timing {
            Timing::Metrical(t) => f64::from(t.as_int()),
            _ => 480.0, // fallback if SMPTE timing is used
        };

        // Collect tempo events from every track. They are global in SMF, so a
        // tempo set in track 0 governs notes in track 3.
        let mut raw: Vec<(u64, f64)> = Vec::new();
        for track in &smf.tracks {
            let mut abs_ticks: u64 = 0;
            for ev in track {
                abs_ticks += u64::from(ev.delta.as_int());
                if let TrackEventKind::Meta(MetaMessage::Tempo(tp)) = ev.kind {
                    raw.push((abs_ticks, f64::from(tp.as_int())));
                }
            }
        }
        raw.sort_by_key(|&(tick, _)| tick);
        let first_tempo = raw.first().map(|&(_, us)| us);

        let mut changes = Vec::with_capacity(raw.len() + 1);
        let mut last = (0u64, DEFAULT_US_PER_QN, 0.0f64);
        changes.push(last);
        for (tick, us_per_qn) in raw {
            if tick == last.0 {
                // Later event at the same tick wins
                last.1 = us_per_qn;
                if let Some(top) = changes.last_mut() {
                    top.1 = us_per_qn;
                }
                continue;
            }
            let seconds = last.2 + (tick - last.0) as f64 / ppq * last.1 / 1_000_000.0;
            last = (tick, us_per_qn, seconds);
            changes.push(last);
        }

        Self {
            ppq,
            changes,
            first_tempo,
        }
    }

    /// Absolute time of a tick, in seconds.
    fn seconds_at(&self, tick: u64) -> f64 {
        let i = self.changes.partition_point(|&(t, _, _)| t <= tick) - 1;
        let (base_tick, us_per_qn, base_secs) = self.changes[i];
        base_secs + (tick - base_tick) as f64 / self.ppq * us_per_qn / 1_000_000.0
    }

    /// Tempo of the first tempo event, or the default if the file has none.
    fn initial_us_per_qn(&self) -> f64 {
        self.first_tempo.unwrap_or(DEFAULT_US_PER_QN)
    }
}

impl Score {
    /// Read and parse a MIDI file from disk.
    ///
    /// Any read or parse failure is fatal: with no events there is nothing to
    /// schedule, so the error propagates instead of producing a partial score.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
        let smf = Smf::parse(&bytes).with_context(|| format!("parsing {:?} as MIDI", path))?;
        Ok(Self::from_smf(&smf))
    }

    /// Resolve a parsed SMF into a flat note list.
    ///
    /// Pairing rules:
    /// - NoteOn with velocity 0 is treated as NoteOff (common SMF shorthand)
    /// - Overlapping notes on the same (channel, key) pair are matched FIFO
    /// - Notes still open when their track ends are closed at the track's end
    pub fn from_smf(smf: &Smf<'_>) -> Self {
        let tempo = TempoMap::build(smf);

        let mut notes = Vec::new();
        for track in &smf.tracks {
            // Start times of not-yet-terminated notes, keyed by channel + key
            let mut open: HashMap<(u8, u8), VecDeque<f64>> = HashMap::new();
            let mut abs_ticks: u64 = 0;

            for ev in track {
                abs_ticks += u64::from(ev.delta.as_int());
                let TrackEventKind::Midi { channel, message } = ev.kind else {
                    continue;
                };
                let ch = u8::from(channel);
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        let start = tempo.seconds_at(abs_ticks);
                        open.entry((ch, key.as_int())).or_default().push_back(start);
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        let pitch = key.as_int();
                        if let Some(start) =
                            open.get_mut(&(ch, pitch)).and_then(VecDeque::pop_front)
                        {
                            let end = tempo.seconds_at(abs_ticks);
                            notes.push(NoteEvent {
                                pitch,
                                start,
                                duration: (end - start).max(0.0),
                            });
                        }
                        // A stray NoteOff with no opener is simply dropped
                    }
                    _ => {}
                }
            }

            // Close anything left hanging at the end of the track
            let track_end = tempo.seconds_at(abs_ticks);
            for ((_, pitch), starts) in open {
                for start in starts {
                    notes.push(NoteEvent {
                        pitch,
                        start,
                        duration: (track_end - start).max(0.0),
                    });
                }
            }
        }

        // Merge all tracks into a single sorted timeline
        notes.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.pitch.cmp(&b.pitch)));
        let length = notes
            .iter()
            .map(|n| n.start + n.duration)
            .fold(0.0, f64::max);

        Self {
            notes,
            ppq: tempo.ppq,
            initial_us_per_qn: tempo.initial_us_per_qn(),
            length,
        }
    }
}

/// Format a second count as MM:SS for logging.
pub fn format_duration(secs: f64) -> String {
    let total_secs = secs.max(0.0) as u64;
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    format!("{:02}:{:02}", mins, secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u15, u24};
    use midly::{Format, Header, TrackEvent};
    use std::io::Write;

    fn header(ppq: u16) -> Header {
        Header {
            format: Format::SingleTrack,
            timing: Timing::Metrical(u15::new(ppq)),
        }
    }

    fn note_on(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: delta.into(),
            kind: TrackEventKind::Midi {
                channel: 0.into(),
                message: MidiMessage::NoteOn {
                    key: key.into(),
                    vel: vel.into(),
                },
            },
        }
    }

    fn note_off(delta: u32, key: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: delta.into(),
            kind: TrackEventKind::Midi {
                channel: 0.into(),
                message: MidiMessage::NoteOff {
                    key: key.into(),
                    vel: 0.into(),
                },
            },
        }
    }

    fn tempo(delta: u32, us_per_qn: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: delta.into(),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(us_per_qn))),
        }
    }

    fn end_of_track() -> TrackEvent<'static> {
        TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    #[test]
    fn pairs_on_and_off_into_notes() {
        // PPQ 480 at 120 BPM: 480 ticks = one quarter note = 0.5 s
        let smf = Smf {
            header: header(480),
            tracks: vec![vec![
                note_on(0, 60, 100),
                note_off(480, 60),
                note_on(480, 64, 100),
                note_off(240, 64),
                end_of_track(),
            ]],
        };
        let score = Score::from_smf(&smf);
        assert_eq!(score.notes.len(), 2);

        let first = score.notes[0];
        assert_eq!(first.pitch, 60);
        assert!((first.start - 0.0).abs() < 1e-9);
        assert!((first.duration - 0.5).abs() < 1e-9);

        let second = score.notes[1];
        assert_eq!(second.pitch, 64);
        assert!((second.start - 1.0).abs() < 1e-9);
        assert!((second.duration - 0.25).abs() < 1e-9);

        assert!((score.length - 1.25).abs() < 1e-9);
    }

    #[test]
    fn velocity_zero_note_on_terminates() {
        let smf = Smf {
            header: header(480),
            tracks: vec![vec![
                note_on(0, 72, 100),
                note_on(480, 72, 0), // velocity 0 == NoteOff
                end_of_track(),
            ]],
        };
        let score = Score::from_smf(&smf);
        assert_eq!(score.notes.len(), 1);
        assert!((score.notes[0].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tempo_change_rescales_later_notes() {
        // First quarter at 120 BPM (0.5 s), then 60 BPM (1.0 s per quarter)
        let smf = Smf {
            header: header(480),
            tracks: vec![vec![
                note_on(0, 60, 100),
                note_off(480, 60),
                tempo(0, 1_000_000),
                note_on(0, 62, 100),
                note_off(480, 62),
                end_of_track(),
            ]],
        };
        let score = Score::from_smf(&smf);
        assert_eq!(score.notes.len(), 2);
        assert!((score.notes[0].duration - 0.5).abs() < 1e-9);
        assert!((score.notes[1].start - 0.5).abs() < 1e-9);
        assert!((score.notes[1].duration - 1.0).abs() < 1e-9);
        assert!((score.initial_us_per_qn - 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn tempo_from_other_track_applies() {
        // Tempo lives in track 0, notes in track 1
        let smf = Smf {
            header: header(480),
            tracks: vec![
                vec![tempo(0, 250_000), end_of_track()],
                vec![note_on(0, 60, 100), note_off(480, 60), end_of_track()],
            ],
        };
        let score = Score::from_smf(&smf);
        // 250,000 µs/qn = 240 BPM, so one quarter = 0.25 s
        assert!((score.notes[0].duration - 0.25).abs() < 1e-9);
    }

    #[test]
    fn unterminated_note_closed_at_track_end() {
        let smf = Smf {
            header: header(480),
            tracks: vec![vec![
                note_on(0, 60, 100),
                TrackEvent {
                    delta: 960.into(),
                    kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
                },
            ]],
        };
        let score = Score::from_smf(&smf);
        assert_eq!(score.notes.len(), 1);
        assert!((score.notes[0].duration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overlapping_same_pitch_pairs_fifo() {
        let smf = Smf {
            header: header(480),
            tracks: vec![vec![
                note_on(0, 60, 100),
                note_on(240, 60, 100),
                note_off(240, 60), // closes the first opener
                note_off(240, 60), // closes the second
                end_of_track(),
            ]],
        };
        let score = Score::from_smf(&smf);
        assert_eq!(score.notes.len(), 2);
        assert!((score.notes[0].start - 0.0).abs() < 1e-9);
        assert!((score.notes[0].duration - 0.5).abs() < 1e-9);
        assert!((score.notes[1].start - 0.25).abs() < 1e-9);
        assert!((score.notes[1].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn garbage_file_is_a_load_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"this is not midi").unwrap();
        f.flush().unwrap();
        assert!(Score::load(f.path()).is_err());
    }

    #[test]
    fn formats_track_length() {
        assert_eq!(format_duration(0.0), "00:00");
        assert_eq!(format_duration(61.2), "01:01");
        assert_eq!(format_duration(-3.0), "00:00");
    }
}
