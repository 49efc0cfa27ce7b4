// Copyright (c) 2023 Mike Tsao. All rights reserved.

use crate::target::MessageTarget;
use btreemultimap::BTreeMultiMap;
use std::sync::{Arc, Mutex};
use tactus_core::{
    midi::{new_note_off, new_note_on, MidiChannel, MidiMessage},
    time::{Tick, END_OF_TRACK},
    traits::{EventSource, EventTrack, SynchronousControl},
    ParameterType,
};

/// One scheduled occurrence in a sequence: either a channel message to
/// transport downstream, or a tempo change, which never goes downstream and
/// instead becomes a call on the engine's tempo back-channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SequenceEvent {
    Midi {
        channel: MidiChannel,
        message: MidiMessage,
    },
    Tempo(ParameterType),
}

/// [EventSequence] is how callers program a track: insert events keyed by
/// tick, in any order, then hand the finished sequence to
/// [SequenceSource::add_sequence()]. The multimap keeps simultaneous events
/// in insertion order.
#[derive(Debug, Default)]
pub struct EventSequence {
    events: BTreeMultiMap<Tick, SequenceEvent>,
}
impl EventSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, when: Tick, channel: MidiChannel, message: MidiMessage) {
        self.events.insert(when, SequenceEvent::Midi { channel, message });
    }

    pub fn insert_tempo(&mut self, when: Tick, bpm: ParameterType) {
        self.events.insert(when, SequenceEvent::Tempo(bpm));
    }

    /// Convenience for the common case: a note-on at `when` and its
    /// balancing note-off `duration` ticks later.
    pub fn note(&mut self, when: Tick, duration: Tick, channel: MidiChannel, key: u8, velocity: u8) {
        self.insert(when, channel, new_note_on(key, velocity));
        self.insert(when + duration, channel, new_note_off(key, 0));
    }

    pub fn len(&self) -> usize {
        self.events.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn into_ordered(self) -> Vec<(Tick, SequenceEvent)> {
        self.events.iter().map(|(when, event)| (*when, *event)).collect()
    }
}

/// A [SequenceTrack] is the playback cursor over one [EventSequence]. The
/// cursor is the count of events already played rather than a peeked
/// next-event reference, so events inserted behind it surface on the next
/// pump instead of being skipped.
#[derive(Debug)]
pub struct SequenceTrack {
    name: String,
    events: Vec<(Tick, SequenceEvent)>,
    played: usize,
    target: Arc<Mutex<MessageTarget>>,
}
impl SequenceTrack {
    fn new(
        name: impl Into<String>,
        sequence: EventSequence,
        target: Arc<Mutex<MessageTarget>>,
    ) -> Self {
        Self {
            name: name.into(),
            events: sequence.into_ordered(),
            played: 0,
            target,
        }
    }

    fn rewind(&mut self) {
        self.played = 0;
    }
}
impl EventTrack for SequenceTrack {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_tick(&self) -> Tick {
        self.events
            .get(self.played)
            .map_or(END_OF_TRACK, |(when, _)| *when)
    }

    fn play_next(&mut self, control: &dyn SynchronousControl) {
        let Some((_, event)) = self.events.get(self.played) else {
            return;
        };
        let event = *event;
        self.played += 1;
        match event {
            SequenceEvent::Midi { channel, message } => {
                if let Ok(mut target) = self.target.lock() {
                    target.transport(channel, message, 0);
                }
            }
            SequenceEvent::Tempo(bpm) => control.set_bpm(bpm),
        }
    }

    fn off(&mut self, stop: bool) {
        if let Ok(mut target) = self.target.lock() {
            target.notes_off(stop);
        }
    }
}

/// [SequenceSource] composes [SequenceTrack]s into an [EventSource] the
/// engine can drive. It owns the tempo back-channel handle the engine gives
/// it, and supports a one-shot reposition offset that the engine picks up at
/// its next sync.
#[derive(Debug)]
pub struct SequenceSource {
    name: String,
    resolution: u32,
    tracks: Vec<SequenceTrack>,
    control: Option<Arc<dyn SynchronousControl>>,
    pending_offset: Tick,
}
impl SequenceSource {
    pub fn new(name: impl Into<String>, resolution: u32) -> Self {
        Self {
            name: name.into(),
            resolution,
            tracks: Vec::default(),
            control: None,
            pending_offset: 0,
        }
    }

    pub fn add_sequence(
        &mut self,
        name: impl Into<String>,
        sequence: EventSequence,
        target: Arc<Mutex<MessageTarget>>,
    ) {
        self.tracks.push(SequenceTrack::new(name, sequence, target));
    }

    /// Requests a one-shot reposition. The engine applies the offset to its
    /// tick position during its next sync call.
    pub fn request_offset(&mut self, offset: Tick) {
        self.pending_offset = offset;
    }
}
impl EventSource for SequenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolution(&self) -> u32 {
        self.resolution
    }

    fn tracks(&self) -> Vec<&dyn EventTrack> {
        self.tracks.iter().map(|t| t as &dyn EventTrack).collect()
    }

    fn control(&mut self, control: Arc<dyn SynchronousControl>) {
        self.control = Some(control);
    }

    fn sync(&mut self, _current_tick: Tick) -> Tick {
        std::mem::take(&mut self.pending_offset)
    }

    fn play_to_tick(&mut self, target_tick: Tick) {
        let Some(control) = self.control.as_ref().map(Arc::clone) else {
            return;
        };
        for track in &mut self.tracks {
            while track.next_tick() <= target_tick {
                track.play_next(control.as_ref());
            }
        }
    }

    fn return_to_zero(&mut self) {
        for track in &mut self.tracks {
            track.rewind();
        }
    }

    fn stopped(&mut self) {
        for track in &mut self.tracks {
            track.off(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{new_shared_target, parse_channel_messages, FakeControl, RecordingSink};

    fn sequence_with_notes(ticks: &[Tick]) -> EventSequence {
        let mut sequence = EventSequence::new();
        for when in ticks {
            sequence.insert(*when, MidiChannel(0), new_note_on(60, 100));
        }
        sequence
    }

    #[test]
    fn sequence_orders_unordered_inserts() {
        let mut sequence = EventSequence::new();
        sequence.insert(960, MidiChannel(0), new_note_on(64, 100));
        sequence.insert(0, MidiChannel(0), new_note_on(60, 100));
        sequence.insert(480, MidiChannel(0), new_note_on(62, 100));
        let ordered = sequence.into_ordered();
        let ticks: Vec<Tick> = ordered.iter().map(|(when, _)| *when).collect();
        assert_eq!(ticks, vec![0, 480, 960]);
    }

    #[test]
    fn sequence_note_adds_balancing_off() {
        let mut sequence = EventSequence::new();
        sequence.note(0, 480, MidiChannel(3), 60, 100);
        assert_eq!(sequence.len(), 2);
        let ordered = sequence.into_ordered();
        assert_eq!(ordered[0].0, 0);
        assert_eq!(ordered[1].0, 480);
        assert_eq!(
            ordered[1].1,
            SequenceEvent::Midi {
                channel: MidiChannel(3),
                message: new_note_off(60, 0)
            }
        );
    }

    #[test]
    fn track_cursor_peeks_and_advances() {
        let (target, _events) = new_shared_target();
        let control = FakeControl::default();
        let mut track = SequenceTrack::new("lead", sequence_with_notes(&[0, 480, 960]), target);

        assert_eq!(track.next_tick(), 0);
        track.play_next(&control);
        assert_eq!(track.next_tick(), 480);
        track.play_next(&control);
        track.play_next(&control);
        assert_eq!(track.next_tick(), END_OF_TRACK);

        // playing past the end is harmless
        track.play_next(&control);
        assert_eq!(track.next_tick(), END_OF_TRACK);

        track.rewind();
        assert_eq!(track.next_tick(), 0);
    }

    #[test]
    fn track_routes_tempo_to_back_channel_not_downstream() {
        let (target, events) = new_shared_target();
        let control = FakeControl::default();
        let mut sequence = EventSequence::new();
        sequence.insert_tempo(0, 60.0);
        let mut track = SequenceTrack::new("tempo", sequence, target);

        track.play_next(&control);
        assert_eq!(control.last_bpm(), Some(60.0));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn source_plays_all_tracks_to_tick() {
        let sink = RecordingSink::default();
        let events = sink.events();
        let target = Arc::new(Mutex::new(MessageTarget::new(Box::new(sink))));
        let mut source = SequenceSource::new("song", 480);
        source.add_sequence("a", sequence_with_notes(&[0, 480]), Arc::clone(&target));
        source.add_sequence("b", sequence_with_notes(&[240, 960]), Arc::clone(&target));
        source.control(Arc::new(FakeControl::default()));

        source.play_to_tick(480);
        assert_eq!(parse_channel_messages(&events.lock().unwrap()).len(), 3);

        source.play_to_tick(960);
        assert_eq!(parse_channel_messages(&events.lock().unwrap()).len(), 4);

        source.return_to_zero();
        assert_eq!(source.tracks()[0].next_tick(), 0);
        assert_eq!(source.tracks()[1].next_tick(), 240);
    }

    #[test]
    fn source_sync_offset_is_one_shot() {
        let mut source = SequenceSource::new("song", 480);
        assert_eq!(source.sync(0), 0);
        source.request_offset(-480);
        assert_eq!(source.sync(960), -480);
        assert_eq!(source.sync(480), 0);
    }
}
