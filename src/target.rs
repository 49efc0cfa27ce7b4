// Copyright (c) 2023 Mike Tsao. All rights reserved.

use log::warn;
use tactus_core::{
    midi::{
        new_controller, new_note_on, LiveEvent, MidiChannel, MidiMessage, NoteOnCache,
        ALL_CONTROLLERS_OFF, ALL_NOTES_OFF, HOLD_PEDAL,
    },
    traits::MessageSink,
};

/// [MessageTarget] decorates the outbound [MessageSink]. Every note-on and
/// note-off passing through updates a [NoteOnCache], so that
/// [notes_off()](MessageTarget::notes_off) can later balance whatever is
/// still sounding. Everything else is forwarded untouched.
///
/// Sink rejections never propagate: they are counted, the first one is
/// logged, and the cache is updated regardless so its picture of the
/// downstream device stays consistent.
#[derive(Debug)]
pub struct MessageTarget {
    sink: Box<dyn MessageSink>,
    cache: NoteOnCache,
    rejected: usize,
}
impl MessageTarget {
    pub fn new(sink: Box<dyn MessageSink>) -> Self {
        Self {
            sink,
            cache: Default::default(),
            rejected: 0,
        }
    }

    /// Sends one channel message downstream, keeping the note cache honest.
    /// A note-on with velocity zero counts as a note-off.
    pub fn transport(&mut self, channel: MidiChannel, message: MidiMessage, at_micros: u64) {
        match message {
            MidiMessage::NoteOn { key, vel } => {
                if vel.as_int() > 0 {
                    self.cache.set(key.as_int(), channel.value());
                } else {
                    self.cache.clear(key.as_int(), channel.value());
                }
            }
            MidiMessage::NoteOff { key, .. } => {
                self.cache.clear(key.as_int(), channel.value());
            }
            _ => {}
        }
        self.send(channel, message, at_micros);
    }

    /// Silences everything the cache knows about, channel by channel. The
    /// explicit per-note offs go out before the blanket ALL_NOTES_OFF so
    /// that devices ignoring the channel-mode message still go quiet; the
    /// sustain pedal is released afterward so nothing rings on. `stop` true
    /// adds a controller reset, which a mere mute must not do.
    pub fn notes_off(&mut self, stop: bool) {
        for channel in 0..MidiChannel::MAX {
            let mask = 1u16 << channel;
            for note in 0..=127u8 {
                if self.cache.test_and_clear(note, mask) {
                    // velocity-0 note-on: note-off with wider device acceptance
                    self.send(MidiChannel(channel), new_note_on(note, 0), 0);
                }
            }
            self.send(MidiChannel(channel), new_controller(ALL_NOTES_OFF, 0), 0);
            self.send(MidiChannel(channel), new_controller(HOLD_PEDAL, 0), 0);
            if stop {
                self.send(MidiChannel(channel), new_controller(ALL_CONTROLLERS_OFF, 0), 0);
            }
        }
    }

    /// Whether any note is still marked sounding.
    pub fn has_sounding_notes(&self) -> bool {
        !self.cache.is_empty()
    }

    /// How many messages the sink has rejected since construction.
    pub fn rejected_count(&self) -> usize {
        self.rejected
    }

    fn send(&mut self, channel: MidiChannel, message: MidiMessage, at_micros: u64) {
        let event = LiveEvent::Midi {
            channel: channel.into(),
            message,
        };
        if let Err(e) = self.sink.transport(event, at_micros) {
            if self.rejected == 0 {
                warn!("downstream sink rejected {:?}: {:?}", message, e);
            }
            self.rejected += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{parse_channel_messages, RecordingSink};
    use anyhow::bail;
    use tactus_core::midi::new_note_off;

    #[derive(Debug, Default)]
    struct RejectingSink;
    impl MessageSink for RejectingSink {
        fn transport(&mut self, _event: LiveEvent, _at_micros: u64) -> anyhow::Result<()> {
            bail!("nope");
        }
    }

    #[test]
    fn target_balances_notes_on_flush() {
        let sink = RecordingSink::default();
        let events = sink.events();
        let mut target = MessageTarget::new(Box::new(sink));

        target.transport(MidiChannel(0), new_note_on(60, 100), 0);
        target.transport(MidiChannel(9), new_note_on(36, 127), 0);
        target.transport(MidiChannel(0), new_note_on(64, 100), 0);
        target.transport(MidiChannel(0), new_note_off(64, 0), 0);
        assert!(target.has_sounding_notes());

        events.lock().unwrap().clear();
        target.notes_off(false);
        assert!(!target.has_sounding_notes());

        let messages = parse_channel_messages(&events.lock().unwrap());
        // one balancing off per sounding note, as velocity-0 note-ons
        assert!(messages.contains(&(0, new_note_on(60, 0))));
        assert!(messages.contains(&(9, new_note_on(36, 0))));
        assert!(!messages.contains(&(0, new_note_on(64, 0))));
        // blanket channel-mode messages on every channel, no controller reset
        for channel in 0..16u8 {
            assert!(messages.contains(&(channel, new_controller(ALL_NOTES_OFF, 0))));
            assert!(messages.contains(&(channel, new_controller(HOLD_PEDAL, 0))));
            assert!(!messages.contains(&(channel, new_controller(ALL_CONTROLLERS_OFF, 0))));
        }
    }

    #[test]
    fn target_note_offs_precede_blanket_messages() {
        let sink = RecordingSink::default();
        let events = sink.events();
        let mut target = MessageTarget::new(Box::new(sink));

        target.transport(MidiChannel(2), new_note_on(72, 80), 0);
        events.lock().unwrap().clear();
        target.notes_off(true);

        let messages = parse_channel_messages(&events.lock().unwrap());
        let off_at = messages
            .iter()
            .position(|m| *m == (2, new_note_on(72, 0)))
            .unwrap();
        let blanket_at = messages
            .iter()
            .position(|m| *m == (2, new_controller(ALL_NOTES_OFF, 0)))
            .unwrap();
        let reset_at = messages
            .iter()
            .position(|m| *m == (2, new_controller(ALL_CONTROLLERS_OFF, 0)))
            .unwrap();
        assert!(off_at < blanket_at);
        assert!(blanket_at < reset_at);
    }

    #[test]
    fn target_stop_resets_controllers() {
        let sink = RecordingSink::default();
        let events = sink.events();
        let mut target = MessageTarget::new(Box::new(sink));

        target.notes_off(true);
        let messages = parse_channel_messages(&events.lock().unwrap());
        for channel in 0..16u8 {
            assert!(messages.contains(&(channel, new_controller(ALL_CONTROLLERS_OFF, 0))));
        }
    }

    #[test]
    fn target_velocity_zero_note_on_clears_cache() {
        let sink = RecordingSink::default();
        let mut target = MessageTarget::new(Box::new(sink));

        target.transport(MidiChannel(5), new_note_on(40, 90), 0);
        assert!(target.has_sounding_notes());
        target.transport(MidiChannel(5), new_note_on(40, 0), 0);
        assert!(!target.has_sounding_notes());
    }

    #[test]
    fn target_swallows_and_counts_sink_rejections() {
        let mut target = MessageTarget::new(Box::new(RejectingSink));

        target.transport(MidiChannel(0), new_note_on(60, 100), 0);
        target.transport(MidiChannel(0), new_note_on(62, 100), 0);
        assert_eq!(target.rejected_count(), 2);

        // the cache stayed consistent even though nothing got through
        assert!(target.has_sounding_notes());
    }
}
