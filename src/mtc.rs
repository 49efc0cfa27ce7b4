// Copyright (c) 2023 Mike Tsao. All rights reserved.

use anyhow::{bail, Result};
use log::debug;
use midly::live::{LiveEvent, MtcQuarterFrameMessage, SystemCommon};
use tactus_core::{
    midi::{u4, u7},
    time::{FrameRate, TimeCode},
    traits::MessageSink,
};

/// The two-frame quarter-frame cycle repeats a whole number of times in two
/// seconds at every supported rate (24, 25, and 30 fps), so phase arithmetic
/// modulo this window stays exact over arbitrarily long runs.
const PHASE_WINDOW_MILLIS: u64 = 2_000;

/// [TimeCodeGenerator] emits MIDI Time Code: one of the eight rotating
/// quarter-frame messages as the song position crosses each quarter-frame
/// boundary, and a full-frame SysEx on rewind.
///
/// Feed it the engine's song-position milliseconds once per pump via
/// [check()](TimeCodeGenerator::check). The emission schedule is derived
/// from the absolute position, not from counting calls, so a late pump
/// shifts a message by at most the lateness and nothing drifts.
///
/// Drop-frame is not generated; constructing with [FrameRate::Fps2997Drop]
/// fails.
#[derive(Debug)]
pub struct TimeCodeGenerator {
    sink: Box<dyn MessageSink>,
    rate: FrameRate,
    requested_rate: Option<FrameRate>,
    previous_quarter_frame: i8,
    time: TimeCode,
}
impl TimeCodeGenerator {
    pub fn new(rate: FrameRate, sink: Box<dyn MessageSink>) -> Result<Self> {
        if rate.is_drop_frame() {
            bail!("drop-frame time code is not supported");
        }
        Ok(Self {
            sink,
            rate,
            requested_rate: None,
            previous_quarter_frame: -1,
            time: TimeCode::default(),
        })
    }

    pub fn rate(&self) -> FrameRate {
        self.rate
    }

    /// The timecode captured at the most recent quarter-frame-zero boundary.
    pub fn time_code(&self) -> TimeCode {
        self.time
    }

    /// Applies a rate immediately. Only valid while the engine is not
    /// checking; the running path goes through
    /// [request_rate()](TimeCodeGenerator::request_rate).
    pub(crate) fn set_rate(&mut self, rate: FrameRate) -> Result<()> {
        if rate.is_drop_frame() {
            bail!("drop-frame time code is not supported");
        }
        self.rate = rate;
        Ok(())
    }

    /// Defers a rate change; the next [check()](TimeCodeGenerator::check)
    /// swaps it in, synchronously with the engine thread.
    pub(crate) fn request_rate(&mut self, rate: FrameRate) -> Result<()> {
        if rate.is_drop_frame() {
            bail!("drop-frame time code is not supported");
        }
        self.requested_rate = Some(rate);
        Ok(())
    }

    /// Looks at the song position and emits a quarter frame if the position
    /// has entered a new quarter-frame slot since the last look. The half-
    /// slot bias rounds emission to the nearest millisecond, keeping jitter
    /// within half a millisecond of nominal at 24 and 30 fps and at zero at
    /// 25 fps, scheduling aside.
    pub fn check(&mut self, millis: u64) {
        if let Some(rate) = self.requested_rate.take() {
            self.rate = rate;
        }
        let millis_per_frame = self.rate.millis_per_frame();
        let quarter_frames_per_milli = 4.0 / millis_per_frame;
        let frame_phase = ((millis % PHASE_WINDOW_MILLIS) as f64 / millis_per_frame) % 2.0;
        let slot = quarter_frames_per_milli / 2.0 + 4.0 * frame_phase;
        let quarter_frame = (slot.floor() as i8) % 8;
        if quarter_frame != self.previous_quarter_frame {
            if quarter_frame == 0 {
                self.time = TimeCode::from_millis(millis, self.rate);
            }
            self.send_quarter_frame(quarter_frame as u8);
            self.previous_quarter_frame = quarter_frame;
        }
    }

    /// Back to 00:00:00:00: resets the rotation and tells downstream gear
    /// where we are with a full-frame message.
    pub fn rewind(&mut self) {
        self.previous_quarter_frame = -1;
        self.time = TimeCode::default();
        self.send_full_frame();
    }

    fn send_quarter_frame(&mut self, quarter_frame: u8) {
        let (piece, value) = match quarter_frame {
            0 => (MtcQuarterFrameMessage::FramesLow, self.time.frames & 0x0f),
            1 => (MtcQuarterFrameMessage::FramesHigh, self.time.frames >> 4),
            2 => (MtcQuarterFrameMessage::SecondsLow, self.time.seconds & 0x0f),
            3 => (MtcQuarterFrameMessage::SecondsHigh, self.time.seconds >> 4),
            4 => (MtcQuarterFrameMessage::MinutesLow, self.time.minutes & 0x0f),
            5 => (MtcQuarterFrameMessage::MinutesHigh, self.time.minutes >> 4),
            6 => (MtcQuarterFrameMessage::HoursLow, self.time.hours & 0x0f),
            _ => (
                MtcQuarterFrameMessage::HoursHigh,
                (self.time.hours >> 4) | (self.rate.mtc_code() << 1),
            ),
        };
        let event = LiveEvent::Common(SystemCommon::MidiTimeCodeQuarterFrame(
            piece,
            u4::from(value),
        ));
        if self.sink.transport(event, 0).is_err() {
            debug!("time code sink rejected a quarter frame");
        }
    }

    fn send_full_frame(&mut self) {
        let data = [
            0x7f,
            0x7f,
            0x01,
            0x01,
            (self.rate.mtc_code() << 5) | self.time.hours,
            self.time.minutes,
            self.time.seconds,
            self.time.frames,
        ]
        .map(u7::from_int_lossy);
        let event = LiveEvent::Common(SystemCommon::SysEx(&data));
        if self.sink.transport(event, 0).is_err() {
            debug!("time code sink rejected a full frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::RecordingSink;
    use std::sync::{Arc, Mutex};

    const QUARTER_FRAME_STATUS: u8 = 0xf1;
    const SYSEX_STATUS: u8 = 0xf0;

    fn generator(rate: FrameRate) -> (TimeCodeGenerator, Arc<Mutex<Vec<(Vec<u8>, u64)>>>) {
        let sink = RecordingSink::default();
        let events = sink.events();
        (TimeCodeGenerator::new(rate, Box::new(sink)).unwrap(), events)
    }

    fn quarter_frames(events: &[(Vec<u8>, u64)]) -> Vec<(u8, u8)> {
        events
            .iter()
            .filter(|(buf, _)| buf[0] == QUARTER_FRAME_STATUS)
            .map(|(buf, _)| (buf[1] >> 4, buf[1] & 0x0f))
            .collect()
    }

    #[test]
    fn rejects_drop_frame() {
        let sink = RecordingSink::default();
        assert!(TimeCodeGenerator::new(FrameRate::Fps2997Drop, Box::new(sink)).is_err());

        let (mut generator, _events) = generator(FrameRate::Fps25);
        assert!(generator.set_rate(FrameRate::Fps2997Drop).is_err());
        assert!(generator.request_rate(FrameRate::Fps2997Drop).is_err());
    }

    #[test]
    fn quarter_frames_rotate_at_nominal_times() {
        let (mut generator, events) = generator(FrameRate::Fps25);
        for millis in 0..=80 {
            generator.check(millis);
        }
        let frames = quarter_frames(&events.lock().unwrap());
        let pieces: Vec<u8> = frames.iter().map(|(piece, _)| *piece).collect();
        assert_eq!(pieces, vec![0, 1, 2, 3, 4, 5, 6, 7, 0]);
    }

    #[test]
    fn quarter_frame_counts_match_the_rate() {
        for (rate, expected) in [
            (FrameRate::Fps24, 192),
            (FrameRate::Fps25, 200),
            (FrameRate::Fps30, 240),
        ] {
            let (mut generator, events) = generator(rate);
            for millis in 0..2_000 {
                generator.check(millis);
            }
            let count = events.lock().unwrap().len();
            assert_eq!(count, expected, "rate {rate}");
        }
    }

    #[test]
    fn rotation_is_strict_over_a_long_run() {
        let (mut generator, events) = generator(FrameRate::Fps24);
        for millis in 0..5_000 {
            generator.check(millis);
        }
        let frames = quarter_frames(&events.lock().unwrap());
        for (i, (piece, _)) in frames.iter().enumerate() {
            assert_eq!(*piece as usize, i % 8);
        }
    }

    #[test]
    fn caches_time_at_quarter_frame_zero() {
        let (mut generator, _events) = generator(FrameRate::Fps25);
        generator.check(3_661_123);
        assert_eq!(
            generator.time_code(),
            TimeCode {
                hours: 1,
                minutes: 1,
                seconds: 1,
                frames: 3
            }
        );
    }

    #[test]
    fn quarter_frames_carry_the_cached_time() {
        let (mut generator, events) = generator(FrameRate::Fps25);
        // 1 h, 1 min, 1 s in: walk one full rotation from a qf0 boundary
        let start = 3_661_120;
        for millis in start..start + 81 {
            generator.check(millis);
        }
        let frames = quarter_frames(&events.lock().unwrap());
        // frames for 120 ms into the second: round(120/40) = 3
        assert_eq!(frames[0], (0, 3)); // frames low
        assert_eq!(frames[1], (1, 0)); // frames high
        assert_eq!(frames[2], (2, 1)); // seconds low
        assert_eq!(frames[3], (3, 0));
        assert_eq!(frames[4], (4, 1)); // minutes low
        assert_eq!(frames[5], (5, 0));
        assert_eq!(frames[6], (6, 1)); // hours low
        assert_eq!(frames[7].0, 7);
        // hours high carries the rate code for 25 fps in bits 1..2
        assert_eq!(frames[7].1, FrameRate::Fps25.mtc_code() << 1);
    }

    #[test]
    fn rewind_emits_a_full_frame() {
        let (mut generator, events) = generator(FrameRate::Fps30);
        for millis in 0..100 {
            generator.check(millis);
        }
        events.lock().unwrap().clear();
        generator.rewind();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (buf, _) = &events[0];
        assert_eq!(buf[0], SYSEX_STATUS);
        assert_eq!(
            &buf[1..],
            &[
                0x7f,
                0x7f,
                0x01,
                0x01,
                FrameRate::Fps30.mtc_code() << 5,
                0x00,
                0x00,
                0x00,
                0xf7
            ]
        );
        assert_eq!(generator.time_code(), TimeCode::default());
    }

    #[test]
    fn rate_change_requests_are_deferred_to_the_next_check() {
        let (mut generator, _events) = generator(FrameRate::Fps25);
        generator.check(0);
        generator.request_rate(FrameRate::Fps30).unwrap();
        assert_eq!(generator.rate(), FrameRate::Fps25);
        generator.check(1);
        assert_eq!(generator.rate(), FrameRate::Fps30);
    }
}
