// Copyright (c) 2023 Mike Tsao. All rights reserved.

use crate::ParameterType;
use derive_more::Display as DeriveDisplay;
use strum_macros::{Display, IntoStaticStr};

/// Musical time, expressed in ticks since the last rewind. The tick is the
/// smallest unit of musical time; a source declares how many of them make up
/// a quarter note (its resolution). Monotonically non-decreasing while the
/// engine plays, zero at rest.
pub type Tick = i64;

/// The value a track cursor reports when it has no more events. Chosen so
/// that any real event tick compares less than it.
pub const END_OF_TRACK: Tick = Tick::MAX;

/// The SMPTE frame rates that MIDI Time Code can describe. The numeric
/// payload of an MTC message carries one of four two-bit codes, so this is a
/// closed set.
#[derive(Clone, Copy, Debug, Default, Display, IntoStaticStr, PartialEq, Eq)]
pub enum FrameRate {
    #[strum(to_string = "24 fps")]
    Fps24,
    #[default]
    #[strum(to_string = "25 fps")]
    Fps25,
    #[strum(to_string = "29.97 fps drop-frame")]
    Fps2997Drop,
    #[strum(to_string = "30 fps")]
    Fps30,
}
impl FrameRate {
    pub fn fps(&self) -> ParameterType {
        match self {
            FrameRate::Fps24 => 24.0,
            FrameRate::Fps25 => 25.0,
            FrameRate::Fps2997Drop => 29.97,
            FrameRate::Fps30 => 30.0,
        }
    }

    /// Nominal milliseconds per video frame.
    pub fn millis_per_frame(&self) -> f64 {
        1000.0 / self.fps()
    }

    /// How many frames are counted per second. Drop-frame counts 30 and
    /// skips numbers to stay honest, which is exactly why the generator
    /// refuses it.
    pub fn frames_per_second(&self) -> u8 {
        match self {
            FrameRate::Fps24 => 24,
            FrameRate::Fps25 => 25,
            FrameRate::Fps2997Drop | FrameRate::Fps30 => 30,
        }
    }

    /// The two-bit rate code carried in the hours-high quarter frame and in
    /// the full-frame SysEx.
    pub fn mtc_code(&self) -> u8 {
        match self {
            FrameRate::Fps24 => 0,
            FrameRate::Fps25 => 1,
            FrameRate::Fps2997Drop => 2,
            FrameRate::Fps30 => 3,
        }
    }

    pub fn is_drop_frame(&self) -> bool {
        matches!(self, FrameRate::Fps2997Drop)
    }
}

/// A wall-clock position expressed as SMPTE hh:mm:ss:ff.
#[derive(Clone, Copy, Debug, Default, DeriveDisplay, PartialEq, Eq)]
#[display(fmt = "{:02}:{:02}:{:02}:{:02}", hours, minutes, seconds, frames)]
pub struct TimeCode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
}
impl TimeCode {
    /// Converts a millisecond position to timecode at the given rate. The
    /// frame number rounds to the nearest frame, then clamps to the rate's
    /// last frame so that 999 ms never reports an out-of-range frame. Hours
    /// wrap at 24, matching the five-bit hours field of MTC.
    pub fn from_millis(millis: u64, rate: FrameRate) -> Self {
        let frames = ((millis % 1000) as f64 / rate.millis_per_frame()).round() as u8;
        Self {
            hours: ((millis / 3_600_000) % 24) as u8,
            minutes: ((millis / 60_000) % 60) as u8,
            seconds: ((millis / 1000) % 60) as u8,
            frames: frames.min(rate.frames_per_second() - 1),
        }
    }
}
