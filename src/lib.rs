// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! A real-time MIDI sequencer engine.
//!
//! The [Sequencer] owns a dedicated timing thread that converts elapsed
//! wall-clock microseconds into a monotonically increasing tick position
//! across piecewise-constant tempo segments, and drains tick-ordered events
//! from a bound [EventSource](tactus_core::traits::EventSource). Tempo
//! either comes from the internal master clock or locks onto externally
//! supplied clock pulses; either way the engine can also generate MIDI Time
//! Code quarter frames for downstream synchronisation.
//!
//! What goes downstream is up to the embedder: implement
//! [MessageSink](tactus_core::traits::MessageSink) over whatever transport
//! you have and wrap it in a [MessageTarget], which keeps track of sounding
//! notes so a stop never leaves anything ringing.

pub use engine::Sequencer;
pub use mtc::TimeCodeGenerator;
pub use sequence::{EventSequence, SequenceEvent, SequenceSource, SequenceTrack};
pub use target::MessageTarget;

pub mod engine;
pub mod mtc;
pub mod sequence;
pub mod target;

pub(crate) mod clock;
