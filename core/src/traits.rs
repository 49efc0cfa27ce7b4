// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Contains the traits that connect an event source to the timing engine.

use crate::{midi::LiveEvent, time::Tick, ParameterType};
use std::{fmt::Debug, sync::Arc};

/// The tempo back-channel the engine hands to a bound [EventSource]. It is a
/// narrow capability object rather than a reference to the engine itself, so
/// a source can adjust tempo (say, on encountering a tempo event mid-track)
/// without the two ever holding each other.
///
/// Call it only from within [EventSource::sync()] or
/// [EventSource::play_to_tick()]; both run synchronously on the engine
/// thread.
pub trait SynchronousControl: Send + Sync + Debug {
    fn bpm(&self) -> ParameterType;
    fn set_bpm(&self, bpm: ParameterType);
}

/// Where outbound MIDI goes. Implementations wrap whatever is downstream
/// (a hardware port, a soft synth, a test recorder). A timestamp of zero
/// means "now."
///
/// Returning an error marks the event as rejected; callers on the real-time
/// path are expected to swallow it and keep playing.
pub trait MessageSink: Send + Debug {
    fn transport(&mut self, event: LiveEvent, at_micros: u64) -> anyhow::Result<()>;
}

/// An [EventTrack] is one voice's lazy cursor over tick-ordered events. The
/// engine only ever peeks and advances; cursor state belongs to the source.
///
/// If events are inserted behind the cursor between a
/// [next_tick()](EventTrack::next_tick) and the following
/// [play_next()](EventTrack::play_next), they surface on the next pump, so
/// implementations should anchor their cursor on what has already played
/// rather than on the event they last peeked.
pub trait EventTrack: Send + Debug {
    /// Unique within the owning source.
    fn name(&self) -> &str;

    /// The tick of the next undelivered event, or
    /// [END_OF_TRACK](crate::time::END_OF_TRACK) when exhausted. Called on
    /// every pump; must be cheap.
    fn next_tick(&self) -> Tick;

    /// Advances the cursor one event and delivers it downstream.
    /// Non-transportable events (notably tempo changes) are filtered here
    /// and become [SynchronousControl::set_bpm()] calls instead.
    fn play_next(&mut self, control: &dyn SynchronousControl);

    /// Silences the voice: balancing note-offs plus the channel-mode flush.
    /// `stop` true means a full stop (controllers reset too) rather than a
    /// mute.
    fn off(&mut self, stop: bool);
}

/// An [EventSource] is the engine's view of a piece of music: an ordered
/// collection of [EventTrack]s plus the hooks the engine calls around them.
///
/// The track list may only change inside [sync()](EventSource::sync); that
/// call is the sole mutation window the engine grants.
pub trait EventSource: Send + Debug {
    fn name(&self) -> &str;

    /// Ticks per quarter note. Positive, and immutable for the lifetime of
    /// the binding.
    fn resolution(&self) -> u32;

    /// Read-only view of the tracks, in order.
    fn tracks(&self) -> Vec<&dyn EventTrack>;

    /// The engine hands the source its tempo back-channel here, once, at
    /// binding time.
    fn control(&mut self, control: Arc<dyn SynchronousControl>);

    /// Called once per engine iteration that advances the tick, before any
    /// events are played. The return value is a signed tick delta the engine
    /// applies to its position (zero means no reposition). This is also the
    /// only moment the source may mutate itself.
    fn sync(&mut self, current_tick: Tick) -> Tick;

    /// Drains every track while its next tick is at or before `target_tick`.
    /// Ordering across tracks at equal ticks is unspecified.
    fn play_to_tick(&mut self, target_tick: Tick);

    /// Rewinds every cursor and any internal tempo-map state.
    fn return_to_zero(&mut self);

    /// Playback has stopped; propagate to all tracks so they flush.
    fn stopped(&mut self);
}

/// What the engine tells its observers. Callbacks run synchronously:
/// [Playing](TransportEvent::Playing) on whichever thread called `play()`,
/// [Stopped](TransportEvent::Stopped) on the engine thread after the drain
/// protocol has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Playing,
    Stopped,
}

pub trait TransportObserver: Send {
    fn transport_changed(&mut self, event: TransportEvent);
}
