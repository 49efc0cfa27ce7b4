// Copyright (c) 2023 Mike Tsao. All rights reserved.

use crate::{
    clock::{Advance, Clock, MasterClock, SlaveClock, SlaveState},
    mtc::TimeCodeGenerator,
};
use anyhow::{anyhow, bail, Result};
use log::debug;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tactus_core::{
    time::{FrameRate, Tick, END_OF_TRACK},
    traits::{EventSource, MessageSink, SynchronousControl, TransportEvent, TransportObserver},
    ParameterType, DEFAULT_BPM,
};

/// State shared between the control surface, the engine thread, and the
/// external-clock producer. Everything here is a plain atomic: the tick
/// position is written only by the engine thread and read anywhere, while
/// bpm and tempo factor are low-rate scalars where relaxed ordering is
/// plenty.
#[derive(Debug)]
pub(crate) struct SharedState {
    running: AtomicBool,
    tick_position: AtomicI64,
    bpm_bits: AtomicU64,
    tempo_factor_bits: AtomicU64,
    song_micros: AtomicU64,
}
impl Default for SharedState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            tick_position: AtomicI64::new(0),
            bpm_bits: AtomicU64::new(DEFAULT_BPM.to_bits()),
            tempo_factor_bits: AtomicU64::new(1.0f64.to_bits()),
            song_micros: AtomicU64::new(0),
        }
    }
}
impl SharedState {
    pub(crate) fn bpm(&self) -> ParameterType {
        f64::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_bpm(&self, bpm: ParameterType) {
        self.bpm_bits.store(bpm.to_bits(), Ordering::Relaxed);
    }

    fn tempo_factor(&self) -> ParameterType {
        f64::from_bits(self.tempo_factor_bits.load(Ordering::Relaxed))
    }

    fn set_tempo_factor(&self, factor: ParameterType) {
        self.tempo_factor_bits.store(factor.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn tick_position(&self) -> Tick {
        self.tick_position.load(Ordering::Relaxed)
    }

    fn set_tick_position(&self, tick: Tick) {
        self.tick_position.store(tick, Ordering::Relaxed);
    }

    fn advance_tick_position(&self, ticks: i64) -> Tick {
        self.tick_position.fetch_add(ticks, Ordering::Relaxed) + ticks
    }

    fn add_song_micros(&self, delta_micros: u64) -> u64 {
        self.song_micros.fetch_add(delta_micros, Ordering::Relaxed) + delta_micros
    }

    fn reset_position(&self) {
        self.set_tick_position(0);
        self.song_micros.store(0, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// The capability object a bound source gets for tempo adjustments. It
/// holds the shared state, not the engine, which keeps the source↔engine
/// relationship acyclic.
#[derive(Debug)]
struct TempoControl {
    state: Arc<SharedState>,
}
impl SynchronousControl for TempoControl {
    fn bpm(&self) -> ParameterType {
        self.state.bpm()
    }

    fn set_bpm(&self, bpm: ParameterType) {
        if bpm > 0.0 {
            self.state.set_bpm(bpm);
        }
    }
}

type Observers = Arc<Mutex<Vec<Box<dyn TransportObserver>>>>;

fn notify(observers: &Observers, event: TransportEvent) {
    if let Ok(mut observers) = observers.lock() {
        for observer in observers.iter_mut() {
            observer.transport_changed(event);
        }
    }
}

/// Everything the engine thread owns for one run. Constructed at play(),
/// dropped when the loop exits. The per-iteration body lives in
/// [pump()](Transport::pump) so the whole timing path can be driven with
/// synthetic intervals.
struct Transport {
    state: Arc<SharedState>,
    source: Arc<Mutex<dyn EventSource>>,
    clock: Clock,
    ticks_per_quarter: u32,
    slave: Option<Arc<SlaveState>>,
    timecode: Option<Arc<Mutex<TimeCodeGenerator>>>,
    observers: Observers,
    stop_on_empty: bool,
}
impl Transport {
    fn run(mut self) {
        let mut prev = Instant::now();
        // position the source before the first interval elapses
        self.sync();
        while self.state.is_running() {
            std::thread::sleep(Duration::from_millis(1));
            let now = Instant::now();
            let delta_micros = now.duration_since(prev).as_micros() as u64;
            prev = now;
            self.pump(delta_micros);
            if self.stop_on_empty && self.all_tracks_exhausted() {
                debug!("all tracks exhausted; stopping");
                self.state.running.store(false, Ordering::Release);
            }
        }
        self.drain();
    }

    /// One timing iteration: hand the elapsed interval to the clock, apply
    /// whatever it decided, then give the timecode generator its
    /// millisecond look.
    fn pump(&mut self, delta_micros: u64) {
        let bpm = self.state.bpm();
        let tempo_factor = self.state.tempo_factor();
        match self
            .clock
            .interval(delta_micros, bpm, tempo_factor, self.ticks_per_quarter)
        {
            Advance::None => {}
            Advance::Ticks(ticks) => {
                self.state.advance_tick_position(ticks);
                self.sync();
            }
            Advance::Jam(tick) => {
                self.state.set_tick_position(tick);
                self.sync();
            }
        }
        let millis = self.state.add_song_micros(delta_micros) / 1000;
        if let Some(timecode) = &self.timecode {
            if let Ok(mut timecode) = timecode.lock() {
                timecode.check(millis);
            }
        }
    }

    /// The source's once-per-advance hook: its sole mutation window, and
    /// its chance to reposition the engine before events are drained.
    fn sync(&mut self) {
        let Ok(mut source) = self.source.lock() else {
            return;
        };
        let mut tick = self.state.tick_position();
        let offset = source.sync(tick);
        if offset != 0 {
            tick += offset;
            self.state.set_tick_position(tick);
            if let Some(slave) = &self.slave {
                slave.republish(tick);
            }
        }
        source.play_to_tick(tick);
    }

    fn all_tracks_exhausted(&self) -> bool {
        match self.source.lock() {
            Ok(source) => source
                .tracks()
                .iter()
                .all(|track| track.next_tick() == END_OF_TRACK),
            Err(_) => false,
        }
    }

    /// The shutdown protocol. Runs on the engine thread, always, before the
    /// thread exits, so observers never see a partially drained stop.
    fn drain(&mut self) {
        if let Ok(mut source) = self.source.lock() {
            source.stopped();
        }
        notify(&self.observers, TransportEvent::Stopped);
    }
}

/// [Sequencer] drives event playback from a bound [EventSource] against an
/// internal tempo clock, or against externally supplied clock pulses, while
/// optionally generating MIDI Time Code for downstream gear.
///
/// The engine thread wakes roughly every millisecond, measures how many
/// microseconds actually elapsed, and feeds that to the active clock, so
/// scheduling jitter shifts events by at most a pump interval without ever
/// accumulating. Source callbacks run synchronously on that thread and must
/// not block.
pub struct Sequencer {
    state: Arc<SharedState>,
    source: Option<Arc<Mutex<dyn EventSource>>>,
    resolution: u32,
    clocks_per_quarter: u32,
    slave: Option<Arc<SlaveState>>,
    timecode: Option<Arc<Mutex<TimeCodeGenerator>>>,
    observers: Observers,
    stop_on_empty: bool,
    handle: Option<JoinHandle<()>>,
}
impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}
impl Sequencer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState::default()),
            source: None,
            resolution: 0,
            clocks_per_quarter: 0,
            slave: None,
            timecode: None,
            observers: Arc::new(Mutex::new(Vec::default())),
            stop_on_empty: false,
            handle: None,
        }
    }

    /// Binds a source. Resets tempo to the default, rewinds to tick zero,
    /// hands the source its tempo back-channel, and flushes anything the
    /// previous binding left sounding. Fails while running.
    pub fn set_source(&mut self, source: Arc<Mutex<dyn EventSource>>) -> Result<()> {
        self.ensure_stopped("set_source")?;
        let resolution = {
            let mut source = source
                .lock()
                .map_err(|_| anyhow!("source lock poisoned"))?;
            let resolution = source.resolution();
            if resolution == 0 {
                bail!("source {} reports zero resolution", source.name());
            }
            Self::check_divisibility(resolution, self.clocks_per_quarter)?;
            source.control(Arc::new(TempoControl {
                state: Arc::clone(&self.state),
            }));
            source.return_to_zero();
            source.stopped();
            resolution
        };
        self.resolution = resolution;
        self.state.set_bpm(DEFAULT_BPM);
        self.state.reset_position();
        self.source = Some(source);
        Ok(())
    }

    /// Selects the clock domain: zero means the internal master clock, a
    /// positive value locks to that many external pulses per quarter note.
    /// The value must divide the source's resolution evenly. Fails while
    /// running; switching domains mid-play is deliberately unsupported.
    pub fn set_clocks_per_quarter(&mut self, clocks_per_quarter: u32) -> Result<()> {
        self.ensure_stopped("set_clocks_per_quarter")?;
        if self.source.is_some() {
            Self::check_divisibility(self.resolution, clocks_per_quarter)?;
        }
        self.clocks_per_quarter = clocks_per_quarter;
        self.slave = if clocks_per_quarter > 0 {
            Some(Arc::new(SlaveState::new(
                clocks_per_quarter,
                Arc::clone(&self.state),
            )))
        } else {
            None
        };
        Ok(())
    }

    /// Starts the engine thread. Idempotent: a second play() while running
    /// is a no-op. Fails without a source.
    pub fn play(&mut self) -> Result<()> {
        self.reap();
        if self.state.is_running() {
            return Ok(());
        }
        let source = self
            .source
            .clone()
            .ok_or_else(|| anyhow!("play() without a source"))?;
        let clock = match &self.slave {
            Some(slave) => {
                let multiplier = (self.resolution / slave.clocks_per_quarter()) as i64;
                slave.prepare(multiplier, self.state.tick_position());
                Clock::Slave(SlaveClock::new(Arc::clone(slave)))
            }
            None => Clock::Master(MasterClock::default()),
        };
        self.state.running.store(true, Ordering::Release);
        let transport = Transport {
            state: Arc::clone(&self.state),
            source,
            clock,
            ticks_per_quarter: self.resolution,
            slave: self.slave.clone(),
            timecode: self.timecode.clone(),
            observers: Arc::clone(&self.observers),
            stop_on_empty: self.stop_on_empty,
        };
        // observers hear Playing before the engine thread can possibly
        // deliver Stopped (it might, immediately, with stop_on_empty)
        notify(&self.observers, TransportEvent::Playing);
        match std::thread::Builder::new()
            .name("tactus-transport".into())
            .spawn(move || transport.run())
        {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                self.state.running.store(false, Ordering::Release);
                notify(&self.observers, TransportEvent::Stopped);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Signals the engine thread and waits for it to drain. Idempotent:
    /// stopping a stopped engine is a no-op. Observers hear
    /// [TransportEvent::Stopped] only after the drain protocol has run.
    pub fn stop(&mut self) -> Result<()> {
        if self.source.is_none() {
            bail!("stop() without a source");
        }
        self.state.running.store(false, Ordering::Release);
        self.reap();
        Ok(())
    }

    /// Rewinds to tick zero and, when timecode output is configured, emits
    /// a full MTC frame at 00:00:00:00. Fails while running.
    pub fn return_to_zero(&mut self) -> Result<()> {
        self.ensure_stopped("return_to_zero")?;
        if let Some(source) = &self.source {
            source
                .lock()
                .map_err(|_| anyhow!("source lock poisoned"))?
                .return_to_zero();
        }
        self.state.reset_position();
        if let Some(timecode) = &self.timecode {
            if let Ok(mut timecode) = timecode.lock() {
                timecode.rewind();
            }
        }
        Ok(())
    }

    /// One external clock pulse. Call this from the driver delivering the
    /// external clock stream; it is safe from any thread. Ignored in master
    /// mode.
    pub fn clock(&self) {
        if let Some(slave) = &self.slave {
            slave.pulse();
        }
    }

    pub fn bpm(&self) -> ParameterType {
        self.state.bpm()
    }

    /// Writable at any time; takes effect on the engine's next interval,
    /// beginning a new constant-tempo segment.
    pub fn set_bpm(&self, bpm: ParameterType) {
        if bpm > 0.0 {
            self.state.set_bpm(bpm);
        }
    }

    pub fn tempo_factor(&self) -> ParameterType {
        self.state.tempo_factor()
    }

    /// Scales the master tempo. Ignored while slaved to an external clock.
    pub fn set_tempo_factor(&self, factor: ParameterType) {
        if factor > 0.0 {
            self.state.set_tempo_factor(factor);
        }
    }

    pub fn tick_position(&self) -> Tick {
        self.state.tick_position()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// When enabled, the engine stops itself once every track reports the
    /// end-of-track sentinel for a full pump. Takes effect at the next
    /// play(). Off by default.
    pub fn set_stop_on_empty(&mut self, enabled: bool) {
        self.stop_on_empty = enabled;
    }

    /// Routes MIDI Time Code to `sink` at `rate`. Fails on the drop-frame
    /// rate and while running.
    pub fn set_timecode_output(&mut self, rate: FrameRate, sink: Box<dyn MessageSink>) -> Result<()> {
        self.ensure_stopped("set_timecode_output")?;
        self.timecode = Some(Arc::new(Mutex::new(TimeCodeGenerator::new(rate, sink)?)));
        Ok(())
    }

    /// Changes the timecode frame rate. While running the change is
    /// deferred and the engine thread swaps it in at its next check.
    pub fn set_timecode_rate(&mut self, rate: FrameRate) -> Result<()> {
        let Some(timecode) = &self.timecode else {
            bail!("no timecode output configured");
        };
        let mut timecode = timecode
            .lock()
            .map_err(|_| anyhow!("timecode lock poisoned"))?;
        if self.state.is_running() {
            timecode.request_rate(rate)
        } else {
            timecode.set_rate(rate)
        }
    }

    pub fn clear_timecode(&mut self) -> Result<()> {
        self.ensure_stopped("clear_timecode")?;
        self.timecode = None;
        Ok(())
    }

    /// Registers an observer. Callbacks are synchronous; see
    /// [TransportEvent] for which thread delivers what.
    pub fn add_observer(&mut self, observer: Box<dyn TransportObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    fn check_divisibility(resolution: u32, clocks_per_quarter: u32) -> Result<()> {
        if clocks_per_quarter == 0 {
            return Ok(());
        }
        if resolution < clocks_per_quarter || resolution % clocks_per_quarter != 0 {
            bail!(
                "clocks-per-quarter {} does not evenly divide resolution {}",
                clocks_per_quarter,
                resolution
            );
        }
        Ok(())
    }

    fn ensure_stopped(&mut self, what: &str) -> Result<()> {
        self.reap();
        if self.state.is_running() {
            bail!("{what} is not allowed while the engine is running");
        }
        Ok(())
    }

    /// Joins an engine thread that has already been told to exit (or exited
    /// on its own via stop-on-empty).
    fn reap(&mut self) {
        if !self.state.is_running() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
impl Drop for Sequencer {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
