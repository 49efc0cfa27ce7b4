// Copyright (c) 2023 Mike Tsao. All rights reserved.

use crate::engine::SharedState;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tactus_core::{time::Tick, ParameterType};

/// First-order IIR coefficient for the slave tempo smoother.
const SMOOTHING: ParameterType = 0.25;

/// Instantaneous readings above this are transport spikes, not tempo.
const MAX_PLAUSIBLE_BPM: ParameterType = 300.0;

/// Sentinel for "no external pulse seen yet."
const NO_PULSE: u64 = u64::MAX;

/// What one timing interval decided: nothing, a whole-tick advance, or a
/// jam to an absolute position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Advance {
    None,
    Ticks(i64),
    Jam(Tick),
}

/// Fractional ticks accrued over an interval at a constant tempo.
fn ticks_for_interval(delta_micros: u64, bpm: ParameterType, ticks_per_quarter: u32) -> f64 {
    delta_micros as f64 * bpm * ticks_per_quarter as f64 / 60_000_000.0
}

/// [MasterClock] generates tempo internally. It accumulates fractional
/// ticks interval by interval and releases them as whole ticks, carrying
/// the remainder so nothing is lost between iterations.
#[derive(Debug, Default)]
pub(crate) struct MasterClock {
    delta_ticks: f64,
}
impl MasterClock {
    pub(crate) fn interval(
        &mut self,
        delta_micros: u64,
        bpm: ParameterType,
        tempo_factor: ParameterType,
        ticks_per_quarter: u32,
    ) -> Advance {
        self.delta_ticks += ticks_for_interval(delta_micros, bpm * tempo_factor, ticks_per_quarter);
        if self.delta_ticks >= 1.0 {
            let whole = self.delta_ticks.floor();
            self.delta_ticks -= whole;
            Advance::Ticks(whole as i64)
        } else {
            Advance::None
        }
    }
}

/// [SlaveState] is the cross-thread surface of the external-clock path. The
/// producer side ([pulse()](SlaveState::pulse)) runs on whatever thread
/// delivers external clock pulses; the consumer side is the engine loop.
///
/// The jam mailbox is a single-slot handoff: the producer release-stores
/// the jam tick and then the pending flag; the consumer acquire-swaps the
/// flag and, on a hit, reads the tick. A second pulse before the first is
/// consumed simply overwrites the slot: the jam is ground truth, so the
/// latest pulse wins.
#[derive(Debug)]
pub(crate) struct SlaveState {
    clocks_per_quarter: u32,
    multiplier: AtomicI64,
    jam_pending: AtomicBool,
    jam_tick: AtomicI64,
    last_tick: AtomicI64,
    last_pulse_micros: AtomicU64,
    epoch: Instant,
    state: Arc<SharedState>,
}
impl SlaveState {
    pub(crate) fn new(clocks_per_quarter: u32, state: Arc<SharedState>) -> Self {
        Self {
            clocks_per_quarter,
            multiplier: AtomicI64::new(1),
            jam_pending: AtomicBool::new(false),
            jam_tick: AtomicI64::new(0),
            last_tick: AtomicI64::new(0),
            last_pulse_micros: AtomicU64::new(NO_PULSE),
            epoch: Instant::now(),
            state,
        }
    }

    pub(crate) fn clocks_per_quarter(&self) -> u32 {
        self.clocks_per_quarter
    }

    pub(crate) fn multiplier(&self) -> i64 {
        self.multiplier.load(Ordering::Relaxed)
    }

    /// Called at play(): fixes the tick-per-pulse multiplier and forgets any
    /// stale pulse history from a previous run.
    pub(crate) fn prepare(&self, multiplier: i64, current_tick: Tick) {
        self.multiplier.store(multiplier, Ordering::Relaxed);
        self.last_tick.store(current_tick, Ordering::Relaxed);
        self.jam_pending.store(false, Ordering::Relaxed);
        self.last_pulse_micros.store(NO_PULSE, Ordering::Relaxed);
    }

    /// The engine repositioned; future jams build on the new position.
    pub(crate) fn republish(&self, tick: Tick) {
        self.last_tick.store(tick, Ordering::Relaxed);
    }

    /// One external clock pulse, producer side.
    pub(crate) fn pulse(&self) {
        self.pulse_at(self.epoch.elapsed().as_micros() as u64);
    }

    pub(crate) fn pulse_at(&self, now_micros: u64) {
        let jam = self.last_tick.load(Ordering::Relaxed) + self.multiplier();
        self.jam_tick.store(jam, Ordering::Release);
        self.jam_pending.store(true, Ordering::Release);
        self.last_tick.store(jam, Ordering::Relaxed);

        let prev_micros = self.last_pulse_micros.swap(now_micros, Ordering::Relaxed);
        if prev_micros == NO_PULSE {
            // first pulse establishes the timebase only
            return;
        }
        let delta_micros = now_micros.saturating_sub(prev_micros);
        if delta_micros == 0 {
            return;
        }
        let instantaneous_bpm =
            60_000_000.0 / (delta_micros as f64 * self.clocks_per_quarter as f64);
        if instantaneous_bpm <= MAX_PLAUSIBLE_BPM {
            self.state.set_bpm(
                SMOOTHING * instantaneous_bpm + (1.0 - SMOOTHING) * self.state.bpm(),
            );
        }
    }

    fn take_jam(&self) -> Option<Tick> {
        if self.jam_pending.swap(false, Ordering::Acquire) {
            Some(self.jam_tick.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

/// [SlaveClock] is the engine-thread side of external clocking. A pending
/// jam snaps the position to the pulse's target tick; between pulses it
/// interpolates at the smoothed tempo, but never further than
/// `multiplier - 1` ticks, so the next jam always lands at or ahead of the
/// interpolated position.
#[derive(Debug)]
pub(crate) struct SlaveClock {
    shared: Arc<SlaveState>,
    delta_ticks: f64,
    countdown: i64,
}
impl SlaveClock {
    pub(crate) fn new(shared: Arc<SlaveState>) -> Self {
        Self {
            shared,
            delta_ticks: 0.0,
            countdown: 0,
        }
    }

    pub(crate) fn interval(
        &mut self,
        delta_micros: u64,
        bpm: ParameterType,
        ticks_per_quarter: u32,
    ) -> Advance {
        if let Some(jam) = self.shared.take_jam() {
            self.delta_ticks = 0.0;
            self.countdown = self.shared.multiplier() - 1;
            return Advance::Jam(jam);
        }
        if self.countdown <= 0 {
            return Advance::None;
        }
        // tempo factor is deliberately absent here: when slaved, the pulse
        // stream is the tempo
        self.delta_ticks += ticks_for_interval(delta_micros, bpm, ticks_per_quarter);
        if self.delta_ticks >= 1.0 {
            let whole = (self.delta_ticks.floor() as i64).min(self.countdown);
            self.delta_ticks -= whole as f64;
            self.countdown -= whole;
            Advance::Ticks(whole)
        } else {
            Advance::None
        }
    }
}

/// The engine's clock, constructed at play() and dropped when the engine
/// thread exits.
#[derive(Debug)]
pub(crate) enum Clock {
    Master(MasterClock),
    Slave(SlaveClock),
}
impl Clock {
    pub(crate) fn interval(
        &mut self,
        delta_micros: u64,
        bpm: ParameterType,
        tempo_factor: ParameterType,
        ticks_per_quarter: u32,
    ) -> Advance {
        match self {
            Clock::Master(clock) => clock.interval(delta_micros, bpm, tempo_factor, ticks_per_quarter),
            Clock::Slave(clock) => clock.interval(delta_micros, bpm, ticks_per_quarter),
        }
    }
}
