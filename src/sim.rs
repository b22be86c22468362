//! # Simulated Devices
//!
//! Stand-ins for the clock device and the card field so the whole kiosk can
//! run with `--simulate` on any host, and so loop-level tests stay
//! deterministic.
//!
//! - [`SimClock`]: shared simulated time. Either ticks in real time from a
//!   start point or stays frozen until [`SimClock::advance`] is called.
//! - [`SimulatedDs3231`]: a DS3231 register file over [`SimClock`]. Time
//!   registers read back BCD, writes to them set the clock, and alarm
//!   matches set the status flags and raise the alarm line.
//! - [`SimulatedField`]: a [`CardReader`] that presents scripted taps once
//!   the simulated time reaches them.

use crate::bus::{BusError, BusHealth, RegisterBus, Stage};
use crate::ds3231::{bcd_to_bin, control, decode_time, encode_time, registers, status};
use crate::mfrc522::{CardError, CardReader};
use crate::signal::IrqFlag;
use crate::window::crossed;
use crate::{CardUid, TimeOfDay, WallClock};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct SimTime {
    base: NaiveDateTime,
    started: Option<Instant>,
    offset: Duration,
}

/// Shared simulated time source.
#[derive(Clone)]
pub struct SimClock {
    inner: Arc<Mutex<SimTime>>,
}

impl SimClock {
    /// Ticks in real time from `start`.
    pub fn running(start: NaiveDateTime) -> Self {
        Self::build(start, Some(Instant::now()))
    }

    /// Stays at `start` until advanced.
    pub fn frozen(start: NaiveDateTime) -> Self {
        Self::build(start, None)
    }

    fn build(base: NaiveDateTime, started: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimTime {
                base,
                started,
                offset: Duration::ZERO,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimTime> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn now(&self) -> NaiveDateTime {
        let time = self.lock();
        let elapsed = time.started.map(|s| s.elapsed()).unwrap_or_default() + time.offset;
        let elapsed =
            chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        time.base + elapsed
    }

    pub fn time_of_day(&self) -> TimeOfDay {
        WallClock::from(self.now()).time_of_day()
    }

    pub fn set(&self, at: NaiveDateTime) {
        let mut time = self.lock();
        time.base = at;
        time.offset = Duration::ZERO;
        if time.started.is_some() {
            time.started = Some(Instant::now());
        }
    }

    pub fn advance(&self, by: Duration) {
        self.lock().offset += by;
    }
}

/// 2000-01-01 at `time`.
pub fn date_at(time: TimeOfDay) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|date| {
            date.and_hms_opt(
                u32::from(time.hour),
                u32::from(time.minute),
                u32::from(time.second),
            )
        })
        .unwrap_or_default()
}

fn to_datetime(clock: &WallClock) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(
        2000 + i32::from(clock.year),
        u32::from(clock.month),
        u32::from(clock.day),
    )?
    .and_hms_opt(
        u32::from(clock.hour),
        u32::from(clock.minute),
        u32::from(clock.second),
    )
}

const REGISTER_COUNT: usize = 0x13;

/// DS3231 register file driven by a [`SimClock`].
pub struct SimulatedDs3231 {
    clock: SimClock,
    regs: [u8; REGISTER_COUNT],
    last_seen: TimeOfDay,
    alarm_line: Option<Arc<IrqFlag>>,
    stalled: bool,
    health: BusHealth,
}

impl SimulatedDs3231 {
    pub fn new(clock: SimClock) -> Self {
        let last_seen = clock.time_of_day();
        Self {
            clock,
            regs: [0; REGISTER_COUNT],
            last_seen,
            alarm_line: None,
            stalled: false,
            health: BusHealth::default(),
        }
    }

    /// Raise `line` whenever an enabled alarm matches.
    pub fn with_alarm_line(mut self, line: Arc<IrqFlag>) -> Self {
        self.alarm_line = Some(line);
        self
    }

    /// Make every following transaction time out, as a held-low clock line would.
    pub fn stall(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn register(&self, register: u8) -> u8 {
        self.regs[usize::from(register)]
    }

    fn alarm1(&self) -> TimeOfDay {
        TimeOfDay {
            second: bcd_to_bin(self.regs[0x07] & 0x7F),
            minute: bcd_to_bin(self.regs[0x08] & 0x7F),
            hour: bcd_to_bin(self.regs[0x09] & 0x3F),
        }
    }

    fn alarm2(&self) -> TimeOfDay {
        TimeOfDay {
            second: 0,
            minute: bcd_to_bin(self.regs[0x0B] & 0x7F),
            hour: bcd_to_bin(self.regs[0x0C] & 0x3F),
        }
    }

    /// Bring the time registers and alarm flags up to the current instant.
    fn sync(&mut self) {
        let wall = WallClock::from(self.clock.now());
        let now = wall.time_of_day();
        self.regs[..7].copy_from_slice(&encode_time(&wall));

        let prev = self.last_seen;
        if prev == now {
            return;
        }
        self.last_seen = now;

        let enabled = self.regs[usize::from(registers::CONTROL)];
        let mut fired = 0;
        if crossed(self.alarm1(), prev, now) {
            self.regs[usize::from(registers::STATUS)] |= status::A1F;
            if enabled & control::A1IE != 0 {
                fired |= status::A1F;
            }
        }
        if crossed(self.alarm2(), prev, now) {
            self.regs[usize::from(registers::STATUS)] |= status::A2F;
            if enabled & control::A2IE != 0 {
                fired |= status::A2F;
            }
        }
        if fired != 0 && enabled & control::INTCN != 0 {
            trace!(%now, fired, "simulated alarm");
            if let Some(line) = &self.alarm_line {
                line.raise();
            }
        }
    }

    fn check(&mut self) -> Result<(), BusError> {
        if self.stalled {
            let error = BusError::Timeout {
                stage: Stage::ClockStretch,
            };
            self.health.record(&error);
            return Err(error);
        }
        Ok(())
    }

    fn store(&mut self, register: u8, bytes: &[u8]) {
        let start = usize::from(register);
        let end = (start + bytes.len()).min(REGISTER_COUNT);
        if start >= end {
            return;
        }
        self.regs[start..end].copy_from_slice(&bytes[..end - start]);
        if start < 7 {
            let mut time = [0u8; 7];
            time.copy_from_slice(&self.regs[..7]);
            match to_datetime(&decode_time(&time)) {
                Some(at) => {
                    debug!(%at, "simulated clock set");
                    self.clock.set(at);
                    self.last_seen = self.clock.time_of_day();
                }
                None => debug!(?time, "ignoring invalid simulated clock write"),
            }
        }
    }
}

impl RegisterBus for SimulatedDs3231 {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        self.write_burst(register, &[value])
    }

    fn read_register(&mut self, register: u8) -> Result<u8, BusError> {
        let mut buf = [0u8];
        self.read_burst(register, &mut buf)?;
        Ok(buf[0])
    }

    fn read_burst(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.check()?;
        self.sync();
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.regs[(usize::from(register) + i) % REGISTER_COUNT];
        }
        Ok(())
    }

    fn write_burst(&mut self, register: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.health.guard_write()?;
        self.check()?;
        self.sync();
        self.store(register, bytes);
        Ok(())
    }

    fn health(&self) -> &BusHealth {
        &self.health
    }

    fn clear_fault(&mut self) {
        self.health.clear();
    }
}

/// One scripted card tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tap {
    pub at: TimeOfDay,
    pub uid: CardUid,
}

/// Card field that presents each scripted tap once its time has come.
pub struct SimulatedField {
    clock: SimClock,
    taps: Vec<Tap>,
    next: usize,
    requests: usize,
}

impl SimulatedField {
    pub fn new(clock: SimClock, mut taps: Vec<Tap>) -> Self {
        taps.sort_by_key(|tap| tap.at);
        Self {
            clock,
            taps,
            next: 0,
            requests: 0,
        }
    }

    /// Detection cycles run so far.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// Taps not yet presented.
    pub fn remaining(&self) -> usize {
        self.taps.len() - self.next
    }
}

impl CardReader for SimulatedField {
    fn read_uid(&mut self) -> Result<CardUid, CardError> {
        self.requests += 1;
        let now = self.clock.time_of_day();
        match self.taps.get(self.next) {
            Some(tap) if tap.at <= now => {
                self.next += 1;
                Ok(tap.uid)
            }
            _ => Err(CardError::NoCard),
        }
    }
}
