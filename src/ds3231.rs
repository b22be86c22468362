//! # DS3231 Clock & Alarm Driver
//!
//! Wall-clock time and the kiosk's three alarm slots:
//! - **Alarm 1** (hardware): attendance opens, matched on hh:mm:ss every day
//! - **Alarm 2** (hardware): late threshold, matched on hh:mm every day; the
//!   seconds part is kept in memory and checked by polling
//! - **Deadline** (software only): the device has only two alarms, so the
//!   deadline is compared on every window poll instead
//!
//! The in-memory [`Schedule`] is authoritative; alarm registers are never
//! read back.
//!
//! While the bus health latch is set every operation is a no-op and
//! [`Ds3231::get_time`] keeps returning the last good reading.

use crate::bus::{BusError, RegisterBus};
use crate::window::Schedule;
use crate::{TimeOfDay, WallClock};
use tracing::{debug, warn};

/// 7-bit bus address
pub const DS3231_ADDRESS: u8 = 0x68;

/// Register addresses
pub mod registers {
    /// Seconds; followed by minutes, hours, weekday, date, month, year
    pub const TIME: u8 = 0x00;
    pub const ALARM1: u8 = 0x07;
    pub const ALARM2: u8 = 0x0B;
    pub const CONTROL: u8 = 0x0E;
    pub const STATUS: u8 = 0x0F;
}

/// Control register bits
pub mod control {
    pub const A1IE: u8 = 0x01;
    pub const A2IE: u8 = 0x02;
    pub const INTCN: u8 = 0x04;
}

/// Status register alarm-fired bits
pub mod status {
    pub const A1F: u8 = 0x01;
    pub const A2F: u8 = 0x02;
}

/// Day/date alarm byte with the mask bit set: match time of day only.
const MATCH_TIME_ONLY: u8 = 0x80;

pub fn bcd_to_bin(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

pub fn bin_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Decode the seven time registers. Control bits sharing a register with a
/// field (12/24h select, century) are masked off.
pub fn decode_time(regs: &[u8; 7]) -> WallClock {
    WallClock {
        second: bcd_to_bin(regs[0] & 0x7F),
        minute: bcd_to_bin(regs[1] & 0x7F),
        hour: bcd_to_bin(regs[2] & 0x3F),
        weekday: bcd_to_bin(regs[3] & 0x07),
        day: bcd_to_bin(regs[4] & 0x3F),
        month: bcd_to_bin(regs[5] & 0x1F),
        year: bcd_to_bin(regs[6]),
    }
}

pub fn encode_time(clock: &WallClock) -> [u8; 7] {
    [
        bin_to_bcd(clock.second),
        bin_to_bcd(clock.minute),
        bin_to_bcd(clock.hour),
        bin_to_bcd(clock.weekday),
        bin_to_bcd(clock.day),
        bin_to_bcd(clock.month),
        bin_to_bcd(clock.year),
    ]
}

/// DS3231 driver over any register bus.
pub struct Ds3231<B> {
    bus: B,
    last: WallClock,
    stale: bool,
    schedule: Schedule,
}

impl<B: RegisterBus> Ds3231<B> {
    pub fn new(bus: B, schedule: Schedule) -> Self {
        Self {
            bus,
            last: WallClock::default(),
            stale: true,
            schedule,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Current alarm slots.
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// True when the last [`get_time`](Self::get_time) could not read the device.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn guard(&self) -> Result<(), BusError> {
        self.bus.health().guard_write()
    }

    /// Read the clock in one burst; on any failure the previous reading is
    /// returned unchanged.
    pub fn get_time(&mut self) -> WallClock {
        if self.bus.health().is_faulted() {
            self.stale = true;
            return self.last;
        }
        let mut regs = [0u8; 7];
        match self.bus.read_burst(registers::TIME, &mut regs) {
            Ok(()) => {
                let clock = decode_time(&regs);
                if clock.is_valid() {
                    self.last = clock;
                    self.stale = false;
                } else {
                    warn!(?regs, "clock registers out of range, keeping last reading");
                    self.stale = true;
                }
            }
            Err(error) => {
                debug!(%error, "clock read failed, keeping last reading");
                self.stale = true;
            }
        }
        self.last
    }

    pub fn set_time(&mut self, clock: WallClock) -> Result<(), BusError> {
        self.guard()?;
        self.bus.write_burst(registers::TIME, &encode_time(&clock))?;
        self.last = clock;
        Ok(())
    }

    /// Arm alarm 1 for `time` every day and enable its interrupt.
    pub fn set_attendance_alarm(&mut self, time: TimeOfDay) -> Result<(), BusError> {
        self.schedule.attendance = time;
        self.guard()?;
        let payload = [
            bin_to_bcd(time.second),
            bin_to_bcd(time.minute),
            bin_to_bcd(time.hour),
            MATCH_TIME_ONLY,
        ];
        // Payload first so a half-applied update never enables a stale match
        self.bus.write_burst(registers::ALARM1, &payload)?;
        self.enable_interrupts(control::A1IE | control::INTCN)
    }

    /// Arm alarm 2 for `time` (hh:mm resolution) every day and enable its
    /// interrupt. The full `time`, seconds included, is kept for polling.
    pub fn set_late_alarm(&mut self, time: TimeOfDay) -> Result<(), BusError> {
        self.schedule.late = time;
        self.guard()?;
        let payload = [
            bin_to_bcd(time.minute),
            bin_to_bcd(time.hour),
            MATCH_TIME_ONLY,
        ];
        self.bus.write_burst(registers::ALARM2, &payload)?;
        self.enable_interrupts(control::A2IE | control::INTCN)
    }

    /// The deadline has no hardware alarm; it only lives in memory.
    pub fn set_deadline(&mut self, time: TimeOfDay) {
        self.schedule.deadline = time;
    }

    /// Program all three slots from `schedule`.
    pub fn apply_schedule(&mut self, schedule: Schedule) -> Result<(), BusError> {
        self.set_deadline(schedule.deadline);
        let attendance = self.set_attendance_alarm(schedule.attendance);
        let late = self.set_late_alarm(schedule.late);
        attendance.and(late)
    }

    /// Clear both alarm-fired bits, leaving the rest of the status register as
    /// is. Returns the alarm bits that were set.
    pub fn clear_alarm_flags(&mut self) -> Result<u8, BusError> {
        self.guard()?;
        let current = self.bus.read_register(registers::STATUS)?;
        let fired = current & (status::A1F | status::A2F);
        self.bus
            .write_register(registers::STATUS, current & !(status::A1F | status::A2F))?;
        Ok(fired)
    }

    fn enable_interrupts(&mut self, bits: u8) -> Result<(), BusError> {
        let current = self.bus.read_register(registers::CONTROL)?;
        self.bus.write_register(registers::CONTROL, current | bits)
    }
}
