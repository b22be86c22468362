//! # Bus Transport
//!
//! A bit-banged I2C master over two open-drain lines, plus the
//! [`RegisterBus`] contract the peripheral drivers are written against.
//!
//! ## Bounded waits
//! Every wait on a line level (bus idle before START, clock stretching,
//! acknowledge) polls at most [`RetryBudget`] times. The budget is an
//! iteration count, not a wall-clock timeout, so its real duration scales
//! with how fast the GPIO backend toggles lines.
//!
//! ## Sticky health
//! Any transport failure is latched in [`BusHealth`]. While latched, every
//! write returns [`BusError::Faulted`] without touching the lines; reads are
//! still attempted so a caller can probe the device. The latch is only
//! cleared by [`RegisterBus::clear_fault`], which the kiosk does once at
//! startup right after [`I2cBus::reset_bus`].

use std::fmt;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// The wait step that ran out of budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Both lines high before a START condition
    BusIdle,
    /// Clock released by the target after stretching
    ClockStretch,
    /// Target acknowledged its address
    AddressAck,
    /// Target acknowledged a register or payload byte
    DataAck,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::BusIdle => "bus idle",
            Stage::ClockStretch => "clock release",
            Stage::AddressAck => "address acknowledge",
            Stage::DataAck => "data acknowledge",
        };
        f.write_str(name)
    }
}

/// Transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus timeout waiting for {stage}")]
    Timeout { stage: Stage },

    /// Short-circuited by an earlier failure that has not been cleared
    #[error("bus is faulted, write suppressed")]
    Faulted,

    /// The line or device backend itself failed
    #[error("bus I/O: {0}")]
    Io(String),
}

/// Maximum number of polls for one wait step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget(u32);

impl RetryBudget {
    /// `None` for a zero budget, which could never observe a level.
    pub fn new(polls: u32) -> Option<Self> {
        (polls > 0).then_some(Self(polls))
    }

    /// Poll `ready` until it reports true, at most `polls` times.
    pub fn poll<F>(self, stage: Stage, mut ready: F) -> Result<(), BusError>
    where
        F: FnMut() -> Result<bool, BusError>,
    {
        let mut remaining = self.0;
        while remaining > 0 {
            if ready()? {
                return Ok(());
            }
            remaining -= 1;
        }
        Err(BusError::Timeout { stage })
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self(10_000)
    }
}

/// Sticky error latch shared by all operations on one bus.
#[derive(Debug, Default, Clone)]
pub struct BusHealth {
    fault: Option<BusError>,
}

impl BusHealth {
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Latch `error` unless a fault is already held; the first cause is kept.
    pub fn record(&mut self, error: &BusError) {
        if self.fault.is_none() && *error != BusError::Faulted {
            warn!(%error, "bus fault latched");
            self.fault = Some(error.clone());
        }
    }

    pub fn clear(&mut self) {
        if let Some(error) = self.fault.take() {
            debug!(%error, "bus fault cleared");
        }
    }

    /// `Err(Faulted)` while latched; used to gate every write.
    pub fn guard_write(&self) -> Result<(), BusError> {
        if self.is_faulted() {
            Err(BusError::Faulted)
        } else {
            Ok(())
        }
    }
}

/// Register-addressed access to one peripheral.
///
/// Both the clock's I2C bus and the card reader's SPI link implement this, so
/// the drivers see the same sticky-health contract on either bus.
pub trait RegisterBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError>;
    fn read_register(&mut self, register: u8) -> Result<u8, BusError>;
    /// One transaction reading `buf.len()` consecutive registers.
    fn read_burst(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError>;
    /// One transaction writing consecutive registers starting at `register`.
    fn write_burst(&mut self, register: u8, bytes: &[u8]) -> Result<(), BusError>;
    fn health(&self) -> &BusHealth;
    fn clear_fault(&mut self);
}

/// One open-drain line: either pulled low by us or released to float high.
pub trait OpenDrainPin {
    fn release(&mut self) -> Result<(), BusError>;
    fn drive_low(&mut self) -> Result<(), BusError>;
    /// The actual line level, which another device may be holding low.
    fn is_high(&mut self) -> Result<bool, BusError>;
}

/// Bit-banged I2C master bound to a single 7-bit target address.
pub struct I2cBus<SCL, SDA> {
    scl: SCL,
    sda: SDA,
    address: u8,
    budget: RetryBudget,
    half_period: Duration,
    health: BusHealth,
}

impl<SCL, SDA> I2cBus<SCL, SDA>
where
    SCL: OpenDrainPin,
    SDA: OpenDrainPin,
{
    pub fn new(
        scl: SCL,
        sda: SDA,
        address: u8,
        budget: RetryBudget,
        half_period: Duration,
    ) -> Self {
        Self {
            scl,
            sda,
            address,
            budget,
            half_period,
            health: BusHealth::default(),
        }
    }

    /// Recover a bus left mid-transaction by a failed transfer.
    ///
    /// Holds SDA low and pulses SCL `pulses` times so any target stuck
    /// shifting out a byte runs out of bits, then releases SCL followed by SDA,
    /// which is a STOP condition. Must run before any other bus operation.
    pub fn reset_bus(&mut self, pulses: u8) -> Result<(), BusError> {
        debug!(pulses, "resetting I2C bus");
        let result = self.clock_out_recovery(pulses);
        if let Err(error) = &result {
            self.health.record(error);
        }
        result
    }

    fn clock_out_recovery(&mut self, pulses: u8) -> Result<(), BusError> {
        self.sda.drive_low()?;
        for _ in 0..pulses {
            self.scl.drive_low()?;
            self.delay();
            self.scl.release()?;
            self.delay();
        }
        self.sda.release()?;
        self.delay();
        Ok(())
    }

    fn delay(&self) {
        if !self.half_period.is_zero() {
            thread::sleep(self.half_period);
        }
    }

    /// Release SCL and wait for it to read high (the target may stretch it).
    fn scl_high(&mut self) -> Result<(), BusError> {
        self.scl.release()?;
        let scl = &mut self.scl;
        self.budget.poll(Stage::ClockStretch, || scl.is_high())
    }

    fn start(&mut self) -> Result<(), BusError> {
        self.sda.release()?;
        self.scl.release()?;
        let (scl, sda) = (&mut self.scl, &mut self.sda);
        self.budget
            .poll(Stage::BusIdle, || Ok(scl.is_high()? && sda.is_high()?))?;
        self.delay();
        self.sda.drive_low()?;
        self.delay();
        self.scl.drive_low()?;
        self.delay();
        Ok(())
    }

    fn repeated_start(&mut self) -> Result<(), BusError> {
        self.sda.release()?;
        self.delay();
        self.scl_high()?;
        self.delay();
        self.sda.drive_low()?;
        self.delay();
        self.scl.drive_low()?;
        self.delay();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BusError> {
        self.sda.drive_low()?;
        self.delay();
        self.scl_high()?;
        self.delay();
        self.sda.release()?;
        self.delay();
        Ok(())
    }

    fn write_bit(&mut self, bit: bool) -> Result<(), BusError> {
        if bit {
            self.sda.release()?;
        } else {
            self.sda.drive_low()?;
        }
        self.delay();
        self.scl_high()?;
        self.delay();
        self.scl.drive_low()
    }

    fn read_bit(&mut self) -> Result<bool, BusError> {
        self.sda.release()?;
        self.delay();
        self.scl_high()?;
        let bit = self.sda.is_high()?;
        self.delay();
        self.scl.drive_low()?;
        Ok(bit)
    }

    /// Shift out one byte MSB first and wait for the target to pull SDA low.
    fn write_byte(&mut self, byte: u8, ack_stage: Stage) -> Result<(), BusError> {
        for bit in (0..8).rev() {
            self.write_bit(byte & (1 << bit) != 0)?;
        }
        self.sda.release()?;
        self.delay();
        self.scl_high()?;
        let sda = &mut self.sda;
        self.budget.poll(ack_stage, || Ok(!sda.is_high()?))?;
        self.delay();
        self.scl.drive_low()
    }

    /// Shift in one byte; `ack == false` withholds the acknowledge to end the read.
    fn read_byte(&mut self, ack: bool) -> Result<u8, BusError> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte << 1) | u8::from(self.read_bit()?);
        }
        self.write_bit(!ack)?;
        Ok(byte)
    }

    /// Frame `body` as START .. STOP, latching any failure.
    fn transaction<T, F>(&mut self, is_write: bool, body: F) -> Result<T, BusError>
    where
        F: FnOnce(&mut Self) -> Result<T, BusError>,
    {
        if is_write {
            self.health.guard_write()?;
        }
        let result = self.start().and_then(|_| body(self));
        match result {
            Ok(value) => {
                if let Err(error) = self.stop() {
                    self.health.record(&error);
                    return Err(error);
                }
                Ok(value)
            }
            Err(error) => {
                debug!(%error, address = self.address, "I2C transaction aborted");
                self.health.record(&error);
                // Best effort; a stuck bus will not take the STOP either
                let _ = self.stop();
                Err(error)
            }
        }
    }
}

impl<SCL, SDA> RegisterBus for I2cBus<SCL, SDA>
where
    SCL: OpenDrainPin,
    SDA: OpenDrainPin,
{
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        self.write_burst(register, &[value])
    }

    fn read_register(&mut self, register: u8) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read_burst(register, &mut buf)?;
        Ok(buf[0])
    }

    fn read_burst(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        if buf.is_empty() {
            return Ok(());
        }
        let address = self.address;
        self.transaction(false, |bus| {
            bus.write_byte(address << 1, Stage::AddressAck)?;
            bus.write_byte(register, Stage::DataAck)?;
            bus.repeated_start()?;
            bus.write_byte((address << 1) | 1, Stage::AddressAck)?;
            let last = buf.len() - 1;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = bus.read_byte(i != last)?;
            }
            Ok(())
        })
    }

    fn write_burst(&mut self, register: u8, bytes: &[u8]) -> Result<(), BusError> {
        let address = self.address;
        self.transaction(true, |bus| {
            bus.write_byte(address << 1, Stage::AddressAck)?;
            bus.write_byte(register, Stage::DataAck)?;
            for &byte in bytes {
                bus.write_byte(byte, Stage::DataAck)?;
            }
            Ok(())
        })
    }

    fn health(&self) -> &BusHealth {
        &self.health
    }

    fn clear_fault(&mut self) {
        self.health.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ADDRESS: u8 = 0x68;

    #[derive(Clone, Copy, PartialEq)]
    enum Phase {
        Idle,
        Receiving,
        AckOut,
        Transmitting,
        AckIn,
    }

    /// A register-file I2C target reacting to line edges.
    struct Target {
        regs: [u8; 32],
        pointer: u8,
        phase: Phase,
        shift: u8,
        bits: u8,
        byte_index: usize,
        read_mode: bool,
        sending: u8,
        master_acked: bool,
        drive_low: bool,
    }

    impl Target {
        fn new() -> Self {
            Self {
                regs: [0; 32],
                pointer: 0,
                phase: Phase::Idle,
                shift: 0,
                bits: 0,
                byte_index: 0,
                read_mode: false,
                sending: 0,
                master_acked: false,
                drive_low: false,
            }
        }

        fn load_next(&mut self) {
            self.sending = self.regs[self.pointer as usize % 32];
            self.pointer = self.pointer.wrapping_add(1);
            self.bits = 0;
            self.phase = Phase::Transmitting;
            self.drive_low = self.sending & 0x80 == 0;
        }

        fn start(&mut self) {
            self.phase = Phase::Receiving;
            self.shift = 0;
            self.bits = 0;
            self.byte_index = 0;
            self.drive_low = false;
        }

        fn stop(&mut self) {
            self.phase = Phase::Idle;
            self.drive_low = false;
        }

        fn scl_rise(&mut self, sda: bool) {
            match self.phase {
                Phase::Receiving => {
                    self.shift = (self.shift << 1) | u8::from(sda);
                    self.bits += 1;
                }
                Phase::AckIn => self.master_acked = !sda,
                _ => {}
            }
        }

        fn scl_fall(&mut self) {
            match self.phase {
                Phase::Receiving if self.bits == 8 => {
                    let byte = self.shift;
                    if self.byte_index == 0 {
                        if byte >> 1 != ADDRESS {
                            self.phase = Phase::Idle;
                            return;
                        }
                        self.read_mode = byte & 1 == 1;
                    } else if self.byte_index == 1 {
                        self.pointer = byte;
                    } else {
                        self.regs[self.pointer as usize % 32] = byte;
                        self.pointer = self.pointer.wrapping_add(1);
                    }
                    self.drive_low = true;
                    self.phase = Phase::AckOut;
                }
                Phase::AckOut => {
                    self.drive_low = false;
                    self.byte_index += 1;
                    if self.read_mode {
                        self.load_next();
                    } else {
                        self.phase = Phase::Receiving;
                        self.shift = 0;
                        self.bits = 0;
                    }
                }
                Phase::Transmitting => {
                    self.bits += 1;
                    if self.bits == 8 {
                        self.drive_low = false;
                        self.phase = Phase::AckIn;
                    } else {
                        self.drive_low = self.sending & (0x80 >> self.bits) == 0;
                    }
                }
                Phase::AckIn => {
                    if self.master_acked {
                        self.load_next();
                    } else {
                        self.stop();
                    }
                }
                _ => {}
            }
        }
    }

    #[derive(Default)]
    struct Wire {
        master_scl_low: bool,
        master_sda_low: bool,
        scl_stuck_low: bool,
        target: Option<Target>,
        pulses_with_sda_low: usize,
    }

    impl Wire {
        fn scl(&self) -> bool {
            !(self.master_scl_low || self.scl_stuck_low)
        }

        fn sda(&self) -> bool {
            let target_low = self.target.as_ref().is_some_and(|t| t.drive_low);
            !(self.master_sda_low || target_low)
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Line {
        Scl,
        Sda,
    }

    struct SimPin {
        wire: Rc<RefCell<Wire>>,
        line: Line,
    }

    impl SimPin {
        fn set_low(&mut self, low: bool) {
            let mut wire = self.wire.borrow_mut();
            let (scl0, sda0) = (wire.scl(), wire.sda());
            match self.line {
                Line::Scl => wire.master_scl_low = low,
                Line::Sda => wire.master_sda_low = low,
            }
            let (scl1, sda1) = (wire.scl(), wire.sda());
            if !scl0 && scl1 && wire.master_sda_low {
                wire.pulses_with_sda_low += 1;
            }
            let Some(target) = wire.target.as_mut() else {
                return;
            };
            if scl0 && scl1 && sda0 && !sda1 {
                target.start();
            } else if scl0 && scl1 && !sda0 && sda1 {
                target.stop();
            } else if !scl0 && scl1 {
                target.scl_rise(sda1);
            } else if scl0 && !scl1 {
                target.scl_fall();
            }
        }
    }

    impl OpenDrainPin for SimPin {
        fn release(&mut self) -> Result<(), BusError> {
            self.set_low(false);
            Ok(())
        }

        fn drive_low(&mut self) -> Result<(), BusError> {
            self.set_low(true);
            Ok(())
        }

        fn is_high(&mut self) -> Result<bool, BusError> {
            let wire = self.wire.borrow();
            Ok(match self.line {
                Line::Scl => wire.scl(),
                Line::Sda => wire.sda(),
            })
        }
    }

    fn bus_on(wire: &Rc<RefCell<Wire>>) -> I2cBus<SimPin, SimPin> {
        let scl = SimPin {
            wire: Rc::clone(wire),
            line: Line::Scl,
        };
        let sda = SimPin {
            wire: Rc::clone(wire),
            line: Line::Sda,
        };
        I2cBus::new(
            scl,
            sda,
            ADDRESS,
            RetryBudget::new(50).unwrap(),
            Duration::ZERO,
        )
    }

    fn wire_with_target() -> Rc<RefCell<Wire>> {
        Rc::new(RefCell::new(Wire {
            target: Some(Target::new()),
            ..Wire::default()
        }))
    }

    #[test]
    fn burst_write_then_burst_read_reaches_target_registers() {
        let wire = wire_with_target();
        let mut bus = bus_on(&wire);

        bus.write_burst(0x07, &[0x15, 0x30, 0x09, 0x80]).unwrap();
        let written = wire.borrow().target.as_ref().unwrap().regs[0x07..0x0B].to_vec();
        assert_eq!(written, vec![0x15, 0x30, 0x09, 0x80]);

        let mut buf = [0u8; 4];
        bus.read_burst(0x07, &mut buf).unwrap();
        assert_eq!(buf, [0x15, 0x30, 0x09, 0x80]);

        bus.write_register(0x0E, 0x05).unwrap();
        assert_eq!(bus.read_register(0x0E).unwrap(), 0x05);
        assert!(!bus.health().is_faulted());

        // Both lines are left released after each STOP
        let w = wire.borrow();
        assert!(w.scl() && w.sda());
    }

    #[test]
    fn absent_device_times_out_on_address_ack_and_latches() {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let mut bus = bus_on(&wire);

        let err = bus.read_register(0x00).unwrap_err();
        assert_eq!(
            err,
            BusError::Timeout {
                stage: Stage::AddressAck
            }
        );
        assert!(bus.health().is_faulted());
    }

    #[test]
    fn faulted_bus_suppresses_writes_but_still_attempts_reads() {
        let wire = wire_with_target();
        let mut bus = bus_on(&wire);

        wire.borrow_mut().scl_stuck_low = true;
        assert_eq!(
            bus.read_register(0x00).unwrap_err(),
            BusError::Timeout {
                stage: Stage::BusIdle
            }
        );
        wire.borrow_mut().scl_stuck_low = false;

        // Writes never reach the wire while the latch is held
        assert_eq!(bus.write_register(0x0E, 0xAA), Err(BusError::Faulted));
        assert_eq!(wire.borrow().target.as_ref().unwrap().regs[0x0E], 0x00);

        // Reads still go out as recovery probes
        wire.borrow_mut().target.as_mut().unwrap().regs[0x0F] = 0x88;
        assert_eq!(bus.read_register(0x0F).unwrap(), 0x88);
        assert!(bus.health().is_faulted());

        bus.clear_fault();
        bus.write_register(0x0E, 0xAA).unwrap();
        assert_eq!(wire.borrow().target.as_ref().unwrap().regs[0x0E], 0xAA);
    }

    #[test]
    fn reset_pulses_clock_with_data_held_low_then_releases() {
        let wire = Rc::new(RefCell::new(Wire {
            master_scl_low: true,
            ..Wire::default()
        }));
        let mut bus = bus_on(&wire);

        bus.reset_bus(10).unwrap();

        let w = wire.borrow();
        assert_eq!(w.pulses_with_sda_low, 10);
        assert!(w.scl() && w.sda());
    }

    #[test]
    fn retry_budget_counts_polls() {
        let mut polls = 0;
        let budget = RetryBudget::new(3).unwrap();
        let result = budget.poll(Stage::DataAck, || {
            polls += 1;
            Ok(false)
        });
        assert_eq!(
            result,
            Err(BusError::Timeout {
                stage: Stage::DataAck
            })
        );
        assert_eq!(polls, 3);
        assert!(RetryBudget::new(0).is_none());
    }
}
