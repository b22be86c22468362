//! # SPI Register Transport
//!
//! Byte-level SPI and GPIO traits, and [`SpiRegisters`], the card reader's
//! register access built on them. Register frames follow the MFRC522 layout:
//! one address byte `0b R AAAAAA 0` (bit 7 set for reads, 6-bit register
//! address in bits 6..1) followed by payload bytes, all under one chip-select
//! assertion.
//!
//! Failures latch the same sticky [`BusHealth`] the I2C side uses.

use crate::bus::{BusError, BusHealth, RegisterBus};
use tracing::debug;

/// Full-duplex SPI link
pub trait SpiLink {
    /// Send `words` and overwrite them with the bytes clocked in.
    fn transfer(&mut self, words: &mut [u8]) -> Result<(), BusError>;
}

/// Trait for GPIO output pin interface
pub trait GpioPin {
    fn set_high(&mut self) -> Result<(), BusError>;
    fn set_low(&mut self) -> Result<(), BusError>;
}

/// An unwired line, e.g. a chip select the kernel SPI driver handles.
pub struct NoPin;

impl GpioPin for NoPin {
    fn set_high(&mut self) -> Result<(), BusError> {
        Ok(())
    }
    fn set_low(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

/// An optional line; `None` behaves like [`NoPin`].
impl<P: GpioPin> GpioPin for Option<P> {
    fn set_high(&mut self) -> Result<(), BusError> {
        self.as_mut().map_or(Ok(()), |pin| pin.set_high())
    }
    fn set_low(&mut self) -> Result<(), BusError> {
        self.as_mut().map_or(Ok(()), |pin| pin.set_low())
    }
}

const READ: u8 = 0x80;

fn address_byte(register: u8) -> u8 {
    (register << 1) & 0x7E
}

/// Register access to an SPI peripheral with an optional GPIO chip select.
pub struct SpiRegisters<SPI, CS> {
    spi: SPI,
    cs: CS,
    health: BusHealth,
}

impl<SPI, CS> SpiRegisters<SPI, CS>
where
    SPI: SpiLink,
    CS: GpioPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self {
            spi,
            cs,
            health: BusHealth::default(),
        }
    }

    /// Run one chip-select framed transfer, latching any failure.
    fn frame(&mut self, words: &mut [u8]) -> Result<(), BusError> {
        let result = self
            .cs
            .set_low()
            .and_then(|_| self.spi.transfer(words));
        let released = self.cs.set_high();
        let result = result.and(released);
        if let Err(error) = &result {
            debug!(%error, "SPI frame failed");
            self.health.record(error);
        }
        result
    }
}

impl<SPI, CS> RegisterBus for SpiRegisters<SPI, CS>
where
    SPI: SpiLink,
    CS: GpioPin,
{
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        self.write_burst(register, &[value])
    }

    fn read_register(&mut self, register: u8) -> Result<u8, BusError> {
        let mut words = [address_byte(register) | READ, 0];
        self.frame(&mut words)?;
        Ok(words[1])
    }

    /// Reads the same register `buf.len()` times in one frame, which is how
    /// the reader's FIFO is drained.
    fn read_burst(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut words = vec![address_byte(register) | READ; buf.len()];
        words.push(0);
        self.frame(&mut words)?;
        buf.copy_from_slice(&words[1..]);
        Ok(())
    }

    /// Writes every byte to the same register in one frame (FIFO fill).
    fn write_burst(&mut self, register: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.health.guard_write()?;
        let mut words = Vec::with_capacity(bytes.len() + 1);
        words.push(address_byte(register));
        words.extend_from_slice(bytes);
        self.frame(&mut words)
    }

    fn health(&self) -> &BusHealth {
        &self.health
    }

    fn clear_fault(&mut self) {
        self.health.clear();
    }
}
