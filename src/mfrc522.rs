//! # MFRC522 Card Protocol Driver
//!
//! ISO 14443-A card detection on an MFRC522 reader. One detection cycle is
//! REQA (wake) → anticollision (read the 4-byte UID and its check byte) →
//! HLTA (park the card), re-entered from idle on every poll.
//!
//! Every exchange goes through [`Mfrc522::transceive`]: flush the FIFO, load
//! the outbound frame, start the transceive command, then poll the interrupt
//! register a bounded number of times.
//!
//! Protocol failures (no answer, wrong length, bad check byte, reader error
//! register set) are all "no card this cycle" to the caller; only the
//! variants differ so they can be logged.

use crate::bus::{BusError, RegisterBus};
use crate::CardUid;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Register addresses (6-bit)
pub mod registers {
    pub const COMMAND: u8 = 0x01;
    pub const COMM_IEN: u8 = 0x02;
    pub const COMM_IRQ: u8 = 0x04;
    pub const ERROR: u8 = 0x06;
    pub const FIFO_DATA: u8 = 0x09;
    pub const FIFO_LEVEL: u8 = 0x0A;
    pub const CONTROL: u8 = 0x0C;
    pub const BIT_FRAMING: u8 = 0x0D;
    pub const MODE: u8 = 0x11;
    pub const TX_CONTROL: u8 = 0x14;
    pub const TX_ASK: u8 = 0x15;
    pub const T_MODE: u8 = 0x2A;
    pub const T_PRESCALER: u8 = 0x2B;
    pub const T_RELOAD_H: u8 = 0x2C;
    pub const T_RELOAD_L: u8 = 0x2D;
    pub const VERSION: u8 = 0x37;
}

/// Reader (PCD) commands
pub mod pcd {
    pub const IDLE: u8 = 0x00;
    pub const TRANSCEIVE: u8 = 0x0C;
    pub const SOFT_RESET: u8 = 0x0F;
}

/// Card (PICC) commands
pub mod picc {
    pub const REQIDL: u8 = 0x26;
    pub const ANTICOLL_CL1: u8 = 0x93;
    pub const HALT: u8 = 0x50;
}

/// Interrupts enabled for a transceive: Tx, Rx, Idle, HiAlert, LoAlert, Err, Timer
const TRANSCEIVE_IRQ_EN: u8 = 0x77;
/// Rx or Idle ends the wait
const TRANSCEIVE_WAIT: u8 = 0x30;
const TIMER_IRQ: u8 = 0x01;
/// BufferOvfl | CollErr | ParityErr | ProtocolErr
const ERROR_MASK: u8 = 0x1B;
const START_SEND: u8 = 0x80;
const FLUSH_FIFO: u8 = 0x80;
/// Upper bound on bytes drained from the FIFO per exchange.
pub const FIFO_DRAIN_MAX: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CardError {
    /// The reader's timer expired with no answer
    #[error("no card answered")]
    NoCard,

    #[error("reader did not finish within the poll budget")]
    Timeout,

    #[error("unexpected response length: {bits} bits")]
    BadLength { bits: u16 },

    #[error("UID check byte mismatch")]
    Checksum,

    #[error("reader error register {error_reg:#04x}")]
    Protocol { error_reg: u8 },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Bytes drained from the FIFO and the exact number of bits received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: heapless::Vec<u8, FIFO_DRAIN_MAX>,
    pub bits: u16,
}

/// Anything that can produce the UID of a card in the field.
pub trait CardReader {
    /// One complete detection cycle; the card is always parked afterwards.
    fn read_uid(&mut self) -> Result<CardUid, CardError>;
}

/// ISO 14443-A CRC (preset 0x6363), low byte first.
pub fn crc_a(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0x6363;
    for &byte in data {
        let mut ch = byte ^ (crc as u8);
        ch ^= ch << 4;
        let ch = u16::from(ch);
        crc = (crc >> 8) ^ (ch << 8) ^ (ch << 3) ^ (ch >> 4);
    }
    crc.to_le_bytes()
}

/// Validate a 5-byte anticollision answer: 4 UID bytes then their XOR.
pub fn verify_uid(frame: &[u8]) -> Result<CardUid, CardError> {
    let [a, b, c, d, bcc] = frame else {
        return Err(CardError::BadLength {
            bits: (frame.len() * 8) as u16,
        });
    };
    let uid = CardUid([*a, *b, *c, *d]);
    if uid.bcc() != *bcc {
        return Err(CardError::Checksum);
    }
    Ok(uid)
}

pub struct Mfrc522<B> {
    bus: B,
    poll_budget: u32,
}

impl<B: RegisterBus> Mfrc522<B> {
    /// `poll_budget` bounds the interrupt-register polls of one exchange.
    pub fn new(bus: B, poll_budget: u32) -> Self {
        Self {
            bus,
            poll_budget: poll_budget.max(1),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Soft reset, timer and modulation setup, antenna on.
    pub fn init(&mut self) -> Result<(), BusError> {
        self.bus.write_register(registers::COMMAND, pcd::SOFT_RESET)?;
        thread::sleep(Duration::from_millis(10));

        // Timer auto-start, ~25 ms timeout
        self.bus.write_register(registers::T_MODE, 0x8D)?;
        self.bus.write_register(registers::T_PRESCALER, 0x3E)?;
        self.bus.write_register(registers::T_RELOAD_L, 30)?;
        self.bus.write_register(registers::T_RELOAD_H, 0)?;
        // 100% ASK
        self.bus.write_register(registers::TX_ASK, 0x40)?;
        // CRC preset 0x6363
        self.bus.write_register(registers::MODE, 0x3D)?;
        self.antenna_on()
    }

    /// Chip version byte, a cheap link check.
    pub fn version(&mut self) -> Result<u8, BusError> {
        self.bus.read_register(registers::VERSION)
    }

    pub fn antenna_on(&mut self) -> Result<(), BusError> {
        let current = self.bus.read_register(registers::TX_CONTROL)?;
        if current & 0x03 != 0x03 {
            self.bus.write_register(registers::TX_CONTROL, current | 0x03)?;
        }
        Ok(())
    }

    pub fn antenna_off(&mut self) -> Result<(), BusError> {
        self.clear_bits(registers::TX_CONTROL, 0x03)
    }

    fn set_bits(&mut self, register: u8, mask: u8) -> Result<(), BusError> {
        let current = self.bus.read_register(register)?;
        self.bus.write_register(register, current | mask)
    }

    fn clear_bits(&mut self, register: u8, mask: u8) -> Result<(), BusError> {
        let current = self.bus.read_register(register)?;
        self.bus.write_register(register, current & !mask)
    }

    /// Send `frame` to the card and collect its answer.
    pub fn transceive(&mut self, frame: &[u8]) -> Result<Response, CardError> {
        self.bus
            .write_register(registers::COMM_IEN, TRANSCEIVE_IRQ_EN | 0x80)?;
        self.clear_bits(registers::COMM_IRQ, 0x80)?;
        self.set_bits(registers::FIFO_LEVEL, FLUSH_FIFO)?;
        self.bus.write_register(registers::COMMAND, pcd::IDLE)?;
        self.bus.write_burst(registers::FIFO_DATA, frame)?;
        self.bus.write_register(registers::COMMAND, pcd::TRANSCEIVE)?;
        self.set_bits(registers::BIT_FRAMING, START_SEND)?;

        let mut irq = 0;
        let mut remaining = self.poll_budget;
        while remaining > 0 {
            irq = self.bus.read_register(registers::COMM_IRQ)?;
            if irq & (TIMER_IRQ | TRANSCEIVE_WAIT) != 0 {
                break;
            }
            remaining -= 1;
        }
        self.clear_bits(registers::BIT_FRAMING, START_SEND)?;
        if remaining == 0 {
            return Err(CardError::Timeout);
        }

        let error_reg = self.bus.read_register(registers::ERROR)?;
        if error_reg & ERROR_MASK != 0 {
            return Err(CardError::Protocol { error_reg });
        }
        if irq & TRANSCEIVE_IRQ_EN & TIMER_IRQ != 0 {
            return Err(CardError::NoCard);
        }

        let level = self.bus.read_register(registers::FIFO_LEVEL)?;
        let last_bits = self.bus.read_register(registers::CONTROL)? & 0x07;
        let bits = if last_bits != 0 {
            u16::from(level.saturating_sub(1)) * 8 + u16::from(last_bits)
        } else {
            u16::from(level) * 8
        };

        let count = usize::from(level).clamp(1, FIFO_DRAIN_MAX);
        let mut buf = [0u8; FIFO_DRAIN_MAX];
        self.bus
            .read_burst(registers::FIFO_DATA, &mut buf[..count])?;
        let data = heapless::Vec::from_slice(&buf[..count]).unwrap_or_default();
        trace!(?frame, bits, "transceive complete");
        Ok(Response { data, bits })
    }

    /// REQA: wake an idle card. A present card answers with a 16-bit ATQA.
    pub fn request(&mut self) -> Result<[u8; 2], CardError> {
        self.bus.write_register(registers::BIT_FRAMING, 0x07)?;
        let response = self.transceive(&[picc::REQIDL])?;
        match response.data.as_slice() {
            [a, b, ..] if response.bits == 16 => Ok([*a, *b]),
            _ => Err(CardError::BadLength {
                bits: response.bits,
            }),
        }
    }

    /// Cascade level 1 anticollision: the UID plus its check byte.
    pub fn anticollision(&mut self) -> Result<CardUid, CardError> {
        self.bus.write_register(registers::BIT_FRAMING, 0x00)?;
        let response = self.transceive(&[picc::ANTICOLL_CL1, 0x20])?;
        if response.bits != 40 {
            return Err(CardError::BadLength {
                bits: response.bits,
            });
        }
        verify_uid(&response.data)
    }

    /// HLTA: park the selected card. Cards do not answer a halt, so the
    /// outcome is only logged.
    pub fn halt(&mut self) {
        let mut frame = [picc::HALT, 0x00, 0, 0];
        let crc = crc_a(&frame[..2]);
        frame[2..].copy_from_slice(&crc);
        if let Err(error) = self.transceive(&frame) {
            trace!(%error, "halt finished");
        }
    }
}

impl<B: RegisterBus> CardReader for Mfrc522<B> {
    fn read_uid(&mut self) -> Result<CardUid, CardError> {
        let result = self.request().and_then(|_| self.anticollision());
        self.halt();
        if let Err(error) = &result {
            if *error != CardError::NoCard {
                debug!(%error, "card read failed");
            }
        }
        result
    }
}
