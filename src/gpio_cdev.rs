//! GPIO character-device lines for the kiosk wiring.
//!
//! - [`CdevOutputPin`]: push-pull output (chip select, buzzer)
//! - [`CdevOpenDrainPin`]: open-drain emulation for the bit-banged clock bus.
//!   Releasing re-requests the line as an input so the pull-up takes it high;
//!   driving low re-requests it as an output at 0.
//! - [`watch_falling_edges`]: a thread that raises an [`IrqFlag`] on every
//!   falling edge of an active-low interrupt line.

use kiosk_lib::bus::{BusError, OpenDrainPin};
use kiosk_lib::signal::IrqFlag;
use kiosk_lib::spi::GpioPin;
use linux_embedded_hal::gpio_cdev::{Chip, EventRequestFlags, Line, LineHandle, LineRequestFlags};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

const CONSUMER: &str = "attendance-kiosk";

fn io_error(e: linux_embedded_hal::gpio_cdev::Error) -> BusError {
    BusError::Io(e.to_string())
}

pub struct CdevOutputPin {
    line: LineHandle,
}

impl CdevOutputPin {
    pub fn new(chip: &mut Chip, offset: u32) -> Result<Self, BusError> {
        let line = chip
            .get_line(offset)
            .map_err(io_error)?
            .request(LineRequestFlags::OUTPUT, 0, CONSUMER)
            .map_err(io_error)?;
        Ok(Self { line })
    }
}

impl GpioPin for CdevOutputPin {
    fn set_high(&mut self) -> Result<(), BusError> {
        self.line.set_value(1).map_err(io_error)
    }
    fn set_low(&mut self) -> Result<(), BusError> {
        self.line.set_value(0).map_err(io_error)
    }
}

pub struct CdevOpenDrainPin {
    line: Line,
    handle: Option<LineHandle>,
    driven: bool,
}

impl CdevOpenDrainPin {
    /// Request `offset` released (input).
    pub fn new(chip: &mut Chip, offset: u32) -> Result<Self, BusError> {
        let line = chip.get_line(offset).map_err(io_error)?;
        let mut pin = Self {
            line,
            handle: None,
            driven: true,
        };
        pin.release()?;
        Ok(pin)
    }

    fn rerequest(&mut self, flags: LineRequestFlags) -> Result<(), BusError> {
        // The kernel refuses a second request while the old handle is open
        self.handle = None;
        self.handle = Some(self.line.request(flags, 0, CONSUMER).map_err(io_error)?);
        Ok(())
    }
}

impl OpenDrainPin for CdevOpenDrainPin {
    fn release(&mut self) -> Result<(), BusError> {
        if self.driven || self.handle.is_none() {
            self.rerequest(LineRequestFlags::INPUT)?;
            self.driven = false;
        }
        Ok(())
    }

    fn drive_low(&mut self) -> Result<(), BusError> {
        if !self.driven || self.handle.is_none() {
            self.rerequest(LineRequestFlags::OUTPUT)?;
            self.driven = true;
        }
        Ok(())
    }

    fn is_high(&mut self) -> Result<bool, BusError> {
        if self.driven {
            return Ok(false);
        }
        match &self.handle {
            Some(handle) => Ok(handle.get_value().map_err(io_error)? == 1),
            None => Err(BusError::Io("line not requested".to_string())),
        }
    }
}

/// Raise `flag` on every falling edge of `offset` until the line fails.
pub fn watch_falling_edges(
    chip: &mut Chip,
    offset: u32,
    flag: Arc<IrqFlag>,
) -> Result<thread::JoinHandle<()>, BusError> {
    let events = chip
        .get_line(offset)
        .map_err(io_error)?
        .events(
            LineRequestFlags::INPUT,
            EventRequestFlags::FALLING_EDGE,
            CONSUMER,
        )
        .map_err(io_error)?;

    thread::Builder::new()
        .name(format!("gpio-irq-{offset}"))
        .spawn(move || {
            for event in events {
                match event {
                    Ok(event) => {
                        debug!(offset, timestamp = event.timestamp(), "edge");
                        flag.raise();
                    }
                    Err(error) => {
                        warn!(offset, %error, "edge watcher stopped");
                        return;
                    }
                }
            }
        })
        .map_err(|e| BusError::Io(e.to_string()))
}
