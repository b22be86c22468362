// Kernel SPI device link for the card reader.
use kiosk_lib::bus::BusError;
use kiosk_lib::spi::SpiLink;
use linux_embedded_hal::spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

pub struct SpidevLink {
    dev: Spidev,
}

impl SpidevLink {
    pub fn open(path: &str, speed_hz: u32) -> Result<Self, BusError> {
        let mut dev = Spidev::open(path).map_err(|e| BusError::Io(e.to_string()))?;

        let opts = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz) // MFRC522 tops out at 10 MHz
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        dev.configure(&opts).map_err(|e| BusError::Io(e.to_string()))?;
        Ok(Self { dev })
    }
}

impl SpiLink for SpidevLink {
    fn transfer(&mut self, words: &mut [u8]) -> Result<(), BusError> {
        let tx = words.to_vec();
        let mut transfer = SpidevTransfer::read_write(&tx, words);
        self.dev
            .transfer(&mut transfer)
            .map_err(|e| BusError::Io(e.to_string()))
    }
}
