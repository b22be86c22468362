//! # Configuration Management
//!
//! This module handles loading and validating configuration from the
//! kiosk-config.toml file: the attendance schedule, the card registry, bus
//! timing budgets, GPIO/SPI wiring and the optional simulation script.
//!
//! Every section is optional in the file; missing sections and fields take
//! the built-in defaults.

use crate::pipeline::{default_entries, Registry, RegistryEntry};
use crate::sim::Tap;
use crate::window::Schedule;
use crate::TimeOfDay;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "kiosk-config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config format: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from kiosk-config.toml
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub schedule: ScheduleConfig,
    /// Known cards, first match wins
    pub registry: Vec<RegistryEntry>,
    pub bus: BusConfig,
    pub timing: TimingConfig,
    pub hardware: HardwareConfig,
    pub serial: SerialConfig,
    pub simulation: SimulationConfig,
}

/// Alarm slot defaults and the time restored by the `R` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub attendance: TimeOfDay,
    pub late: TimeOfDay,
    pub deadline: TimeOfDay,
    pub reset_time: TimeOfDay,
}

/// Bounded-wait budgets. These are iteration counts, not wall-clock
/// timeouts, so they scale with the bus clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Polls per bounded wait on the clock bus
    pub retry_budget: u32,
    /// Bit-bang half clock period in microseconds
    pub half_period_us: u64,
    /// SCL pulses of the startup bus reset
    pub reset_pulses: u8,
    /// Interrupt-register polls per card exchange
    pub card_poll_budget: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    /// How long an attendance result stays on screen
    pub dwell_ms: u64,
}

/// GPIO line offsets on `gpio_chip` and the SPI device of the reader
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub gpio_chip: String,
    pub scl_line: u32,
    pub sda_line: u32,
    /// Clock alarm output (active low, open drain)
    pub rtc_int_line: Option<u32>,
    pub spi_device: String,
    pub spi_speed_hz: u32,
    /// GPIO chip select; `None` lets the kernel driver handle it
    pub cs_line: Option<u32>,
    /// Reader IRQ line; when set, cards are polled only after it fires
    pub rfid_irq_line: Option<u32>,
    pub buzzer_line: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Command/event character device; stdin/stdout when absent
    pub device: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Card taps presented by the simulated field
    pub taps: Vec<Tap>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schedule: ScheduleConfig::default(),
            registry: default_entries(),
            bus: BusConfig::default(),
            timing: TimingConfig::default(),
            hardware: HardwareConfig::default(),
            serial: SerialConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let schedule = Schedule::default();
        ScheduleConfig {
            attendance: schedule.attendance,
            late: schedule.late,
            deadline: schedule.deadline,
            reset_time: TimeOfDay {
                hour: 8,
                minute: 59,
                second: 50,
            },
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            retry_budget: 10_000,
            half_period_us: 5,
            reset_pulses: 10,
            card_poll_budget: 2000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            poll_interval_ms: 50,
            dwell_ms: 1000,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            gpio_chip: "/dev/gpiochip0".to_string(),
            scl_line: 3,
            sda_line: 2,
            rtc_int_line: Some(17),
            spi_device: "/dev/spidev0.0".to_string(),
            spi_speed_hz: 1_000_000,
            cs_line: None,
            rfid_irq_line: None,
            buzzer_line: Some(18),
        }
    }
}

impl ScheduleConfig {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            attendance: self.attendance,
            late: self.late,
            deadline: self.deadline,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }
}

impl Config {
    /// Load configuration from kiosk-config.toml in the working directory
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from `path`.
    /// A missing file falls back to the defaults; an unreadable, unparsable
    /// or inconsistent file is an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        info!(
            path = %path.display(),
            cards = config.registry.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let schedule = self.schedule.schedule();
        if !schedule.is_ordered() {
            return Err(ConfigError::Invalid(format!(
                "schedule must satisfy attendance < late < deadline, got {} / {} / {}",
                schedule.attendance, schedule.late, schedule.deadline
            )));
        }
        if self.bus.retry_budget == 0 || self.bus.card_poll_budget == 0 {
            return Err(ConfigError::Invalid(
                "bus retry budgets must be non-zero".to_string(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.registry.clone())
    }

    /// Render as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
