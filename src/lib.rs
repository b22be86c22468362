//! # Attendance Kiosk Core Library
//!
//! This library provides the drivers and the scheduling logic for an unattended
//! attendance kiosk: a DS3231 real-time clock on a bit-banged I2C bus, an MFRC522
//! contactless reader on SPI, and the attendance window state machine that turns
//! clock alarms and card taps into attendance events.
//!
//! ## Design Philosophy
//!
//! ### Degrade, never halt
//! Every bus, protocol and command failure is handled where it is detected:
//! - **Transport timeouts** latch a sticky [`bus::BusHealth`] fault and degrade
//!   the clock to its last-known reading
//! - **Protocol mismatches** count as "no card this cycle"
//! - **Malformed commands** are consumed and ignored
//!
//! A stuck bus therefore shows up as a frozen clock and reads that never
//! succeed, while the kiosk loop keeps running.
//!
//! ### Single consumer
//! The main loop is the only code that touches a bus. Interrupt-like sources
//! (alarm line, reader IRQ line, serial bytes) only raise flags or enqueue bytes,
//! see [`signal`].
//!
//! ## Core Types
//!
//! - [`TimeOfDay`]: an hour/minute/second triple; the value held by every alarm slot
//! - [`WallClock`]: a full calendar reading from the clock device
//! - [`CardUid`]: the 4-byte identity of a card

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// Module declarations
pub mod bus;
pub mod command;
pub mod config;
pub mod ds3231;
pub mod kiosk;
pub mod mfrc522;
pub mod pipeline;
pub mod signal;
pub mod sim;
pub mod spi;
pub mod window;

/// A time-of-day with second resolution.
///
/// Field order matters: the derived `Ord` compares hour, then minute, then
/// second, which is the total ordering every schedule comparison relies on.
///
/// # Example
/// ```
/// use kiosk_lib::TimeOfDay;
///
/// let late: TimeOfDay = "09:05:00".parse().unwrap();
/// assert!(TimeOfDay::new(9, 4, 59).unwrap() < late);
/// assert!(TimeOfDay::new(10, 0, 0).unwrap() > late);
/// assert_eq!(late.to_string(), "09:05:00");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Rejected time-of-day text or values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("expected hh:mm:ss, got {0:?}")]
    Format(String),
    #[error("{hour:02}:{minute:02}:{second:02} is not a valid time of day")]
    Range { hour: u32, minute: u32, second: u32 },
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8, second: u8) -> Result<Self, TimeError> {
        if hour > 23 || minute > 59 || second > 59 {
            return Err(TimeError::Range {
                hour: hour.into(),
                minute: minute.into(),
                second: second.into(),
            });
        }
        Ok(Self {
            hour,
            minute,
            second,
        })
    }

    /// `hh:mm`, the resolution used on the event line.
    pub fn hh_mm(self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeError;

    /// Exactly three colon-separated decimal fields; `9:5:0` is accepted,
    /// `9:5` and `09:05:00x` are not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format_err = || TimeError::Format(s.to_string());
        let mut fields = s.trim().split(':').map(|field| {
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format_err());
            }
            field.parse::<u32>().map_err(|_| format_err())
        });

        let hour = fields.next().ok_or_else(format_err)??;
        let minute = fields.next().ok_or_else(format_err)??;
        let second = fields.next().ok_or_else(format_err)??;
        if fields.next().is_some() {
            return Err(format_err());
        }

        if hour > 23 || minute > 59 || second > 59 {
            return Err(TimeError::Range {
                hour,
                minute,
                second,
            });
        }
        Ok(Self {
            hour: hour as u8,
            minute: minute as u8,
            second: second as u8,
        })
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// One reading of the clock device, already decoded from BCD.
///
/// Ranges: second/minute 0–59, hour 0–23, weekday 1–7, day 1–31,
/// month 1–12, two-digit year 0–99.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WallClock {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub weekday: u8,
    pub day: u8,
    pub month: u8,
    pub year: u8,
}

impl WallClock {
    pub fn time_of_day(&self) -> TimeOfDay {
        TimeOfDay {
            hour: self.hour,
            minute: self.minute,
            second: self.second,
        }
    }

    /// Same calendar date, different time of day.
    pub fn with_time(self, time: TimeOfDay) -> Self {
        Self {
            hour: time.hour,
            minute: time.minute,
            second: time.second,
            ..self
        }
    }

    pub fn is_valid(&self) -> bool {
        self.second <= 59
            && self.minute <= 59
            && self.hour <= 23
            && (1..=7).contains(&self.weekday)
            && (1..=31).contains(&self.day)
            && (1..=12).contains(&self.month)
            && self.year <= 99
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self {
            second: 0,
            minute: 0,
            hour: 0,
            weekday: 1,
            day: 1,
            month: 1,
            year: 0,
        }
    }
}

impl From<NaiveDateTime> for WallClock {
    fn from(dt: NaiveDateTime) -> Self {
        Self {
            second: dt.second() as u8,
            minute: dt.minute() as u8,
            hour: dt.hour() as u8,
            weekday: dt.weekday().number_from_monday() as u8,
            day: dt.day() as u8,
            month: dt.month() as u8,
            year: dt.year().rem_euclid(100) as u8,
        }
    }
}

/// The 4-byte identity of a contactless card.
///
/// Displayed and parsed as 8 uppercase hex digits, e.g. `1C436D06`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CardUid(pub [u8; 4]);

/// Rejected UID text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("card UID must be 8 hex digits, got {0:?}")]
pub struct UidParseError(pub String);

impl CardUid {
    /// Block check character: XOR of the four identity bytes.
    pub fn bcc(&self) -> u8 {
        self.0.iter().fold(0, |acc, b| acc ^ b)
    }
}

impl fmt::Display for CardUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for CardUid {
    type Err = UidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UidParseError(s.to_string()));
        }
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| UidParseError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CardUid {
    type Error = UidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CardUid> for String {
    fn from(value: CardUid) -> Self {
        value.to_string()
    }
}
