//! # Card Identification Pipeline
//!
//! Turns a card read into an [`AttendanceEvent`]: registry lookup, on-time /
//! late classification, and the dwell that keeps one identification in
//! flight at a time.

use crate::mfrc522::{CardError, CardReader};
use crate::window::Schedule;
use crate::{CardUid, TimeOfDay};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One registered card holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub uid: CardUid,
    pub name: String,
}

impl RegistryEntry {
    pub fn new(uid: [u8; 4], name: &str) -> Self {
        Self {
            uid: CardUid(uid),
            name: name.to_string(),
        }
    }
}

/// Ordered table of known cards. The first matching entry wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, uid: CardUid) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.uid == uid)
            .map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(default_entries())
    }
}

/// Built-in cards.
pub fn default_entries() -> Vec<RegistryEntry> {
    vec![
        RegistryEntry::new([0x1C, 0x43, 0x6D, 0x06], "LeeNY"),
        RegistryEntry::new([0x9B, 0x81, 0x4D, 0x06], "SeungWoo"),
        RegistryEntry::new([0xC9, 0xD4, 0x6B, 0x06], "Andrea"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Ok,
    Late,
    Unknown,
}

impl Classification {
    pub fn label(self) -> &'static str {
        match self {
            Classification::Ok => "OK",
            Classification::Late => "LATE",
            Classification::Unknown => "UNKNOWN",
        }
    }

    /// Feedback pulse count.
    pub fn beeps(self) -> u8 {
        match self {
            Classification::Ok => 1,
            Classification::Late => 2,
            Classification::Unknown => 3,
        }
    }
}

/// One identified tap.
///
/// `Display` renders the event line without its `\r\n` terminator:
/// `name,UIDHEX,hh:mm,STATUS` or `UNKNOWN,UIDHEX,hh:mm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEvent {
    pub identity: Option<String>,
    pub uid: CardUid,
    pub time: TimeOfDay,
    pub classification: Classification,
}

impl AttendanceEvent {
    /// Look `uid` up and classify the tap at `now`.
    pub fn classify(
        registry: &Registry,
        schedule: &Schedule,
        uid: CardUid,
        now: TimeOfDay,
    ) -> Self {
        let identity = registry.lookup(uid).map(str::to_string);
        let classification = match identity {
            None => Classification::Unknown,
            Some(_) if schedule.is_late(now) => Classification::Late,
            Some(_) => Classification::Ok,
        };
        Self {
            identity,
            uid,
            time: now,
            classification,
        }
    }
}

impl fmt::Display for AttendanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(name) => write!(
                f,
                "{},{},{},{}",
                name,
                self.uid,
                self.time.hh_mm(),
                self.classification.label()
            ),
            None => write!(f, "UNKNOWN,{},{}", self.uid, self.time.hh_mm()),
        }
    }
}

/// Reads cards and enforces the post-event dwell.
pub struct CardPipeline {
    dwell: Duration,
    dwell_until: Option<Instant>,
}

impl CardPipeline {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            dwell_until: None,
        }
    }

    /// True while an event's feedback is still being shown.
    pub fn is_dwelling(&self) -> bool {
        self.dwell_until.is_some()
    }

    /// Ends an expired dwell. Returns true exactly once per dwell, when the
    /// idle display should come back.
    pub fn finish_dwell(&mut self, now: Instant) -> bool {
        match self.dwell_until {
            Some(until) if now >= until => {
                self.dwell_until = None;
                true
            }
            _ => false,
        }
    }

    /// Attempt one identification. The reader is not touched during a dwell.
    pub fn poll<R: CardReader>(
        &mut self,
        now: Instant,
        reader: &mut R,
        registry: &Registry,
        schedule: &Schedule,
        time: TimeOfDay,
    ) -> Option<AttendanceEvent> {
        if self.is_dwelling() {
            return None;
        }
        let uid = match reader.read_uid() {
            Ok(uid) => uid,
            Err(CardError::NoCard) => return None,
            Err(error) => {
                debug!(%error, "no card this cycle");
                return None;
            }
        };

        let event = AttendanceEvent::classify(registry, schedule, uid, time);
        info!(
            uid = %event.uid,
            status = event.classification.label(),
            "card identified"
        );
        self.dwell_until = Some(now + self.dwell);
        Some(event)
    }
}
