//! # Attendance Window State Machine
//!
//! Turns the three scheduled times and the polled wall clock into one of
//! [`WindowState::Idle`], [`Open`](WindowState::Open),
//! [`Late`](WindowState::Late) or [`Closed`](WindowState::Closed).
//!
//! Thresholds are edge-triggered: a threshold fires when the time of day moves
//! from before it to at-or-after it between two consecutive ticks, using the
//! full hour → minute → second ordering. Ticks that see the same time as the
//! previous one (a stale clock read) change nothing. A tick that jumps over
//! several thresholds reports each crossed one, in schedule order.
//!
//! After a restart or a clock reset there is no edge to wait for, so the state
//! is recomputed from scratch with [`evaluate`].

use crate::TimeOfDay;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The three daily thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub attendance: TimeOfDay,
    pub late: TimeOfDay,
    pub deadline: TimeOfDay,
}

impl Schedule {
    /// attendance < late < deadline
    pub fn is_ordered(&self) -> bool {
        self.attendance < self.late && self.late < self.deadline
    }

    pub fn is_late(&self, now: TimeOfDay) -> bool {
        now >= self.late
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            attendance: TimeOfDay {
                hour: 9,
                minute: 0,
                second: 0,
            },
            late: TimeOfDay {
                hour: 9,
                minute: 0,
                second: 10,
            },
            deadline: TimeOfDay {
                hour: 9,
                minute: 0,
                second: 20,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Open,
    Late,
    Closed,
}

impl WindowState {
    /// Cards are read and classified only in these states.
    pub fn accepts_cards(self) -> bool {
        matches!(self, WindowState::Open | WindowState::Late)
    }

    /// Idle-screen label
    pub fn label(self) -> &'static str {
        match self {
            WindowState::Idle => "SYSTEM IDLE",
            WindowState::Open => "ATTENDANCE",
            WindowState::Late => "LATE",
            WindowState::Closed => "CLOSED",
        }
    }
}

/// A state change worth announcing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Opened,
    LateStarted,
    Closed,
    ManualOpen,
    ManualClose,
    /// State recomputed from the clock after a reset
    Restored(WindowState),
}

impl Transition {
    /// Line announced on the event channel, if any.
    pub fn event_line(self) -> Option<&'static str> {
        match self {
            Transition::Opened => Some("[ATTENDANCE OPEN]"),
            Transition::LateStarted => Some("[LATE PERIOD START]"),
            Transition::Closed => Some("[ATTENDANCE CLOSED]"),
            _ => None,
        }
    }

    /// Feedback pulse count.
    pub fn beeps(self) -> u8 {
        match self {
            Transition::Opened => 1,
            Transition::LateStarted => 2,
            Transition::Closed => 3,
            _ => 0,
        }
    }
}

/// Stateless classification of `now` against `schedule`, used on restart.
///
/// For an ordered schedule this is exactly: before attendance → Idle, before
/// late → Open, before deadline → Late, otherwise Closed.
pub fn evaluate(schedule: &Schedule, now: TimeOfDay) -> WindowState {
    if schedule.attendance <= now && now < schedule.deadline {
        if schedule.is_late(now) {
            WindowState::Late
        } else {
            WindowState::Open
        }
    } else if now >= schedule.deadline {
        WindowState::Closed
    } else {
        WindowState::Idle
    }
}

/// Whether moving from `prev` to `now` passes `threshold`, allowing for the
/// daily wrap at midnight.
pub fn crossed(threshold: TimeOfDay, prev: TimeOfDay, now: TimeOfDay) -> bool {
    if prev <= now {
        prev < threshold && threshold <= now
    } else {
        threshold > prev || threshold <= now
    }
}

#[derive(Debug)]
pub struct AttendanceWindow {
    state: WindowState,
    last_seen: Option<TimeOfDay>,
}

impl Default for AttendanceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl AttendanceWindow {
    pub fn new() -> Self {
        Self {
            state: WindowState::Idle,
            last_seen: None,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Recompute the state from the clock alone.
    pub fn restore(&mut self, schedule: &Schedule, now: TimeOfDay) -> Transition {
        self.state = evaluate(schedule, now);
        self.last_seen = Some(now);
        info!(state = ?self.state, %now, "window state restored");
        Transition::Restored(self.state)
    }

    fn open_at(&mut self, schedule: &Schedule, now: TimeOfDay) {
        self.state = if schedule.is_late(now) {
            WindowState::Late
        } else {
            WindowState::Open
        };
    }

    /// One-second cadence step. Returns the transitions crossed since the
    /// previous tick, oldest first.
    pub fn tick(&mut self, schedule: &Schedule, now: TimeOfDay) -> Vec<Transition> {
        let Some(prev) = self.last_seen.replace(now) else {
            return vec![self.restore(schedule, now)];
        };
        if prev == now {
            return Vec::new();
        }

        if self.state == WindowState::Closed && now < prev {
            debug!("day rolled over, window back to idle");
            self.state = WindowState::Idle;
        }

        let passed = |threshold| crossed(threshold, prev, now);
        let mut fired = Vec::new();
        if matches!(self.state, WindowState::Idle | WindowState::Closed)
            && passed(schedule.attendance)
        {
            self.state = WindowState::Open;
            fired.push(Transition::Opened);
            if schedule.is_late(now) && !passed(schedule.late) {
                self.state = WindowState::Late;
            }
        }
        if self.state == WindowState::Open && passed(schedule.late) {
            self.state = WindowState::Late;
            fired.push(Transition::LateStarted);
        }
        if self.state.accepts_cards() && passed(schedule.deadline) {
            self.state = WindowState::Closed;
            fired.push(Transition::Closed);
        }
        for transition in &fired {
            info!(?transition, %now, "window transition");
        }
        fired
    }

    /// The attendance alarm fired. Opens the window when `now` lies between
    /// attendance and deadline and cards are not already accepted.
    pub fn on_alarm(&mut self, schedule: &Schedule, now: TimeOfDay) -> Option<Transition> {
        let due = schedule.attendance <= now && now < schedule.deadline;
        if !due || self.state.accepts_cards() {
            return None;
        }
        self.open_at(schedule, now);
        info!(%now, "window opened by alarm");
        Some(Transition::Opened)
    }

    /// Manual override, independent of the schedule.
    pub fn toggle(&mut self, schedule: &Schedule, now: TimeOfDay) -> Transition {
        if self.state.accepts_cards() {
            self.state = WindowState::Closed;
            info!(%now, "window closed manually");
            Transition::ManualClose
        } else {
            self.open_at(schedule, now);
            info!(%now, "window opened manually");
            Transition::ManualOpen
        }
    }
}
