//! # Kiosk Loop
//!
//! [`Kiosk`] owns every device and state machine and advances them in one
//! cooperative [`step`](Kiosk::step), called on a fixed cadence by the binary.
//! Each step:
//!
//! 1. ends an expired result dwell and restores the idle screen
//! 2. reads the clock (a stuck bus yields the last good reading)
//! 3. consumes the alarm line, clearing the device flags before acting; only
//!    the attendance alarm can open the window
//! 4. advances the attendance window when the second has changed
//! 5. polls for a card while the window accepts them
//! 6. drains the command ring, echoing every byte
//!
//! No step error escapes: failures are logged and retried next step.

use crate::bus::RegisterBus;
use crate::command::{Command, LineAssembler, Slot};
use crate::config::Config;
use crate::ds3231::{status, Ds3231};
use crate::mfrc522::CardReader;
use crate::pipeline::{AttendanceEvent, CardPipeline, Registry};
use crate::signal::{CommandReceiver, IrqFlag};
use crate::spi::GpioPin;
use crate::window::{AttendanceWindow, Schedule, Transition, WindowState};
use crate::{TimeOfDay, WallClock};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Display and buzzer boundary.
pub trait Feedback {
    /// Idle screen: window label, current time and the three thresholds.
    fn show_idle(&mut self, state: WindowState, now: TimeOfDay, schedule: &Schedule);
    /// Result screen for one identified card.
    fn show_event(&mut self, event: &AttendanceEvent);
    fn beep(&mut self, count: u8);
}

/// Feedback through the log, with an optional buzzer pin.
pub struct Panel<P> {
    buzzer: Option<P>,
    pulse: Duration,
    shown: Option<(WindowState, TimeOfDay)>,
}

impl<P: GpioPin> Panel<P> {
    pub fn new(buzzer: Option<P>) -> Self {
        Self {
            buzzer,
            pulse: Duration::from_millis(100),
            shown: None,
        }
    }
}

impl<P: GpioPin> Feedback for Panel<P> {
    fn show_idle(&mut self, state: WindowState, now: TimeOfDay, schedule: &Schedule) {
        if self.shown == Some((state, now)) {
            return;
        }
        self.shown = Some((state, now));
        debug!(
            state = state.label(),
            %now,
            attendance = %schedule.attendance,
            late = %schedule.late,
            deadline = %schedule.deadline,
            "idle screen"
        );
    }

    fn show_event(&mut self, event: &AttendanceEvent) {
        self.shown = None;
        info!(
            name = event.identity.as_deref().unwrap_or("UNKNOWN"),
            uid = %event.uid,
            time = %event.time.hh_mm(),
            status = event.classification.label(),
            "attendance"
        );
    }

    fn beep(&mut self, count: u8) {
        let pulse = self.pulse;
        let Some(buzzer) = self.buzzer.as_mut() else {
            return;
        };
        for _ in 0..count {
            let result = buzzer.set_high().and_then(|_| {
                thread::sleep(pulse);
                buzzer.set_low()
            });
            if let Err(error) = result {
                warn!(%error, "buzzer write failed");
                return;
            }
            thread::sleep(pulse);
        }
    }
}

pub struct Kiosk<C, R, F, W> {
    rtc: Ds3231<C>,
    reader: R,
    feedback: F,
    out: W,
    window: AttendanceWindow,
    pipeline: CardPipeline,
    registry: Registry,
    assembler: LineAssembler,
    alarm: Arc<IrqFlag>,
    reader_ready: Option<Arc<IrqFlag>>,
    reset_time: TimeOfDay,
    last_time: Option<TimeOfDay>,
}

impl<C, R, F, W> Kiosk<C, R, F, W>
where
    C: RegisterBus,
    R: CardReader,
    F: Feedback,
    W: Write,
{
    /// `out` is the event/echo channel.
    pub fn new(rtc: C, reader: R, feedback: F, out: W, config: &Config) -> Self {
        Self {
            rtc: Ds3231::new(rtc, config.schedule.schedule()),
            reader,
            feedback,
            out,
            window: AttendanceWindow::new(),
            pipeline: CardPipeline::new(config.timing.dwell()),
            registry: config.registry(),
            assembler: LineAssembler::new(),
            alarm: Arc::new(IrqFlag::new()),
            reader_ready: None,
            reset_time: config.schedule.reset_time,
            last_time: None,
        }
    }

    /// Poll for cards only after `ready` has been raised.
    pub fn gate_reads_on(mut self, ready: Arc<IrqFlag>) -> Self {
        self.reader_ready = Some(ready);
        self
    }

    /// Use `line` as the clock's alarm output instead of a private flag.
    pub fn with_alarm_line(mut self, line: Arc<IrqFlag>) -> Self {
        self.alarm = line;
        self
    }

    pub fn state(&self) -> WindowState {
        self.window.state()
    }

    pub fn schedule(&self) -> Schedule {
        self.rtc.schedule()
    }

    pub fn rtc(&self) -> &Ds3231<C> {
        &self.rtc
    }

    pub fn rtc_mut(&mut self) -> &mut Ds3231<C> {
        &mut self.rtc
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn feedback(&self) -> &F {
        &self.feedback
    }

    pub fn out(&self) -> &W {
        &self.out
    }

    /// Program the clock, announce readiness and derive the window state
    /// from the current time.
    pub fn start(&mut self) {
        self.rtc.bus_mut().clear_fault();

        let mut clock = self.rtc.get_time();
        if self.rtc.is_stale() {
            let reset = WallClock::default().with_time(self.reset_time);
            warn!(reset = %self.reset_time, "clock unreadable or invalid, resetting");
            match self.rtc.set_time(reset) {
                Ok(()) => clock = reset,
                Err(error) => warn!(%error, "clock reset failed"),
            }
        }

        let schedule = self.rtc.schedule();
        if let Err(error) = self.rtc.apply_schedule(schedule) {
            warn!(%error, "programming alarms failed");
        }
        if let Err(error) = self.rtc.clear_alarm_flags() {
            warn!(%error, "clearing alarm flags failed");
        }
        self.alarm.take();

        self.write_line("System Ready");
        let now = clock.time_of_day();
        self.window.restore(&schedule, now);
        self.last_time = Some(now);
        info!(%now, state = ?self.window.state(), "kiosk started");
        self.feedback.show_idle(self.window.state(), now, &schedule);
    }

    /// One pass of the cooperative loop.
    pub fn step(&mut self, now: Instant, commands: &mut CommandReceiver<'_>) {
        let schedule = self.rtc.schedule();
        let dwell_ended = self.pipeline.finish_dwell(now);

        let time = self.rtc.get_time().time_of_day();

        if self.alarm.take() {
            match self.rtc.clear_alarm_flags() {
                Ok(fired) if fired & status::A1F != 0 => {
                    if let Some(transition) = self.window.on_alarm(&schedule, time) {
                        self.announce(transition);
                    }
                }
                Ok(fired) => debug!(fired, "alarm line without attendance alarm"),
                Err(error) => debug!(%error, "alarm flags not cleared"),
            }
        }

        let second_changed = self.last_time != Some(time);
        if second_changed {
            self.last_time = Some(time);
            for transition in self.window.tick(&schedule, time) {
                self.announce(transition);
            }
        }
        if (second_changed || dwell_ended) && !self.pipeline.is_dwelling() {
            self.feedback.show_idle(self.window.state(), time, &schedule);
        }

        if self.window.state().accepts_cards() && !self.pipeline.is_dwelling() {
            let ready = self.reader_ready.as_ref().map_or(true, |flag| flag.take());
            if ready {
                if let Some(event) = self.pipeline.poll(
                    now,
                    &mut self.reader,
                    &self.registry,
                    &schedule,
                    time,
                ) {
                    self.write_line(&event.to_string());
                    self.feedback.show_event(&event);
                    self.feedback.beep(event.classification.beeps());
                }
            }
        }

        while let Some(byte) = commands.pop() {
            self.echo(byte);
            if let Some(line) = self.assembler.push(byte) {
                self.execute(Command::parse(&line), time);
            }
        }
    }

    fn execute(&mut self, command: Command, time: TimeOfDay) {
        match command {
            Command::Toggle => {
                let schedule = self.rtc.schedule();
                let transition = self.window.toggle(&schedule, time);
                let ack = if transition == Transition::ManualOpen {
                    "ACTIVE"
                } else {
                    "DEACTIVE"
                };
                self.write_line(ack);
                self.feedback.show_idle(self.window.state(), time, &schedule);
            }
            Command::Reset => {
                let clock = self.rtc.get_time().with_time(self.reset_time);
                if let Err(error) = self.rtc.set_time(clock) {
                    warn!(%error, "clock reset failed");
                }
                // Derive the state from what the clock now reads, reset or not
                let now = self.rtc.get_time().time_of_day();
                let schedule = self.rtc.schedule();
                self.window.restore(&schedule, now);
                self.last_time = Some(now);
                self.write_line("RESET OK");
                self.feedback.show_idle(self.window.state(), now, &schedule);
            }
            Command::Set(slot, value) => {
                let result = match slot {
                    Slot::Attendance => self.rtc.set_attendance_alarm(value),
                    Slot::Late => self.rtc.set_late_alarm(value),
                    Slot::Deadline => {
                        self.rtc.set_deadline(value);
                        Ok(())
                    }
                };
                if let Err(error) = result {
                    warn!(%error, ?slot, "alarm kept in memory only");
                }
                info!(?slot, %value, "schedule updated");
                self.write_line(slot.ack());
            }
            Command::Malformed => debug!("malformed command ignored"),
            Command::Unrecognized => debug!("unrecognized command ignored"),
        }
    }

    fn announce(&mut self, transition: Transition) {
        debug!(?transition, state = ?self.window.state(), "announcing");
        if let Some(line) = transition.event_line() {
            self.write_line(line);
        }
        let beeps = transition.beeps();
        if beeps > 0 {
            self.feedback.beep(beeps);
        }
    }

    fn echo(&mut self, byte: u8) {
        if let Err(error) = self.out.write_all(&[byte]).and_then(|_| self.out.flush()) {
            debug!(%error, "echo failed");
        }
    }

    fn write_line(&mut self, line: &str) {
        let result = write!(self.out, "{line}\r\n").and_then(|_| self.out.flush());
        if let Err(error) = result {
            warn!(%error, "event channel write failed");
        }
    }
}
