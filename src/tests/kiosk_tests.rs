//! # Kiosk Loop Tests
//!
//! Runs the full loop against the simulated clock device and card field on a
//! frozen clock advanced in 50 ms steps, and checks the outbound channel.

use kiosk_lib::config::Config;
use kiosk_lib::kiosk::{Feedback, Kiosk};
use kiosk_lib::pipeline::AttendanceEvent;
use kiosk_lib::signal::{command_channel, CommandReceiver, CommandSender, IrqFlag};
use kiosk_lib::sim::{date_at, SimClock, SimulatedDs3231, SimulatedField, Tap};
use kiosk_lib::window::{Schedule, WindowState};
use kiosk_lib::{CardUid, TimeOfDay};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STEP: Duration = Duration::from_millis(50);
const LEE: CardUid = CardUid([0x1C, 0x43, 0x6D, 0x06]);
const SEUNGWOO: CardUid = CardUid([0x9B, 0x81, 0x4D, 0x06]);
const STRANGER: CardUid = CardUid([0xDE, 0xAD, 0xBE, 0xEF]);

#[derive(Default)]
struct Recorder {
    idle: Vec<(WindowState, TimeOfDay)>,
    events: Vec<AttendanceEvent>,
    beeps: Vec<u8>,
}

impl Feedback for Recorder {
    fn show_idle(&mut self, state: WindowState, now: TimeOfDay, _schedule: &Schedule) {
        self.idle.push((state, now));
    }

    fn show_event(&mut self, event: &AttendanceEvent) {
        self.events.push(event.clone());
    }

    fn beep(&mut self, count: u8) {
        self.beeps.push(count);
    }
}

type TestKiosk = Kiosk<SimulatedDs3231, SimulatedField, Recorder, Vec<u8>>;

struct Harness {
    clock: SimClock,
    kiosk: TestKiosk,
    now: Instant,
    tx: CommandSender<'static>,
    rx: CommandReceiver<'static>,
}

fn t(s: &str) -> TimeOfDay {
    s.parse().unwrap()
}

fn tap(at: &str, uid: CardUid) -> Tap {
    Tap { at: t(at), uid }
}

impl Harness {
    fn boot_at(start: &str, taps: Vec<Tap>) -> Self {
        let config = Config::default();
        let clock = SimClock::frozen(date_at(t(start)));
        let alarm = Arc::new(IrqFlag::new());
        let rtc = SimulatedDs3231::new(clock.clone()).with_alarm_line(Arc::clone(&alarm));
        let field = SimulatedField::new(clock.clone(), taps);
        let mut kiosk = Kiosk::new(rtc, field, Recorder::default(), Vec::new(), &config)
            .with_alarm_line(alarm);
        kiosk.start();
        let (tx, rx) = command_channel();
        Self {
            clock,
            kiosk,
            now: Instant::now(),
            tx,
            rx,
        }
    }

    fn step(&mut self) {
        self.clock.advance(STEP);
        self.now += STEP;
        self.kiosk.step(self.now, &mut self.rx);
    }

    fn run_for(&mut self, duration: Duration) {
        let steps = duration.as_millis() / STEP.as_millis();
        for _ in 0..steps {
            self.step();
        }
    }

    fn send(&mut self, text: &str) {
        for &byte in text.as_bytes() {
            assert!(self.tx.push(byte));
        }
        self.kiosk.step(self.now, &mut self.rx);
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(self.kiosk.out()).into_owned()
    }

    /// Complete `\r\n` lines written so far.
    fn lines(&self) -> Vec<String> {
        self.output()
            .split("\r\n")
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[test]
fn full_attendance_window() {
    let mut h = Harness::boot_at(
        "08:59:50",
        vec![
            tap("09:00:03", LEE),
            tap("09:00:12", SEUNGWOO),
            tap("09:00:15", STRANGER),
            tap("09:00:25", LEE),
        ],
    );
    assert_eq!(h.kiosk.state(), WindowState::Idle);

    h.run_for(Duration::from_secs(40));

    assert_eq!(
        h.lines(),
        vec![
            "System Ready",
            "[ATTENDANCE OPEN]",
            "LeeNY,1C436D06,09:00,OK",
            "[LATE PERIOD START]",
            "SeungWoo,9B814D06,09:00,LATE",
            "UNKNOWN,DEADBEEF,09:00",
            "[ATTENDANCE CLOSED]",
        ]
    );
    assert_eq!(h.kiosk.state(), WindowState::Closed);
    // The tap after the deadline is never read
    assert_eq!(h.kiosk.reader().remaining(), 1);
    assert_eq!(h.kiosk.feedback().beeps, vec![1, 1, 2, 2, 3, 3]);
    assert_eq!(h.kiosk.feedback().events.len(), 3);
    let last_idle = h.kiosk.feedback().idle.last().copied();
    assert_eq!(last_idle, Some((WindowState::Closed, t("09:00:30"))));
}

#[test]
fn restart_inside_window_resumes_late() {
    let mut h = Harness::boot_at("09:00:15", vec![tap("09:00:16", LEE)]);
    assert_eq!(h.kiosk.state(), WindowState::Late);

    h.run_for(Duration::from_secs(2));

    assert_eq!(h.lines(), vec!["System Ready", "LeeNY,1C436D06,09:00,LATE"]);
}

#[test]
fn no_card_request_while_a_result_is_shown() {
    let mut h = Harness::boot_at(
        "09:00:01",
        vec![tap("09:00:02", LEE), tap("09:00:02", SEUNGWOO)],
    );

    h.run_for(Duration::from_secs(1));
    assert_eq!(h.kiosk.feedback().events.len(), 1);
    let requests = h.kiosk.reader().requests();

    // 950 ms of the 1 s dwell
    for _ in 0..19 {
        h.step();
    }
    assert_eq!(h.kiosk.reader().requests(), requests);

    h.step();
    assert_eq!(h.kiosk.reader().requests(), requests + 1);
    assert_eq!(h.kiosk.feedback().events.len(), 2);
}

#[test]
fn set_commands_update_schedule_and_alarm_registers() {
    let mut h = Harness::boot_at("08:00:00", vec![]);

    h.send("SET LATE 09:05:00\n");
    assert_eq!(h.kiosk.schedule().late, t("09:05:00"));
    assert!(h.output().ends_with("SET LATE 09:05:00\nLate Time Set\r\n"));
    let alarm2 = h.kiosk.rtc().bus();
    assert_eq!((alarm2.register(0x0B), alarm2.register(0x0C)), (0x05, 0x09));

    let before = h.output();
    h.send("SET LATE 9:5\n");
    assert_eq!(h.kiosk.schedule().late, t("09:05:00"));
    // Echo only, no acknowledgement
    assert_eq!(h.output(), format!("{before}SET LATE 9:5\n"));

    h.send("SET DEADLINE 10:00:00\rSET ATTENDANCE 08:30:00\r");
    assert_eq!(
        h.kiosk.schedule(),
        Schedule {
            attendance: t("08:30:00"),
            late: t("09:05:00"),
            deadline: t("10:00:00"),
        }
    );
    assert!(h.output().contains("Deadline Time Set\r\n"));
    assert!(h.output().contains("Attendance Time Set\r\n"));

    h.send("HELLO\n");
    assert!(h.output().ends_with("HELLO\n"));
}

#[test]
fn toggle_overrides_schedule_and_reset_rederives_it() {
    let mut h = Harness::boot_at("08:59:50", vec![]);

    h.send("S\n");
    assert_eq!(h.kiosk.state(), WindowState::Open);
    assert!(h.output().ends_with("ACTIVE\r\n"));

    h.send("S\n");
    assert_eq!(h.kiosk.state(), WindowState::Closed);
    assert!(h.output().ends_with("DEACTIVE\r\n"));

    h.clock.advance(Duration::from_secs(30 * 60));
    h.step();
    assert_eq!(h.kiosk.state(), WindowState::Closed);

    h.send("R\n");
    assert!(h.output().ends_with("RESET OK\r\n"));
    assert_eq!(h.kiosk.state(), WindowState::Idle);
    assert_eq!(h.clock.time_of_day(), t("08:59:50"));

    h.run_for(Duration::from_secs(10));
    assert_eq!(h.kiosk.state(), WindowState::Open);
    assert!(h.output().ends_with("[ATTENDANCE OPEN]\r\n"));
}

#[test]
fn stuck_clock_bus_degrades_without_stopping_the_loop() {
    let mut h = Harness::boot_at("09:00:05", vec![tap("09:00:06", LEE)]);
    assert_eq!(h.kiosk.state(), WindowState::Open);

    h.kiosk.rtc_mut().bus_mut().stall(true);
    h.run_for(Duration::from_secs(30));

    // Frozen at the last good reading, so the deadline never arrives
    assert!(h.kiosk.rtc().is_stale());
    assert_eq!(h.kiosk.state(), WindowState::Open);
    assert_eq!(h.lines(), vec!["System Ready", "LeeNY,1C436D06,09:00,OK"]);
    assert_eq!(h.kiosk.feedback().events[0].time, t("09:00:05"));

    // Writes stay blocked once the device answers again
    h.kiosk.rtc_mut().bus_mut().stall(false);
    h.send("SET ATTENDANCE 08:30:00\n");
    assert!(h.output().ends_with("Attendance Time Set\r\n"));
    assert_eq!(h.kiosk.schedule().attendance, t("08:30:00"));
    let alarm1 = h.kiosk.rtc().bus();
    assert_eq!((alarm1.register(0x08), alarm1.register(0x09)), (0x00, 0x09));
}

#[test]
fn late_alarm_does_not_open_the_window_early() {
    let mut h = Harness::boot_at("08:59:40", vec![tap("09:00:35", LEE)]);
    h.send("SET DEADLINE 09:01:00\n");
    h.send("SET LATE 09:00:50\n");
    h.send("SET ATTENDANCE 09:00:30\n");

    // Alarm 2 matches hh:mm only, so it fires at 09:00:00
    h.run_for(Duration::from_secs(25));
    assert_eq!(h.clock.time_of_day(), t("09:00:05"));
    assert_eq!(h.kiosk.state(), WindowState::Idle);
    assert!(!h.output().contains("[ATTENDANCE OPEN]"));
    assert_eq!(h.kiosk.reader().requests(), 0);

    h.run_for(Duration::from_secs(35));
    assert_eq!(h.kiosk.state(), WindowState::Open);
    assert_eq!(h.output().matches("[ATTENDANCE OPEN]").count(), 1);
    assert!(h.output().ends_with("LeeNY,1C436D06,09:00,OK\r\n"));
}

#[test]
fn reset_on_a_stuck_bus_keeps_the_window_it_can_see() {
    let mut h = Harness::boot_at("09:00:05", vec![]);
    assert_eq!(h.kiosk.state(), WindowState::Open);

    h.kiosk.rtc_mut().bus_mut().stall(true);
    h.send("R\n");
    assert!(h.output().ends_with("RESET OK\r\n"));
    assert_eq!(h.kiosk.state(), WindowState::Open);

    h.run_for(Duration::from_secs(2));
    assert_eq!(h.kiosk.state(), WindowState::Open);
    assert_eq!(h.lines(), vec!["System Ready", "R\nRESET OK"]);
}

#[test]
fn stalled_loop_catches_up_on_every_missed_threshold() {
    let mut h = Harness::boot_at("08:59:59", vec![]);

    h.clock.advance(Duration::from_secs(26));
    h.step();

    assert_eq!(h.kiosk.state(), WindowState::Closed);
    assert_eq!(
        h.lines(),
        vec![
            "System Ready",
            "[ATTENDANCE OPEN]",
            "[LATE PERIOD START]",
            "[ATTENDANCE CLOSED]",
        ]
    );
    assert_eq!(h.kiosk.feedback().beeps, vec![1, 2, 3]);
}
