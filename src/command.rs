//! # Command Interpreter
//!
//! Assembles bytes from the command channel into lines and parses them.
//!
//! Grammar, one command per line:
//!
//! | Line                       | Effect                                   |
//! |----------------------------|------------------------------------------|
//! | `S`                        | toggle the window open/closed            |
//! | `R`                        | reset the clock and re-derive the window |
//! | `SET ATTENDANCE hh:mm:ss`  | move the attendance-open alarm           |
//! | `SET LATE hh:mm:ss`        | move the late-threshold alarm            |
//! | `SET DEADLINE hh:mm:ss`    | move the deadline                        |
//!
//! Anything else is consumed without effect.

use crate::TimeOfDay;

/// Payload bytes kept per line; the rest of an overlong line is dropped.
pub const LINE_CAPACITY: usize = 63;

pub type Line = heapless::String<LINE_CAPACITY>;

/// Collects bytes until `\r` or `\n`.
#[derive(Default)]
pub struct LineAssembler {
    buf: Line,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns a completed, non-empty line.
    pub fn push(&mut self, byte: u8) -> Option<Line> {
        match byte {
            b'\r' | b'\n' => {
                if self.buf.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut self.buf))
                }
            }
            byte if byte.is_ascii() => {
                // Full buffer: drop until the terminator
                let _ = self.buf.push(char::from(byte));
                None
            }
            _ => None,
        }
    }

    pub fn pending(&self) -> &str {
        &self.buf
    }
}

/// The three alarm slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Attendance,
    Late,
    Deadline,
}

impl Slot {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "ATTENDANCE" => Some(Slot::Attendance),
            "LATE" => Some(Slot::Late),
            "DEADLINE" => Some(Slot::Deadline),
            _ => None,
        }
    }

    /// Acknowledgement written back after the slot is updated.
    pub fn ack(self) -> &'static str {
        match self {
            Slot::Attendance => "Attendance Time Set",
            Slot::Late => "Late Time Set",
            Slot::Deadline => "Deadline Time Set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Toggle,
    Reset,
    Set(Slot, TimeOfDay),
    /// A `SET` line whose slot or time did not parse.
    Malformed,
    Unrecognized,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "S" => return Command::Toggle,
            "R" => return Command::Reset,
            _ => {}
        }
        let Some(rest) = line.strip_prefix("SET ") else {
            return Command::Unrecognized;
        };
        let Some((keyword, value)) = rest.trim_start().split_once(' ') else {
            return Command::Malformed;
        };
        match (Slot::from_keyword(keyword), value.trim().parse::<TimeOfDay>()) {
            (Some(slot), Ok(time)) => Command::Set(slot, time),
            _ => Command::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut LineAssembler, bytes: &[u8]) -> Vec<String> {
        bytes
            .iter()
            .filter_map(|&b| assembler.push(b))
            .map(|line| line.to_string())
            .collect()
    }

    #[test]
    fn either_terminator_ends_a_line() {
        let mut assembler = LineAssembler::new();
        let lines = feed(&mut assembler, b"S\r\nR\n\r\nSET LATE 09:05:00\r");
        assert_eq!(lines, vec!["S", "R", "SET LATE 09:05:00"]);
        assert_eq!(assembler.pending(), "");
    }

    #[test]
    fn overlong_line_is_truncated() {
        let mut assembler = LineAssembler::new();
        let mut bytes = vec![b'x'; 100];
        bytes.push(b'\n');
        let lines = feed(&mut assembler, &bytes);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), LINE_CAPACITY);
    }

    #[test]
    fn parses_the_grammar() {
        assert_eq!(Command::parse("S"), Command::Toggle);
        assert_eq!(Command::parse("R"), Command::Reset);
        assert_eq!(
            Command::parse("SET LATE 09:05:00"),
            Command::Set(Slot::Late, TimeOfDay::new(9, 5, 0).unwrap())
        );
        assert_eq!(
            Command::parse("SET ATTENDANCE 08:30:15"),
            Command::Set(Slot::Attendance, TimeOfDay::new(8, 30, 15).unwrap())
        );
        assert_eq!(
            Command::parse("SET DEADLINE 10:00:00"),
            Command::Set(Slot::Deadline, TimeOfDay::new(10, 0, 0).unwrap())
        );
    }

    #[test]
    fn malformed_set_lines() {
        for line in [
            "SET LATE 9:5",
            "SET LATE 09:05",
            "SET LATE 25:00:00",
            "SET LATE 09:05:00:00",
            "SET LATE aa:bb:cc",
            "SET LUNCH 12:00:00",
            "SET LATE",
        ] {
            assert_eq!(Command::parse(line), Command::Malformed, "{line}");
        }
    }

    #[test]
    fn other_lines_are_unrecognized() {
        for line in ["s", "SS", "HELLO", "SETLATE 09:00:00"] {
            assert_eq!(Command::parse(line), Command::Unrecognized, "{line}");
        }
    }
}
