use serde::Serialize;

use crate::model::{Snapshot, Status};

/// Consumer of published snapshots.
///
/// Called once per genuine change. Implementations redraw everything; no
/// dirty-region information is provided.
pub trait Renderer {
    fn render(&mut self, snapshot: &Snapshot);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const RED: Self = Self(0xFF, 0x00, 0x00);
    pub const GREEN: Self = Self(0x00, 0xFF, 0x00);
    pub const BLUE: Self = Self(0x00, 0x00, 0xFF);
    pub const CYAN: Self = Self(0x00, 0xFF, 0xFF);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Line {
    pub text: String,
    pub color: Rgb,
}

impl Line {
    fn new(text: impl Into<String>, color: Rgb) -> Self {
        Self {
            text: text.into(),
            color,
        }
    }
}

/// Text content of one screen, top to bottom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub lines: Vec<Line>,
}

impl Frame {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let lines = match snapshot.status {
            Status::Idle | Status::Disconnected => vec![Line::new("Disconnected", Rgb::RED)],
            Status::Connecting => vec![Line::new("Connecting...", Rgb::BLUE)],
            Status::Unsynchronized => {
                let text = if snapshot.retry_count > 0 {
                    format!("Synchronizing({})...", snapshot.retry_count)
                } else {
                    "Synchronizing...".to_string()
                };
                vec![Line::new(text, Rgb::GREEN)]
            }
            Status::Synchronized => match snapshot.time {
                Some(time) => vec![
                    Line::new(time.format("%H:%M:%S").to_string(), Rgb::GREEN),
                    Line::new(time.format("%A").to_string(), Rgb::CYAN),
                    Line::new(time.format("%B %-d").to_string(), Rgb::BLUE),
                ],
                None => vec![Line::new("--:--:--", Rgb::GREEN)],
            },
        };
        Self { lines }
    }

    /// All lines joined with ` | `, for log output.
    pub fn summary(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
