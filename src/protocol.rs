//! Text protocol spoken over the two FIFOs.
//!
//! Outbound lines are newline terminated. Inbound messages may arrive split
//! across several reads and end with [`TERMINATOR`].

use std::fmt;

use crate::action::Buttons;
use crate::error::{EnvError, Result};

/// Marks the end of an inbound message.
pub const TERMINATOR: char = '!';

/// Sent in both directions to end a session.
pub const EXIT: &str = "exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Buttons to hold, tagged with the frame the command was issued at.
    Buttons { frame: u64, buttons: Buttons },
    /// First-step seed injection.
    Noop { frame: u64, seed: u64 },
    ChangeLevel(usize),
    Exit,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Buttons { frame, buttons } => {
                write!(f, "commands_{frame}#")?;
                for (i, b) in buttons.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{b}")?;
                }
                Ok(())
            }
            Command::Noop { frame, seed } => write!(f, "noop_{frame}#{seed}"),
            Command::ChangeLevel(level) => write!(f, "changelevel#{level}"),
            Command::Exit => f.write_str(EXIT),
        }
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The emulator finished processing `frame`.
    Ready { frame: u64 },
    /// Telemetry fields as `key_value` pairs.
    Data { frame: u64, fields: Vec<(String, String)> },
    /// One row of palette codes, two hex digits per pixel.
    Screen { frame: u64, row: usize, codes: String },
    Done { frame: u64 },
    /// The emulator restarted the level.
    Reset { frame: u64 },
    Exit,
}

impl Inbound {
    pub fn parse(message: &str) -> Result<Self> {
        let message = message.trim();
        if message == EXIT {
            return Ok(Inbound::Exit);
        }
        let (header, payload) = match message.split_once('#') {
            Some((h, p)) => (h, Some(p)),
            None => (message, None),
        };
        let (kind, frame) = header
            .rsplit_once('_')
            .ok_or_else(|| EnvError::Protocol(format!("missing frame in header {header:?}")))?;
        let frame: u64 = frame
            .parse()
            .map_err(|_| EnvError::Protocol(format!("bad frame number in {header:?}")))?;

        match (kind, payload) {
            ("ready", _) => Ok(Inbound::Ready { frame }),
            ("done", _) => Ok(Inbound::Done { frame }),
            ("reset", _) => Ok(Inbound::Reset { frame }),
            ("data", Some(payload)) => Ok(Inbound::Data {
                frame,
                fields: parse_fields(payload)?,
            }),
            ("screen", Some(payload)) => {
                let (row, codes) = payload
                    .split_once('|')
                    .ok_or_else(|| EnvError::Protocol("screen row without pixels".into()))?;
                let row = row
                    .parse()
                    .map_err(|_| EnvError::Protocol(format!("bad screen row {row:?}")))?;
                Ok(Inbound::Screen {
                    frame,
                    row,
                    codes: codes.to_string(),
                })
            }
            (kind, _) => Err(EnvError::Protocol(format!("unexpected message kind {kind:?}"))),
        }
    }
}

fn parse_fields(payload: &str) -> Result<Vec<(String, String)>> {
    payload
        .split('|')
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.rsplit_once('_')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| EnvError::Protocol(format!("bad telemetry field {item:?}")))
        })
        .collect()
}
