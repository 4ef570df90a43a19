//! Outgoing control tokens
//!
//! The device understands three newline-terminated ASCII commands. They are
//! fire-and-forget: nothing on the stream acknowledges them, and the decoder
//! does not change state when one is sent.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use thiserror::Error;

/// A command the device accepts on its serial input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Send a single frame
    Snap,
    /// Start streaming frames continuously
    Auto,
    /// Stop continuous streaming
    Stop,
}

/// Unrecognised command name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown control command '{0}' (expected snap, auto or stop)")]
pub struct UnknownCommand(pub String);

impl ControlCommand {
    /// Wire bytes, newline included
    pub fn token(self) -> &'static [u8] {
        match self {
            Self::Snap => b"SNAP\n",
            Self::Auto => b"AUTO\n",
            Self::Stop => b"STOP\n",
        }
    }

    /// Command that flips continuous mode: `Stop` if running, `Auto` if not
    pub fn toggle_auto(running: bool) -> Self {
        if running {
            Self::Stop
        } else {
            Self::Auto
        }
    }

    /// Write the token and flush
    ///
    /// # Errors
    ///
    /// Returns the sink's I/O error.
    pub fn send<W: Write + ?Sized>(self, sink: &mut W) -> io::Result<()> {
        sink.write_all(self.token())?;
        sink.flush()?;
        log::debug!("Sent control command {}", self);
        Ok(())
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snap => "SNAP",
            Self::Auto => "AUTO",
            Self::Stop => "STOP",
        };
        f.write_str(name)
    }
}

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snap" => Ok(Self::Snap),
            "auto" => Ok(Self::Auto),
            "stop" => Ok(Self::Stop),
            _ => Err(UnknownCommand(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        assert_eq!(ControlCommand::Snap.token(), b"SNAP\n");
        assert_eq!(ControlCommand::Auto.token(), b"AUTO\n");
        assert_eq!(ControlCommand::Stop.token(), b"STOP\n");
    }

    #[test]
    fn test_send_writes_token() {
        let mut sink = Vec::new();
        ControlCommand::Snap.send(&mut sink).unwrap();
        ControlCommand::Stop.send(&mut sink).unwrap();
        assert_eq!(sink, b"SNAP\nSTOP\n");
    }

    #[test]
    fn test_toggle_auto() {
        assert_eq!(ControlCommand::toggle_auto(false), ControlCommand::Auto);
        assert_eq!(ControlCommand::toggle_auto(true), ControlCommand::Stop);
    }

    #[test]
    fn test_parse() {
        assert_eq!("snap".parse(), Ok(ControlCommand::Snap));
        assert_eq!(" AUTO\n".parse(), Ok(ControlCommand::Auto));
        assert_eq!("Stop".parse(), Ok(ControlCommand::Stop));
        assert_eq!(
            "reboot".parse::<ControlCommand>(),
            Err(UnknownCommand("reboot".to_string()))
        );
    }

    #[test]
    fn test_display_matches_token() {
        for cmd in [ControlCommand::Snap, ControlCommand::Auto, ControlCommand::Stop] {
            let line = format!("{}\n", cmd);
            assert_eq!(line.as_bytes(), cmd.token());
        }
    }

    #[test]
    fn test_send_to_failing_sink() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        assert!(ControlCommand::Auto.send(&mut Closed).is_err());
    }
}
