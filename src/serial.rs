use std::io::{Read, Write};

use crate::error::Result;

pub const SERIAL_PORT: u16 = 0x3F8;

/// Byte-at-a-time bridge between guest port 0x3F8 and host stdin/stdout.
/// Synchronous and unbuffered from the guest's point of view: each OUT
/// produces exactly one flushed stdout byte, each IN blocks for exactly one
/// stdin byte. `read_byte` returning `None` means stdin hit EOF, which the
/// dispatcher treats as a clean shutdown.
pub struct SerialConsole {
    stdin: std::io::Stdin,
    stdout: std::io::Stdout,
}

impl SerialConsole {
    pub fn new() -> Self {
        Self {
            stdin: std::io::stdin(),
            stdout: std::io::stdout(),
        }
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        let mut out = self.stdout.lock();
        out.write_all(&[byte])?;
        out.flush()?;
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let mut input = self.stdin.lock();
        match input.read(&mut buf)? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        Self::new()
    }
}
