//! The device-entropy capability driven by the broker, and its serial
//! implementation on top of [`DeviceChannel`].
//!
//! [`SerialDevice`] speaks a deliberately small command framing: a 5-byte
//! request `[code: u8][arg: u32 LE]` answered by a fixed-length raw reply.
//!
//! | code | request | reply |
//! |---|---|---|
//! | `x` | entropy, arg = length | `length` bytes |
//! | `1`/`2` | noise source #1/#2, arg = length | `length` bytes |
//! | `d` | built-in diagnostics | 1 byte, 0 = pass |
//! | `n` | serial number | 16 bytes ASCII, NUL padded |
//! | `m` | model | 16 bytes ASCII, NUL padded |
//! | `v` | firmware version | 2 bytes: major, minor |
//! | `p` | power profile, arg = level | 1 byte ack |
//! | `c` | embedded correction, arg = 0/1 | 1 byte ack |

use std::path::Path;
use std::time::Duration;

use log::{debug, info};

use crate::channel::DeviceChannel;
use crate::error::{Error, Result};
use crate::health::{DiagnosticReport, diagnose};
use crate::session::{DeviceSession, EmbeddedCorrection};
use crate::source::EntropyReader;

/// Width of the serial number and model fields.
pub const IDENT_LEN: usize = 16;

/// Largest transfer requested from the device in one command.
pub const MAX_DEVICE_CHUNK: usize = 16 * 1024;

/// Raw bytes sampled by the default self-diagnostic.
pub const DIAGNOSTIC_BLOCK: usize = 16 * 1024;

/// Device identity, read once and cached by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub model: String,
    pub major_version: u32,
    pub minor_version: u32,
}

/// One of the device's two physical noise sub-circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoiseSource {
    First,
    Second,
}

impl std::fmt::Display for NoiseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::First => write!(f, "noise source #1"),
            Self::Second => write!(f, "noise source #2"),
        }
    }
}

/// Capability the broker drives. One instance is owned by exactly one arbiter.
pub trait EntropyDevice: Send {
    /// Apply the startup session (power profile, embedded correction).
    fn configure(&mut self, session: &DeviceSession) -> Result<()>;

    fn info(&mut self) -> Result<DeviceInfo>;

    /// Fill `buf` with raw (unconditioned) entropy.
    fn entropy(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Fill `buf` with samples from a single noise source.
    fn noise(&mut self, source: NoiseSource, buf: &mut [u8]) -> Result<()>;

    /// Sample a block of raw entropy and run the host-side checks on it.
    fn self_test(&mut self) -> Result<DiagnosticReport> {
        let mut block = vec![0u8; DIAGNOSTIC_BLOCK];
        self.entropy(&mut block)?;
        Ok(diagnose(&block))
    }
}

impl EntropyReader for dyn EntropyDevice + '_ {
    fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        self.entropy(buf)
    }
}

// ---------------------------------------------------------------------------
// Serial implementation
// ---------------------------------------------------------------------------

mod code {
    pub const ENTROPY: u8 = b'x';
    pub const NOISE_1: u8 = b'1';
    pub const NOISE_2: u8 = b'2';
    pub const DIAGNOSTICS: u8 = b'd';
    pub const SERIAL: u8 = b'n';
    pub const MODEL: u8 = b'm';
    pub const VERSION: u8 = b'v';
    pub const POWER: u8 = b'p';
    pub const CORRECTION: u8 = b'c';
}

/// [`EntropyDevice`] over a locked serial [`DeviceChannel`].
pub struct SerialDevice {
    channel: DeviceChannel,
}

impl SerialDevice {
    /// Connect to the device at `path`.
    pub fn open(path: impl AsRef<Path>, receive_deadline: Option<Duration>) -> Result<Self> {
        let mut channel = DeviceChannel::new();
        channel.set_receive_deadline(receive_deadline);
        let conn = channel.connect(path)?;
        info!("opened entropy device {}", conn.path().display());
        Ok(Self { channel })
    }

    /// Wrap an already-connected channel.
    pub fn from_channel(channel: DeviceChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    /// Release the device. Further calls fail with an I/O error.
    pub fn close(&mut self) {
        self.channel.disconnect();
    }

    fn command(&mut self, code: u8, arg: u32) -> Result<()> {
        let mut frame = [0u8; 5];
        frame[0] = code;
        frame[1..].copy_from_slice(&arg.to_le_bytes());
        self.channel.send(&frame)
    }

    fn request(&mut self, code: u8, arg: u32, reply: &mut [u8]) -> Result<()> {
        self.command(code, arg)?;
        let len = reply.len();
        self.channel.receive(reply, len)?;
        Ok(())
    }

    fn ack(&mut self, code: u8, arg: u32) -> Result<()> {
        let mut status = [0u8; 1];
        self.request(code, arg, &mut status)?;
        if status[0] != 0 {
            return Err(Error::Protocol(format!(
                "device rejected command '{}' with status {}",
                code as char, status[0]
            )));
        }
        Ok(())
    }

    fn stream(&mut self, code: u8, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(MAX_DEVICE_CHUNK) {
            self.request(code, chunk.len() as u32, chunk)?;
        }
        Ok(())
    }

    fn ident(&mut self, code: u8) -> Result<String> {
        let mut field = [0u8; IDENT_LEN];
        self.request(code, 0, &mut field)?;
        Ok(decode_ident(&field))
    }
}

impl EntropyDevice for SerialDevice {
    fn configure(&mut self, session: &DeviceSession) -> Result<()> {
        debug!(
            "configuring device: power profile {}, correction {:?}",
            session.power_profile.level(),
            session.embedded_correction
        );
        self.ack(code::POWER, session.power_profile.level() as u32)?;
        let correction = match session.embedded_correction {
            EmbeddedCorrection::Disabled => 0,
            EmbeddedCorrection::Linear => 1,
        };
        self.ack(code::CORRECTION, correction)
    }

    fn info(&mut self) -> Result<DeviceInfo> {
        let serial_number = self.ident(code::SERIAL)?;
        let model = self.ident(code::MODEL)?;
        let mut version = [0u8; 2];
        self.request(code::VERSION, 0, &mut version)?;
        Ok(DeviceInfo {
            serial_number,
            model,
            major_version: version[0] as u32,
            minor_version: version[1] as u32,
        })
    }

    fn entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream(code::ENTROPY, buf)
    }

    fn noise(&mut self, source: NoiseSource, buf: &mut [u8]) -> Result<()> {
        let code = match source {
            NoiseSource::First => code::NOISE_1,
            NoiseSource::Second => code::NOISE_2,
        };
        self.stream(code, buf)
    }

    fn self_test(&mut self) -> Result<DiagnosticReport> {
        let mut status = [0u8; 1];
        self.request(code::DIAGNOSTICS, 0, &mut status)?;
        if status[0] != 0 {
            return Err(Error::HealthTest(format!(
                "device diagnostics reported status {}",
                status[0]
            )));
        }
        let mut block = vec![0u8; DIAGNOSTIC_BLOCK];
        self.entropy(&mut block)?;
        Ok(diagnose(&block))
    }
}

impl EntropyReader for SerialDevice {
    fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        self.entropy(buf)
    }
}

/// ASCII field up to the first NUL.
pub fn decode_ident(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// NUL-padded fixed-width ASCII field. Longer values are truncated.
pub fn encode_ident(value: &str) -> [u8; IDENT_LEN] {
    let mut field = [0u8; IDENT_LEN];
    // Keep the final byte as terminator.
    let n = value.len().min(IDENT_LEN - 1);
    field[..n].copy_from_slice(&value.as_bytes()[..n]);
    field
}
