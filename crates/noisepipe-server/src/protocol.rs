//! Binary request/reply protocol spoken on the broker endpoint.
//!
//! ```text
//! request:  +----------------+----------------------+
//!           | opcode (u32 LE)| requested_len (u32 LE)|
//!           +----------------+----------------------+
//! reply:    +----------------+--------------------------------+
//!           | status (u32 LE)| payload (only when status == 0) |
//!           +----------------+--------------------------------+
//! ```
//!
//! Payload sizes are implied by the request: entropy and noise commands return
//! exactly `requested_len` bytes, identity commands a fixed 16-byte field,
//! version and self-test commands one `u32`.
//!
//! The leading status word extends the raw-payload reply format so that
//! device errors reach the client without being mistaken for data.

use std::path::PathBuf;

use noisepipe_core::{Error, IDENT_LEN, NoiseSource};

/// Request header size.
pub const HEADER_LEN: usize = 8;

/// Reply status word size.
pub const STATUS_LEN: usize = 4;

/// Largest `requested_len` accepted for entropy and noise commands.
///
/// The lower bound is 1: a zero-length entropy or noise request is rejected
/// as a protocol error rather than answered with an empty payload.
pub const MAX_TRANSFER: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Entropy = 0,
    SelfTest = 1,
    SerialNumber = 2,
    Model = 3,
    DeviceMinorVersion = 4,
    DeviceMajorVersion = 5,
    ServerMinorVersion = 6,
    ServerMajorVersion = 7,
    NoiseSource1 = 8,
    NoiseSource2 = 9,
}

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Ok(match raw {
            0 => Self::Entropy,
            1 => Self::SelfTest,
            2 => Self::SerialNumber,
            3 => Self::Model,
            4 => Self::DeviceMinorVersion,
            5 => Self::DeviceMajorVersion,
            6 => Self::ServerMinorVersion,
            7 => Self::ServerMajorVersion,
            8 => Self::NoiseSource1,
            9 => Self::NoiseSource2,
            other => return Err(other),
        })
    }
}

/// Fixed 8-byte request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u32,
    pub length: u32,
}

impl RequestHeader {
    pub fn new(opcode: Opcode, length: u32) -> Self {
        Self {
            opcode: opcode as u32,
            length,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&self.opcode.to_le_bytes());
        buf[4..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            opcode: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// A validated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Entropy(usize),
    Noise(NoiseSource, usize),
    SelfTest,
    SerialNumber,
    Model,
    DeviceMinorVersion,
    DeviceMajorVersion,
    ServerMinorVersion,
    ServerMajorVersion,
}

impl Command {
    /// Validate a header. Unknown opcodes and bad lengths are protocol errors.
    pub fn parse(header: RequestHeader) -> Result<Self, Error> {
        let opcode = Opcode::try_from(header.opcode)
            .map_err(|raw| Error::Protocol(format!("unknown opcode {raw}")))?;
        let sized = |len: u32| -> Result<usize, Error> {
            if len == 0 || len > MAX_TRANSFER {
                return Err(Error::Protocol(format!(
                    "requested length {len} out of range 1..={MAX_TRANSFER}"
                )));
            }
            Ok(len as usize)
        };
        Ok(match opcode {
            Opcode::Entropy => Self::Entropy(sized(header.length)?),
            Opcode::NoiseSource1 => Self::Noise(NoiseSource::First, sized(header.length)?),
            Opcode::NoiseSource2 => Self::Noise(NoiseSource::Second, sized(header.length)?),
            Opcode::SelfTest => Self::SelfTest,
            Opcode::SerialNumber => Self::SerialNumber,
            Opcode::Model => Self::Model,
            Opcode::DeviceMinorVersion => Self::DeviceMinorVersion,
            Opcode::DeviceMajorVersion => Self::DeviceMajorVersion,
            Opcode::ServerMinorVersion => Self::ServerMinorVersion,
            Opcode::ServerMajorVersion => Self::ServerMajorVersion,
        })
    }

    /// Payload length of a successful reply.
    pub fn reply_len(&self) -> usize {
        match self {
            Self::Entropy(n) | Self::Noise(_, n) => *n,
            Self::SerialNumber | Self::Model => IDENT_LEN,
            _ => 4,
        }
    }

    /// Whether the reply may need the device (or its cached identity).
    pub fn needs_device(&self) -> bool {
        !matches!(self, Self::ServerMinorVersion | Self::ServerMajorVersion)
    }
}

/// Reply status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    ProtocolError = 1,
    Timeout = 2,
    IoError = 3,
    NotFound = 4,
    Busy = 5,
    HealthTest = 6,
    Failure = 7,
}

impl Status {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Protocol(_) => Self::ProtocolError,
            Error::Timeout { .. } => Self::Timeout,
            Error::Io(_) => Self::IoError,
            Error::NotFound(_) => Self::NotFound,
            Error::Busy(_) => Self::Busy,
            Error::HealthTest(_) => Self::HealthTest,
            _ => Self::Failure,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::ProtocolError,
            2 => Self::Timeout,
            3 => Self::IoError,
            4 => Self::NotFound,
            5 => Self::Busy,
            6 => Self::HealthTest,
            _ => Self::Failure,
        }
    }

    /// Client-side error for a non-`Ok` status.
    pub fn into_error(self) -> Error {
        match self {
            Self::Ok | Self::Failure => Error::io(
                std::io::ErrorKind::Other,
                "broker reported a device failure",
            ),
            Self::ProtocolError => Error::Protocol("request rejected by broker".into()),
            Self::Timeout => Error::Timeout { partial: 0 },
            Self::IoError => Error::io(
                std::io::ErrorKind::Other,
                "broker reported a device I/O error",
            ),
            Self::NotFound => Error::NotFound("broker has no device".into()),
            Self::Busy => Error::Busy(PathBuf::from("broker device")),
            Self::HealthTest => Error::HealthTest("reported by broker".into()),
        }
    }
}

/// Status word followed by the payload on success.
pub fn encode_reply(result: &Result<Vec<u8>, Error>) -> Vec<u8> {
    match result {
        Ok(payload) => {
            let mut out = Vec::with_capacity(STATUS_LEN + payload.len());
            out.extend_from_slice(&(Status::Ok as u32).to_le_bytes());
            out.extend_from_slice(payload);
            out
        }
        Err(e) => (Status::from_error(e) as u32).to_le_bytes().to_vec(),
    }
}

/// Broker version as (major, minor), from this crate's version.
pub fn server_version() -> (u32, u32) {
    (
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(opcode: u32, length: u32) -> Result<Command, Error> {
        Command::parse(RequestHeader { opcode, length })
    }

    #[test]
    fn header_layout_is_little_endian() {
        let h = RequestHeader::new(Opcode::NoiseSource2, 0x0102_0304);
        assert_eq!(h.encode(), [9, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(RequestHeader::decode(&h.encode()), h);
    }

    #[test]
    fn every_opcode_parses() {
        for raw in 0..=9u32 {
            assert!(parse(raw, 16).is_ok(), "opcode {raw}");
        }
        assert!(matches!(parse(10, 16), Err(Error::Protocol(_))));
        assert!(matches!(parse(u32::MAX, 16), Err(Error::Protocol(_))));
    }

    #[test]
    fn transfer_limit_applies_to_sized_commands() {
        assert_eq!(parse(0, MAX_TRANSFER).unwrap(), Command::Entropy(100_000));
        assert!(matches!(parse(0, MAX_TRANSFER + 1), Err(Error::Protocol(_))));
        assert!(matches!(parse(8, MAX_TRANSFER + 1), Err(Error::Protocol(_))));
        assert!(matches!(parse(9, 0), Err(Error::Protocol(_))));
        assert!(matches!(parse(0, 0), Err(Error::Protocol(_))));
        assert_eq!(parse(0, 1).unwrap(), Command::Entropy(1));
        // Metadata queries ignore the length field.
        assert_eq!(parse(2, u32::MAX).unwrap(), Command::SerialNumber);
    }

    #[test]
    fn reply_lengths() {
        assert_eq!(Command::Entropy(123).reply_len(), 123);
        assert_eq!(Command::Model.reply_len(), IDENT_LEN);
        assert_eq!(Command::ServerMajorVersion.reply_len(), 4);
        assert!(!Command::ServerMinorVersion.needs_device());
        assert!(Command::SerialNumber.needs_device());
    }

    #[test]
    fn status_round_trips_through_errors() {
        let cases = [
            (Error::Protocol("x".into()), Status::ProtocolError),
            (Error::Timeout { partial: 3 }, Status::Timeout),
            (Error::io(std::io::ErrorKind::BrokenPipe, "x"), Status::IoError),
            (Error::HealthTest("x".into()), Status::HealthTest),
            (Error::Config("x".into()), Status::Failure),
        ];
        for (err, status) in cases {
            assert_eq!(Status::from_error(&err), status);
            assert_eq!(Status::from_code(status as u32), status);
        }
        assert!(matches!(Status::Busy.into_error(), Error::Busy(_)));
        assert!(matches!(Status::Timeout.into_error(), Error::Timeout { partial: 0 }));
        assert!(matches!(Status::Failure.into_error(), Error::Io(_)));
        assert_eq!(Status::from_code(99), Status::Failure);
    }

    #[test]
    fn reply_encoding() {
        assert_eq!(encode_reply(&Ok(vec![7, 8])), vec![0, 0, 0, 0, 7, 8]);
        assert_eq!(
            encode_reply(&Err(Error::Timeout { partial: 1 })),
            vec![2, 0, 0, 0]
        );
    }
}
