//! Blocking client for the broker endpoint.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use noisepipe_core::device::decode_ident;
use noisepipe_core::{EntropyReader, Error, IDENT_LEN, NoiseSource, Result};

use crate::protocol::{MAX_TRANSFER, Opcode, RequestHeader, STATUS_LEN, Status};

/// One connection to a running broker.
///
/// Requests are strictly sequential: each call writes a header and reads the
/// complete reply before returning.
#[derive(Debug)]
pub struct BrokerClient {
    stream: UnixStream,
    endpoint: PathBuf,
}

impl BrokerClient {
    /// Connect to `endpoint`. A missing or dead endpoint is `NotFound`.
    pub fn connect(endpoint: impl AsRef<Path>) -> Result<Self> {
        let endpoint = endpoint.as_ref();
        let stream = UnixStream::connect(endpoint).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                Error::NotFound(format!("no broker at {}", endpoint.display()))
            }
            _ => Error::Io(e),
        })?;
        Ok(Self {
            stream,
            endpoint: endpoint.to_path_buf(),
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Bound every read from the broker. `None` waits indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn call(&mut self, opcode: Opcode, length: u32, reply: &mut [u8]) -> Result<()> {
        self.stream
            .write_all(&RequestHeader::new(opcode, length).encode())?;
        let mut status = [0u8; STATUS_LEN];
        self.stream.read_exact(&mut status)?;
        match Status::from_code(u32::from_le_bytes(status)) {
            Status::Ok => {
                self.stream.read_exact(reply)?;
                Ok(())
            }
            failure => Err(failure.into_error()),
        }
    }

    fn call_u32(&mut self, opcode: Opcode) -> Result<u32> {
        let mut word = [0u8; 4];
        self.call(opcode, 0, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn call_ident(&mut self, opcode: Opcode) -> Result<String> {
        let mut field = [0u8; IDENT_LEN];
        self.call(opcode, 0, &mut field)?;
        Ok(decode_ident(&field))
    }

    /// Fill `buf` with (conditioned) entropy, splitting into transfers the
    /// broker accepts.
    pub fn entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(MAX_TRANSFER as usize) {
            self.call(Opcode::Entropy, chunk.len() as u32, chunk)?;
        }
        Ok(())
    }

    /// Fill `buf` with raw samples from one noise source.
    pub fn noise(&mut self, source: NoiseSource, buf: &mut [u8]) -> Result<()> {
        let opcode = match source {
            NoiseSource::First => Opcode::NoiseSource1,
            NoiseSource::Second => Opcode::NoiseSource2,
        };
        for chunk in buf.chunks_mut(MAX_TRANSFER as usize) {
            self.call(opcode, chunk.len() as u32, chunk)?;
        }
        Ok(())
    }

    /// Run diagnostics. `0` means every check passed.
    pub fn self_test(&mut self) -> Result<u32> {
        self.call_u32(Opcode::SelfTest)
    }

    pub fn serial_number(&mut self) -> Result<String> {
        self.call_ident(Opcode::SerialNumber)
    }

    pub fn model(&mut self) -> Result<String> {
        self.call_ident(Opcode::Model)
    }

    /// Device firmware version as (major, minor).
    pub fn device_version(&mut self) -> Result<(u32, u32)> {
        Ok((
            self.call_u32(Opcode::DeviceMajorVersion)?,
            self.call_u32(Opcode::DeviceMinorVersion)?,
        ))
    }

    /// Broker version as (major, minor).
    pub fn server_version(&mut self) -> Result<(u32, u32)> {
        Ok((
            self.call_u32(Opcode::ServerMajorVersion)?,
            self.call_u32(Opcode::ServerMinorVersion)?,
        ))
    }
}

impl EntropyReader for BrokerClient {
    fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        self.entropy(buf)
    }
}
