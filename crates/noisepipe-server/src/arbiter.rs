//! Single owner of the entropy device.
//!
//! Connection handlers never touch the device. They send a [`DeviceRequest`]
//! over a channel and await the reply; the arbiter drains the channel one
//! request at a time on a blocking thread, so two device commands can never
//! overlap no matter how many clients are connected.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use noisepipe_core::device::encode_ident;
use noisepipe_core::{
    Conditioner, DeviceInfo, DeviceSession, EntropyDevice, Error, HealthMonitor, Result,
};

use crate::protocol::Command;

/// A command forwarded from a connection handler.
pub struct DeviceRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Result code reported for diagnostics the device itself failed.
pub const DEVICE_DIAGNOSTIC_FAILED: u32 = 0x10;

pub struct DeviceArbiter {
    device: Box<dyn EntropyDevice>,
    session: Arc<DeviceSession>,
    conditioner: Option<Conditioner>,
    monitor: HealthMonitor,
    info: Option<DeviceInfo>,
    served: u64,
}

impl DeviceArbiter {
    pub fn new(device: Box<dyn EntropyDevice>, session: Arc<DeviceSession>) -> Self {
        let conditioner = session.post_processing.map(Conditioner::new);
        Self {
            device,
            session,
            conditioner,
            monitor: HealthMonitor::new(),
            info: None,
            served: 0,
        }
    }

    /// Configure the device and prime the identity cache.
    ///
    /// Only a configuration failure is fatal. A failed identity read is
    /// retried on the first identity request; a failed startup diagnostic is
    /// logged and left to clients to query.
    pub fn startup(&mut self) -> Result<()> {
        self.device.configure(&self.session)?;
        match self.device.info() {
            Ok(info) => {
                info!(
                    "device {} model {} firmware {}.{}",
                    info.serial_number, info.model, info.major_version, info.minor_version
                );
                self.info = Some(info);
            }
            Err(e) => warn!("could not read device identity: {e}"),
        }
        if self.session.self_test {
            match self.device.self_test() {
                Ok(report) if report.passed() => info!(
                    "startup diagnostic passed ({:.3} bits/byte)",
                    report.shannon_entropy
                ),
                Ok(report) => warn!("startup diagnostic failed: {report:?}"),
                Err(e) => warn!("startup diagnostic failed: {e}"),
            }
        }
        Ok(())
    }

    fn info(&mut self) -> Result<&DeviceInfo> {
        if self.info.is_none() {
            self.info = Some(self.device.info()?);
        }
        self.info
            .as_ref()
            .ok_or_else(|| Error::NotFound("device identity unavailable".into()))
    }

    /// Run one command to completion.
    pub fn execute(&mut self, command: &Command) -> Result<Vec<u8>> {
        match *command {
            Command::Entropy(len) => {
                let mut raw = vec![0u8; len];
                self.device.entropy(&mut raw)?;
                if self.session.self_test {
                    self.monitor.check(&raw)?;
                }
                Ok(match &self.conditioner {
                    Some(c) => c.condition(&raw, len),
                    None => raw,
                })
            }
            Command::Noise(source, len) => {
                let mut raw = vec![0u8; len];
                self.device.noise(source, &mut raw)?;
                Ok(raw)
            }
            Command::SelfTest => {
                let code = match self.device.self_test() {
                    Ok(report) => report.code(),
                    Err(Error::HealthTest(msg)) => {
                        warn!("device diagnostics failed: {msg}");
                        DEVICE_DIAGNOSTIC_FAILED
                    }
                    Err(e) => return Err(e),
                };
                Ok(code.to_le_bytes().to_vec())
            }
            Command::SerialNumber => Ok(encode_ident(&self.info()?.serial_number).to_vec()),
            Command::Model => Ok(encode_ident(&self.info()?.model).to_vec()),
            Command::DeviceMinorVersion => Ok(self.info()?.minor_version.to_le_bytes().to_vec()),
            Command::DeviceMajorVersion => Ok(self.info()?.major_version.to_le_bytes().to_vec()),
            Command::ServerMinorVersion | Command::ServerMajorVersion => Err(Error::Protocol(
                "server version is answered by the connection handler".into(),
            )),
        }
    }

    /// Serve requests until every sender is dropped.
    pub fn spawn(mut self, mut requests: mpsc::Receiver<DeviceRequest>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            while let Some(request) = requests.blocking_recv() {
                let result = self.execute(&request.command);
                if let Err(e) = &result {
                    warn!("{:?} failed: {e}", request.command);
                }
                self.served += 1;
                // The handler may have gone away; its client is gone too.
                let _ = request.reply.send(result);
            }
            debug!(
                "device arbiter stopped after {} requests ({} health failures)",
                self.served,
                self.monitor.failures()
            );
        })
    }
}
