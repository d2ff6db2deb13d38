//! Broker lifecycle: open the device, bind the endpoint, run the handler
//! pool, tear everything down on shutdown.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};

use noisepipe_core::{
    BrokerConfig, DeviceSession, EntropyDevice, Error, MAX_POOL_SIZE, Result, SerialDevice,
};

use crate::arbiter::DeviceArbiter;
use crate::connection::ConnectionHandler;

/// Endpoint permissions: owner and group may connect.
const ENDPOINT_MODE: u32 = 0o660;

pub struct EntropyBroker {
    device: Box<dyn EntropyDevice>,
    session: DeviceSession,
    endpoint: PathBuf,
    pool_size: usize,
}

impl EntropyBroker {
    pub fn new(
        device: Box<dyn EntropyDevice>,
        session: DeviceSession,
        endpoint: impl Into<PathBuf>,
        pool_size: usize,
    ) -> Result<Self> {
        if pool_size == 0 || pool_size > MAX_POOL_SIZE {
            return Err(Error::Config(format!(
                "pool_size {pool_size} out of range 1..={MAX_POOL_SIZE}"
            )));
        }
        Ok(Self {
            device,
            session,
            endpoint: endpoint.into(),
            pool_size,
        })
    }

    /// Resolve and open the configured serial device.
    ///
    /// Fails when no device is present or another process holds it.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        config.validate()?;
        let path = config.resolve_device_path()?;
        info!("opening device {}", path.display());
        let device = SerialDevice::open(&path, config.receive_deadline())?;
        Self::new(
            Box::new(device),
            config.session()?,
            &config.endpoint,
            config.pool_size,
        )
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Serve until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Returns once every handler has stopped, the device has been released
    /// and the endpoint file removed.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            device,
            session,
            endpoint,
            pool_size,
        } = self;

        let mut arbiter = DeviceArbiter::new(device, Arc::new(session));
        let arbiter = tokio::task::spawn_blocking(move || arbiter.startup().map(|()| arbiter))
            .await
            .map_err(|e| Error::io(std::io::ErrorKind::Other, e.to_string()))??;

        let listener = Arc::new(bind_endpoint(&endpoint)?);
        info!(
            "listening on {} with {pool_size} connection slots",
            endpoint.display()
        );

        let (requests, inbox) = mpsc::channel(pool_size);
        let device_task = arbiter.spawn(inbox);

        let handlers: Vec<_> = (0..pool_size)
            .map(|slot| {
                let handler = ConnectionHandler::new(slot, Arc::clone(&listener), requests.clone());
                tokio::spawn(handler.run(shutdown.clone()))
            })
            .collect();
        drop(requests);

        for handler in handlers {
            if let Err(e) = handler.await {
                warn!("connection handler panicked: {e}");
            }
        }
        if let Err(e) = device_task.await {
            warn!("device arbiter panicked: {e}");
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&endpoint) {
            warn!("could not remove {}: {e}", endpoint.display());
        }
        info!("broker stopped");
        Ok(())
    }
}

/// Bind the endpoint, clearing a stale socket left by a previous run.
///
/// A socket that still accepts connections belongs to a live broker and is
/// left alone. Anything other than a socket is never removed.
fn bind_endpoint(endpoint: &Path) -> Result<UnixListener> {
    if let Ok(meta) = std::fs::symlink_metadata(endpoint) {
        if !meta.file_type().is_socket() {
            return Err(Error::Config(format!(
                "endpoint {} exists and is not a socket",
                endpoint.display()
            )));
        }
        if std::os::unix::net::UnixStream::connect(endpoint).is_ok() {
            return Err(Error::Busy(endpoint.to_path_buf()));
        }
        warn!("removing stale endpoint {}", endpoint.display());
        std::fs::remove_file(endpoint)?;
    }
    let listener = UnixListener::bind(endpoint)?;
    std::fs::set_permissions(endpoint, std::fs::Permissions::from_mode(ENDPOINT_MODE))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use noisepipe_core::{DeviceInfo, NoiseSource};

    struct Idle;

    impl EntropyDevice for Idle {
        fn configure(&mut self, _: &DeviceSession) -> Result<()> {
            Ok(())
        }
        fn info(&mut self) -> Result<DeviceInfo> {
            Err(Error::NotFound("idle".into()))
        }
        fn entropy(&mut self, buf: &mut [u8]) -> Result<()> {
            buf.fill(0);
            Ok(())
        }
        fn noise(&mut self, _: NoiseSource, buf: &mut [u8]) -> Result<()> {
            buf.fill(0);
            Ok(())
        }
    }

    #[test]
    fn pool_size_is_bounded() {
        for bad in [0, MAX_POOL_SIZE + 1] {
            assert!(matches!(
                EntropyBroker::new(Box::new(Idle), DeviceSession::default(), "/tmp/x", bad),
                Err(Error::Config(_))
            ));
        }
        let broker =
            EntropyBroker::new(Box::new(Idle), DeviceSession::default(), "/tmp/x", 3).unwrap();
        assert_eq!(broker.pool_size(), 3);
        assert_eq!(broker.endpoint(), Path::new("/tmp/x"));
    }

    #[tokio::test]
    async fn stale_endpoint_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = bind_endpoint(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, ENDPOINT_MODE);
        drop(listener);
    }

    #[tokio::test]
    async fn non_socket_endpoint_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"operator data").unwrap();

        assert!(matches!(bind_endpoint(&path), Err(Error::Config(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"operator data");

        let subdir = dir.path().join("sub");
        std::fs::create_dir(&subdir).unwrap();
        assert!(matches!(bind_endpoint(&subdir), Err(Error::Config(_))));
        assert!(subdir.is_dir());
    }

    #[tokio::test]
    async fn live_endpoint_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _live = std::os::unix::net::UnixListener::bind(&path).unwrap();
        assert!(matches!(bind_endpoint(&path), Err(Error::Busy(_))));
    }

    #[tokio::test]
    async fn configure_failure_stops_startup() {
        struct Broken;
        impl EntropyDevice for Broken {
            fn configure(&mut self, _: &DeviceSession) -> Result<()> {
                Err(Error::Timeout { partial: 0 })
            }
            fn info(&mut self) -> Result<DeviceInfo> {
                unreachable!()
            }
            fn entropy(&mut self, _: &mut [u8]) -> Result<()> {
                unreachable!()
            }
            fn noise(&mut self, _: NoiseSource, _: &mut [u8]) -> Result<()> {
                unreachable!()
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.sock");
        let broker = EntropyBroker::new(Box::new(Broken), DeviceSession::default(), &path, 1).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(broker.run(rx).await, Err(Error::Timeout { .. })));
        assert!(!path.exists());
    }
}
