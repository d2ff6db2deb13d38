//! Exclusive, timeout-bounded channel to a serial-style hardware entropy device.
//!
//! A [`DeviceChannel`] owns at most one [`DeviceConnection`]. Connecting takes a
//! non-blocking exclusive `flock` on the device node, so two processes can never
//! drive the same device at once, then puts the line into raw mode with a
//! 100 ms per-read timeout (`VMIN=0`, `VTIME=1`).
//!
//! ```text
//! discover() → connect(path) → send / receive ... → disconnect()
//! ```
//!
//! Reads are bounded per call, not per transfer: a device that trickles one
//! byte every 90 ms keeps [`DeviceChannel::receive`] alive indefinitely. Callers
//! that need a hard cutoff set [`DeviceChannel::set_receive_deadline`].

use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Per-read timeout programmed into the line discipline.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum number of endpoints reported by discovery.
pub const MAX_DEVICE_LIST: usize = 127;

/// Maximum number of addressable device slots (`device_index` upper bound).
pub const MAX_DEVICE_SLOTS: usize = 25;

/// Name fragments that identify entropy devices in `/dev/serial/by-id`.
pub const DEFAULT_VENDOR_TAGS: &[&str] = &["trng", "qrng", "hwrng", "noisepipe"];

// ---------------------------------------------------------------------------
// Port abstraction
// ---------------------------------------------------------------------------

/// Byte transport underneath a connection.
///
/// `read` returning `Ok(0)` means the per-read timeout elapsed with no data.
pub trait Port: Read + Write + Send {}

impl<T: Read + Write + Send> Port for T {}

/// A locked, raw-mode serial device node.
#[cfg(unix)]
pub struct SerialPort {
    file: std::fs::File,
}

#[cfg(unix)]
impl SerialPort {
    /// Open `path`, take the exclusive advisory lock and configure raw mode.
    pub fn open(path: &Path) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
                _ => Error::Io(e),
            })?;

        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid open descriptor owned by `file`.
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => Error::Busy(path.to_path_buf()),
                _ => Error::Io(err),
            });
        }

        // From here on, dropping `port` releases the lock.
        let port = Self { file };
        port.configure_raw()?;
        Ok(port)
    }

    fn configure_raw(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.file.as_raw_fd();

        // SAFETY: termios is a plain C struct; all-zero is a valid value that
        // tcgetattr overwrites before use.
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid, tio points to writable termios storage.
        if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // SAFETY: tio was initialised by tcgetattr.
        unsafe { libc::cfmakeraw(&mut tio) };
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = (READ_TIMEOUT.as_millis() / 100) as libc::cc_t;

        // SAFETY: fd is valid, tio is fully initialised.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // Opened non-blocking so a missing carrier cannot hang open(); reads
        // must block so VTIME applies.
        // SAFETY: fcntl on a valid fd with F_GETFL/F_SETFL.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }

        // SAFETY: fd is valid.
        if unsafe { libc::tcflush(fd, libc::TCIOFLUSH) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(unix)]
impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(unix)]
impl Drop for SerialPort {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is still owned by `file`; unlocking an unlocked fd is harmless.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Source of candidate device paths.
pub trait DeviceEnumerator {
    fn enumerate(&self) -> Vec<PathBuf>;
}

/// Lists one directory and keeps entries whose file name matches a rule.
#[derive(Debug, Clone)]
pub struct DirectoryEnumerator {
    dir: PathBuf,
    rule: NameRule,
}

#[derive(Debug, Clone)]
enum NameRule {
    /// Case-insensitive substring match against any tag.
    Contains(Vec<String>),
    /// Exact prefix match.
    Prefix(String),
}

impl DirectoryEnumerator {
    /// Entries whose name contains one of `tags` (case-insensitive).
    pub fn with_tags(dir: impl Into<PathBuf>, tags: &[&str]) -> Self {
        Self {
            dir: dir.into(),
            rule: NameRule::Contains(tags.iter().map(|t| t.to_lowercase()).collect()),
        }
    }

    /// Entries whose name starts with `prefix`.
    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            rule: NameRule::Prefix(prefix.to_string()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match &self.rule {
            NameRule::Contains(tags) => {
                let lower = name.to_lowercase();
                tags.iter().any(|t| lower.contains(t.as_str()))
            }
            NameRule::Prefix(p) => name.starts_with(p.as_str()),
        }
    }
}

impl DeviceEnumerator for DirectoryEnumerator {
    fn enumerate(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().is_some_and(|n| self.matches(n)))
            .map(|e| e.path())
            .collect()
    }
}

/// Chains several enumerators.
///
/// Paths that resolve to the same device node are listed once, under the
/// name the earliest enumerator reported.
#[derive(Default)]
pub struct CompositeEnumerator {
    parts: Vec<Box<dyn DeviceEnumerator>>,
}

impl CompositeEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, enumerator: impl DeviceEnumerator + 'static) -> Self {
        self.parts.push(Box::new(enumerator));
        self
    }
}

impl DeviceEnumerator for CompositeEnumerator {
    fn enumerate(&self) -> Vec<PathBuf> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for part in &self.parts {
            for path in part.enumerate() {
                let node = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
                if seen.insert(node) {
                    out.push(path);
                }
            }
        }
        out
    }
}

/// Platform default: `/dev/serial/by-id` vendor names plus `/dev/ttyACM*` on
/// Linux, `/dev/cu.usbmodem*` on macOS.
pub fn platform_enumerator() -> Box<dyn DeviceEnumerator> {
    #[cfg(target_os = "macos")]
    {
        Box::new(DirectoryEnumerator::with_prefix("/dev", "cu.usbmodem"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Box::new(
            CompositeEnumerator::new()
                .with(DirectoryEnumerator::with_tags(
                    "/dev/serial/by-id",
                    DEFAULT_VENDOR_TAGS,
                ))
                .with(DirectoryEnumerator::with_prefix("/dev", "ttyACM")),
        )
    }
}

// ---------------------------------------------------------------------------
// Connection + channel
// ---------------------------------------------------------------------------

/// One live, exclusively owned device connection.
pub struct DeviceConnection {
    path: PathBuf,
    port: Box<dyn Port>,
    locked: bool,
    last_error: Option<String>,
}

impl DeviceConnection {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this connection holds the advisory device lock.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record(&mut self, msg: String) {
        warn!("{}: {msg}", self.path.display());
        self.last_error = Some(msg);
    }
}

/// Owner of at most one device connection.
#[derive(Default)]
pub struct DeviceChannel {
    connection: Option<DeviceConnection>,
    receive_deadline: Option<Duration>,
}

impl DeviceChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate candidate devices with the platform enumerator.
    pub fn discover() -> BTreeSet<PathBuf> {
        Self::discover_with(platform_enumerator().as_ref())
    }

    /// Enumerate candidate devices with a caller-supplied enumerator.
    pub fn discover_with(enumerator: &dyn DeviceEnumerator) -> BTreeSet<PathBuf> {
        enumerator
            .enumerate()
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(MAX_DEVICE_LIST)
            .collect()
    }

    /// Open and lock the device at `path`. An existing connection is closed first.
    #[cfg(unix)]
    pub fn connect(&mut self, path: impl AsRef<Path>) -> Result<&DeviceConnection> {
        let path = path.as_ref();
        self.disconnect();
        let port = SerialPort::open(path)?;
        debug!("connected to {}", path.display());
        Ok(self.install(path.to_path_buf(), Box::new(port), true))
    }

    #[cfg(not(unix))]
    pub fn connect(&mut self, path: impl AsRef<Path>) -> Result<&DeviceConnection> {
        let _ = path;
        Err(Error::io(
            io::ErrorKind::Unsupported,
            "serial devices are only supported on unix",
        ))
    }

    /// Install an already-open port as the live connection. No lock is taken.
    pub fn attach(&mut self, path: impl Into<PathBuf>, port: Box<dyn Port>) -> &DeviceConnection {
        self.disconnect();
        self.install(path.into(), port, false)
    }

    fn install(&mut self, path: PathBuf, port: Box<dyn Port>, locked: bool) -> &DeviceConnection {
        self.connection.insert(DeviceConnection {
            path,
            port,
            locked,
            last_error: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection(&self) -> Option<&DeviceConnection> {
        self.connection.as_ref()
    }

    /// Bound the total time a single [`receive`](Self::receive) may take.
    /// `None` (the default) leaves only the per-read timeout.
    pub fn set_receive_deadline(&mut self, deadline: Option<Duration>) {
        self.receive_deadline = deadline;
    }

    pub fn receive_deadline(&self) -> Option<Duration> {
        self.receive_deadline
    }

    fn live(&mut self) -> Result<&mut DeviceConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::io(io::ErrorKind::NotConnected, "device channel is not connected"))
    }

    /// Write `data` in one call. A short write is an error; nothing is retried.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let conn = self.live()?;
        match conn.port.write(data) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                conn.record(format!("short write: {n} of {} bytes", data.len()));
                Err(Error::io(
                    io::ErrorKind::WriteZero,
                    format!("short write: {n} of {} bytes", data.len()),
                ))
            }
            Err(e) => {
                conn.record(format!("write failed: {e}"));
                Err(Error::Io(e))
            }
        }
    }

    /// Read until `expected_len` bytes are in `buf`.
    ///
    /// Returns [`Error::Timeout`] with the partial count as soon as one
    /// underlying read comes back empty, or when the optional deadline passes.
    pub fn receive(&mut self, buf: &mut [u8], expected_len: usize) -> Result<usize> {
        if expected_len > buf.len() {
            return Err(Error::io(
                io::ErrorKind::InvalidInput,
                format!("buffer holds {} bytes, {expected_len} expected", buf.len()),
            ));
        }
        let deadline = self.receive_deadline;
        let conn = self.live()?;
        let started = Instant::now();
        let mut filled = 0;

        while filled < expected_len {
            if deadline.is_some_and(|d| started.elapsed() >= d) {
                conn.record(format!("receive deadline hit after {filled} bytes"));
                return Err(Error::Timeout { partial: filled });
            }
            match conn.port.read(&mut buf[filled..expected_len]) {
                Ok(0) => {
                    conn.record(format!("read timeout after {filled} of {expected_len} bytes"));
                    return Err(Error::Timeout { partial: filled });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    conn.record(format!("read timeout after {filled} of {expected_len} bytes"));
                    return Err(Error::Timeout { partial: filled });
                }
                Err(e) => {
                    conn.record(format!("read failed: {e}"));
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(filled)
    }

    /// Release the lock and drop the connection. No-op when disconnected.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            debug!("disconnected from {}", conn.path.display());
        }
    }
}
