//! Broker startup configuration and the process-wide device session.
//!
//! [`BrokerConfig`] is what an operator writes (JSON, every field optional).
//! [`DeviceSession`] is the validated, read-only view handed to the device
//! arbiter at startup. Nothing per-request can change it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{DeviceChannel, MAX_DEVICE_SLOTS};
use crate::conditioning::PostProcessing;
use crate::error::{Error, Result};

/// Default IPC endpoint. Product variants override it at build time with
/// `NOISEPIPE_ENDPOINT`.
pub const DEFAULT_ENDPOINT: &str = match option_env!("NOISEPIPE_ENDPOINT") {
    Some(path) => path,
    None => "/tmp/noisepipe.sock",
};

/// Default number of pooled connection handlers.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Hard ceiling on pooled connection handlers.
pub const MAX_POOL_SIZE: usize = 64;

/// Highest power profile level (full throughput).
pub const MAX_POWER_PROFILE: u8 = 9;

// ---------------------------------------------------------------------------
// Session values
// ---------------------------------------------------------------------------

/// Device operating point, 0 (lowest power) to 9 (full throughput).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PowerProfile(u8);

impl PowerProfile {
    pub fn new(level: u8) -> Result<Self> {
        if level > MAX_POWER_PROFILE {
            return Err(Error::Config(format!(
                "power profile {level} out of range 0..={MAX_POWER_PROFILE}"
            )));
        }
        Ok(Self(level))
    }

    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for PowerProfile {
    fn default() -> Self {
        Self(MAX_POWER_PROFILE)
    }
}

impl TryFrom<u8> for PowerProfile {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        Self::new(level)
    }
}

impl From<PowerProfile> for u8 {
    fn from(p: PowerProfile) -> u8 {
        p.0
    }
}

/// Device-side correction of the raw noise signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddedCorrection {
    #[default]
    Disabled,
    Linear,
}

/// Read-only configuration shared by every request for the broker's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    /// `None` when post-processing is disabled.
    pub post_processing: Option<PostProcessing>,
    pub power_profile: PowerProfile,
    pub embedded_correction: EmbeddedCorrection,
    pub self_test: bool,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self {
            post_processing: Some(PostProcessing::default()),
            power_profile: PowerProfile::default(),
            embedded_correction: EmbeddedCorrection::default(),
            self_test: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Broker config
// ---------------------------------------------------------------------------

/// Operator-facing broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Index into the sorted discovery results.
    pub device_index: usize,
    /// Explicit device path; overrides `device_index`.
    pub device_path: Option<PathBuf>,
    pub endpoint: PathBuf,
    pub pool_size: usize,
    pub power_profile: u8,
    pub post_processing: PostProcessing,
    pub post_processing_enabled: bool,
    pub self_test_enabled: bool,
    pub embedded_correction: EmbeddedCorrection,
    /// Optional overall deadline for one device read, in milliseconds.
    pub receive_deadline_ms: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            device_path: None,
            endpoint: PathBuf::from(DEFAULT_ENDPOINT),
            pool_size: DEFAULT_POOL_SIZE,
            power_profile: MAX_POWER_PROFILE,
            post_processing: PostProcessing::default(),
            post_processing_enabled: true,
            self_test_enabled: true,
            embedded_correction: EmbeddedCorrection::default(),
            receive_deadline_ms: None,
        }
    }
}

impl BrokerConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check capacity bounds and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return Err(Error::Config(format!(
                "pool_size {} out of range 1..={MAX_POOL_SIZE}",
                self.pool_size
            )));
        }
        if self.device_index >= MAX_DEVICE_SLOTS {
            return Err(Error::Config(format!(
                "device_index {} out of range 0..{MAX_DEVICE_SLOTS}",
                self.device_index
            )));
        }
        if self.receive_deadline_ms == Some(0) {
            return Err(Error::Config("receive_deadline_ms must be positive".into()));
        }
        PowerProfile::new(self.power_profile)?;
        Ok(())
    }

    /// Build the session handed to the device arbiter.
    pub fn session(&self) -> Result<DeviceSession> {
        Ok(DeviceSession {
            post_processing: self
                .post_processing_enabled
                .then_some(self.post_processing),
            power_profile: PowerProfile::new(self.power_profile)?,
            embedded_correction: self.embedded_correction,
            self_test: self.self_test_enabled,
        })
    }

    pub fn receive_deadline(&self) -> Option<Duration> {
        self.receive_deadline_ms.map(Duration::from_millis)
    }

    /// The explicit `device_path`, or the `device_index`-th discovered device.
    pub fn resolve_device_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.device_path {
            return Ok(path.clone());
        }
        DeviceChannel::discover()
            .into_iter()
            .nth(self.device_index)
            .ok_or_else(|| Error::NotFound(format!("no device at index {}", self.device_index)))
    }
}
