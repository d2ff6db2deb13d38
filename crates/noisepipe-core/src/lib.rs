//! # noisepipe-core
//!
//! **One hardware TRNG, many consumers.**
//!
//! `noisepipe-core` holds everything that touches the physical entropy device
//! directly, plus the library-side consumers of its output:
//!
//! - [`DeviceChannel`]: exclusive (`flock`), raw-mode, timeout-bounded serial I/O
//! - [`EntropyDevice`] / [`SerialDevice`]: the device capability the broker drives
//! - [`Conditioner`]: SHA-256, SHA-512 or xorshift64* post-processing
//! - [`HealthMonitor`]: continuous repetition-count and adaptive-proportion tests
//! - [`UniqueSequenceSampler`]: distinct values from `1..=R` without replacement
//! - [`BrokerConfig`] / [`DeviceSession`]: startup configuration
//!
//! ## Quick Start
//!
//! ```no_run
//! use noisepipe_core::{DeviceChannel, SerialDevice, UniqueSequenceSampler};
//!
//! let path = DeviceChannel::discover().into_iter().next().expect("no device");
//! let mut device = SerialDevice::open(&path, None)?;
//!
//! // Six distinct numbers from 1..=49.
//! let mut sampler = UniqueSequenceSampler::new(49)?;
//! let draw = sampler.generate(6, &mut device)?;
//! assert_eq!(draw.len(), 6);
//! # Ok::<(), noisepipe_core::Error>(())
//! ```

pub mod channel;
pub mod conditioning;
pub mod device;
pub mod error;
pub mod health;
pub mod sampler;
pub mod session;
pub mod source;

pub use channel::{
    CompositeEnumerator, DeviceChannel, DeviceConnection, DeviceEnumerator, DirectoryEnumerator,
    MAX_DEVICE_LIST, MAX_DEVICE_SLOTS, Port, READ_TIMEOUT, platform_enumerator,
};
pub use conditioning::{Conditioner, PostProcessing};
pub use device::{DeviceInfo, EntropyDevice, IDENT_LEN, NoiseSource, SerialDevice};
pub use error::{Error, Result};
pub use health::{DiagnosticReport, HealthMonitor, diagnose};
pub use sampler::{UniqueSequenceSampler, sample};
pub use session::{
    BrokerConfig, DEFAULT_ENDPOINT, DEFAULT_POOL_SIZE, DeviceSession, EmbeddedCorrection,
    MAX_POOL_SIZE, PowerProfile,
};
pub use source::EntropyReader;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
