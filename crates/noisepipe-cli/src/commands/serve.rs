use std::path::PathBuf;

use log::info;
use noisepipe_core::{BrokerConfig, PostProcessing, Result};
use noisepipe_server::EntropyBroker;

/// Command-line values layered over the config file.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub config_path: Option<PathBuf>,
    pub device: Option<PathBuf>,
    pub device_index: Option<usize>,
    pub endpoint: Option<PathBuf>,
    pub pool_size: Option<usize>,
    pub power_profile: Option<u8>,
    pub post_processing: Option<PostProcessing>,
    pub no_post_processing: bool,
    pub no_self_test: bool,
}

impl ServeOverrides {
    /// Load the config file (or defaults) and apply every flag that was given.
    pub fn resolve(self) -> Result<BrokerConfig> {
        let mut config = match &self.config_path {
            Some(path) => BrokerConfig::from_file(path)?,
            None => BrokerConfig::default(),
        };
        if let Some(device) = self.device {
            config.device_path = Some(device);
        }
        if let Some(index) = self.device_index {
            config.device_index = index;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(level) = self.power_profile {
            config.power_profile = level;
        }
        if let Some(method) = self.post_processing {
            config.post_processing = method;
        }
        if self.no_post_processing {
            config.post_processing_enabled = false;
        }
        if self.no_self_test {
            config.self_test_enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn run(overrides: ServeOverrides) {
    let config = overrides
        .resolve()
        .unwrap_or_else(|e| super::fail("configuration", e));
    let broker = EntropyBroker::from_config(&config)
        .unwrap_or_else(|e| super::fail("opening device", e));

    println!("noisepipe broker v{}", noisepipe_core::VERSION);
    println!("   endpoint: {}", broker.endpoint().display());
    println!("   slots:    {}", broker.pool_size());
    match config.session() {
        Ok(session) => match session.post_processing {
            Some(method) => println!("   output:   {method}"),
            None => println!("   output:   raw"),
        },
        Err(e) => super::fail("configuration", e),
    }
    println!("Press Ctrl+C to stop.");

    let (stop, shutdown) = tokio::sync::watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop.send(true);
    }) {
        super::fail("installing Ctrl+C handler", e);
    }

    let runtime = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| super::fail("starting runtime", e));
    if let Err(e) = runtime.block_on(broker.run(shutdown)) {
        super::fail("broker", e);
    }
    info!("shutdown complete");
}
