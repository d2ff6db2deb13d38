//! CLI for noisepipe: host the entropy broker and inspect it.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use noisepipe_core::PostProcessing;

#[derive(Parser)]
#[command(name = "noisepipe")]
#[command(about = "noisepipe: one hardware TRNG, many local consumers")]
#[command(version = noisepipe_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached entropy devices in discovery order
    Devices,

    /// Open a device and serve it on the local endpoint until Ctrl+C
    Serve {
        /// JSON config file; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Device path (overrides device_index)
        #[arg(long)]
        device: Option<PathBuf>,

        /// Index into the discovered device list
        #[arg(long)]
        device_index: Option<usize>,

        /// Unix socket path clients connect to
        #[arg(long)]
        endpoint: Option<PathBuf>,

        /// Concurrent client slots (1-64)
        #[arg(long)]
        pool_size: Option<usize>,

        /// Device power profile (0-9)
        #[arg(long)]
        power_profile: Option<u8>,

        /// Post-processing: sha256, sha512, xorshift64
        #[arg(long)]
        post_processing: Option<PostProcessing>,

        /// Serve raw device entropy
        #[arg(long)]
        no_post_processing: bool,

        /// Skip startup diagnostics and continuous health tests
        #[arg(long)]
        no_self_test: bool,
    },

    /// Query a running broker for device identity and status
    Info {
        /// Unix socket path of the broker
        #[arg(long)]
        endpoint: Option<PathBuf>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => commands::devices::run(),
        Commands::Serve {
            config,
            device,
            device_index,
            endpoint,
            pool_size,
            power_profile,
            post_processing,
            no_post_processing,
            no_self_test,
        } => commands::serve::run(commands::serve::ServeOverrides {
            config_path: config,
            device,
            device_index,
            endpoint,
            pool_size,
            power_profile,
            post_processing,
            no_post_processing,
            no_self_test,
        }),
        Commands::Info { endpoint, json } => commands::info::run(endpoint.as_deref(), json),
    }
}
