use std::path::PathBuf;

use clap::Parser;
use layerd_core::DEFAULT_CONFIG_PATH;

use crate::logging::LogFormat;

pub const DEFAULT_ADDRESS: &str = "/run/layerd/layerd.sock";
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/layerd";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// layerd — overlay snapshotter serving the containerd snapshots API.
#[derive(Debug, Parser)]
#[command(name = "layerd", about, disable_version_flag = true)]
pub struct Args {
    /// Address for the snapshotter's gRPC server.
    #[arg(long, env = "LAYERD_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: PathBuf,

    /// Path to the configuration file.
    #[arg(long, env = "LAYERD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Logging level [trace, debug, info, warn, error, fatal, panic].
    #[arg(long, env = "LAYERD_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LAYERD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Path to the root directory for this snapshotter.
    #[arg(long, env = "LAYERD_ROOT", default_value = DEFAULT_ROOT_DIR)]
    pub root: PathBuf,

    /// Print the version and exit.
    #[arg(long)]
    pub version: bool,
}
