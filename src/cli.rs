use clap::Parser;
use std::path::PathBuf;

use crate::core::scheduler::NetworkClass;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Decode: simulated (in-process)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Short-video feed lifecycle simulator
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Number of synthetic feed items to add
    #[arg(short = 'n', long = "items", value_name = "N", default_value_t = 200)]
    pub items: usize,

    /// Load feed items from a JSON array of item sources instead
    #[arg(short = 'f', long = "feed", value_name = "FEED")]
    pub feed: Option<PathBuf>,

    /// Focus indices to scroll through, in order
    #[arg(short = 's', long = "scroll", value_name = "INDEX", value_delimiter = ',', default_value = "0,1,2,3,10,50,100")]
    pub scroll: Vec<usize>,

    /// Network class for the whole run
    #[arg(long = "network", value_enum, default_value = "unmetered")]
    pub network: NetworkArg,

    /// Override max resident decode sessions
    #[arg(long = "max-resident", value_name = "N")]
    pub max_resident: Option<usize>,

    /// Simulated initialize latency
    #[arg(long = "latency-ms", value_name = "MS", default_value_t = 5)]
    pub latency_ms: u64,

    /// Simulated memory cost of one decode session
    #[arg(long = "bytes-mb", value_name = "MB", default_value_t = 8)]
    pub bytes_mb: usize,

    /// Make every Nth item fail to initialize (0 = never)
    #[arg(long = "fail-every", value_name = "N", default_value_t = 0)]
    pub fail_every: usize,

    /// Deliver a memory-pressure event after this many scroll steps
    #[arg(long = "pressure-at", value_name = "STEP")]
    pub pressure_at: Option<usize>,

    /// Enable debug logging to file (default: feedreel.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Write the effective settings back to the config file
    #[arg(long = "save-config")]
    pub save_config: bool,
}

/// CLI spelling of `NetworkClass`
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkArg {
    Unmetered,
    Metered,
    Offline,
}

impl From<NetworkArg> for NetworkClass {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Unmetered => NetworkClass::Unmetered,
            NetworkArg::Metered => NetworkClass::Metered,
            NetworkArg::Offline => NetworkClass::Offline,
        }
    }
}
