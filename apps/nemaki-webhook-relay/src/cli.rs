//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nemaki-webhook-relay",
    about = "NemakiWare webhook relay",
    version,
    long_about = "Reads repository change events as JSON lines on stdin and fans them \
                  out to the registered webhooks, batching folder child events."
)]
pub struct Args {
    /// JSON file listing webhook registrations per object
    #[arg(short, long, env = "NEMAKI_WEBHOOK_REGISTRATIONS")]
    pub registrations: Option<PathBuf>,

    /// Settings file (toml, yaml or json); environment variables override it
    #[arg(short, long, env = "NEMAKI_WEBHOOK_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Send one TEST payload to this URL, print the result and exit
    #[arg(long, value_name = "URL")]
    pub probe: Option<String>,

    /// Secret used to sign the probe payload
    #[arg(long, requires = "probe", env = "NEMAKI_WEBHOOK_PROBE_SECRET")]
    pub probe_secret: Option<String>,

    /// Repository id reported in the probe payload
    #[arg(long, default_value = "bedroom")]
    pub repository: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}
