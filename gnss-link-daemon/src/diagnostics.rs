//! Command line and logging
//!
//! Argument parsing, logging initialisation and the output helpers shared by
//! the subcommands.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use gnss_link_protocol::{DeviceId, DeviceRecord, DirectoryEntry, LiveGnssSample};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// gnss-link command-line interface
#[derive(Parser, Debug)]
#[command(name = "gnss-link")]
#[command(about = "Talk to GNSS logger accessories over Bluetooth LE", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs (`--timestamps false` to hide them)
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub timestamps: bool,

    /// Device to talk to (defaults to the last connected device)
    #[arg(short, long, global = true, value_name = "UUID")]
    pub device: Option<DeviceId>,

    /// Use an alternate configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan for loggers
    Scan {
        /// Look for loggers advertising pairing mode
        #[arg(long)]
        pairing: bool,

        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },

    /// List a remote directory
    List {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Download a remote file
    Download {
        remote: String,
        local: PathBuf,

        /// Expected size in bytes, for progress reporting
        #[arg(long, default_value = "0")]
        size: u64,
    },

    /// Upload a local file
    Upload { local: PathBuf, remote: String },

    /// Print live GNSS samples
    Live {
        /// Stop after this many samples (0 = run until interrupted)
        #[arg(short, long, default_value = "0")]
        count: usize,
    },

    /// Read or change the live field mask
    Mask {
        #[command(subcommand)]
        action: MaskAction,
    },

    /// Start the remote countdown
    Start,

    /// Cancel a running countdown
    CancelStart,

    /// Forget a bonded logger
    Forget { id: DeviceId },

    /// Show the current configuration
    DumpConfig,

    /// Show version and build information
    Version,
}

#[derive(Subcommand, Debug)]
pub enum MaskAction {
    Get,
    Set {
        /// Mask value, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_mask)]
        value: u8,
    },
}

fn parse_mask(value: &str) -> std::result::Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid mask '{}': {}", value, e))
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );
    Ok(())
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit_index])
    }
}

pub fn format_device(device: &DeviceRecord) -> String {
    let rssi = device
        .rssi
        .map(|r| format!("{} dBm", r))
        .unwrap_or_else(|| "-".to_string());
    let mut flags = Vec::new();
    if device.is_bonded {
        flags.push("bonded");
    }
    if device.is_connected {
        flags.push("connected");
    }
    if device.is_advertising_pairing_mode {
        flags.push("pairing");
    }
    format!(
        "{}  {:<20} {:>8}  {}",
        device.id,
        device.display_name(),
        rssi,
        flags.join(",")
    )
}

pub fn format_entry(entry: &DirectoryEntry) -> String {
    let size = if entry.is_directory() {
        "<DIR>".to_string()
    } else {
        format_bytes(u64::from(entry.size))
    };
    format!(
        "{}  {}  {:>10}  {}",
        entry.attributes.flag_string(),
        entry.modified.format("%Y-%m-%d %H:%M:%S"),
        size,
        entry.name
    )
}

pub fn format_sample(sample: &LiveGnssSample) -> String {
    let mut parts = Vec::new();
    if let Some(tow) = sample.time_of_week_ms {
        parts.push(format!("tow={}ms", tow));
    }
    if let Some(p) = &sample.position {
        parts.push(format!(
            "lat={:.7} lon={:.7} h={:.3}m",
            p.latitude, p.longitude, p.height
        ));
    }
    if let Some(v) = &sample.velocity {
        parts.push(format!(
            "vn={:.3} ve={:.3} vd={:.3}",
            v.north, v.east, v.down
        ));
    }
    if let Some(a) = &sample.accuracy {
        parts.push(format!(
            "hacc={:.3}m vacc={:.3}m",
            a.horizontal, a.vertical
        ));
    }
    if let Some(sats) = sample.satellites {
        parts.push(format!("sats={}", sats));
    }
    if sample.truncated {
        parts.push("(truncated)".to_string());
    }
    parts.join(" ")
}

/// Build information for diagnostics
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: Option<&'static str>,
}

impl BuildInfo {
    pub fn get() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: option_env!("GIT_HASH"),
        }
    }

    pub fn display(&self) {
        println!("gnss-link v{}", self.version);
        if let Some(hash) = self.git_hash {
            println!("Git commit: {}", hash);
        }
        println!(
            "BLE backend: {}",
            if cfg!(feature = "ble") { "btleplug" } else { "none" }
        );
        println!("Platform: {}", std::env::consts::OS);
        println!("Architecture: {}", std::env::consts::ARCH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("7"), Ok(7));
        assert_eq!(parse_mask("0x1F"), Ok(0x1F));
        assert!(parse_mask("0x100").is_err());
        assert!(parse_mask("seven").is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "gnss-link",
            "--device",
            "6e400001-b5a3-f393-e0a9-e50e24dc4179",
            "mask",
            "set",
            "0x07",
        ])
        .unwrap();
        assert!(cli.device.is_some());
        assert!(matches!(
            cli.command,
            Command::Mask {
                action: MaskAction::Set { value: 0x07 }
            }
        ));

        let cli = Cli::try_parse_from(["gnss-link", "scan", "--pairing"]).unwrap();
        assert!(cli.timestamps);
        assert!(matches!(
            cli.command,
            Command::Scan {
                pairing: true,
                seconds: 10
            }
        ));
    }

    #[test]
    fn test_timestamps_can_be_disabled() {
        let cli = Cli::try_parse_from(["gnss-link", "--timestamps", "false", "version"]).unwrap();
        assert!(!cli.timestamps);
        let cli = Cli::try_parse_from(["gnss-link", "--timestamps", "true", "version"]).unwrap();
        assert!(cli.timestamps);
    }
}
