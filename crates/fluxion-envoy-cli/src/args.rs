// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use clap::{Parser, Subcommand, ValueEnum};
use fluxion_envoy::StorageMode;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "envoy-reader", version)]
#[command(about = "Read and control an Enphase Envoy solar gateway")]
#[command(
    long_about = "Polls an Enphase Envoy, prints its metrics and forwards control commands.\n\
    \nConfiguration is read from --config (default envoy.toml) and ENVOY_HOST,\n\
    ENVOY_USERNAME, ENVOY_PASSWORD, ENVOY_SERIAL override it.\n\
    \nExamples:\n  \
    envoy-reader poll --once               # One refresh, print every metric\n  \
    envoy-reader poll --metric production  # Keep polling a single metric\n  \
    envoy-reader stream                    # Follow the live CT meter stream"
)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Refresh periodically and print metric values as JSON
    Poll(PollArgs),

    /// Follow the realtime meter stream (metered Envoy with CTs only)
    Stream,

    /// Print the Envoy serial number from info.xml
    Serial,

    /// Detect the Envoy model and list the metrics it provides
    Metrics,

    /// Turn inverter production on or off
    Power {
        #[arg(value_enum)]
        state: PowerState,
    },

    /// Enable dynamic power export limiting
    DpelEnable {
        /// Export limit in watts
        #[arg(long)]
        limit_watts: f64,

        /// Ramp rate of the limiter
        #[arg(long, default_value_t = 10.0)]
        slew_rate: f64,

        /// Limit export instead of production
        #[arg(long, default_value_t = false)]
        export_limit: bool,
    },

    /// Disable dynamic power export limiting
    DpelDisable,

    /// List the selected and available grid profiles
    GridProfiles,

    /// Select a grid profile by id
    SetGridProfile { profile_id: String },

    /// Upload a grid profile package
    UploadGridProfile {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Change battery storage settings
    Storage(StorageArgs),
}

#[derive(Debug, Parser)]
pub struct PollArgs {
    /// Refresh once and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Only print these metrics (repeatable)
    #[arg(long = "metric", value_name = "NAME")]
    pub metrics: Vec<String>,

    /// Seconds between refreshes (defaults to scan_interval_secs)
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,
}

#[derive(Debug, Parser)]
pub struct StorageArgs {
    #[arg(long, value_enum)]
    pub mode: Option<StorageModeArg>,

    /// Reserve kept for backup (percent)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub reserved_soc: Option<u8>,

    /// Very low state of charge threshold (percent)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub very_low_soc: Option<u8>,

    #[arg(long)]
    pub charge_from_grid: Option<bool>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PowerState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StorageModeArg {
    Backup,
    SelfConsumption,
    SavingsMode,
    Economy,
}

impl From<StorageModeArg> for StorageMode {
    fn from(mode: StorageModeArg) -> Self {
        match mode {
            StorageModeArg::Backup => Self::Backup,
            StorageModeArg::SelfConsumption => Self::SelfConsumption,
            StorageModeArg::SavingsMode => Self::SavingsMode,
            StorageModeArg::Economy => Self::Economy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_command() {
        let cli = Cli::parse_from([
            "envoy-reader",
            "--config",
            "site.toml",
            "storage",
            "--mode",
            "self-consumption",
            "--reserved-soc",
            "20",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("site.toml")));
        let Commands::Storage(args) = cli.command else {
            panic!("expected storage command");
        };
        assert!(matches!(args.mode, Some(StorageModeArg::SelfConsumption)));
        assert_eq!(args.reserved_soc, Some(20));
        assert_eq!(args.charge_from_grid, None);
    }

    #[test]
    fn test_reject_out_of_range_soc() {
        let result = Cli::try_parse_from(["envoy-reader", "storage", "--reserved-soc", "140"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_metrics_listing() {
        let cli = Cli::parse_from(["envoy-reader", "metrics"]);
        assert!(matches!(cli.command, Commands::Metrics));
    }

    #[test]
    fn test_parse_poll_metrics() {
        let cli = Cli::parse_from([
            "envoy-reader",
            "poll",
            "--once",
            "--metric",
            "production",
            "--metric",
            "consumption",
        ]);
        let Commands::Poll(args) = cli.command else {
            panic!("expected poll command");
        };
        assert!(args.once);
        assert_eq!(args.metrics, vec!["production", "consumption"]);
    }
}
