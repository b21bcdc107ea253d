//! Runtime configuration
//!
//! A typed [`Config`] built from the CLI arguments and threaded through
//! `main` to the pipeline stages.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::cli::Cli;
use crate::protocol::ProtocolKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    BadProtocol(String),
    #[error("need at least one port")]
    NoPorts,
    #[error("report interval must be at least one second")]
    BadInterval,
}

/// Validated runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub interface: Option<String>,
    pub read_file: Option<String>,
    pub buffer_size_mib: usize,
    #[serde(skip)]
    pub protocol: ProtocolKind,
    pub ports: Vec<u16>,
    pub assembly_workers: usize,
    pub decode_workers: usize,
    pub analysis_workers: usize,
    pub filter: String,
    pub format: String,
    pub interval: Duration,
    pub top: usize,
    pub output: Option<PathBuf>,
    pub cumulative: bool,
    pub no_delay: bool,
    pub json_reports: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Config, ConfigError> {
        let protocol: ProtocolKind = cli.protocol.parse().map_err(ConfigError::BadProtocol)?;
        if cli.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if cli.interval == 0 {
            return Err(ConfigError::BadInterval);
        }
        let assembly_workers = if cli.assembly_workers == 0 {
            num_cpus::get().max(1)
        } else {
            cli.assembly_workers
        };
        Ok(Config {
            interface: cli.interface.clone(),
            read_file: cli.read.clone(),
            buffer_size_mib: cli.buffer_size,
            protocol,
            ports: cli.ports.clone(),
            assembly_workers,
            decode_workers: cli.decode_workers,
            analysis_workers: cli.analysis_workers,
            filter: cli.filter.clone(),
            format: cli.format.clone(),
            interval: Duration::from_secs(cli.interval),
            top: cli.top,
            output: cli.output.clone(),
            cumulative: cli.cumulative,
            no_delay: cli.nodelay,
            json_reports: cli.nogui,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from(["cachetop", "-r", "x.pcap", "-P", "redis"]);
        let cfg = Config::from_cli(&cli).unwrap();
        assert_eq!(cfg.protocol, ProtocolKind::Redis);
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert!(cfg.assembly_workers >= 1);
    }

    #[test]
    fn test_bad_protocol() {
        let cli = Cli::parse_from(["cachetop", "-r", "x.pcap", "-P", "http"]);
        assert!(matches!(
            Config::from_cli(&cli),
            Err(ConfigError::BadProtocol(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cli = Cli::parse_from(["cachetop", "-r", "x.pcap", "-n", "0"]);
        assert!(matches!(
            Config::from_cli(&cli),
            Err(ConfigError::BadInterval)
        ));
    }
}
