//! Command-line interface

use clap::Parser;
use std::path::PathBuf;

/// Passive network analyzer reporting the hottest memcached/redis keys.
///
/// Observes live traffic on an interface (or replays a pcap file) and
/// periodically prints the keys accounting for the most traffic, grouped
/// and aggregated according to `--format`.
#[derive(Debug, Parser)]
#[command(name = "cachetop", version, about)]
pub struct Cli {
    /// Network interface to sniff
    #[arg(short = 'i', long)]
    pub interface: Option<String>,

    /// pcap file to read ("-" for stdin)
    #[arg(short = 'r', long = "read")]
    pub read: Option<String>,

    /// MiB of kernel buffer for packet data
    #[arg(short = 'b', long = "buffersize", default_value_t = 8)]
    pub buffer_size: usize,

    /// Protocol to parse: mctext, redis or infer
    #[arg(short = 'P', long, default_value = "infer")]
    pub protocol: String,

    /// Server ports to watch
    #[arg(short = 'p', long, value_delimiter = ',', default_value = "6379,11211")]
    pub ports: Vec<u16>,

    /// Number of TCP assembly workers (0 = one per CPU)
    #[arg(long = "assemblyworkers", default_value_t = 0)]
    pub assembly_workers: usize,

    /// Number of packet decode workers
    #[arg(long = "decodeworkers", default_value_t = 8)]
    pub decode_workers: usize,

    /// Number of analysis workers
    #[arg(long = "analysisworkers", default_value_t = 32)]
    pub analysis_workers: usize,

    /// Regex pattern of cache keys to track (empty = all)
    #[arg(long, default_value = "")]
    pub filter: String,

    /// Aggregation descriptor: comma-separated key fields and aggregates,
    /// e.g. "key,max(size),sum(size),p99(size)"
    #[arg(short = 'f', long, default_value = "key,max(size),sum(size)")]
    pub format: String,

    /// Seconds between reports
    #[arg(short = 'n', long, default_value_t = 1)]
    pub interval: u64,

    /// Number of keys to report
    #[arg(short = 't', long, default_value_t = 100)]
    pub top: usize,

    /// Write JSON reports to this file instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Accumulate keys over all time instead of per interval
    #[arg(long)]
    pub cumulative: bool,

    /// Replay a file at maximum speed instead of the original capture rate
    #[arg(long)]
    pub nodelay: bool,

    /// Emit newline-delimited JSON reports instead of tables
    #[arg(long)]
    pub nogui: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["cachetop", "-r", "trace.pcap"]);
        assert_eq!(cli.read.as_deref(), Some("trace.pcap"));
        assert_eq!(cli.ports, vec![6379, 11211]);
        assert_eq!(cli.format, "key,max(size),sum(size)");
        assert_eq!(cli.protocol, "infer");
        assert_eq!(cli.interval, 1);
        assert_eq!(cli.decode_workers, 8);
        assert_eq!(cli.analysis_workers, 32);
        assert!(!cli.cumulative);
    }

    #[test]
    fn test_port_list() {
        let cli = Cli::parse_from(["cachetop", "-i", "eth0", "-p", "11211,11212"]);
        assert_eq!(cli.ports, vec![11211, 11212]);
    }

    #[test]
    fn test_flags_round_trip() {
        let cli = Cli::parse_from([
            "cachetop",
            "-r",
            "-",
            "--nodelay",
            "--nogui",
            "--cumulative",
            "-f",
            "key,p99(size)",
            "--filter",
            "^user:",
            "-n",
            "5",
        ]);
        assert_eq!(cli.read.as_deref(), Some("-"));
        assert!(cli.nodelay && cli.nogui && cli.cumulative);
        assert_eq!(cli.format, "key,p99(size)");
        assert_eq!(cli.filter, "^user:");
        assert_eq!(cli.interval, 5);
    }
}
