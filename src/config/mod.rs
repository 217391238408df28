use std::{
    num::{NonZeroUsize, ParseIntError},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use thiserror::Error;

use crate::{
    capture::DispatchSettings,
    stream::{assembler::AssemblerSettings, StreamSettings},
};

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port in host entry {entry:?}: {source}")]
    InvalidPort {
        entry: String,
        #[source]
        source: ParseIntError,
    },

    #[error("host entry {0:?} cannot be used in a capture filter")]
    InvalidFilter(String),

    #[error("exactly one of --device or --file must be given")]
    Source,
}

#[derive(Debug, Parser)]
#[command(
    name = "httpdump",
    about = "Capture HTTP/1.x transactions from network traffic"
)]
pub struct Args {
    /// Interface to capture on
    #[arg(long)]
    pub device: Option<String>,

    /// Read packets from a pcap file instead of a device, `-` for stdin
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Comma separated IP:port list, e.g. 1.1.1.1:80,:9090 (`:port` = any host)
    #[arg(long, default_value = ":80")]
    pub hosts: String,

    /// Only print transactions whose request path contains this
    #[arg(long)]
    pub path: Option<String>,

    /// Capacity of each direction's delivery queue, in segments
    #[arg(long, default_value = "1024")]
    pub network_stream_channel_size: NonZeroUsize,

    /// Timeout of a single wait for stream data (ms)
    #[arg(long, default_value_t = 5_000)]
    pub network_stream_channel_timeout_ms: u64,

    /// Poll interval while a delivery queue is full (ms)
    #[arg(long, default_value_t = 20)]
    pub full_channel_check_interval_ms: u64,

    /// Abandon a stream whose queue stays full this long (ms)
    #[arg(long, default_value_t = 5_000)]
    pub full_channel_timeout_ms: u64,

    /// Idle time after which a connection is considered dead (ms)
    #[arg(long, default_value_t = 60_000)]
    pub response_timeout_ms: u64,

    /// Interval of the idle connection sweep (ms)
    #[arg(long, default_value_t = 10_000)]
    pub flush_interval_ms: u64,

    /// Interval of aggregated warning summaries (ms)
    #[arg(long, default_value_t = 60_000)]
    pub aggregated_log_interval_ms: u64,

    /// Truncate error text in warnings to this many characters
    #[arg(long, default_value_t = 50)]
    pub limited_error_length: usize,

    /// 0 = info, 1 = debug, 2 = trace; RUST_LOG overrides
    #[arg(long, short, default_value_t = 0)]
    pub verbose: u8,
}

/// Where packets come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Device(String),
    File(PathBuf),
}

impl Args {
    pub fn source(&self) -> Result<Source, ConfigError> {
        match (&self.device, &self.file) {
            (Some(device), None) => Ok(Source::Device(device.clone())),
            (None, Some(file)) => Ok(Source::File(file.clone())),
            _ => Err(ConfigError::Source),
        }
    }

    pub fn capture_filter(&self) -> Result<String, ConfigError> {
        Ok(capture_filter(&parse_hosts(&self.hosts)?))
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            channel_size: self.network_stream_channel_size.get(),
            read_timeout: Duration::from_millis(self.network_stream_channel_timeout_ms),
            full_channel_check_interval: Duration::from_millis(self.full_channel_check_interval_ms),
            full_channel_timeout: Duration::from_millis(self.full_channel_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
        }
    }

    pub fn assembler_settings(&self) -> AssemblerSettings {
        AssemblerSettings {
            stream: self.stream_settings(),
            limited_error_length: self.limited_error_length,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            aggregated_log_interval: Duration::from_millis(self.aggregated_log_interval_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
        }
    }
}

/// One allow-list entry. An empty `ip` matches every host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub ip: String,
    pub port: u16,
}

pub fn parse_hosts(arg: &str) -> Result<Vec<Host>, ConfigError> {
    arg.trim().split(',').map(|entry| parse_host(entry.trim())).collect()
}

fn parse_host(entry: &str) -> Result<Host, ConfigError> {
    let filter_safe = entry
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '[' | ']'));
    if !filter_safe {
        return Err(ConfigError::InvalidFilter(entry.to_string()));
    }

    match entry.rsplit_once(':') {
        Some((ip, port)) if !ip.ends_with(':') => Ok(Host {
            ip: ip.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: port.parse().map_err(|source| ConfigError::InvalidPort {
                entry: entry.to_string(),
                source,
            })?,
        }),
        _ => Ok(Host {
            ip: entry.to_string(),
            port: DEFAULT_PORT,
        }),
    }
}

fn host_filter(host: &Host) -> String {
    if host.ip.is_empty() {
        format!("tcp port {}", host.port)
    } else {
        format!("tcp port {} and host {}", host.port, host.ip)
    }
}

/// BPF expression matching any of `hosts`.
pub fn capture_filter(hosts: &[Host]) -> String {
    match hosts {
        [] => format!("tcp port {DEFAULT_PORT}"),
        [host] => host_filter(host),
        hosts => {
            let filters: Vec<String> = hosts.iter().map(host_filter).collect();
            format!("({})", filters.join(") or ("))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_entries() {
        let hosts = parse_hosts("1.1.1.1:80, :9090,10.0.0.7").unwrap();

        assert_eq!(
            hosts,
            vec![
                Host { ip: "1.1.1.1".into(), port: 80 },
                Host { ip: "".into(), port: 9090 },
                Host { ip: "10.0.0.7".into(), port: 80 },
            ]
        );
    }

    #[test]
    fn empty_list_captures_port_80() {
        let hosts = parse_hosts("").unwrap();
        assert_eq!(capture_filter(&hosts), "tcp port 80");
    }

    #[test]
    fn rejects_bad_port() {
        assert!(matches!(
            parse_hosts("1.1.1.1:http"),
            Err(ConfigError::InvalidPort { .. })
        ));
    }

    #[test]
    fn rejects_entries_unusable_in_filter() {
        assert!(matches!(
            parse_hosts("1.1.1.1 or port 22:80"),
            Err(ConfigError::InvalidFilter(_))
        ));
        assert!(matches!(
            parse_hosts("(10.0.0.1):80"),
            Err(ConfigError::InvalidFilter(_))
        ));
    }

    #[test]
    fn rejects_zero_channel_size() {
        let parsed = Args::try_parse_from([
            "httpdump",
            "--device",
            "eth0",
            "--network-stream-channel-size",
            "0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn builds_bpf_filter() {
        let hosts = parse_hosts("1.1.1.1:80,:9090").unwrap();
        assert_eq!(
            capture_filter(&hosts),
            "(tcp port 80 and host 1.1.1.1) or (tcp port 9090)"
        );
        assert_eq!(
            capture_filter(&parse_hosts("[fe80::1]:8080").unwrap()),
            "tcp port 8080 and host fe80::1"
        );
    }

    #[test]
    fn requires_one_source() {
        let args = Args::parse_from(["httpdump"]);
        assert!(matches!(args.source(), Err(ConfigError::Source)));

        let args = Args::parse_from([
            "httpdump",
            "--file",
            "trace.pcap",
            "--response-timeout-ms",
            "250",
        ]);
        assert_eq!(args.source().unwrap(), Source::File("trace.pcap".into()));
        assert_eq!(args.stream_settings().response_timeout, Duration::from_millis(250));
        assert_eq!(args.capture_filter().unwrap(), "tcp port 80");
    }
}
