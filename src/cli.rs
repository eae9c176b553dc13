use clap::Parser;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use mtr_trace::Config;

/// Concurrent traceroute to many targets through the mtr-packet helper
#[derive(Parser, Debug, Clone)]
#[command(name = "mtr-trace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target hosts to trace (IP address or hostname)
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Local IPv4 address probes are sent from
    #[arg(long = "local-ipv4")]
    pub local_ipv4: Option<Ipv4Addr>,

    /// Local IPv6 address probes are sent from
    #[arg(long = "local-ipv6")]
    pub local_ipv6: Option<Ipv6Addr>,

    /// Path to the mtr-packet binary (default: found on $PATH)
    #[arg(long = "helper")]
    pub helper: Option<PathBuf>,

    /// Config file (default: ~/.config/mtr-trace/config.toml if present)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Maximum TTL (hops)
    #[arg(short = 'm', long = "max-ttl")]
    pub max_ttl: Option<u8>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.max_ttl == Some(0) {
            return Err("Max TTL must be at least 1".into());
        }
        if self.targets.iter().any(|t| t.trim().is_empty()) {
            return Err("Target cannot be empty".into());
        }
        Ok(())
    }

    /// Command-line values override the loaded config
    pub fn apply(&self, config: &mut Config) {
        if let Some(ip) = self.local_ipv4 {
            config.local_ipv4 = Some(ip);
        }
        if let Some(ip) = self.local_ipv6 {
            config.local_ipv6 = Some(ip);
        }
        if let Some(max_ttl) = self.max_ttl {
            config.max_ttl = max_ttl;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mtr-trace").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_targets_required() {
        assert!(Args::try_parse_from(["mtr-trace"]).is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args = parse(&["--local-ipv4", "10.1.2.3", "-m", "20", "8.8.8.8"]);
        let mut config = Config {
            local_ipv6: Some(Ipv6Addr::LOCALHOST),
            ..Config::default()
        };
        args.apply(&mut config);
        assert_eq!(config.local_ipv4, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(config.local_ipv6, Some(Ipv6Addr::LOCALHOST));
        assert_eq!(config.max_ttl, 20);
    }

    #[test]
    fn test_bad_local_address_rejected() {
        assert!(Args::try_parse_from(["mtr-trace", "--local-ipv4", "::1", "8.8.8.8"]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(parse(&["8.8.8.8"]).validate().is_ok());
        assert!(parse(&["-m", "0", "8.8.8.8"]).validate().is_err());
    }
}
