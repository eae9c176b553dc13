use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;
use crate::probe::Family;
use crate::state::WalkLimits;

/// Probe timeout passed to mtr-packet
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Our own watchdog; must exceed `REQUEST_TIMEOUT`
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(7);
/// Delay before re-sending a timed-out or refused probe
pub const RETRY_WAIT: Duration = Duration::from_secs(3);
/// Consecutive silent hops that end a trace
pub const NO_REPLY_MAX_TTL: u32 = 10;
/// Highest TTL ever probed
pub const MAX_TTL: u8 = 50;

/// mtr-packet gives up on a probe on its own after roughly this long
const HELPER_HORIZON: Duration = Duration::from_secs(60);

/// Engine configuration: local origins and protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Source address for IPv4 traces
    pub local_ipv4: Option<Ipv4Addr>,
    /// Source address for IPv6 traces
    pub local_ipv6: Option<Ipv6Addr>,
    /// Probe timeout handed to the helper; must be whole seconds
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Watchdog for a missing helper response
    #[serde(with = "duration_serde")]
    pub wait_timeout: Duration,
    /// Delay before retrying after a timeout or `probes-exhausted`
    #[serde(with = "duration_serde")]
    pub retry_wait: Duration,
    /// Consecutive `no-reply` hops that complete a trace
    pub no_reply_max_ttl: u32,
    /// Maximum TTL
    pub max_ttl: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_ipv4: None,
            local_ipv6: None,
            request_timeout: REQUEST_TIMEOUT,
            wait_timeout: WAIT_TIMEOUT,
            retry_wait: RETRY_WAIT,
            no_reply_max_ttl: NO_REPLY_MAX_TTL,
            max_ttl: MAX_TTL,
        }
    }
}

impl Config {
    /// Default config file location: ~/.config/mtr-trace/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mtr-trace").join("config.toml"))
    }

    /// Load a TOML config file; unset fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Check timing invariants and that at least one origin is set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_ipv4.is_none() && self.local_ipv6.is_none() {
            return Err(ConfigError::NoLocalOrigin);
        }
        if self.request_timeout < Duration::from_secs(1) {
            return Err(ConfigError::Invalid(
                "request_timeout must be at least 1 second".into(),
            ));
        }
        if self.request_timeout.subsec_nanos() != 0 {
            return Err(ConfigError::Invalid(format!(
                "request_timeout ({:?}) must be a whole number of seconds",
                self.request_timeout
            )));
        }
        if self.wait_timeout <= self.request_timeout {
            return Err(ConfigError::Invalid(format!(
                "wait_timeout ({:?}) must be greater than request_timeout ({:?})",
                self.wait_timeout, self.request_timeout
            )));
        }
        if self.no_reply_max_ttl == 0 {
            return Err(ConfigError::Invalid(
                "no_reply_max_ttl must be at least 1".into(),
            ));
        }
        if self.max_ttl == 0 {
            return Err(ConfigError::Invalid("max_ttl must be at least 1".into()));
        }
        // None means the product overflowed, which is past the horizon too
        let silent_walk = self.request_timeout.checked_mul(self.no_reply_max_ttl);
        if silent_walk.is_none_or(|walk| walk >= HELPER_HORIZON) {
            warn!(
                "request_timeout ({:?}) * no_reply_max_ttl ({}) reaches the helper's own timeout horizon ({:?})",
                self.request_timeout, self.no_reply_max_ttl, HELPER_HORIZON
            );
        }
        Ok(())
    }

    /// Local origin to use for a target of `family`
    pub fn local_for(&self, family: Family) -> Result<IpAddr, ConfigError> {
        let local = match family {
            Family::V4 => self.local_ipv4.map(IpAddr::V4),
            Family::V6 => self.local_ipv6.map(IpAddr::V6),
        };
        local.ok_or(ConfigError::NoLocalAddress(family))
    }

    pub fn walk_limits(&self) -> WalkLimits {
        WalkLimits {
            max_ttl: self.max_ttl,
            no_reply_max: self.no_reply_max_ttl,
            request_timeout: self.request_timeout,
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_ipv4() -> Config {
        Config {
            local_ipv4: Some(Ipv4Addr::LOCALHOST),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.wait_timeout, Duration::from_secs(7));
        assert_eq!(config.retry_wait, Duration::from_secs(3));
        assert_eq!(config.no_reply_max_ttl, 10);
        assert_eq!(config.max_ttl, 50);
        assert!(config.wait_timeout > config.request_timeout);
    }

    #[test]
    fn test_validate_requires_an_origin() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::NoLocalOrigin)
        ));
        assert!(with_ipv4().validate().is_ok());
        let v6_only = Config {
            local_ipv6: Some(Ipv6Addr::LOCALHOST),
            ..Config::default()
        };
        assert!(v6_only.validate().is_ok());
    }

    #[test]
    fn test_validate_wait_must_exceed_request_timeout() {
        let config = Config {
            wait_timeout: Duration::from_secs(5),
            ..with_ipv4()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = Config {
            max_ttl: 0,
            ..with_ipv4()
        };
        assert!(config.validate().is_err());
        let config = Config {
            no_reply_max_ttl: 0,
            ..with_ipv4()
        };
        assert!(config.validate().is_err());
        let config = Config {
            request_timeout: Duration::from_millis(500),
            ..with_ipv4()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_fractional_request_timeout() {
        let config = Config {
            request_timeout: Duration::from_millis(5900),
            ..with_ipv4()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_huge_timeouts_do_not_overflow() {
        let config = Config {
            request_timeout: Duration::from_secs(u64::MAX / 4),
            wait_timeout: Duration::from_secs(u64::MAX / 2),
            no_reply_max_ttl: 10,
            ..with_ipv4()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_for_family() {
        let config = with_ipv4();
        assert_eq!(
            config.local_for(Family::V4).unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert!(matches!(
            config.local_for(Family::V6),
            Err(ConfigError::NoLocalAddress(Family::V6))
        ));
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "local_ipv4 = \"10.1.2.3\"\nretry_wait = 0.5\nmax_ttl = 30"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.local_ipv4, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(config.retry_wait, Duration::from_millis(500));
        assert_eq!(config.max_ttl, 30);
        assert_eq!(config.wait_timeout, WAIT_TIMEOUT);
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_ttl = \"lots\"").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/mtr-trace.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = with_ipv4();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("local_ipv4 = \"127.0.0.1\""));
        assert!(text.contains("wait_timeout = 7.0"));
        let loaded: Config = toml::from_str(&text).unwrap();
        assert_eq!(loaded, config);
    }
}
