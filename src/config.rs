use chrono::{DateTime, DurationRound, Utc};
use config::FileFormat;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Log level for the agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Only show errors
    Error,
    /// Show errors and warnings
    Warn,
    /// Show errors, warnings, and info (default)
    Info,
    /// Show errors, warnings, info, and debug messages
    Debug,
    /// Show all messages including trace
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

impl LogLevel {
    /// Convert to log::LevelFilter
    pub fn to_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Timestamp precision for points whose collector did not supply a
/// timestamp. Config values use the short unit names n, u, ms, s, m, h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Precision {
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Second
    }
}

impl FromStr for Precision {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "n" => Ok(Precision::Nanosecond),
            "u" => Ok(Precision::Microsecond),
            "ms" => Ok(Precision::Millisecond),
            "s" => Ok(Precision::Second),
            "m" => Ok(Precision::Minute),
            "h" => Ok(Precision::Hour),
            _ => Err(AgentError::Config(format!(
                "Invalid precision {:?}, expected one of n, u, ms, s, m, h",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = AgentError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl Precision {
    /// Round a timestamp down to this precision
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let unit = match self {
            // Nanoseconds are the native resolution, nothing to trim
            Precision::Nanosecond => return ts,
            Precision::Microsecond => chrono::Duration::microseconds(1),
            Precision::Millisecond => chrono::Duration::milliseconds(1),
            Precision::Second => chrono::Duration::seconds(1),
            Precision::Minute => chrono::Duration::minutes(1),
            Precision::Hour => chrono::Duration::hours(1),
        };
        ts.duration_trunc(unit).unwrap_or(ts)
    }
}

/// Steady-state parameters of the agent, deserialized from the `[agent]`
/// block of a TOML config. Every field has a default, so an empty block is
/// a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Interval at which to gather information
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Interval at which to flush buffered points to the outputs
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Number of times to retry each failed flush before dropping the batch
    pub flush_retries: usize,

    /// Accepted for backwards compatibility with older configs; ignored
    pub utc: bool,

    /// Precision applied when the agent synthesises point timestamps
    pub precision: Precision,

    /// Log every point as it is admitted to the channel
    pub debug: bool,

    /// Hostname override; empty means resolve from the OS
    pub hostname: String,

    /// Tags applied to every gathered point
    pub tags: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(10),
            flush_retries: 2,
            utc: true,
            precision: Precision::Second,
            debug: false,
            hostname: String::new(),
            tags: HashMap::new(),
        }
    }
}

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (TOML format)
    File(String),
    /// TOML string
    Toml(String),
}

/// Load a configuration type from one or more TOML sources; later sources
/// override earlier ones.
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                if !Path::new(&path).exists() {
                    warn!("Configuration file not found: {}", path);
                    continue;
                }
                debug!("Loading TOML configuration from file: {}", path);
                builder = builder
                    .add_source(config::File::with_name(&path).format(FileFormat::Toml));
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder.add_source(config::File::from_str(&toml_str, FileFormat::Toml));
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build configuration: {}", e)))?;

    config
        .try_deserialize()
        .map_err(|e| AgentError::Config(format!("Failed to deserialize configuration: {}", e)))
}

/// Get a unique identifier for the current machine
pub fn get_hostname() -> Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return Ok(name);
        }
    }

    if let Ok(name) = hostname::get() {
        if let Ok(name) = name.into_string() {
            if !name.is_empty() {
                return Ok(name);
            }
        }
    }

    // Last resort so the host tag is still unique per process
    Ok(format!("unknown-host-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_toml_yields_documented_defaults() {
        let config: AgentConfig = load_config(vec![ConfigSource::Toml(String::new())]).unwrap();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.flush_retries, 2);
        assert!(config.utc);
        assert_eq!(config.precision, Precision::Second);
        assert!(!config.debug);
        assert!(config.hostname.is_empty());
        assert!(config.tags.is_empty());
    }

    #[test]
    fn durations_parse_from_human_strings() {
        let toml = r#"
            interval = "250ms"
            flush_interval = "1m"
            flush_retries = 4
            precision = "ms"
        "#;
        let config: AgentConfig = load_config(vec![ConfigSource::Toml(toml.into())]).unwrap();
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.flush_interval, Duration::from_secs(60));
        assert_eq!(config.flush_retries, 4);
        assert_eq!(config.precision, Precision::Millisecond);
    }

    #[test]
    fn invalid_precision_is_a_config_error() {
        let result: Result<AgentConfig> =
            load_config(vec![ConfigSource::Toml(r#"precision = "d""#.into())]);
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            debug = true
            hostname = "web-1"

            [tags]
            region = "eu-west"
        "#
        )
        .unwrap();

        let config: AgentConfig = load_config(vec![ConfigSource::File(
            file.path().to_string_lossy().into_owned(),
        )])
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.hostname, "web-1");
        assert_eq!(config.tags["region"], "eu-west");
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let config: AgentConfig = load_config(vec![
            ConfigSource::Toml(r#"flush_retries = 1"#.into()),
            ConfigSource::Toml(r#"flush_retries = 7"#.into()),
        ])
        .unwrap();
        assert_eq!(config.flush_retries, 7);
    }

    #[test]
    fn precision_truncates_timestamps() {
        let ts = Utc
            .with_ymd_and_hms(2024, 5, 17, 9, 41, 23)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();

        let second = Precision::Second.truncate(ts);
        assert_eq!(second.nanosecond(), 0);
        assert_eq!(second.second(), 23);

        let minute = Precision::Minute.truncate(ts);
        assert_eq!(minute.second(), 0);
        assert_eq!(minute.minute(), 41);

        let hour = Precision::Hour.truncate(ts);
        assert_eq!(hour.minute(), 0);

        assert_eq!(Precision::Nanosecond.truncate(ts), ts);
    }

    #[test]
    fn hostname_is_never_empty() {
        let name = get_hostname().unwrap();
        assert!(!name.is_empty());
    }
}
