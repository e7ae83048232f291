use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::accumulator::Accumulator;
use crate::error::Result;
use crate::point::Point;

/// A pluggable producer of points, invoked periodically by the scheduler.
///
/// Implementations that need mutable state across gather passes use
/// interior mutability; the agent shares each running collector between
/// tasks and only ever hands out `&self`.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Run one collection pass, publishing points through the accumulator
    async fn gather(&self, acc: &Accumulator) -> Result<()>;

    /// Collectors that run a background task between explicit start and
    /// stop calls advertise it here; everything else reports none.
    fn as_service(&self) -> Option<&dyn Service> {
        None
    }
}

/// Start/stop capability for collectors that own a background task
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
}

/// A pluggable consumer of point batches. Sinks own their connections:
/// opened once via connect, reused for every write, closed on shutdown.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn write(&self, points: &[Point]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Per-collector configuration resolved by the config layer
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Collection interval for this collector alone; absent means the
    /// collector is gathered on the agent's global interval
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Tag keys allowed through; absent passes every tag
    pub pass: Option<Vec<String>>,

    /// Measurements to suppress entirely
    pub drop: Option<Vec<String>>,
}

/// A collector declared by the configuration, ready to be loaded
#[derive(Debug, Clone)]
pub struct PluginDecl {
    pub name: String,
    pub config: PluginConfig,
}

impl PluginDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: PluginConfig::default(),
        }
    }

    pub fn with_config(name: impl Into<String>, config: PluginConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// A loaded collector with its resolved configuration
pub struct RunningPlugin {
    pub name: String,
    pub collector: Box<dyn Collector>,
    pub config: PluginConfig,
}

/// A loaded output sink
pub struct RunningOutput {
    pub name: String,
    pub sink: Box<dyn Sink>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config, ConfigSource};

    #[test]
    fn plugin_block_deserializes_with_defaults() {
        let config: PluginConfig = load_config(vec![ConfigSource::Toml(String::new())]).unwrap();
        assert!(config.interval.is_none());
        assert!(config.pass.is_none());
        assert!(config.drop.is_none());
    }

    #[test]
    fn plugin_block_parses_interval_and_filters() {
        let toml = r#"
            interval = "50ms"
            pass = ["host", "region"]
            drop = ["uptime"]
        "#;
        let config: PluginConfig = load_config(vec![ConfigSource::Toml(toml.into())]).unwrap();
        assert_eq!(config.interval, Some(Duration::from_millis(50)));
        assert_eq!(config.pass.as_deref(), Some(&["host".to_string(), "region".to_string()][..]));
        assert_eq!(config.drop.as_deref(), Some(&["uptime".to_string()][..]));
    }
}
