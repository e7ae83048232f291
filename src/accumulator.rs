use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::config::Precision;
use crate::error::{AgentError, Result};
use crate::plugin::PluginConfig;
use crate::point::{FieldValue, Point};

/// The handle a collector publishes points through during one collection
/// pass. The supervisor configures prefix, default tags, precision and the
/// debug flag before handing it over.
///
/// Sends block when the point channel is full; a collector that outruns
/// the flusher is paused rather than sampled.
pub struct Accumulator {
    config: PluginConfig,
    tx: mpsc::Sender<Point>,
    prefix: String,
    default_tags: HashMap<String, String>,
    precision: Precision,
    debug: bool,
}

impl Accumulator {
    pub fn new(config: PluginConfig, tx: mpsc::Sender<Point>) -> Self {
        Self {
            config,
            tx,
            prefix: String::new(),
            default_tags: HashMap::new(),
            precision: Precision::default(),
            debug: false,
        }
    }

    /// Set the measurement name prefix, normally `<collector>_`
    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    /// Set the tags merged into every point that does not override them
    pub fn set_default_tags(&mut self, tags: HashMap<String, String>) {
        self.default_tags = tags;
    }

    /// Set the precision used when synthesising timestamps
    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    /// Log each point as it is admitted
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Publish a single-value measurement, the common collector case
    pub async fn add(
        &self,
        measurement: &str,
        value: impl Into<FieldValue>,
        tags: HashMap<String, String>,
    ) -> Result<()> {
        let mut fields = HashMap::new();
        fields.insert("value".to_string(), value.into());
        self.add_fields(measurement, fields, tags, None).await
    }

    /// Publish a full point; the timestamp is synthesised at the
    /// configured precision when the collector does not supply one.
    pub async fn add_fields(
        &self,
        measurement: &str,
        fields: HashMap<String, FieldValue>,
        mut tags: HashMap<String, String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(drop) = &self.config.drop {
            if drop.iter().any(|m| m == measurement) {
                return Ok(());
            }
        }

        let name = format!("{}{}", self.prefix, measurement);

        // Collector-supplied tags win over the agent defaults
        for (key, value) in &self.default_tags {
            tags.entry(key.clone()).or_insert_with(|| value.clone());
        }

        if let Some(pass) = &self.config.pass {
            tags.retain(|key, _| pass.iter().any(|p| p == key));
        }

        let timestamp = timestamp.unwrap_or_else(|| self.precision.truncate(Utc::now()));

        let point = Point::new(name, tags, fields, timestamp);
        if self.debug {
            debug!("> {}", point);
        }

        self.tx
            .send(point)
            .await
            .map_err(|_| AgentError::Channel("point channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::time::Duration;

    fn accumulator(config: PluginConfig, tx: mpsc::Sender<Point>) -> Accumulator {
        let mut acc = Accumulator::new(config, tx);
        acc.set_prefix("cpu_");
        let mut tags = HashMap::new();
        tags.insert("host".to_string(), "agent-host".to_string());
        acc.set_default_tags(tags);
        acc
    }

    #[tokio::test]
    async fn prefixes_measurement_and_applies_host_tag() {
        let (tx, mut rx) = mpsc::channel(10);
        let acc = accumulator(PluginConfig::default(), tx);

        acc.add("usage", 50i64, HashMap::new()).await.unwrap();

        let point = rx.recv().await.unwrap();
        assert_eq!(point.name, "cpu_usage");
        assert_eq!(point.tags["host"], "agent-host");
        assert_eq!(point.fields["value"], FieldValue::Integer(50));
    }

    #[tokio::test]
    async fn collector_supplied_host_tag_wins() {
        let (tx, mut rx) = mpsc::channel(10);
        let acc = accumulator(PluginConfig::default(), tx);

        let mut tags = HashMap::new();
        tags.insert("host".to_string(), "container-7".to_string());
        acc.add("usage", 1i64, tags).await.unwrap();

        let point = rx.recv().await.unwrap();
        assert_eq!(point.tags["host"], "container-7");
    }

    #[tokio::test]
    async fn pass_list_filters_tag_keys() {
        let (tx, mut rx) = mpsc::channel(10);
        let config = PluginConfig {
            pass: Some(vec!["core".to_string()]),
            ..Default::default()
        };
        let acc = accumulator(config, tx);

        let mut tags = HashMap::new();
        tags.insert("core".to_string(), "0".to_string());
        tags.insert("socket".to_string(), "1".to_string());
        acc.add("usage", 1i64, tags).await.unwrap();

        let point = rx.recv().await.unwrap();
        assert_eq!(point.tags.len(), 1);
        assert_eq!(point.tags["core"], "0");
        // The default host tag is filtered too when not whitelisted
        assert!(!point.tags.contains_key("host"));
    }

    #[tokio::test]
    async fn dropped_measurements_are_suppressed() {
        let (tx, mut rx) = mpsc::channel(10);
        let config = PluginConfig {
            drop: Some(vec!["steal".to_string()]),
            ..Default::default()
        };
        let acc = accumulator(config, tx);

        acc.add("steal", 1i64, HashMap::new()).await.unwrap();
        acc.add("usage", 1i64, HashMap::new()).await.unwrap();

        let point = rx.recv().await.unwrap();
        assert_eq!(point.name, "cpu_usage");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn synthesised_timestamps_honour_precision() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut acc = accumulator(PluginConfig::default(), tx);
        acc.set_precision(Precision::Minute);

        acc.add("usage", 1i64, HashMap::new()).await.unwrap();

        let point = rx.recv().await.unwrap();
        assert_eq!(point.timestamp.second(), 0);
        assert_eq!(point.timestamp.nanosecond(), 0);
    }

    #[tokio::test]
    async fn supplied_timestamps_are_kept_untouched() {
        let (tx, mut rx) = mpsc::channel(10);
        let mut acc = accumulator(PluginConfig::default(), tx);
        acc.set_precision(Precision::Hour);

        let ts = Utc::now();
        acc.add_fields("usage", HashMap::new(), HashMap::new(), Some(ts))
            .await
            .unwrap();

        let point = rx.recv().await.unwrap();
        assert_eq!(point.timestamp, ts);
    }

    #[tokio::test]
    async fn add_blocks_on_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let acc = accumulator(PluginConfig::default(), tx.clone());
        acc.add("usage", 1i64, HashMap::new()).await.unwrap();

        let mut blocked = tokio::spawn(async move {
            let acc = accumulator(PluginConfig::default(), tx);
            acc.add("usage", 2i64, HashMap::new()).await
        });

        // The second add must still be pending while the channel is full
        let waited =
            tokio::time::timeout(Duration::from_millis(50), &mut blocked).await;
        assert!(waited.is_err());

        // Draining one point unblocks the sender; nothing was lost
        rx.recv().await.unwrap();
        blocked.await.unwrap().unwrap();
        let point = rx.recv().await.unwrap();
        assert_eq!(point.fields["value"], FieldValue::Integer(2));
    }

    #[tokio::test]
    async fn closed_channel_surfaces_as_channel_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let acc = accumulator(PluginConfig::default(), tx);
        let err = acc.add("usage", 1i64, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Channel(_)));
    }
}
