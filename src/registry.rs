//! Process-wide plugin directories.
//!
//! Collector and sink implementations insert their constructors during
//! process initialisation; the agent only reads from the maps once loading
//! begins. Concurrent registration is not supported.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::plugin::{Collector, Sink};

/// Zero-argument collector constructor
pub type CollectorCtor = fn() -> Box<dyn Collector>;

/// Zero-argument sink constructor
pub type SinkCtor = fn() -> Box<dyn Sink>;

static COLLECTORS: Lazy<Mutex<HashMap<String, CollectorCtor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static SINKS: Lazy<Mutex<HashMap<String, SinkCtor>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a collector constructor under a name
pub fn register_collector(name: impl Into<String>, ctor: CollectorCtor) -> Result<()> {
    COLLECTORS
        .lock()
        .map_err(|_| AgentError::Other("collector registry lock poisoned".to_string()))?
        .insert(name.into(), ctor);
    Ok(())
}

/// Register a sink constructor under a name
pub fn register_sink(name: impl Into<String>, ctor: SinkCtor) -> Result<()> {
    SINKS
        .lock()
        .map_err(|_| AgentError::Other("sink registry lock poisoned".to_string()))?
        .insert(name.into(), ctor);
    Ok(())
}

/// Instantiate a registered collector by name
pub fn new_collector(name: &str) -> Result<Box<dyn Collector>> {
    let collectors = COLLECTORS
        .lock()
        .map_err(|_| AgentError::Other("collector registry lock poisoned".to_string()))?;
    match collectors.get(name) {
        Some(ctor) => Ok(ctor()),
        None => Err(AgentError::Config(format!(
            "Undefined but requested plugin: {}",
            name
        ))),
    }
}

/// Instantiate a registered sink by name
pub fn new_sink(name: &str) -> Result<Box<dyn Sink>> {
    let sinks = SINKS
        .lock()
        .map_err(|_| AgentError::Other("sink registry lock poisoned".to_string()))?;
    match sinks.get(name) {
        Some(ctor) => Ok(ctor()),
        None => Err(AgentError::Config(format!(
            "Undefined but requested output: {}",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Accumulator;
    use crate::point::Point;
    use async_trait::async_trait;

    struct NoopCollector;

    #[async_trait]
    impl Collector for NoopCollector {
        async fn gather(&self, _acc: &Accumulator) -> Result<()> {
            Ok(())
        }
    }

    struct NoopSink;

    #[async_trait]
    impl Sink for NoopSink {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn write(&self, _points: &[Point]) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registered_plugins_are_constructible() {
        register_collector("registry_test_noop", || Box::new(NoopCollector)).unwrap();
        register_sink("registry_test_noop", || Box::new(NoopSink)).unwrap();

        assert!(new_collector("registry_test_noop").is_ok());
        assert!(new_sink("registry_test_noop").is_ok());
    }

    #[test]
    fn unknown_names_fail_fast() {
        let err = match new_collector("registry_test_missing") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("Undefined but requested plugin"));

        let err = match new_sink("registry_test_missing") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("Undefined but requested output"));
    }
}
