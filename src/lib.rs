use log::debug;

mod accumulator;
mod agent;
mod config;
mod error;
mod plugin;
mod point;
mod registry;
mod util;

// Re-export public types for external use
pub use self::accumulator::Accumulator;
pub use self::agent::Agent;
pub use self::config::{get_hostname, load_config, AgentConfig, ConfigSource, LogLevel, Precision};
pub use self::plugin::{Collector, PluginConfig, PluginDecl, RunningOutput, RunningPlugin, Service, Sink};
pub use self::point::{FieldValue, Point};
pub use self::registry::{register_collector, register_sink, CollectorCtor, SinkCtor};

/// Reexport all error types and common interfaces
pub mod prelude {
    pub use crate::error::{AgentError, Result};
}

/// Initialize the logging system
pub fn init_logging(log_level: &LogLevel) {
    debug!("Initializing logging with level: {:?}", log_level);
    util::logging::init(log_level);
}
