use std::error::Error as StdError;
use std::fmt;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error
#[derive(Debug, Clone)]
pub enum AgentError {
    /// Configuration error - unknown plugin names, malformed blocks
    Config(String),
    /// Startup error - a service collector failed to start
    Startup(String),
    /// Connection error - an output sink failed to connect
    Connection(String),
    /// Collection error - a collector's gather pass failed
    Collection(String),
    /// Write error - an output sink rejected a batch
    Write(String),
    /// Channel error - the point channel is closed
    Channel(String),
    /// Other general error
    Other(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Config(source) => write!(f, "Config error: {}", source),
            AgentError::Startup(source) => write!(f, "Startup error: {}", source),
            AgentError::Connection(source) => write!(f, "Connection error: {}", source),
            AgentError::Collection(source) => write!(f, "Collection error: {}", source),
            AgentError::Write(source) => write!(f, "Write error: {}", source),
            AgentError::Channel(source) => write!(f, "Channel error: {}", source),
            AgentError::Other(source) => write!(f, "Other error: {}", source),
        }
    }
}

impl StdError for AgentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        None
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}
