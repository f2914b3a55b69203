mod settings;

pub use settings::{AgentConfig, BusConfig, LoggingConfig, ProtocolConfig, Settings};
