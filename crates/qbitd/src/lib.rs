pub mod api;
pub mod config;
mod engine;
mod integrations;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use engine::CoordinatorStatus;
pub use engine::Engine;
pub use engine::EngineError;
pub use engine::State;
pub use engine::SwitchAction;
pub use engine::SwitchState;
