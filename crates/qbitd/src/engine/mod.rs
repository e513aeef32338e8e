pub mod coordinator;
pub mod device;
mod engine;
pub mod entity;
mod integration;
mod message;
pub mod state;

pub use coordinator::Coordinator;
pub use coordinator::CoordinatorStatus;
pub use coordinator::RefreshableStatusSource;
pub use device::DeviceInfo;
pub use engine::Engine;
pub use engine::EngineError;
pub use entity::Entity;
pub use entity::SwitchAction;
pub use entity::SwitchEntity;
pub use integration::FromIntegrationSender;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use integration::SetupError;
pub use message::FromIntegrationMessage;
pub use message::ToIntegrationMessage;
pub use state::IntegrationState;
pub use state::State;
pub use state::SwitchState;
