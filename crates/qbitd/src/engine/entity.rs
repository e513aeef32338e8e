//! Entity abstraction for qbitd
//!
//! All entities implement the Entity trait. Entities that can be switched on and off
//! additionally implement SwitchEntity, which is what the engine routes switch commands to.

use std::error::Error;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use super::device::DeviceInfo;

/// Error returned by entity commands
pub type EntityError = Box<dyn Error + Send + Sync>;

/// Base trait that all entities must implement
pub trait Entity: Send + Sync {
    /// Engine-wide entity id (e.g. "switch.seedbox_alternative_speed_limits")
    fn entity_id(&self) -> &str;

    /// Stable id that survives renames
    fn unique_id(&self) -> String;

    /// Return the platform type of this entity (e.g. "switch")
    fn platform(&self) -> &'static str;

    /// Key for the entity's display name, if it has one
    fn translation_key(&self) -> Option<&str> {
        None
    }

    /// Device this entity is grouped under, if any
    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }
}

/// Switch commands understood by the engine
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SwitchAction {
    TurnOn,
    TurnOff,
    Toggle,
}

/// On/off capability expected by the engine's switch registry
#[async_trait]
pub trait SwitchEntity: Entity {
    /// Current state. Must not perform I/O.
    fn is_on(&self) -> bool;

    async fn turn_on(&self) -> Result<(), EntityError>;

    async fn turn_off(&self) -> Result<(), EntityError>;

    async fn toggle(&self) -> Result<(), EntityError> {
        if self.is_on() {
            self.turn_off().await
        } else {
            self.turn_on().await
        }
    }

    /// Dispatch a SwitchAction to the matching method
    async fn apply(&self, action: SwitchAction) -> Result<(), EntityError> {
        match action {
            SwitchAction::TurnOn => self.turn_on().await,
            SwitchAction::TurnOff => self.turn_off().await,
            SwitchAction::Toggle => self.toggle().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use super::*;

    struct Lamp {
        on: AtomicBool,
    }

    impl Entity for Lamp {
        fn entity_id(&self) -> &str {
            "switch.lamp"
        }

        fn unique_id(&self) -> String {
            "lamp".to_string()
        }

        fn platform(&self) -> &'static str {
            "switch"
        }
    }

    #[async_trait]
    impl SwitchEntity for Lamp {
        fn is_on(&self) -> bool {
            self.on.load(Ordering::SeqCst)
        }

        async fn turn_on(&self) -> Result<(), EntityError> {
            self.on.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn turn_off(&self) -> Result<(), EntityError> {
            self.on.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_switch_action_parse_and_display() {
        assert_eq!(
            SwitchAction::from_str("turn_on").unwrap(),
            SwitchAction::TurnOn
        );
        assert_eq!(
            SwitchAction::from_str("toggle").unwrap(),
            SwitchAction::Toggle
        );
        assert!(SwitchAction::from_str("explode").is_err());
        assert_eq!(SwitchAction::TurnOff.to_string(), "turn_off");
    }

    #[tokio::test]
    async fn test_default_toggle_uses_is_on() {
        let lamp = Lamp {
            on: AtomicBool::new(false),
        };

        lamp.apply(SwitchAction::Toggle).await.unwrap();
        assert!(lamp.is_on());

        lamp.apply(SwitchAction::Toggle).await.unwrap();
        assert!(!lamp.is_on());

        lamp.apply(SwitchAction::TurnOn).await.unwrap();
        assert!(lamp.is_on());
        assert!(lamp.device_info().is_none());
        assert!(lamp.translation_key().is_none());
    }
}
