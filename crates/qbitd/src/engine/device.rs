use serde::Serialize;

/// Whether a device is a physical piece of hardware or a logical service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceEntryType {
    Service,
}

/// Device metadata reported by an entity at discovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// `None` for physical devices.
    pub entry_type: Option<DeviceEntryType>,
    pub identifiers: Vec<(String, String)>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

impl DeviceInfo {
    /// Stable registry key derived from the first identifier.
    pub fn device_id(&self) -> Option<String> {
        self.identifiers
            .first()
            .map(|(domain, id)| format!("{}.{}", domain, id))
    }
}

/// A device in the qbitd system.
///
/// A device represents a physical or logical device that contains one or more entities.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub info: DeviceInfo,
    pub entity_ids: Vec<String>,
}

impl Device {
    pub fn new(id: String, info: DeviceInfo) -> Self {
        Self {
            id,
            info,
            entity_ids: Vec::new(),
        }
    }

    pub fn add_entity(&mut self, entity_id: String) {
        if !self.entity_ids.contains(&entity_id) {
            self.entity_ids.push(entity_id);
        }
    }

    pub fn remove_entity(&mut self, entity_id: &str) {
        self.entity_ids.retain(|id| id != entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_info() -> DeviceInfo {
        DeviceInfo {
            entry_type: Some(DeviceEntryType::Service),
            identifiers: vec![("qbittorrent".to_string(), "seedbox".to_string())],
            name: Some("seedbox".to_string()),
            manufacturer: Some("qBittorrent".to_string()),
            model: None,
        }
    }

    #[test]
    fn test_device_id_from_first_identifier() {
        assert_eq!(
            service_info().device_id().as_deref(),
            Some("qbittorrent.seedbox")
        );
    }

    #[test]
    fn test_add_entity_is_deduplicated() {
        let mut device = Device::new("qbittorrent.seedbox".to_string(), service_info());
        device.add_entity("switch.a".to_string());
        device.add_entity("switch.a".to_string());
        device.add_entity("switch.b".to_string());
        assert_eq!(device.entity_ids, vec!["switch.a", "switch.b"]);

        device.remove_entity("switch.a");
        assert_eq!(device.entity_ids, vec!["switch.b"]);
    }
}
