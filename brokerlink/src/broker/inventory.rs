//! Static device inventory and attribute filters.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

/// An attribute/pattern filter against the inventory.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    /// Attribute to test: `name`, `host`, or any custom attribute key.
    pub attribute: String,

    /// Regular expression searched for in the attribute value.
    pub pattern: Regex,
}

impl DeviceFilter {
    /// Build a filter, compiling `pattern`.
    pub fn new(attribute: impl Into<String>, pattern: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|e| ConfigError::Invalid {
            name: "filter_pattern",
            message: e.to_string(),
        })?;
        Ok(Self {
            attribute: attribute.into(),
            pattern,
        })
    }

    /// Filter on the device name.
    pub fn by_name(pattern: &str) -> Result<Self, ConfigError> {
        Self::new("name", pattern)
    }

    /// Filter on the device host address.
    pub fn by_host(pattern: &str) -> Result<Self, ConfigError> {
        Self::new("host", pattern)
    }

    /// Whether `device` satisfies the filter.
    pub fn matches(&self, device: &DeviceRecord) -> bool {
        device
            .attribute(&self.attribute)
            .is_some_and(|value| self.pattern.is_match(value))
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}", self.attribute, self.pattern.as_str())
    }
}

/// One device known to the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    /// Inventory name; the identifier used everywhere else.
    pub name: String,

    /// Management address.
    #[serde(default)]
    pub host: String,

    /// Free-form attributes (`device_type`, `site`, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DeviceRecord {
    /// Create a record with a name and host.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add a custom attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up an attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.name),
            "host" => Some(&self.host),
            _ => self.attributes.get(key).map(String::as_str),
        }
    }
}

/// A static inventory, usually loaded from a TOML file.
///
/// ```toml
/// [[device]]
/// name = "core-rtr-1"
/// host = "10.0.0.1"
/// attributes = { site = "lab" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceRecord>,
}

impl Inventory {
    /// Create an inventory from records.
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices }
    }

    /// Parse an inventory from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Load {
            path: "<inventory>".to_string(),
            message: e.to_string(),
        })
    }

    /// Load an inventory file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Names of the devices matching `filter`, in inventory order.
    pub fn select(&self, filter: &DeviceFilter) -> Vec<String> {
        self.devices
            .iter()
            .filter(|device| filter.matches(device))
            .map(|device| device.name.clone())
            .collect()
    }

    /// Look up a device by exact name.
    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|device| device.name == name)
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the inventory is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
        [[device]]
        name = "core-rtr-1"
        host = "10.0.0.1"
        attributes = { site = "lab" }

        [[device]]
        name = "core-rtr-2"
        host = "10.0.0.2"

        [[device]]
        name = "edge-sw-1"
        host = "10.0.1.1"
        attributes = { site = "lab" }
    "#;

    #[test]
    fn test_parse_inventory() {
        let inventory = Inventory::from_toml(INVENTORY).unwrap();
        assert_eq!(inventory.len(), 3);
        assert_eq!(inventory.get("edge-sw-1").unwrap().host, "10.0.1.1");
    }

    #[test]
    fn test_select_by_name_pattern() {
        let inventory = Inventory::from_toml(INVENTORY).unwrap();
        let filter = DeviceFilter::by_name("^core-").unwrap();
        assert_eq!(inventory.select(&filter), vec!["core-rtr-1", "core-rtr-2"]);
    }

    #[test]
    fn test_select_by_host_and_attribute() {
        let inventory = Inventory::from_toml(INVENTORY).unwrap();

        let by_host = DeviceFilter::by_host(r"^10\.0\.1\.").unwrap();
        assert_eq!(inventory.select(&by_host), vec!["edge-sw-1"]);

        let by_site = DeviceFilter::new("site", "lab").unwrap();
        assert_eq!(inventory.select(&by_site), vec!["core-rtr-1", "edge-sw-1"]);
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let device = DeviceRecord::new("r1", "10.0.0.1");
        let filter = DeviceFilter::new("site", ".*").unwrap();
        assert!(!filter.matches(&device));
    }

    #[test]
    fn test_invalid_filter_pattern() {
        assert!(matches!(
            DeviceFilter::by_name("("),
            Err(ConfigError::Invalid { name: "filter_pattern", .. })
        ));
    }
}
