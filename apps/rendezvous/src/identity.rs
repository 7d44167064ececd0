use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use signal_proto::{ClientInfoWithoutId, PeerDeviceType};

pub const PROTOCOL_VERSION: &str = "2.1";

/// Device class as the rest of the application models it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Desktop,
    Web,
    Headless,
    Server,
}

impl From<DeviceClass> for PeerDeviceType {
    fn from(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Mobile => PeerDeviceType::Mobile,
            DeviceClass::Desktop => PeerDeviceType::Desktop,
            DeviceClass::Web => PeerDeviceType::Web,
            DeviceClass::Headless => PeerDeviceType::Headless,
            DeviceClass::Server => PeerDeviceType::Server,
        }
    }
}

impl From<PeerDeviceType> for DeviceClass {
    fn from(wire: PeerDeviceType) -> Self {
        match wire {
            PeerDeviceType::Mobile => DeviceClass::Mobile,
            PeerDeviceType::Desktop => DeviceClass::Desktop,
            PeerDeviceType::Web => DeviceClass::Web,
            PeerDeviceType::Headless => DeviceClass::Headless,
            PeerDeviceType::Server => DeviceClass::Server,
        }
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mobile" => Ok(DeviceClass::Mobile),
            "desktop" => Ok(DeviceClass::Desktop),
            "web" => Ok(DeviceClass::Web),
            "headless" => Ok(DeviceClass::Headless),
            "server" => Ok(DeviceClass::Server),
            other => Err(format!("unknown device class '{other}'")),
        }
    }
}

/// What this device presents to every signaling server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub alias: String,
    pub protocol_version: String,
    pub device_model: Option<String>,
    pub device_class: DeviceClass,
    pub fingerprint: String,
}

impl LocalIdentity {
    pub fn to_wire(&self) -> ClientInfoWithoutId {
        ClientInfoWithoutId {
            alias: self.alias.clone(),
            version: self.protocol_version.clone(),
            device_model: self.device_model.clone(),
            device_type: Some(self.device_class.into()),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Source of the local identity; read once per connection attempt.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> LocalIdentity;
}

/// Identity held in memory. The alias can be changed at runtime; callers are
/// expected to re-announce afterwards.
#[derive(Debug)]
pub struct StaticIdentity {
    inner: RwLock<LocalIdentity>,
}

impl StaticIdentity {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            inner: RwLock::new(identity),
        }
    }

    pub fn set_alias(&self, alias: impl Into<String>) {
        self.inner.write().alias = alias.into();
    }
}

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> LocalIdentity {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_mapping_is_total_and_reversible() {
        for wire in PeerDeviceType::ALL {
            let class = DeviceClass::from(wire);
            assert_eq!(PeerDeviceType::from(class), wire);
        }
        for class in [
            DeviceClass::Mobile,
            DeviceClass::Desktop,
            DeviceClass::Web,
            DeviceClass::Headless,
            DeviceClass::Server,
        ] {
            assert_eq!(DeviceClass::from(PeerDeviceType::from(class)), class);
        }
    }

    #[test]
    fn wire_identity_carries_every_field() {
        let provider = StaticIdentity::new(LocalIdentity {
            alias: "Desk".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            device_model: Some("Linux".into()),
            device_class: DeviceClass::Headless,
            fingerprint: "abc".into(),
        });
        provider.set_alias("Renamed");

        let wire = provider.identity().to_wire();
        assert_eq!(wire.alias, "Renamed");
        assert_eq!(wire.version, PROTOCOL_VERSION);
        assert_eq!(wire.device_type, Some(PeerDeviceType::Headless));
        assert_eq!(wire.fingerprint, "abc");
    }

    #[test]
    fn parses_device_class_names() {
        assert_eq!("Desktop".parse::<DeviceClass>(), Ok(DeviceClass::Desktop));
        assert!("toaster".parse::<DeviceClass>().is_err());
    }
}
