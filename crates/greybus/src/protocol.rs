//! Protocol identities and the registry of protocol implementations.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::sync::lock;

/// Function class carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Control,
    Usb,
    Gpio,
    Spi,
    Uart,
    Pwm,
    I2s,
    I2c,
    Sdio,
    Hid,
    Display,
    Camera,
    Sensor,
    Vendor,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Control,
            0x01 => Self::Usb,
            0x02 => Self::Gpio,
            0x03 => Self::Spi,
            0x04 => Self::Uart,
            0x05 => Self::Pwm,
            0x06 => Self::I2s,
            0x07 => Self::I2c,
            0x08 => Self::Sdio,
            0x09 => Self::Hid,
            0x0a => Self::Display,
            0x0b => Self::Camera,
            0x0c => Self::Sensor,
            0xff => Self::Vendor,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Control => 0x00,
            Self::Usb => 0x01,
            Self::Gpio => 0x02,
            Self::Spi => 0x03,
            Self::Uart => 0x04,
            Self::Pwm => 0x05,
            Self::I2s => 0x06,
            Self::I2c => 0x07,
            Self::Sdio => 0x08,
            Self::Hid => 0x09,
            Self::Display => 0x0a,
            Self::Camera => 0x0b,
            Self::Sensor => 0x0c,
            Self::Vendor => 0xff,
        }
    }
}

/// A protocol at a specific version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub protocol: Protocol,
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub fn new(protocol: Protocol, major: u8, minor: u8) -> Self {
        Self {
            protocol,
            major,
            minor,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}.{}", self.protocol, self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol {0} is already registered")]
    AlreadyRegistered(ProtocolVersion),

    #[error("protocol {0} is not registered")]
    NotRegistered(ProtocolVersion),

    #[error("protocol {protocol} still has {users} users")]
    InUse { protocol: ProtocolVersion, users: u8 },
}

#[derive(Debug)]
struct Entry {
    version: ProtocolVersion,
    users: u8,
}

/// Registered protocol implementations with a use count each.
///
/// A protocol can only be deregistered once every [`get`](Self::get) has been
/// matched by a [`put`](Self::put).
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, version: ProtocolVersion) -> Result<(), ProtocolError> {
        let mut entries = lock(&self.entries, "protocols");
        if entries.iter().any(|e| e.version == version) {
            return Err(ProtocolError::AlreadyRegistered(version));
        }
        entries.push(Entry { version, users: 0 });
        tracing::debug!(protocol = %version, "Registered protocol");
        Ok(())
    }

    pub fn deregister(&self, version: ProtocolVersion) -> Result<(), ProtocolError> {
        let mut entries = lock(&self.entries, "protocols");
        let index = entries
            .iter()
            .position(|e| e.version == version)
            .ok_or(ProtocolError::NotRegistered(version))?;
        let users = entries[index].users;
        if users != 0 {
            return Err(ProtocolError::InUse {
                protocol: version,
                users,
            });
        }
        entries.remove(index);
        tracing::debug!(protocol = %version, "Deregistered protocol");
        Ok(())
    }

    /// Take a reference on a registered protocol. Returns the new use count.
    ///
    /// The count saturates at `u8::MAX`; further gets still succeed but are
    /// not counted.
    pub fn get(&self, version: ProtocolVersion) -> Result<u8, ProtocolError> {
        let mut entries = lock(&self.entries, "protocols");
        let entry = entries
            .iter_mut()
            .find(|e| e.version == version)
            .ok_or(ProtocolError::NotRegistered(version))?;
        if entry.users == u8::MAX {
            tracing::warn!(protocol = %version, "Protocol use count saturated");
        } else {
            entry.users += 1;
        }
        Ok(entry.users)
    }

    /// Drop a reference taken with [`get`](Self::get). Returns the new count.
    pub fn put(&self, version: ProtocolVersion) -> Result<u8, ProtocolError> {
        let mut entries = lock(&self.entries, "protocols");
        let entry = entries
            .iter_mut()
            .find(|e| e.version == version)
            .ok_or(ProtocolError::NotRegistered(version))?;
        if entry.users == 0 {
            tracing::warn!(protocol = %version, "Protocol put with no users");
        } else {
            entry.users -= 1;
        }
        Ok(entry.users)
    }

    pub fn users(&self, version: ProtocolVersion) -> Option<u8> {
        lock(&self.entries, "protocols")
            .iter()
            .find(|e| e.version == version)
            .map(|e| e.users)
    }
}
