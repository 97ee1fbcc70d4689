//! Manifest wire layout.
//!
//! All multi-byte fields are little-endian. A descriptor's declared size covers
//! its own 3-byte header as well as the body, and may exceed the body sizes
//! below: newer manifest versions are allowed to append fields.

use serde::{Deserialize, Serialize};

/// Highest manifest major version this parser understands.
pub const MANIFEST_VERSION_MAJOR: u8 = 0x00;
/// Minor version written by [`super::ManifestBuilder`].
pub const MANIFEST_VERSION_MINOR: u8 = 0x01;

/// `size:u16, version_major:u8, version_minor:u8`
pub const MANIFEST_HEADER_SIZE: usize = 4;
/// `size:u16, type:u8`
pub const DESCRIPTOR_HEADER_SIZE: usize = 3;

/// `vendor:u16, product:u16, version:u16, serial_number:u64,
/// vendor_stringid:u8, product_stringid:u8`
pub const MODULE_BODY_SIZE: usize = 16;
/// `id:u8, length:u16` (string bytes follow)
pub const STRING_BODY_SIZE: usize = 3;
/// `number:u16, speed:u8, reserved:u8`
pub const CPORT_BODY_SIZE: usize = 4;

/// Descriptor type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorType {
    Invalid,
    Module,
    Device,
    Class,
    String,
    CPort,
}

impl DescriptorType {
    /// Decode a type tag. Unknown tags yield `None`; `0x00` is the explicit
    /// `Invalid` tag and is still rejected by the parser.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Invalid),
            0x01 => Some(Self::Module),
            0x02 => Some(Self::Device),
            0x03 => Some(Self::Class),
            0x04 => Some(Self::String),
            0x05 => Some(Self::CPort),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Module => 0x01,
            Self::Device => 0x02,
            Self::Class => 0x03,
            Self::String => 0x04,
            Self::CPort => 0x05,
        }
    }

    /// Smallest declared size (header included) a descriptor of this type may
    /// carry. String descriptors additionally need room for their bytes.
    pub fn min_size(self) -> usize {
        DESCRIPTOR_HEADER_SIZE
            + match self {
                Self::Module => MODULE_BODY_SIZE,
                Self::String => STRING_BODY_SIZE,
                Self::CPort => CPORT_BODY_SIZE,
                Self::Invalid | Self::Device | Self::Class => 0,
            }
    }
}

impl std::fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Module => "module",
            Self::Device => "device",
            Self::Class => "class",
            Self::String => "string",
            Self::CPort => "cport",
        };
        f.write_str(name)
    }
}

/// A CPort advertised by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CPortDescriptor {
    pub number: u16,
    pub speed: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_roundtrip() {
        for tag in 0x00..=0x05u8 {
            let kind = DescriptorType::from_u8(tag).unwrap();
            assert_eq!(kind.as_u8(), tag);
        }
        assert_eq!(DescriptorType::from_u8(0x06), None);
        assert_eq!(DescriptorType::from_u8(0xff), None);
    }

    #[test]
    fn minimum_sizes_include_header() {
        assert_eq!(DescriptorType::Module.min_size(), 19);
        assert_eq!(DescriptorType::String.min_size(), 6);
        assert_eq!(DescriptorType::CPort.min_size(), 7);
        assert_eq!(DescriptorType::Device.min_size(), 3);
        assert_eq!(DescriptorType::Class.min_size(), 3);
    }
}
