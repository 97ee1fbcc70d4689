//! Module manifest decoding.
//!
//! A manifest is an untrusted, length-prefixed buffer supplied by a module
//! when it is plugged in. [`parse`] validates it in full before anything is
//! returned; [`Manifest::parse`] additionally keeps the CPort descriptors.

mod builder;
mod parser;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use builder::ManifestBuilder;
pub use parser::parse;
pub use wire::{CPortDescriptor, DescriptorType};

use crate::module::ModuleDescriptor;

/// Why a manifest was rejected. Offsets are byte offsets into the manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("manifest size mismatch: header says {declared}, buffer is {actual} bytes")]
    SizeMismatch { declared: u16, actual: usize },

    #[error("unsupported manifest version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("truncated descriptor header at offset {offset} ({remaining} bytes left)")]
    TruncatedDescriptor { offset: usize, remaining: usize },

    #[error(
        "descriptor at offset {offset} declares {declared} bytes but only {remaining} remain"
    )]
    DescriptorTooBig {
        offset: usize,
        declared: u16,
        remaining: usize,
    },

    #[error("zero-sized descriptor at offset {offset}")]
    ZeroSizedDescriptor { offset: usize },

    #[error("invalid descriptor type {tag:#04x} at offset {offset}")]
    InvalidDescriptorType { offset: usize, tag: u8 },

    #[error("{kind} descriptor at offset {offset} too small ({declared} < {minimum})")]
    DescriptorTooSmall {
        offset: usize,
        kind: DescriptorType,
        declared: u16,
        minimum: usize,
    },

    #[error("manifest must contain exactly one module descriptor (found {found})")]
    ModuleCount { found: usize },

    #[error("string descriptor {id} not found")]
    MissingString { id: u8 },
}

/// A decoded manifest: the module descriptor plus the CPorts it advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub module: ModuleDescriptor,
    #[serde(default)]
    pub cports: Vec<CPortDescriptor>,
}

impl Manifest {
    /// Parse a manifest, keeping CPort descriptors instead of discarding them.
    pub fn parse(buffer: &[u8]) -> Result<Self, ManifestError> {
        let mut parsed = parser::parse_module(buffer)?;
        let cports = parser::take_cports(&mut parsed.remaining);
        parser::discard_excess(&parsed.remaining);
        Ok(Self {
            module: parsed.module,
            cports,
        })
    }

    /// Encode back to the wire format.
    ///
    /// Vendor and product strings get ids 1 and 2 when present; absent strings
    /// are encoded as id 0. Overlong strings are truncated; a manifest whose
    /// total still exceeds `u16::MAX` bytes will not parse.
    pub fn encode(&self) -> tokio_util::bytes::Bytes {
        let module = &self.module;
        let vendor_id = if module.vendor_string.is_some() { 1 } else { 0 };
        let product_id = if module.product_string.is_some() { 2 } else { 0 };

        let mut builder = ManifestBuilder::new().module(
            module.vendor,
            module.product,
            module.version,
            module.serial_number,
            vendor_id,
            product_id,
        );
        if let Some(vendor) = &module.vendor_string {
            builder = builder.string(vendor_id, vendor);
        }
        if let Some(product) = &module.product_string {
            builder = builder.string(product_id, product);
        }
        for cport in &self.cports {
            builder = builder.cport(cport.number, cport.speed);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            module: ModuleDescriptor {
                vendor: 0x0001,
                product: 0x0002,
                version: 0x0100,
                serial_number: 0xdead_beef,
                vendor_string: Some("Acme".to_string()),
                product_string: Some("Blinker".to_string()),
            },
            cports: vec![
                CPortDescriptor { number: 1, speed: 0 },
                CPortDescriptor { number: 2, speed: 1 },
            ],
        }
    }

    #[test]
    fn encode_then_parse_is_identity() {
        let manifest = sample();
        let parsed = Manifest::parse(&manifest.encode()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn plain_parse_ignores_cports() {
        let module = parse(&sample().encode()).unwrap();
        assert_eq!(module, sample().module);
    }

    #[test]
    fn manifest_json() {
        insta::assert_json_snapshot!(sample(), @r#"
        {
          "module": {
            "vendor": 1,
            "product": 2,
            "version": 256,
            "serial_number": 3735928559,
            "vendor_string": "Acme",
            "product_string": "Blinker"
          },
          "cports": [
            {
              "number": 1,
              "speed": 0
            },
            {
              "number": 2,
              "speed": 1
            }
          ]
        }
        "#);
    }

    #[test]
    fn error_messages() {
        let err = ManifestError::InvalidDescriptorType { offset: 23, tag: 0x42 };
        assert_eq!(err.to_string(), "invalid descriptor type 0x42 at offset 23");

        let err = ManifestError::DescriptorTooSmall {
            offset: 4,
            kind: DescriptorType::Module,
            declared: 18,
            minimum: 19,
        };
        assert_eq!(
            err.to_string(),
            "module descriptor at offset 4 too small (18 < 19)"
        );
    }
}
