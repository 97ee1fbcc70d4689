//! Modules attached to a host, and id-table matching against them.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::manifest::{CPortDescriptor, Manifest, ManifestError};

/// Identity of a module, as declared by its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub serial_number: u64,
    pub vendor_string: Option<String>,
    pub product_string: Option<String>,
}

/// Which fields of a [`ModuleMatch`] are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatchFlags(u16);

impl MatchFlags {
    pub const VENDOR: Self = Self(1 << 0);
    pub const PRODUCT: Self = Self(1 << 1);
    pub const SERIAL: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MatchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One entry of a driver's id table.
///
/// Only the fields named in `flags` take part in matching; an entry with no
/// flags matches every module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleMatch {
    pub flags: MatchFlags,
    pub vendor: u16,
    pub product: u16,
    pub serial_number: u64,
}

impl ModuleMatch {
    pub fn device(vendor: u16, product: u16) -> Self {
        Self::default().with_vendor(vendor).with_product(product)
    }

    pub fn with_vendor(mut self, vendor: u16) -> Self {
        self.flags = self.flags | MatchFlags::VENDOR;
        self.vendor = vendor;
        self
    }

    pub fn with_product(mut self, product: u16) -> Self {
        self.flags = self.flags | MatchFlags::PRODUCT;
        self.product = product;
        self
    }

    pub fn with_serial(mut self, serial_number: u64) -> Self {
        self.flags = self.flags | MatchFlags::SERIAL;
        self.serial_number = serial_number;
        self
    }

    pub fn matches(&self, module: &ModuleDescriptor) -> bool {
        if self.flags.contains(MatchFlags::VENDOR) && self.vendor != module.vendor {
            return false;
        }
        if self.flags.contains(MatchFlags::PRODUCT) && self.product != module.product {
            return false;
        }
        if self.flags.contains(MatchFlags::SERIAL) && self.serial_number != module.serial_number {
            return false;
        }
        true
    }
}

/// First entry of `table` matching `module`.
pub fn find_match<'a>(
    table: &'a [ModuleMatch],
    module: &ModuleDescriptor,
) -> Option<&'a ModuleMatch> {
    table.iter().find(|entry| entry.matches(module))
}

/// A module attached to a host.
#[derive(Debug)]
pub struct Module {
    id: u8,
    descriptor: ModuleDescriptor,
    cports: Vec<CPortDescriptor>,
}

impl Module {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn cports(&self) -> &[CPortDescriptor] {
        &self.cports
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("module {module_id}: invalid manifest: {source}")]
    Manifest {
        module_id: u8,
        #[source]
        source: ManifestError,
    },

    #[error("module {0} is already attached")]
    Duplicate(u8),
}

/// Modules currently attached to one host, keyed by module id.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: DashMap<u8, Arc<Module>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `manifest` and attach the module it describes.
    ///
    /// Nothing is recorded unless the manifest parses in full.
    pub fn attach(&self, module_id: u8, manifest: &[u8]) -> Result<Arc<Module>, AttachError> {
        let parsed = Manifest::parse(manifest).map_err(|source| {
            tracing::warn!(module_id, error = %source, "Rejecting module manifest");
            AttachError::Manifest { module_id, source }
        })?;

        match self.modules.entry(module_id) {
            Entry::Occupied(_) => Err(AttachError::Duplicate(module_id)),
            Entry::Vacant(slot) => {
                let module = Arc::new(Module {
                    id: module_id,
                    descriptor: parsed.module,
                    cports: parsed.cports,
                });
                slot.insert(Arc::clone(&module));
                tracing::info!(
                    module_id,
                    vendor = module.descriptor.vendor,
                    product = module.descriptor.product,
                    cports = module.cports.len(),
                    "Module attached"
                );
                Ok(module)
            }
        }
    }

    pub fn detach(&self, module_id: u8) -> Option<Arc<Module>> {
        let removed = self.modules.remove(&module_id).map(|(_, module)| module);
        if removed.is_some() {
            tracing::info!(module_id, "Module detached");
        }
        removed
    }

    pub fn get(&self, module_id: u8) -> Option<Arc<Module>> {
        self.modules.get(&module_id).map(|m| Arc::clone(m.value()))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
