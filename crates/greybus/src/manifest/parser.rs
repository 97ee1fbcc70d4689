//! Single-pass manifest decoder.
//!
//! The buffer is walked once to identify every descriptor. The resulting
//! working list is owned by the call to [`parse`] and descriptors are removed
//! from it as they are matched (module descriptor first, then the strings it
//! references). Nothing is returned to the caller unless every step succeeds.

use tokio_util::bytes::Buf;

use super::ManifestError;
use super::wire::{
    CPortDescriptor, DESCRIPTOR_HEADER_SIZE, DescriptorType, MANIFEST_HEADER_SIZE,
    MANIFEST_VERSION_MAJOR,
};
use crate::module::ModuleDescriptor;

/// One entry of the working list: a validated descriptor borrowed from the
/// manifest buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ManifestDescriptor<'a> {
    pub kind: DescriptorType,
    pub size: u16,
    pub offset: usize,
    /// The whole descriptor, header included, trimmed to the declared size.
    pub data: &'a [u8],
}

impl<'a> ManifestDescriptor<'a> {
    fn body(&self) -> &'a [u8] {
        &self.data[DESCRIPTOR_HEADER_SIZE..]
    }

    /// Id of a string descriptor.
    fn string_id(&self) -> u8 {
        self.body()[0]
    }
}

/// Module descriptor plus whatever the module lookup left unconsumed.
pub(crate) struct ParsedManifest<'a> {
    pub module: ModuleDescriptor,
    pub remaining: Vec<ManifestDescriptor<'a>>,
}

/// Parse a module manifest.
///
/// Descriptors that are valid but not referenced by the module descriptor are
/// logged and discarded.
pub fn parse(buffer: &[u8]) -> Result<ModuleDescriptor, ManifestError> {
    let parsed = parse_module(buffer)?;
    discard_excess(&parsed.remaining);
    Ok(parsed.module)
}

pub(crate) fn parse_module(buffer: &[u8]) -> Result<ParsedManifest<'_>, ManifestError> {
    let (major, minor) = check_header(buffer)?;
    tracing::trace!(len = buffer.len(), major, minor, "Parsing manifest");

    let mut descriptors = identify_descriptors(buffer)?;

    let mut modules = descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| d.kind == DescriptorType::Module)
        .map(|(i, _)| i);
    let module_index = match (modules.next(), modules.count()) {
        (Some(index), 0) => index,
        (first, rest) => {
            let found = usize::from(first.is_some()) + rest;
            return Err(ManifestError::ModuleCount { found });
        }
    };

    let module_desc = descriptors.remove(module_index);
    let module = parse_module_descriptor(&module_desc, &mut descriptors)?;

    Ok(ParsedManifest {
        module,
        remaining: descriptors,
    })
}

/// Pull every CPort descriptor out of the working list, in manifest order.
pub(crate) fn take_cports(descriptors: &mut Vec<ManifestDescriptor<'_>>) -> Vec<CPortDescriptor> {
    let mut cports = Vec::new();
    descriptors.retain(|desc| {
        if desc.kind != DescriptorType::CPort {
            return true;
        }
        let mut body = desc.body();
        let number = body.get_u16_le();
        let speed = body.get_u8();
        cports.push(CPortDescriptor { number, speed });
        false
    });
    cports
}

pub(crate) fn discard_excess(remaining: &[ManifestDescriptor<'_>]) {
    if remaining.is_empty() {
        return;
    }
    let kinds: Vec<String> = remaining.iter().map(|d| d.kind.to_string()).collect();
    tracing::info!(
        count = remaining.len(),
        ?kinds,
        "Excess descriptors in module manifest"
    );
}

fn check_header(buffer: &[u8]) -> Result<(u8, u8), ManifestError> {
    if buffer.len() <= MANIFEST_HEADER_SIZE {
        return Err(ManifestError::TooShort { len: buffer.len() });
    }

    let mut header = &buffer[..MANIFEST_HEADER_SIZE];
    let declared = header.get_u16_le();
    let major = header.get_u8();
    let minor = header.get_u8();

    if usize::from(declared) != buffer.len() {
        return Err(ManifestError::SizeMismatch {
            declared,
            actual: buffer.len(),
        });
    }

    if major > MANIFEST_VERSION_MAJOR {
        return Err(ManifestError::UnsupportedVersion { major, minor });
    }

    Ok((major, minor))
}

fn identify_descriptors(buffer: &[u8]) -> Result<Vec<ManifestDescriptor<'_>>, ManifestError> {
    let mut descriptors = Vec::new();
    let mut offset = MANIFEST_HEADER_SIZE;

    while offset < buffer.len() {
        let desc = identify_descriptor(&buffer[offset..], offset)?;
        // Advance by the declared size, not the nominal body size.
        offset += usize::from(desc.size);
        descriptors.push(desc);
    }

    Ok(descriptors)
}

fn identify_descriptor(
    rest: &[u8],
    offset: usize,
) -> Result<ManifestDescriptor<'_>, ManifestError> {
    if rest.len() < DESCRIPTOR_HEADER_SIZE {
        return Err(ManifestError::TruncatedDescriptor {
            offset,
            remaining: rest.len(),
        });
    }

    let mut header = rest;
    let size = header.get_u16_le();
    let tag = header.get_u8();
    let declared = usize::from(size);

    if declared == 0 {
        return Err(ManifestError::ZeroSizedDescriptor { offset });
    }
    if declared > rest.len() {
        return Err(ManifestError::DescriptorTooBig {
            offset,
            declared: size,
            remaining: rest.len(),
        });
    }

    let kind = match DescriptorType::from_u8(tag) {
        Some(DescriptorType::Invalid) | None => {
            return Err(ManifestError::InvalidDescriptorType { offset, tag });
        }
        Some(kind) => kind,
    };

    let mut minimum = kind.min_size();
    if declared >= minimum && kind == DescriptorType::String {
        let mut body = &rest[DESCRIPTOR_HEADER_SIZE + 1..];
        minimum += usize::from(body.get_u16_le());
    }
    if declared < minimum {
        return Err(ManifestError::DescriptorTooSmall {
            offset,
            kind,
            declared: size,
            minimum,
        });
    }

    if kind == DescriptorType::Class {
        tracing::debug!(offset, "Class descriptor found (ignoring)");
    }

    Ok(ManifestDescriptor {
        kind,
        size,
        offset,
        data: &rest[..declared],
    })
}

fn parse_module_descriptor(
    module_desc: &ManifestDescriptor<'_>,
    descriptors: &mut Vec<ManifestDescriptor<'_>>,
) -> Result<ModuleDescriptor, ManifestError> {
    let mut body = module_desc.body();
    let vendor = body.get_u16_le();
    let product = body.get_u16_le();
    let version = body.get_u16_le();
    let serial_number = body.get_u64_le();
    let vendor_stringid = body.get_u8();
    let product_stringid = body.get_u8();

    // Strings first: they are the only part that can fail.
    let vendor_string = take_string(descriptors, vendor_stringid)?;
    let product_string = take_string(descriptors, product_stringid)?;

    Ok(ModuleDescriptor {
        vendor,
        product,
        version,
        serial_number,
        vendor_string,
        product_string,
    })
}

/// Find, copy and consume the string descriptor with the given id.
///
/// Id 0 means "no string" and is not an error.
fn take_string(
    descriptors: &mut Vec<ManifestDescriptor<'_>>,
    id: u8,
) -> Result<Option<String>, ManifestError> {
    if id == 0 {
        return Ok(None);
    }

    let index = descriptors
        .iter()
        .position(|d| d.kind == DescriptorType::String && d.string_id() == id)
        .ok_or(ManifestError::MissingString { id })?;
    let desc = descriptors.remove(index);

    let mut body = &desc.body()[1..];
    let length = usize::from(body.get_u16_le());
    let bytes = &body[..length];

    let string = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            tracing::warn!(id, offset = desc.offset, "String descriptor is not valid UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    };
    Ok(Some(string))
}
