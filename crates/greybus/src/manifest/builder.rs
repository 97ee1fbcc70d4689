use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use super::wire::{
    CPORT_BODY_SIZE, DESCRIPTOR_HEADER_SIZE, DescriptorType, MANIFEST_HEADER_SIZE,
    MANIFEST_VERSION_MAJOR, MANIFEST_VERSION_MINOR, MODULE_BODY_SIZE, STRING_BODY_SIZE,
};

/// Assembles a manifest buffer descriptor by descriptor.
///
/// The builder does not validate: it writes exactly what it is told, which is
/// what fixtures for malformed manifests need. The manifest size field is
/// filled in by [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    major: u8,
    minor: u8,
    body: BytesMut,
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            major: MANIFEST_VERSION_MAJOR,
            minor: MANIFEST_VERSION_MINOR,
            body: BytesMut::new(),
        }
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.major = major;
        self.minor = minor;
        self
    }

    pub fn module(
        mut self,
        vendor: u16,
        product: u16,
        version: u16,
        serial_number: u64,
        vendor_stringid: u8,
        product_stringid: u8,
    ) -> Self {
        self.put_header(DESCRIPTOR_HEADER_SIZE + MODULE_BODY_SIZE, DescriptorType::Module);
        self.body.put_u16_le(vendor);
        self.body.put_u16_le(product);
        self.body.put_u16_le(version);
        self.body.put_u64_le(serial_number);
        self.body.put_u8(vendor_stringid);
        self.body.put_u8(product_stringid);
        self
    }

    /// Strings that do not fit a descriptor are truncated on a character
    /// boundary.
    pub fn string(mut self, id: u8, value: &str) -> Self {
        let max = usize::from(u16::MAX) - DESCRIPTOR_HEADER_SIZE - STRING_BODY_SIZE;
        let mut end = value.len().min(max);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = value[..end].as_bytes();
        self.put_header(
            DESCRIPTOR_HEADER_SIZE + STRING_BODY_SIZE + bytes.len(),
            DescriptorType::String,
        );
        self.body.put_u8(id);
        self.body.put_u16_le(bytes.len() as u16);
        self.body.put_slice(bytes);
        self
    }

    pub fn cport(mut self, number: u16, speed: u8) -> Self {
        self.put_header(DESCRIPTOR_HEADER_SIZE + CPORT_BODY_SIZE, DescriptorType::CPort);
        self.body.put_u16_le(number);
        self.body.put_u8(speed);
        self.body.put_u8(0);
        self
    }

    pub fn device(mut self, body: &[u8]) -> Self {
        self.put_header(DESCRIPTOR_HEADER_SIZE + body.len(), DescriptorType::Device);
        self.body.put_slice(body);
        self
    }

    pub fn class(mut self, body: &[u8]) -> Self {
        self.put_header(DESCRIPTOR_HEADER_SIZE + body.len(), DescriptorType::Class);
        self.body.put_slice(body);
        self
    }

    /// Write a descriptor with an arbitrary declared size and type tag.
    pub fn raw(mut self, size: u16, tag: u8, body: &[u8]) -> Self {
        self.body.put_u16_le(size);
        self.body.put_u8(tag);
        self.body.put_slice(body);
        self
    }

    /// Append zero bytes after the last descriptor.
    pub fn padding(mut self, len: usize) -> Self {
        self.body.put_bytes(0, len);
        self
    }

    /// Finish the manifest. A body that pushes the total past `u16::MAX`
    /// produces a size field that will not match the buffer length.
    pub fn build(self) -> Bytes {
        let total = MANIFEST_HEADER_SIZE + self.body.len();
        let mut out = BytesMut::with_capacity(total);
        out.put_u16_le(total as u16);
        out.put_u8(self.major);
        out.put_u8(self.minor);
        out.put_slice(&self.body);
        out.freeze()
    }

    fn put_header(&mut self, size: usize, kind: DescriptorType) {
        self.body.put_u16_le(size as u16);
        self.body.put_u8(kind.as_u8());
    }
}
