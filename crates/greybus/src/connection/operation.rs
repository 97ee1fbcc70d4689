//! Operation ids and the operation message header.

use std::collections::BTreeSet;

use tokio_util::bytes::{Buf, BufMut};

/// `size:u16, id:u16, type:u8, pad[3]`
pub const OPERATION_HEADER_SIZE: usize = 8;

/// Set in the type byte of a response.
pub const OPERATION_TYPE_RESPONSE: u8 = 0x80;

/// Per-connection operation id state.
///
/// Ids come from a 16-bit cycle counter that wraps; an id that is still
/// pending is skipped.
#[derive(Debug, Default)]
pub(crate) struct OperationTracker {
    cycle: u16,
    pending: BTreeSet<u16>,
}

impl OperationTracker {
    /// Next id not currently pending, or `None` if all 65536 are.
    pub fn next_id(&mut self) -> Option<u16> {
        if self.pending.len() > usize::from(u16::MAX) {
            return None;
        }
        loop {
            let id = self.cycle;
            self.cycle = self.cycle.wrapping_add(1);
            if !self.pending.contains(&id) {
                return Some(id);
            }
        }
    }

    /// Allocate an id and mark it pending.
    pub fn begin(&mut self) -> Option<u16> {
        let id = self.next_id()?;
        self.pending.insert(id);
        Some(id)
    }

    pub fn complete(&mut self, id: u16) -> bool {
        self.pending.remove(&id)
    }

    pub fn pending(&self) -> Vec<u16> {
        self.pending.iter().copied().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationHeaderError {
    #[error("operation message too short ({0} bytes)")]
    TooShort(usize),

    #[error("operation size {declared} smaller than its header")]
    InvalidSize { declared: u16 },
}

/// Header that prefixes every operation request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHeader {
    /// Header plus payload, in bytes.
    pub size: u16,
    pub id: u16,
    pub kind: u8,
}

impl OperationHeader {
    /// Header for a request carrying `payload_len` bytes.
    ///
    /// Returns `None` if the message would not fit the 16-bit size field.
    pub fn request(id: u16, kind: u8, payload_len: usize) -> Option<Self> {
        let size = u16::try_from(OPERATION_HEADER_SIZE + payload_len).ok()?;
        Some(Self {
            size,
            id,
            kind: kind & !OPERATION_TYPE_RESPONSE,
        })
    }

    /// Header for the response to this request.
    pub fn response(&self, payload_len: usize) -> Option<Self> {
        let size = u16::try_from(OPERATION_HEADER_SIZE + payload_len).ok()?;
        Some(Self {
            size,
            id: self.id,
            kind: self.kind | OPERATION_TYPE_RESPONSE,
        })
    }

    pub fn is_response(&self) -> bool {
        self.kind & OPERATION_TYPE_RESPONSE != 0
    }

    /// Type code with the response bit cleared.
    pub fn operation_type(&self) -> u8 {
        self.kind & !OPERATION_TYPE_RESPONSE
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.size) - OPERATION_HEADER_SIZE
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.size);
        dst.put_u16_le(self.id);
        dst.put_u8(self.kind);
        dst.put_bytes(0, 3);
    }

    pub fn parse(mut src: &[u8]) -> Result<Self, OperationHeaderError> {
        if src.len() < OPERATION_HEADER_SIZE {
            return Err(OperationHeaderError::TooShort(src.len()));
        }
        let size = src.get_u16_le();
        let id = src.get_u16_le();
        let kind = src.get_u8();
        if usize::from(size) < OPERATION_HEADER_SIZE {
            return Err(OperationHeaderError::InvalidSize { declared: size });
        }
        Ok(Self { size, id, kind })
    }
}
