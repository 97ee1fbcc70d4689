//! CPort framing for the bulk channels.
//!
//! Each bulk transfer carries exactly one frame: a single CPort id byte
//! followed by the raw payload. There is no length field; the transfer
//! boundary delimits the frame.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame to be written to bulk out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundFrame<'a> {
    pub cport_id: u8,
    pub payload: &'a [u8],
}

/// Frame read from bulk in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub cport_id: u8,
    pub payload: Bytes,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CPortCodec;

impl CPortCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for CPortCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    /// Decode a completed transfer. The payload is copied out and `src` is
    /// cleared so the buffer can be posted again at full capacity. An empty
    /// transfer carries no CPort id and yields `None`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((&cport_id, payload)) = src.split_first() else {
            return Ok(None);
        };
        let frame = InboundFrame {
            cport_id,
            payload: Bytes::copy_from_slice(payload),
        };
        src.clear();
        tracing::trace!(cport_id, len = frame.payload.len(), "Decoded ingress frame");
        Ok(Some(frame))
    }
}

impl Encoder<OutboundFrame<'_>> for CPortCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OutboundFrame<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(1 + item.payload.len());
        dst.put_u8(item.cport_id);
        dst.put_slice(item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_prefixes_cport_id() {
        let mut dst = BytesMut::new();
        CPortCodec
            .encode(
                OutboundFrame {
                    cport_id: 5,
                    payload: &[0xAA, 0xBB],
                },
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], &[0x05, 0xAA, 0xBB]);
    }

    #[test]
    fn ingress_strips_cport_id() {
        let mut src = BytesMut::from(&[0x05, 0xAA, 0xBB][..]);
        let capacity = src.capacity();
        let frame = CPortCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.cport_id, 5);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB]);
        assert!(src.is_empty());
        assert_eq!(src.capacity(), capacity);
    }

    #[test]
    fn id_only_frame_has_empty_payload() {
        let mut src = BytesMut::from(&[0x09][..]);
        let frame = CPortCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.cport_id, 9);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn empty_transfer_has_no_frame() {
        let mut src = BytesMut::new();
        assert_eq!(CPortCodec.decode(&mut src).unwrap(), None);
    }
}
