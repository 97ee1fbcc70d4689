//! The physical transport underneath a bridge.
//!
//! Submission is synchronous: once a `submit_*` call returns, the transfer is
//! queued on its endpoint in call order. Completion arrives through the
//! returned future. Dropping that future kills the transfer.

use futures::future::BoxFuture;
use tokio_util::bytes::{Bytes, BytesMut};

use super::endpoint::EndpointDescriptor;
use super::status::TransferStatus;

/// Completion of a submitted transfer.
pub type TransferFuture<T> = BoxFuture<'static, T>;

/// Buffer handed back with its completion status. For IN transfers the
/// buffer's length is the number of bytes received.
pub type Completion = (TransferStatus, BytesMut);

/// `bRequestType` of a vendor request to the interface, host to device.
pub const CONTROL_OUT_VENDOR_INTERFACE: u8 = 0x41;

/// Setup packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request: u8,
    pub request_type: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Vendor request used to send a supervisory message.
    pub const fn svc() -> Self {
        Self {
            request: 0x01,
            request_type: CONTROL_OUT_VENDOR_INTERFACE,
            value: 0,
            index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("device disconnected")]
    Disconnected,
    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// A USB-shaped host controller.
pub trait UsbHost: Send + Sync + 'static {
    fn endpoints(&self) -> Vec<EndpointDescriptor>;

    fn submit_bulk_out(
        &self,
        endpoint: u8,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError>;

    /// Post `buffer` to receive up to its capacity.
    fn submit_bulk_in(
        &self,
        endpoint: u8,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError>;

    /// Post `buffer` to receive up to its capacity.
    fn submit_interrupt_in(
        &self,
        endpoint: u8,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError>;

    /// Send `data` on the control endpoint. Resolves to the number of bytes
    /// written.
    fn control_out(
        &self,
        setup: ControlSetup,
        data: Bytes,
    ) -> TransferFuture<Result<usize, TransferStatus>>;
}
