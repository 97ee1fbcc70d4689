//! greybus: module manifests, CPort connections and the USB transport bridge.

mod sync;

pub mod bridge;
pub mod connection;
pub mod manifest;
pub mod module;
pub mod protocol;
pub mod svc;

pub use bridge::{Bridge, BridgeConfig, BridgeStats, TransferStatus, TransportError};
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionHandler, ConnectionRegistry, DestroyError, HostId,
    InterfaceId, RegistryError, connection_channel,
};
pub use manifest::{Manifest, ManifestBuilder, ManifestError};
pub use module::{AttachError, ModuleDescriptor, ModuleMatch, ModuleTable};
pub use protocol::{Protocol, ProtocolRegistry, ProtocolVersion};
pub use svc::{SvcHandler, SvcMessage, SvcQueue};
