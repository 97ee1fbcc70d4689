/// Direction bit of an endpoint address.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// An endpoint exposed by the bridge's interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub kind: EndpointKind,
}

impl EndpointDescriptor {
    pub fn bulk_in(number: u8) -> Self {
        Self {
            address: number | ENDPOINT_DIR_IN,
            kind: EndpointKind::Bulk,
        }
    }

    pub fn bulk_out(number: u8) -> Self {
        Self {
            address: number & !ENDPOINT_DIR_IN,
            kind: EndpointKind::Bulk,
        }
    }

    pub fn interrupt_in(number: u8) -> Self {
        Self {
            address: number | ENDPOINT_DIR_IN,
            kind: EndpointKind::Interrupt,
        }
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("no interrupt-in endpoint")]
    MissingInterruptIn,
    #[error("no bulk-in endpoint")]
    MissingBulkIn,
    #[error("no bulk-out endpoint")]
    MissingBulkOut,
}

/// Endpoints the bridge drives. Control endpoint 0 is implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSet {
    pub svc_in: u8,
    pub cport_in: u8,
    pub cport_out: u8,
}

impl EndpointSet {
    /// Pick the first endpoint of each required kind.
    pub fn discover(endpoints: &[EndpointDescriptor]) -> Result<Self, EndpointError> {
        let mut svc_in = None;
        let mut cport_in = None;
        let mut cport_out = None;

        for endpoint in endpoints {
            match (endpoint.kind, endpoint.is_in()) {
                (EndpointKind::Interrupt, true) => {
                    svc_in.get_or_insert(endpoint.address);
                }
                (EndpointKind::Bulk, true) => {
                    cport_in.get_or_insert(endpoint.address);
                }
                (EndpointKind::Bulk, false) => {
                    cport_out.get_or_insert(endpoint.address);
                }
                (kind, _) => {
                    tracing::info!(address = endpoint.address, ?kind, "Ignoring unexpected endpoint");
                }
            }
        }

        let set = Self {
            svc_in: svc_in.ok_or(EndpointError::MissingInterruptIn)?,
            cport_in: cport_in.ok_or(EndpointError::MissingBulkIn)?,
            cport_out: cport_out.ok_or(EndpointError::MissingBulkOut)?,
        };
        tracing::debug!(
            svc_in = set.svc_in,
            cport_in = set.cport_in,
            cport_out = set.cport_out,
            "Discovered bridge endpoints"
        );
        Ok(set)
    }
}
