//! Supervisory (SVC) messages.
//!
//! Supervisory messages travel outside the CPort framing: the bridge sends
//! them as control transfers and receives them on the interrupt endpoint.
//! Every message starts with a 6-byte header:
//! `function:u8, type:u8, version_major:u8, version_minor:u8, payload_length:u16`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SVC_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvcFunction {
    Handshake,
    UniproNetworkManagement,
    Hotplug,
    Ddb,
    Power,
    Epm,
    Suspend,
}

impl SvcFunction {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Handshake,
            0x01 => Self::UniproNetworkManagement,
            0x02 => Self::Hotplug,
            0x03 => Self::Ddb,
            0x04 => Self::Power,
            0x05 => Self::Epm,
            0x06 => Self::Suspend,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Handshake => 0x00,
            Self::UniproNetworkManagement => 0x01,
            Self::Hotplug => 0x02,
            Self::Ddb => 0x03,
            Self::Power => 0x04,
            Self::Epm => 0x05,
            Self::Suspend => 0x06,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    SvcHello,
    ApHello,
    ModuleHello,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryStatus {
    Unknown,
    Charging,
    Discharging,
    NotCharging,
    Full,
}

impl BatteryStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Charging,
            0x02 => Self::Discharging,
            0x03 => Self::NotCharging,
            0x04 => Self::Full,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0x00,
            Self::Charging => 0x01,
            Self::Discharging => 0x02,
            Self::NotCharging => 0x03,
            Self::Full => 0x04,
        }
    }
}

/// Decoded message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcBody {
    Handshake(HandshakeType),
    SetRoute {
        source_device_id: u8,
        source_cport_id: u8,
        destination_device_id: u8,
        destination_cport_id: u8,
    },
    LinkUp {
        device_id: u8,
    },
    Hotplug {
        device_id: u8,
    },
    Hotunplug {
        device_id: u8,
    },
    DdbGet {
        device_id: u8,
        message_id: u8,
    },
    DdbResponse {
        device_id: u8,
        message_id: u8,
        descriptor: Bytes,
    },
    BatteryStatus {
        charge_full: u16,
        charge_now: u16,
        status: BatteryStatus,
    },
    BatteryStatusRequest,
    /// Functions without a typed payload (EPM, suspend, unknown codes).
    Raw {
        function: u8,
        payload: Bytes,
    },
}

impl SvcBody {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::Handshake(_) => SvcFunction::Handshake.as_u8(),
            Self::SetRoute { .. } | Self::LinkUp { .. } => {
                SvcFunction::UniproNetworkManagement.as_u8()
            }
            Self::Hotplug { .. } | Self::Hotunplug { .. } => SvcFunction::Hotplug.as_u8(),
            Self::DdbGet { .. } | Self::DdbResponse { .. } => SvcFunction::Ddb.as_u8(),
            Self::BatteryStatus { .. } | Self::BatteryStatusRequest => SvcFunction::Power.as_u8(),
            Self::Raw { function, .. } => *function,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SvcError {
    #[error("SVC message too short ({0} bytes)")]
    TooShort(usize),

    #[error("SVC payload length {declared} exceeds the {available} bytes received")]
    Truncated { declared: u16, available: usize },

    #[error("{function:?} payload needs {needed} bytes, got {available}")]
    PayloadTooShort {
        function: SvcFunction,
        needed: usize,
        available: usize,
    },

    #[error("unknown {function:?} message type {code:#04x}")]
    UnknownType { function: SvcFunction, code: u8 },

    #[error("SVC payload too large ({0} bytes)")]
    TooLarge(usize),
}

/// A complete supervisory message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvcMessage {
    /// Header `type` byte. Carried through unchanged.
    pub message_type: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub body: SvcBody,
}

impl SvcMessage {
    pub fn new(body: SvcBody) -> Self {
        Self {
            message_type: 0,
            version_major: 0,
            version_minor: 0,
            body,
        }
    }

    pub fn parse(mut src: &[u8]) -> Result<Self, SvcError> {
        if src.len() < SVC_HEADER_SIZE {
            return Err(SvcError::TooShort(src.len()));
        }
        let function = src.get_u8();
        let message_type = src.get_u8();
        let version_major = src.get_u8();
        let version_minor = src.get_u8();
        let declared = src.get_u16_le();
        if usize::from(declared) > src.len() {
            return Err(SvcError::Truncated {
                declared,
                available: src.len(),
            });
        }
        let payload = &src[..usize::from(declared)];

        let body = match SvcFunction::from_u8(function) {
            Some(SvcFunction::Handshake) => parse_handshake(payload)?,
            Some(SvcFunction::UniproNetworkManagement) => parse_management(payload)?,
            Some(SvcFunction::Hotplug) => parse_hotplug(payload)?,
            Some(SvcFunction::Ddb) => parse_ddb(payload)?,
            Some(SvcFunction::Power) => parse_power(payload)?,
            Some(SvcFunction::Epm | SvcFunction::Suspend) | None => SvcBody::Raw {
                function,
                payload: Bytes::copy_from_slice(payload),
            },
        };

        Ok(Self {
            message_type,
            version_major,
            version_minor,
            body,
        })
    }

    pub fn encode(&self) -> Result<Bytes, SvcError> {
        let mut payload = BytesMut::new();
        match &self.body {
            SvcBody::Handshake(kind) => payload.put_u8(match kind {
                HandshakeType::SvcHello => 0x00,
                HandshakeType::ApHello => 0x01,
                HandshakeType::ModuleHello => 0x02,
            }),
            SvcBody::SetRoute {
                source_device_id,
                source_cport_id,
                destination_device_id,
                destination_cport_id,
            } => {
                payload.put_u8(0x00);
                payload.put_slice(&[
                    *source_device_id,
                    *source_cport_id,
                    *destination_device_id,
                    *destination_cport_id,
                ]);
            }
            SvcBody::LinkUp { device_id } => payload.put_slice(&[0x01, *device_id]),
            SvcBody::Hotplug { device_id } => payload.put_slice(&[0x00, *device_id]),
            SvcBody::Hotunplug { device_id } => payload.put_slice(&[0x01, *device_id]),
            SvcBody::DdbGet {
                device_id,
                message_id,
            } => payload.put_slice(&[0x00, *device_id, *message_id]),
            SvcBody::DdbResponse {
                device_id,
                message_id,
                descriptor,
            } => {
                let len = u16::try_from(descriptor.len())
                    .map_err(|_| SvcError::TooLarge(descriptor.len()))?;
                payload.put_slice(&[0x01, *device_id, *message_id]);
                payload.put_u16_le(len);
                payload.put_slice(descriptor);
            }
            SvcBody::BatteryStatus {
                charge_full,
                charge_now,
                status,
            } => {
                payload.put_u8(0x00);
                payload.put_u16_le(*charge_full);
                payload.put_u16_le(*charge_now);
                payload.put_u8(status.as_u8());
            }
            SvcBody::BatteryStatusRequest => payload.put_u8(0x01),
            SvcBody::Raw { payload: raw, .. } => payload.put_slice(raw),
        }

        let len = u16::try_from(payload.len()).map_err(|_| SvcError::TooLarge(payload.len()))?;
        let mut out = BytesMut::with_capacity(SVC_HEADER_SIZE + payload.len());
        out.put_u8(self.body.function_code());
        out.put_u8(self.message_type);
        out.put_u8(self.version_major);
        out.put_u8(self.version_minor);
        out.put_u16_le(len);
        out.put_slice(&payload);
        Ok(out.freeze())
    }
}

fn need(function: SvcFunction, payload: &[u8], needed: usize) -> Result<(), SvcError> {
    if payload.len() < needed {
        return Err(SvcError::PayloadTooShort {
            function,
            needed,
            available: payload.len(),
        });
    }
    Ok(())
}

fn parse_handshake(payload: &[u8]) -> Result<SvcBody, SvcError> {
    let function = SvcFunction::Handshake;
    need(function, payload, 1)?;
    let kind = match payload[0] {
        0x00 => HandshakeType::SvcHello,
        0x01 => HandshakeType::ApHello,
        0x02 => HandshakeType::ModuleHello,
        code => return Err(SvcError::UnknownType { function, code }),
    };
    Ok(SvcBody::Handshake(kind))
}

fn parse_management(payload: &[u8]) -> Result<SvcBody, SvcError> {
    let function = SvcFunction::UniproNetworkManagement;
    need(function, payload, 1)?;
    match payload[0] {
        0x00 => {
            need(function, payload, 5)?;
            Ok(SvcBody::SetRoute {
                source_device_id: payload[1],
                source_cport_id: payload[2],
                destination_device_id: payload[3],
                destination_cport_id: payload[4],
            })
        }
        0x01 => {
            need(function, payload, 2)?;
            Ok(SvcBody::LinkUp {
                device_id: payload[1],
            })
        }
        code => Err(SvcError::UnknownType { function, code }),
    }
}

fn parse_hotplug(payload: &[u8]) -> Result<SvcBody, SvcError> {
    let function = SvcFunction::Hotplug;
    need(function, payload, 2)?;
    let device_id = payload[1];
    match payload[0] {
        0x00 => Ok(SvcBody::Hotplug { device_id }),
        0x01 => Ok(SvcBody::Hotunplug { device_id }),
        code => Err(SvcError::UnknownType { function, code }),
    }
}

fn parse_ddb(payload: &[u8]) -> Result<SvcBody, SvcError> {
    let function = SvcFunction::Ddb;
    need(function, payload, 1)?;
    match payload[0] {
        0x00 => {
            need(function, payload, 3)?;
            Ok(SvcBody::DdbGet {
                device_id: payload[1],
                message_id: payload[2],
            })
        }
        0x01 => {
            need(function, payload, 5)?;
            let mut rest = &payload[3..];
            let len = usize::from(rest.get_u16_le());
            need(function, payload, 5 + len)?;
            Ok(SvcBody::DdbResponse {
                device_id: payload[1],
                message_id: payload[2],
                descriptor: Bytes::copy_from_slice(&rest[..len]),
            })
        }
        code => Err(SvcError::UnknownType { function, code }),
    }
}

fn parse_power(payload: &[u8]) -> Result<SvcBody, SvcError> {
    let function = SvcFunction::Power;
    need(function, payload, 1)?;
    match payload[0] {
        0x00 => {
            need(function, payload, 6)?;
            let mut rest = &payload[1..];
            let charge_full = rest.get_u16_le();
            let charge_now = rest.get_u16_le();
            let status = BatteryStatus::from_u8(rest.get_u8());
            Ok(SvcBody::BatteryStatus {
                charge_full,
                charge_now,
                status,
            })
        }
        0x01 => Ok(SvcBody::BatteryStatusRequest),
        code => Err(SvcError::UnknownType { function, code }),
    }
}

/// Receives raw supervisory messages from a bridge.
///
/// Called on the completion path; must not block.
pub trait SvcHandler: Send + Sync + 'static {
    fn on_svc_message(&self, message: Bytes);
}

/// Handler that queues supervisory messages for a consumer task.
#[derive(Debug)]
pub struct SvcQueue {
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Consuming end of an [`SvcQueue`].
#[derive(Debug)]
pub struct SvcReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl SvcQueue {
    pub fn new() -> (Arc<Self>, SvcReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), SvcReceiver { rx })
    }
}

impl SvcHandler for SvcQueue {
    fn on_svc_message(&self, message: Bytes) {
        if self.tx.send(message).is_err() {
            tracing::debug!("SVC receiver dropped, discarding message");
        }
    }
}

impl SvcReceiver {
    /// Next raw message. `None` once every queue handle is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next message, decoded. Undecodable messages are logged and skipped.
    pub async fn recv_message(&mut self) -> Option<SvcMessage> {
        loop {
            let raw = self.rx.recv().await?;
            match SvcMessage::parse(&raw) {
                Ok(message) => return Some(message),
                Err(error) => tracing::warn!(%error, len = raw.len(), "Dropping malformed SVC message"),
            }
        }
    }
}
