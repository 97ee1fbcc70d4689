//! Connection registry.
//!
//! The registry is the only owner of connection identity. Each host has its
//! own CPort id space and connection table behind one reader/writer lock:
//! creation and destruction take it for writing, ingress lookups for reading.
//! Consumers hold a [`ConnectionHandle`], which cannot be cloned, so a
//! connection is destroyed at most once.

mod cport_ids;
pub mod operation;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::bridge::TransferStatus;
use crate::protocol::Protocol;
use crate::sync::{lock, read, write};
use cport_ids::CPortIdMap;
use operation::OperationTracker;

pub use operation::{
    OPERATION_HEADER_SIZE, OPERATION_TYPE_RESPONSE, OperationHeader, OperationHeaderError,
};

/// Default size of a host's CPort id space.
pub const DEFAULT_MAX_CPORT_IDS: u16 = 128;

/// A host transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host{}", self.0)
    }
}

/// An interface of a module attached to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceId {
    pub host: HostId,
    pub module_id: u8,
    pub interface_id: u8,
}

impl InterfaceId {
    pub fn new(host: HostId, module_id: u8, interface_id: u8) -> Self {
        Self {
            host,
            module_id,
            interface_id,
        }
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.host, self.module_id, self.interface_id)
    }
}

/// Receives traffic for one connection.
///
/// Both callbacks run on the bridge's completion path and must not block.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Payload received for this connection, CPort id byte stripped.
    fn on_receive(&self, payload: Bytes);

    /// Outcome of an earlier `submit` on this connection.
    fn on_send_complete(&self, status: TransferStatus) {
        let _ = status;
    }
}

/// Event produced by a [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Received(Bytes),
    SendComplete(TransferStatus),
}

/// Handler that forwards connection traffic onto an unbounded channel.
#[derive(Debug)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionHandler for ChannelHandler {
    fn on_receive(&self, payload: Bytes) {
        if self.tx.send(ConnectionEvent::Received(payload)).is_err() {
            tracing::debug!("Connection receiver dropped, discarding payload");
        }
    }

    fn on_send_complete(&self, status: TransferStatus) {
        let _ = self.tx.send(ConnectionEvent::SendComplete(status));
    }
}

/// A handler plus the receiving end of its event channel.
pub fn connection_channel() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler { tx }), rx)
}

pub(crate) struct Connection {
    interface: InterfaceId,
    host_cport_id: u16,
    interface_cport_id: u16,
    protocol: Protocol,
    operations: Mutex<OperationTracker>,
    handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("interface", &self.interface)
            .field("host_cport_id", &self.host_cport_id)
            .field("interface_cport_id", &self.interface_cport_id)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn host(&self) -> HostId {
        self.interface.host
    }

    pub(crate) fn host_cport_id(&self) -> u16 {
        self.host_cport_id
    }

    pub(crate) fn interface_cport_id(&self) -> u16 {
        self.interface_cport_id
    }

    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        read(&self.handler, "connection handler").clone()
    }

    /// Hand an ingress payload to the consumer. Returns false if nobody is
    /// listening.
    pub(crate) fn deliver(&self, payload: Bytes) -> bool {
        match self.handler() {
            Some(handler) => {
                handler.on_receive(payload);
                true
            }
            None => false,
        }
    }

    pub(crate) fn send_complete(&self, status: TransferStatus) {
        if let Some(handler) = self.handler() {
            handler.on_send_complete(status);
        }
    }
}

/// Opaque reference to a live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    conn: Arc<Connection>,
}

impl ConnectionHandle {
    pub fn host(&self) -> HostId {
        self.conn.host()
    }

    pub fn interface(&self) -> InterfaceId {
        self.conn.interface
    }

    pub fn host_cport_id(&self) -> u16 {
        self.conn.host_cport_id
    }

    pub fn interface_cport_id(&self) -> u16 {
        self.conn.interface_cport_id
    }

    pub fn protocol(&self) -> Protocol {
        self.conn.protocol
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is not registered")]
    UnknownHost(HostId),

    #[error("{0} is already registered")]
    HostExists(HostId),

    #[error("{host} still has {connections} connections")]
    HostBusy { host: HostId, connections: usize },

    #[error("{host}: all {limit} CPort ids in use")]
    CPortIdsExhausted { host: HostId, limit: u16 },

    #[error("{host}: CPort id {cport_id} is not allocated")]
    CPortNotAllocated { host: HostId, cport_id: u16 },

    #[error("{host}: CPort id {cport_id} belongs to a live connection")]
    CPortInUse { host: HostId, cport_id: u16 },

    #[error("{host}: connection on CPort {cport_id} has no free operation ids")]
    OperationIdsExhausted { host: HostId, cport_id: u16 },
}

/// Refused destruction. The connection is still registered and its handle is
/// handed back.
#[derive(Debug, thiserror::Error)]
#[error("connection on CPort {} has {pending} pending operations", .handle.host_cport_id())]
pub struct DestroyError {
    pub handle: ConnectionHandle,
    pub pending: usize,
}

#[derive(Debug)]
struct HostState {
    cport_ids: CPortIdMap,
    by_cport: BTreeMap<u16, Arc<Connection>>,
    by_interface: HashMap<InterfaceId, BTreeSet<u16>>,
    /// Set when the host is unregistered; no id is allocated afterwards.
    removed: bool,
}

#[derive(Debug)]
struct HostConnections {
    state: RwLock<HostState>,
}

/// Live connections of every host.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    hosts: DashMap<HostId, Arc<HostConnections>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: HostId) -> Result<(), RegistryError> {
        self.add_host_with_cport_limit(host, DEFAULT_MAX_CPORT_IDS)
    }

    pub fn add_host_with_cport_limit(
        &self,
        host: HostId,
        max_cport_ids: u16,
    ) -> Result<(), RegistryError> {
        match self.hosts.entry(host) {
            Entry::Occupied(_) => Err(RegistryError::HostExists(host)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(HostConnections {
                    state: RwLock::new(HostState {
                        cport_ids: CPortIdMap::new(max_cport_ids),
                        by_cport: BTreeMap::new(),
                        by_interface: HashMap::new(),
                        removed: false,
                    }),
                }));
                tracing::info!(%host, max_cport_ids, "Host registered");
                Ok(())
            }
        }
    }

    /// Remove a host with no live connections.
    ///
    /// The emptiness check and the removal happen under the host's write
    /// lock, so a concurrent `create_connection` either lands first and
    /// keeps the host busy or finds the host gone.
    pub fn remove_host(&self, host: HostId) -> Result<(), RegistryError> {
        let mut connections = 0;
        let removed = self.hosts.remove_if(&host, |_, entry| {
            let mut state = write(&entry.state, "host connections");
            connections = state.by_cport.len();
            state.removed = connections == 0;
            state.removed
        });
        match removed {
            Some(_) => {
                tracing::info!(%host, "Host removed");
                Ok(())
            }
            None if connections != 0 => Err(RegistryError::HostBusy { host, connections }),
            None => Err(RegistryError::UnknownHost(host)),
        }
    }

    fn host(&self, host: HostId) -> Result<Arc<HostConnections>, RegistryError> {
        self.hosts
            .get(&host)
            .map(|h| Arc::clone(h.value()))
            .ok_or(RegistryError::UnknownHost(host))
    }

    /// Reserve the lowest free CPort id on `host`.
    pub fn allocate_cport_id(&self, host: HostId) -> Result<u16, RegistryError> {
        let entry = self.host(host)?;
        let mut state = write(&entry.state, "host connections");
        allocate(&mut state, host)
    }

    /// Release an id reserved with [`allocate_cport_id`](Self::allocate_cport_id).
    ///
    /// Freeing an id that is not allocated is a defect.
    pub fn free_cport_id(&self, host: HostId, cport_id: u16) -> Result<(), RegistryError> {
        let entry = self.host(host)?;
        let mut state = write(&entry.state, "host connections");

        if state.by_cport.contains_key(&cport_id) {
            tracing::error!(%host, cport_id, "Refusing to free CPort id of a live connection");
            debug_assert!(false, "CPort id {cport_id} freed while connected");
            return Err(RegistryError::CPortInUse { host, cport_id });
        }
        if !state.cport_ids.free(cport_id) {
            tracing::error!(%host, cport_id, "Double free of CPort id");
            debug_assert!(false, "CPort id {cport_id} freed twice");
            return Err(RegistryError::CPortNotAllocated { host, cport_id });
        }
        Ok(())
    }

    /// Create a connection to `interface_cport_id` on `interface`.
    ///
    /// The host-side id is the lowest free one on the interface's host.
    pub fn create_connection(
        &self,
        interface: InterfaceId,
        interface_cport_id: u16,
        protocol: Protocol,
    ) -> Result<ConnectionHandle, RegistryError> {
        let host = interface.host;
        let entry = self.host(host)?;
        let mut state = write(&entry.state, "host connections");

        let host_cport_id = allocate(&mut state, host)?;
        let conn = Arc::new(Connection {
            interface,
            host_cport_id,
            interface_cport_id,
            protocol,
            operations: Mutex::new(OperationTracker::default()),
            handler: RwLock::new(None),
        });
        state.by_cport.insert(host_cport_id, Arc::clone(&conn));
        state
            .by_interface
            .entry(interface)
            .or_default()
            .insert(host_cport_id);
        drop(state);

        tracing::debug!(
            %interface,
            host_cport_id,
            interface_cport_id,
            ?protocol,
            "Connection created"
        );
        Ok(ConnectionHandle { conn })
    }

    /// Destroy a connection with no pending operations.
    ///
    /// Destroying a connection that still has pending operations is a defect:
    /// nothing is changed and the handle is returned in the error.
    pub fn destroy_connection(&self, handle: ConnectionHandle) -> Result<(), DestroyError> {
        let conn = handle.connection();
        let host = conn.host();
        let cport_id = conn.host_cport_id;

        let pending = lock(&conn.operations, "operations").pending_count();
        if pending != 0 {
            tracing::error!(%host, cport_id, pending, "Destroying connection with pending operations");
            debug_assert!(false, "connection destroyed with {pending} pending operations");
            return Err(DestroyError { handle, pending });
        }

        // A handle outlives neither its host nor its table entry, so a miss
        // below means registry state was corrupted elsewhere.
        let Ok(entry) = self.host(host) else {
            tracing::error!(%host, cport_id, "Destroying connection on unknown host");
            return Ok(());
        };
        let mut state = write(&entry.state, "host connections");

        let registered = state
            .by_cport
            .get(&cport_id)
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if !registered {
            tracing::error!(%host, cport_id, "Connection is not registered on its host");
            debug_assert!(false, "stale handle for CPort id {cport_id}");
            return Ok(());
        }
        state.by_cport.remove(&cport_id);
        if let Some(ids) = state.by_interface.get_mut(&conn.interface) {
            ids.remove(&cport_id);
            if ids.is_empty() {
                state.by_interface.remove(&conn.interface);
            }
        }
        if !state.cport_ids.free(cport_id) {
            tracing::error!(%host, cport_id, "Connection CPort id was not allocated");
            debug_assert!(false, "CPort id {cport_id} freed twice");
        }
        drop(state);

        // In-flight completions may still hold the connection.
        write(&conn.handler, "connection handler").take();
        tracing::debug!(%host, cport_id, "Connection destroyed");
        Ok(())
    }

    /// Connection owning host-side `cport_id`.
    pub(crate) fn lookup(&self, host: HostId, cport_id: u16) -> Option<Arc<Connection>> {
        let entry = self.hosts.get(&host).map(|h| Arc::clone(h.value()))?;
        let state = read(&entry.state, "host connections");
        state.by_cport.get(&cport_id).cloned()
    }

    /// Host-side CPort ids of every connection on `interface`, ascending.
    pub fn connections_for_interface(&self, interface: InterfaceId) -> Vec<u16> {
        let Ok(entry) = self.host(interface.host) else {
            return Vec::new();
        };
        let state = read(&entry.state, "host connections");
        state
            .by_interface
            .get(&interface)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, host: HostId) -> Result<usize, RegistryError> {
        let entry = self.host(host)?;
        let state = read(&entry.state, "host connections");
        Ok(state.by_cport.len())
    }

    /// Register the consumer for a connection's traffic, replacing any
    /// previous one.
    pub fn set_handler(&self, handle: &ConnectionHandle, handler: Arc<dyn ConnectionHandler>) {
        *write(&handle.conn.handler, "connection handler") = Some(handler);
    }

    pub fn clear_handler(&self, handle: &ConnectionHandle) {
        write(&handle.conn.handler, "connection handler").take();
    }

    /// Next operation id for the connection, without reserving it.
    pub fn next_operation_id(&self, handle: &ConnectionHandle) -> Result<u16, RegistryError> {
        lock(&handle.conn.operations, "operations")
            .next_id()
            .ok_or_else(|| operation_ids_exhausted(handle))
    }

    /// Allocate an operation id and mark it pending.
    pub fn begin_operation(&self, handle: &ConnectionHandle) -> Result<u16, RegistryError> {
        lock(&handle.conn.operations, "operations")
            .begin()
            .ok_or_else(|| operation_ids_exhausted(handle))
    }

    /// Mark an operation finished. Returns false if it was not pending.
    pub fn complete_operation(&self, handle: &ConnectionHandle, id: u16) -> bool {
        lock(&handle.conn.operations, "operations").complete(id)
    }

    pub fn pending_operations(&self, handle: &ConnectionHandle) -> Vec<u16> {
        lock(&handle.conn.operations, "operations").pending()
    }
}

fn allocate(state: &mut HostState, host: HostId) -> Result<u16, RegistryError> {
    if state.removed {
        return Err(RegistryError::UnknownHost(host));
    }
    state.cport_ids.allocate().ok_or_else(|| {
        let limit = state.cport_ids.limit();
        tracing::warn!(%host, limit, "CPort ids exhausted");
        RegistryError::CPortIdsExhausted { host, limit }
    })
}

fn operation_ids_exhausted(handle: &ConnectionHandle) -> RegistryError {
    RegistryError::OperationIdsExhausted {
        host: handle.host(),
        cport_id: handle.host_cport_id(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: HostId = HostId(1);

    fn registry() -> ConnectionRegistry {
        let registry = ConnectionRegistry::new();
        registry.add_host(HOST).unwrap();
        registry
    }

    fn iface(interface_id: u8) -> InterfaceId {
        InterfaceId::new(HOST, 1, interface_id)
    }

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<Bytes>>,
    }

    impl ConnectionHandler for Recorder {
        fn on_receive(&self, payload: Bytes) {
            self.received.lock().unwrap().push(payload);
        }
    }

    #[test]
    fn first_cport_id_is_zero() {
        let registry = registry();
        assert_eq!(registry.allocate_cport_id(HOST), Ok(0));
        assert_eq!(registry.allocate_cport_id(HOST), Ok(1));
    }

    #[test]
    fn lowest_free_id_is_reused() {
        let registry = registry();
        let a = registry.create_connection(iface(0), 1, Protocol::Gpio).unwrap();
        let b = registry.create_connection(iface(0), 2, Protocol::Gpio).unwrap();
        let c = registry.create_connection(iface(0), 3, Protocol::Gpio).unwrap();
        assert_eq!(
            [a.host_cport_id(), b.host_cport_id(), c.host_cport_id()],
            [0, 1, 2]
        );

        registry.destroy_connection(b).unwrap();
        let d = registry.create_connection(iface(1), 4, Protocol::I2c).unwrap();
        assert_eq!(d.host_cport_id(), 1);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let registry = ConnectionRegistry::new();
        registry.add_host_with_cport_limit(HOST, 2).unwrap();
        let _a = registry.create_connection(iface(0), 1, Protocol::Uart).unwrap();
        let _b = registry.create_connection(iface(0), 2, Protocol::Uart).unwrap();
        let err = registry
            .create_connection(iface(0), 3, Protocol::Uart)
            .unwrap_err();
        assert_eq!(err, RegistryError::CPortIdsExhausted { host: HOST, limit: 2 });
    }

    #[test]
    fn unknown_host() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.allocate_cport_id(HOST),
            Err(RegistryError::UnknownHost(HOST))
        );
        registry.add_host(HOST).unwrap();
        assert_eq!(registry.add_host(HOST), Err(RegistryError::HostExists(HOST)));
    }

    #[test]
    fn indexed_by_interface() {
        let registry = registry();
        let a = registry.create_connection(iface(0), 1, Protocol::Gpio).unwrap();
        let b = registry.create_connection(iface(1), 1, Protocol::Gpio).unwrap();
        let c = registry.create_connection(iface(0), 2, Protocol::I2c).unwrap();

        assert_eq!(registry.connections_for_interface(iface(0)), vec![0, 2]);
        assert_eq!(registry.connections_for_interface(iface(1)), vec![1]);
        assert_eq!(registry.connection_count(HOST), Ok(3));

        registry.destroy_connection(a).unwrap();
        registry.destroy_connection(c).unwrap();
        assert!(registry.connections_for_interface(iface(0)).is_empty());
        assert_eq!(
            registry.remove_host(HOST),
            Err(RegistryError::HostBusy {
                host: HOST,
                connections: 1
            })
        );
        registry.destroy_connection(b).unwrap();
        registry.remove_host(HOST).unwrap();
    }

    #[test]
    fn lookup_and_deliver() {
        let registry = registry();
        let conn = registry.create_connection(iface(0), 5, Protocol::Gpio).unwrap();
        let recorder = Arc::new(Recorder::default());

        let found = registry.lookup(HOST, conn.host_cport_id()).unwrap();
        assert!(!found.deliver(Bytes::from_static(b"early")));

        registry.set_handler(&conn, recorder.clone());
        assert!(found.deliver(Bytes::from_static(b"hello")));
        assert_eq!(recorder.received.lock().unwrap().as_slice(), [Bytes::from_static(b"hello")]);

        registry.destroy_connection(conn).unwrap();
        assert!(registry.lookup(HOST, 0).is_none());
        // Destruction detaches the consumer from anyone still holding the connection.
        assert!(!found.deliver(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn channel_handler_forwards_events() {
        let registry = registry();
        let conn = registry.create_connection(iface(0), 5, Protocol::Gpio).unwrap();
        let (handler, mut rx) = connection_channel();
        registry.set_handler(&conn, handler);

        let found = registry.lookup(HOST, 0).unwrap();
        found.deliver(Bytes::from_static(&[1, 2]));
        found.send_complete(TransferStatus::Completed);

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Received(Bytes::from_static(&[1, 2])))
        );
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::SendComplete(TransferStatus::Completed))
        );
    }

    #[test]
    fn operation_ids_per_connection() {
        let registry = registry();
        let a = registry.create_connection(iface(0), 1, Protocol::Gpio).unwrap();
        let b = registry.create_connection(iface(0), 2, Protocol::Gpio).unwrap();

        assert_eq!(registry.next_operation_id(&a), Ok(0));
        assert_eq!(registry.next_operation_id(&a), Ok(1));
        assert_eq!(registry.next_operation_id(&b), Ok(0));

        let op = registry.begin_operation(&b).unwrap();
        assert_eq!(op, 1);
        assert_eq!(registry.pending_operations(&b), vec![1]);
        assert!(registry.complete_operation(&b, op));
        assert!(!registry.complete_operation(&b, op));
        assert!(registry.pending_operations(&b).is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "pending operations")]
    fn destroy_with_pending_operations_is_a_defect() {
        let registry = registry();
        let conn = registry.create_connection(iface(0), 1, Protocol::Gpio).unwrap();
        registry.begin_operation(&conn).unwrap();
        let _ = registry.destroy_connection(conn);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn destroy_with_pending_operations_is_refused() {
        let registry = registry();
        let conn = registry.create_connection(iface(0), 1, Protocol::Gpio).unwrap();
        let op = registry.begin_operation(&conn).unwrap();

        let err = registry.destroy_connection(conn).unwrap_err();
        assert_eq!(err.pending, 1);
        assert!(registry.lookup(HOST, 0).is_some());

        assert!(registry.complete_operation(&err.handle, op));
        registry.destroy_connection(err.handle).unwrap();
        assert!(registry.lookup(HOST, 0).is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_a_defect() {
        let registry = registry();
        let id = registry.allocate_cport_id(HOST).unwrap();
        registry.free_cport_id(HOST, id).unwrap();
        let _ = registry.free_cport_id(HOST, id);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_free_is_refused() {
        let registry = registry();
        let id = registry.allocate_cport_id(HOST).unwrap();
        registry.free_cport_id(HOST, id).unwrap();
        assert_eq!(
            registry.free_cport_id(HOST, id),
            Err(RegistryError::CPortNotAllocated { host: HOST, cport_id: id })
        );
        assert_eq!(registry.allocate_cport_id(HOST), Ok(0));
    }

    #[test]
    fn concurrent_creation_assigns_unique_ids() {
        let registry = Arc::new(registry());
        let threads: Vec<_> = (0..8u8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..8u16)
                        .map(|i| {
                            registry
                                .create_connection(iface(t), i, Protocol::Gpio)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u16> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .map(|handle| handle.host_cport_id())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..64).collect::<Vec<u16>>());
    }

    #[test]
    fn removed_host_refuses_late_allocations() {
        let registry = registry();
        // A create_connection that looked the host up just before removal.
        let stale = registry.host(HOST).unwrap();
        registry.remove_host(HOST).unwrap();
        registry.add_host(HOST).unwrap();

        let mut state = write(&stale.state, "host connections");
        assert_eq!(
            allocate(&mut state, HOST),
            Err(RegistryError::UnknownHost(HOST))
        );
        drop(state);
        assert_eq!(registry.connection_count(HOST), Ok(0));
        assert_eq!(
            registry.remove_host(HostId(99)),
            Err(RegistryError::UnknownHost(HostId(99)))
        );
    }

    #[test]
    fn host_churn_keeps_connections_distinct() {
        let registry = Arc::new(registry());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let churn = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    if registry.remove_host(HOST).is_ok() {
                        registry.add_host(HOST).unwrap();
                    }
                }
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let Ok(conn) = registry.create_connection(iface(0), 1, Protocol::Gpio)
                        else {
                            continue;
                        };
                        let cport_id = conn.host_cport_id();
                        let found = registry.lookup(HOST, cport_id).unwrap();
                        assert!(Arc::ptr_eq(&found, conn.connection()));
                        registry.destroy_connection(conn).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        churn.join().unwrap();
        assert_eq!(registry.connection_count(HOST), Ok(0));
    }
}
