//! USB-shaped transport bridge.
//!
//! A bridge multiplexes every connection of one host onto a single physical
//! channel:
//! - egress payloads are prefixed with the interface CPort id byte and written
//!   to bulk out from a bounded pool of transfer buffers
//! - a fixed set of bulk-in buffers stays posted; each completion is demuxed by
//!   its leading CPort id byte and delivered to the owning connection
//! - supervisory messages arrive on the interrupt endpoint and leave as
//!   control transfers
//!
//! Completions are handled on tokio tasks owned by the bridge. [`Bridge::shutdown`]
//! cancels them, waits for every one to finish and retires all buffers.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod host;
pub mod loopback;
pub mod pool;
pub mod status;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::FuturesOrdered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::{ConnectionHandle, ConnectionRegistry, HostId};
use crate::svc::SvcHandler;
use codec::{CPortCodec, OutboundFrame};
use endpoint::{EndpointError, EndpointSet};
use host::{Completion, ControlSetup, HostError, TransferFuture, UsbHost};
use pool::{PoolStats, TransferLease, TransferPool};

pub use config::BridgeConfig;
pub use status::{StatusClass, TransferStatus};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bridge must be started inside a tokio runtime")]
    NoRuntime,

    #[error("endpoint discovery failed: {0}")]
    Endpoints(#[from] EndpointError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("bridge is shut down")]
    Shutdown,

    #[error("connection belongs to {actual}, bridge serves {expected}")]
    ForeignConnection { expected: HostId, actual: HostId },

    #[error("interface CPort id {0} does not fit the one-byte frame prefix")]
    CPortOutOfRange(u16),

    #[error("framing failed: {0}")]
    Codec(#[from] io::Error),

    #[error("SVC send timed out after {0:?}")]
    SvcTimeout(Duration),

    #[error("SVC send wrote {written} of {expected} bytes")]
    SvcShortWrite { written: usize, expected: usize },

    #[error("SVC send failed: {0}")]
    SvcFailed(TransferStatus),
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    dropped_in: AtomicU64,
    svc_in: AtomicU64,
}

/// Traffic and buffer occupancy of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub egress: PoolStats,
    pub ingress: PoolStats,
    /// Ingress frames delivered to a connection.
    pub frames_in: u64,
    /// Egress frames handed to the host.
    pub frames_out: u64,
    /// Ingress transfers discarded (no id byte, unknown CPort, no consumer).
    pub dropped_in: u64,
    pub svc_in: u64,
}

pub struct Bridge {
    host: Arc<dyn UsbHost>,
    host_id: HostId,
    endpoints: EndpointSet,
    svc_timeout: Duration,
    egress: Arc<TransferPool>,
    ingress: Arc<TransferPool>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

type PostedIngress = TransferFuture<(TransferLease, Completion)>;

impl Bridge {
    /// Discover endpoints, post the ingress and SVC buffers and start the
    /// completion tasks on the current runtime.
    pub fn start(
        host: Arc<dyn UsbHost>,
        registry: Arc<ConnectionRegistry>,
        host_id: HostId,
        svc: Arc<dyn SvcHandler>,
        config: BridgeConfig,
    ) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let endpoints = EndpointSet::discover(&host.endpoints())?;

        let egress = TransferPool::new("egress", config.egress_slots, config.ingress_buffer_size);
        let ingress = TransferPool::new(
            "ingress",
            config.ingress_buffers,
            config.ingress_buffer_size,
        );

        let mut posted = FuturesOrdered::new();
        for _ in 0..config.ingress_buffers {
            let Some(lease) = ingress.try_lease() else {
                break;
            };
            posted.push_back(post_ingress(
                host.as_ref(),
                endpoints.cport_in,
                lease,
                config.ingress_buffer_size,
            )?);
        }

        let svc_buffer = BytesMut::with_capacity(config.svc_buffer_size);
        let svc_transfer = host.submit_interrupt_in(endpoints.svc_in, svc_buffer)?;

        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ingress_task = IngressTask {
            host: Arc::clone(&host),
            registry,
            host_id,
            endpoint: endpoints.cport_in,
            buffer_size: config.ingress_buffer_size,
            counters: Arc::clone(&counters),
        };
        tracker.spawn_on(ingress_task.run(posted, cancel.clone()), &runtime);

        let svc_task = SvcTask {
            host: Arc::clone(&host),
            handler: svc,
            endpoint: endpoints.svc_in,
            counters: Arc::clone(&counters),
        };
        tracker.spawn_on(svc_task.run(svc_transfer, cancel.clone()), &runtime);

        tracing::info!(
            %host_id,
            egress_slots = config.egress_slots,
            ingress_buffers = config.ingress_buffers,
            "Bridge started"
        );

        Ok(Self {
            host,
            host_id,
            endpoints,
            svc_timeout: config.svc_timeout,
            egress,
            ingress,
            counters,
            cancel,
            tracker,
            runtime,
        })
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn endpoints(&self) -> EndpointSet {
        self.endpoints
    }

    /// Queue `payload` for the connection's interface CPort.
    ///
    /// Returns once the transfer is handed to the host. Its outcome is
    /// reported to the connection's handler, not to the caller. Pool
    /// exhaustion never fails or blocks a submit.
    pub fn submit(&self, conn: &ConnectionHandle, payload: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        if conn.host() != self.host_id {
            return Err(TransportError::ForeignConnection {
                expected: self.host_id,
                actual: conn.host(),
            });
        }
        let interface_cport_id = conn.interface_cport_id();
        let cport_id = u8::try_from(interface_cport_id)
            .map_err(|_| TransportError::CPortOutOfRange(interface_cport_id))?;

        let mut lease = self.egress.lease();
        CPortCodec.encode(OutboundFrame { cport_id, payload }, lease.buffer_mut())?;
        let transfer = self
            .host
            .submit_bulk_out(self.endpoints.cport_out, lease.take_buffer())
            .inspect_err(|error| {
                tracing::warn!(cport_id, %error, "Egress submit failed");
            })?;
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cport_id, len = payload.len(), slot = ?lease.slot(), "Egress submitted");

        let connection = Arc::clone(conn.connection());
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                let (status, buffer) = tokio::select! {
                    biased;
                    completion = transfer => completion,
                    _ = cancel.cancelled() => (TransferStatus::Cancelled, BytesMut::new()),
                };
                lease.set_completing();
                if !status.is_ok() {
                    tracing::debug!(cport_id, %status, "Egress transfer failed");
                }
                connection.send_complete(status);
                if status != TransferStatus::Cancelled {
                    lease.restore(buffer);
                }
            },
            &self.runtime,
        );
        Ok(())
    }

    /// Send a supervisory message on the control endpoint, waiting at most
    /// the configured SVC timeout. Anything short of a full write is an error.
    pub async fn send_svc(&self, message: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        let expected = message.len();
        let transfer = self
            .host
            .control_out(ControlSetup::svc(), Bytes::copy_from_slice(message));

        match tokio::time::timeout(self.svc_timeout, transfer).await {
            Err(_) => {
                tracing::warn!(timeout = ?self.svc_timeout, "SVC send timed out");
                Err(TransportError::SvcTimeout(self.svc_timeout))
            }
            Ok(Err(status)) => {
                tracing::warn!(%status, "SVC send failed");
                Err(TransportError::SvcFailed(status))
            }
            Ok(Ok(written)) if written == expected => Ok(()),
            Ok(Ok(written)) => {
                tracing::warn!(written, expected, "SVC send incomplete");
                Err(TransportError::SvcShortWrite { written, expected })
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            egress: self.egress.stats(),
            ingress: self.ingress.stats(),
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            dropped_in: self.counters.dropped_in.load(Ordering::Relaxed),
            svc_in: self.counters.svc_in.load(Ordering::Relaxed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Kill every transfer and wait for all completions to drain.
    ///
    /// In-flight egress transfers are reported to their connections as
    /// [`TransferStatus::Cancelled`]. Every pool slot ends up killed.
    pub async fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(host_id = %self.host_id, "Shutting down bridge");
        }
        self.cancel.cancel();
        self.egress.kill();
        self.ingress.kill();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(host_id = %self.host_id, "Bridge drained");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn post_ingress(
    host: &dyn UsbHost,
    endpoint: u8,
    mut lease: TransferLease,
    buffer_size: usize,
) -> Result<PostedIngress, HostError> {
    let mut buffer = lease.take_buffer();
    buffer.clear();
    buffer.reserve(buffer_size);
    let transfer = host.submit_bulk_in(endpoint, buffer)?;
    Ok(async move { (lease, transfer.await) }.boxed())
}

struct IngressTask {
    host: Arc<dyn UsbHost>,
    registry: Arc<ConnectionRegistry>,
    host_id: HostId,
    endpoint: u8,
    buffer_size: usize,
    counters: Arc<Counters>,
}

impl IngressTask {
    /// Completions are taken in posting order, which is the order the host
    /// fills the buffers in.
    async fn run(self, mut posted: FuturesOrdered<PostedIngress>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = posted.next() => next,
            };
            let Some((mut lease, (status, mut buffer))) = next else {
                tracing::error!(host_id = %self.host_id, "No ingress buffers left posted");
                break;
            };

            match status.class() {
                StatusClass::Ok => self.dispatch(&mut buffer),
                StatusClass::Transient => {
                    tracing::debug!(%status, "Ingress transfer dropped");
                    self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
                }
                StatusClass::Terminal => {
                    tracing::error!(
                        host_id = %self.host_id,
                        %status,
                        "Ingress transfer failed, not resubmitting"
                    );
                    continue;
                }
            }

            lease.restore(buffer);
            match post_ingress(self.host.as_ref(), self.endpoint, lease, self.buffer_size) {
                Ok(transfer) => posted.push_back(transfer),
                Err(error) => {
                    tracing::error!(
                        host_id = %self.host_id,
                        %error,
                        "Failed to resubmit ingress buffer"
                    );
                }
            }
        }
        // Dropping the remaining transfers kills them; their leases retire
        // with the pool.
        drop(posted);
    }

    fn dispatch(&self, buffer: &mut BytesMut) {
        let frame = match CPortCodec.decode(buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::warn!(host_id = %self.host_id, "Ingress transfer without CPort id");
                self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(error) => {
                tracing::warn!(host_id = %self.host_id, %error, "Undecodable ingress transfer");
                self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let cport_id = u16::from(frame.cport_id);
        let Some(connection) = self.registry.lookup(self.host_id, cport_id) else {
            tracing::warn!(host_id = %self.host_id, cport_id, "Ingress for unknown CPort");
            self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
            return;
        };
        tracing::trace!(cport_id, len = frame.payload.len(), "Ingress frame");
        if connection.deliver(frame.payload) {
            self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(host_id = %self.host_id, cport_id, "No consumer for ingress CPort");
            self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct SvcTask {
    host: Arc<dyn UsbHost>,
    handler: Arc<dyn SvcHandler>,
    endpoint: u8,
    counters: Arc<Counters>,
}

impl SvcTask {
    async fn run(self, mut transfer: TransferFuture<Completion>, cancel: CancellationToken) {
        loop {
            let (status, mut buffer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                completion = &mut transfer => completion,
            };

            match status.class() {
                StatusClass::Ok if buffer.is_empty() => {
                    tracing::debug!("Empty SVC transfer");
                }
                StatusClass::Ok => {
                    self.counters.svc_in.fetch_add(1, Ordering::Relaxed);
                    self.handler.on_svc_message(Bytes::copy_from_slice(&buffer));
                }
                StatusClass::Transient => tracing::debug!(%status, "SVC transfer dropped"),
                StatusClass::Terminal => {
                    tracing::error!(%status, "SVC transfer failed, not resubmitting");
                    break;
                }
            }

            buffer.clear();
            transfer = match self.host.submit_interrupt_in(self.endpoint, buffer) {
                Ok(transfer) => transfer,
                Err(error) => {
                    tracing::error!(%error, "Failed to resubmit SVC buffer");
                    break;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, InterfaceId, connection_channel};
    use crate::protocol::Protocol;
    use crate::svc::{SvcBody, SvcMessage, SvcQueue};
    use loopback::{ControlBehavior, LoopbackHost};
    use tokio::sync::mpsc::UnboundedReceiver;

    const HOST: HostId = HostId(7);

    struct Fixture {
        host: Arc<LoopbackHost>,
        registry: Arc<ConnectionRegistry>,
        bridge: Bridge,
        svc_rx: crate::svc::SvcReceiver,
    }

    async fn fixture(config: BridgeConfig) -> Fixture {
        let host = Arc::new(LoopbackHost::new());
        let registry = Arc::new(ConnectionRegistry::new());
        registry.add_host(HOST).unwrap();
        let (svc, svc_rx) = SvcQueue::new();
        let ingress_buffers = config.ingress_buffers;
        let bridge = Bridge::start(host.clone(), registry.clone(), HOST, svc, config).unwrap();
        host.wait_for_posted_bulk_in(ingress_buffers).await;
        Fixture {
            host,
            registry,
            bridge,
            svc_rx,
        }
    }

    /// Creates connections until one with host-side id `cport_id` exists.
    fn connect(
        registry: &ConnectionRegistry,
        cport_id: u16,
    ) -> (
        Vec<ConnectionHandle>,
        ConnectionHandle,
        UnboundedReceiver<ConnectionEvent>,
    ) {
        let interface = InterfaceId::new(HOST, 1, 0);
        let mut others = Vec::new();
        loop {
            let handle = registry
                .create_connection(interface, cport_id, Protocol::Gpio)
                .unwrap();
            if handle.host_cport_id() == cport_id {
                let (handler, rx) = connection_channel();
                registry.set_handler(&handle, handler);
                return (others, handle, rx);
            }
            others.push(handle);
        }
    }

    /// Yields to the bridge tasks until `ready` holds.
    async fn wait_until(ready: impl Fn() -> bool) {
        let settled = async {
            while !ready() {
                tokio::task::yield_now().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), settled)
            .await
            .expect("bridge did not settle");
    }

    #[tokio::test]
    async fn start_requires_endpoints() {
        let host = Arc::new(LoopbackHost::with_endpoints(vec![]));
        let registry = Arc::new(ConnectionRegistry::new());
        let (svc, _rx) = SvcQueue::new();
        let result = Bridge::start(host, registry, HOST, svc, BridgeConfig::new());
        assert!(matches!(
            result,
            Err(TransportError::Endpoints(EndpointError::MissingInterruptIn))
        ));
    }

    #[test]
    fn start_requires_runtime() {
        let host = Arc::new(LoopbackHost::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (svc, _rx) = SvcQueue::new();
        let result = Bridge::start(host, registry, HOST, svc, BridgeConfig::new());
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    async fn posts_ingress_and_svc_buffers() {
        let f = fixture(BridgeConfig::new()).await;
        f.host.wait_for_posted_svc().await;
        assert_eq!(f.host.posted_bulk_in(), 4);
        assert_eq!(f.host.posted_svc_in(), 1);
        assert_eq!(f.bridge.stats().ingress.leased, 4);
    }

    #[tokio::test]
    async fn egress_prefixes_interface_cport_id() {
        let f = fixture(BridgeConfig::new()).await;
        let (_others, conn, mut rx) = connect(&f.registry, 5);

        f.bridge.submit(&conn, &[0xAA, 0xBB]).unwrap();

        let frames = f.host.wait_for_bulk_out(1).await;
        assert_eq!(&frames[0][..], &[0x05, 0xAA, 0xBB]);
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::SendComplete(TransferStatus::Completed))
        );
        assert_eq!(f.bridge.stats().frames_out, 1);
    }

    #[tokio::test]
    async fn egress_failure_reported_to_connection() {
        let f = fixture(BridgeConfig::new()).await;
        let (_others, conn, mut rx) = connect(&f.registry, 0);
        f.host.set_bulk_out_status(TransferStatus::Protocol);

        f.bridge.submit(&conn, b"x").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::SendComplete(TransferStatus::Protocol))
        );
    }

    #[tokio::test]
    async fn ingress_routes_by_cport_id() {
        let f = fixture(BridgeConfig::new()).await;
        let (_others, _conn, mut rx) = connect(&f.registry, 5);

        f.host
            .inject_bulk_in(TransferStatus::Completed, &[0x05, 0xAA, 0xBB]);

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Received(Bytes::from_static(&[0xAA, 0xBB])))
        );
    }

    #[tokio::test]
    async fn ingress_preserves_order_and_keeps_buffers_posted() {
        let f = fixture(BridgeConfig::new().with_ingress_buffers(2)).await;
        let (_others, _conn, mut rx) = connect(&f.registry, 0);

        for i in 0..10u8 {
            f.host.inject_bulk_in(TransferStatus::Completed, &[0x00, i]);
        }
        for i in 0..10u8 {
            assert_eq!(
                rx.recv().await,
                Some(ConnectionEvent::Received(Bytes::copy_from_slice(&[i])))
            );
        }
        f.host.wait_for_posted_bulk_in(2).await;
        assert_eq!(f.bridge.stats().frames_in, 10);
    }

    #[tokio::test]
    async fn bad_ingress_is_dropped_without_teardown() {
        let f = fixture(BridgeConfig::new()).await;
        let (_others, _conn, mut rx) = connect(&f.registry, 1);

        // Zero-length, unknown CPort and a transient error, then a good frame.
        f.host.inject_bulk_in(TransferStatus::Completed, &[]);
        f.host.inject_bulk_in(TransferStatus::Completed, &[0x40, 1]);
        f.host.inject_bulk_in(TransferStatus::Other(-71), &[0x01, 2]);
        f.host.inject_bulk_in(TransferStatus::Completed, &[0x01, 3]);

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Received(Bytes::from_static(&[3])))
        );
        assert_eq!(f.bridge.stats().dropped_in, 3);
        f.host.wait_for_posted_bulk_in(4).await;
    }

    #[tokio::test]
    async fn terminal_status_stops_resubmission() {
        let f = fixture(BridgeConfig::new().with_ingress_buffers(2)).await;
        f.host.inject_bulk_in(TransferStatus::Shutdown, &[]);

        wait_until(|| f.bridge.stats().ingress.leased == 1).await;
        assert!(!f.bridge.is_shut_down());
        assert_eq!(f.host.posted_bulk_in(), 1);
        let stats = f.bridge.stats().ingress;
        assert_eq!((stats.free, stats.killed), (1, 0));

        f.host.inject_bulk_in(TransferStatus::Reset, &[]);
        wait_until(|| f.bridge.stats().ingress.leased == 0).await;
        assert_eq!(f.host.posted_bulk_in(), 0);

        f.bridge.shutdown().await;
    }

    #[tokio::test]
    async fn egress_and_ingress_use_different_cport_ids() {
        let f = fixture(BridgeConfig::new()).await;
        let conn = f
            .registry
            .create_connection(InterfaceId::new(HOST, 1, 0), 5, Protocol::Gpio)
            .unwrap();
        assert_eq!((conn.host_cport_id(), conn.interface_cport_id()), (0, 5));
        let (handler, mut rx) = connection_channel();
        f.registry.set_handler(&conn, handler);

        f.bridge.submit(&conn, &[0xAA, 0xBB]).unwrap();
        let frames = f.host.wait_for_bulk_out(1).await;
        assert_eq!(&frames[0][..], &[0x05, 0xAA, 0xBB]);
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::SendComplete(TransferStatus::Completed))
        );

        f.host.inject_bulk_in(TransferStatus::Completed, &[0x05, 0xAA]);
        f.host.inject_bulk_in(TransferStatus::Completed, &[0x00, 0xCC]);
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Received(Bytes::from_static(&[0xCC])))
        );
        let stats = f.bridge.stats();
        assert_eq!((stats.frames_in, stats.dropped_in), (1, 1));
    }

    #[tokio::test]
    async fn svc_messages_reach_supervisor() {
        let mut f = fixture(BridgeConfig::new()).await;
        let message = SvcMessage::new(SvcBody::Hotplug { device_id: 4 })
            .encode()
            .unwrap();

        f.host.inject_svc(TransferStatus::Completed, &message);
        f.host.inject_svc(TransferStatus::Completed, &message);

        assert_eq!(f.svc_rx.recv().await, Some(message.clone()));
        assert_eq!(f.svc_rx.recv().await, Some(message));
        f.host.wait_for_posted_svc().await;
    }

    #[tokio::test]
    async fn send_svc_uses_control_endpoint() {
        let f = fixture(BridgeConfig::new()).await;
        f.bridge.send_svc(&[1, 2, 3]).await.unwrap();
        assert_eq!(
            f.host.control_out_messages(),
            vec![Bytes::from_static(&[1, 2, 3])]
        );

        f.host.set_control_behavior(ControlBehavior::Short(2));
        assert!(matches!(
            f.bridge.send_svc(&[1, 2, 3]).await,
            Err(TransportError::SvcShortWrite {
                written: 2,
                expected: 3
            })
        ));

        f.host
            .set_control_behavior(ControlBehavior::Fail(TransferStatus::Protocol));
        assert!(matches!(
            f.bridge.send_svc(&[1]).await,
            Err(TransportError::SvcFailed(TransferStatus::Protocol))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_svc_times_out() {
        let f = fixture(BridgeConfig::new().with_svc_timeout(Duration::from_millis(500))).await;
        f.host.set_control_behavior(ControlBehavior::Hang);
        let err = f.bridge.send_svc(&[1]).await.unwrap_err();
        assert!(matches!(err, TransportError::SvcTimeout(d) if d == Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn submit_validates_connection() {
        let f = fixture(BridgeConfig::new()).await;

        let other = HostId(8);
        f.registry.add_host(other).unwrap();
        let foreign = f
            .registry
            .create_connection(InterfaceId::new(other, 1, 0), 1, Protocol::Gpio)
            .unwrap();
        assert!(matches!(
            f.bridge.submit(&foreign, b"x"),
            Err(TransportError::ForeignConnection { .. })
        ));

        let wide = f
            .registry
            .create_connection(InterfaceId::new(HOST, 1, 0), 300, Protocol::Gpio)
            .unwrap();
        assert!(matches!(
            f.bridge.submit(&wide, b"x"),
            Err(TransportError::CPortOutOfRange(300))
        ));
        assert!(f.host.bulk_out().is_empty());
    }

    #[tokio::test]
    async fn egress_exhaustion_falls_back() {
        let f = fixture(BridgeConfig::new().with_egress_slots(2)).await;
        let (_others, conn, mut rx) = connect(&f.registry, 0);
        f.host.hold_bulk_out();

        for i in 0..3u8 {
            f.bridge.submit(&conn, &[i]).unwrap();
        }
        let stats = f.bridge.stats();
        assert_eq!(stats.egress.leased, 2);
        assert_eq!(stats.egress.fallbacks, 1);

        f.host.release_bulk_out(TransferStatus::Completed);
        for _ in 0..3 {
            assert_eq!(
                rx.recv().await,
                Some(ConnectionEvent::SendComplete(TransferStatus::Completed))
            );
        }
        f.bridge.shutdown().await;
        assert_eq!(f.bridge.stats().egress.killed, 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_and_kills_slots() {
        let f = fixture(BridgeConfig::new()).await;
        let (_others, conn, mut rx) = connect(&f.registry, 0);
        f.host.hold_bulk_out();
        f.bridge.submit(&conn, b"pending").unwrap();

        f.bridge.shutdown().await;

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::SendComplete(TransferStatus::Cancelled))
        );
        let stats = f.bridge.stats();
        assert_eq!(stats.egress.killed, 8);
        assert_eq!(stats.ingress.killed, 4);
        assert_eq!(f.host.posted_bulk_in(), 0);
        assert!(matches!(
            f.bridge.submit(&conn, b"late"),
            Err(TransportError::Shutdown)
        ));
        assert!(matches!(
            f.bridge.send_svc(&[1]).await,
            Err(TransportError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn disconnect_stops_channels() {
        let f = fixture(BridgeConfig::new()).await;
        f.host.wait_for_posted_svc().await;
        f.host.disconnect();

        let (_others, conn, _rx) = connect(&f.registry, 0);
        assert!(matches!(
            f.bridge.submit(&conn, b"x"),
            Err(TransportError::Host(HostError::Disconnected))
        ));
        f.bridge.shutdown().await;
        assert_eq!(f.bridge.stats().ingress.killed, 4);
    }
}
