//! In-memory [`UsbHost`] for exercising a bridge without hardware.
//!
//! Posted IN buffers are queued in posting order and completed by
//! [`LoopbackHost::inject_bulk_in`] / [`LoopbackHost::inject_svc`]. Bulk OUT
//! frames are recorded and complete immediately unless OUT completions are
//! held.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::FutureExt;
use tokio::sync::{Notify, oneshot};
use tokio_util::bytes::{Bytes, BytesMut};

use super::endpoint::EndpointDescriptor;
use super::host::{Completion, ControlSetup, HostError, TransferFuture, UsbHost};
use super::status::TransferStatus;
use crate::sync::lock;

/// How control transfers complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlBehavior {
    /// Write everything.
    Complete,
    /// Write only this many bytes.
    Short(usize),
    Fail(TransferStatus),
    /// Never complete.
    Hang,
}

struct Posted {
    buffer: BytesMut,
    tx: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct InQueue {
    posted: VecDeque<Posted>,
    backlog: VecDeque<(TransferStatus, Bytes)>,
}

impl InQueue {
    fn post(&mut self, buffer: BytesMut) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        match self.backlog.pop_front() {
            Some((status, data)) => complete(Posted { buffer, tx }, status, &data),
            None => self.posted.push_back(Posted { buffer, tx }),
        }
        rx
    }

    fn inject(&mut self, status: TransferStatus, data: &[u8]) {
        // Skip buffers whose transfer was killed.
        while let Some(posted) = self.posted.pop_front() {
            if !posted.tx.is_closed() {
                complete(posted, status, data);
                return;
            }
        }
        self.backlog.push_back((status, Bytes::copy_from_slice(data)));
    }

    fn live(&self) -> usize {
        self.posted.iter().filter(|p| !p.tx.is_closed()).count()
    }

    fn fail_all(&mut self, status: TransferStatus) {
        for posted in self.posted.drain(..) {
            complete(posted, status, &[]);
        }
    }
}

fn complete(posted: Posted, status: TransferStatus, data: &[u8]) {
    let Posted { mut buffer, tx } = posted;
    buffer.clear();
    let status = if data.len() > buffer.capacity() {
        TransferStatus::Overflow
    } else {
        buffer.extend_from_slice(data);
        status
    };
    let _ = tx.send((status, buffer));
}

#[derive(Default)]
struct LoopbackState {
    bulk_in: InQueue,
    svc_in: InQueue,
    bulk_out: Vec<Bytes>,
    out_status: Option<TransferStatus>,
    hold_out: bool,
    held_out: Vec<Posted>,
    control: Vec<Bytes>,
    control_behavior: Option<ControlBehavior>,
    disconnected: bool,
}

pub struct LoopbackHost {
    endpoints: Vec<EndpointDescriptor>,
    state: Mutex<LoopbackState>,
    changed: Notify,
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHost {
    /// A host exposing interrupt-in 1, bulk-in 2 and bulk-out 3.
    pub fn new() -> Self {
        Self::with_endpoints(vec![
            EndpointDescriptor::interrupt_in(1),
            EndpointDescriptor::bulk_in(2),
            EndpointDescriptor::bulk_out(3),
        ])
    }

    pub fn with_endpoints(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            endpoints,
            state: Mutex::new(LoopbackState::default()),
            changed: Notify::new(),
        }
    }

    /// Complete the oldest posted bulk-in buffer, or queue the completion
    /// until one is posted.
    pub fn inject_bulk_in(&self, status: TransferStatus, data: &[u8]) {
        lock(&self.state, "loopback").bulk_in.inject(status, data);
    }

    pub fn inject_svc(&self, status: TransferStatus, data: &[u8]) {
        lock(&self.state, "loopback").svc_in.inject(status, data);
    }

    /// Bulk-in buffers currently posted and not killed.
    pub fn posted_bulk_in(&self) -> usize {
        lock(&self.state, "loopback").bulk_in.live()
    }

    pub fn posted_svc_in(&self) -> usize {
        lock(&self.state, "loopback").svc_in.live()
    }

    /// Frames written to bulk out so far.
    pub fn bulk_out(&self) -> Vec<Bytes> {
        lock(&self.state, "loopback").bulk_out.clone()
    }

    /// Messages written to the control endpoint so far.
    pub fn control_out_messages(&self) -> Vec<Bytes> {
        lock(&self.state, "loopback").control.clone()
    }

    /// Status reported for subsequent bulk-out completions.
    pub fn set_bulk_out_status(&self, status: TransferStatus) {
        lock(&self.state, "loopback").out_status = Some(status);
    }

    /// Keep bulk-out transfers in flight until [`release_bulk_out`](Self::release_bulk_out).
    pub fn hold_bulk_out(&self) {
        lock(&self.state, "loopback").hold_out = true;
    }

    /// Complete every held bulk-out transfer with `status` and stop holding.
    pub fn release_bulk_out(&self, status: TransferStatus) {
        let held = {
            let mut state = lock(&self.state, "loopback");
            state.hold_out = false;
            std::mem::take(&mut state.held_out)
        };
        for posted in held {
            let _ = posted.tx.send((status, posted.buffer));
        }
    }

    pub fn set_control_behavior(&self, behavior: ControlBehavior) {
        lock(&self.state, "loopback").control_behavior = Some(behavior);
    }

    /// Fail every posted transfer with `Shutdown` and reject new ones.
    pub fn disconnect(&self) {
        let mut state = lock(&self.state, "loopback");
        state.disconnected = true;
        state.bulk_in.fail_all(TransferStatus::Shutdown);
        state.svc_in.fail_all(TransferStatus::Shutdown);
        for posted in state.held_out.drain(..) {
            let _ = posted.tx.send((TransferStatus::Shutdown, posted.buffer));
        }
    }

    /// Wait until at least `count` frames have been written to bulk out.
    pub async fn wait_for_bulk_out(&self, count: usize) -> Vec<Bytes> {
        self.wait_until(|state| state.bulk_out.len() >= count).await;
        self.bulk_out()
    }

    /// Wait until at least `count` bulk-in buffers are posted.
    pub async fn wait_for_posted_bulk_in(&self, count: usize) {
        self.wait_until(|state| state.bulk_in.live() >= count).await;
    }

    /// Wait until an SVC buffer is posted.
    pub async fn wait_for_posted_svc(&self) {
        self.wait_until(|state| state.svc_in.live() >= 1).await;
    }

    async fn wait_until(&self, ready: impl Fn(&LoopbackState) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(&*lock(&self.state, "loopback")) {
                return;
            }
            notified.await;
        }
    }

    fn submit_in(
        &self,
        select: impl FnOnce(&mut LoopbackState) -> &mut InQueue,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError> {
        let rx = {
            let mut state = lock(&self.state, "loopback");
            if state.disconnected {
                return Err(HostError::Disconnected);
            }
            select(&mut *state).post(buffer)
        };
        self.changed.notify_waiters();
        Ok(rx
            .map(|completion| completion.unwrap_or((TransferStatus::Cancelled, BytesMut::new())))
            .boxed())
    }
}

impl UsbHost for LoopbackHost {
    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.clone()
    }

    fn submit_bulk_out(
        &self,
        _endpoint: u8,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError> {
        let mut state = lock(&self.state, "loopback");
        if state.disconnected {
            return Err(HostError::Disconnected);
        }
        state.bulk_out.push(Bytes::copy_from_slice(&buffer));

        let future = if state.hold_out {
            let (tx, rx) = oneshot::channel();
            state.held_out.push(Posted { buffer, tx });
            rx.map(|completion| completion.unwrap_or((TransferStatus::Cancelled, BytesMut::new())))
                .boxed()
        } else {
            let status = state.out_status.unwrap_or(TransferStatus::Completed);
            futures::future::ready((status, buffer)).boxed()
        };
        drop(state);

        self.changed.notify_waiters();
        Ok(future)
    }

    fn submit_bulk_in(
        &self,
        _endpoint: u8,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError> {
        self.submit_in(|state| &mut state.bulk_in, buffer)
    }

    fn submit_interrupt_in(
        &self,
        _endpoint: u8,
        buffer: BytesMut,
    ) -> Result<TransferFuture<Completion>, HostError> {
        self.submit_in(|state| &mut state.svc_in, buffer)
    }

    fn control_out(
        &self,
        _setup: ControlSetup,
        data: Bytes,
    ) -> TransferFuture<Result<usize, TransferStatus>> {
        let behavior = {
            let mut state = lock(&self.state, "loopback");
            if state.disconnected {
                return futures::future::ready(Err(TransferStatus::Shutdown)).boxed();
            }
            state.control.push(data.clone());
            state.control_behavior.unwrap_or(ControlBehavior::Complete)
        };
        match behavior {
            ControlBehavior::Complete => futures::future::ready(Ok(data.len())).boxed(),
            ControlBehavior::Short(n) => futures::future::ready(Ok(n.min(data.len()))).boxed(),
            ControlBehavior::Fail(status) => futures::future::ready(Err(status)).boxed(),
            ControlBehavior::Hang => futures::future::pending().boxed(),
        }
    }
}
