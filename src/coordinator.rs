//! Wires the request table, buffer store, notification multiplexer and link
//! queues to a platform adapter.
//!
//! Callers drive everything through futures returned by [`Coordinator`]; the
//! adapter reports back through an [`EventSender`]. All bookkeeping lives under
//! one short-lived lock that is never held across an `.await`, so events may
//! also be applied synchronously with [`Coordinator::handle_event`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_lock::{Mutex, MutexGuard};
use futures_core::Stream;
use futures_lite::future::Boxed;
use futures_lite::FutureExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::arena::IdArena;
use crate::async_util::{with_deadline, ResultWaiter};
use crate::buffer::{
    BufferItem, BufferKind, BufferStore, DrainStrategy, Drained, Released, SubjectFilter,
};
use crate::config::CoordinatorConfig;
use crate::connection_queue::{ConnectionQueue, Connector};
use crate::error::{Error, ErrorKind, HardwareError};
use crate::event::{EventSender, HardwareEvent};
use crate::link_queue::{LinkQueue, QueueItem, Rejected, Submission};
use crate::notify::{JoinAction, NotificationMux};
use crate::reconnect::{LinkLostEvent, ReconnectListener, ReconnectionManager};
use crate::request::{
    CorrelationToken, ParkedDrain, RegisterOptions, RequestTable, TimeoutPolicy, Token,
};
use crate::retry::RetryPolicy;
use crate::types::{
    AdapterState, AttributeId, BufferId, ConnectionState, DeviceId, OpKind, Operation, Response,
    SubjectId,
};
use crate::util::{defer, OptionExt};
use crate::Result;

/// The platform side: hands operations to the native stack.
///
/// Every method is called with the coordinator's state lock held and must not
/// block or call back into the coordinator; results are reported later through
/// an [`EventSender`].
pub trait Hardware: Send + Sync + 'static {
    /// Native attribute handle, interned per link as an [`AttributeId`].
    type Handle: Clone + Eq + Hash + Send + Sync + 'static;

    /// Starts `operation` on `device`. `handle` is the native handle behind the
    /// operation's attribute, if it has one.
    fn submit(
        &self,
        device: &DeviceId,
        operation: &Operation,
        handle: Option<&Self::Handle>,
    ) -> Submission;

    fn start_scan(&self, services: &[Uuid]) -> Submission;

    fn stop_scan(&self);
}

/// Per-call options of [`Coordinator::submit`] and [`Coordinator::drain`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Falls back to [`CoordinatorConfig::operation_timeout`] for hardware
    /// operations; drains without a timeout wait indefinitely.
    pub timeout: Option<Duration>,
    /// Caller-chosen token for [`Coordinator::cancel`]; generated if absent.
    pub correlation: Option<CorrelationToken>,
    /// For drains: on timeout, return whatever the buffer holds instead of failing.
    pub return_partial_on_timeout: bool,
}

impl SubmitOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation(mut self, token: impl Into<CorrelationToken>) -> Self {
        self.correlation = Some(token.into());
        self
    }

    pub fn return_partial_on_timeout(mut self) -> Self {
        self.return_partial_on_timeout = true;
        self
    }
}

struct Link<Hd> {
    queue: LinkQueue,
    arena: IdArena<Hd>,
    mtu: u16,
}

struct State<Hd> {
    requests: RequestTable,
    buffers: BufferStore,
    mux: NotificationMux,
    links: HashMap<DeviceId, Link<Hd>>,
    /// Arenas of lost links, kept so attribute ids are not handed out twice.
    retired_arenas: HashMap<DeviceId, IdArena<Hd>>,
    adapter_state: AdapterState,
}

/// A registered request the caller is about to wait for.
struct Pending {
    token: Token,
    correlation: CorrelationToken,
    subject: SubjectId,
    kind: OpKind,
    waiter: ResultWaiter<Result<Response>>,
    timeout: Option<Duration>,
}

impl<Hd> State<Hd> {
    fn register(
        &mut self,
        subject: SubjectId,
        kind: OpKind,
        options: &SubmitOptions,
        timeout: Option<Duration>,
        drain: Option<ParkedDrain>,
    ) -> Result<Pending> {
        let on_timeout = if options.return_partial_on_timeout {
            TimeoutPolicy::ReturnPartial
        } else {
            TimeoutPolicy::Fail
        };
        let registration = self.requests.register(
            subject.clone(),
            kind,
            RegisterOptions {
                correlation: options.correlation.clone(),
                timeout,
                on_timeout,
                drain,
            },
        )?;
        Ok(Pending {
            token: registration.token,
            correlation: registration.correlation,
            subject,
            kind,
            waiter: registration.waiter,
            timeout,
        })
    }

    /// Resolves the request behind a queue item, if it still waits.
    fn resolve(&mut self, token: Option<Token>, result: Result<Response>) {
        let Some(token) = token else {
            return;
        };
        match self.requests.take_token(token) {
            Some(entry) => {
                let correlation = entry.correlation().clone();
                if !entry.resolve(result) {
                    debug!("waiter of {correlation} is gone");
                }
            }
            None => debug!("settled operation has no waiter left"),
        }
    }

    /// Retries the drains parked on `ids` now that those buffers changed.
    fn wake_drains(&mut self, ids: &[BufferId]) {
        for &id in ids {
            let subject = SubjectId::Buffer(id);
            let Some(parked) = self
                .requests
                .peek(&subject, OpKind::Drain)
                .and_then(|entry| entry.drain())
            else {
                continue;
            };
            let result = match self.buffers.drain(id, parked.strategy) {
                Ok(Drained::Insufficient { .. }) => continue,
                Ok(Drained::Items(items)) => Ok(Response::Items(items)),
                Err(e) => Err(e),
            };
            if let Some(entry) = self.requests.take(&subject, OpKind::Drain) {
                entry.resolve(result);
            }
        }
    }

    fn append(&mut self, subject: Option<&SubjectId>, item: BufferItem) {
        let changed = self.buffers.append(subject, item);
        self.wake_drains(&changed);
    }

    fn check_adapter(&self) -> Result<()> {
        match self.adapter_state {
            AdapterState::PoweredOff | AdapterState::Unsupported | AdapterState::Unauthorized => {
                Err(Error::new(
                    ErrorKind::AdapterUnavailable,
                    None,
                    format!("adapter is {:?}", self.adapter_state),
                )
                .with_subject(SubjectId::Adapter))
            }
            _ => Ok(()),
        }
    }
}

struct Inner<H: Hardware> {
    hardware: H,
    config: CoordinatorConfig,
    state: Mutex<State<H::Handle>>,
    events_tx: async_channel::Sender<HardwareEvent>,
    events_rx: async_channel::Receiver<HardwareEvent>,
    link_lost: async_broadcast::Sender<LinkLostEvent>,
    _link_lost_keeper: async_broadcast::InactiveReceiver<LinkLostEvent>,
    connections: ConnectionQueue,
    reconnects: ReconnectionManager,
}

/// Coordinates BLE operations of one adapter. Cheap to clone.
pub struct Coordinator<H: Hardware> {
    inner: Arc<Inner<H>>,
}

impl<H: Hardware> Clone for Coordinator<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: Hardware> std::fmt::Debug for Coordinator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<H: Hardware> Coordinator<H> {
    pub fn new(hardware: H) -> Self {
        Self::with_config(hardware, CoordinatorConfig::default())
    }

    pub fn with_config(hardware: H, config: CoordinatorConfig) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        let (mut link_lost, link_lost_rx) = async_broadcast::broadcast(config.link_event_capacity);
        link_lost.set_overflow(true);
        let state = State {
            requests: RequestTable::new(),
            buffers: BufferStore::with_capacity_limit(config.max_buffered_items),
            mux: NotificationMux::new(),
            links: HashMap::new(),
            retired_arenas: HashMap::new(),
            adapter_state: AdapterState::Unknown,
        };
        let reconnects = ReconnectionManager::new(config.spawner.clone());
        Self {
            inner: Arc::new(Inner {
                hardware,
                config,
                state: Mutex::new(state),
                events_tx,
                events_rx,
                link_lost,
                _link_lost_keeper: link_lost_rx.deactivate(),
                connections: ConnectionQueue::new(),
                reconnects,
            }),
        }
    }

    pub fn hardware(&self) -> &H {
        &self.inner.hardware
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Handle for the platform adapter to report completions and events with.
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            sender: self.inner.events_tx.clone(),
        }
    }

    /// Applies queued hardware events in order. Never returns while the
    /// coordinator is alive; spawn it on the executor of choice.
    pub async fn run(&self) {
        while let Ok(event) = self.inner.events_rx.recv().await {
            self.handle_event(event);
        }
    }

    /// Applies every event queued so far and returns how many there were.
    pub fn process_pending_events(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.inner.events_rx.try_recv() {
            self.handle_event(event);
            count += 1;
        }
        count
    }

    /// Applies one hardware event right away, bypassing the queue.
    pub fn handle_event(&self, event: HardwareEvent) {
        let mut state = self.lock();
        match event {
            HardwareEvent::OperationSettled {
                subject,
                kind,
                result,
            } => self.on_operation_settled(&mut state, subject, kind, result),
            HardwareEvent::Continuous { subject, item } => {
                if let BufferItem::Mtu(device, mtu) = &item {
                    if let Some(link) = state.links.get_mut(device) {
                        link.mtu = *mtu;
                    }
                }
                state.append(subject.as_ref(), item);
            }
            HardwareEvent::LinkLost { device, error } => {
                let subject = SubjectId::Device(device.clone());
                let error = error.map(|e| {
                    let msg = e.to_string();
                    Error::new(ErrorKind::LinkLost, Some(e), msg).with_subject(subject)
                });
                self.on_link_lost(&mut state, &device, error);
            }
            HardwareEvent::AdapterStateChanged(new_state) => {
                self.on_adapter_state(&mut state, new_state)
            }
        }
    }

    /// Interns a native attribute handle of a connected device.
    pub fn register_attribute(&self, device: &DeviceId, handle: H::Handle) -> Result<AttributeId> {
        let mut state = self.lock();
        let link = state.links.get_mut(device).ok_or_not_connected(device)?;
        Ok(link.arena.intern(handle))
    }

    pub fn attribute_id(&self, device: &DeviceId, handle: &H::Handle) -> Option<AttributeId> {
        let state = self.lock();
        state.links.get(device)?.arena.id_of(handle)
    }

    /// Runs one operation and waits for its completion.
    ///
    /// Fails with `DuplicateOperation` if an operation of the same kind is
    /// already pending on the same subject. Link operations are serialized per
    /// device; `Connect` bypasses the link queue.
    pub async fn submit(
        &self,
        device: &DeviceId,
        operation: Operation,
        options: SubmitOptions,
    ) -> Result<Response> {
        match operation {
            Operation::Connect { auto_connect } => self
                .connect_with(device, auto_connect, options)
                .await
                .map(|()| Response::Done),
            Operation::SetNotify { .. } => Err(Error::new(
                ErrorKind::InvalidParameter,
                None,
                "notifications are toggled through `monitor`",
            )),
            operation => self.submit_link(device, operation, options).await,
        }
    }

    /// Cancels the pending operation registered under `correlation`. Its caller
    /// fails with `OperationCancelled`; the hardware operation itself keeps its
    /// place in the link queue until the stack answers.
    pub fn cancel(&self, correlation: &CorrelationToken) -> bool {
        let mut state = self.lock();
        let Some((subject, kind)) = state.requests.key_of(correlation) else {
            return false;
        };
        let cancelled = state
            .requests
            .cancel(correlation, Error::cancelled().with_subject(subject.clone()));
        if cancelled && kind == OpKind::Connect {
            self.abort_connect(&subject);
        }
        cancelled
    }

    pub async fn connect(&self, device: &DeviceId) -> Result<()> {
        self.connect_with(device, false, SubmitOptions::default())
            .await
    }

    /// Connects to `device`. Succeeds right away if it is already connected.
    pub async fn connect_with(
        &self,
        device: &DeviceId,
        auto_connect: bool,
        options: SubmitOptions,
    ) -> Result<()> {
        let subject = SubjectId::Device(device.clone());
        let pending = {
            let mut state = self.lock();
            if state.links.contains_key(device) {
                return Ok(());
            }
            state.check_adapter()?;
            let timeout = self.timeout_for(&options);
            let pending = state.register(subject.clone(), OpKind::Connect, &options, timeout, None)?;
            info!("connecting to {device}");
            let operation = Operation::Connect { auto_connect };
            match self.inner.hardware.submit(device, &operation, None) {
                Submission::Submitted => state.append(
                    Some(&subject),
                    BufferItem::ConnectionState(device.clone(), ConnectionState::Connecting),
                ),
                Submission::RejectedSynchronously(reason) => {
                    let err = reason.into_submission_error(&subject);
                    state.resolve(Some(pending.token), Err(err));
                }
            }
            pending
        };
        self.wait(pending).await?.into_done()
    }

    /// Disconnects from `device` once the operations queued before have run.
    /// A connection still being established is abandoned instead, and a
    /// reconnection cycle in progress is stopped.
    pub async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        self.inner.reconnects.stop_cycle(device);
        {
            let mut state = self.lock();
            if !state.links.contains_key(device) {
                let subject = SubjectId::Device(device.clone());
                if let Some(entry) = state.requests.take(&subject, OpKind::Connect) {
                    entry.resolve(Err(Error::cancelled().with_subject(subject.clone())));
                    self.abort_connect(&subject);
                }
                return Ok(());
            }
        }
        self.submit_link(device, Operation::Disconnect, SubmitOptions::default())
            .await?
            .into_done()
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.lock().links.contains_key(device)
    }

    pub async fn discover_services(&self, device: &DeviceId) -> Result<()> {
        self.submit_link(device, Operation::DiscoverServices, SubmitOptions::default())
            .await?
            .into_done()
    }

    pub async fn read(&self, device: &DeviceId, attribute: AttributeId) -> Result<Vec<u8>> {
        self.submit_link(device, Operation::Read(attribute), SubmitOptions::default())
            .await?
            .into_value()
    }

    /// Writes `value` and waits for the device to acknowledge it.
    pub async fn write(&self, device: &DeviceId, attribute: AttributeId, value: &[u8]) -> Result<()> {
        let operation = Operation::Write {
            attribute,
            value: value.to_vec(),
            with_response: true,
        };
        self.submit_link(device, operation, SubmitOptions::default())
            .await?
            .into_done()
    }

    /// Writes `value` without requesting a response. The value must fit into
    /// one packet (see [`Coordinator::max_write_len`]).
    pub async fn write_without_response(
        &self,
        device: &DeviceId,
        attribute: AttributeId,
        value: &[u8],
    ) -> Result<()> {
        if value.len() > self.max_write_len(device)? {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                None,
                "write length exceeds the MTU's limitation",
            ));
        }
        let operation = Operation::Write {
            attribute,
            value: value.to_vec(),
            with_response: false,
        };
        self.submit_link(device, operation, SubmitOptions::default())
            .await?
            .into_done()
    }

    pub async fn read_rssi(&self, device: &DeviceId) -> Result<i16> {
        self.submit_link(device, Operation::ReadRssi, SubmitOptions::default())
            .await?
            .into_rssi()
    }

    /// Requests an MTU exchange; returns the MTU the link settled on.
    pub async fn request_mtu(&self, device: &DeviceId, mtu: u16) -> Result<u16> {
        self.submit_link(device, Operation::RequestMtu(mtu), SubmitOptions::default())
            .await?
            .into_mtu()
    }

    /// The link's current MTU; the configured default until an exchange settles.
    pub fn mtu(&self, device: &DeviceId) -> Result<u16> {
        let state = self.lock();
        Ok(state.links.get(device).ok_or_not_connected(device)?.mtu)
    }

    /// Maximum amount of data that fits into a single write.
    pub fn max_write_len(&self, device: &DeviceId) -> Result<usize> {
        Ok(usize::from(self.mtu(device)?).saturating_sub(3))
    }

    /// Starts receiving value notifications of a characteristic and returns the
    /// buffer they land in. Concurrent callers share one hardware toggle but
    /// each gets a buffer of its own.
    pub async fn monitor(&self, device: &DeviceId, attribute: AttributeId) -> Result<BufferId> {
        self.monitor_with(device, attribute, SubmitOptions::default())
            .await
    }

    pub async fn monitor_with(
        &self,
        device: &DeviceId,
        attribute: AttributeId,
        options: SubmitOptions,
    ) -> Result<BufferId> {
        let subject = SubjectId::Attribute(device.clone(), attribute);
        let pending = {
            let mut state = self.lock();
            let link = state.links.get(device).ok_or_not_connected(device)?;
            link.arena.handle(attribute).ok_or_not_found(&subject)?;
            let timeout = self.timeout_for(&options);
            let pending = state.register(subject.clone(), OpKind::Monitor, &options, timeout, None)?;
            match state.mux.join(&subject) {
                JoinAction::Ready => {
                    let _ = state.requests.take_token(pending.token);
                    return Ok(state
                        .buffers
                        .create(BufferKind::CharacteristicValue, Some(subject)));
                }
                JoinAction::Wait => debug!("joining the pending enable of {subject}"),
                JoinAction::Enable => {
                    let item = QueueItem {
                        operation: Operation::SetNotify {
                            attribute,
                            enable: true,
                        },
                        subject,
                        token: None,
                    };
                    self.enqueue(&mut state, device, item);
                }
            }
            pending
        };
        self.wait(pending).await?.into_buffer()
    }

    /// Starts scanning (once) and returns the scan buffer.
    pub fn start_scan(&self, services: &[Uuid]) -> Result<BufferId> {
        let mut state = self.lock();
        state.check_adapter()?;
        let adapter = SubjectId::Adapter;
        if let Some(id) = state.buffers.find_live(BufferKind::Scan, Some(&adapter)) {
            return Ok(id);
        }
        match self.inner.hardware.start_scan(services) {
            Submission::Submitted => {
                info!("scan started");
                Ok(state.buffers.create(BufferKind::Scan, Some(adapter)))
            }
            Submission::RejectedSynchronously(reason) => {
                Err(reason.into_submission_error(&adapter))
            }
        }
    }

    /// Destroys the scan buffer, which stops the scan.
    pub fn stop_scan(&self) -> bool {
        let ids = self
            .lock()
            .buffers
            .ids_of(BufferKind::Scan, Some(&SubjectId::Adapter));
        ids.into_iter()
            .fold(false, |any, id| self.destroy_buffer(id) || any)
    }

    /// Creates a buffer for a continuous event stream. Singleton kinds return
    /// the live buffer of the same subject if there is one. Characteristic
    /// values should be subscribed to with [`Coordinator::monitor`].
    pub fn create_buffer(&self, kind: BufferKind, subject: Option<SubjectId>) -> BufferId {
        self.lock().buffers.create(kind, subject)
    }

    /// Drains a buffer, waiting until it holds enough items.
    ///
    /// Fails right away with the stored reason if the buffer was invalidated.
    /// At most one drain may wait on a buffer at a time.
    pub async fn drain(
        &self,
        id: BufferId,
        strategy: DrainStrategy,
        options: SubmitOptions,
    ) -> Result<Vec<BufferItem>> {
        let pending = {
            let mut state = self.lock();
            if let Drained::Items(items) = state.buffers.drain(id, strategy)? {
                return Ok(items);
            }
            let parked = ParkedDrain {
                buffer: id,
                strategy,
            };
            let timeout = options.timeout;
            state.register(SubjectId::Buffer(id), OpKind::Drain, &options, timeout, Some(parked))?
        };
        self.wait(pending).await?.into_items()
    }

    /// Drains without waiting.
    pub fn try_drain(&self, id: BufferId, strategy: DrainStrategy) -> Result<Drained> {
        self.lock().buffers.drain(id, strategy)
    }

    /// Yields the items of a buffer one by one, oldest first. Ends once the
    /// buffer is invalidated or destroyed.
    pub fn buffer_stream(&self, id: BufferId) -> impl Stream<Item = BufferItem> + Send + '_ {
        futures_lite::stream::unfold(self, move |coord| async move {
            let drained = coord
                .drain(id, DrainStrategy::take_oldest(1), SubmitOptions::default())
                .await;
            let mut items = match drained {
                Ok(items) => items,
                Err(e) => {
                    debug!("stream of {id} ended: {e}");
                    return None;
                }
            };
            let item = items.pop()?;
            Some((item, coord))
        })
    }

    /// Removes a buffer. A drain waiting on it fails with `OperationCancelled`.
    /// Destroying the last buffer of a subscription releases it (disables
    /// notifications, stops the scan).
    pub fn destroy_buffer(&self, id: BufferId) -> bool {
        let mut state = self.lock();
        let subject = SubjectId::Buffer(id);
        if let Some(entry) = state.requests.take(&subject, OpKind::Drain) {
            let err = Error::new(ErrorKind::OperationCancelled, None, "buffer destroyed");
            entry.resolve(Err(err.with_subject(subject)));
        }
        match state.buffers.destroy(id) {
            None => false,
            Some(released) => {
                if let Some(released) = released {
                    self.release(&mut state, released);
                }
                true
            }
        }
    }

    pub fn buffer_len(&self, id: BufferId) -> Option<usize> {
        self.lock().buffers.len(id)
    }

    pub fn is_buffer_invalidated(&self, id: BufferId) -> bool {
        self.lock().buffers.is_invalidated(id)
    }

    /// Number of buffers alive or invalidated but not yet destroyed.
    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.buffer_count()
    }

    /// Checks if notifications of the characteristic are currently enabled.
    pub fn is_monitoring(&self, device: &DeviceId, attribute: AttributeId) -> bool {
        let subject = SubjectId::Attribute(device.clone(), attribute);
        self.lock().mux.is_enabled(&subject)
    }

    /// Number of operations waiting for a completion, parked drains included.
    pub fn pending_requests(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn is_pending(&self, subject: &SubjectId, kind: OpKind) -> bool {
        self.lock().requests.contains(subject, kind)
    }

    /// Number of operations queued on the device's link, the active one included.
    pub fn queued_operations(&self, device: &DeviceId) -> usize {
        self.lock().links.get(device).map_or(0, |link| link.queue.len())
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.lock().adapter_state
    }

    /// Connects through the process-wide connection queue, retrying with
    /// backoff. See [`ConnectionQueue::connect`].
    pub async fn queue_connect(&self, device: &DeviceId, policy: RetryPolicy) -> Result<()> {
        self.inner
            .connections
            .connect(self, device.clone(), policy)
            .await
    }

    pub fn cancel_queued_connect(&self, device: &DeviceId) -> bool {
        self.inner.connections.cancel(device)
    }

    pub fn connection_queue(&self) -> &ConnectionQueue {
        &self.inner.connections
    }

    /// Reconnects automatically whenever the link to `device` is lost
    /// unexpectedly.
    pub fn enable_auto_reconnect(
        &self,
        device: &DeviceId,
        policy: RetryPolicy,
        listener: impl ReconnectListener,
    ) {
        self.inner.reconnects.enable(
            device.clone(),
            policy,
            Arc::new(listener),
            self.weak_connector(),
            self.inner.link_lost.new_receiver(),
        );
    }

    pub fn disable_auto_reconnect(&self, device: &DeviceId) -> bool {
        self.inner.reconnects.disable(device)
    }

    /// Attempts to reconnect right away. Auto-reconnect must be enabled.
    pub async fn manual_reconnect(&self, device: &DeviceId) -> Result<()> {
        self.inner
            .reconnects
            .manual_reconnect(device, self.weak_connector())
            .await
    }

    pub fn reconnection_manager(&self) -> &ReconnectionManager {
        &self.inner.reconnects
    }

    fn weak_connector(&self) -> Arc<dyn Connector> {
        Arc::new(WeakConnector(Arc::downgrade(&self.inner)))
    }

    fn lock(&self) -> MutexGuard<'_, State<H::Handle>> {
        self.inner.state.lock_blocking()
    }

    fn timeout_for(&self, options: &SubmitOptions) -> Option<Duration> {
        options.timeout.or(self.inner.config.operation_timeout)
    }

    async fn submit_link(
        &self,
        device: &DeviceId,
        operation: Operation,
        options: SubmitOptions,
    ) -> Result<Response> {
        let kind = operation.kind();
        let subject = operation.subject(device);
        let pending = {
            let mut state = self.lock();
            let link = state.links.get(device).ok_or_not_connected(device)?;
            if let Some(attr) = operation.attribute() {
                link.arena.handle(attr).ok_or_not_found(&subject)?;
            }
            let timeout = self.timeout_for(&options);
            let pending = state.register(subject.clone(), kind, &options, timeout, None)?;
            let item = QueueItem {
                operation,
                subject,
                token: Some(pending.token),
            };
            self.enqueue(&mut state, device, item);
            pending
        };
        self.wait(pending).await
    }

    /// Waits for a registered request, honouring its deadline. Dropping the
    /// future removes the request.
    async fn wait(&self, pending: Pending) -> Result<Response> {
        let token = pending.token;
        let correlation = pending.correlation.clone();
        let guard = defer(move || self.abandon(token, &correlation));
        let outcome = with_deadline(pending.waiter.recv(), pending.timeout).await;
        guard.defuse();
        match outcome {
            Some(Some(result)) => result,
            Some(None) => Err(Error::new(
                ErrorKind::Internal,
                None,
                "request dropped without a result",
            )
            .with_subject(pending.subject)),
            None => self.expire(pending),
        }
    }

    fn expire(&self, pending: Pending) -> Result<Response> {
        let mut state = self.lock();
        let timed_out = || {
            let waited = pending.timeout.unwrap_or_default();
            Error::new(
                ErrorKind::OperationTimedOut,
                None,
                format!("{} did not complete within {waited:?}", pending.kind),
            )
            .with_subject(pending.subject.clone())
        };
        let Some(entry) = state.requests.take_token(pending.token) else {
            // settled between the deadline firing and taking the lock
            return pending.waiter.try_recv().unwrap_or_else(|| Err(timed_out()));
        };
        if entry.on_timeout() == TimeoutPolicy::ReturnPartial {
            if let Some(parked) = entry.drain() {
                return state
                    .buffers
                    .drain_available(parked.buffer, parked.strategy)
                    .map(Response::Items);
            }
        }
        if pending.kind == OpKind::Connect {
            self.abort_connect(&pending.subject);
        }
        debug!("{} timed out", entry.correlation());
        Err(timed_out())
    }

    fn abandon(&self, token: Token, correlation: &CorrelationToken) {
        let mut state = self.lock();
        let Some((subject, kind)) = state.requests.key_of(correlation) else {
            return;
        };
        if state.requests.take_token(token).is_some() {
            debug!("caller of {correlation} ({kind} on {subject}) gave up");
            if kind == OpKind::Connect {
                self.abort_connect(&subject);
            }
        }
    }

    /// Tells the stack to stop a connection attempt nobody waits for anymore.
    fn abort_connect(&self, subject: &SubjectId) {
        if let Some(device) = subject.device() {
            if let Submission::RejectedSynchronously(e) =
                self.inner
                    .hardware
                    .submit(device, &Operation::Disconnect, None)
            {
                debug!("aborting connection to {device} failed: {e}");
            }
        }
    }

    fn enqueue(&self, state: &mut State<H::Handle>, device: &DeviceId, item: QueueItem) {
        let hardware = &self.inner.hardware;
        let rejected = match state.links.get_mut(device) {
            Some(Link { queue, arena, .. }) => {
                queue.enqueue(item, |it| submit_to(hardware, device, arena, it))
            }
            None => {
                let err = ErrorKind::NotConnected.into();
                return self.complete(state, device, item, Err(err));
            }
        };
        self.fail_rejected(state, device, rejected);
    }

    fn advance(&self, state: &mut State<H::Handle>, device: &DeviceId) {
        let hardware = &self.inner.hardware;
        let Some(Link { queue, arena, .. }) = state.links.get_mut(device) else {
            return;
        };
        let rejected = queue.advance(|it| submit_to(hardware, device, arena, it));
        self.fail_rejected(state, device, rejected);
    }

    fn fail_rejected(&self, state: &mut State<H::Handle>, device: &DeviceId, rejected: Vec<Rejected>) {
        for Rejected { item, reason } in rejected {
            let err = reason.into_submission_error(&item.subject);
            self.complete(state, device, item, Err(err));
        }
    }

    fn on_operation_settled(
        &self,
        state: &mut State<H::Handle>,
        subject: SubjectId,
        kind: OpKind,
        result: std::result::Result<Response, HardwareError>,
    ) {
        let Some(device) = subject.device().cloned() else {
            warn!("dropping {kind} completion without a device ({subject})");
            return;
        };
        if kind == OpKind::Connect {
            return self.on_connect_settled(state, &device, result);
        }
        if !kind.is_link_operation() {
            warn!("dropping {kind} completion for {subject}: not a hardware operation");
            return;
        }
        let Some(link) = state.links.get_mut(&device) else {
            debug!("{kind} completion for {subject} arrived after the link was lost");
            return;
        };
        let Some(item) = link.queue.pop_active(kind, &subject) else {
            match link.queue.active() {
                Some(active) => warn!(
                    "unexpected {kind} completion for {subject}, waiting for {} on {}",
                    active.kind(),
                    active.subject
                ),
                None => warn!("unexpected {kind} completion for {subject}, nothing in flight"),
            }
            return;
        };
        let result = result.map_err(|e| e.into_operation_error(&subject));
        if kind == OpKind::Disconnect && result.is_ok() {
            state.resolve(item.token, Ok(Response::Done));
            return self.on_link_lost(state, &device, None);
        }
        self.complete(state, &device, item, result);
        self.advance(state, &device);
    }

    fn on_connect_settled(
        &self,
        state: &mut State<H::Handle>,
        device: &DeviceId,
        result: std::result::Result<Response, HardwareError>,
    ) {
        let subject = SubjectId::Device(device.clone());
        let entry = state.requests.take(&subject, OpKind::Connect);
        match result {
            Ok(_) => {
                if !state.links.contains_key(device) {
                    let arena = state
                        .retired_arenas
                        .remove(device)
                        .unwrap_or_else(IdArena::new);
                    let link = Link {
                        queue: LinkQueue::new(),
                        arena,
                        mtu: self.inner.config.default_mtu,
                    };
                    state.links.insert(device.clone(), link);
                    info!("connected to {device}");
                }
                state.append(
                    Some(&subject),
                    BufferItem::ConnectionState(device.clone(), ConnectionState::Connected),
                );
                if let Some(entry) = entry {
                    entry.resolve(Ok(Response::Done));
                }
            }
            Err(e) => {
                let err = e.into_operation_error(&subject);
                warn!("connecting to {device} failed: {err}");
                state.append(
                    Some(&subject),
                    BufferItem::ConnectionState(device.clone(), ConnectionState::Disconnected),
                );
                if let Some(entry) = entry {
                    entry.resolve(Err(err));
                }
            }
        }
    }

    /// Routes the outcome of a popped queue item.
    fn complete(
        &self,
        state: &mut State<H::Handle>,
        device: &DeviceId,
        item: QueueItem,
        result: Result<Response>,
    ) {
        match &item.operation {
            Operation::SetNotify { enable: true, .. } => {
                self.settle_monitors(state, &item.subject, result)
            }
            Operation::SetNotify { enable: false, .. } => {
                state.mux.disable_settled(&item.subject);
                if let Err(e) = result {
                    warn!("disabling notifications on {} failed: {e}", item.subject);
                }
            }
            Operation::RequestMtu(_) => {
                if let Ok(Response::Mtu(mtu)) = &result {
                    if let Some(link) = state.links.get_mut(device) {
                        link.mtu = *mtu;
                    }
                    let subject = SubjectId::Device(device.clone());
                    state.append(Some(&subject), BufferItem::Mtu(device.clone(), *mtu));
                }
                state.resolve(item.token, result);
            }
            _ => state.resolve(item.token, result),
        }
    }

    fn settle_monitors(&self, state: &mut State<H::Handle>, subject: &SubjectId, result: Result<Response>) {
        if !state.mux.enable_settled(subject, result.is_ok()) {
            debug!("stale enable completion for {subject}");
            return;
        }
        let waiters = state.requests.take_all(subject, OpKind::Monitor);
        match result {
            Ok(_) => {
                let mut delivered = 0;
                for waiter in waiters {
                    let id = state
                        .buffers
                        .create(BufferKind::CharacteristicValue, Some(subject.clone()));
                    if waiter.resolve(Ok(Response::Buffer(id))) {
                        delivered += 1;
                    } else {
                        let _ = state.buffers.destroy(id);
                    }
                }
                debug!("notifications on {subject} enabled for {delivered} monitor(s)");
                if delivered == 0 {
                    self.release_notifications(state, subject);
                }
            }
            Err(e) => {
                warn!("enabling notifications on {subject} failed: {e}");
                for waiter in waiters {
                    waiter.resolve(Err(e.clone()));
                }
            }
        }
    }

    fn release(&self, state: &mut State<H::Handle>, released: Released) {
        match (released.kind, released.subject) {
            (BufferKind::CharacteristicValue, Some(subject)) => {
                self.release_notifications(state, &subject)
            }
            (BufferKind::Scan, _) => {
                info!("scan stopped");
                self.inner.hardware.stop_scan();
            }
            _ => (),
        }
    }

    fn release_notifications(&self, state: &mut State<H::Handle>, subject: &SubjectId) {
        let SubjectId::Attribute(device, attribute) = subject else {
            return;
        };
        if !state.mux.release(subject) {
            return;
        }
        debug!("last monitor of {subject} gone, disabling notifications");
        let item = QueueItem {
            operation: Operation::SetNotify {
                attribute: *attribute,
                enable: false,
            },
            subject: subject.clone(),
            token: None,
        };
        self.enqueue(state, device, item);
    }

    fn on_link_lost(&self, state: &mut State<H::Handle>, device: &DeviceId, error: Option<Error>) {
        let subject = SubjectId::Device(device.clone());
        let link = state.links.remove(device);
        let had_link = link.is_some();
        if !had_link && !state.requests.contains(&subject, OpKind::Connect) {
            debug!("link loss reported for {device}, which has no link");
            return;
        }
        if let Some(mut link) = link {
            let dropped = link.queue.clear();
            if !dropped.is_empty() {
                debug!("dropping {} queued operation(s) of {device}", dropped.len());
            }
            link.arena.clear();
            state.retired_arenas.insert(device.clone(), link.arena);
        }

        if let Some(entry) = state.requests.take(&subject, OpKind::Disconnect) {
            entry.resolve(Ok(Response::Done));
        }
        let reason = error.clone().unwrap_or_else(|| {
            Error::new(ErrorKind::LinkLost, None, "disconnected").with_subject(subject.clone())
        });
        state
            .requests
            .cancel_all_matching(|s, _| s.belongs_to(device), &reason);
        state.mux.forget_device(device);

        state.append(
            Some(&subject),
            BufferItem::ConnectionState(device.clone(), ConnectionState::Disconnected),
        );
        state.append(
            Some(&subject),
            BufferItem::Disconnected {
                device: device.clone(),
                error: error.clone(),
            },
        );
        let poisoned = state.buffers.invalidate(
            &reason,
            Some(BufferKind::CharacteristicValue),
            &SubjectFilter::Device(device.clone()),
        );
        state.wake_drains(&poisoned);

        // a failed connection attempt is not a lost link
        if !had_link {
            return;
        }
        match &error {
            Some(e) => info!("link to {device} lost: {e}"),
            None => info!("disconnected from {device}"),
        }
        let event = LinkLostEvent {
            device: device.clone(),
            error,
        };
        if let Err(e) = self.inner.link_lost.try_broadcast(event) {
            debug!("link loss of {device} not broadcast: {e}");
        }
    }

    fn on_adapter_state(&self, state: &mut State<H::Handle>, new_state: AdapterState) {
        let old_state = std::mem::replace(&mut state.adapter_state, new_state);
        state.append(Some(&SubjectId::Adapter), BufferItem::AdapterState(new_state));
        if old_state == new_state {
            return;
        }
        info!("adapter state changed from {old_state:?} to {new_state:?}");
        if new_state != AdapterState::PoweredOff {
            return;
        }

        let reason = Error::new(ErrorKind::AdapterUnavailable, None, "adapter powered off")
            .with_subject(SubjectId::Adapter);
        state
            .requests
            .cancel_all_matching(|_, kind| kind != OpKind::Drain, &reason);
        let mut poisoned = Vec::new();
        for kind in [BufferKind::Scan, BufferKind::CharacteristicValue] {
            poisoned.extend(state.buffers.invalidate(&reason, Some(kind), &SubjectFilter::Any));
        }
        state.wake_drains(&poisoned);
        let devices: Vec<DeviceId> = state.links.keys().cloned().collect();
        for device in devices {
            self.on_link_lost(state, &device, Some(reason.clone()));
        }
        state.mux.clear();
    }
}

fn submit_to<H: Hardware>(
    hardware: &H,
    device: &DeviceId,
    arena: &IdArena<H::Handle>,
    item: &QueueItem,
) -> Submission {
    let handle = match item.operation.attribute() {
        Some(attr) => match arena.handle(attr) {
            Some(handle) => Some(handle),
            None => {
                return Submission::RejectedSynchronously(HardwareError::Rejected(format!(
                    "unknown attribute {attr}"
                )))
            }
        },
        None => None,
    };
    debug!("submitting {} for {}", item.kind(), item.subject);
    hardware.submit(device, &item.operation, handle)
}

impl<H: Hardware> Connector for Coordinator<H> {
    fn connect(&self, device: DeviceId) -> Boxed<Result<()>> {
        let this = self.clone();
        async move { this.connect(&device).await }.boxed()
    }

    fn disconnect(&self, device: DeviceId) -> Boxed<Result<()>> {
        let this = self.clone();
        async move { this.disconnect(&device).await }.boxed()
    }

    fn is_connected(&self, device: &DeviceId) -> bool {
        Coordinator::is_connected(self, device)
    }
}

/// Connector handed to background tasks; it does not keep the coordinator alive.
struct WeakConnector<H: Hardware>(Weak<Inner<H>>);

impl<H: Hardware> WeakConnector<H> {
    fn upgrade(&self) -> Result<Coordinator<H>> {
        self.0
            .upgrade()
            .map(|inner| Coordinator { inner })
            .ok_or_else(|| Error::new(ErrorKind::Other, None, "coordinator was dropped"))
    }
}

impl<H: Hardware> Connector for WeakConnector<H> {
    fn connect(&self, device: DeviceId) -> Boxed<Result<()>> {
        match self.upgrade() {
            Ok(coord) => Connector::connect(&coord, device),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    fn disconnect(&self, device: DeviceId) -> Boxed<Result<()>> {
        match self.upgrade() {
            Ok(coord) => Connector::disconnect(&coord, device),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    fn is_connected(&self, device: &DeviceId) -> bool {
        self.upgrade().is_ok_and(|coord| coord.is_connected(device))
    }
}
