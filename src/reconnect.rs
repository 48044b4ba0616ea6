//! Automatic reconnection after unexpected link loss.
//!
//! Each enabled device gets a watcher task that listens to the coordinator's
//! link-lost broadcast. An error-carrying disconnect starts a reconnection
//! cycle; an explicit one (no error) stops any cycle in progress. Cycles are
//! tagged with a generation number, and every continuation checks that its
//! generation is still current before it touches state, so a disable, a manual
//! reconnect or an explicit disconnect cleanly orphans the old cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_broadcast::RecvError;
use async_lock::Mutex;
use futures_lite::FutureExt;
use futures_timer::Delay;
use log::{debug, info, warn};

use crate::async_util::Spawner;
use crate::connection_queue::Connector;
use crate::error::{Error, ErrorKind};
use crate::retry::RetryPolicy;
use crate::types::{DeviceId, SubjectId};
use crate::Result;

/// Broadcast by the coordinator whenever a link goes down.
#[derive(Debug, Clone)]
pub struct LinkLostEvent {
    pub device: DeviceId,
    /// `None` for an explicit, caller-initiated disconnect.
    pub error: Option<Error>,
}

impl LinkLostEvent {
    pub fn is_unexpected(&self) -> bool {
        self.error.is_some()
    }
}

/// Progress callbacks of a reconnection cycle. Every method defaults to a no-op.
pub trait ReconnectListener: Send + Sync + 'static {
    /// Attempt number `attempt` (starting at 1) runs after `delay`.
    fn on_reconnecting(&self, _device: &DeviceId, _attempt: u32, _delay: Duration) {}
    fn on_reconnected(&self, _device: &DeviceId) {}
    fn on_reconnect_failed(&self, _device: &DeviceId, _error: &Error) {}
}

impl ReconnectListener for () {}

struct ReconnectState {
    policy: RetryPolicy,
    listener: Arc<dyn ReconnectListener>,
    is_reconnecting: bool,
    retry_count: u32,
    generation: u64,
    /// Generation of the last cycle ended by an explicit disconnect.
    stopped: Option<u64>,
    stop: async_channel::Sender<()>,
}

impl ReconnectState {
    fn stop_cycle(&mut self) {
        self.is_reconnecting = false;
        self.retry_count = 0;
        self.stopped = Some(self.generation);
        self.generation += 1;
    }
}

type States = Arc<Mutex<HashMap<DeviceId, ReconnectState>>>;

pub struct ReconnectionManager {
    states: States,
    spawner: Arc<dyn Spawner>,
}

impl std::fmt::Debug for ReconnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let devices: Vec<DeviceId> = self.states.lock_blocking().keys().cloned().collect();
        f.debug_struct("ReconnectionManager")
            .field("enabled", &devices)
            .finish_non_exhaustive()
    }
}

impl ReconnectionManager {
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            spawner,
        }
    }

    /// Starts watching `link_events` for `device`. Enabling an already enabled
    /// device replaces its policy and listener and resets its state.
    pub fn enable(
        &self,
        device: DeviceId,
        policy: RetryPolicy,
        listener: Arc<dyn ReconnectListener>,
        connector: Arc<dyn Connector>,
        link_events: async_broadcast::Receiver<LinkLostEvent>,
    ) {
        self.disable(&device);
        let (stop, stopped) = async_channel::bounded(1);
        self.states.lock_blocking().insert(
            device.clone(),
            ReconnectState {
                policy,
                listener,
                is_reconnecting: false,
                retry_count: 0,
                generation: 0,
                stopped: None,
                stop,
            },
        );
        info!("auto-reconnect enabled for {device}");
        let watcher = watch(
            self.states.clone(),
            self.spawner.clone(),
            connector,
            device,
            link_events,
            stopped,
        );
        self.spawner.spawn(watcher.boxed());
    }

    /// Stops watching `device` and abandons any cycle in progress. Returns
    /// `false` if it was not enabled.
    pub fn disable(&self, device: &DeviceId) -> bool {
        let Some(state) = self.states.lock_blocking().remove(device) else {
            return false;
        };
        state.stop.close();
        info!("auto-reconnect disabled for {device}");
        true
    }

    /// Abandons the cycle in progress for `device`, if any, leaving
    /// auto-reconnect enabled for later losses. Returns `false` if no cycle ran.
    pub fn stop_cycle(&self, device: &DeviceId) -> bool {
        let mut states = self.states.lock_blocking();
        let Some(state) = states.get_mut(device).filter(|s| s.is_reconnecting) else {
            return false;
        };
        state.stop_cycle();
        info!("reconnection of {device} stopped");
        true
    }

    /// Resets the retry count and attempts to reconnect right away, skipping any
    /// scheduled delay. A failure that leaves retries continues the cycle with
    /// backoff in the background.
    pub async fn manual_reconnect(
        &self,
        device: &DeviceId,
        connector: Arc<dyn Connector>,
    ) -> Result<()> {
        let generation = {
            let mut states = self.states.lock_blocking();
            let state = states.get_mut(device).ok_or_else(|| {
                Error::new(ErrorKind::NotFound, None, "auto-reconnect is not enabled")
                    .with_subject(SubjectId::Device(device.clone()))
            })?;
            state.generation += 1;
            state.retry_count = 0;
            state.is_reconnecting = true;
            state.generation
        };
        info!("manual reconnect of {device}");

        let result = attempt(connector.as_ref(), device).await;
        let outcome = settle_attempt(&self.states, device, generation, &result);
        if outcome == Settled::Retry {
            let cycle = run_cycle(self.states.clone(), connector, device.clone(), generation);
            self.spawner.spawn(cycle.boxed());
        }
        result
    }

    pub fn is_enabled(&self, device: &DeviceId) -> bool {
        self.states.lock_blocking().contains_key(device)
    }

    pub fn is_reconnecting(&self, device: &DeviceId) -> bool {
        self.states
            .lock_blocking()
            .get(device)
            .is_some_and(|s| s.is_reconnecting)
    }

    pub fn retry_count(&self, device: &DeviceId) -> Option<u32> {
        self.states.lock_blocking().get(device).map(|s| s.retry_count)
    }

    /// Devices with auto-reconnect enabled.
    pub fn enabled_devices(&self) -> Vec<DeviceId> {
        self.states.lock_blocking().keys().cloned().collect()
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        for (_, state) in self.states.lock_blocking().drain() {
            state.stop.close();
        }
    }
}

async fn watch(
    states: States,
    spawner: Arc<dyn Spawner>,
    connector: Arc<dyn Connector>,
    device: DeviceId,
    mut link_events: async_broadcast::Receiver<LinkLostEvent>,
    stopped: async_channel::Receiver<()>,
) {
    loop {
        let next = async { Some(link_events.recv().await) }
            .or(async {
                let _ = stopped.recv().await;
                None
            })
            .await;
        let event = match next {
            None => break,
            Some(Ok(event)) => event,
            Some(Err(RecvError::Overflowed(n))) => {
                warn!("reconnect watcher for {device} missed {n} link event(s)");
                continue;
            }
            Some(Err(RecvError::Closed)) => break,
        };
        if event.device != device {
            continue;
        }

        let mut guard = states.lock_blocking();
        let Some(state) = guard.get_mut(&device) else {
            break;
        };
        if !event.is_unexpected() {
            if state.is_reconnecting {
                state.stop_cycle();
                info!("explicit disconnect of {device}, reconnection stopped");
            }
            continue;
        }
        if state.is_reconnecting {
            debug!("{device} lost again while reconnecting");
            continue;
        }
        state.is_reconnecting = true;
        state.retry_count = 0;
        state.generation += 1;
        let generation = state.generation;
        drop(guard);

        info!("unexpected disconnect of {device}, reconnecting");
        let cycle = run_cycle(states.clone(), connector.clone(), device.clone(), generation);
        spawner.spawn(cycle.boxed());
    }
    debug!("reconnect watcher for {device} stopped");
}

async fn run_cycle(states: States, connector: Arc<dyn Connector>, device: DeviceId, generation: u64) {
    loop {
        let (delay, attempt_no, listener) = {
            let guard = states.lock_blocking();
            let Some(state) = guard.get(&device).filter(|s| s.generation == generation) else {
                return;
            };
            let attempt_no = state.retry_count + 1;
            (state.policy.delay_for(attempt_no), attempt_no, state.listener.clone())
        };
        listener.on_reconnecting(&device, attempt_no, delay);
        debug!("reconnect attempt {attempt_no} for {device} in {delay:?}");
        Delay::new(delay).await;
        if !is_current(&states, &device, generation) {
            return;
        }

        let result = attempt(connector.as_ref(), &device).await;
        match settle_attempt(&states, &device, generation, &result) {
            Settled::Retry => continue,
            Settled::Done => return,
            Settled::Stale => {
                if result.is_ok() && was_stopped(&states, &device, generation) {
                    debug!("{device} connected after its reconnection was stopped, disconnecting");
                    if let Err(e) = connector.disconnect(device.clone()).await {
                        debug!("disconnecting {device} failed: {e}");
                    }
                }
                return;
            }
        }
    }
}

async fn attempt(connector: &dyn Connector, device: &DeviceId) -> Result<()> {
    if connector.is_connected(device) {
        return Ok(());
    }
    connector.connect(device.clone()).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Done,
    Retry,
    /// The cycle was superseded while the attempt ran.
    Stale,
}

/// Books the outcome of one attempt and notifies the listener.
fn settle_attempt(states: &States, device: &DeviceId, generation: u64, result: &Result<()>) -> Settled {
    let mut guard = states.lock_blocking();
    let Some(state) = guard.get_mut(device).filter(|s| s.generation == generation) else {
        return Settled::Stale;
    };
    let listener = state.listener.clone();
    match result {
        Ok(()) => {
            state.is_reconnecting = false;
            state.retry_count = 0;
            drop(guard);
            info!("reconnected to {device}");
            listener.on_reconnected(device);
            Settled::Done
        }
        // retries are kept for when the adapter is back
        Err(e) if e.kind() == ErrorKind::AdapterUnavailable => {
            debug!("adapter unavailable, reconnection of {device} keeps waiting");
            Settled::Retry
        }
        Err(e) => {
            state.retry_count += 1;
            let retry_count = state.retry_count;
            if !state.policy.is_exhausted(retry_count) {
                debug!("reconnect attempt {retry_count} for {device} failed: {e}");
                return Settled::Retry;
            }
            state.is_reconnecting = false;
            drop(guard);
            let err = Error::new(
                ErrorKind::RetryExhausted,
                e.hardware_error().cloned(),
                format!("{retry_count} reconnection attempt(s) failed, last error: {e}"),
            )
            .with_subject(SubjectId::Device(device.clone()));
            warn!("{err}");
            listener.on_reconnect_failed(device, &err);
            Settled::Done
        }
    }
}

fn was_stopped(states: &States, device: &DeviceId, generation: u64) -> bool {
    states
        .lock_blocking()
        .get(device)
        .is_some_and(|s| s.stopped == Some(generation) && !s.is_reconnecting)
}

fn is_current(states: &States, device: &DeviceId, generation: u64) -> bool {
    states
        .lock_blocking()
        .get(device)
        .is_some_and(|s| s.generation == generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_queue::tests::{failure, fast_policy, ScriptedConnector};
    use futures_lite::future::{block_on, Boxed};
    use std::sync::Mutex as StdMutex;

    /// Runs spawned tasks on demand instead of on threads.
    #[derive(Default)]
    struct ManualSpawner {
        tasks: StdMutex<Vec<Boxed<()>>>,
    }

    impl Spawner for ManualSpawner {
        fn spawn(&self, future: Boxed<()>) {
            self.tasks.lock().unwrap().push(future);
        }
    }

    impl ManualSpawner {
        /// Polls every task once; finished tasks are dropped.
        fn run_once(&self) -> usize {
            let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
            let mut pending = Vec::new();
            for mut task in tasks {
                if block_on(futures_lite::future::poll_once(&mut task)).is_none() {
                    pending.push(task);
                }
            }
            let left = pending.len();
            self.tasks.lock().unwrap().extend(pending);
            left
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl ReconnectListener for Recorder {
        fn on_reconnecting(&self, _device: &DeviceId, attempt: u32, _delay: Duration) {
            self.events.lock().unwrap().push(format!("attempt {attempt}"));
        }
        fn on_reconnected(&self, _device: &DeviceId) {
            self.events.lock().unwrap().push("reconnected".into());
        }
        fn on_reconnect_failed(&self, _device: &DeviceId, error: &Error) {
            self.events.lock().unwrap().push(format!("failed {:?}", error.kind()));
        }
    }

    fn lost(device: &str, unexpected: bool) -> LinkLostEvent {
        LinkLostEvent {
            device: DeviceId::new(device),
            error: unexpected.then(|| Error::new(ErrorKind::LinkLost, None, "supervision timeout")),
        }
    }

    struct Fixture {
        spawner: Arc<ManualSpawner>,
        manager: ReconnectionManager,
        connector: Arc<ScriptedConnector>,
        recorder: Arc<Recorder>,
        sender: async_broadcast::Sender<LinkLostEvent>,
        _keeper: async_broadcast::InactiveReceiver<LinkLostEvent>,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let spawner = Arc::new(ManualSpawner::default());
        let manager = ReconnectionManager::new(spawner.clone());
        let connector = Arc::new(ScriptedConnector::default());
        let recorder = Arc::new(Recorder::default());
        let (mut sender, receiver) = async_broadcast::broadcast(8);
        sender.set_overflow(true);
        let keeper = receiver.clone().deactivate();
        manager.enable(
            DeviceId::new("AA"),
            fast_policy(max_retries),
            recorder.clone(),
            connector.clone(),
            receiver,
        );
        Fixture {
            spawner,
            manager,
            connector,
            recorder,
            sender,
            _keeper: keeper,
        }
    }

    /// Drives spawned tasks until they all finish or the deadline passes.
    fn settle(spawner: &ManualSpawner, keep: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while spawner.run_once() > keep && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn unexpected_loss_reconnects_with_backoff() {
        let fx = fixture(5);
        fx.connector.script("AA", vec![failure(), Ok(())]);
        fx.spawner.run_once();
        fx.sender.try_broadcast(lost("AA", true)).unwrap();
        fx.spawner.run_once();
        assert!(fx.manager.is_reconnecting(&DeviceId::new("AA")));
        // only the watcher should be left
        settle(&fx.spawner, 1);
        assert!(!fx.manager.is_reconnecting(&DeviceId::new("AA")));
        assert_eq!(fx.manager.retry_count(&DeviceId::new("AA")), Some(0));
        assert_eq!(fx.connector.calls().len(), 2);
        assert_eq!(
            *fx.recorder.events.lock().unwrap(),
            ["attempt 1", "attempt 2", "reconnected"]
        );
    }

    #[test]
    fn explicit_disconnect_does_not_reconnect() {
        let fx = fixture(5);
        fx.spawner.run_once();
        fx.sender.try_broadcast(lost("AA", false)).unwrap();
        fx.sender.try_broadcast(lost("BB", true)).unwrap();
        settle(&fx.spawner, 1);
        assert!(!fx.manager.is_reconnecting(&DeviceId::new("AA")));
        assert!(fx.connector.calls().is_empty());
    }

    #[test]
    fn stopped_cycle_makes_no_more_attempts() {
        let fx = fixture(5);
        fx.spawner.run_once();
        fx.sender.try_broadcast(lost("AA", true)).unwrap();
        fx.spawner.run_once();
        assert!(fx.manager.stop_cycle(&DeviceId::new("AA")));
        assert!(!fx.manager.stop_cycle(&DeviceId::new("AA")));
        settle(&fx.spawner, 1);
        assert!(fx.connector.calls().is_empty());
        assert!(!fx.manager.is_reconnecting(&DeviceId::new("AA")));
        assert!(fx.manager.is_enabled(&DeviceId::new("AA")));
    }

    /// Connector whose attempts complete only when the test opens the gate.
    struct GatedConnector {
        gate: async_channel::Receiver<Result<()>>,
        calls: StdMutex<u32>,
        disconnects: StdMutex<u32>,
    }

    impl Connector for GatedConnector {
        fn connect(&self, _device: DeviceId) -> Boxed<Result<()>> {
            *self.calls.lock().unwrap() += 1;
            let gate = self.gate.clone();
            async move { gate.recv().await.unwrap_or_else(|_| failure()) }.boxed()
        }

        fn disconnect(&self, _device: DeviceId) -> Boxed<Result<()>> {
            *self.disconnects.lock().unwrap() += 1;
            async { Ok(()) }.boxed()
        }

        fn is_connected(&self, _device: &DeviceId) -> bool {
            false
        }
    }

    #[test]
    fn connection_made_after_stop_is_torn_down() {
        let spawner = Arc::new(ManualSpawner::default());
        let manager = ReconnectionManager::new(spawner.clone());
        let (open, gate) = async_channel::unbounded();
        let connector = Arc::new(GatedConnector {
            gate,
            calls: StdMutex::new(0),
            disconnects: StdMutex::new(0),
        });
        let (mut sender, receiver) = async_broadcast::broadcast(8);
        sender.set_overflow(true);
        let dev = DeviceId::new("AA");
        manager.enable(dev.clone(), fast_policy(5), Arc::new(()), connector.clone(), receiver);
        spawner.run_once();
        sender.try_broadcast(lost("AA", true)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while *connector.calls.lock().unwrap() == 0 && std::time::Instant::now() < deadline {
            spawner.run_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(manager.stop_cycle(&dev));
        open.try_send(Ok(())).unwrap();
        settle(&spawner, 1);

        assert_eq!(*connector.calls.lock().unwrap(), 1);
        assert_eq!(*connector.disconnects.lock().unwrap(), 1);
        assert!(!manager.is_reconnecting(&dev));
    }

    #[test]
    fn exhausted_cycle_reports_failure() {
        let fx = fixture(2);
        fx.connector.script("AA", vec![failure(), failure(), Ok(())]);
        fx.spawner.run_once();
        fx.sender.try_broadcast(lost("AA", true)).unwrap();
        settle(&fx.spawner, 1);
        assert_eq!(fx.connector.calls().len(), 2);
        assert!(!fx.manager.is_reconnecting(&DeviceId::new("AA")));
        assert_eq!(
            *fx.recorder.events.lock().unwrap(),
            ["attempt 1", "attempt 2", "failed RetryExhausted"]
        );
    }

    #[test]
    fn adapter_outage_does_not_use_up_retries() {
        let fx = fixture(1);
        let unavailable = || -> Result<()> {
            Err(Error::new(ErrorKind::AdapterUnavailable, None, "adapter powered off"))
        };
        fx.connector.script("AA", vec![unavailable(), unavailable(), Ok(())]);
        fx.spawner.run_once();
        fx.sender.try_broadcast(lost("AA", true)).unwrap();
        settle(&fx.spawner, 1);
        assert_eq!(fx.connector.calls().len(), 3);
        assert_eq!(
            *fx.recorder.events.lock().unwrap(),
            ["attempt 1", "attempt 1", "attempt 1", "reconnected"]
        );
    }

    #[test]
    fn disable_stops_watcher_and_is_idempotent() {
        let fx = fixture(5);
        fx.spawner.run_once();
        assert!(fx.manager.disable(&DeviceId::new("AA")));
        assert!(!fx.manager.disable(&DeviceId::new("AA")));
        settle(&fx.spawner, 0);
        assert_eq!(fx.spawner.run_once(), 0);
        let _ = fx.sender.try_broadcast(lost("AA", true));
        assert!(fx.connector.calls().is_empty());
    }

    #[test]
    fn manual_reconnect_skips_the_delay() {
        let fx = fixture(5);
        fx.connector.script("AA", vec![Ok(())]);
        let connector: Arc<dyn Connector> = fx.connector.clone();
        block_on(fx.manager.manual_reconnect(&DeviceId::new("AA"), connector)).unwrap();
        assert_eq!(fx.connector.calls().len(), 1);
        assert_eq!(*fx.recorder.events.lock().unwrap(), ["reconnected"]);

        let connector: Arc<dyn Connector> = fx.connector.clone();
        let err = block_on(fx.manager.manual_reconnect(&DeviceId::new("BB"), connector)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
