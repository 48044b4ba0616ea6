//! Process-wide single-flight queue of connection attempts.
//!
//! However many devices are queued, only one attempt is active at a time. A
//! failed attempt is retried with bounded exponential backoff (see
//! [`RetryPolicy`]) before the queue moves on. Every continuation (attempt
//! finished, backoff timer fired) re-checks whether the entry was cancelled in
//! the meantime before it touches shared state.

use std::collections::VecDeque;

use async_lock::Mutex;
use futures_lite::future::Boxed;
use futures_lite::FutureExt;
use futures_timer::Delay;
use log::{debug, info, warn};

use crate::error::{Error, ErrorKind};
use crate::retry::RetryPolicy;
use crate::types::{DeviceId, SubjectId};
use crate::util::defer;
use crate::Result;

/// The connect/disconnect entry points the retry machinery drives.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, device: DeviceId) -> Boxed<Result<()>>;
    fn disconnect(&self, device: DeviceId) -> Boxed<Result<()>>;
    fn is_connected(&self, device: &DeviceId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// The entry became the active attempt.
    Turn,
    Cancelled,
}

#[derive(Debug)]
struct Attempt {
    id: u64,
    device: DeviceId,
    retry_count: u32,
    signal: async_channel::Sender<Signal>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    entries: VecDeque<Attempt>,
    active: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ConnectionQueue {
    state: Mutex<QueueState>,
}

fn cancelled(device: &DeviceId) -> Error {
    Error::new(
        ErrorKind::OperationCancelled,
        None,
        "connection attempt cancelled",
    )
    .with_subject(SubjectId::Device(device.clone()))
}

impl ConnectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a connection attempt for `device` and resolves once it succeeded,
    /// ran out of retries, or was cancelled.
    ///
    /// Fails immediately with `DuplicateOperation` if `device` is already queued.
    /// Dropping the returned future cancels the attempt.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        device: DeviceId,
        policy: RetryPolicy,
    ) -> Result<()> {
        let (id, signals) = self.enqueue(&device)?;
        let _guard = defer(|| self.finish(id));
        self.pump();

        match signals.recv().await {
            // the turn may have been handed over just before a cancel
            Ok(Signal::Turn) if self.is_current(id) => (),
            _ => return Err(cancelled(&device)),
        }
        info!("connecting to {device}");

        loop {
            let attempt = connector.connect(device.clone());
            let outcome = async { Some(attempt.await) }
                .or(async {
                    let _ = signals.recv().await;
                    None
                })
                .await;
            // a cancel may have landed while the attempt was in flight
            let Some(outcome) = outcome.filter(|_| self.is_current(id)) else {
                debug!("attempt for {device} cancelled while in flight, disconnecting");
                let _ = connector.disconnect(device.clone()).await;
                return Err(cancelled(&device));
            };
            let err = match outcome {
                Ok(()) => {
                    info!("connected to {device}");
                    return Ok(());
                }
                Err(e) => e,
            };

            let Some(retry_count) = self.bump_retry(id) else {
                return Err(cancelled(&device));
            };
            if policy.is_exhausted(retry_count) {
                warn!("giving up on {device} after {retry_count} attempt(s): {err}");
                return Err(Error::new(
                    ErrorKind::RetryExhausted,
                    err.hardware_error().cloned(),
                    format!("{retry_count} connection attempt(s) failed, last error: {err}"),
                )
                .with_subject(SubjectId::Device(device)));
            }
            let delay = policy.delay_for(retry_count);
            debug!("attempt {retry_count} for {device} failed ({err}), retrying in {delay:?}");
            let interrupted = async {
                Delay::new(delay).await;
                false
            }
            .or(async {
                let _ = signals.recv().await;
                true
            })
            .await;
            if interrupted || !self.is_current(id) {
                return Err(cancelled(&device));
            }
        }
    }

    /// Cancels the queued or active attempt for `device`. The waiter fails with
    /// `OperationCancelled`; an active attempt frees the queue for the next entry
    /// right away and disconnects on a best-effort basis.
    pub fn cancel(&self, device: &DeviceId) -> bool {
        let mut state = self.state.lock_blocking();
        let Some(pos) = state.entries.iter().position(|a| &a.device == device) else {
            return false;
        };
        let Some(attempt) = state.entries.remove(pos) else {
            return false;
        };
        let _ = attempt.signal.try_send(Signal::Cancelled);
        if state.active == Some(attempt.id) {
            state.active = None;
        }
        drop(state);
        info!("cancelled connection attempt for {device}");
        self.pump();
        true
    }

    /// Cancels every queued attempt.
    pub fn cancel_all(&self) {
        let devices: Vec<DeviceId> = self
            .state
            .lock_blocking()
            .entries
            .iter()
            .map(|a| a.device.clone())
            .collect();
        for device in devices {
            self.cancel(&device);
        }
    }

    /// Number of queued attempts, the active one included.
    pub fn len(&self) -> usize {
        self.state.lock_blocking().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_queued(&self, device: &DeviceId) -> bool {
        self.state
            .lock_blocking()
            .entries
            .iter()
            .any(|a| &a.device == device)
    }

    /// The device whose attempt is currently running.
    pub fn active(&self) -> Option<DeviceId> {
        let state = self.state.lock_blocking();
        let active = state.active?;
        state
            .entries
            .iter()
            .find(|a| a.id == active)
            .map(|a| a.device.clone())
    }

    pub fn retry_count(&self, device: &DeviceId) -> Option<u32> {
        self.state
            .lock_blocking()
            .entries
            .iter()
            .find(|a| &a.device == device)
            .map(|a| a.retry_count)
    }

    fn enqueue(&self, device: &DeviceId) -> Result<(u64, async_channel::Receiver<Signal>)> {
        let mut state = self.state.lock_blocking();
        if state.entries.iter().any(|a| &a.device == device) {
            return Err(Error::duplicate(
                &SubjectId::Device(device.clone()),
                "connection attempt",
            ));
        }
        state.next_id += 1;
        let id = state.next_id;
        let (signal, signals) = async_channel::bounded(2);
        state.entries.push_back(Attempt {
            id,
            device: device.clone(),
            retry_count: 0,
            signal,
        });
        debug!("queued connection attempt for {device} ({} queued)", state.entries.len());
        Ok((id, signals))
    }

    /// Hands the turn to the first waiting entry if nothing is active.
    fn pump(&self) {
        let mut state = self.state.lock_blocking();
        while state.active.is_none() {
            let Some(next) = state.entries.front() else {
                break;
            };
            let id = next.id;
            if next.signal.try_send(Signal::Turn).is_ok() {
                state.active = Some(id);
            } else {
                // waiter vanished without running its guard
                let _ = state.entries.pop_front();
            }
        }
    }

    /// Removes the entry once its `connect` call returns or is dropped.
    fn finish(&self, id: u64) {
        let mut state = self.state.lock_blocking();
        state.entries.retain(|a| a.id != id);
        if state.active == Some(id) {
            state.active = None;
        }
        drop(state);
        self.pump();
    }

    fn is_current(&self, id: u64) -> bool {
        self.state.lock_blocking().active == Some(id)
    }

    fn bump_retry(&self, id: u64) -> Option<u32> {
        let mut state = self.state.lock_blocking();
        if state.active != Some(id) {
            return None;
        }
        let attempt = state.entries.iter_mut().find(|a| a.id == id)?;
        attempt.retry_count += 1;
        Some(attempt.retry_count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_lite::future::{block_on, poll_once};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Connector answering from a per-device script; an empty script never completes.
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        pub scripts: StdMutex<HashMap<DeviceId, VecDeque<Result<()>>>>,
        pub calls: StdMutex<Vec<DeviceId>>,
        pub disconnects: StdMutex<Vec<DeviceId>>,
        pub connected: StdMutex<Vec<DeviceId>>,
    }

    impl ScriptedConnector {
        pub fn script(&self, device: &str, results: Vec<Result<()>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(DeviceId::new(device), results.into());
        }

        pub fn calls(&self) -> Vec<DeviceId> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, device: DeviceId) -> Boxed<Result<()>> {
            self.calls.lock().unwrap().push(device.clone());
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&device)
                .and_then(|s| s.pop_front());
            match next {
                Some(result) => {
                    if result.is_ok() {
                        self.connected.lock().unwrap().push(device);
                    }
                    async move { result }.boxed()
                }
                None => futures_lite::future::pending().boxed(),
            }
        }

        fn disconnect(&self, device: DeviceId) -> Boxed<Result<()>> {
            self.disconnects.lock().unwrap().push(device);
            async { Ok(()) }.boxed()
        }

        fn is_connected(&self, device: &DeviceId) -> bool {
            self.connected.lock().unwrap().contains(device)
        }
    }

    pub(crate) fn failure() -> Result<()> {
        Err(Error::new(ErrorKind::LinkOperationFailed, None, "status 133"))
    }

    pub(crate) fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::connection()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(2))
            .with_max_delay(Duration::from_millis(8))
    }

    #[test]
    fn succeeds_after_retries() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        conn.script("AA", vec![failure(), failure(), Ok(())]);
        let res = block_on(queue.connect(&conn, DeviceId::new("AA"), fast_policy(3)));
        assert!(res.is_ok());
        assert_eq!(conn.calls().len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn gives_up_when_retries_are_exhausted() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        conn.script("AA", vec![failure(), failure(), failure(), Ok(())]);
        let err = block_on(queue.connect(&conn, DeviceId::new("AA"), fast_policy(3))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(conn.calls().len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn second_request_for_same_device_is_rejected() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        block_on(async {
            let mut first = Box::pin(queue.connect(&conn, DeviceId::new("AA"), fast_policy(3)));
            assert!(poll_once(&mut first).await.is_none());
            let err = queue
                .connect(&conn, DeviceId::new("AA"), fast_policy(3))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DuplicateOperation);
            assert_eq!(conn.calls().len(), 1);
        });
    }

    #[test]
    fn only_one_attempt_is_active_and_cancel_frees_the_queue() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        conn.script("BB", vec![Ok(())]);
        block_on(async {
            let mut a = Box::pin(queue.connect(&conn, DeviceId::new("AA"), fast_policy(3)));
            let mut b = Box::pin(queue.connect(&conn, DeviceId::new("BB"), fast_policy(3)));
            assert!(poll_once(&mut a).await.is_none());
            assert!(poll_once(&mut b).await.is_none());
            assert_eq!(conn.calls(), vec![DeviceId::new("AA")]);
            assert_eq!(queue.active(), Some(DeviceId::new("AA")));
            assert_eq!(queue.len(), 2);

            assert!(queue.cancel(&DeviceId::new("AA")));
            assert_eq!(queue.active(), Some(DeviceId::new("BB")));
            let err = a.await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::OperationCancelled);
            assert_eq!(*conn.disconnects.lock().unwrap(), vec![DeviceId::new("AA")]);

            b.await.unwrap();
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn cancelling_a_waiting_entry_rejects_it() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        block_on(async {
            let mut a = Box::pin(queue.connect(&conn, DeviceId::new("AA"), fast_policy(3)));
            let mut b = Box::pin(queue.connect(&conn, DeviceId::new("BB"), fast_policy(3)));
            assert!(poll_once(&mut a).await.is_none());
            assert!(poll_once(&mut b).await.is_none());
            queue.cancel_all();
            assert_eq!(b.await.unwrap_err().kind(), ErrorKind::OperationCancelled);
            assert_eq!(a.await.unwrap_err().kind(), ErrorKind::OperationCancelled);
            // the waiting entry never reached the connector
            assert_eq!(conn.calls(), vec![DeviceId::new("AA")]);
        });
    }

    #[test]
    fn cancel_during_backoff_stops_retrying() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        conn.script("AA", vec![failure(), Ok(())]);
        let policy = fast_policy(3).with_initial_delay(Duration::from_secs(30));
        block_on(async {
            let mut a = Box::pin(queue.connect(&conn, DeviceId::new("AA"), policy));
            assert!(poll_once(&mut a).await.is_none());
            assert_eq!(queue.retry_count(&DeviceId::new("AA")), Some(1));
            queue.cancel(&DeviceId::new("AA"));
            assert_eq!(a.await.unwrap_err().kind(), ErrorKind::OperationCancelled);
            assert_eq!(conn.calls().len(), 1);
        });
    }

    #[test]
    fn dropping_the_future_advances_the_queue() {
        let queue = ConnectionQueue::new();
        let conn = ScriptedConnector::default();
        conn.script("BB", vec![Ok(())]);
        block_on(async {
            let mut a = Box::pin(queue.connect(&conn, DeviceId::new("AA"), fast_policy(3)));
            let mut b = Box::pin(queue.connect(&conn, DeviceId::new("BB"), fast_policy(3)));
            assert!(poll_once(&mut a).await.is_none());
            assert!(poll_once(&mut b).await.is_none());
            drop(a);
            assert_eq!(queue.active(), Some(DeviceId::new("BB")));
            b.await.unwrap();
        });
    }
}
