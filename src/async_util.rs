use std::future::Future;
use std::time::Duration;

use futures_lite::future::Boxed;
use futures_lite::FutureExt;
use futures_timer::Delay;

/// Creates a single-use channel carrying the result of one "foreign" callback
/// to the task awaiting it.
pub fn oneshot<T: Send>() -> (ResultSink<T>, ResultWaiter<T>) {
    let (sender, receiver) = async_channel::bounded(1);
    (ResultSink { sender }, ResultWaiter { receiver })
}

/// Sending half of [`oneshot`], kept by whoever will resolve the operation.
#[derive(Debug)]
pub struct ResultSink<T> {
    sender: async_channel::Sender<T>,
}

impl<T> ResultSink<T> {
    /// Delivers the result. Returns `false` if the waiter is gone or was already resolved.
    pub fn send(self, value: T) -> bool {
        self.sender.try_send(value).is_ok()
    }
}

/// Receiving half of [`oneshot`].
#[derive(Debug)]
pub struct ResultWaiter<T> {
    receiver: async_channel::Receiver<T>,
}

impl<T> ResultWaiter<T> {
    /// Waits for the result. Returns `None` if the sink was dropped without sending.
    pub async fn recv(&self) -> Option<T> {
        self.receiver.recv().await.ok()
    }

    /// Takes the result if it is already there.
    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Runs `fut` until it completes or `timeout` elapses; `None` means the deadline won.
/// Without a timeout this simply awaits `fut`.
pub async fn with_deadline<T>(fut: impl Future<Output = T>, timeout: Option<Duration>) -> Option<T> {
    match timeout {
        Some(dur) => {
            async { Some(fut.await) }
                .or(async {
                    Delay::new(dur).await;
                    None
                })
                .await
        }
        None => Some(fut.await),
    }
}

/// Runs background futures (reconnection watchers) on behalf of the coordinator.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, future: Boxed<()>);
}

impl<F> Spawner for F
where
    F: Fn(Boxed<()>) + Send + Sync + 'static,
{
    fn spawn(&self, future: Boxed<()>) {
        self(future)
    }
}

/// Default [`Spawner`]: every task gets its own thread driven by `block_on`.
///
/// Good enough for the handful of long-lived watchers the coordinator starts;
/// applications with an executor should pass their own spawner instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, future: Boxed<()>) {
        let spawned = std::thread::Builder::new()
            .name("ble-coord-task".into())
            .spawn(move || futures_lite::future::block_on(future));
        if let Err(e) = spawned {
            log::warn!("failed to spawn background task: {e}");
        }
    }
}
