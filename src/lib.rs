//! Coordination core of an asynchronous BLE client.
//!
//! The native Bluetooth stack reports every outcome through callbacks. This
//! crate turns those callbacks into awaitable futures and pull-based buffers:
//! it correlates completions with their callers, runs one operation per link
//! at a time, shares notification subscriptions between consumers, serializes
//! connection attempts with retries, and reconnects after unexpected link loss.
//!
//! A platform adapter implements [`Hardware`] and reports back through the
//! [`EventSender`] obtained from [`Coordinator::event_sender`]. The crate does
//! not depend on an async runtime; background tasks go through the
//! [`Spawner`] configured in [`CoordinatorConfig`].

pub use async_util::{Spawner, ThreadSpawner};
pub use buffer::{BufferItem, BufferKind, ChunkSize, DrainMode, DrainOrder, DrainStrategy, Drained};
pub use config::CoordinatorConfig;
pub use connection_queue::{ConnectionQueue, Connector};
pub use coordinator::{Coordinator, Hardware, SubmitOptions};
pub use error::Error;
pub use event::{EventSender, HardwareEvent};
pub use link_queue::Submission;
pub use reconnect::{LinkLostEvent, ReconnectListener, ReconnectionManager};
pub use request::{CorrelationToken, TimeoutPolicy};
pub use retry::RetryPolicy;

/// Convenience alias for a result with [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub use uuid::Uuid;
pub mod error;
mod types;
pub use types::*;

mod arena;
mod async_util;
mod buffer;
mod config;
mod connection_queue;
mod coordinator;
mod event;
mod link_queue;
mod notify;
mod reconnect;
mod request;
mod retry;
mod util;
