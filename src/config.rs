use std::sync::Arc;
use std::time::Duration;

use crate::async_util::{Spawner, ThreadSpawner};

/// Settings of a [`crate::Coordinator`], fixed at construction.
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub(crate) operation_timeout: Option<Duration>,
    pub(crate) max_buffered_items: Option<usize>,
    pub(crate) link_event_capacity: usize,
    pub(crate) default_mtu: u16,
    pub(crate) spawner: Arc<dyn Spawner>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            max_buffered_items: None,
            link_event_capacity: 16,
            default_mtu: 23,
            spawner: Arc::new(ThreadSpawner),
        }
    }
}

impl std::fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("operation_timeout", &self.operation_timeout)
            .field("max_buffered_items", &self.max_buffered_items)
            .field("link_event_capacity", &self.link_event_capacity)
            .field("default_mtu", &self.default_mtu)
            .finish_non_exhaustive()
    }
}

impl CoordinatorConfig {
    /// Deadline applied to operations whose caller gives none. Drains never get
    /// one implicitly.
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Caps every buffer; the oldest items are dropped on overflow.
    pub fn max_buffered_items(mut self, max: Option<usize>) -> Self {
        self.max_buffered_items = max;
        self
    }

    /// Capacity of the link-lost broadcast feeding the reconnection watchers.
    pub fn link_event_capacity(mut self, capacity: usize) -> Self {
        self.link_event_capacity = capacity.max(1);
        self
    }

    /// MTU assumed for a fresh link until an exchange settles.
    pub fn default_mtu(mut self, mtu: u16) -> Self {
        self.default_mtu = mtu;
        self
    }

    /// Where background tasks run. Defaults to [`ThreadSpawner`].
    pub fn spawner(mut self, spawner: impl Spawner) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    pub fn get_operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    pub fn get_max_buffered_items(&self) -> Option<usize> {
        self.max_buffered_items
    }

    pub fn get_default_mtu(&self) -> u16 {
        self.default_mtu
    }
}
