//! Pull-based buffers fed by continuous hardware event streams.
//!
//! Every buffer belongs to one [`BufferKind`] and optionally to one subject.
//! Appends fan out to every matching buffer; consumers drain them with a
//! [`DrainStrategy`]. Once a buffer is invalidated (link lost, adapter powered
//! off) it stays poisoned: every later drain returns the stored reason even if
//! items remain.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use crate::error::{Error, ErrorKind};
use crate::types::{
    AdapterState, BufferId, ConnectionState, DeviceId, RestoredState, ScanRecord, SubjectId,
};

/// Logical event stream a buffer exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferKind {
    Scan,
    CharacteristicValue,
    ConnectionState,
    Mtu,
    Disconnect,
    NameChange,
    AdapterState,
    /// Receives at most one item, the snapshot handed back by state restoration.
    StateRestoration,
}

impl BufferKind {
    /// Singleton kinds allow one live buffer per `(kind, subject)`; creating another
    /// returns the existing one.
    pub fn is_singleton(self) -> bool {
        !matches!(self, Self::CharacteristicValue)
    }

    pub fn is_one_shot(self) -> bool {
        matches!(self, Self::StateRestoration)
    }
}

/// One buffered event.
#[derive(Debug, Clone)]
pub enum BufferItem {
    Scan(ScanRecord),
    Value(Vec<u8>),
    ConnectionState(DeviceId, ConnectionState),
    Mtu(DeviceId, u16),
    Disconnected {
        device: DeviceId,
        error: Option<Error>,
    },
    NameChanged {
        device: DeviceId,
        name: Option<String>,
    },
    AdapterState(AdapterState),
    Restored(RestoredState),
}

impl BufferItem {
    pub fn kind(&self) -> BufferKind {
        match self {
            Self::Scan(_) => BufferKind::Scan,
            Self::Value(_) => BufferKind::CharacteristicValue,
            Self::ConnectionState(..) => BufferKind::ConnectionState,
            Self::Mtu(..) => BufferKind::Mtu,
            Self::Disconnected { .. } => BufferKind::Disconnect,
            Self::NameChanged { .. } => BufferKind::NameChange,
            Self::AdapterState(_) => BufferKind::AdapterState,
            Self::Restored(_) => BufferKind::StateRestoration,
        }
    }

    pub fn as_value(&self) -> Option<&[u8]> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DrainMode {
    /// Removes the drained items.
    Take,
    /// Leaves the buffer untouched.
    Peek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DrainOrder {
    /// Reads from the tail (most recent items).
    Latest,
    /// Reads from the head (earliest items).
    Oldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChunkSize {
    Count(usize),
    /// Everything currently buffered (at least one item).
    All,
}

/// How a drain picks items from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DrainStrategy {
    pub mode: DrainMode,
    pub order: DrainOrder,
    pub chunk: ChunkSize,
}

impl DrainStrategy {
    pub const fn new(mode: DrainMode, order: DrainOrder, chunk: ChunkSize) -> Self {
        Self { mode, order, chunk }
    }

    pub const fn take_oldest(count: usize) -> Self {
        Self::new(DrainMode::Take, DrainOrder::Oldest, ChunkSize::Count(count))
    }

    pub const fn take_latest(count: usize) -> Self {
        Self::new(DrainMode::Take, DrainOrder::Latest, ChunkSize::Count(count))
    }

    pub const fn peek_latest(count: usize) -> Self {
        Self::new(DrainMode::Peek, DrainOrder::Latest, ChunkSize::Count(count))
    }

    pub const fn take_all() -> Self {
        Self::new(DrainMode::Take, DrainOrder::Oldest, ChunkSize::All)
    }
}

impl Default for DrainStrategy {
    fn default() -> Self {
        Self::take_oldest(1)
    }
}

/// Result of a drain that did not fail.
#[derive(Debug, Clone)]
pub enum Drained {
    /// Drained items, always in arrival order.
    Items(Vec<BufferItem>),
    /// Fewer items than requested are buffered; the caller should park.
    Insufficient { available: usize },
}

/// Which subjects an invalidation hits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectFilter {
    Any,
    /// The device itself and all of its attributes.
    Device(DeviceId),
}

impl SubjectFilter {
    fn matches(&self, subject: Option<&SubjectId>) -> bool {
        match self {
            Self::Any => true,
            Self::Device(dev_id) => subject.is_some_and(|s| s.belongs_to(dev_id)),
        }
    }
}

/// Sent back by [`BufferStore::destroy`] when the last live buffer of a
/// `(kind, subject)` pair is gone, so the owner can release the hardware
/// subscription behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub kind: BufferKind,
    pub subject: Option<SubjectId>,
}

#[derive(Debug)]
struct Buffer {
    kind: BufferKind,
    subject: Option<SubjectId>,
    items: VecDeque<BufferItem>,
    invalidated: Option<Error>,
    received_any: bool,
}

impl Buffer {
    fn is_live(&self) -> bool {
        self.invalidated.is_none()
    }

    fn accepts(&self, kind: BufferKind, subject: Option<&SubjectId>) -> bool {
        if self.kind != kind || !self.is_live() {
            return false;
        }
        if self.kind.is_one_shot() && self.received_any {
            return false;
        }
        // unscoped on either side matches every buffer of the kind
        match (&self.subject, subject) {
            (Some(own), Some(subject)) => own == subject,
            _ => true,
        }
    }

    fn select(&mut self, strategy: DrainStrategy, count: usize) -> Vec<BufferItem> {
        let len = self.items.len();
        let count = count.min(len);
        let range = match strategy.order {
            DrainOrder::Oldest => 0..count,
            DrainOrder::Latest => len - count..len,
        };
        match strategy.mode {
            DrainMode::Take => self.items.drain(range).collect(),
            DrainMode::Peek => self.items.range(range).cloned().collect(),
        }
    }
}

/// Owns every buffer. Not synchronized by itself; the coordinator keeps it
/// under its state lock.
#[derive(Debug)]
pub struct BufferStore {
    next_id: u64,
    buffers: BTreeMap<BufferId, Buffer>,
    capacity: Option<usize>,
}

impl BufferStore {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            buffers: BTreeMap::new(),
            capacity: None,
        }
    }

    /// Caps every buffer at `capacity` items; the oldest ones are dropped on overflow.
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.map(|c| c.max(1)),
            ..Self::new()
        }
    }

    /// Creates a buffer, or returns the live one of a singleton kind that already
    /// exists for the same subject.
    pub fn create(&mut self, kind: BufferKind, subject: Option<SubjectId>) -> BufferId {
        if kind.is_singleton() {
            if let Some(existing) = self.find_live(kind, subject.as_ref()) {
                return existing;
            }
        }
        let id = BufferId(self.next_id);
        self.next_id += 1;
        debug!("created {id} of kind {kind:?} for {subject:?}");
        self.buffers.insert(
            id,
            Buffer {
                kind,
                subject,
                items: VecDeque::new(),
                invalidated: None,
                received_any: false,
            },
        );
        id
    }

    /// The first live buffer of exactly this `(kind, subject)`.
    pub fn find_live(&self, kind: BufferKind, subject: Option<&SubjectId>) -> Option<BufferId> {
        self.buffers
            .iter()
            .find(|(_, buf)| buf.kind == kind && buf.subject.as_ref() == subject && buf.is_live())
            .map(|(&id, _)| id)
    }

    /// Every buffer (live or not) of this `(kind, subject)`.
    pub fn ids_of(&self, kind: BufferKind, subject: Option<&SubjectId>) -> Vec<BufferId> {
        self.buffers
            .iter()
            .filter(|(_, buf)| buf.kind == kind && buf.subject.as_ref() == subject)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Appends `item` to every matching buffer and returns the ones that changed.
    pub fn append(&mut self, subject: Option<&SubjectId>, item: BufferItem) -> Vec<BufferId> {
        let kind = item.kind();
        let capacity = self.capacity;
        let mut changed = Vec::new();
        for (&id, buf) in self.buffers.iter_mut() {
            if !buf.accepts(kind, subject) {
                continue;
            }
            buf.items.push_back(item.clone());
            buf.received_any = true;
            if let Some(cap) = capacity {
                while buf.items.len() > cap {
                    let _ = buf.items.pop_front();
                }
            }
            changed.push(id);
        }
        changed
    }

    /// Drains according to `strategy`. Fails with the stored reason if the buffer
    /// was invalidated, and with `NotFound` if it does not exist.
    pub fn drain(&mut self, id: BufferId, strategy: DrainStrategy) -> Result<Drained, Error> {
        let buf = self.get_mut(id)?;
        if let Some(reason) = &buf.invalidated {
            return Err(reason.clone());
        }
        let available = buf.items.len();
        let wanted = match strategy.chunk {
            ChunkSize::Count(0) => {
                return Err(Error::new(
                    ErrorKind::InvalidParameter,
                    None,
                    "chunk size must be at least 1",
                ))
            }
            ChunkSize::Count(n) => n,
            ChunkSize::All => available,
        };
        if available == 0 || available < wanted {
            return Ok(Drained::Insufficient { available });
        }
        Ok(Drained::Items(buf.select(strategy, wanted)))
    }

    /// Like [`BufferStore::drain`], but hands out whatever is there (possibly
    /// nothing) instead of reporting insufficient data.
    pub fn drain_available(
        &mut self,
        id: BufferId,
        strategy: DrainStrategy,
    ) -> Result<Vec<BufferItem>, Error> {
        let buf = self.get_mut(id)?;
        if let Some(reason) = &buf.invalidated {
            return Err(reason.clone());
        }
        let wanted = match strategy.chunk {
            ChunkSize::Count(n) => n,
            ChunkSize::All => buf.items.len(),
        };
        Ok(buf.select(strategy, wanted))
    }

    /// Poisons every live buffer matching the filters and returns them. A buffer
    /// keeps the first reason it was invalidated with.
    pub fn invalidate(
        &mut self,
        reason: &Error,
        kind: Option<BufferKind>,
        subject: &SubjectFilter,
    ) -> Vec<BufferId> {
        let mut hit = Vec::new();
        for (&id, buf) in self.buffers.iter_mut() {
            if !buf.is_live() || kind.is_some_and(|k| k != buf.kind) {
                continue;
            }
            if !subject.matches(buf.subject.as_ref()) {
                continue;
            }
            buf.invalidated = Some(reason.clone());
            hit.push(id);
        }
        if !hit.is_empty() {
            debug!("invalidated {} buffer(s): {reason}", hit.len());
        }
        hit
    }

    /// Removes the buffer. Returns `Some(Some(released))` if it was the last live
    /// buffer of its `(kind, subject)`, `Some(None)` if siblings remain, and `None`
    /// if there was no such buffer.
    pub fn destroy(&mut self, id: BufferId) -> Option<Option<Released>> {
        let buf = self.buffers.remove(&id)?;
        debug!("destroyed {id}");
        if !buf.is_live() {
            return Some(None);
        }
        let sibling = self.find_live(buf.kind, buf.subject.as_ref());
        Some(sibling.is_none().then_some(Released {
            kind: buf.kind,
            subject: buf.subject,
        }))
    }

    /// Number of items currently held by the buffer.
    pub fn len(&self, id: BufferId) -> Option<usize> {
        self.buffers.get(&id).map(|buf| buf.items.len())
    }

    pub fn is_invalidated(&self, id: BufferId) -> bool {
        self.buffers
            .get(&id)
            .is_some_and(|buf| buf.invalidated.is_some())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn get_mut(&mut self, id: BufferId) -> Result<&mut Buffer, Error> {
        self.buffers.get_mut(&id).ok_or_else(|| {
            Error::new(ErrorKind::NotFound, None, "no such buffer").with_subject(SubjectId::Buffer(id))
        })
    }
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new()
    }
}
