use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use super::buffer::BufferItem;
use super::error::ErrorKind;
use super::Result;

/// Identifies a remote device, as reported by the platform adapter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub(crate) String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Small integer standing in for a native attribute handle (service, characteristic
/// or descriptor) of one link. Only valid until that link is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttributeId(u32);

impl AttributeId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a buffer in the buffer store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferId(pub(crate) u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}

/// The entity an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubjectId {
    /// The local adapter itself (scanning, power state).
    Adapter,
    Device(DeviceId),
    /// A service, characteristic or descriptor on a connected device.
    Attribute(DeviceId, AttributeId),
    /// A parked drain waits on this buffer.
    Buffer(BufferId),
}

impl SubjectId {
    /// The device this subject lives on, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Device(dev_id) | Self::Attribute(dev_id, _) => Some(dev_id),
            Self::Adapter | Self::Buffer(_) => None,
        }
    }

    /// Checks if the subject is the device itself or one of its attributes.
    pub fn belongs_to(&self, dev_id: &DeviceId) -> bool {
        self.device() == Some(dev_id)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adapter => f.write_str("adapter"),
            Self::Device(dev_id) => write!(f, "device {dev_id}"),
            Self::Attribute(dev_id, attr) => write!(f, "attribute {attr} of device {dev_id}"),
            Self::Buffer(buf_id) => write!(f, "{buf_id}"),
        }
    }
}

/// Kind of a pending operation; the request table is keyed by `(SubjectId, OpKind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OpKind {
    Connect,
    Disconnect,
    DiscoverServices,
    Read,
    Write,
    ReadRssi,
    RequestMtu,
    /// Hardware toggle of value notifications; never registered by callers directly.
    SetNotify,
    /// Caller waiting for a notification buffer. Many may wait at once.
    Monitor,
    /// Caller parked on a buffer until enough items arrive.
    Drain,
}

impl OpKind {
    /// Fan-out kinds merge concurrent callers into one waiter set instead of
    /// rejecting the second one.
    pub fn is_fan_out(self) -> bool {
        matches!(self, Self::Monitor)
    }

    /// Operations that occupy the link and go through its operation queue.
    pub fn is_link_operation(self) -> bool {
        matches!(
            self,
            Self::Disconnect
                | Self::DiscoverServices
                | Self::Read
                | Self::Write
                | Self::ReadRssi
                | Self::RequestMtu
                | Self::SetNotify
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::DiscoverServices => "service discovery",
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadRssi => "RSSI read",
            Self::RequestMtu => "MTU request",
            Self::SetNotify => "notification toggle",
            Self::Monitor => "monitor",
            Self::Drain => "drain",
        };
        f.write_str(name)
    }
}

/// An operation handed to the platform adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    Connect { auto_connect: bool },
    Disconnect,
    DiscoverServices,
    Read(AttributeId),
    Write {
        attribute: AttributeId,
        value: Vec<u8>,
        with_response: bool,
    },
    ReadRssi,
    RequestMtu(u16),
    SetNotify { attribute: AttributeId, enable: bool },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Connect { .. } => OpKind::Connect,
            Self::Disconnect => OpKind::Disconnect,
            Self::DiscoverServices => OpKind::DiscoverServices,
            Self::Read(_) => OpKind::Read,
            Self::Write { .. } => OpKind::Write,
            Self::ReadRssi => OpKind::ReadRssi,
            Self::RequestMtu(_) => OpKind::RequestMtu,
            Self::SetNotify { .. } => OpKind::SetNotify,
        }
    }

    /// The attribute this operation works on, if it is not device-wide.
    pub fn attribute(&self) -> Option<AttributeId> {
        match self {
            Self::Read(attr) => Some(*attr),
            Self::Write { attribute, .. } | Self::SetNotify { attribute, .. } => Some(*attribute),
            _ => None,
        }
    }

    /// The request-table subject of this operation on `dev_id`.
    pub fn subject(&self, dev_id: &DeviceId) -> SubjectId {
        match self.attribute() {
            Some(attr) => SubjectId::Attribute(dev_id.clone(), attr),
            None => SubjectId::Device(dev_id.clone()),
        }
    }
}

/// Successful result of a settled operation.
#[derive(Debug, Clone)]
pub enum Response {
    Done,
    Value(Vec<u8>),
    Rssi(i16),
    Mtu(u16),
    Buffer(BufferId),
    Items(Vec<BufferItem>),
}

impl Response {
    fn mismatch(&self, expected: &str) -> crate::Error {
        crate::Error::new(
            ErrorKind::Internal,
            None,
            format!("expected {expected} in the completion, got {self:?}"),
        )
    }

    pub fn into_done(self) -> Result<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(other.mismatch("no value")),
        }
    }

    pub fn into_value(self) -> Result<Vec<u8>> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(other.mismatch("a value")),
        }
    }

    pub fn into_rssi(self) -> Result<i16> {
        match self {
            Self::Rssi(rssi) => Ok(rssi),
            other => Err(other.mismatch("an RSSI")),
        }
    }

    pub fn into_mtu(self) -> Result<u16> {
        match self {
            Self::Mtu(mtu) => Ok(mtu),
            other => Err(other.mismatch("an MTU")),
        }
    }

    pub fn into_buffer(self) -> Result<BufferId> {
        match self {
            Self::Buffer(buf_id) => Ok(buf_id),
            other => Err(other.mismatch("a buffer")),
        }
    }

    pub fn into_items(self) -> Result<Vec<BufferItem>> {
        match self {
            Self::Items(items) => Ok(items),
            other => Err(other.mismatch("buffered items")),
        }
    }
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanRecord {
    pub device: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub is_connectable: Option<bool>,
}

impl ScanRecord {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            name: None,
            rssi: None,
            service_uuids: Vec::new(),
            manufacturer_data: HashMap::new(),
            is_connectable: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// The possible states of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Devices the platform handed back when it restored the application's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestoredState {
    pub connected: Vec<DeviceId>,
    pub scan_services: Vec<Uuid>,
}
