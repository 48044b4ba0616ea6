//! Shape of what platform adapters report, and the queue carrying it to the
//! coordinator.
//!
//! Adapter callbacks may fire on arbitrary threads; they only push events into
//! this queue. A single consumer ([`crate::Coordinator::run`]) applies them in
//! order, so all coordination state is mutated from one place.

use crate::buffer::BufferItem;
use crate::error::HardwareError;
use crate::types::{AdapterState, DeviceId, OpKind, Response, SubjectId};

#[derive(Debug, Clone)]
pub enum HardwareEvent {
    /// Completion of a previously submitted operation.
    OperationSettled {
        subject: SubjectId,
        kind: OpKind,
        result: Result<Response, HardwareError>,
    },
    /// One item of a continuous stream (advertisement, notification, MTU change...).
    /// `subject: None` reaches every buffer of the item's kind.
    Continuous {
        subject: Option<SubjectId>,
        item: BufferItem,
    },
    /// The link to `device` went down; `error` is `None` for an explicit disconnect.
    LinkLost {
        device: DeviceId,
        error: Option<HardwareError>,
    },
    AdapterStateChanged(AdapterState),
}

/// Clonable handle through which an adapter feeds the coordinator.
#[derive(Debug, Clone)]
pub struct EventSender {
    pub(crate) sender: async_channel::Sender<HardwareEvent>,
}

impl EventSender {
    /// Queues `event`. Returns `false` if the coordinator is gone.
    pub fn send(&self, event: HardwareEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    pub fn on_operation_settled(
        &self,
        subject: SubjectId,
        kind: OpKind,
        result: Result<Response, HardwareError>,
    ) -> bool {
        self.send(HardwareEvent::OperationSettled {
            subject,
            kind,
            result,
        })
    }

    pub fn on_continuous_event(&self, subject: Option<SubjectId>, item: BufferItem) -> bool {
        self.send(HardwareEvent::Continuous { subject, item })
    }

    pub fn on_link_lost(&self, device: DeviceId, error: Option<HardwareError>) -> bool {
        self.send(HardwareEvent::LinkLost { device, error })
    }

    pub fn on_adapter_state_changed(&self, state: AdapterState) -> bool {
        self.send(HardwareEvent::AdapterStateChanged(state))
    }

    /// Number of events waiting for the consumer.
    pub fn backlog(&self) -> usize {
        self.sender.len()
    }
}
