//! Per-link FIFO of hardware operations.
//!
//! A GATT link accepts one outstanding operation at a time; issuing a second
//! one before the first callback corrupts the stack's state. The queue keeps at
//! most one item active (submitted, awaiting its callback). A synchronous
//! rejection pops the head right away and moves on; an accepted submission
//! stalls the queue until the matching callback pops it.
//!
//! The queue knows nothing about caller-side cancellation: a cancelled request
//! still occupies its slot until the hardware answers, and that answer then
//! finds no waiter.

use std::collections::VecDeque;

use log::debug;

use crate::error::HardwareError;
use crate::request::Token;
use crate::types::{OpKind, Operation, SubjectId};

/// Outcome of handing an operation to the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Accepted; the result arrives later through a callback.
    Submitted,
    /// Refused on the spot; no callback will follow.
    RejectedSynchronously(HardwareError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub operation: Operation,
    pub subject: SubjectId,
    /// Request served by this item; `None` for internal fire-and-forget work
    /// such as disabling notifications.
    pub token: Option<Token>,
}

impl QueueItem {
    pub fn kind(&self) -> OpKind {
        self.operation.kind()
    }
}

/// An item popped because its submission was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub item: QueueItem,
    pub reason: HardwareError,
}

#[derive(Debug, Default)]
pub struct LinkQueue {
    items: VecDeque<QueueItem>,
    active: bool,
}

impl LinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `item`. If the link is idle it is submitted immediately through
    /// `submit`; items refused synchronously are returned for their requests to
    /// be failed.
    pub fn enqueue(
        &mut self,
        item: QueueItem,
        submit: impl FnMut(&QueueItem) -> Submission,
    ) -> Vec<Rejected> {
        debug!("queued {} for {}", item.kind(), item.subject);
        self.items.push_back(item);
        self.advance(submit)
    }

    /// Submits queued items until one is accepted or the queue runs dry.
    pub fn advance(&mut self, mut submit: impl FnMut(&QueueItem) -> Submission) -> Vec<Rejected> {
        let mut rejected = Vec::new();
        while !self.active {
            let Some(head) = self.items.front() else {
                break;
            };
            match submit(head) {
                Submission::Submitted => self.active = true,
                Submission::RejectedSynchronously(reason) => {
                    if let Some(item) = self.items.pop_front() {
                        debug!("{} for {} refused: {reason}", item.kind(), item.subject);
                        rejected.push(Rejected { item, reason });
                    }
                }
            }
        }
        rejected
    }

    /// Pops the active head if it is the `kind` operation on `subject`; a callback
    /// that does not match the head leaves the queue untouched.
    pub fn pop_active(&mut self, kind: OpKind, subject: &SubjectId) -> Option<QueueItem> {
        if !self.active {
            return None;
        }
        let head = self.items.front()?;
        if head.kind() != kind || &head.subject != subject {
            return None;
        }
        self.active = false;
        self.items.pop_front()
    }

    /// The item currently awaiting its callback.
    pub fn active(&self) -> Option<&QueueItem> {
        self.items.front().filter(|_| self.active)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drops everything, active head included (link lost).
    pub fn clear(&mut self) -> Vec<QueueItem> {
        self.active = false;
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttributeId, DeviceId};

    fn read(n: u32) -> QueueItem {
        let dev = DeviceId::new("AA");
        let attr = AttributeId::from_raw(n);
        QueueItem {
            operation: Operation::Read(attr),
            subject: SubjectId::Attribute(dev, attr),
            token: None,
        }
    }

    #[test]
    fn items_run_one_at_a_time_in_order() {
        let mut queue = LinkQueue::new();
        let submitted = std::cell::RefCell::new(Vec::new());
        let accept = |item: &QueueItem| {
            submitted
                .borrow_mut()
                .push(item.operation.attribute().unwrap().as_u32());
            Submission::Submitted
        };
        assert!(queue.enqueue(read(1), accept).is_empty());
        assert!(queue.enqueue(read(2), accept).is_empty());
        assert!(queue.enqueue(read(3), accept).is_empty());
        assert_eq!(*submitted.borrow(), [1]);
        assert_eq!(queue.active(), Some(&read(1)));

        // a callback for something other than the head changes nothing
        assert!(queue.pop_active(OpKind::Read, &read(2).subject).is_none());
        assert_eq!(queue.pop_active(OpKind::Read, &read(1).subject), Some(read(1)));
        assert!(queue.advance(accept).is_empty());
        assert_eq!(*submitted.borrow(), [1, 2]);
        assert_eq!(queue.active(), Some(&read(2)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn synchronous_rejection_advances_without_callback() {
        let mut queue = LinkQueue::new();
        let mut calls = 0;
        let mut accept = |_: &QueueItem| {
            calls += 1;
            Submission::Submitted
        };
        queue.enqueue(read(1), &mut accept);
        queue.enqueue(read(2), &mut accept);
        queue.enqueue(read(3), &mut accept);
        assert_eq!(calls, 1);

        // X's callback arrives; Y is refused synchronously; Z becomes head at once
        queue.pop_active(OpKind::Read, &read(1).subject).unwrap();
        let mut refuse_two = |item: &QueueItem| {
            if item.operation.attribute() == Some(AttributeId::from_raw(2)) {
                Submission::RejectedSynchronously(HardwareError::Rejected("busy".into()))
            } else {
                Submission::Submitted
            }
        };
        let rejected = queue.advance(&mut refuse_two);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].item, read(2));
        assert_eq!(queue.active(), Some(&read(3)));
    }

    #[test]
    fn rejected_head_on_empty_queue_lets_next_enqueue_run() {
        let mut queue = LinkQueue::new();
        let rejected = queue.enqueue(read(1), |_| {
            Submission::RejectedSynchronously(HardwareError::Status(1))
        });
        assert_eq!(rejected.len(), 1);
        assert_eq!(queue.len(), 0);
        assert!(queue.enqueue(read(2), |_| Submission::Submitted).is_empty());
        assert_eq!(queue.active(), Some(&read(2)));
    }

    #[test]
    fn clear_drops_active_head() {
        let mut queue = LinkQueue::new();
        queue.enqueue(read(1), |_| Submission::Submitted);
        queue.enqueue(read(2), |_| Submission::Submitted);
        assert_eq!(queue.clear().len(), 2);
        assert!(queue.active().is_none());
        assert!(queue.pop_active(OpKind::Read, &read(1).subject).is_none());
    }
}
