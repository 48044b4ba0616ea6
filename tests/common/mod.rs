//! Mock platform adapter for integration tests.
//!
//! Records every call the coordinator makes so tests can assert on the
//! submission history, and optionally answers connection attempts on its own
//! through an [`EventSender`].

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ble_coord::{
    AttributeId, Coordinator, DeviceId, EventSender, Hardware, HardwareEvent, OpKind, Operation,
    Response, SubjectId, Submission, Uuid,
};
use ble_coord::error::HardwareError;
use futures_lite::future::{block_on, poll_once};

// ── Call record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum HwCall {
    Submit {
        device: DeviceId,
        operation: Operation,
        handle: Option<u16>,
    },
    StartScan(Vec<Uuid>),
    StopScan,
}

// ── MockHardware ──────────────────────────────────────────────

#[derive(Default)]
pub struct MockHardware {
    calls: Mutex<Vec<HwCall>>,
    refuse: Mutex<HashSet<OpKind>>,
    auto_connect: Mutex<Option<EventSender>>,
    connect_results: Mutex<VecDeque<bool>>,
}

impl MockHardware {
    pub fn calls(&self) -> Vec<HwCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Operations submitted so far, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HwCall::Submit { operation, .. } => Some(operation),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, kind: OpKind) -> usize {
        self.operations()
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }

    /// Makes every later submission of `kind` fail synchronously.
    pub fn refuse(&self, kind: OpKind) {
        self.refuse.lock().unwrap().insert(kind);
    }

    /// Answers connection attempts through `sender`: each one pops the next
    /// scripted outcome, succeeding once the script runs dry.
    pub fn answer_connects(&self, sender: EventSender, script: Vec<bool>) {
        *self.auto_connect.lock().unwrap() = Some(sender);
        *self.connect_results.lock().unwrap() = script.into();
    }
}

impl Hardware for MockHardware {
    type Handle = u16;

    fn submit(&self, device: &DeviceId, operation: &Operation, handle: Option<&u16>) -> Submission {
        self.calls.lock().unwrap().push(HwCall::Submit {
            device: device.clone(),
            operation: operation.clone(),
            handle: handle.copied(),
        });
        if self.refuse.lock().unwrap().contains(&operation.kind()) {
            return Submission::RejectedSynchronously(HardwareError::Rejected("busy".into()));
        }
        if let (Operation::Connect { .. }, Some(sender)) =
            (operation, self.auto_connect.lock().unwrap().as_ref())
        {
            let ok = self.connect_results.lock().unwrap().pop_front().unwrap_or(true);
            let result = if ok {
                Ok(Response::Done)
            } else {
                Err(HardwareError::Status(133))
            };
            sender.on_operation_settled(SubjectId::Device(device.clone()), OpKind::Connect, result);
        }
        Submission::Submitted
    }

    fn start_scan(&self, services: &[Uuid]) -> Submission {
        self.calls
            .lock()
            .unwrap()
            .push(HwCall::StartScan(services.to_vec()));
        Submission::Submitted
    }

    fn stop_scan(&self) {
        self.calls.lock().unwrap().push(HwCall::StopScan);
    }
}

// ── Helpers ───────────────────────────────────────────────────

pub fn device() -> DeviceId {
    DeviceId::new("C0:FF:EE:00:00:01")
}

pub fn settle(coord: &Coordinator<MockHardware>, subject: SubjectId, kind: OpKind, result: Result<Response, HardwareError>) {
    coord.handle_event(HardwareEvent::OperationSettled {
        subject,
        kind,
        result,
    });
}

/// Connects `dev` and registers native handles `0x10`, `0x20` and `0x30`.
pub fn connect(coord: &Coordinator<MockHardware>, dev: &DeviceId) -> Vec<AttributeId> {
    block_on(async {
        let mut fut = Box::pin(coord.connect(dev));
        assert!(poll_once(&mut fut).await.is_none());
        settle(coord, SubjectId::Device(dev.clone()), OpKind::Connect, Ok(Response::Done));
        fut.await.unwrap();
    });
    [0x10, 0x20, 0x30]
        .into_iter()
        .map(|handle| coord.register_attribute(dev, handle).unwrap())
        .collect()
}

/// Polls `cond` until it holds or a few seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
