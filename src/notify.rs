//! Deduplicates concurrent "start monitoring" requests against one hardware
//! notification toggle per characteristic.
//!
//! The waiters themselves live in the request table as a fan-out set under
//! `(characteristic, OpKind::Monitor)`; this module only tracks where each
//! characteristic's toggle stands, so the coordinator knows whether a new
//! monitor needs the hardware, has to wait, or can get its buffer right away.

use std::collections::HashMap;

use log::debug;

use crate::types::{DeviceId, SubjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// Enable toggle submitted, waiting for its callback.
    Enabling,
    Enabled,
    /// Disable toggle submitted after the last buffer went away.
    Disabling,
}

/// What the coordinator has to do for a new monitor request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
    /// Notifications are already on; create the caller's buffer now.
    Ready,
    /// First caller of a fresh cycle; submit the enable toggle.
    Enable,
    /// An enable is in flight; wait for it together with the others.
    Wait,
}

#[derive(Debug, Default)]
pub struct NotificationMux {
    states: HashMap<SubjectId, NotifyState>,
}

impl NotificationMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, subject: &SubjectId) -> JoinAction {
        match self.states.get(subject) {
            Some(NotifyState::Enabled) => JoinAction::Ready,
            Some(NotifyState::Enabling) => JoinAction::Wait,
            // a pending disable is ahead of us in the link queue; enabling again
            // is queued behind it
            Some(NotifyState::Disabling) | None => {
                debug!("starting notification cycle for {subject}");
                self.states.insert(subject.clone(), NotifyState::Enabling);
                JoinAction::Enable
            }
        }
    }

    /// Records the outcome of an enable toggle. Returns `true` if the waiter set
    /// should be settled now.
    pub fn enable_settled(&mut self, subject: &SubjectId, ok: bool) -> bool {
        if self.states.get(subject) != Some(&NotifyState::Enabling) {
            return false;
        }
        if ok {
            self.states.insert(subject.clone(), NotifyState::Enabled);
        } else {
            let _ = self.states.remove(subject);
        }
        true
    }

    pub fn disable_settled(&mut self, subject: &SubjectId) {
        if self.states.get(subject) == Some(&NotifyState::Disabling) {
            let _ = self.states.remove(subject);
        }
    }

    /// Called once the last buffer of the characteristic is gone. Returns `true`
    /// if a disable toggle should be submitted.
    pub fn release(&mut self, subject: &SubjectId) -> bool {
        if self.states.get(subject) == Some(&NotifyState::Enabled) {
            self.states.insert(subject.clone(), NotifyState::Disabling);
            true
        } else {
            false
        }
    }

    pub fn state(&self, subject: &SubjectId) -> Option<NotifyState> {
        self.states.get(subject).copied()
    }

    pub fn is_enabled(&self, subject: &SubjectId) -> bool {
        self.state(subject) == Some(NotifyState::Enabled)
    }

    /// Forgets every characteristic of a lost link.
    pub fn forget_device(&mut self, dev_id: &DeviceId) {
        self.states.retain(|subject, _| !subject.belongs_to(dev_id));
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeId;

    fn chr(n: u32) -> SubjectId {
        SubjectId::Attribute(DeviceId::new("AA"), AttributeId::from_raw(n))
    }

    #[test]
    fn only_first_caller_toggles_hardware() {
        let mut mux = NotificationMux::new();
        assert_eq!(mux.join(&chr(1)), JoinAction::Enable);
        assert_eq!(mux.join(&chr(1)), JoinAction::Wait);
        assert_eq!(mux.join(&chr(2)), JoinAction::Enable);
        assert!(mux.enable_settled(&chr(1), true));
        assert_eq!(mux.join(&chr(1)), JoinAction::Ready);
    }

    #[test]
    fn failed_enable_starts_fresh_cycle() {
        let mut mux = NotificationMux::new();
        assert_eq!(mux.join(&chr(1)), JoinAction::Enable);
        assert!(mux.enable_settled(&chr(1), false));
        assert_eq!(mux.state(&chr(1)), None);
        assert_eq!(mux.join(&chr(1)), JoinAction::Enable);
    }

    #[test]
    fn release_then_rejoin_reenables() {
        let mut mux = NotificationMux::new();
        mux.join(&chr(1));
        mux.enable_settled(&chr(1), true);
        assert!(mux.release(&chr(1)));
        assert!(!mux.release(&chr(1)));
        assert_eq!(mux.join(&chr(1)), JoinAction::Enable);
        // the late disable callback must not clobber the new cycle
        mux.disable_settled(&chr(1));
        assert_eq!(mux.state(&chr(1)), Some(NotifyState::Enabling));
    }

    #[test]
    fn stale_enable_callback_is_ignored() {
        let mut mux = NotificationMux::new();
        assert!(!mux.enable_settled(&chr(1), true));
        assert!(!mux.is_enabled(&chr(1)));
    }

    #[test]
    fn forget_device_clears_its_characteristics() {
        let mut mux = NotificationMux::new();
        mux.join(&chr(1));
        let other = SubjectId::Attribute(DeviceId::new("BB"), AttributeId::from_raw(1));
        mux.join(&other);
        mux.forget_device(&DeviceId::new("AA"));
        assert_eq!(mux.state(&chr(1)), None);
        assert_eq!(mux.state(&other), Some(NotifyState::Enabling));
    }
}
