use crate::error::ErrorKind;
use crate::types::{DeviceId, SubjectId};

/// Runs the closure when dropped, unless it was defused.
pub struct ScopeGuard<F: FnOnce()> {
    dropfn: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        let _ = self.dropfn.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(dropfn) = self.dropfn.take() {
            dropfn();
        }
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: Some(dropfn),
    }
}

pub(crate) trait OptionExt<T> {
    fn ok_or_not_connected(self, dev_id: &DeviceId) -> Result<T, crate::Error>;
    fn ok_or_not_found(self, subject: &SubjectId) -> Result<T, crate::Error>;
}

impl<T> OptionExt<T> for Option<T> {
    #[track_caller]
    fn ok_or_not_connected(self, dev_id: &DeviceId) -> Result<T, crate::Error> {
        self.ok_or_else(|| {
            crate::Error::from(ErrorKind::NotConnected).with_subject(SubjectId::Device(dev_id.clone()))
        })
    }

    #[track_caller]
    fn ok_or_not_found(self, subject: &SubjectId) -> Result<T, crate::Error> {
        self.ok_or_else(|| crate::Error::from(ErrorKind::NotFound).with_subject(subject.clone()))
    }
}
