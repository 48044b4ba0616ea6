//! Correlates callers with the asynchronous completion they are waiting for.
//!
//! Entries are keyed by `(SubjectId, OpKind)`. Single-shot kinds admit one
//! unresolved entry per key, so a second registration fails before anything
//! reaches the hardware. Fan-out kinds (see [`OpKind::is_fan_out`]) collect
//! every concurrent caller into one waiter set that is settled together.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::debug;

use crate::async_util::{oneshot, ResultSink, ResultWaiter};
use crate::buffer::DrainStrategy;
use crate::error::Error;
use crate::types::{BufferId, OpKind, Response, SubjectId};
use crate::Result;

/// Internal identity of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

/// Caller-visible identifier for cancelling a specific pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What happens when a request's deadline passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeoutPolicy {
    /// Remove the entry and fail with `OperationTimedOut`.
    #[default]
    Fail,
    /// For drains: hand out whatever the buffer holds instead of failing.
    ReturnPartial,
}

/// A drain parked until its buffer holds enough items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkedDrain {
    pub buffer: BufferId,
    pub strategy: DrainStrategy,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub correlation: Option<CorrelationToken>,
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutPolicy,
    pub drain: Option<ParkedDrain>,
}

/// One unresolved request, owned by the table until it is taken out.
#[derive(Debug)]
pub struct PendingEntry {
    token: Token,
    correlation: CorrelationToken,
    sink: ResultSink<Result<Response>>,
    on_timeout: TimeoutPolicy,
    drain: Option<ParkedDrain>,
}

impl PendingEntry {
    pub fn correlation(&self) -> &CorrelationToken {
        &self.correlation
    }

    pub fn on_timeout(&self) -> TimeoutPolicy {
        self.on_timeout
    }

    pub fn drain(&self) -> Option<ParkedDrain> {
        self.drain
    }

    /// Hands the result to the waiting caller. Returns `false` if the caller is gone.
    pub fn resolve(self, result: Result<Response>) -> bool {
        self.sink.send(result)
    }
}

/// Returned by [`RequestTable::register`].
#[derive(Debug)]
pub struct Registration {
    pub token: Token,
    pub correlation: CorrelationToken,
    pub waiter: ResultWaiter<Result<Response>>,
}

#[derive(Debug, Default)]
pub struct RequestTable {
    next_token: u64,
    entries: HashMap<(SubjectId, OpKind), Vec<PendingEntry>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `(subject, kind)`.
    ///
    /// Fails with `DuplicateOperation` if a single-shot request of the same key is
    /// unresolved, or if the caller-supplied correlation token is already in use.
    pub fn register(
        &mut self,
        subject: SubjectId,
        kind: OpKind,
        options: RegisterOptions,
    ) -> Result<Registration> {
        if let Some(correlation) = &options.correlation {
            if self.find_correlation(correlation).is_some() {
                return Err(Error::duplicate(
                    &subject,
                    format_args!("operation with token `{correlation}`"),
                ));
            }
        }
        let key = (subject, kind);
        let waiters = self.entries.get(&key).map_or(0, Vec::len);
        if waiters > 0 && !kind.is_fan_out() {
            return Err(Error::duplicate(&key.0, kind));
        }

        self.next_token += 1;
        let token = Token(self.next_token);
        let correlation = options
            .correlation
            .unwrap_or_else(|| CorrelationToken(format!("op-{}", token.0)));
        let (sink, waiter) = oneshot();
        let entry = PendingEntry {
            token,
            correlation: correlation.clone(),
            sink,
            on_timeout: options.on_timeout,
            drain: options.drain,
        };
        debug!("registered {} for {} ({correlation})", key.1, key.0);
        self.entries.entry(key).or_default().push(entry);
        Ok(Registration {
            token,
            correlation,
            waiter,
        })
    }

    /// Looks at the oldest entry of the key without removing it.
    pub fn peek(&self, subject: &SubjectId, kind: OpKind) -> Option<&PendingEntry> {
        self.entries
            .get(&(subject.clone(), kind))
            .and_then(|list| list.first())
    }

    /// Removes the oldest entry of the key.
    pub fn take(&mut self, subject: &SubjectId, kind: OpKind) -> Option<PendingEntry> {
        let key = (subject.clone(), kind);
        let list = self.entries.get_mut(&key)?;
        let entry = (!list.is_empty()).then(|| list.remove(0));
        if list.is_empty() {
            self.entries.remove(&key);
        }
        entry
    }

    /// Removes the whole waiter set of the key.
    pub fn take_all(&mut self, subject: &SubjectId, kind: OpKind) -> Vec<PendingEntry> {
        self.entries
            .remove(&(subject.clone(), kind))
            .unwrap_or_default()
    }

    /// Removes the entry registered under `token`, wherever it is.
    pub fn take_token(&mut self, token: Token) -> Option<PendingEntry> {
        let key = self
            .entries
            .iter()
            .find(|(_, list)| list.iter().any(|e| e.token == token))
            .map(|(key, _)| key.clone())?;
        let list = self.entries.get_mut(&key)?;
        let pos = list.iter().position(|e| e.token == token)?;
        let entry = list.remove(pos);
        if list.is_empty() {
            self.entries.remove(&key);
        }
        Some(entry)
    }

    /// Resolves the entry with the caller's correlation token with `error`.
    /// Unknown or already resolved tokens are ignored.
    pub fn cancel(&mut self, correlation: &CorrelationToken, error: Error) -> bool {
        match self.find_correlation(correlation) {
            Some(token) => self.cancel_token(token, error),
            None => false,
        }
    }

    pub fn cancel_token(&mut self, token: Token, error: Error) -> bool {
        match self.take_token(token) {
            Some(entry) => {
                debug!("cancelled {}: {error}", entry.correlation);
                entry.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolves every entry whose key matches `predicate` with `error`; returns how many.
    pub fn cancel_all_matching(
        &mut self,
        predicate: impl Fn(&SubjectId, OpKind) -> bool,
        error: &Error,
    ) -> usize {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(subject, kind)| predicate(subject, *kind))
            .cloned()
            .collect();
        let mut count = 0;
        for key in keys {
            for entry in self.entries.remove(&key).unwrap_or_default() {
                entry.resolve(Err(error.clone()));
                count += 1;
            }
        }
        if count > 0 {
            debug!("cancelled {count} pending request(s): {error}");
        }
        count
    }

    /// The key an unresolved correlation token is registered under.
    pub fn key_of(&self, correlation: &CorrelationToken) -> Option<(SubjectId, OpKind)> {
        self.entries
            .iter()
            .find(|(_, list)| list.iter().any(|e| &e.correlation == correlation))
            .map(|(key, _)| key.clone())
    }

    pub fn contains(&self, subject: &SubjectId, kind: OpKind) -> bool {
        self.peek(subject, kind).is_some()
    }

    /// Number of unresolved entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    fn find_correlation(&self, correlation: &CorrelationToken) -> Option<Token> {
        self.entries
            .values()
            .flatten()
            .find(|e| &e.correlation == correlation)
            .map(|e| e.token)
    }
}
