//! Defines error types.

use std::fmt::Debug;

use super::types::SubjectId;

/// Failure reported by the platform adapter, either synchronously when an operation
/// is handed to the stack or asynchronously in its completion callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HardwareError {
    /// The remote attribute server answered with an ATT error.
    Att(AttError),
    /// Non-zero status code of the native stack.
    Status(i32),
    /// The native call refused the request (e.g. returned `false`).
    Rejected(String),
}

impl std::error::Error for HardwareError {}

impl std::fmt::Display for HardwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Att(att_error) => write!(f, "GATT error: {att_error}"),
            Self::Status(code) => write!(f, "native stack returned status {code}"),
            Self::Rejected(reason) if reason.is_empty() => f.write_str("native call was rejected"),
            Self::Rejected(reason) => write!(f, "native call was rejected: {reason}"),
        }
    }
}

impl From<AttError> for HardwareError {
    fn from(att_error: AttError) -> Self {
        Self::Att(att_error)
    }
}

impl From<AttError> for Error {
    fn from(e: AttError) -> Self {
        Error::new(ErrorKind::Protocol(e), Some(HardwareError::Att(e)), "")
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            message: String::new(),
            subject: None,
        }
    }
}

impl HardwareError {
    /// Converts a synchronous rejection into the error given to the caller.
    pub(crate) fn into_submission_error(self, subject: &SubjectId) -> Error {
        let msg = self.to_string();
        Error::new(ErrorKind::LinkSubmissionFailed, Some(self), msg).with_subject(subject.clone())
    }

    /// Converts a failed completion callback into the error given to the caller.
    pub(crate) fn into_operation_error(self, subject: &SubjectId) -> Error {
        let kind = match &self {
            Self::Att(att_error) => ErrorKind::Protocol(*att_error),
            Self::Status(_) | Self::Rejected(_) => ErrorKind::LinkOperationFailed,
        };
        let msg = self.to_string();
        Error::new(kind, Some(self), msg).with_subject(subject.clone())
    }
}

/// The error type for coordinated Bluetooth operations.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<HardwareError>,
    message: String,
    subject: Option<SubjectId>,
}

impl Error {
    pub(crate) fn new<S: ToString>(
        kind: ErrorKind,
        source: Option<HardwareError>,
        message: S,
    ) -> Self {
        Error {
            kind,
            source,
            message: message.to_string(),
            subject: None,
        }
    }

    pub(crate) fn with_subject(mut self, subject: SubjectId) -> Self {
        self.subject = Some(subject);
        self
    }

    pub(crate) fn duplicate(subject: &SubjectId, what: impl std::fmt::Display) -> Self {
        Error::new(
            ErrorKind::DuplicateOperation,
            None,
            format!("{what} is already pending"),
        )
        .with_subject(subject.clone())
    }

    pub(crate) fn cancelled() -> Self {
        ErrorKind::OperationCancelled.into()
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the device, attribute or buffer the failed operation targeted, if known.
    pub fn subject(&self) -> Option<&SubjectId> {
        self.subject.as_ref()
    }

    /// Returns the adapter-level failure behind this error, if there is one.
    pub fn hardware_error(&self) -> Option<&HardwareError> {
        self.source.as_ref()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.message.is_empty(), &self.source) {
            (true, None) => write!(f, "{}", &self.kind)?,
            (false, None) => write!(f, "{}: {}", &self.kind, &self.message)?,
            (_, Some(err)) => write!(f, "{}: {}", &self.kind, err)?,
        }
        if let Some(subject) = &self.subject {
            write!(f, " ({subject})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|x| {
            let x: &(dyn std::error::Error + 'static) = x;
            x
        })
    }
}

impl PartialEq<ErrorKind> for Error {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

/// A list of general categories of coordination error.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// an operation of the same kind is already pending for this subject
    DuplicateOperation,
    /// the operation was cancelled
    OperationCancelled,
    /// the operation timed out
    OperationTimedOut,
    /// the stack refused to start the operation
    LinkSubmissionFailed,
    /// the stack reported a failure for the operation
    LinkOperationFailed,
    /// the link to the device was lost
    LinkLost,
    /// every retry attempt failed
    RetryExhausted,
    /// the Bluetooth adapter is not available
    AdapterUnavailable,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// not found
    NotFound,
    /// invalid parameter
    InvalidParameter,
    /// protocol error: {0}
    Protocol(AttError),
    /// an internal error has occured
    Internal,
    /// error
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::DuplicateOperation => {
                f.write_str("an operation of the same kind is already pending")
            }
            ErrorKind::OperationCancelled => f.write_str("the operation was cancelled"),
            ErrorKind::OperationTimedOut => f.write_str("the operation timed out"),
            ErrorKind::LinkSubmissionFailed => f.write_str("the stack refused the operation"),
            ErrorKind::LinkOperationFailed => f.write_str("the operation failed"),
            ErrorKind::LinkLost => f.write_str("the link to the device was lost"),
            ErrorKind::RetryExhausted => f.write_str("all retry attempts failed"),
            ErrorKind::AdapterUnavailable => f.write_str("the Bluetooth adapter is not available"),
            ErrorKind::NotConnected => f.write_str("the Bluetooth device isn't connected"),
            ErrorKind::NotFound => f.write_str("not found"),
            ErrorKind::InvalidParameter => f.write_str("invalid parameter"),
            ErrorKind::Protocol(err) => write!(f, "protocol error: {err}"),
            ErrorKind::Internal => f.write_str("an internal error has occured"),
            ErrorKind::Other => f.write_str("error"),
        }
    }
}

/// ATT error code carried by a failed completion (Bluetooth Core Specification,
/// Vol 3, Part F, §3.4.1.1). Codes `0x80..0xa0` are application defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttError(u8);

#[rustfmt::skip]
impl AttError {
    pub const SUCCESS: AttError = AttError(0x00);
    pub const INVALID_HANDLE: AttError = AttError(0x01);
    pub const READ_NOT_PERMITTED: AttError = AttError(0x02);
    pub const WRITE_NOT_PERMITTED: AttError = AttError(0x03);
    pub const INVALID_PDU: AttError = AttError(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: AttError = AttError(0x05);
    pub const REQUEST_NOT_SUPPORTED: AttError = AttError(0x06);
    pub const INVALID_OFFSET: AttError = AttError(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: AttError = AttError(0x08);
    pub const PREPARE_QUEUE_FULL: AttError = AttError(0x09);
    pub const ATTRIBUTE_NOT_FOUND: AttError = AttError(0x0a);
    pub const ATTRIBUTE_NOT_LONG: AttError = AttError(0x0b);
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: AttError = AttError(0x0c);
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: AttError = AttError(0x0d);
    pub const UNLIKELY_ERROR: AttError = AttError(0x0e);
    pub const INSUFFICIENT_ENCRYPTION: AttError = AttError(0x0f);
    pub const UNSUPPORTED_GROUP_TYPE: AttError = AttError(0x10);
    pub const INSUFFICIENT_RESOURCES: AttError = AttError(0x11);
    pub const DATABASE_OUT_OF_SYNC: AttError = AttError(0x12);
    pub const VALUE_NOT_ALLOWED: AttError = AttError(0x13);
    pub const WRITE_REQUEST_REJECTED: AttError = AttError(0xfc);
    pub const CCCD_IMPROPERLY_CONFIGURED: AttError = AttError(0xfd);
    pub const PROCEDURE_ALREADY_IN_PROGRESS: AttError = AttError(0xfe);
    pub const OUT_OF_RANGE: AttError = AttError(0xff);
}

impl AttError {
    pub const fn from_u8(val: u8) -> Self {
        AttError(val)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub fn is_application(&self) -> bool {
        (0x80..0xa0).contains(&self.0)
    }

    /// Short name of a well-known code.
    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::SUCCESS => "success",
            Self::INVALID_HANDLE => "invalid handle",
            Self::READ_NOT_PERMITTED => "read not permitted",
            Self::WRITE_NOT_PERMITTED => "write not permitted",
            Self::INVALID_PDU => "invalid PDU",
            Self::INSUFFICIENT_AUTHENTICATION => "insufficient authentication",
            Self::REQUEST_NOT_SUPPORTED => "request not supported",
            Self::INVALID_OFFSET => "invalid offset",
            Self::INSUFFICIENT_AUTHORIZATION => "insufficient authorization",
            Self::PREPARE_QUEUE_FULL => "prepare queue full",
            Self::ATTRIBUTE_NOT_FOUND => "attribute not found",
            Self::ATTRIBUTE_NOT_LONG => "attribute not long",
            Self::INSUFFICIENT_ENCRYPTION_KEY_SIZE => "insufficient encryption key size",
            Self::INVALID_ATTRIBUTE_VALUE_LENGTH => "invalid attribute value length",
            Self::UNLIKELY_ERROR => "unlikely error",
            Self::INSUFFICIENT_ENCRYPTION => "insufficient encryption",
            Self::UNSUPPORTED_GROUP_TYPE => "unsupported group type",
            Self::INSUFFICIENT_RESOURCES => "insufficient resources",
            Self::DATABASE_OUT_OF_SYNC => "database out of sync",
            Self::VALUE_NOT_ALLOWED => "value not allowed",
            Self::WRITE_REQUEST_REJECTED => "write request rejected",
            Self::CCCD_IMPROPERLY_CONFIGURED => "CCCD improperly configured",
            Self::PROCEDURE_ALREADY_IN_PROGRESS => "procedure already in progress",
            Self::OUT_OF_RANGE => "out of range",
            _ => return None,
        };
        Some(name)
    }
}

impl std::fmt::Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "ATT 0x{:02x} ({name})", self.0),
            None if self.is_application() => write!(f, "ATT 0x{:02x} (application error)", self.0),
            None => write!(f, "ATT 0x{:02x}", self.0),
        }
    }
}

impl From<u8> for AttError {
    fn from(number: u8) -> Self {
        AttError(number)
    }
}
