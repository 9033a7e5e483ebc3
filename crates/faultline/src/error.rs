//! Error values that cross the unwinder's boundaries.
//!
//! - [`HostException`] is a native-level failure carried by a host fault.
//! - [`Raised`] is what the embedding execution engine hands to
//!   [`VmContext::exception_handler`](crate::VmContext::exception_handler).
//! - [`ReleaseError`] is a secondary failure raised while releasing a value.
//! - [`BuildError`] reports a malformed unit at assembly time.

use std::{any::Any, borrow::Cow, error::Error, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::{bytecode::Offset, heap::ObjectId};

/// Result of releasing one reference.
///
/// Teardown paths discard the error by policy; every other caller decides for itself.
pub type Release = Result<(), ReleaseError>;

/// Category of a host-level exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum HostExceptionKind {
    /// A fatal error raised by the runtime.
    Fatal,
    /// A generic runtime failure in native code.
    Runtime,
    /// A native resource (memory, time, descriptors) was exhausted.
    ResourceExhausted,
    /// An internal VM invariant did not hold.
    InvariantViolation,
    /// A native failure of a type the VM does not recognize.
    Unexpected,
    /// A failure with no usable description at all.
    Unknown,
}

/// An owned native exception value, as carried by a host fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostException {
    kind: HostExceptionKind,
    message: Cow<'static, str>,
}

impl HostException {
    /// Creates a host exception of the given kind.
    #[must_use]
    pub fn new(kind: HostExceptionKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a fatal host exception.
    #[must_use]
    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(HostExceptionKind::Fatal, message)
    }

    /// Wraps an unrecognized native error, capturing a diagnostic description.
    #[must_use]
    pub fn unexpected(type_name: &str, error: &dyn Error) -> Self {
        Self::new(HostExceptionKind::Unexpected, format!("unexpected {type_name}: {error}"))
    }

    /// The catch-all for failures that carry no description.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(HostExceptionKind::Unknown, "unknown exception")
    }

    pub(crate) fn invariant(message: &'static str) -> Self {
        Self::new(HostExceptionKind::InvariantViolation, message)
    }

    #[must_use]
    pub fn kind(&self) -> HostExceptionKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for HostException {}

/// An exception unwinding out of interpreted execution back into VM control.
///
/// The variants are the categories fault dispatch distinguishes; the first
/// four are produced by the VM itself, the last three by native code.
#[derive(Debug)]
pub enum Raised {
    /// A fault handler finished and asked to keep propagating the current fault.
    PrepareUnwind,
    /// A user-level object was thrown.
    ///
    /// The thrower keeps its own reference; dispatch takes a new one for the fault.
    Object(ObjectId),
    /// Execution mode changed; nothing needs tearing down.
    SwitchMode,
    /// Execution mode changed from inside a builtin, whose frame must be torn down.
    SwitchModeBuiltin,
    /// A recognized host exception.
    Host(HostException),
    /// Any other native error.
    Native(Box<dyn Error + Send + Sync + 'static>),
    /// A caught panic payload.
    Panic(Box<dyn Any + Send + 'static>),
}

impl Raised {
    /// Wraps a payload returned by [`std::panic::catch_unwind`].
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self::Panic(payload)
    }

    /// Converts a native-level failure into the host exception a fault will carry.
    ///
    /// Returns `None` for the VM-internal categories, which never become host faults.
    pub(crate) fn into_host_exception(self) -> Option<HostException> {
        match self {
            Self::PrepareUnwind | Self::Object(_) | Self::SwitchMode | Self::SwitchModeBuiltin => None,
            Self::Host(exc) => Some(exc),
            Self::Native(error) => Some(HostException::unexpected("native error", error.as_ref())),
            Self::Panic(payload) => Some(host_exception_from_panic(payload.as_ref())),
        }
    }
}

impl From<HostException> for Raised {
    fn from(exc: HostException) -> Self {
        Self::Host(exc)
    }
}

impl From<Box<dyn Error + Send + Sync + 'static>> for Raised {
    fn from(error: Box<dyn Error + Send + Sync + 'static>) -> Self {
        Self::Native(error)
    }
}

fn host_exception_from_panic(payload: &(dyn Any + Send)) -> HostException {
    let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
        Some((*message).to_owned())
    } else {
        payload.downcast_ref::<String>().cloned()
    };
    match message {
        Some(message) => HostException::new(HostExceptionKind::Unexpected, format!("unexpected panic: {message}")),
        None => HostException::unknown(),
    }
}

/// A failure raised while releasing a reference, typically by a destructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    /// The destructor threw a user-level exception.
    Exception { object: ObjectId, message: String },
    /// The destructor, or the hook guarding it, raised a fatal error.
    Fatal { object: ObjectId, message: String },
}

impl ReleaseError {
    #[must_use]
    pub fn object(&self) -> ObjectId {
        match self {
            Self::Exception { object, .. } | Self::Fatal { object, .. } => *object,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exception { object, message } => write!(f, "destructor of {object} threw: {message}"),
            Self::Fatal { object, message } => write!(f, "fatal while destroying {object}: {message}"),
        }
    }
}

impl Error for ReleaseError {}

/// A unit could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// A try region was opened but never closed.
    UnclosedRegion { base: Offset },
    /// A try region was closed but no handler was ever attached.
    MissingHandler { base: Offset, past: Offset },
    /// A region received both a fault handler and catch clauses.
    MixedHandlers { base: Offset },
    /// A function was begun but never ended, or ended without being begun.
    UnbalancedFunction { name: String },
    /// A try region was closed while a region opened inside it was still open,
    /// or closed twice.
    UnbalancedRegion { base: Offset },
    /// A region was opened outside any function.
    RegionOutsideFunction { offset: Offset },
    /// A handler offset does not point at an instruction inside the unit.
    HandlerOutOfRange { handler: Offset, unit_len: Offset },
    /// A jump or operand did not fit its encoding.
    OperandOutOfRange { offset: Offset },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnclosedRegion { base } => write!(f, "try region at {base} was never closed"),
            Self::MissingHandler { base, past } => write!(f, "try region [{base}, {past}) has no handler"),
            Self::MixedHandlers { base } => {
                write!(f, "try region at {base} has both a fault handler and catch clauses")
            }
            Self::UnbalancedFunction { name } => write!(f, "function `{name}` is not properly begun and ended"),
            Self::UnbalancedRegion { base } => write!(f, "try region at {base} is not closed innermost-first"),
            Self::RegionOutsideFunction { offset } => write!(f, "try region at {offset} is outside any function"),
            Self::HandlerOutOfRange { handler, unit_len } => {
                write!(f, "handler offset {handler} is outside the unit (length {unit_len})")
            }
            Self::OperandOutOfRange { offset } => write!(f, "operand at {offset} does not fit its encoding"),
        }
    }
}

impl Error for BuildError {}
