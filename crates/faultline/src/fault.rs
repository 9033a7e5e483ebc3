//! In-flight faults and the record that holds them.
//!
//! A [`Fault`] is what the unwinder carries from frame to frame: the exception
//! itself plus the bookkeeping that lets a re-raising handler resume the search
//! where the previous one stopped.
//!
//! The [`FaultStack`] is appended to whenever a fault enters VM control and can
//! grow while handlers run. The unwinder therefore never holds a reference into
//! it across handler execution; it works on a copy and writes that copy back
//! with [`FaultStack::replace_last`] when it resumes.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{bytecode::Offset, error::HostException, heap::ObjectId};

/// Which kind of exception a fault carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FaultKind {
    UserException,
    HostException,
}

/// The exception payload of a fault. Exactly one kind is ever present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultException {
    /// An object thrown by interpreted code. The fault record owns one reference.
    User(ObjectId),
    /// A native-level failure.
    Host(HostException),
}

/// One in-flight fault.
///
/// Cloning a fault does not take a heap reference: clones are working copies of
/// the record entry, and only the entry in the [`FaultStack`] owns the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub(crate) exception: FaultException,
    /// Handler-table entries already consulted in the current frame.
    pub(crate) handled_count: u32,
    /// Where to resume searching once the fault handler that was entered re-raises.
    pub(crate) saved_raise_offset: Option<Offset>,
}

impl Fault {
    /// Creates a user-exception fault. Does not touch the object's refcount.
    #[must_use]
    pub fn user(object: ObjectId) -> Self {
        Self::new(FaultException::User(object))
    }

    #[must_use]
    pub fn host(exception: HostException) -> Self {
        Self::new(FaultException::Host(exception))
    }

    fn new(exception: FaultException) -> Self {
        Self {
            exception,
            handled_count: 0,
            saved_raise_offset: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FaultKind {
        match self.exception {
            FaultException::User(_) => FaultKind::UserException,
            FaultException::Host(_) => FaultKind::HostException,
        }
    }

    #[must_use]
    pub fn exception(&self) -> &FaultException {
        &self.exception
    }

    #[must_use]
    pub fn user_exception(&self) -> Option<ObjectId> {
        match self.exception {
            FaultException::User(object) => Some(object),
            FaultException::Host(_) => None,
        }
    }

    #[must_use]
    pub fn host_exception(&self) -> Option<&HostException> {
        match &self.exception {
            FaultException::Host(exception) => Some(exception),
            FaultException::User(_) => None,
        }
    }

    #[must_use]
    pub fn handled_count(&self) -> u32 {
        self.handled_count
    }

    #[must_use]
    pub fn saved_raise_offset(&self) -> Option<Offset> {
        self.saved_raise_offset
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exception {
            FaultException::User(object) => write!(f, "[user exception] {object}")?,
            FaultException::Host(exception) => write!(f, "[host exception] {exception}")?,
        }
        write!(f, " handled={}", self.handled_count)?;
        if let Some(offset) = self.saved_raise_offset {
            write!(f, " raise_offset={offset}")?;
        }
        Ok(())
    }
}

/// The process-wide record of in-flight faults, innermost last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultStack {
    faults: Vec<Fault>,
}

impl FaultStack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            faults: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    #[must_use]
    pub fn last(&self) -> Option<&Fault> {
        self.faults.last()
    }

    /// Overwrites the innermost fault with an updated copy.
    ///
    /// An empty record can only mean a handler consumed the fault mid-unwind;
    /// the copy is pushed so its bookkeeping is not lost.
    pub fn replace_last(&mut self, fault: Fault) {
        match self.faults.last_mut() {
            Some(last) => *last = fault,
            None => self.faults.push(fault),
        }
    }

    pub fn pop(&mut self) -> Option<Fault> {
        self.faults.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fault> {
        self.faults.iter()
    }

    /// Serializes the record, bookkeeping included, to postcard bytes.
    ///
    /// # Errors
    /// Returns the postcard error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Restores a record previously produced by [`to_bytes`](Self::to_bytes).
    ///
    /// Object ids are restored verbatim; they are only meaningful against a heap
    /// restored from the same snapshot.
    ///
    /// # Errors
    /// Returns the postcard error if the bytes are not a valid record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
