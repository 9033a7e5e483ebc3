//! Typed values held in evaluation-stack slots and locals.

use crate::{
    error::Release,
    heap::{Finalizer, Heap, ObjectId, ReleaseWithHeap},
};

/// A value on the evaluation stack.
///
/// Only [`Value::Ref`] owns a heap reference. Copying a `Ref` must go through
/// [`clone_with_heap`](Self::clone_with_heap) and discarding one through
/// [`release_with_heap`](ReleaseWithHeap::release_with_heap), otherwise the
/// object's refcount drifts.
#[derive(Debug, PartialEq, Eq)]
pub enum Value {
    /// An unset local, or a slot that has been neutralized during teardown.
    Uninit,
    Null,
    Bool(bool),
    Int(i64),
    Ref(ObjectId),
}

impl Value {
    /// Copies the value, taking a new reference for `Ref`.
    #[must_use]
    pub fn clone_with_heap<F: Finalizer>(&self, heap: &mut Heap<F>) -> Self {
        match self {
            Self::Uninit => Self::Uninit,
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
        }
    }

    #[must_use]
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_uninit(&self) -> bool {
        matches!(self, Self::Uninit)
    }
}

impl ReleaseWithHeap for Value {
    #[inline]
    fn release_with_heap<F: Finalizer>(self, heap: &mut Heap<F>) -> Release {
        match self {
            Self::Ref(id) => heap.dec_ref(id),
            _ => Ok(()),
        }
    }
}
