//! Reference-counted object arena standing in for the VM's object model.
//!
//! The unwinder only needs a handful of object-model services: take and drop
//! references, mark an object so its destructor is skipped, and test whether an
//! object is an instance of a class. [`Heap`] provides exactly those, with the
//! user-visible destructor behind the [`Finalizer`] trait.
//!
//! # Fatal mode
//!
//! When a destructor raises a fatal error the heap enters *fatal mode*: from
//! then on no finalizer runs, and each destruction that would have run one
//! reports a [`ReleaseError::Fatal`] instead. Callers that tear down frames
//! observe these errors and discard them.

use std::fmt;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    class::{ClassId, ClassTable},
    error::{Release, ReleaseError},
};

/// Unique identifier for an object stored in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Runs user-visible destruction logic when an object's last reference goes away.
///
/// The heap is generic over this trait the same way the VM is generic over its
/// tracer: [`NoopFinalizer`] compiles to nothing.
pub trait Finalizer: fmt::Debug {
    /// Called after `object` has been freed, unless it was marked no-destruct.
    fn finalize(&mut self, object: ObjectId, class: ClassId) -> Release;
}

/// A finalizer that never runs any destruction logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFinalizer;

impl Finalizer for NoopFinalizer {
    #[inline]
    fn finalize(&mut self, _object: ObjectId, _class: ClassId) -> Release {
        Ok(())
    }
}

/// Finalizer that records every destructor it runs.
///
/// Classes can be configured to throw (a user exception escaping the destructor)
/// or to raise a fatal error, which is how teardown's tolerance of secondary
/// failures gets exercised.
#[derive(Debug, Default)]
pub struct RecordingFinalizer {
    finalized: Vec<ObjectId>,
    throwing: AHashSet<ClassId>,
    fatal: AHashSet<ClassId>,
}

impl RecordingFinalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Destructors of `class` throw a user exception after running.
    #[must_use]
    pub fn throwing_for(mut self, class: ClassId) -> Self {
        self.throwing.insert(class);
        self
    }

    /// Destructors of `class` raise a fatal error after running.
    #[must_use]
    pub fn fatal_for(mut self, class: ClassId) -> Self {
        self.fatal.insert(class);
        self
    }

    /// Objects whose destructor ran, in order.
    #[must_use]
    pub fn finalized(&self) -> &[ObjectId] {
        &self.finalized
    }

    #[must_use]
    pub fn was_finalized(&self, object: ObjectId) -> bool {
        self.finalized.contains(&object)
    }
}

impl Finalizer for RecordingFinalizer {
    fn finalize(&mut self, object: ObjectId, class: ClassId) -> Release {
        self.finalized.push(object);
        if self.fatal.contains(&class) {
            Err(ReleaseError::Fatal {
                object,
                message: "destructor raised a fatal error".to_owned(),
            })
        } else if self.throwing.contains(&class) {
            Err(ReleaseError::Exception {
                object,
                message: "destructor threw".to_owned(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct HeapObject {
    refcount: usize,
    class: ClassId,
    /// Set for partially constructed objects; their destructor must not run.
    no_destruct: bool,
}

/// Reference-counted arena for user-visible objects.
///
/// Uses a free list to reuse slots from freed objects. When an object is freed via
/// `dec_ref`, its slot id is added to the free list and new allocations pop from it.
#[derive(Debug)]
pub struct Heap<F: Finalizer> {
    entries: Vec<Option<HeapObject>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`, consumed by `allocate`.
    free_list: Vec<ObjectId>,
    finalizer: F,
    /// "Throw fatal from now on": no more destructors run once this is set.
    fatal_mode: bool,
}

impl<F: Finalizer> Heap<F> {
    /// Creates a new heap with the given initial capacity and finalizer.
    #[must_use]
    pub fn new(capacity: usize, finalizer: F) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            finalizer,
            fatal_mode: false,
        }
    }

    /// Allocates a new object of `class` with a reference count of one.
    pub fn allocate(&mut self, class: ClassId) -> ObjectId {
        let object = HeapObject {
            refcount: 1,
            class,
            no_destruct: false,
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(object);
            id
        } else {
            let id = ObjectId(self.entries.len());
            self.entries.push(Some(object));
            id
        }
    }

    /// Increments the reference count for a live object.
    ///
    /// # Panics
    /// Panics if the id is invalid or the object has already been freed.
    pub fn inc_ref(&mut self, id: ObjectId) {
        let object = self
            .entries
            .get_mut(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_mut()
            .expect("Heap::inc_ref: object already freed");
        object.refcount += 1;
    }

    /// Decrements the reference count, freeing the object once it reaches zero.
    ///
    /// Freeing runs the finalizer unless the object is marked no-destruct. The
    /// object is freed even when its finalizer fails; the failure is returned.
    ///
    /// # Panics
    /// Panics if the id is invalid or the object has already been freed.
    pub fn dec_ref(&mut self, id: ObjectId) -> Release {
        let object = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let object = slot.as_mut().expect("Heap::dec_ref: object already freed");
            if object.refcount > 1 {
                object.refcount -= 1;
                return Ok(());
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };
        self.free_list.push(id);

        if object.no_destruct {
            return Ok(());
        }
        if self.fatal_mode {
            return Err(ReleaseError::Fatal {
                object: id,
                message: "destructor not run: runtime is in fatal mode".to_owned(),
            });
        }
        let result = self.finalizer.finalize(id, object.class);
        if let Err(error) = &result
            && error.is_fatal()
        {
            self.fatal_mode = true;
        }
        result
    }

    /// Marks an object so its destructor is skipped when it is freed.
    ///
    /// Does nothing if the object is no longer live.
    pub fn set_no_destruct(&mut self, id: ObjectId) {
        if let Some(Some(object)) = self.entries.get_mut(id.index()) {
            object.no_destruct = true;
        }
    }

    #[must_use]
    pub fn is_no_destruct(&self, id: ObjectId) -> bool {
        self.live(id).is_some_and(|object| object.no_destruct)
    }

    /// Returns true if the object is live and its class is `class` or a subclass.
    #[must_use]
    pub fn instance_of(&self, id: ObjectId, class: ClassId, classes: &ClassTable) -> bool {
        self.live(id)
            .is_some_and(|object| classes.is_subclass_of(object.class, class))
    }

    /// Returns the current refcount of a live object, or 0 once it has been freed.
    #[must_use]
    pub fn refcount(&self, id: ObjectId) -> usize {
        self.live(id).map_or(0, |object| object.refcount)
    }

    #[must_use]
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.live(id).is_some()
    }

    #[must_use]
    pub fn class_of(&self, id: ObjectId) -> Option<ClassId> {
        self.live(id).map(|object| object.class)
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    #[must_use]
    pub fn is_fatal_mode(&self) -> bool {
        self.fatal_mode
    }

    /// Switches the runtime into fatal mode.
    pub fn enter_fatal_mode(&mut self) {
        self.fatal_mode = true;
    }

    #[must_use]
    pub fn finalizer(&self) -> &F {
        &self.finalizer
    }

    pub fn finalizer_mut(&mut self) -> &mut F {
        &mut self.finalizer
    }

    fn live(&self, id: ObjectId) -> Option<&HeapObject> {
        self.entries.get(id.index())?.as_ref()
    }
}

/// Types that hold references which must be given back to the heap explicitly.
///
/// Rust's `Drop` has no access to the heap, so owners of references call
/// [`release_with_heap`](Self::release_with_heap) instead. The returned
/// [`Release`] reports a failing destructor; it is up to the caller whether that
/// matters.
pub trait ReleaseWithHeap {
    /// Consumes `self`, dropping any references it owns.
    fn release_with_heap<F: Finalizer>(self, heap: &mut Heap<F>) -> Release;
}

impl ReleaseWithHeap for ObjectId {
    #[inline]
    fn release_with_heap<F: Finalizer>(self, heap: &mut Heap<F>) -> Release {
        heap.dec_ref(self)
    }
}

impl<T: ReleaseWithHeap> ReleaseWithHeap for Option<T> {
    #[inline]
    fn release_with_heap<F: Finalizer>(self, heap: &mut Heap<F>) -> Release {
        match self {
            Some(value) => value.release_with_heap(heap),
            None => Ok(()),
        }
    }
}
