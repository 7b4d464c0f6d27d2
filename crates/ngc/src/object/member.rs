//! Managed object model
//!
//! [`GarbageCollected`] is implemented by every type that lives on the
//! heap. References between heap objects are held in [`Member`] (strong),
//! [`WeakMember`] (cleared when the target dies) and [`EphemeronPair`] (value
//! kept alive only while the key is alive).
//!
//! Slots are atomics so background markers can read them while the mutator
//! writes. Writes performed while marking is active must go through
//! [`Heap::assign`](crate::Heap::assign) to hit the write barrier.

use crate::marker::visitor::{TraceCallback, Visitor};
use crate::object::gc_info::FinalizationCallback;
use crate::object::header::HeapObjectHeader;
use crate::util::Address;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A type that can be allocated on the managed heap
///
/// # Examples
///
/// ```rust
/// use ngc::{GarbageCollected, Member, Visitor};
///
/// struct Node {
///     next: Member<Node>,
/// }
///
/// impl GarbageCollected for Node {
///     fn trace(&self, visitor: &mut dyn Visitor) {
///         visitor.trace(&self.next);
///     }
/// }
/// ```
pub trait GarbageCollected: Send + Sync + Sized + 'static {
    /// Custom space index, `None` for the regular size-class spaces
    const CUSTOM_SPACE: Option<usize> = None;

    /// Whether background markers may trace this type
    ///
    /// Types whose `trace` reads state that is only safe to touch from the
    /// mutator set this to `false`; background markers then hand the object
    /// back to the mutator.
    const TRACE_CONCURRENTLY: bool = true;

    /// Report every outgoing reference to `visitor`
    fn trace(&self, visitor: &mut dyn Visitor);
}

/// Trace callback stored in the GC info table for `T`
pub fn trace_trampoline<T: GarbageCollected>(visitor: &mut dyn Visitor, payload: Address) {
    if !T::TRACE_CONCURRENTLY {
        // SAFETY: payload comes from a traced header on a live page.
        let size = unsafe { HeapObjectHeader::from_payload(payload) }.allocated_size();
        if visitor.defer_trace_to_mutator_thread_if_concurrent(
            payload,
            trace_on_mutator::<T>,
            size,
        ) {
            return;
        }
    }
    trace_on_mutator::<T>(visitor, payload);
}

fn trace_on_mutator<T: GarbageCollected>(visitor: &mut dyn Visitor, payload: Address) {
    // SAFETY: only fully constructed objects are traced precisely.
    let object = unsafe { &*(payload as *const T) };
    object.trace(visitor);
}

unsafe fn drop_trampoline<T>(payload: Address) {
    std::ptr::drop_in_place(payload as *mut T);
}

/// Finalizer for `T`, present only when `T` has drop glue
pub fn finalizer_for<T: GarbageCollected>() -> Option<FinalizationCallback> {
    if std::mem::needs_drop::<T>() {
        Some(drop_trampoline::<T> as FinalizationCallback)
    } else {
        None
    }
}

#[inline]
fn to_address<T>(ptr: Option<NonNull<T>>) -> Address {
    ptr.map_or(0, |p| p.as_ptr() as Address)
}

#[inline]
fn from_address<T>(raw: Address) -> Option<NonNull<T>> {
    NonNull::new(raw as *mut T)
}

macro_rules! member_slot {
    ($name:ident) => {
        impl<T: GarbageCollected> $name<T> {
            pub const fn null() -> Self {
                Self {
                    raw: AtomicUsize::new(0),
                    _marker: PhantomData,
                }
            }

            pub fn new(ptr: Option<NonNull<T>>) -> Self {
                Self {
                    raw: AtomicUsize::new(to_address(ptr)),
                    _marker: PhantomData,
                }
            }

            #[inline]
            pub fn get(&self) -> Option<NonNull<T>> {
                from_address(self.raw())
            }

            /// Payload address, 0 when empty
            #[inline]
            pub fn raw(&self) -> Address {
                self.raw.load(Ordering::Relaxed)
            }

            #[inline]
            pub fn is_null(&self) -> bool {
                self.raw() == 0
            }

            /// Store without a write barrier
            ///
            /// Fine during construction of the holder or when marking is not
            /// running; otherwise use the heap's `assign`.
            #[inline]
            pub fn set(&self, ptr: Option<NonNull<T>>) {
                self.raw.store(to_address(ptr), Ordering::Relaxed);
            }

            #[inline]
            pub fn clear(&self) {
                self.raw.store(0, Ordering::Relaxed);
            }

            /// Borrow the target
            ///
            /// # Safety
            ///
            /// The target must still be alive, i.e. no collection may have
            /// reclaimed it since it was stored.
            #[inline]
            pub unsafe fn as_ref(&self) -> Option<&T> {
                self.get().map(|p| &*p.as_ptr())
            }
        }

        impl<T: GarbageCollected> Default for $name<T> {
            fn default() -> Self {
                Self::null()
            }
        }

        impl<T: GarbageCollected> std::fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({})"),
                    crate::util::debug::format_address(self.raw())
                )
            }
        }
    };
}

/// Strong reference from one heap object to another
pub struct Member<T> {
    raw: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

/// Weak reference, cleared at the end of marking if the target is dead
pub struct WeakMember<T> {
    raw: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

member_slot!(Member);
member_slot!(WeakMember);

/// Key/value pair where the value is reachable only through a live key
///
/// If the key dies both slots are cleared after marking.
pub struct EphemeronPair<K, V> {
    pub key: WeakMember<K>,
    pub value: Member<V>,
}

impl<K: GarbageCollected, V: GarbageCollected> EphemeronPair<K, V> {
    pub fn new(key: Option<NonNull<K>>, value: Option<NonNull<V>>) -> Self {
        Self {
            key: WeakMember::new(key),
            value: Member::new(value),
        }
    }

    pub fn clear(&self) {
        self.key.clear();
        self.value.clear();
    }
}

impl<K: GarbageCollected, V: GarbageCollected> Default for EphemeronPair<K, V> {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Trace callback for `T` as a plain function pointer
pub fn trace_callback_of<T: GarbageCollected>() -> TraceCallback {
    trace_trampoline::<T>
}
