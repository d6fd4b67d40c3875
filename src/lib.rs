//! A buddy-system allocator over an abstract capacity.
//!
//! [`BuddyAllocator`] hands out power-of-two blocks of a numeric capacity to
//! named owners, splitting larger blocks on allocation and coalescing buddies
//! on release. It manages offsets into an abstract address space rather than
//! real memory, which makes it suitable for simulations and for teaching the
//! buddy algorithm.
//!
//! ```
//! use buddy_sim::{BlockStatus, BuddyAllocator};
//!
//! let mut buddy = BuddyAllocator::try_new(1024).unwrap();
//!
//! assert!(buddy.allocate("web", 200).unwrap());
//!
//! let blocks = buddy.snapshot();
//! assert_eq!(blocks[0].size, 256);
//! assert_eq!(blocks[0].status, BlockStatus::Allocated { owner: &"web" });
//!
//! assert!(buddy.release(&"web"));
//! assert_eq!(buddy.snapshot().len(), 1);
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_sim/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]

extern crate alloc;

// Without the `log` feature the logging macros expand to nothing.
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

pub mod buddy;


use core::{cell::RefCell, fmt};

pub use crate::buddy::{BlockStatus, BlockView, BuddyAllocator, Grant};

/// The error type for allocator constructors.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocInitError {
    /// The requested capacity cannot back an allocator.
    ///
    /// This variant is returned when the capacity is zero.
    InvalidCapacity,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::InvalidCapacity => f.write_str("capacity must be a positive integer"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {}

/// The error type for rejected allocation requests.
///
/// Running out of capacity is not an error; see [`BuddyAllocator::allocate`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The requested size was zero.
    InvalidRequest,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidRequest => f.write_str("requested size must be a positive integer"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/// Declares lock-wrapped handles around a `BuddyAllocator`.
///
/// Each wrapper holds its lock for the whole of a mutating operation, so a
/// split chain or a coalescing cascade is never observed half-done.
macro_rules! declare_wrappers {
    ($($(#[$attr:meta])* $wrapper:ident uses $typename:ident via $method:path)*) => {
        $(
            #[doc = concat!("A `BuddyAllocator` wrapped by a `", stringify!($typename), "`.")]
            $(#[$attr])*
            #[derive(Debug)]
            pub struct $wrapper<O> {
                inner: $typename<BuddyAllocator<O>>,
            }

            $(#[$attr])*
            impl<O: Ord + Clone> $wrapper<O> {
                /// Constructs a new wrapped allocator managing `capacity` units.
                ///
                /// # Errors
                ///
                /// Returns [`AllocInitError::InvalidCapacity`] if `capacity` is zero.
                pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
                    Ok($wrapper {
                        inner: $typename::new(BuddyAllocator::try_new(capacity)?),
                    })
                }

                /// Locks the allocator and calls [`BuddyAllocator::allocate`].
                pub fn allocate(&self, owner: O, size: usize) -> Result<bool, AllocError> {
                    $method(&self.inner).allocate(owner, size)
                }

                /// Locks the allocator and calls [`BuddyAllocator::grant`].
                pub fn grant(&self, owner: O, size: usize) -> Result<Option<Grant>, AllocError> {
                    $method(&self.inner).grant(owner, size)
                }

                /// Locks the allocator and calls [`BuddyAllocator::release`].
                pub fn release(&self, owner: &O) -> bool {
                    $method(&self.inner).release(owner)
                }

                /// Locks the allocator and passes its snapshot to `f`.
                pub fn with_snapshot<R>(&self, f: impl FnOnce(&[BlockView<'_, O>]) -> R) -> R {
                    let guard = $method(&self.inner);
                    let blocks = guard.snapshot();
                    f(&blocks)
                }

                /// Consumes the wrapper, returning the allocator.
                pub fn into_inner(self) -> BuddyAllocator<O> {
                    IntoInner::into_inner(self.inner)
                }
            }
        )*
    };
}

trait IntoInner<T> {
    fn into_inner(self) -> T;
}

impl<T> IntoInner<T> for RefCell<T> {
    fn into_inner(self) -> T {
        RefCell::into_inner(self)
    }
}

declare_wrappers! {
    RefCellBuddyAllocator uses RefCell via RefCell::borrow_mut
}

#[cfg(feature = "std")]
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

// Poisoning is ignored: no allocator operation mutates state before its last
// fallible step.
#[cfg(feature = "std")]
fn lock_mutex<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "std")]
fn write_rwlock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "std")]
impl<T> IntoInner<T> for Mutex<T> {
    fn into_inner(self) -> T {
        Mutex::into_inner(self).unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(feature = "std")]
impl<T> IntoInner<T> for RwLock<T> {
    fn into_inner(self) -> T {
        RwLock::into_inner(self).unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(feature = "std")]
declare_wrappers! {
    #[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
    MutexBuddyAllocator uses Mutex via lock_mutex

    #[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
    RwLockBuddyAllocator uses RwLock via write_rwlock
}
