//! Synchronization primitives usable before any allocator or scheduler is
//! available — suitable for placement in `static` items.

mod lazy;
mod rwlock;
mod spinlock;

pub use lazy::LazyLock;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
