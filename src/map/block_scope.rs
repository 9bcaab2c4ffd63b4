//! Scoped "current block" selector for externally supplied transforms.
//!
//! Legacy transforms receive only `(xc, yc)` and read the block they are
//! evaluating from process-global state. [`BlockScope`] is the only writer of
//! that state: scopes are serialized across threads and may not nest on one
//! thread.

use parking_lot::{Mutex, MutexGuard, const_mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, Ordering};

static SCOPE_LOCK: Mutex<()> = const_mutex(());
static CURRENT_BLOCK: AtomicI64 = AtomicI64::new(-1);

thread_local! {
    static IN_SCOPE: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard selecting the current block.
///
/// # Panics
/// Entering a scope while the same thread already holds one panics: the
/// transform would otherwise deadlock on the serialization lock.
pub struct BlockScope {
    _guard: MutexGuard<'static, ()>,
}

impl BlockScope {
    pub fn enter(block: u32) -> Self {
        IN_SCOPE.with(|flag| {
            if flag.get() {
                panic!("block scope entered re-entrantly for block {block}");
            }
            flag.set(true);
        });
        let guard = SCOPE_LOCK.lock();
        CURRENT_BLOCK.store(block as i64, Ordering::Release);
        Self { _guard: guard }
    }
}

impl Drop for BlockScope {
    fn drop(&mut self) {
        CURRENT_BLOCK.store(-1, Ordering::Release);
        IN_SCOPE.with(|flag| flag.set(false));
    }
}

/// Block selected by the active scope, if any.
pub fn current_block() -> Option<u32> {
    let b = CURRENT_BLOCK.load(Ordering::Acquire);
    (b >= 0).then_some(b as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn scope_sets_and_clears_block() {
        assert_eq!(current_block(), None);
        {
            let _scope = BlockScope::enter(4);
            assert_eq!(current_block(), Some(4));
        }
        assert_eq!(current_block(), None);
    }

    #[test]
    #[serial]
    fn nested_scope_panics() {
        let result = std::panic::catch_unwind(|| {
            let _outer = BlockScope::enter(1);
            let _inner = BlockScope::enter(2);
        });
        assert!(result.is_err());
        // The outer guard unwound cleanly and released the lock.
        let _again = BlockScope::enter(3);
        assert_eq!(current_block(), Some(3));
    }
}
