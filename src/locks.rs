//! Process-wide named step locks.
//!
//! Every periodic step takes a named lock before doing work. Contended
//! callers return `None` immediately and the step becomes a no-op for that
//! tick; callers never queue. Cross-process safety comes from the row-level
//! `SELECT … FOR UPDATE` paths, not from these locks.

use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::Mutex;

lazy_static! {
    static ref HELD: Mutex<HashSet<&'static str>> = Mutex::new(HashSet::new());
}

/// Guard for a named step lock; releases on drop.
pub struct StepGuard {
    name: &'static str,
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        let mut held = HELD.lock().expect("step lock registry poisoned");
        held.remove(self.name);
    }
}

/// Try to take the named lock. Returns `None` when another invocation of
/// the same step is still running.
pub fn try_acquire(name: &'static str) -> Option<StepGuard> {
    let mut held = HELD.lock().expect("step lock registry poisoned");
    if held.insert(name) {
        Some(StepGuard { name })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let guard = try_acquire("TestStep").unwrap();
        assert!(try_acquire("TestStep").is_none());
        drop(guard);
        assert!(try_acquire("TestStep").is_some());
    }

    #[test]
    fn test_distinct_names_do_not_contend() {
        let _a = try_acquire("TestStepA").unwrap();
        let _b = try_acquire("TestStepB").unwrap();
    }
}
