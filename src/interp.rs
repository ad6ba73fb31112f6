//! Global interpreter-style lock.
//!
//! The caller's execution context may hold a coarse lock (the Python GIL when
//! the crate is used as an extension module). Every blocking wire call and every
//! wait on the per-connection mutex runs with that lock released, so a slow
//! backend never stalls unrelated work in the same process.

/// A coarse lock held by the calling context.
pub trait InterpreterLock: Send + Sync {
    /// Run `f` with the lock released, re-acquiring it before returning.
    fn unlocked(&self, f: &mut (dyn FnMut() + Send));
}

/// No global lock: `unlocked` just calls the closure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterpreterLock;

impl InterpreterLock for NoInterpreterLock {
    fn unlocked(&self, f: &mut (dyn FnMut() + Send)) {
        f()
    }
}

/// Run `f` with the global lock released and return its result.
pub fn allow_threads<T, F>(lock: &dyn InterpreterLock, f: F) -> T
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    let mut task = Some(f);
    let mut out = None;
    lock.unlocked(&mut || {
        if let Some(f) = task.take() {
            out = Some(f());
        }
    });
    match out {
        Some(value) => value,
        None => unreachable!("interpreter lock did not run the released section"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLock(AtomicUsize);

    impl InterpreterLock for CountingLock {
        fn unlocked(&self, f: &mut (dyn FnMut() + Send)) {
            self.0.fetch_add(1, Ordering::SeqCst);
            f()
        }
    }

    #[test]
    fn test_allow_threads_returns_value() {
        assert_eq!(allow_threads(&NoInterpreterLock, || 41 + 1), 42);
    }

    #[test]
    fn test_allow_threads_releases_once() {
        let lock = CountingLock(AtomicUsize::new(0));
        let s = allow_threads(&lock, || String::from("done"));
        assert_eq!(s, "done");
        assert_eq!(lock.0.load(Ordering::SeqCst), 1);
    }
}
